//! HuggingFace checkpoint configuration (`config.json`, `generation_config.json`)

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ModelError, Result};

/// Name of the model configuration file inside a checkpoint directory
pub const CONFIG_NAME: &str = "config.json";

/// Name of the optional generation configuration file
pub const GENERATION_CONFIG_NAME: &str = "generation_config.json";

/// Total sequence length used by the original `generate` when nothing is configured
pub const DEFAULT_MAX_LENGTH: usize = 20;

/// Model families understood by the loaders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// TinyLlama, SmolLM and other Llama-layout checkpoints
    Llama,
    Gemma,
    /// Phi-2
    Phi,
    OpenElm,
}

impl Architecture {
    /// Map a `model_type` string from `config.json`
    pub fn from_model_type(model_type: &str) -> Result<Self> {
        match model_type {
            "llama" => Ok(Self::Llama),
            "gemma" => Ok(Self::Gemma),
            "phi" => Ok(Self::Phi),
            "openelm" => Ok(Self::OpenElm),
            other => Err(ModelError::UnsupportedModelType(other.to_string())),
        }
    }

    pub fn model_type(&self) -> &'static str {
        match self {
            Self::Llama => "llama",
            Self::Gemma => "gemma",
            Self::Phi => "phi",
            Self::OpenElm => "openelm",
        }
    }
}

/// A token id field that may be written as a single id or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            Self::Single(id) => vec![*id],
            Self::Many(ids) => ids.clone(),
        }
    }
}

/// Model configuration as written by HuggingFace (`config.json`)
///
/// One struct covers every supported family; fields a family does not use
/// stay `None`. OpenELM spells several fields differently, hence the aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HfConfig {
    pub model_type: String,

    pub vocab_size: usize,

    #[serde(default, alias = "model_dim")]
    pub hidden_size: Option<usize>,

    #[serde(default)]
    pub intermediate_size: Option<usize>,

    #[serde(default, alias = "num_transformer_layers")]
    pub num_hidden_layers: Option<usize>,

    #[serde(default)]
    pub num_attention_heads: Option<usize>,

    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    #[serde(default)]
    pub head_dim: Option<usize>,

    #[serde(default, alias = "rope_max_length")]
    pub max_position_embeddings: Option<usize>,

    #[serde(default)]
    pub rms_norm_eps: Option<f64>,

    #[serde(default)]
    pub layer_norm_eps: Option<f64>,

    #[serde(default, alias = "rope_freq_constant")]
    pub rope_theta: Option<f64>,

    /// Fraction of each head that is rotated (Phi-2 uses 0.4)
    #[serde(default)]
    pub partial_rotary_factor: Option<f64>,

    #[serde(default, alias = "share_input_output_layers")]
    pub tie_word_embeddings: Option<bool>,

    #[serde(default)]
    pub attention_bias: Option<bool>,

    #[serde(default, alias = "activation_fn_name")]
    pub hidden_act: Option<String>,

    /// Gemma writes the activation here as well
    #[serde(default)]
    pub hidden_activation: Option<String>,

    #[serde(default)]
    pub bos_token_id: Option<TokenIds>,

    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,

    #[serde(default)]
    pub max_length: Option<usize>,

    /// OpenELM: per-layer query head counts
    #[serde(default)]
    pub num_query_heads: Option<Vec<usize>>,

    /// OpenELM: per-layer key-value head counts
    #[serde(default)]
    pub num_kv_heads: Option<Vec<usize>>,

    /// OpenELM: per-layer feed-forward multipliers
    #[serde(default)]
    pub ffn_multipliers: Option<Vec<f64>>,

    #[serde(default)]
    pub ffn_dim_divisor: Option<usize>,

    #[serde(default)]
    pub normalize_qk_projections: Option<bool>,

    #[serde(default)]
    pub ffn_with_glu: Option<bool>,
}

impl HfConfig {
    /// Load config from a JSON file (config.json from HuggingFace)
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load `config.json` from a checkpoint directory
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::from_json_file(dir.as_ref().join(CONFIG_NAME))
    }

    pub fn architecture(&self) -> Result<Architecture> {
        Architecture::from_model_type(&self.model_type)
    }

    pub fn hidden_size(&self) -> Result<usize> {
        self.hidden_size
            .ok_or_else(|| ModelError::Config("missing hidden_size".into()))
    }

    pub fn num_layers(&self) -> Result<usize> {
        self.num_hidden_layers
            .ok_or_else(|| ModelError::Config("missing num_hidden_layers".into()))
    }

    /// Query heads of `layer` (OpenELM varies them per layer)
    pub fn num_heads(&self, layer: usize) -> Result<usize> {
        if let Some(per_layer) = &self.num_query_heads {
            return per_layer.get(layer).copied().ok_or_else(|| {
                ModelError::Config(format!("num_query_heads has no entry for layer {layer}"))
            });
        }
        self.num_attention_heads
            .ok_or_else(|| ModelError::Config("missing num_attention_heads".into()))
    }

    /// Key-value heads of `layer`, defaulting to the query heads (no GQA)
    pub fn num_kv_heads(&self, layer: usize) -> Result<usize> {
        if let Some(per_layer) = &self.num_kv_heads {
            return per_layer.get(layer).copied().ok_or_else(|| {
                ModelError::Config(format!("num_kv_heads has no entry for layer {layer}"))
            });
        }
        match self.num_key_value_heads {
            Some(n) => Ok(n),
            None => self.num_heads(layer),
        }
    }

    /// Head dimension
    pub fn head_dim(&self) -> Result<usize> {
        if let Some(head_dim) = self.head_dim {
            return Ok(head_dim);
        }
        let hidden = self.hidden_size()?;
        let heads = self.num_heads(0)?;
        if heads == 0 || hidden % heads != 0 {
            return Err(ModelError::Config(format!(
                "hidden_size ({hidden}) must be divisible by num_attention_heads ({heads})"
            )));
        }
        Ok(hidden / heads)
    }

    pub fn rope_theta(&self) -> f64 {
        self.rope_theta.unwrap_or(10000.0)
    }

    pub fn partial_rotary_factor(&self) -> f64 {
        self.partial_rotary_factor.unwrap_or(1.0)
    }

    /// Activation name, preferring Gemma's `hidden_activation`
    pub fn activation(&self) -> Option<&str> {
        self.hidden_activation
            .as_deref()
            .or(self.hidden_act.as_deref())
    }

    pub fn tie_word_embeddings(&self, default: bool) -> bool {
        self.tie_word_embeddings.unwrap_or(default)
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::to_vec)
            .unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let arch = self.architecture()?;
        let layers = self.num_layers()?;
        if layers == 0 {
            return Err(ModelError::Config("num_hidden_layers must be > 0".into()));
        }
        let head_dim = self.head_dim()?;
        if head_dim % 2 != 0 {
            return Err(ModelError::Config(format!(
                "head_dim ({head_dim}) must be even for rotary embeddings"
            )));
        }
        for layer in 0..layers {
            let heads = self.num_heads(layer)?;
            let kv_heads = self.num_kv_heads(layer)?;
            if kv_heads == 0 || heads % kv_heads != 0 {
                return Err(ModelError::Config(format!(
                    "layer {layer}: num_attention_heads ({heads}) must be divisible by \
                     num_key_value_heads ({kv_heads})"
                )));
            }
        }
        if arch == Architecture::OpenElm {
            let multipliers = self.ffn_multipliers.as_ref().ok_or_else(|| {
                ModelError::Config("openelm config is missing ffn_multipliers".into())
            })?;
            if multipliers.len() != layers {
                return Err(ModelError::Config(format!(
                    "ffn_multipliers has {} entries for {layers} layers",
                    multipliers.len()
                )));
            }
        }
        Ok(())
    }
}

/// Parameters of the original model's built-in greedy generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum total length (prompt included)
    #[serde(default)]
    pub max_length: Option<usize>,

    /// When set, overrides `max_length` relative to the prompt
    #[serde(default)]
    pub max_new_tokens: Option<usize>,

    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: Some(DEFAULT_MAX_LENGTH),
            max_new_tokens: None,
            eos_token_id: None,
        }
    }
}

impl GenerationConfig {
    /// Load `generation_config.json`, falling back to values from `config.json`
    pub fn from_directory<P: AsRef<Path>>(dir: P, model_config: &HfConfig) -> Result<Self> {
        let path = dir.as_ref().join(GENERATION_CONFIG_NAME);
        let mut config = if path.is_file() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str::<Self>(&content)?
        } else {
            tracing::debug!("No {} found, using model config", GENERATION_CONFIG_NAME);
            Self {
                max_length: None,
                max_new_tokens: None,
                eos_token_id: None,
            }
        };
        if config.max_length.is_none() {
            config.max_length = Some(model_config.max_length.unwrap_or(DEFAULT_MAX_LENGTH));
        }
        if config.eos_token_id.is_none() {
            config.eos_token_id = model_config.eos_token_id.clone();
        }
        Ok(config)
    }

    /// Total length the generation stops at for a prompt of `prompt_len` tokens
    pub fn target_length(&self, prompt_len: usize) -> usize {
        match self.max_new_tokens {
            Some(new_tokens) => prompt_len + new_tokens,
            None => self.max_length.unwrap_or(DEFAULT_MAX_LENGTH),
        }
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::to_vec)
            .unwrap_or_default()
    }
}
