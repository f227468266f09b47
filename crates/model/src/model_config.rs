//! Configuration of reauthored models
//!
//! A `ModelConfig` fully describes a `DecoderOnlyModel`: every layer carries
//! its own `TransformerBlockConfig`, so families with per-layer shapes
//! (OpenELM) need no special casing in the model itself.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::ops::Activation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationType {
    RmsNorm,
    LayerNorm,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationConfig {
    pub kind: NormalizationType,
    pub epsilon: f32,
    /// Weights are stored as `w - 1` and applied as `1 + w` (Gemma)
    #[serde(default)]
    pub zero_centered: bool,
    /// LayerNorm bias
    #[serde(default)]
    pub use_bias: bool,
}

impl NormalizationConfig {
    pub fn rms_norm(epsilon: f32) -> Self {
        Self {
            kind: NormalizationType::RmsNorm,
            epsilon,
            zero_centered: false,
            use_bias: false,
        }
    }

    pub fn layer_norm(epsilon: f32) -> Self {
        Self {
            kind: NormalizationType::LayerNorm,
            epsilon,
            zero_centered: false,
            use_bias: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub num_heads: usize,
    pub head_dim: usize,
    /// Number of key-value heads; `num_heads / num_query_groups` queries share one
    pub num_query_groups: usize,
    /// Fraction of each head that is rotated
    pub rotary_percentage: f64,
    pub rotary_base: f64,
    #[serde(default)]
    pub qkv_use_bias: bool,
    #[serde(default)]
    pub output_proj_use_bias: bool,
    /// Per-head norm applied to queries before RoPE
    #[serde(default)]
    pub query_norm: Option<NormalizationConfig>,
    /// Per-head norm applied to keys before RoPE
    #[serde(default)]
    pub key_norm: Option<NormalizationConfig>,
}

impl AttentionConfig {
    pub fn heads_per_group(&self) -> usize {
        self.num_heads / self.num_query_groups
    }

    /// Output rows of the fused qkv projection
    pub fn qkv_dim(&self) -> usize {
        (self.num_heads + 2 * self.num_query_groups) * self.head_dim
    }

    pub fn rotary_dim(&self) -> usize {
        crate::rope::rotary_dim(self.head_dim, self.rotary_percentage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedForwardType {
    /// w2(act(w1(x)))
    Sequential,
    /// w2(act(w1(x)) * w3(x))
    Gated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardConfig {
    pub kind: FeedForwardType,
    pub activation: Activation,
    pub intermediate_size: usize,
    #[serde(default)]
    pub use_bias: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerBlockConfig {
    pub attn: AttentionConfig,
    pub ff: FeedForwardConfig,
    pub pre_attention_norm: NormalizationConfig,
    /// Norm before the feed-forward; unused with a parallel residual
    pub post_attention_norm: Option<NormalizationConfig>,
    /// x + attn(norm(x)) + ff(norm(x)) instead of two sequential residuals (Phi-2)
    #[serde(default)]
    pub parallel_residual: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    /// Capacity of the kv cache, i.e. the longest sequence one forward may address
    pub kv_cache_max_len: usize,
    /// Multiplier applied to token embeddings (Gemma: sqrt(embedding_dim))
    #[serde(default)]
    pub embedding_scale: Option<f32>,
    pub block_configs: Vec<TransformerBlockConfig>,
    pub final_norm: NormalizationConfig,
    #[serde(default)]
    pub lm_head_use_bias: bool,
    #[serde(default)]
    pub lm_head_share_weight_with_embedding: bool,
}

impl ModelConfig {
    pub fn num_layers(&self) -> usize {
        self.block_configs.len()
    }

    pub fn block_config(&self, idx: usize) -> &TransformerBlockConfig {
        &self.block_configs[idx]
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.block_configs.is_empty() {
            return Err(ModelError::Config("model has no transformer blocks".into()));
        }
        if self.kv_cache_max_len == 0 {
            return Err(ModelError::Config("kv_cache_max_len must be > 0".into()));
        }
        for (idx, block) in self.block_configs.iter().enumerate() {
            let attn = &block.attn;
            if attn.num_query_groups == 0 || attn.num_heads % attn.num_query_groups != 0 {
                return Err(ModelError::Config(format!(
                    "block {idx}: num_heads ({}) must be divisible by num_query_groups ({})",
                    attn.num_heads, attn.num_query_groups
                )));
            }
            if attn.rotary_dim() > attn.head_dim {
                return Err(ModelError::Config(format!(
                    "block {idx}: rotary_percentage {} exceeds head_dim",
                    attn.rotary_percentage
                )));
            }
            if !block.parallel_residual && block.post_attention_norm.is_none() {
                return Err(ModelError::Config(format!(
                    "block {idx}: sequential residual requires post_attention_norm"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> TransformerBlockConfig {
        TransformerBlockConfig {
            attn: AttentionConfig {
                num_heads: 4,
                head_dim: 8,
                num_query_groups: 2,
                rotary_percentage: 1.0,
                rotary_base: 10000.0,
                qkv_use_bias: false,
                output_proj_use_bias: false,
                query_norm: None,
                key_norm: None,
            },
            ff: FeedForwardConfig {
                kind: FeedForwardType::Gated,
                activation: Activation::Silu,
                intermediate_size: 64,
                use_bias: false,
            },
            pre_attention_norm: NormalizationConfig::rms_norm(1e-5),
            post_attention_norm: Some(NormalizationConfig::rms_norm(1e-5)),
            parallel_residual: false,
        }
    }

    #[test]
    fn test_attention_dims() {
        let b = block();
        assert_eq!(b.attn.heads_per_group(), 2);
        assert_eq!(b.attn.qkv_dim(), (4 + 2 * 2) * 8);
        assert_eq!(b.attn.rotary_dim(), 8);
    }

    #[test]
    fn test_validate_rejects_bad_groups() {
        let mut config = ModelConfig {
            vocab_size: 16,
            embedding_dim: 32,
            kv_cache_max_len: 8,
            embedding_scale: None,
            block_configs: vec![block()],
            final_norm: NormalizationConfig::rms_norm(1e-5),
            lm_head_use_bias: false,
            lm_head_share_weight_with_embedding: true,
        };
        config.validate().unwrap();

        config.block_configs[0].attn.num_query_groups = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_round_trip_keeps_blocks() {
        let config = ModelConfig {
            vocab_size: 16,
            embedding_dim: 32,
            kv_cache_max_len: 8,
            embedding_scale: Some(32f32.sqrt()),
            block_configs: vec![block(), block()],
            final_norm: NormalizationConfig::layer_norm(1e-5),
            lm_head_use_bias: true,
            lm_head_share_weight_with_embedding: false,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
