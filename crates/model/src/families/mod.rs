//! Per-family model builders
//!
//! Every family module exposes the same surface:
//! - `TENSOR_NAMES`: where its HuggingFace checkpoint keeps each parameter
//! - `get_model_config(&HfConfig, kv_cache_max_len)`
//! - `build_model(checkpoint_dir, kv_cache_max_len)`
//! - `get_fake_model_config(kv_cache_max_len)`: a tiny config for tests

pub mod gemma;
pub mod openelm;
pub mod phi2;
pub mod smollm;
pub mod tiny_llama;

use std::path::Path;

use crate::config::{Architecture, HfConfig};
use crate::error::{ModelError, Result};
use crate::loader::SafetensorsLoader;
use crate::model_config::{
    AttentionConfig, FeedForwardConfig, FeedForwardType, ModelConfig, NormalizationConfig,
    TransformerBlockConfig,
};
use crate::ops::Activation;
use crate::tensor_names::{load_state_dict, AttentionNames, FeedForwardNames, TensorNames};
use crate::transformer::DecoderOnlyModel;

/// HuggingFace names shared by Llama-layout checkpoints (TinyLlama, SmolLM, Gemma)
pub const LLAMA_TENSOR_NAMES: TensorNames = TensorNames {
    embedding: "model.embed_tokens",
    attn_norm: "model.layers.{}.input_layernorm",
    attn: AttentionNames::Separate {
        q: "model.layers.{}.self_attn.q_proj",
        k: "model.layers.{}.self_attn.k_proj",
        v: "model.layers.{}.self_attn.v_proj",
    },
    attn_output: "model.layers.{}.self_attn.o_proj",
    query_norm: None,
    key_norm: None,
    ff_norm: Some("model.layers.{}.post_attention_layernorm"),
    ff: FeedForwardNames::Gated {
        gate: "model.layers.{}.mlp.gate_proj",
        up: "model.layers.{}.mlp.up_proj",
    },
    ff_down: "model.layers.{}.mlp.down_proj",
    final_norm: "model.norm",
    lm_head: Some("lm_head"),
};

/// Load a checkpoint directory into a reauthored model
pub(crate) fn build_from_checkpoint(
    checkpoint: &Path,
    kv_cache_max_len: usize,
    names: &TensorNames,
    get_model_config: fn(&HfConfig, usize) -> Result<ModelConfig>,
) -> Result<DecoderOnlyModel> {
    let hf_config = HfConfig::from_directory(checkpoint)?;
    hf_config.validate()?;
    let config = get_model_config(&hf_config, kv_cache_max_len)?;
    let loader = SafetensorsLoader::from_directory(checkpoint)?;

    tracing::info!(
        checkpoint = %checkpoint.display(),
        model_type = %hf_config.model_type,
        layers = config.num_layers(),
        kv_cache_max_len,
        "Building reauthored model"
    );

    let state_dict = load_state_dict(&loader, names, &config)?;
    DecoderOnlyModel::from_state_dict(config, state_dict)
}

/// Build with the family matching the checkpoint's `model_type`
pub fn build_model(checkpoint: &Path, kv_cache_max_len: usize) -> Result<DecoderOnlyModel> {
    let hf_config = HfConfig::from_directory(checkpoint)?;
    match hf_config.architecture()? {
        Architecture::Llama => tiny_llama::build_model(checkpoint, kv_cache_max_len),
        Architecture::Gemma => gemma::build_model(checkpoint, kv_cache_max_len),
        Architecture::Phi => phi2::build_model(checkpoint, kv_cache_max_len),
        Architecture::OpenElm => openelm::build_model(checkpoint, kv_cache_max_len),
    }
}

/// Config of a Llama-layout model: RMSNorm, gated feed-forward, full rotary
pub(crate) fn llama_model_config(hf: &HfConfig, kv_cache_max_len: usize) -> Result<ModelConfig> {
    let dim = hf.hidden_size()?;
    let head_dim = hf.head_dim()?;
    let intermediate_size = hf
        .intermediate_size
        .ok_or_else(|| ModelError::Config("missing intermediate_size".into()))?;
    let activation = Activation::from_hf_name(hf.activation().unwrap_or("silu"))?;
    let norm = NormalizationConfig::rms_norm(hf.rms_norm_eps.unwrap_or(1e-6) as f32);
    let attention_bias = hf.attention_bias.unwrap_or(false);

    let block_configs = (0..hf.num_layers()?)
        .map(|layer| {
            Ok(TransformerBlockConfig {
                attn: AttentionConfig {
                    num_heads: hf.num_heads(layer)?,
                    head_dim,
                    num_query_groups: hf.num_kv_heads(layer)?,
                    rotary_percentage: 1.0,
                    rotary_base: hf.rope_theta(),
                    qkv_use_bias: attention_bias,
                    output_proj_use_bias: attention_bias,
                    query_norm: None,
                    key_norm: None,
                },
                ff: FeedForwardConfig {
                    kind: FeedForwardType::Gated,
                    activation,
                    intermediate_size,
                    use_bias: false,
                },
                pre_attention_norm: norm,
                post_attention_norm: Some(norm),
                parallel_residual: false,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ModelConfig {
        vocab_size: hf.vocab_size,
        embedding_dim: dim,
        kv_cache_max_len,
        embedding_scale: None,
        block_configs,
        final_norm: norm,
        lm_head_use_bias: false,
        lm_head_share_weight_with_embedding: hf.tie_word_embeddings(false),
    })
}

/// Tiny Llama-layout config used by the family fake configs
pub(crate) fn fake_llama_config(
    kv_cache_max_len: usize,
    num_heads: usize,
    num_query_groups: usize,
    head_dim: usize,
    activation: Activation,
    tied: bool,
) -> ModelConfig {
    let norm = NormalizationConfig::rms_norm(1e-5);
    let block = TransformerBlockConfig {
        attn: AttentionConfig {
            num_heads,
            head_dim,
            num_query_groups,
            rotary_percentage: 1.0,
            rotary_base: 10000.0,
            qkv_use_bias: false,
            output_proj_use_bias: false,
            query_norm: None,
            key_norm: None,
        },
        ff: FeedForwardConfig {
            kind: FeedForwardType::Gated,
            activation,
            intermediate_size: 64,
            use_bias: false,
        },
        pre_attention_norm: norm,
        post_attention_norm: Some(norm),
        parallel_residual: false,
    };
    ModelConfig {
        vocab_size: 64,
        embedding_dim: 32,
        kv_cache_max_len,
        embedding_scale: None,
        block_configs: vec![block; 2],
        final_norm: norm,
        lm_head_use_bias: false,
        lm_head_share_weight_with_embedding: tied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_configs_validate() {
        for config in [
            tiny_llama::get_fake_model_config(8),
            smollm::get_fake_model_config(8),
            gemma::get_fake_model_config(8),
            phi2::get_fake_model_config(8),
            openelm::get_fake_model_config(8),
        ] {
            config.validate().unwrap();
            assert_eq!(config.kv_cache_max_len, 8);
        }
    }
}
