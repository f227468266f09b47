//! Phi-2 (`microsoft/phi-2`)
//!
//! LayerNorm with bias, biased projections, partial rotary embeddings and a
//! parallel attention + MLP residual.

use std::path::Path;

use crate::config::HfConfig;
use crate::error::{ModelError, Result};
use crate::model_config::{
    AttentionConfig, FeedForwardConfig, FeedForwardType, ModelConfig, NormalizationConfig,
    TransformerBlockConfig,
};
use crate::ops::Activation;
use crate::tensor_names::{AttentionNames, FeedForwardNames, TensorNames};
use crate::transformer::DecoderOnlyModel;

pub const TENSOR_NAMES: TensorNames = TensorNames {
    embedding: "model.embed_tokens",
    attn_norm: "model.layers.{}.input_layernorm",
    attn: AttentionNames::Separate {
        q: "model.layers.{}.self_attn.q_proj",
        k: "model.layers.{}.self_attn.k_proj",
        v: "model.layers.{}.self_attn.v_proj",
    },
    attn_output: "model.layers.{}.self_attn.dense",
    query_norm: None,
    key_norm: None,
    ff_norm: None,
    ff: FeedForwardNames::Sequential {
        up: "model.layers.{}.mlp.fc1",
    },
    ff_down: "model.layers.{}.mlp.fc2",
    final_norm: "model.final_layernorm",
    lm_head: Some("lm_head"),
};

fn block(
    num_heads: usize,
    num_query_groups: usize,
    head_dim: usize,
    rotary_percentage: f64,
    rotary_base: f64,
    activation: Activation,
    intermediate_size: usize,
    norm: NormalizationConfig,
) -> TransformerBlockConfig {
    TransformerBlockConfig {
        attn: AttentionConfig {
            num_heads,
            head_dim,
            num_query_groups,
            rotary_percentage,
            rotary_base,
            qkv_use_bias: true,
            output_proj_use_bias: true,
            query_norm: None,
            key_norm: None,
        },
        ff: FeedForwardConfig {
            kind: FeedForwardType::Sequential,
            activation,
            intermediate_size,
            use_bias: true,
        },
        pre_attention_norm: norm,
        post_attention_norm: None,
        parallel_residual: true,
    }
}

pub fn get_model_config(hf_config: &HfConfig, kv_cache_max_len: usize) -> Result<ModelConfig> {
    let norm = NormalizationConfig::layer_norm(hf_config.layer_norm_eps.unwrap_or(1e-5) as f32);
    let activation = Activation::from_hf_name(hf_config.activation().unwrap_or("gelu_new"))?;
    let intermediate_size = hf_config
        .intermediate_size
        .ok_or_else(|| ModelError::Config("missing intermediate_size".into()))?;
    let head_dim = hf_config.head_dim()?;

    let block_configs = (0..hf_config.num_layers()?)
        .map(|layer| {
            Ok(block(
                hf_config.num_heads(layer)?,
                hf_config.num_kv_heads(layer)?,
                head_dim,
                hf_config.partial_rotary_factor(),
                hf_config.rope_theta(),
                activation,
                intermediate_size,
                norm,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ModelConfig {
        vocab_size: hf_config.vocab_size,
        embedding_dim: hf_config.hidden_size()?,
        kv_cache_max_len,
        embedding_scale: None,
        block_configs,
        final_norm: norm,
        lm_head_use_bias: true,
        lm_head_share_weight_with_embedding: hf_config.tie_word_embeddings(false),
    })
}

pub fn build_model(checkpoint: &Path, kv_cache_max_len: usize) -> Result<DecoderOnlyModel> {
    super::build_from_checkpoint(checkpoint, kv_cache_max_len, &TENSOR_NAMES, get_model_config)
}

pub fn get_fake_model_config(kv_cache_max_len: usize) -> ModelConfig {
    let norm = NormalizationConfig::layer_norm(1e-5);
    ModelConfig {
        vocab_size: 64,
        embedding_dim: 32,
        kv_cache_max_len,
        embedding_scale: None,
        block_configs: vec![block(4, 4, 8, 0.5, 10000.0, Activation::GeluTanh, 64, norm); 2],
        final_norm: norm,
        lm_head_use_bias: true,
        lm_head_share_weight_with_embedding: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phi2_config() {
        let hf: HfConfig = serde_json::from_value(serde_json::json!({
            "model_type": "phi",
            "vocab_size": 51200,
            "hidden_size": 2560,
            "intermediate_size": 10240,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": null,
            "partial_rotary_factor": 0.4,
            "layer_norm_eps": 1e-5,
            "hidden_act": "gelu_new",
            "tie_word_embeddings": false
        }))
        .unwrap();
        let config = get_model_config(&hf, 1024).unwrap();
        let block = config.block_config(0);
        assert_eq!(block.attn.head_dim, 80);
        assert_eq!(block.attn.rotary_dim(), 32);
        assert_eq!(block.attn.num_query_groups, 32);
        assert!(block.parallel_residual);
        assert!(block.post_attention_norm.is_none());
        assert!(config.lm_head_use_bias);
    }
}
