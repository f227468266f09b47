//! OpenELM (`apple/OpenELM-3B`)
//!
//! Layer-wise scaling: every layer has its own head counts and feed-forward
//! width. The checkpoint keeps q, k and v in one projection and the GLU gate
//! and up projections in another.

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
    embedding: "transformer.token_embeddings",
    attn_norm: "transformer.layers.{}.attn_norm",
    attn: AttentionNames::Fused {
        qkv: "transformer.layers.{}.attn.qkv_proj",
    },
    attn_output: "transformer.layers.{}.attn.out_proj",
    query_norm: Some("transformer.layers.{}.attn.q_norm"),
    key_norm: Some("transformer.layers.{}.attn.k_norm"),
    ff_norm: Some("transformer.layers.{}.ffn_norm"),
    ff: FeedForwardNames::FusedGated {
        gate_up: "transformer.layers.{}.ffn.proj_1",
    },
    ff_down: "transformer.layers.{}.ffn.proj_2",
    final_norm: "transformer.norm",
    lm_head: Some("lm_head"),
};

const NORM_EPS: f32 = 1e-6;

/// Round `value` to the nearest multiple of `divisor`, never dropping more than 10%
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    let mut rounded = (((value + d / 2.0) as usize) / divisor * divisor).max(divisor);
    if (rounded as f64) < 0.9 * value {
        rounded += divisor;
    }
    rounded
}

/// Feed-forward width of `layer`
pub fn intermediate_size(hf_config: &HfConfig, layer: usize) -> Result<usize> {
    let multiplier = hf_config
        .ffn_multipliers
        .as_ref()
        .and_then(|m| m.get(layer))
        .ok_or_else(|| {
            ModelError::Config(format!("ffn_multipliers has no entry for layer {layer}"))
        })?;
    let dim = hf_config.hidden_size()?;
    Ok(make_divisible(
        multiplier * dim as f64,
        hf_config.ffn_dim_divisor.unwrap_or(256),
    ))
}

fn block(
    num_heads: usize,
    num_query_groups: usize,
    head_dim: usize,
    rotary_base: f64,
    qk_norm: bool,
    intermediate_size: usize,
) -> TransformerBlockConfig {
    let norm = NormalizationConfig::rms_norm(NORM_EPS);
    let qk_norm = qk_norm.then_some(norm);
    TransformerBlockConfig {
        attn: AttentionConfig {
            num_heads,
            head_dim,
            num_query_groups,
            rotary_percentage: 1.0,
            rotary_base,
            qkv_use_bias: false,
            output_proj_use_bias: false,
            query_norm: qk_norm,
            key_norm: qk_norm,
        },
        ff: FeedForwardConfig {
            kind: FeedForwardType::Gated,
            activation: Activation::Silu,
            intermediate_size,
            use_bias: false,
        },
        pre_attention_norm: norm,
        post_attention_norm: Some(norm),
        parallel_residual: false,
    }
}

pub fn get_model_config(hf_config: &HfConfig, kv_cache_max_len: usize) -> Result<ModelConfig> {
    if !hf_config.ffn_with_glu.unwrap_or(true) {
        return Err(ModelError::Config("OpenELM without GLU feed-forward is not supported".into()));
    }
    if let Some(act) = hf_config.activation() {
        if Activation::from_hf_name(act)? != Activation::Silu {
            return Err(ModelError::Config(format!("unexpected OpenELM activation {act}")));
        }
    }
    let head_dim = hf_config.head_dim()?;
    let qk_norm = hf_config.normalize_qk_projections.unwrap_or(true);

    let block_configs = (0..hf_config.num_layers()?)
        .map(|layer| {
            Ok(block(
                hf_config.num_heads(layer)?,
                hf_config.num_kv_heads(layer)?,
                head_dim,
                hf_config.rope_theta(),
                qk_norm,
                intermediate_size(hf_config, layer)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ModelConfig {
        vocab_size: hf_config.vocab_size,
        embedding_dim: hf_config.hidden_size()?,
        kv_cache_max_len,
        embedding_scale: None,
        block_configs,
        final_norm: NormalizationConfig::rms_norm(NORM_EPS),
        lm_head_use_bias: false,
        lm_head_share_weight_with_embedding: hf_config.tie_word_embeddings(true),
    })
}

pub fn build_model(checkpoint: &Path, kv_cache_max_len: usize) -> Result<DecoderOnlyModel> {
    super::build_from_checkpoint(checkpoint, kv_cache_max_len, &TENSOR_NAMES, get_model_config)
}

pub fn get_fake_model_config(kv_cache_max_len: usize) -> ModelConfig {
    ModelConfig {
        vocab_size: 64,
        embedding_dim: 32,
        kv_cache_max_len,
        embedding_scale: None,
        block_configs: vec![
            block(2, 1, 8, 10000.0, true, 32),
            block(4, 2, 8, 10000.0, true, 64),
            block(4, 2, 8, 10000.0, true, 96),
        ],
        final_norm: NormalizationConfig::rms_norm(NORM_EPS),
        lm_head_use_bias: false,
        lm_head_share_weight_with_embedding: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(0.5 * 3072.0, 256), 1536);
        assert_eq!(make_divisible(4.0 * 3072.0, 256), 12288);
        assert_eq!(make_divisible(10.0, 8), 16);
        assert_eq!(make_divisible(3.0, 8), 8);
    }

    #[test]
    fn test_per_layer_shapes() {
        let hf: HfConfig = serde_json::from_value(serde_json::json!({
            "model_type": "openelm",
            "vocab_size": 32000,
            "model_dim": 3072,
            "num_transformer_layers": 3,
            "head_dim": 128,
            "num_query_heads": [12, 16, 24],
            "num_kv_heads": [3, 4, 6],
            "ffn_multipliers": [0.5, 2.0, 4.0],
            "ffn_dim_divisor": 256,
            "ffn_with_glu": true,
            "normalize_qk_projections": true,
            "share_input_output_layers": true,
            "rope_freq_constant": 10000,
            "activation_fn_name": "swish"
        }))
        .unwrap();
        let config = get_model_config(&hf, 1024).unwrap();
        assert_eq!(config.num_layers(), 3);
        assert_eq!(config.block_config(0).attn.num_heads, 12);
        assert_eq!(config.block_config(2).attn.num_query_groups, 6);
        assert_eq!(config.block_config(0).ff.intermediate_size, 1536);
        assert_eq!(config.block_config(2).ff.intermediate_size, 12288);
        assert!(config.block_config(1).attn.query_norm.is_some());
        assert!(config.lm_head_share_weight_with_embedding);
    }
}
