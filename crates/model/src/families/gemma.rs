//! Gemma (`google/gemma-2b`)
//!
//! Llama layout with zero-centered RMSNorm weights, tanh-GELU gating,
//! embeddings scaled by `sqrt(hidden_size)` and a tied head.

use std::path::Path;

use crate::config::HfConfig;
use crate::error::Result;
use crate::model_config::ModelConfig;
use crate::ops::Activation;
use crate::tensor_names::TensorNames;
use crate::transformer::DecoderOnlyModel;

pub const TENSOR_NAMES: TensorNames = super::LLAMA_TENSOR_NAMES;

fn gemmafy(mut config: ModelConfig) -> ModelConfig {
    config.embedding_scale = Some((config.embedding_dim as f32).sqrt());
    config.final_norm.zero_centered = true;
    for block in &mut config.block_configs {
        block.pre_attention_norm.zero_centered = true;
        if let Some(norm) = &mut block.post_attention_norm {
            norm.zero_centered = true;
        }
    }
    config
}

pub fn get_model_config(hf_config: &HfConfig, kv_cache_max_len: usize) -> Result<ModelConfig> {
    let mut config = super::llama_model_config(hf_config, kv_cache_max_len)?;
    if hf_config.activation().is_none() {
        for block in &mut config.block_configs {
            block.ff.activation = Activation::GeluTanh;
        }
    }
    config.lm_head_share_weight_with_embedding = hf_config.tie_word_embeddings(true);
    Ok(gemmafy(config))
}

pub fn build_model(checkpoint: &Path, kv_cache_max_len: usize) -> Result<DecoderOnlyModel> {
    super::build_from_checkpoint(checkpoint, kv_cache_max_len, &TENSOR_NAMES, get_model_config)
}

pub fn get_fake_model_config(kv_cache_max_len: usize) -> ModelConfig {
    gemmafy(super::fake_llama_config(
        kv_cache_max_len,
        2,
        1,
        16,
        Activation::GeluTanh,
        true,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemma_2b_config() {
        let hf: HfConfig = serde_json::from_value(serde_json::json!({
            "model_type": "gemma",
            "vocab_size": 256000,
            "hidden_size": 2048,
            "intermediate_size": 16384,
            "num_hidden_layers": 18,
            "num_attention_heads": 8,
            "num_key_value_heads": 1,
            "head_dim": 256,
            "rms_norm_eps": 1e-6,
            "hidden_act": "gelu",
            "hidden_activation": "gelu_pytorch_tanh"
        }))
        .unwrap();
        let config = get_model_config(&hf, 1024).unwrap();
        let block = config.block_config(0);
        assert_eq!(block.attn.head_dim, 256);
        assert_eq!(block.attn.num_query_groups, 1);
        assert_eq!(block.ff.activation, Activation::GeluTanh);
        assert!(block.pre_attention_norm.zero_centered);
        assert!(config.final_norm.zero_centered);
        assert!(config.lm_head_share_weight_with_embedding);
        assert_eq!(config.embedding_scale, Some(2048f32.sqrt()));
    }
}
