//! SmolLM (`HuggingFaceTB/SmolLM-135M`): Llama layout with tied embeddings

use std::path::Path;

use crate::config::HfConfig;
use crate::error::Result;
use crate::model_config::ModelConfig;
use crate::ops::Activation;
use crate::tensor_names::TensorNames;
use crate::transformer::DecoderOnlyModel;

pub const TENSOR_NAMES: TensorNames = super::LLAMA_TENSOR_NAMES;

pub fn get_model_config(hf_config: &HfConfig, kv_cache_max_len: usize) -> Result<ModelConfig> {
    super::llama_model_config(hf_config, kv_cache_max_len)
}

pub fn build_model(checkpoint: &Path, kv_cache_max_len: usize) -> Result<DecoderOnlyModel> {
    super::build_from_checkpoint(checkpoint, kv_cache_max_len, &TENSOR_NAMES, get_model_config)
}

pub fn get_fake_model_config(kv_cache_max_len: usize) -> ModelConfig {
    super::fake_llama_config(kv_cache_max_len, 4, 1, 8, Activation::Silu, true)
}
