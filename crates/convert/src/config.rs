//! Export settings

use std::path::{Path, PathBuf};

use edgelm_model::ModelConfig;

use crate::error::{ConvertError, Result};
use crate::quantize::QuantScheme;

pub use edgelm_harness::DEFAULT_KV_CACHE_MAX_LEN;

/// Largest prompt the `prefill` signature accepts
pub const DEFAULT_PREFILL_SEQ_LEN: usize = 512;

/// Bundle file extension
pub const BUNDLE_EXTENSION: &str = "safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportConfig {
    pub prefill_seq_len: usize,
    /// Cache length shared by prefill and decode
    pub kv_cache_max_len: usize,
    pub quantize: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            prefill_seq_len: DEFAULT_PREFILL_SEQ_LEN,
            kv_cache_max_len: DEFAULT_KV_CACHE_MAX_LEN,
            quantize: true,
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.prefill_seq_len == 0 {
            return Err(ConvertError::InvalidConfig(
                "prefill_seq_len must be positive".into(),
            ));
        }
        if self.prefill_seq_len > self.kv_cache_max_len {
            return Err(ConvertError::InvalidConfig(format!(
                "prefill_seq_len {} exceeds kv_cache_max_len {}",
                self.prefill_seq_len, self.kv_cache_max_len
            )));
        }
        Ok(())
    }

    /// Check that `model` was built for this cache length
    pub fn check_model(&self, model: &ModelConfig) -> Result<()> {
        if model.kv_cache_max_len != self.kv_cache_max_len {
            return Err(ConvertError::InvalidConfig(format!(
                "model was built with kv_cache_max_len {}, export asks for {}",
                model.kv_cache_max_len, self.kv_cache_max_len
            )));
        }
        Ok(())
    }

    pub fn quant_scheme(&self) -> QuantScheme {
        QuantScheme::from_flag(self.quantize)
    }

    /// `{prefix}_{q8|f32}_seq{prefill}_ekv{kv}.safetensors`
    pub fn output_path(&self, prefix: &Path) -> PathBuf {
        PathBuf::from(format!(
            "{}_{}_seq{}_ekv{}.{BUNDLE_EXTENSION}",
            prefix.display(),
            self.quant_scheme().file_tag(),
            self.prefill_seq_len,
            self.kv_cache_max_len
        ))
    }
}
