//! Calling conventions stored with an exported model
//!
//! A bundle carries two signatures over the same weights: `prefill` takes a
//! fixed-length block of prompt tokens, `decode` a single token. Both thread
//! one K and one V cache tensor per layer.

use edgelm_model::{KvCache, ModelConfig};
use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, Result};

pub const PREFILL_SIGNATURE: &str = "prefill";
pub const DECODE_SIGNATURE: &str = "decode";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorDtype {
    I32,
    F32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: TensorDtype,
}

impl TensorSpec {
    fn new(name: impl Into<String>, shape: Vec<usize>, dtype: TensorDtype) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub seq_len: usize,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

fn kv_specs(config: &ModelConfig) -> Vec<TensorSpec> {
    (0..config.num_layers())
        .flat_map(|idx| {
            let attn = &config.block_config(idx).attn;
            let shape = vec![1, config.kv_cache_max_len, attn.num_query_groups, attn.head_dim];
            [
                TensorSpec::new(format!("kv_cache.k_{idx}"), shape.clone(), TensorDtype::F32),
                TensorSpec::new(format!("kv_cache.v_{idx}"), shape, TensorDtype::F32),
            ]
        })
        .collect()
}

impl Signature {
    pub fn new(name: &str, config: &ModelConfig, seq_len: usize) -> Self {
        let mut inputs = vec![
            TensorSpec::new("tokens", vec![1, seq_len], TensorDtype::I32),
            TensorSpec::new("input_pos", vec![seq_len], TensorDtype::I32),
        ];
        inputs.extend(kv_specs(config));

        let mut outputs = vec![TensorSpec::new(
            "logits",
            vec![1, seq_len, config.vocab_size],
            TensorDtype::F32,
        )];
        outputs.extend(kv_specs(config));

        Self {
            name: name.to_string(),
            seq_len,
            inputs,
            outputs,
        }
    }

    pub fn prefill(config: &ModelConfig, prefill_seq_len: usize) -> Self {
        Self::new(PREFILL_SIGNATURE, config, prefill_seq_len)
    }

    pub fn decode(config: &ModelConfig) -> Self {
        Self::new(DECODE_SIGNATURE, config, 1)
    }

    fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    /// Check a call against the declared input shapes
    pub fn check_inputs(
        &self,
        tokens: &[u32],
        input_pos: &[usize],
        kv_cache: &KvCache,
    ) -> Result<()> {
        let mismatch = |what: &str, expected: usize, got: usize| {
            ConvertError::InvalidConfig(format!(
                "signature {}: {what} expects {expected}, got {got}",
                self.name
            ))
        };
        if tokens.len() != self.seq_len {
            return Err(mismatch("tokens", self.seq_len, tokens.len()));
        }
        if input_pos.len() != self.seq_len {
            return Err(mismatch("input_pos", self.seq_len, input_pos.len()));
        }
        let layers = self.inputs.len().saturating_sub(2) / 2;
        if kv_cache.num_layers() != layers {
            return Err(mismatch("kv cache layers", layers, kv_cache.num_layers()));
        }
        for (idx, entry) in kv_cache.entries().iter().enumerate() {
            let name = format!("kv_cache.k_{idx}");
            let matches = self
                .input(&name)
                .map_or(false, |spec| spec.shape.as_slice() == entry.shape().as_slice());
            if !matches {
                return Err(ConvertError::InvalidConfig(format!(
                    "signature {}: {name} does not accept shape {:?}",
                    self.name,
                    entry.shape()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgelm_model::families::{openelm, tiny_llama};

    #[test]
    fn test_prefill_and_decode_shapes() {
        let config = tiny_llama::get_fake_model_config(16);
        let prefill = Signature::prefill(&config, 8);
        let decode = Signature::decode(&config);

        assert_eq!(prefill.inputs[0].shape, vec![1, 8]);
        assert_eq!(prefill.inputs[1].shape, vec![8]);
        assert_eq!(prefill.outputs[0].shape, vec![1, 8, 64]);
        assert_eq!(decode.inputs[0].shape, vec![1, 1]);
        assert_eq!(decode.outputs[0].shape, vec![1, 1, 64]);

        // tokens, input_pos, then k and v for both layers
        assert_eq!(prefill.inputs.len(), 2 + 2 * config.num_layers());
        assert_eq!(prefill.inputs[2].name, "kv_cache.k_0");
        assert_eq!(prefill.inputs[2].shape, vec![1, 16, 2, 8]);
        assert_eq!(prefill.inputs[2].dtype, TensorDtype::F32);
        assert_eq!(prefill.inputs[0].dtype, TensorDtype::I32);
    }

    #[test]
    fn test_per_layer_kv_shapes() {
        let config = openelm::get_fake_model_config(16);
        let decode = Signature::decode(&config);
        assert_eq!(decode.inputs[2].shape, vec![1, 16, 1, 8]);
        assert_eq!(decode.inputs[6].name, "kv_cache.k_2");
        assert_eq!(decode.inputs[6].shape, vec![1, 16, 2, 8]);
    }

    #[test]
    fn test_check_inputs() {
        let config = tiny_llama::get_fake_model_config(16);
        let decode = Signature::decode(&config);
        let cache = KvCache::from_model_config(&config);
        assert!(decode.check_inputs(&[5], &[3], &cache).is_ok());
        assert!(decode.check_inputs(&[5, 6], &[3, 4], &cache).is_err());

        let other = KvCache::from_model_config(&tiny_llama::get_fake_model_config(8));
        assert!(decode.check_inputs(&[5], &[3], &other).is_err());
    }
}
