//! KV cache for autoregressive generation
//!
//! The cache is a value: `forward` takes it by value and hands back the
//! updated cache, so callers never observe a cache mutated behind their back.

use crate::error::{ModelError, Result};
use crate::model_config::{AttentionConfig, ModelConfig};

/// Keys and values of one attention layer
#[derive(Debug, Clone, PartialEq)]
pub struct KvCacheEntry {
    /// K cache: [max_seq_len, num_kv_heads * head_dim]
    k_cache: Vec<f32>,
    /// V cache: [max_seq_len, num_kv_heads * head_dim]
    v_cache: Vec<f32>,
    max_seq_len: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl KvCacheEntry {
    /// Zero-initialised entry
    pub fn new(max_seq_len: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        let len = max_seq_len * num_kv_heads * head_dim;
        Self {
            k_cache: vec![0.0; len],
            v_cache: vec![0.0; len],
            max_seq_len,
            num_kv_heads,
            head_dim,
        }
    }

    pub fn from_attention_config(attn: &AttentionConfig, max_seq_len: usize) -> Self {
        Self::new(max_seq_len, attn.num_query_groups, attn.head_dim)
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Exported tensor shape: [1, max_seq_len, num_kv_heads, head_dim]
    pub fn shape(&self) -> [usize; 4] {
        [1, self.max_seq_len, self.num_kv_heads, self.head_dim]
    }

    /// Write one `[kv_dim]` row of k and v per position in `input_pos`
    pub fn update(mut self, input_pos: &[usize], k: &[f32], v: &[f32]) -> Result<Self> {
        let kv_dim = self.kv_dim();
        if k.len() != input_pos.len() * kv_dim || v.len() != input_pos.len() * kv_dim {
            return Err(ModelError::InvalidShape {
                name: "kv_cache update".into(),
                expected: vec![input_pos.len(), kv_dim],
                got: vec![k.len(), v.len()],
            });
        }
        for (row, &pos) in input_pos.iter().enumerate() {
            if pos >= self.max_seq_len {
                return Err(ModelError::InvalidInput(format!(
                    "position {pos} exceeds kv cache capacity {}",
                    self.max_seq_len
                )));
            }
            let dst = pos * kv_dim..(pos + 1) * kv_dim;
            let src = row * kv_dim..(row + 1) * kv_dim;
            self.k_cache[dst.clone()].copy_from_slice(&k[src.clone()]);
            self.v_cache[dst].copy_from_slice(&v[src]);
        }
        Ok(self)
    }

    /// Get K for a specific head at position
    pub fn get_k(&self, position: usize, head: usize) -> &[f32] {
        let start = position * self.kv_dim() + head * self.head_dim;
        &self.k_cache[start..start + self.head_dim]
    }

    /// Get V for a specific head at position
    pub fn get_v(&self, position: usize, head: usize) -> &[f32] {
        let start = position * self.kv_dim() + head * self.head_dim;
        &self.v_cache[start..start + self.head_dim]
    }

    pub fn k_data(&self) -> &[f32] {
        &self.k_cache
    }

    pub fn v_data(&self) -> &[f32] {
        &self.v_cache
    }
}

/// Per-layer attention state of a reauthored model
#[derive(Debug, Clone, PartialEq)]
pub struct KvCache {
    entries: Vec<KvCacheEntry>,
}

impl KvCache {
    /// Empty cache sized by the model's kv_cache_max_len and per-layer attention shapes
    pub fn from_model_config(config: &ModelConfig) -> Self {
        let entries = config
            .block_configs
            .iter()
            .map(|block| KvCacheEntry::from_attention_config(&block.attn, config.kv_cache_max_len))
            .collect();
        Self { entries }
    }

    pub fn from_entries(entries: Vec<KvCacheEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[KvCacheEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<KvCacheEntry> {
        self.entries
    }

    pub fn num_layers(&self) -> usize {
        self.entries.len()
    }

    pub fn max_seq_len(&self) -> usize {
        self.entries.first().map(|e| e.max_seq_len).unwrap_or(0)
    }

    /// Memory usage in bytes
    pub fn memory_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|e| (e.k_cache.len() + e.v_cache.len()) * std::mem::size_of::<f32>())
            .sum()
    }
}
