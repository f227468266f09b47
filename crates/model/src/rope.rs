//! Rotary Position Embedding (RoPE)
//!
//! Implements the rotary position embedding from the RoFormer paper:
//! "RoFormer: Enhanced Transformer with Rotary Position Embedding"
//! https://arxiv.org/abs/2104.09864
//!
//! RoPE encodes position information by rotating pairs of features.
//! For position m and dimension d with freq θ_d:
//!   RoPE(x, m)[i], RoPE(x, m)[i + d/2] = R(m·θ_i) · (x[i], x[i + d/2])
//!
//! Pairs are taken half-split (HuggingFace `rotate_half` convention). Only the
//! first `rotary_dim` features of each head are rotated, which covers partial
//! rotary models such as Phi-2.

use crate::error::{ModelError, Result};

/// Precomputed RoPE frequencies (cos and sin tables)
#[derive(Debug, Clone)]
pub struct RopeFrequencies {
    /// Cosine values: [max_seq_len, rotary_dim/2]
    pub cos: Vec<Vec<f32>>,
    /// Sine values: [max_seq_len, rotary_dim/2]
    pub sin: Vec<Vec<f32>>,
    /// Number of rotated features per head
    pub rotary_dim: usize,
    /// Maximum sequence length
    pub max_seq_len: usize,
    /// Base frequency (theta)
    pub theta: f64,
}

impl RopeFrequencies {
    /// Create RoPE frequencies with specified parameters
    pub fn new(rotary_dim: usize, max_seq_len: usize, theta: f64) -> Self {
        // Compute inverse frequencies: 1 / (theta^(2i/d)) for i in 0..d/2
        let half_dim = rotary_dim / 2;
        let inv_freq: Vec<f64> = (0..half_dim)
            .map(|i| 1.0 / theta.powf((2 * i) as f64 / rotary_dim as f64))
            .collect();

        let mut cos = Vec::with_capacity(max_seq_len);
        let mut sin = Vec::with_capacity(max_seq_len);

        for pos in 0..max_seq_len {
            let pos_f64 = pos as f64;
            cos.push(inv_freq.iter().map(|&f| (pos_f64 * f).cos() as f32).collect());
            sin.push(inv_freq.iter().map(|&f| (pos_f64 * f).sin() as f32).collect());
        }

        Self {
            cos,
            sin,
            rotary_dim,
            max_seq_len,
            theta,
        }
    }

    /// Get cos/sin values for a specific position
    pub fn get(&self, position: usize) -> Option<(&[f32], &[f32])> {
        if position < self.max_seq_len {
            Some((&self.cos[position], &self.sin[position]))
        } else {
            None
        }
    }
}

/// Number of rotated features for a head of `head_dim` and a rotary fraction
pub fn rotary_dim(head_dim: usize, rotary_percentage: f64) -> usize {
    let dim = (head_dim as f64 * rotary_percentage) as usize;
    dim - dim % 2
}

/// Rotate the first `cos.len() * 2` features of one head in place
pub fn apply_rope_head(x: &mut [f32], cos: &[f32], sin: &[f32]) {
    let half_dim = cos.len();
    for i in 0..half_dim {
        let x0 = x[i];
        let x1 = x[i + half_dim];
        let c = cos[i];
        let s = sin[i];

        // [cos -sin] [x0]
        // [sin  cos] [x1]
        x[i] = x0 * c - x1 * s;
        x[i + half_dim] = x0 * s + x1 * c;
    }
}

/// Apply RoPE to every head of a `[num_heads * head_dim]` vector at `position`
///
/// Positions outside the table are rejected and leave the vector unchanged.
pub fn apply_rope(
    x: &mut [f32],
    num_heads: usize,
    head_dim: usize,
    position: usize,
    freqs: &RopeFrequencies,
) -> Result<()> {
    let (cos, sin) = freqs.get(position).ok_or_else(|| {
        ModelError::InvalidInput(format!(
            "position {position} outside rope table of length {}",
            freqs.max_seq_len
        ))
    })?;
    for h in 0..num_heads {
        apply_rope_head(&mut x[h * head_dim..(h + 1) * head_dim], cos, sin);
    }
    Ok(())
}
