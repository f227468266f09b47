//! Dense kernels shared by the reference and reauthored models
//!
//! Activations are row-major `[n, dim]` f32 buffers. Every output element is a
//! single sequential reduction, so results do not depend on how rayon splits
//! the work.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::tensor::Tensor;

/// Feed-forward activation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// x * sigmoid(x), a.k.a. swish
    Silu,
    /// tanh approximation of GELU (`gelu_new`, `gelu_pytorch_tanh`)
    GeluTanh,
}

impl Activation {
    /// Parse a HuggingFace activation name
    pub fn from_hf_name(name: &str) -> Result<Self> {
        match name {
            "silu" | "swish" => Ok(Self::Silu),
            "gelu" | "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Ok(Self::GeluTanh),
            other => Err(ModelError::Config(format!("unsupported activation: {other}"))),
        }
    }

    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Self::Silu => silu(x),
            Self::GeluTanh => gelu_tanh(x),
        }
    }
}

/// SiLU activation: x * sigmoid(x)
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// GELU, tanh approximation
pub fn gelu_tanh(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

/// Sequential dot product
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        acc += x * y;
    }
    acc
}

/// Linear layer: y = x @ W^T + b
///
/// x: [n, in_features], weight: [out_features, in_features] (HF layout)
pub fn linear(x: &[f32], n: usize, weight: &Tensor, bias: Option<&Tensor>) -> Vec<f32> {
    let out_features = weight.rows();
    let in_features = weight.row_len();
    debug_assert_eq!(x.len(), n * in_features);

    let w = weight.data();
    let b = bias.map(|b| b.data());
    let mut output = vec![0.0f32; n * out_features];

    output
        .par_iter_mut()
        .with_min_len(64)
        .enumerate()
        .for_each(|(idx, out)| {
            let t = idx / out_features;
            let j = idx % out_features;
            let row = &x[t * in_features..(t + 1) * in_features];
            let w_row = &w[j * in_features..(j + 1) * in_features];
            let mut y = dot(row, w_row);
            if let Some(b) = b {
                y += b[j];
            }
            *out = y;
        });

    output
}

/// RMS norm: x / sqrt(mean(x^2) + eps) * (offset + w)
///
/// `offset` is 0 for Llama-style weights and 1 for Gemma's zero-centered weights.
pub fn rms_norm(x: &[f32], dim: usize, weight: &[f32], eps: f32, offset: f32) -> Vec<f32> {
    let mut output = vec![0.0f32; x.len()];
    output
        .par_chunks_mut(dim)
        .zip(x.par_chunks(dim))
        .for_each(|(out, row)| {
            let mean_sq = dot(row, row) / dim as f32;
            let inv = 1.0 / (mean_sq + eps).sqrt();
            for ((o, &xi), &wi) in out.iter_mut().zip(row).zip(weight) {
                *o = (xi * inv) * (offset + wi);
            }
        });
    output
}

/// Layer norm with affine weight and bias
pub fn layer_norm(
    x: &[f32],
    dim: usize,
    weight: &[f32],
    bias: Option<&[f32]>,
    eps: f32,
) -> Vec<f32> {
    let mut output = vec![0.0f32; x.len()];
    output
        .par_chunks_mut(dim)
        .zip(x.par_chunks(dim))
        .for_each(|(out, row)| {
            let mean = row.iter().sum::<f32>() / dim as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
            let inv = 1.0 / (var + eps).sqrt();
            for (i, (o, &xi)) in out.iter_mut().zip(row).enumerate() {
                let mut y = (xi - mean) * inv * weight[i];
                if let Some(bias) = bias {
                    y += bias[i];
                }
                *o = y;
            }
        });
    output
}

/// Numerically stable softmax; `-inf` entries get zero weight
pub fn softmax_in_place(scores: &mut [f32]) {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    for s in scores.iter_mut() {
        *s /= sum;
    }
}

/// Gather embedding rows for `tokens`
pub fn embedding(table: &Tensor, tokens: &[u32]) -> Result<Vec<f32>> {
    let vocab_size = table.rows();
    let dim = table.row_len();
    let mut output = Vec::with_capacity(tokens.len() * dim);
    for &token in tokens {
        let id = token as usize;
        if id >= vocab_size {
            return Err(ModelError::InvalidInput(format!(
                "token id {id} out of range for vocabulary of {vocab_size}"
            )));
        }
        output.extend_from_slice(table.row(id));
    }
    Ok(output)
}

/// Element-wise `a += b`
pub fn add_in_place(a: &mut [f32], b: &[f32]) {
    for (x, y) in a.iter_mut().zip(b) {
        *x += y;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_with_bias() {
        // W = [[1, 2], [3, 4], [5, 6]] (out=3, in=2), x = [[1, 1], [2, 0]]
        let w = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![3, 2]).unwrap();
        let b = Tensor::new(vec![0.5, 0.0, -1.0], vec![3]).unwrap();
        let y = linear(&[1.0, 1.0, 2.0, 0.0], 2, &w, Some(&b));
        assert_eq!(y, vec![3.5, 7.0, 10.0, 2.5, 6.0, 9.0]);
    }

    #[test]
    fn test_rms_norm() {
        let x = vec![1.0, 2.0, 3.0];
        let y = rms_norm(&x, 3, &[1.0, 1.0, 1.0], 0.0, 0.0);
        // RMS = sqrt(14/3)
        let rms = (14.0f32 / 3.0).sqrt();
        for (a, b) in y.iter().zip(&x) {
            assert!((a - b / rms).abs() < 1e-6);
        }

        // Zero-centered weights: w = 0 means scale 1
        let z = rms_norm(&x, 3, &[0.0, 0.0, 0.0], 0.0, 1.0);
        assert_eq!(y, z);
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let y = layer_norm(&x, 4, &[1.0; 4], Some(&[0.0; 4]), 1e-5);
        let mean: f32 = y.iter().sum::<f32>() / 4.0;
        let var: f32 = y.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_softmax_masks_neg_inf() {
        let mut s = vec![1.0, 1.0, f32::NEG_INFINITY];
        softmax_in_place(&mut s);
        assert_eq!(s, vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_activations() {
        assert_eq!(silu(0.0), 0.0);
        assert!((silu(1.0) - 0.731_058_6).abs() < 1e-6);
        assert_eq!(gelu_tanh(0.0), 0.0);
        assert!((gelu_tanh(1.0) - 0.841_192).abs() < 1e-5);
        assert_eq!(Activation::from_hf_name("swish").unwrap(), Activation::Silu);
        assert_eq!(
            Activation::from_hf_name("gelu_pytorch_tanh").unwrap(),
            Activation::GeluTanh
        );
        assert!(Activation::from_hf_name("relu2").is_err());
    }

    #[test]
    fn test_embedding_out_of_range() {
        let table = Tensor::zeros(vec![4, 2]);
        assert!(embedding(&table, &[0, 3]).is_ok());
        assert!(matches!(
            embedding(&table, &[4]),
            Err(ModelError::InvalidInput(_))
        ));
    }
}
