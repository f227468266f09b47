//! Weight-only INT8 quantization
//!
//! Per-output-channel symmetric scheme for 2-D weights:
//! - scale = max|row| / 127 (1.0 for an all-zero row)
//! - q = round(w / scale), clamped to the i8 range
//!
//! Rows are processed in parallel.

use std::fmt;

use edgelm_model::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantScheme {
    /// Weights kept as f32
    F32,
    /// INT8 weights with one f32 scale per output row
    Int8PerChannel,
}

impl QuantScheme {
    pub fn from_flag(quantize: bool) -> Self {
        if quantize {
            Self::Int8PerChannel
        } else {
            Self::F32
        }
    }

    /// Tag used in exported file names
    pub fn file_tag(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::Int8PerChannel => "q8",
        }
    }
}

impl fmt::Display for QuantScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::Int8PerChannel => write!(f, "int8_per_channel"),
        }
    }
}

/// INT8 weights with per-row scales
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub data: Vec<i8>,
    pub scales: Vec<f32>,
    pub shape: Vec<usize>,
}

impl QuantizedTensor {
    pub fn size_bytes(&self) -> usize {
        self.data.len() + self.scales.len() * 4
    }
}

/// Quantize a `[out_features, in_features]` weight
pub fn quantize_per_channel(tensor: &Tensor) -> Result<QuantizedTensor> {
    let shape = tensor.shape();
    if shape.len() != 2 {
        return Err(ConvertError::InvalidConfig(format!(
            "per-channel quantization needs a 2-D tensor, got shape {shape:?}"
        )));
    }
    let (out_features, in_features) = (shape[0], shape[1]);
    let data = tensor.data();

    let rows: Vec<(f32, Vec<i8>)> = (0..out_features)
        .into_par_iter()
        .map(|row| {
            let values = &data[row * in_features..(row + 1) * in_features];
            let max_abs = values.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
            let quantized = values
                .iter()
                .map(|&v| (v / scale).round().clamp(-128.0, 127.0) as i8)
                .collect();
            (scale, quantized)
        })
        .collect();

    let mut scales = Vec::with_capacity(out_features);
    let mut quantized = Vec::with_capacity(out_features * in_features);
    for (scale, row) in rows {
        scales.push(scale);
        quantized.extend(row);
    }

    Ok(QuantizedTensor {
        data: quantized,
        scales,
        shape: shape.to_vec(),
    })
}

/// Back to f32
pub fn dequantize(quantized: &QuantizedTensor) -> Result<Tensor> {
    let (rows, cols) = match quantized.shape.as_slice() {
        [rows, cols] => (*rows, *cols),
        other => {
            return Err(ConvertError::InvalidConfig(format!(
                "quantized tensor must be 2-D, got shape {other:?}"
            )))
        }
    };
    if quantized.scales.len() != rows || quantized.data.len() != rows * cols {
        return Err(ConvertError::InvalidConfig(format!(
            "{} values and {} scales do not fit shape {:?}",
            quantized.data.len(),
            quantized.scales.len(),
            quantized.shape
        )));
    }

    let data = quantized
        .data
        .par_chunks(cols.max(1))
        .zip(&quantized.scales)
        .flat_map_iter(|(row, &scale)| row.iter().map(move |&q| q as f32 * scale))
        .collect();
    Ok(Tensor::new(data, quantized.shape.clone())?)
}
