//! Dense f32 tensors and model outputs

use std::collections::BTreeMap;

use rand::Rng;

use crate::error::{ModelError, Result};

/// Row-major f32 tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

/// Ordered parameter map, keyed by parameter name
pub type StateDict = BTreeMap<String, Tensor>;

impl Tensor {
    /// Create a tensor, checking that `data` fills `shape`
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(ModelError::InvalidShape {
                name: "<tensor>".into(),
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self { data, shape })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            data: vec![0.0; numel],
            shape,
        }
    }

    /// Uniform values in `[center - spread, center + spread)` (for testing)
    pub fn random<R: Rng>(shape: Vec<usize>, center: f32, spread: f32, rng: &mut R) -> Self {
        let numel = shape.iter().product();
        let data = (0..numel)
            .map(|_| center + rng.gen_range(-spread..spread))
            .collect();
        Self { data, shape }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Number of rows of a 2-D tensor (first dimension)
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Length of one row (product of trailing dimensions)
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Borrow row `i` of a 2-D tensor
    pub fn row(&self, i: usize) -> &[f32] {
        let len = self.row_len();
        &self.data[i * len..(i + 1) * len]
    }

    /// Fail with a descriptive error unless the shape matches
    pub fn expect_shape(&self, name: &str, expected: &[usize]) -> Result<()> {
        if self.shape != expected {
            return Err(ModelError::InvalidShape {
                name: name.to_string(),
                expected: expected.to_vec(),
                got: self.shape.clone(),
            });
        }
        Ok(())
    }

    /// Copy rows `start..end` into a new tensor
    pub fn slice_rows(&self, start: usize, end: usize) -> Tensor {
        let len = self.row_len();
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Tensor {
            data: self.data[start * len..end * len].to_vec(),
            shape,
        }
    }

    /// Stack tensors with equal trailing dimensions along the first dimension
    pub fn concat_rows(parts: &[&Tensor]) -> Result<Tensor> {
        let row_len = parts.first().map(|t| t.row_len()).unwrap_or(0);
        let trailing: Vec<usize> = parts
            .first()
            .map(|t| t.shape.iter().skip(1).copied().collect())
            .unwrap_or_default();
        let mut rows = 0;
        let mut data = Vec::new();
        for part in parts {
            if part.shape.iter().skip(1).ne(trailing.iter()) {
                return Err(ModelError::InvalidShape {
                    name: "<concat>".into(),
                    expected: vec![part.rows(), row_len],
                    got: part.shape.clone(),
                });
            }
            rows += part.rows();
            data.extend_from_slice(&part.data);
        }
        let mut shape = vec![rows];
        shape.extend(trailing);
        Ok(Tensor { data, shape })
    }
}

/// Logits for every input position: `[seq_len, vocab_size]`
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    data: Vec<f32>,
    seq_len: usize,
    vocab_size: usize,
}

impl Logits {
    pub fn new(data: Vec<f32>, seq_len: usize, vocab_size: usize) -> Result<Self> {
        if data.len() != seq_len * vocab_size {
            return Err(ModelError::InvalidShape {
                name: "logits".into(),
                expected: vec![seq_len, vocab_size],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            data,
            seq_len,
            vocab_size,
        })
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Logit vector at position `pos`
    pub fn row(&self, pos: usize) -> Option<&[f32]> {
        if pos >= self.seq_len {
            return None;
        }
        Some(&self.data[pos * self.vocab_size..(pos + 1) * self.vocab_size])
    }

    pub fn last_row(&self) -> Option<&[f32]> {
        self.seq_len.checked_sub(1).and_then(|pos| self.row(pos))
    }
}

/// Index of the largest value; the first one wins on ties
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ if v.is_nan() => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_checked() {
        assert!(Tensor::new(vec![0.0; 6], vec![2, 3]).is_ok());
        assert!(Tensor::new(vec![0.0; 5], vec![2, 3]).is_err());
    }

    #[test]
    fn test_slice_and_concat_rows() {
        let t = Tensor::new((0..6).map(|x| x as f32).collect(), vec![3, 2]).unwrap();
        let top = t.slice_rows(0, 1);
        let bottom = t.slice_rows(1, 3);
        assert_eq!(bottom.shape(), &[2, 2]);
        assert_eq!(bottom.row(0), &[2.0, 3.0]);

        let joined = Tensor::concat_rows(&[&top, &bottom]).unwrap();
        assert_eq!(joined, t);

        let bias = Tensor::new(vec![1.0, 2.0, 3.0], vec![3]).unwrap();
        let joined =
            Tensor::concat_rows(&[&bias.slice_rows(2, 3), &bias.slice_rows(0, 2)]).unwrap();
        assert_eq!(joined.shape(), &[3]);
        assert_eq!(joined.data(), &[3.0, 1.0, 2.0]);
    }

    #[test]
    fn test_logits_rows() {
        let logits = Logits::new(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], 2, 3).unwrap();
        assert_eq!(logits.row(1), Some(&[3.0, 4.0, 5.0][..]));
        assert_eq!(logits.last_row(), logits.row(1));
        assert_eq!(logits.row(2), None);

        let empty = Logits::new(vec![], 0, 3).unwrap();
        assert_eq!(empty.last_row(), None);
    }

    #[test]
    fn test_argmax_first_on_ties() {
        assert_eq!(argmax(&[0.5, 2.0, 2.0, -1.0]), Some(1));
        assert_eq!(argmax(&[f32::NAN, 1.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
