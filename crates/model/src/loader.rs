//! Safetensors checkpoint loading
//!
//! Supports a single `model.safetensors`, a sharded set described by
//! `model.safetensors.index.json`, or any `*.safetensors` files found in the
//! directory. Files are memory-mapped; tensors are widened to f32 on access.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use safetensors::{Dtype, SafeTensors};
use serde::Deserialize;

use crate::error::{ModelError, Result};
use crate::tensor::Tensor;

/// Single-file weights name
pub const WEIGHTS_NAME: &str = "model.safetensors";

/// Sharded weights index name
pub const WEIGHTS_INDEX_NAME: &str = "model.safetensors.index.json";

#[derive(Debug, Deserialize)]
struct WeightsIndex {
    weight_map: HashMap<String, String>,
}

/// Load model weights from safetensors files
pub struct SafetensorsLoader {
    /// Memory-mapped files
    mmaps: Vec<(PathBuf, Mmap)>,
    /// Tensor name -> index into `mmaps`
    index: HashMap<String, usize>,
}

impl SafetensorsLoader {
    /// Open every weights file of a checkpoint directory
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ModelError::ModelNotFound(dir.display().to_string()));
        }
        let files = Self::weight_files(dir)?;
        if files.is_empty() {
            return Err(ModelError::ModelNotFound(format!(
                "no safetensors weights in {}",
                dir.display()
            )));
        }
        Self::from_files(&files)
    }

    /// Open an explicit list of safetensors files
    pub fn from_files(files: &[PathBuf]) -> Result<Self> {
        let mut mmaps = Vec::with_capacity(files.len());
        let mut index = HashMap::new();

        for (file_idx, path) in files.iter().enumerate() {
            let file = File::open(path)?;
            // The checkpoint files are treated as read-only for the lifetime of the loader.
            let mmap = unsafe { Mmap::map(&file)? };
            let tensors = SafeTensors::deserialize(&mmap)
                .map_err(|e| ModelError::Safetensors(format!("{}: {}", path.display(), e)))?;
            for name in tensors.names() {
                index.insert(name.to_string(), file_idx);
            }
            tracing::debug!(path = %path.display(), tensors = tensors.len(), "mapped weights file");
            mmaps.push((path.clone(), mmap));
        }

        Ok(Self { mmaps, index })
    }

    /// Weight files of a checkpoint directory, in load order
    pub fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let index_path = dir.join(WEIGHTS_INDEX_NAME);
        if index_path.is_file() {
            let content = std::fs::read_to_string(&index_path)?;
            let index: WeightsIndex = serde_json::from_str(&content)?;
            let mut shards: Vec<String> = index.weight_map.into_values().collect();
            shards.sort();
            shards.dedup();
            return Ok(shards.into_iter().map(|s| dir.join(s)).collect());
        }

        let single = dir.join(WEIGHTS_NAME);
        if single.is_file() {
            return Ok(vec![single]);
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "safetensors") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Get tensor names across all files
    pub fn tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Load a tensor as f32 values
    pub fn load(&self, name: &str) -> Result<Tensor> {
        let file_idx = self
            .index
            .get(name)
            .ok_or_else(|| ModelError::MissingTensor(name.to_string()))?;
        let (path, mmap) = &self.mmaps[*file_idx];
        let tensors = SafeTensors::deserialize(mmap)
            .map_err(|e| ModelError::Safetensors(format!("{}: {}", path.display(), e)))?;
        let view = tensors
            .tensor(name)
            .map_err(|_| ModelError::MissingTensor(name.to_string()))?;

        let data = decode_f32(name, view.dtype(), view.data())?;
        Tensor::new(data, view.shape().to_vec())
    }

    /// Load a tensor if present
    pub fn load_optional(&self, name: &str) -> Result<Option<Tensor>> {
        if self.contains(name) {
            self.load(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Load a tensor and check its shape
    pub fn load_with_shape(&self, name: &str, shape: &[usize]) -> Result<Tensor> {
        let tensor = self.load(name)?;
        tensor.expect_shape(name, shape)?;
        Ok(tensor)
    }

    /// Total mapped size in bytes
    pub fn total_size_bytes(&self) -> usize {
        self.mmaps.iter().map(|(_, m)| m.len()).sum()
    }
}

/// Widen raw little-endian tensor bytes to f32
fn decode_f32(name: &str, dtype: Dtype, data: &[u8]) -> Result<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|b| half::bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|b| half::f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect(),
        other => {
            return Err(ModelError::InvalidDtype {
                name: name.to_string(),
                got: format!("{:?}", other),
            })
        }
    };
    Ok(values)
}
