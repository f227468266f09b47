//! Reading exported bundles back
//!
//! A bundle is one safetensors file. Its `__metadata__` holds the format
//! version, the quantization scheme, the serialized `ModelConfig` and the
//! signatures; the tensors are the reauthored state dict, with quantized
//! weights stored as `i8` next to a `{name}.scale` tensor.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use edgelm_model::{
    CausalLm, DecoderOnlyModel, KvCache, ModelConfig, ModelOutput, StateDict, Tensor,
};
use memmap2::Mmap;
use safetensors::{Dtype, SafeTensors};

use crate::error::{ConvertError, Result};
use crate::quantize::{dequantize, QuantScheme, QuantizedTensor};
use crate::signature::Signature;

/// Bumped whenever the tensor layout or metadata keys change
pub const FORMAT_VERSION: u32 = 1;

pub const SCALE_SUFFIX: &str = ".scale";

const KEY_FORMAT_VERSION: &str = "format_version";
const KEY_QUANTIZATION: &str = "quantization";
const KEY_MODEL_CONFIG: &str = "model_config";
const KEY_SIGNATURES: &str = "signatures";

#[derive(Debug, Clone, PartialEq)]
pub struct BundleMetadata {
    pub format_version: u32,
    pub quantization: QuantScheme,
    pub model_config: ModelConfig,
    pub signatures: Vec<Signature>,
}

impl BundleMetadata {
    pub fn to_map(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::from([
            (KEY_FORMAT_VERSION.to_string(), self.format_version.to_string()),
            (
                KEY_QUANTIZATION.to_string(),
                serde_json::to_string(&self.quantization)?,
            ),
            (
                KEY_MODEL_CONFIG.to_string(),
                serde_json::to_string(&self.model_config)?,
            ),
            (
                KEY_SIGNATURES.to_string(),
                serde_json::to_string(&self.signatures)?,
            ),
        ]))
    }

    pub fn from_map(map: &HashMap<String, String>, path: &Path) -> Result<Self> {
        let get = |key: &str| {
            map.get(key).ok_or_else(|| bundle_error(path, format!("missing metadata key {key}")))
        };
        let format_version: u32 = get(KEY_FORMAT_VERSION)?
            .parse()
            .map_err(|e| bundle_error(path, format!("bad format version: {e}")))?;
        if format_version != FORMAT_VERSION {
            return Err(bundle_error(
                path,
                format!("format version {format_version}, expected {FORMAT_VERSION}"),
            ));
        }
        Ok(Self {
            format_version,
            quantization: serde_json::from_str(get(KEY_QUANTIZATION)?)?,
            model_config: serde_json::from_str(get(KEY_MODEL_CONFIG)?)?,
            signatures: serde_json::from_str(get(KEY_SIGNATURES)?)?,
        })
    }
}

fn bundle_error(path: &Path, message: impl Into<String>) -> ConvertError {
    ConvertError::Bundle {
        path: path.display().to_string(),
        message: message.into(),
    }
}

fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// An exported model loaded into memory
#[derive(Debug)]
pub struct EdgeBundle {
    path: PathBuf,
    metadata: BundleMetadata,
    state_dict: StateDict,
}

impl EdgeBundle {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // The bundle is read-only while mapped.
        let mmap = unsafe { Mmap::map(&file)? };

        let (_, header) = SafeTensors::read_metadata(&mmap)?;
        let map = header
            .metadata()
            .as_ref()
            .ok_or_else(|| bundle_error(path, "no __metadata__ section"))?;
        let metadata = BundleMetadata::from_map(map, path)?;

        let tensors = SafeTensors::deserialize(&mmap)?;
        let mut state_dict = StateDict::new();
        for (name, view) in tensors.tensors() {
            if name.ends_with(SCALE_SUFFIX) {
                continue;
            }
            let shape = view.shape().to_vec();
            let tensor = match view.dtype() {
                Dtype::F32 => Tensor::new(f32_values(view.data()), shape)?,
                Dtype::I8 => {
                    let scale_name = format!("{name}{SCALE_SUFFIX}");
                    let scales = tensors
                        .tensor(&scale_name)
                        .map_err(|_| bundle_error(path, format!("missing {scale_name}")))?;
                    dequantize(&QuantizedTensor {
                        data: view.data().iter().map(|&b| b as i8).collect(),
                        scales: f32_values(scales.data()),
                        shape,
                    })?
                }
                other => {
                    return Err(bundle_error(path, format!("{name}: unexpected dtype {other:?}")))
                }
            };
            state_dict.insert(name, tensor);
        }

        tracing::info!(
            path = %path.display(),
            tensors = state_dict.len(),
            quantization = %metadata.quantization,
            "Opened bundle"
        );
        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            state_dict,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &BundleMetadata {
        &self.metadata
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.metadata.model_config
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.metadata.signatures
    }

    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.signatures().iter().find(|s| s.name == name)
    }

    /// Rebuild the reauthored model from the stored (dequantized) weights
    pub fn into_model(self) -> Result<BundleModel> {
        let model = DecoderOnlyModel::from_state_dict(self.metadata.model_config, self.state_dict)?;
        Ok(BundleModel {
            model,
            signatures: self.metadata.signatures,
        })
    }
}

/// A bundle's model together with its calling conventions
pub struct BundleModel {
    model: DecoderOnlyModel,
    signatures: Vec<Signature>,
}

impl BundleModel {
    pub fn model(&self) -> &DecoderOnlyModel {
        &self.model
    }

    pub fn new_kv_cache(&self) -> KvCache {
        self.model.new_kv_cache()
    }

    /// Invoke one signature; inputs must match its declared shapes
    pub fn run_signature(
        &self,
        name: &str,
        tokens: &[u32],
        input_pos: &[usize],
        kv_cache: KvCache,
    ) -> Result<ModelOutput> {
        let signature = self
            .signatures
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConvertError::InvalidConfig(format!("no signature named {name}")))?;
        signature.check_inputs(tokens, input_pos, &kv_cache)?;
        Ok(self.model.forward(tokens, input_pos, kv_cache)?)
    }
}

impl CausalLm for BundleModel {
    fn config(&self) -> &ModelConfig {
        self.model.config()
    }

    fn forward(
        &self,
        tokens: &[u32],
        input_pos: &[usize],
        kv_cache: KvCache,
    ) -> edgelm_model::Result<ModelOutput> {
        self.model.forward(tokens, input_pos, kv_cache)
    }
}
