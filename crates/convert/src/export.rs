//! Export of a reauthored model into a multi-signature bundle

use std::path::{Path, PathBuf};

use edgelm_model::{resolve_checkpoint, CausalLm, DecoderOnlyModel};
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use tracing::{debug, info};

use crate::bundle::{BundleMetadata, FORMAT_VERSION, SCALE_SUFFIX};
use crate::config::ExportConfig;
use crate::error::Result;
use crate::quantize::{quantize_per_channel, QuantScheme};
use crate::signature::Signature;

struct EncodedTensor {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn encode_state_dict(model: &DecoderOnlyModel, scheme: QuantScheme) -> Result<Vec<EncodedTensor>> {
    let mut encoded = Vec::new();
    for (name, tensor) in model.state_dict() {
        if scheme == QuantScheme::Int8PerChannel && tensor.shape().len() == 2 {
            let quantized = quantize_per_channel(&tensor)?;
            debug!(
                name = %name,
                bytes = quantized.size_bytes(),
                "quantized weight"
            );
            encoded.push(EncodedTensor {
                name: format!("{name}{SCALE_SUFFIX}"),
                dtype: Dtype::F32,
                shape: vec![quantized.scales.len()],
                bytes: f32_bytes(&quantized.scales),
            });
            encoded.push(EncodedTensor {
                name,
                dtype: Dtype::I8,
                shape: quantized.shape,
                bytes: quantized.data.iter().map(|&q| q as u8).collect(),
            });
        } else {
            encoded.push(EncodedTensor {
                name,
                dtype: Dtype::F32,
                shape: tensor.shape().to_vec(),
                bytes: f32_bytes(tensor.data()),
            });
        }
    }
    Ok(encoded)
}

/// Write `model` to `{prefix}_{q8|f32}_seq{N}_ekv{M}.safetensors`, returning the path
pub fn export_model(
    model: &DecoderOnlyModel,
    output_path_prefix: &Path,
    config: &ExportConfig,
) -> Result<PathBuf> {
    config.validate()?;
    config.check_model(model.config())?;

    let scheme = config.quant_scheme();
    let metadata = BundleMetadata {
        format_version: FORMAT_VERSION,
        quantization: scheme,
        model_config: model.config().clone(),
        signatures: vec![
            Signature::prefill(model.config(), config.prefill_seq_len),
            Signature::decode(model.config()),
        ],
    };

    let tensors = encode_state_dict(model, scheme)?;
    let views = tensors
        .iter()
        .map(|t| {
            TensorView::new(t.dtype, t.shape.clone(), &t.bytes).map(|view| (t.name.clone(), view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let path = config.output_path(output_path_prefix);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    safetensors::serialize_to_file(views, &Some(metadata.to_map()?), &path)?;

    info!(
        path = %path.display(),
        tensors = tensors.len(),
        quantization = %scheme,
        "Exported bundle"
    );
    Ok(path)
}

/// Build the reauthored model for `checkpoint` and export it
pub fn convert_to_bundle<F>(
    checkpoint: &str,
    build_model: F,
    output_path_prefix: &Path,
    config: &ExportConfig,
) -> Result<PathBuf>
where
    F: FnOnce(&Path, usize) -> edgelm_model::Result<DecoderOnlyModel>,
{
    config.validate()?;
    let checkpoint_dir = resolve_checkpoint(checkpoint)?;
    info!(
        checkpoint = %checkpoint_dir.display(),
        kv_cache_max_len = config.kv_cache_max_len,
        "Building reauthored model"
    );
    let model = build_model(&checkpoint_dir, config.kv_cache_max_len)?;
    export_model(&model, output_path_prefix, config)
}
