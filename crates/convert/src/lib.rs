//! edgelm conversion
//!
//! Exports a reauthored model as a single safetensors bundle carrying a
//! `prefill` and a `decode` signature, optionally with int8 weights, and
//! reads such bundles back into a runnable model.

mod bundle;
pub mod cli;
mod config;
mod error;
mod export;
mod quantize;
mod signature;

pub use bundle::{BundleMetadata, BundleModel, EdgeBundle, FORMAT_VERSION, SCALE_SUFFIX};
pub use cli::{ConvertArgs, ConvertDefaults};
pub use config::{ExportConfig, BUNDLE_EXTENSION, DEFAULT_KV_CACHE_MAX_LEN, DEFAULT_PREFILL_SEQ_LEN};
pub use error::{ConvertError, Result};
pub use export::{convert_to_bundle, export_model};
pub use quantize::{dequantize, quantize_per_channel, QuantScheme, QuantizedTensor};
pub use signature::{Signature, TensorDtype, TensorSpec, DECODE_SIGNATURE, PREFILL_SIGNATURE};
