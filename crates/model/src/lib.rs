//! edgelm model library
//!
//! HuggingFace checkpoint loading, the reference (original) implementations
//! of the supported families, and the reauthored config-driven
//! decoder-only transformer with an explicit by-value kv cache.

mod checkpoint;
mod config;
mod error;
mod kv_cache;
mod loader;
mod model_config;
mod ops;
mod reference;
mod rope;
mod tensor;
mod tensor_names;
mod tokenizer;
mod transformer;

pub mod families;
pub mod fixtures;

#[cfg(test)]
mod rope_hf_parity;

pub use checkpoint::{resolve_checkpoint, resolve_tokenizer};
pub use config::{
    Architecture, GenerationConfig, HfConfig, TokenIds, CONFIG_NAME, DEFAULT_MAX_LENGTH,
    GENERATION_CONFIG_NAME,
};
pub use error::{ModelError, Result};
pub use kv_cache::{KvCache, KvCacheEntry};
pub use loader::{SafetensorsLoader, WEIGHTS_INDEX_NAME, WEIGHTS_NAME};
pub use model_config::{
    AttentionConfig, FeedForwardConfig, FeedForwardType, ModelConfig, NormalizationConfig,
    NormalizationType, TransformerBlockConfig,
};
pub use ops::Activation;
pub use reference::{ReferenceLm, ReferenceModel};
pub use rope::{rotary_dim, RopeFrequencies};
pub use tensor::{argmax, Logits, StateDict, Tensor};
pub use tensor_names::{load_state_dict, AttentionNames, FeedForwardNames, TensorNames};
pub use tokenizer::{Tokenizer, TOKENIZER_NAME};
pub use transformer::{parameter_shapes, CausalLm, DecoderOnlyModel, ModelOutput};
