//! edgelm verification harness
//!
//! Greedy decoding over the reauthored model, the logits and generated-text
//! comparators against the original model, and the orchestration shared by
//! the `verify_*` binaries.

pub mod cli;
mod error;
mod generate;
pub mod logging;
mod verifier;

pub use cli::{ModelDefaults, VerifyArgs};
pub use error::{HarnessError, Result};
pub use generate::{forward, generate};
pub use logging::init_logging;
pub use verifier::{
    all_close, max_abs_diff, verify_model_with_prompts, verify_reauthored_transformers,
    verify_with_input_ids, VerificationReport, VerifyOptions, DEFAULT_ATOL, DEFAULT_INPUT_IDS,
    DEFAULT_KV_CACHE_MAX_LEN, DEFAULT_PROMPTS_FOR_VERIFICATION,
};
