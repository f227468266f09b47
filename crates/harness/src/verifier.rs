//! Equivalence checks between an original model and its reauthored version
//!
//! Two comparators: a single forward pass compared logit by logit under an
//! absolute tolerance, and a full greedy generation compared as decoded text.
//! A mismatch is a `false` result, never an error.

use std::path::Path;

use edgelm_model::{
    resolve_checkpoint, resolve_tokenizer, CausalLm, KvCache, ReferenceLm, ReferenceModel,
    Tokenizer,
};
use tracing::{info, warn};

use crate::error::{HarnessError, Result};
use crate::generate::{forward, generate};

pub const DEFAULT_PROMPTS_FOR_VERIFICATION: &[&str] = &["What is the meaning of life?"];
pub const DEFAULT_KV_CACHE_MAX_LEN: usize = 1024;
pub const DEFAULT_ATOL: f32 = 1e-5;
pub const DEFAULT_INPUT_IDS: &[u32] = &[1, 2, 3, 4];

/// Settings for [`verify_reauthored_transformers`]
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub prompts: Vec<String>,
    pub atol: f32,
    /// Defaults to the model checkpoint when unset
    pub tokenizer_checkpoint: Option<String>,
    pub kv_cache_max_len: usize,
    pub input_ids: Vec<u32>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            prompts: DEFAULT_PROMPTS_FOR_VERIFICATION
                .iter()
                .map(|p| p.to_string())
                .collect(),
            atol: DEFAULT_ATOL,
            tokenizer_checkpoint: None,
            kv_cache_max_len: DEFAULT_KV_CACHE_MAX_LEN,
            input_ids: DEFAULT_INPUT_IDS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationReport {
    pub logits_match: bool,
    pub generation_match: bool,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.logits_match && self.generation_match
    }
}

/// Largest element-wise absolute difference; NaN if either side has one
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, |acc, d| if d.is_nan() || acc.is_nan() { f32::NAN } else { acc.max(d) })
}

/// Element-wise `|a - b| <= atol`. NaN anywhere fails.
pub fn all_close(a: &[f32], b: &[f32], atol: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= atol)
}

/// First and last three values, numpy style
fn summarize(values: &[f32]) -> String {
    let fmt = |vs: &[f32]| {
        vs.iter()
            .map(|v| format!("{v:.6}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    if values.len() <= 6 {
        format!("[{}]", fmt(values))
    } else {
        format!(
            "[{}, ..., {}]",
            fmt(&values[..3]),
            fmt(&values[values.len() - 3..])
        )
    }
}

fn log_check(passed: bool) {
    if passed {
        info!("PASS");
    } else {
        warn!("FAILED");
    }
}

/// Compare the logits at the last input position.
///
/// `input_ids` is zero-padded to `kv_cache_max_len` and both models run once
/// over the full buffer: the original through its own forward, the
/// reauthored one with a fresh cache.
pub fn verify_with_input_ids<O, R>(
    original: &O,
    reauthored: &R,
    input_ids: &[u32],
    kv_cache_max_len: usize,
    atol: f32,
) -> Result<bool>
where
    O: ReferenceLm + ?Sized,
    R: CausalLm + ?Sized,
{
    if input_ids.is_empty() {
        return Err(HarnessError::InvalidInput("input_ids is empty".into()));
    }
    if input_ids.len() > kv_cache_max_len {
        return Err(HarnessError::InvalidInput(format!(
            "{} input ids do not fit a kv cache of length {kv_cache_max_len}",
            input_ids.len()
        )));
    }
    let vocab_size = reauthored.config().vocab_size;
    if original.vocab_size() != vocab_size {
        return Err(HarnessError::ShapeMismatch {
            what: "vocab_size",
            original: original.vocab_size(),
            reauthored: vocab_size,
        });
    }

    let mut tokens = vec![0u32; kv_cache_max_len];
    tokens[..input_ids.len()].copy_from_slice(input_ids);
    let last = input_ids.len() - 1;

    info!("Forwarding the original model...");
    let original_logits = original.forward(&tokens)?;
    let original_row = original_logits
        .row(last)
        .ok_or_else(|| HarnessError::InvalidInput(format!("original model has no row {last}")))?;
    info!("logits_original: {}", summarize(original_row));

    info!("Forwarding the reauthored model...");
    let kv_cache = KvCache::from_model_config(reauthored.config());
    let (reauthored_logits, _) = forward(reauthored, &tokens, kv_cache)?;
    let reauthored_row = reauthored_logits
        .row(last)
        .ok_or_else(|| HarnessError::InvalidInput(format!("reauthored model has no row {last}")))?;
    info!("logits_reauthored: {}", summarize(reauthored_row));

    if original_row.len() != reauthored_row.len() {
        return Err(HarnessError::ShapeMismatch {
            what: "logits",
            original: original_row.len(),
            reauthored: reauthored_row.len(),
        });
    }

    info!(
        max_abs_diff = max_abs_diff(original_row, reauthored_row),
        atol, "compared logits"
    );
    Ok(all_close(original_row, reauthored_row, atol))
}

/// Compare greedy generations for `prompts` as decoded text.
///
/// The original model decides the output length through its own
/// generation config; the reauthored model is then decoded to that length.
pub fn verify_model_with_prompts<O, R>(
    original: &O,
    reauthored: &R,
    tokenizer: &Tokenizer,
    prompts: &str,
) -> Result<bool>
where
    O: ReferenceLm + ?Sized,
    R: CausalLm + ?Sized,
{
    let prompt_tokens = tokenizer.encode(prompts, true)?;

    info!("Generating answer with the original model...");
    let outputs_original = original.generate(&prompt_tokens)?;
    let response_original = tokenizer.decode(&outputs_original, false)?;
    info!("outputs from original model: [[{response_original}]]");

    info!("Generating answer with the reauthored model...");
    let outputs_reauthored = generate(reauthored, &prompt_tokens, outputs_original.len())?;
    let response_reauthored = tokenizer.decode(&outputs_reauthored, false)?;
    info!("outputs from reauthored model: [[{response_reauthored}]]");

    Ok(response_original == response_reauthored)
}

/// Load both models from `checkpoint` and run both comparators.
///
/// `build_model` receives a local checkpoint directory and the kv cache
/// length. Each check logs `PASS` or `FAILED`; a failed check does not stop
/// the next one.
pub fn verify_reauthored_transformers<M, F>(
    checkpoint: &str,
    build_model: F,
    options: &VerifyOptions,
) -> Result<VerificationReport>
where
    M: CausalLm,
    F: FnOnce(&Path, usize) -> edgelm_model::Result<M>,
{
    info!("Loading the original model from: {checkpoint}");
    let checkpoint_dir = resolve_checkpoint(checkpoint)?;
    let original = ReferenceModel::from_pretrained(&checkpoint_dir)?;

    info!("Building the reauthored model from: {}", checkpoint_dir.display());
    let reauthored = build_model(&checkpoint_dir, options.kv_cache_max_len)?;

    info!("Verifying the reauthored model with input IDs: {:?}", options.input_ids);
    let logits_match = verify_with_input_ids(
        &original,
        &reauthored,
        &options.input_ids,
        options.kv_cache_max_len,
        options.atol,
    )?;
    log_check(logits_match);

    let tokenizer_checkpoint = options
        .tokenizer_checkpoint
        .as_deref()
        .unwrap_or(checkpoint);
    info!("Loading the tokenizer from: {tokenizer_checkpoint}");
    let tokenizer = Tokenizer::from_file(resolve_tokenizer(tokenizer_checkpoint)?)?;

    let mut generation_match = true;
    for prompt in &options.prompts {
        info!("Verifying the reauthored model with prompts: {prompt}");
        let matched = verify_model_with_prompts(&original, &reauthored, &tokenizer, prompt)?;
        log_check(matched);
        generation_match &= matched;
    }

    Ok(VerificationReport {
        logits_match,
        generation_match,
    })
}
