//! Greedy decode loop over a reauthored model
//!
//! The kv cache is created once per call and moved through every forward
//! pass; each step re-runs the whole sequence from position 0.

use edgelm_model::{argmax, CausalLm, KvCache, Logits};
use tracing::debug;

use crate::error::{HarnessError, Result};

/// Run `model` over `tokens` at positions `0..tokens.len()`
pub fn forward<M: CausalLm + ?Sized>(
    model: &M,
    tokens: &[u32],
    kv_cache: KvCache,
) -> Result<(Logits, KvCache)> {
    let input_pos: Vec<usize> = (0..tokens.len()).collect();
    let output = model.forward(tokens, &input_pos, kv_cache)?;
    Ok((output.logits, output.kv_cache))
}

/// Extend `prompt_tokens` greedily until it holds `target_len` tokens.
///
/// Returns the prompt unchanged when it is already at least `target_len`
/// long.
pub fn generate<M: CausalLm + ?Sized>(
    model: &M,
    prompt_tokens: &[u32],
    target_len: usize,
) -> Result<Vec<u32>> {
    let mut kv_cache = KvCache::from_model_config(model.config());
    let mut tokens = prompt_tokens.to_vec();

    while tokens.len() < target_len {
        let (logits, updated) = forward(model, &tokens, kv_cache)?;
        kv_cache = updated;

        let last = logits
            .last_row()
            .ok_or_else(|| HarnessError::InvalidInput("model returned no logits".into()))?;
        let next = argmax(last).ok_or_else(|| {
            HarnessError::InvalidInput(format!("no comparable logit at step {}", tokens.len()))
        })?;
        debug!(step = tokens.len(), token = next, "greedy step");
        tokens.push(next as u32);
    }

    Ok(tokens)
}
