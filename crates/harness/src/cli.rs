//! Command line arguments shared by the `verify_*` binaries

use std::path::Path;

use clap::Parser;
use edgelm_model::CausalLm;
use tracing::info;

use crate::error::Result;
use crate::verifier::{
    verify_reauthored_transformers, VerificationReport, VerifyOptions, DEFAULT_INPUT_IDS,
    DEFAULT_KV_CACHE_MAX_LEN, DEFAULT_PROMPTS_FOR_VERIFICATION,
};

/// Per-model values used for arguments left unset
#[derive(Debug, Clone, Copy)]
pub struct ModelDefaults {
    pub checkpoint: &'static str,
    pub tokenizer_checkpoint: Option<&'static str>,
    pub prompts: &'static [&'static str],
    pub atol: f32,
}

impl ModelDefaults {
    pub const fn new(checkpoint: &'static str, atol: f32) -> Self {
        Self {
            checkpoint,
            tokenizer_checkpoint: None,
            prompts: DEFAULT_PROMPTS_FOR_VERIFICATION,
            atol,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Verify a reauthored model against the original checkpoint")]
pub struct VerifyArgs {
    /// Hub id or local directory of the checkpoint
    #[arg(short, long)]
    pub checkpoint: Option<String>,

    /// Tokenizer checkpoint, if different from the model's
    #[arg(long)]
    pub tokenizer_checkpoint: Option<String>,

    /// Prompt for the generation check; repeat for several
    #[arg(short, long = "prompt")]
    pub prompts: Vec<String>,

    /// Absolute tolerance for the logits check
    #[arg(long)]
    pub atol: Option<f32>,

    #[arg(long, default_value_t = DEFAULT_KV_CACHE_MAX_LEN)]
    pub kv_cache_max_len: usize,

    /// Exit with status 1 when a check fails
    #[arg(long)]
    pub fail_on_mismatch: bool,
}

impl VerifyArgs {
    /// Resolve unset arguments against `defaults`, returning the checkpoint and options
    pub fn resolve(&self, defaults: &ModelDefaults) -> (String, VerifyOptions) {
        let checkpoint = self
            .checkpoint
            .clone()
            .unwrap_or_else(|| defaults.checkpoint.to_string());
        let prompts = if self.prompts.is_empty() {
            defaults.prompts.iter().map(|p| p.to_string()).collect()
        } else {
            self.prompts.clone()
        };
        let options = VerifyOptions {
            prompts,
            atol: self.atol.unwrap_or(defaults.atol),
            tokenizer_checkpoint: self
                .tokenizer_checkpoint
                .clone()
                .or_else(|| defaults.tokenizer_checkpoint.map(str::to_string)),
            kv_cache_max_len: self.kv_cache_max_len,
            input_ids: DEFAULT_INPUT_IDS.to_vec(),
        };
        (checkpoint, options)
    }

    /// Run both checks for one model family
    pub fn run<M, F>(&self, defaults: &ModelDefaults, build_model: F) -> Result<VerificationReport>
    where
        M: CausalLm,
        F: FnOnce(&Path, usize) -> edgelm_model::Result<M>,
    {
        let (checkpoint, options) = self.resolve(defaults);
        let report = verify_reauthored_transformers(&checkpoint, build_model, &options)?;
        info!(
            logits_match = report.logits_match,
            generation_match = report.generation_match,
            "verification finished"
        );
        Ok(report)
    }

    /// Process exit status for `report`
    pub fn exit_code(&self, report: &VerificationReport) -> i32 {
        if self.fail_on_mismatch && !report.passed() {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEMMA: ModelDefaults = ModelDefaults::new("google/gemma-2b", 1e-4);

    #[test]
    fn test_defaults_fill_unset_args() {
        let args = VerifyArgs::parse_from(["verify_gemma"]);
        let (checkpoint, options) = args.resolve(&GEMMA);
        assert_eq!(checkpoint, "google/gemma-2b");
        assert_eq!(options.atol, 1e-4);
        assert_eq!(options.kv_cache_max_len, 1024);
        assert_eq!(options.prompts, vec!["What is the meaning of life?".to_string()]);
        assert!(options.tokenizer_checkpoint.is_none());
    }

    #[test]
    fn test_args_override_defaults() {
        let args = VerifyArgs::parse_from([
            "verify_gemma",
            "--checkpoint",
            "/models/gemma",
            "--prompt",
            "one",
            "--prompt",
            "two",
            "--atol",
            "0.5",
            "--tokenizer-checkpoint",
            "/models/tok",
            "--kv-cache-max-len",
            "64",
        ]);
        let (checkpoint, options) = args.resolve(&GEMMA);
        assert_eq!(checkpoint, "/models/gemma");
        assert_eq!(options.prompts, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(options.atol, 0.5);
        assert_eq!(options.tokenizer_checkpoint.as_deref(), Some("/models/tok"));
        assert_eq!(options.kv_cache_max_len, 64);
    }

    #[test]
    fn test_exit_code() {
        let failed = VerificationReport {
            logits_match: false,
            generation_match: true,
        };
        let passed = VerificationReport {
            logits_match: true,
            generation_match: true,
        };
        assert_eq!(VerifyArgs::parse_from(["v"]).exit_code(&failed), 0);
        let strict = VerifyArgs::parse_from(["v", "--fail-on-mismatch"]);
        assert_eq!(strict.exit_code(&failed), 1);
        assert_eq!(strict.exit_code(&passed), 0);
    }
}
