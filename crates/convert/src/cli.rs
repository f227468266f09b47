//! Command line arguments shared by the `convert_*` binaries

use std::path::{Path, PathBuf};

use clap::Parser;
use edgelm_model::DecoderOnlyModel;

use crate::config::{ExportConfig, DEFAULT_KV_CACHE_MAX_LEN, DEFAULT_PREFILL_SEQ_LEN};
use crate::error::Result;
use crate::export::convert_to_bundle;

/// Per-model checkpoint and output prefix used when unset
#[derive(Debug, Clone, Copy)]
pub struct ConvertDefaults {
    /// `~/` is expanded against `$HOME`
    pub checkpoint: &'static str,
    pub output_path_prefix: &'static str,
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Export a reauthored model as a prefill/decode bundle")]
pub struct ConvertArgs {
    /// Local checkpoint directory or hub id
    #[arg(short, long)]
    pub checkpoint: Option<String>,

    /// Output path prefix; the bundle name is derived from it
    #[arg(short, long)]
    pub output_path_prefix: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_PREFILL_SEQ_LEN)]
    pub prefill_seq_len: usize,

    #[arg(long, default_value_t = DEFAULT_KV_CACHE_MAX_LEN)]
    pub kv_cache_max_len: usize,

    /// Store 2-D weights as int8 with per-row scales
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub quantize: bool,
}

/// Expand a leading `~/`
pub fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => Path::new(&home).join(rest).display().to_string(),
        _ => path.to_string(),
    }
}

impl ConvertArgs {
    pub fn export_config(&self) -> ExportConfig {
        ExportConfig {
            prefill_seq_len: self.prefill_seq_len,
            kv_cache_max_len: self.kv_cache_max_len,
            quantize: self.quantize,
        }
    }

    /// Checkpoint and output prefix after applying `defaults`
    pub fn resolve(&self, defaults: &ConvertDefaults) -> (String, PathBuf) {
        let checkpoint = self
            .checkpoint
            .clone()
            .unwrap_or_else(|| expand_home(defaults.checkpoint));
        let prefix = self
            .output_path_prefix
            .clone()
            .unwrap_or_else(|| PathBuf::from(defaults.output_path_prefix));
        (checkpoint, prefix)
    }

    pub fn run<F>(&self, defaults: &ConvertDefaults, build_model: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path, usize) -> edgelm_model::Result<DecoderOnlyModel>,
    {
        let (checkpoint, prefix) = self.resolve(defaults);
        convert_to_bundle(&checkpoint, build_model, &prefix, &self.export_config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEMMA: ConvertDefaults = ConvertDefaults {
        checkpoint: "~/Downloads/llm_data/gemma-2b",
        output_path_prefix: "/tmp/gemma",
    };

    #[test]
    fn test_defaults() {
        let args = ConvertArgs::parse_from(["convert_gemma_to_bundle"]);
        assert_eq!(args.export_config(), ExportConfig::default());
        let (checkpoint, prefix) = args.resolve(&GEMMA);
        assert!(checkpoint.ends_with("Downloads/llm_data/gemma-2b"));
        assert_eq!(prefix, PathBuf::from("/tmp/gemma"));
    }

    #[test]
    fn test_overrides() {
        let args = ConvertArgs::parse_from([
            "convert_gemma_to_bundle",
            "--checkpoint",
            "google/gemma-2b",
            "--output-path-prefix",
            "/out/g",
            "--prefill-seq-len",
            "128",
            "--quantize",
            "false",
        ]);
        let config = args.export_config();
        assert_eq!(config.prefill_seq_len, 128);
        assert!(!config.quantize);
        let (checkpoint, prefix) = args.resolve(&GEMMA);
        assert_eq!(checkpoint, "google/gemma-2b");
        assert_eq!(prefix, PathBuf::from("/out/g"));
    }

    #[test]
    fn test_expand_home_leaves_other_paths() {
        assert_eq!(expand_home("/abs/path"), "/abs/path");
        assert_eq!(expand_home("org/model"), "org/model");
    }
}
