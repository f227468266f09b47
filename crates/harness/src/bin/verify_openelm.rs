//! Verify the reauthored OpenELM-3B, tokenized with Llama 2's tokenizer

use clap::Parser;
use edgelm_harness::{init_logging, ModelDefaults, VerifyArgs};
use edgelm_model::families::openelm;

const DEFAULTS: ModelDefaults = ModelDefaults {
    tokenizer_checkpoint: Some("meta-llama/Llama-2-7b-hf"),
    ..ModelDefaults::new("apple/OpenELM-3B", 1e-5)
};

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = VerifyArgs::parse();
    let report = args.run(&DEFAULTS, openelm::build_model)?;
    std::process::exit(args.exit_code(&report));
}
