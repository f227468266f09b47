//! Verify the reauthored TinyLlama-1.1B-Chat against the original checkpoint

use clap::Parser;
use edgelm_harness::{init_logging, ModelDefaults, VerifyArgs};
use edgelm_model::families::tiny_llama;

const DEFAULTS: ModelDefaults = ModelDefaults {
    prompts: &["Show me the program to add 2 and 3."],
    ..ModelDefaults::new("TinyLlama/TinyLlama-1.1B-Chat-v1.0", 1e-4)
};

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = VerifyArgs::parse();
    let report = args.run(&DEFAULTS, tiny_llama::build_model)?;
    std::process::exit(args.exit_code(&report));
}
