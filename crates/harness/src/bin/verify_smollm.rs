//! Verify the reauthored SmolLM-135M against the original checkpoint

use clap::Parser;
use edgelm_harness::{init_logging, ModelDefaults, VerifyArgs};
use edgelm_model::families::smollm;

const DEFAULTS: ModelDefaults = ModelDefaults::new("HuggingFaceTB/SmolLM-135M", 1e-4);

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = VerifyArgs::parse();
    let report = args.run(&DEFAULTS, smollm::build_model)?;
    std::process::exit(args.exit_code(&report));
}
