//! Verify the reauthored Gemma-2B against the original checkpoint

use clap::Parser;
use edgelm_harness::{init_logging, ModelDefaults, VerifyArgs};
use edgelm_model::families::gemma;

const DEFAULTS: ModelDefaults = ModelDefaults::new("google/gemma-2b", 1e-4);

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = VerifyArgs::parse();
    let report = args.run(&DEFAULTS, gemma::build_model)?;
    std::process::exit(args.exit_code(&report));
}
