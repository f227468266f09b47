//! Verify the reauthored Phi-2 against the original checkpoint

use clap::Parser;
use edgelm_harness::{init_logging, ModelDefaults, VerifyArgs};
use edgelm_model::families::phi2;

const DEFAULTS: ModelDefaults = ModelDefaults::new("microsoft/phi-2", 1e-3);

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = VerifyArgs::parse();
    let report = args.run(&DEFAULTS, phi2::build_model)?;
    std::process::exit(args.exit_code(&report));
}
