//! Convert Phi-2 into a prefill/decode bundle

use clap::Parser;
use edgelm_convert::{ConvertArgs, ConvertDefaults};
use edgelm_harness::init_logging;
use edgelm_model::families::phi2;

const DEFAULTS: ConvertDefaults = ConvertDefaults {
    checkpoint: "~/Downloads/llm_data/phi2",
    output_path_prefix: "/tmp/phi2",
};

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = ConvertArgs::parse();
    let path = args.run(&DEFAULTS, phi2::build_model)?;
    tracing::info!("Bundle written to {}", path.display());
    Ok(())
}
