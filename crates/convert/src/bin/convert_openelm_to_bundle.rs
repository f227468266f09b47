//! Convert OpenELM-3B into a prefill/decode bundle

use clap::Parser;
use edgelm_convert::{ConvertArgs, ConvertDefaults};
use edgelm_harness::init_logging;
use edgelm_model::families::openelm;

const DEFAULTS: ConvertDefaults = ConvertDefaults {
    checkpoint: "~/Downloads/llm_data/openelm",
    output_path_prefix: "/tmp/openelm",
};

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = ConvertArgs::parse();
    let path = args.run(&DEFAULTS, openelm::build_model)?;
    tracing::info!("Bundle written to {}", path.display());
    Ok(())
}
