//! Convert Gemma-2B into a prefill/decode bundle

use clap::Parser;
use edgelm_convert::{ConvertArgs, ConvertDefaults};
use edgelm_harness::init_logging;
use edgelm_model::families::gemma;

const DEFAULTS: ConvertDefaults = ConvertDefaults {
    checkpoint: "~/Downloads/llm_data/gemma-2b",
    output_path_prefix: "/tmp/gemma",
};

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = ConvertArgs::parse();
    let path = args.run(&DEFAULTS, gemma::build_model)?;
    tracing::info!("Bundle written to {}", path.display());
    Ok(())
}
