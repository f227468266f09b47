//! Convert SmolLM-135M into a prefill/decode bundle

use clap::Parser;
use edgelm_convert::{ConvertArgs, ConvertDefaults};
use edgelm_harness::init_logging;
use edgelm_model::families::smollm;

const DEFAULTS: ConvertDefaults = ConvertDefaults {
    checkpoint: "~/Downloads/llm_data/smollm",
    output_path_prefix: "/tmp/smollm",
};

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = ConvertArgs::parse();
    let path = args.run(&DEFAULTS, smollm::build_model)?;
    tracing::info!("Bundle written to {}", path.display());
    Ok(())
}
