//! Convert TinyLlama-1.1B-Chat into a prefill/decode bundle

use clap::Parser;
use edgelm_convert::{ConvertArgs, ConvertDefaults};
use edgelm_harness::init_logging;
use edgelm_model::families::tiny_llama;

const DEFAULTS: ConvertDefaults = ConvertDefaults {
    checkpoint: "~/Downloads/llm_data/tiny_llama",
    output_path_prefix: "/tmp/tiny_llama",
};

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = ConvertArgs::parse();
    let path = args.run(&DEFAULTS, tiny_llama::build_model)?;
    tracing::info!("Bundle written to {}", path.display());
    Ok(())
}
