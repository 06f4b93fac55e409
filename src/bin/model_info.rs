use anyhow::Context;
use clap::Parser;

use effnet_export::config::Settings;
use effnet_export::{logging, pipeline};

/// Prints the layer hierarchy of pretrained EfficientNet-B0 without its classifier.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {}

fn main() -> anyhow::Result<()> {
    let _cli = Cli::parse();

    let settings = Settings::new().context("Failed to load configuration")?;
    logging::init(&settings.logging).map_err(|e| anyhow::anyhow!(e))?;

    let model = pipeline::acquire_model(&settings).context("Failed to acquire the pretrained model")?;
    let truncated = pipeline::without_classifier(model);

    for line in pipeline::layer_listing(&truncated) {
        println!("{}", line);
    }
    Ok(())
}
