use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use dropout_risk::logger;
use dropout_risk::training;

/// Fit a logistic dropout model from a labelled CSV sheet and write it as a
/// JSON artifact the server can load.
#[derive(Parser, Debug)]
#[command(name = "train_model", version, about)]
struct Args {
    /// Sheet with nota_final, asistencia, inasistencia, conducta and deserta columns
    #[arg(short, long)]
    input: PathBuf,

    /// Where to write the artifact
    #[arg(short, long, default_value = "models/dropout_model.json")]
    output: PathBuf,

    #[arg(long, default_value_t = 100)]
    max_iterations: u64,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init_cli_logger(args.verbose);

    let set = training::load_training_set(&args.input)
        .with_context(|| format!("failed to read training data from {}", args.input.display()))?;
    let set = training::enhance_data_if_needed(set)?;

    let artifact = training::train_logistic(&set, args.max_iterations).context("training failed")?;
    artifact
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    info!(
        output = %args.output.display(),
        accuracy = artifact.accuracy.unwrap_or_default(),
        "artifact written"
    );
    Ok(())
}
