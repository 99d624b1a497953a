use clap::{CommandFactory, Parser};
use efficientnet_backbone::checkpoint::strip_checkpoint_file;
use efficientnet_backbone::init_tracing;

/// Create a checkpoint with only model weight information
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Training checkpoint (model, optimizer, scheduler, iteration)
    #[arg(short, long)]
    input: Option<String>,

    /// Output model file
    #[arg(short, long, default_value = "model_deploy.safetensors")]
    output: String,
}

fn main() -> anyhow::Result<()> {
    if std::env::args().len() < 3 {
        Args::command().print_help()?;
        return Ok(());
    }
    let args = Args::parse();
    init_tracing();

    let input = args
        .input
        .ok_or_else(|| anyhow::anyhow!("--input is required"))?;
    tracing::info!(%input, output = %args.output, "stripping training state");
    strip_checkpoint_file(&input, &args.output)?;
    println!("Saved to {}", args.output);

    Ok(())
}
