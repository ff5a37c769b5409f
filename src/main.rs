//! `pix2pix` CLI - serve or run the sketch-to-image generator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pix2pix::image::OutputFormat;
use pix2pix::{server, Architecture, CheckpointLocation, Config, Generator, Mode, Predictor};

/// Translate sketches into images with a pix2pix generator.
#[derive(Parser, Debug)]
#[command(name = "pix2pix")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve `POST /predict` and the front-end files over HTTP.
    Serve(ServeArgs),
    /// Translate a single image file.
    Predict(PredictArgs),
    /// Write a freshly initialized checkpoint, for smoke tests without trained weights.
    Init(InitArgs),
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Directory holding one sub-directory per model.
    #[arg(long, default_value = "checkpoints", value_name = "DIR")]
    checkpoint_root: PathBuf,

    /// Model name under the checkpoint root.
    #[arg(long, default_value = "pix2pix")]
    model: String,

    /// Checkpoint id within the model directory.
    #[arg(long, default_value = "ckpt-40")]
    checkpoint: String,

    /// Base channel width of the generator.
    #[arg(long, default_value_t = 64, value_name = "INT")]
    base_filters: usize,

    /// Run normalization and dropout in training mode (non-deterministic).
    #[arg(long)]
    training_mode: bool,

    /// Random seed for training-mode dropout.
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,

    /// Output raster format.
    #[arg(long, value_enum, default_value_t = Format::Png)]
    format: Format,

    /// Output JPEG quality (1-100).
    #[arg(short, long, default_value = "95", value_name = "INT")]
    quality: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Png,
    Jpeg,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Directory of static front-end files served at `/`.
    #[arg(long, default_value = "client/public", value_name = "DIR")]
    static_dir: PathBuf,
}

#[derive(Args, Debug)]
struct PredictArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Input image path.
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output image path.
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Checkpoint path to write.
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Base channel width of the generator.
    #[arg(long, default_value_t = 64, value_name = "INT")]
    base_filters: usize,

    /// Random seed for the initial weights.
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,
}

impl ModelArgs {
    fn config(&self) -> Config {
        let output_format = match self.format {
            Format::Png => OutputFormat::Png,
            Format::Jpeg => OutputFormat::Jpeg,
        };

        Config {
            checkpoint: CheckpointLocation::new(&self.checkpoint_root, &self.model, &self.checkpoint),
            base_filters: self.base_filters,
            mode: if self.training_mode {
                Mode::Training
            } else {
                Mode::Evaluation
            },
            seed: self.seed,
            output_format,
            output_quality: self.quality,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pix2pix={log_level},tower_http={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let result = match &cli.command {
        Command::Serve(args) => serve(args),
        Command::Predict(args) => predict(args),
        Command::Init(args) => init(args),
    };

    if let Err(err) = result {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn serve(args: &ServeArgs) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", args.host, args.port))?;

    // The checkpoint is restored before binding: no requests are accepted without weights.
    let predictor = Predictor::new(args.model.config()).context("Failed to initialize predictor")?;

    let static_dir = if args.static_dir.is_dir() {
        Some(args.static_dir.as_path())
    } else {
        tracing::warn!(
            "Static directory {} not found, serving the API only",
            args.static_dir.display()
        );
        None
    };

    let app = server::router(Arc::new(predictor), static_dir);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        server::serve(listener, app).await.context("Server error")
    })
}

fn predict(args: &PredictArgs) -> Result<()> {
    // Validate input file exists
    if !args.input.exists() {
        anyhow::bail!("Input file does not exist: {}", args.input.display());
    }

    let predictor = Predictor::new(args.model.config()).context("Failed to initialize predictor")?;

    predictor
        .process(&args.input, &args.output)
        .context("Failed to process image")?;

    println!(
        "Successfully processed {} -> {}",
        args.input.display(),
        args.output.display()
    );

    Ok(())
}

fn init(args: &InitArgs) -> Result<()> {
    let architecture = Architecture::with_base_filters(args.base_filters)?;
    let mut rng = args
        .seed
        .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);

    let generator =
        Generator::initialized(architecture, &mut rng).context("Failed to initialize generator")?;
    generator
        .save(&args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    println!(
        "Wrote {} parameters to {}",
        architecture.parameter_count(),
        args.output.display()
    );

    Ok(())
}
