//! orka-build
//!
//! Builds an Orka image from a disposable builder VM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use orka_builder::{BuildOutcome, Builder, BuilderConfig, ConsoleUi};

const EXIT_FAILURE: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "orka-build", version, about = "Build an Orka image from a disposable builder VM")]
struct Cli {
    /// Builder configuration (JSON).
    #[arg(short, long)]
    config: PathBuf,

    /// Override the destination image name.
    #[arg(long)]
    image_name: Option<String>,

    /// Keep the builder VM after the build.
    #[arg(long)]
    no_delete_vm: bool,

    /// Provision the VM without capturing an image.
    #[arg(long)]
    no_create_image: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<BuilderConfig> {
        let mut config = BuilderConfig::from_file(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(image_name) = &self.image_name {
            config.image_name = image_name.clone();
        }
        config.no_delete_vm |= self.no_delete_vm;
        config.no_create_image |= self.no_create_image;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    let cli = Cli::parse();
    let ui = Arc::new(ConsoleUi::default());

    let builder = match cli
        .load_config()
        .and_then(|config| Builder::new(config, ui).context("invalid configuration"))
    {
        Ok(builder) => builder,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling build");
            on_interrupt.cancel();
        }
    });

    match builder.run(cancel).await {
        BuildOutcome::Succeeded(artifact) => {
            println!("Build finished. Image: {artifact}");
            ExitCode::SUCCESS
        }
        BuildOutcome::Failed(e) => {
            eprintln!("Build failed: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
        BuildOutcome::Cancelled => {
            eprintln!("Build was cancelled");
            ExitCode::from(EXIT_CANCELLED)
        }
    }
}
