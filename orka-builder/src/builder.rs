//! Build entry point.
//!
//! [`Builder`] assembles the step pipeline for the configured API mode, runs
//! it and folds the final context into a [`BuildOutcome`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{ControlPlane, LegacyApi, LegacyClient, OrkaClient};
use crate::artifact::Artifact;
use crate::config::{ApiMode, BuilderConfig};
use crate::errors::{OrkaError, OrkaResult};
use crate::pipeline::{BoxedStep, BuildContext, StepRunner};
use crate::steps::{
    ConnectStep, CreateImageStep, CreateVmStep, LegacyCreateVmStep, ShellProvisionStep,
};
use crate::ui::Ui;

/// Result of one build. Exactly one of these is produced per run.
#[derive(Debug)]
pub enum BuildOutcome {
    Succeeded(Artifact),
    Failed(OrkaError),
    /// Aborted by the user. Not an error; cleanup has still run.
    Cancelled,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Succeeded(_))
    }
}

pub struct Builder {
    config: Arc<BuilderConfig>,
    ui: Arc<dyn Ui>,
}

impl Builder {
    /// Validate `config`, filling defaults, and create a builder for it.
    pub fn new(mut config: BuilderConfig, ui: Arc<dyn Ui>) -> OrkaResult<Self> {
        config.prepare()?;
        Ok(Self {
            config: Arc::new(config),
            ui,
        })
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Run a build with the default pipeline for the configured API mode.
    pub async fn run(&self, cancel: CancellationToken) -> BuildOutcome {
        match self.default_steps(&cancel).await {
            Ok(steps) => self.run_steps(steps, cancel).await,
            Err(e) if e.is_cancelled() => BuildOutcome::Cancelled,
            Err(e) => {
                self.ui.error(&e.to_string());
                BuildOutcome::Failed(e)
            }
        }
    }

    /// Default pipeline for the configured API mode.
    pub async fn default_steps(&self, cancel: &CancellationToken) -> OrkaResult<Vec<BoxedStep>> {
        let config = &self.config;

        match config.api_mode {
            ApiMode::Orka3 => {
                self.ui
                    .say(&format!("Connecting to Orka at [{}]", config.orka_endpoint));
                let client = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(OrkaError::Cancelled),
                    client = OrkaClient::connect(&config.orka_endpoint, &config.orka_auth_token) => {
                        client.map_err(|e| e.context("failed to connect to the Orka cluster"))?
                    }
                };
                let client: Arc<dyn ControlPlane> = Arc::new(client);

                let steps: Vec<BoxedStep> = vec![
                    Box::new(CreateVmStep::new(client.clone())),
                    Box::new(ConnectStep::new()),
                    Box::new(ShellProvisionStep::new()),
                    Box::new(CreateImageStep::new(client)),
                ];
                Ok(steps)
            }
            ApiMode::Legacy => {
                let api: Arc<dyn LegacyApi> = Arc::new(LegacyClient::new(&config.orka_endpoint));

                let steps: Vec<BoxedStep> = vec![
                    Box::new(LegacyCreateVmStep::new(api)),
                    Box::new(ConnectStep::new()),
                    Box::new(ShellProvisionStep::new()),
                ];
                Ok(steps)
            }
        }
    }

    /// Run `steps` as one build.
    pub async fn run_steps(&self, steps: Vec<BoxedStep>, cancel: CancellationToken) -> BuildOutcome {
        tracing::info!(
            vm = %self.config.orka_vm_builder_name,
            image = %self.config.image_name,
            steps = steps.len(),
            "Starting build"
        );

        let mut ctx = BuildContext::new(self.config.clone(), self.ui.clone(), cancel);
        let metrics = StepRunner::new(steps, self.config.cleanup_timeout())
            .run(&mut ctx)
            .await;
        metrics.log();

        let outcome = outcome(ctx, &self.config);
        match &outcome {
            BuildOutcome::Succeeded(artifact) => {
                tracing::info!(image = %artifact, "Build succeeded")
            }
            BuildOutcome::Failed(e) => tracing::error!(error = %e, "Build failed"),
            BuildOutcome::Cancelled => tracing::info!("Build cancelled"),
        }
        outcome
    }
}

fn outcome(mut ctx: BuildContext, config: &BuilderConfig) -> BuildOutcome {
    let cancelled = ctx.is_cancelled();
    match ctx.take_error() {
        Some(e) if !e.is_cancelled() => BuildOutcome::Failed(e),
        Some(_) => BuildOutcome::Cancelled,
        None if cancelled => BuildOutcome::Cancelled,
        None if ctx.vm_id.is_none() => {
            BuildOutcome::Failed(OrkaError::Internal("unable to retrieve VM id".to_string()))
        }
        None => BuildOutcome::Succeeded(Artifact::new(config.image_name.clone())),
    }
}
