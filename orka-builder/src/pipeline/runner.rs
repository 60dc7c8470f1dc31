//! Linear step runner.
//!
//! Runs steps in order against one [`BuildContext`] and stops advancing as
//! soon as the context holds an error or the build is cancelled. Every step
//! whose `run` was invoked then gets its `cleanup`, in reverse order.

use std::time::{Duration, Instant};

use super::context::BuildContext;
use super::metrics::{PipelineMetrics, StepMetrics};
use super::step::{BoxedStep, StepAction};
use crate::errors::OrkaError;

pub struct StepRunner {
    steps: Vec<BoxedStep>,
    cleanup_timeout: Duration,
}

impl StepRunner {
    /// `cleanup_timeout` bounds each cleanup call on its own. Cleanups are not
    /// tied to the build's cancellation token, so a cancelled build still
    /// gets to remove what it created.
    pub fn new(steps: Vec<BoxedStep>, cleanup_timeout: Duration) -> Self {
        Self {
            steps,
            cleanup_timeout,
        }
    }

    pub async fn run(mut self, ctx: &mut BuildContext) -> PipelineMetrics {
        let total_start = Instant::now();
        let mut metrics = Vec::new();

        for step in self.steps.iter_mut() {
            if ctx.should_stop() {
                break;
            }

            let name = step.name().to_string();
            tracing::info!(step = %name, "Running step");
            let run_start = Instant::now();
            let action = step.run(ctx).await;

            metrics.push(StepMetrics {
                name: name.clone(),
                action,
                run_duration_ms: run_start.elapsed().as_millis(),
                cleanup_duration_ms: None,
            });

            if action == StepAction::Halt {
                if ctx.error().is_none() && !ctx.is_cancelled() {
                    ctx.record_error(OrkaError::Internal(format!(
                        "step {name} halted without reporting an error"
                    )));
                }
                tracing::info!(step = %name, "Step halted the build");
                break;
            }
        }

        // Record a cancellation no step observed before cleaning up, so
        // cleanup errors never replace it.
        if ctx.is_cancelled() && ctx.error().is_none() {
            tracing::info!("Build cancelled between steps");
            ctx.record_error(OrkaError::Cancelled);
        }

        let executed = metrics.len();
        for (index, step) in self.steps[..executed].iter_mut().enumerate().rev() {
            let name = step.name().to_string();
            tracing::debug!(step = %name, "Cleaning up step");
            let cleanup_start = Instant::now();

            if tokio::time::timeout(self.cleanup_timeout, step.cleanup(ctx))
                .await
                .is_err()
            {
                let err = OrkaError::Timeout(self.cleanup_timeout)
                    .context(format!("cleanup of step {name}"));
                tracing::warn!(step = %name, error = %err, "Cleanup did not finish in time");
                ctx.ui().error(&err.to_string());
                ctx.record_error(err);
            }

            metrics[index].cleanup_duration_ms = Some(cleanup_start.elapsed().as_millis());
        }

        PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            steps: metrics,
        }
    }
}
