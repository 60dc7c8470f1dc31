//! Shared state of one build.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::step::StepAction;
use crate::config::BuilderConfig;
use crate::errors::{OrkaError, OrkaResult};
use crate::ui::Ui;

/// State threaded through every step of a build.
///
/// Facts produced by one step for later ones are plain typed fields. The
/// terminal error is private so it can only be recorded once.
pub struct BuildContext {
    config: Arc<BuilderConfig>,
    ui: Arc<dyn Ui>,
    cancel: CancellationToken,

    /// Externally reachable address of the builder VM.
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    /// Identity of the builder VM, used to confirm the build produced one.
    pub vm_id: Option<String>,

    error: Option<OrkaError>,
}

impl BuildContext {
    pub fn new(config: Arc<BuilderConfig>, ui: Arc<dyn Ui>, cancel: CancellationToken) -> Self {
        Self {
            config,
            ui,
            cancel,
            ssh_host: None,
            ssh_port: None,
            vm_id: None,
            error: None,
        }
    }

    pub fn config(&self) -> &Arc<BuilderConfig> {
        &self.config
    }

    pub fn ui(&self) -> &dyn Ui {
        self.ui.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn error(&self) -> Option<&OrkaError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<OrkaError> {
        self.error.take()
    }

    /// Whether the runner must stop invoking `run` on further steps.
    pub fn should_stop(&self) -> bool {
        self.error.is_some() || self.is_cancelled()
    }

    /// Record `err`, unless an earlier error is already recorded.
    pub fn record_error(&mut self, err: OrkaError) {
        match &self.error {
            None => self.error = Some(err),
            Some(first) => {
                tracing::warn!(first = %first, dropped = %err, "Build already failed, keeping the first error");
            }
        }
    }

    /// Report `err` to the user, record it and halt the pipeline.
    pub fn halt(&mut self, err: OrkaError) -> StepAction {
        if err.is_cancelled() {
            self.ui.say("Build cancelled");
        } else {
            self.ui.error(&err.to_string());
        }
        self.record_error(err);
        StepAction::Halt
    }

    /// Run `fut` unless the build is cancelled first.
    pub async fn cancellable<T, F>(&self, fut: F) -> OrkaResult<T>
    where
        F: Future<Output = OrkaResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OrkaError::Cancelled),
            result = fut => result,
        }
    }

    /// Published SSH endpoint, once a step has provided both halves.
    pub fn ssh_endpoint(&self) -> Option<(&str, u16)> {
        Some((self.ssh_host.as_deref()?, self.ssh_port?))
    }
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("vm_id", &self.vm_id)
            .field("error", &self.error)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingUi;

    fn context() -> (BuildContext, Arc<RecordingUi>) {
        let ui = Arc::new(RecordingUi::default());
        let ctx = BuildContext::new(
            Arc::new(BuilderConfig::default()),
            ui.clone(),
            CancellationToken::new(),
        );
        (ctx, ui)
    }

    #[test]
    fn test_first_error_wins() {
        let (mut ctx, ui) = context();
        assert!(!ctx.should_stop());

        assert_eq!(ctx.halt(OrkaError::ResourceFailed("disk allocation error".into())), StepAction::Halt);
        ctx.record_error(OrkaError::Internal("cleanup failed".into()));

        assert!(ctx.should_stop());
        assert_eq!(ctx.error().unwrap().to_string(), "disk allocation error");
        assert_eq!(ui.errors(), vec!["disk allocation error".to_string()]);
    }

    #[test]
    fn test_cancelled_halt_is_not_reported_as_error() {
        let (mut ctx, ui) = context();
        ctx.halt(OrkaError::Cancelled);
        assert!(ui.errors().is_empty());
        assert!(ctx.error().unwrap().is_cancelled());
    }

    #[test]
    fn test_ssh_endpoint_requires_both_halves() {
        let (mut ctx, _) = context();
        ctx.ssh_host = Some("10.0.0.5".into());
        assert_eq!(ctx.ssh_endpoint(), None);
        ctx.ssh_port = Some(8823);
        assert_eq!(ctx.ssh_endpoint(), Some(("10.0.0.5", 8823)));
    }

    #[tokio::test]
    async fn test_cancellable_unblocks_on_cancel() {
        let (ctx, _) = context();
        ctx.cancel_token().cancel();
        let result: OrkaResult<()> = ctx.cancellable(std::future::pending()).await;
        assert!(matches!(result, Err(OrkaError::Cancelled)));
        assert!(ctx.should_stop());
    }
}
