//! Test doubles shared by unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::BuilderConfig;
use crate::errors::OrkaError;
use crate::pipeline::{BuildContext, Step, StepAction};
use crate::ui::Ui;

/// `Ui` that keeps every message for later assertions.
#[derive(Debug, Default)]
pub struct RecordingUi {
    says: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingUi {
    pub fn says(&self) -> Vec<String> {
        self.says.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn said(&self, needle: &str) -> bool {
        self.says.lock().iter().any(|m| m.contains(needle))
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.says.lock().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}

/// Context over `config` with a recording UI.
pub fn context_with(
    config: BuilderConfig,
    cancel: CancellationToken,
) -> (BuildContext, Arc<RecordingUi>) {
    let ui = Arc::new(RecordingUi::default());
    let ctx = BuildContext::new(Arc::new(config), ui.clone(), cancel);
    (ctx, ui)
}

/// Ordered record of step calls.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

enum RunBehavior {
    Continue,
    Fail(String),
    SilentHalt,
}

/// Step whose behavior is fixed up front.
pub struct ScriptedStep {
    name: String,
    log: EventLog,
    run: RunBehavior,
    cancel_on_run: Option<CancellationToken>,
    cleanup_error: Option<String>,
    hang_in_cleanup: bool,
}

impl ScriptedStep {
    fn new(name: &str, log: &EventLog, run: RunBehavior) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            run,
            cancel_on_run: None,
            cleanup_error: None,
            hang_in_cleanup: false,
        }
    }

    pub fn ok(name: &str, log: &EventLog) -> Self {
        Self::new(name, log, RunBehavior::Continue)
    }

    pub fn failing(name: &str, log: &EventLog, message: &str) -> Self {
        Self::new(name, log, RunBehavior::Fail(message.to_string()))
    }

    pub fn silent_halt(name: &str, log: &EventLog) -> Self {
        Self::new(name, log, RunBehavior::SilentHalt)
    }

    pub fn cancelling(mut self, cancel: CancellationToken) -> Self {
        self.cancel_on_run = Some(cancel);
        self
    }

    pub fn with_cleanup_error(mut self, message: &str) -> Self {
        self.cleanup_error = Some(message.to_string());
        self
    }

    pub fn with_hanging_cleanup(mut self) -> Self {
        self.hang_in_cleanup = true;
        self
    }
}

#[async_trait]
impl Step for ScriptedStep {
    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        self.log.push(format!("run {}", self.name));
        if let Some(cancel) = &self.cancel_on_run {
            cancel.cancel();
        }
        match &self.run {
            RunBehavior::Continue => StepAction::Continue,
            RunBehavior::Fail(message) => ctx.halt(OrkaError::ResourceFailed(message.clone())),
            RunBehavior::SilentHalt => StepAction::Halt,
        }
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) {
        self.log.push(format!("cleanup {}", self.name));
        if self.hang_in_cleanup {
            std::future::pending::<()>().await;
        }
        if let Some(message) = &self.cleanup_error {
            ctx.ui().error(message);
            ctx.record_error(OrkaError::Internal(message.clone()));
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
