//! Step contract for the build pipeline.

use async_trait::async_trait;

use super::context::BuildContext;

/// What the runner should do after a step's `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    Halt,
}

/// Lifecycle of a step that owns remote state, consulted by its cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepState {
    #[default]
    NotRun,
    /// The step created what it is responsible for removing.
    Ran,
    /// Creation failed; nothing is left behind to remove.
    Failed,
}

/// A unit of pipeline work.
///
/// `run` reports failures through [`BuildContext::halt`]. `cleanup` is called
/// for every step whose `run` was invoked, in reverse order, whatever the
/// build outcome; it decides for itself whether there is anything to undo.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction;

    async fn cleanup(&mut self, ctx: &mut BuildContext);

    /// Get human-readable step name for logging.
    fn name(&self) -> &str;
}

pub type BoxedStep = Box<dyn Step>;
