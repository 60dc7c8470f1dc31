//! Linear build pipeline.
//!
//! ## Architecture
//!
//! ```text
//! StepRunner → [Step, Step, ...] → BuildContext
//!
//! - StepRunner: runs steps in order, then cleans up in reverse
//! - Step: run + cleanup unit of work
//! - BuildContext: typed state shared by all steps of one build
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let mut ctx = BuildContext::new(config, ui, cancel);
//! let steps: Vec<BoxedStep> = vec![Box::new(CreateVmStep::new(client.clone())), ...];
//! let metrics = StepRunner::new(steps, cleanup_timeout).run(&mut ctx).await;
//! println!("build took {}ms", metrics.total_duration_ms);
//! ```

mod context;
mod metrics;
mod runner;
mod step;

pub use context::BuildContext;
pub use metrics::{PipelineMetrics, StepMetrics};
pub use runner::StepRunner;
pub use step::{BoxedStep, Step, StepAction, StepState};
