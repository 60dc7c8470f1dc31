//! Orka image builder.
//!
//! Provisions a disposable VM on an Orka cluster, runs provisioning commands
//! on it over SSH, captures the result as an image and removes the VM again.
//!
//! ```ignore
//! let builder = Builder::new(config, Arc::new(ConsoleUi::default()))?;
//! match builder.run(CancellationToken::new()).await {
//!     BuildOutcome::Succeeded(artifact) => println!("{artifact}"),
//!     BuildOutcome::Failed(e) => eprintln!("{e}"),
//!     BuildOutcome::Cancelled => {}
//! }
//! ```

pub mod api;
mod artifact;
mod builder;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod retry;
pub mod steps;
mod ui;

#[cfg(test)]
pub(crate) mod testing;

pub use artifact::{Artifact, BUILDER_ID};
pub use builder::{BuildOutcome, Builder};
pub use config::{ApiMode, BuilderConfig};
pub use errors::{OrkaError, OrkaResult};
pub use ui::{ConsoleUi, Ui};
