//! Build steps.
//!
//! The default pipeline is `[CreateVm, Connect, Provision, CreateImage]`; the
//! legacy API pipeline swaps `CreateVm` for `LegacyCreateVm` and drops
//! `CreateImage`.

mod connect;
mod create_image;
mod create_vm;
mod legacy_create_vm;
mod provision;
pub mod publish;

pub use connect::ConnectStep;
pub use create_image::{CreateImageStep, IMAGE_SAVE_TIMEOUT};
pub use create_vm::CreateVmStep;
pub use legacy_create_vm::LegacyCreateVmStep;
pub use provision::ShellProvisionStep;
pub use publish::{PublishStrategy, select_strategy};
