//! Orka control-plane access.
//!
//! ## Architecture
//!
//! ```text
//! ControlPlane (trait) ← OrkaClient ─┬─ kube::Client   (VM / Image / Pod resources + watches)
//!                                    └─ reqwest::Client (cluster discovery, VM push)
//!
//! LegacyApi (trait)    ← LegacyClient ── reqwest::Client (token-authenticated REST)
//! ```
//!
//! Waits consume one watch subscription at a time through [`watch`]; broken
//! subscriptions are re-opened by [`crate::retry`].

mod client;
pub mod legacy;
pub mod types;
mod watch;

#[cfg(test)]
pub use client::MockControlPlane;
pub use client::{ControlPlane, IMAGE_WAIT_TIMEOUT, OrkaClient, PUSH_WAIT_TIMEOUT};
pub use legacy::{LegacyApi, LegacyClient};
pub use types::{
    DESCRIPTION_ANNOTATION_KEY, Image, ImageSpec, ImageState, ImageStatus, SourceType,
    VirtualMachineInstance, VirtualMachineInstanceSpec, VirtualMachineInstanceStatus, VmEndpoint,
    VmPhase,
};
