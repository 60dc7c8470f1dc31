//! Watch-stream interpretation.
//!
//! Each wait operation owns one watch stream and consumes events until a
//! terminal state shows up. A stream that ends, yields a transport error, or
//! delivers an in-band error event maps to `OrkaError::WatchSubscription`,
//! which the retry wrapper answers by re-subscribing.

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::core::WatchEvent;

use super::types::{Image, ImageState, VirtualMachineInstance, VmEndpoint, VmPhase};
use crate::errors::{OrkaError, OrkaResult};

/// Terminal observation of a builder VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VmObservation {
    Running(VmEndpoint),
    Failed(String),
}

/// Consume `events` until `classify` reports a terminal outcome.
pub(crate) async fn next_terminal<K, T, S, F>(
    events: &mut S,
    resource: &str,
    mut classify: F,
) -> OrkaResult<T>
where
    S: Stream<Item = kube::Result<WatchEvent<K>>> + Unpin,
    F: FnMut(WatchEvent<K>) -> Option<OrkaResult<T>>,
{
    while let Some(item) = events.next().await {
        let event = match item {
            Ok(WatchEvent::Bookmark(_)) => continue,
            Ok(WatchEvent::Error(resp)) => {
                return Err(OrkaError::WatchSubscription(format!(
                    "{} watch returned {} ({})",
                    resource, resp.code, resp.message
                )));
            }
            Ok(event) => event,
            Err(e) => {
                return Err(OrkaError::WatchSubscription(format!(
                    "{} watch stream failed: {}",
                    resource, e
                )));
            }
        };

        if let Some(outcome) = classify(event) {
            return outcome;
        }
    }

    Err(OrkaError::WatchSubscription(format!(
        "{} watcher closed unexpectedly",
        resource
    )))
}

pub(crate) fn classify_vm(
    event: WatchEvent<VirtualMachineInstance>,
) -> Option<OrkaResult<VmObservation>> {
    let vmi = match event {
        WatchEvent::Added(vmi) | WatchEvent::Modified(vmi) | WatchEvent::Deleted(vmi) => vmi,
        _ => return None,
    };
    let status = vmi.status.unwrap_or_default();

    tracing::debug!(phase = ?status.phase, host_ip = %status.host_ip, "VM watch event");

    match status.phase {
        VmPhase::Pending => None,
        VmPhase::Running => Some(match status.ssh_port {
            Some(ssh_port) => Ok(VmObservation::Running(VmEndpoint {
                host_ip: status.host_ip,
                ssh_port,
            })),
            None => Err(OrkaError::ResourceFailed(
                "VM reported Running without an SSH port".to_string(),
            )),
        }),
        VmPhase::Failed => Some(Ok(VmObservation::Failed(status.error_message))),
    }
}

pub(crate) fn classify_image(event: WatchEvent<Image>) -> Option<OrkaResult<()>> {
    let image = match event {
        WatchEvent::Added(image) | WatchEvent::Modified(image) | WatchEvent::Deleted(image) => {
            image
        }
        _ => return None,
    };

    match image.state() {
        ImageState::Updating => None,
        ImageState::Ready => Some(Ok(())),
        ImageState::Failed => {
            let message = image
                .status
                .map(|s| s.error_message)
                .unwrap_or_default();
            Some(Err(OrkaError::ResourceFailed(message)))
        }
    }
}

pub(crate) fn classify_push_pod(event: WatchEvent<Pod>) -> Option<OrkaResult<()>> {
    let pod = match event {
        WatchEvent::Deleted(_) => {
            return Some(Err(OrkaError::ResourceFailed(
                "push pod was deleted".to_string(),
            )));
        }
        WatchEvent::Added(pod) | WatchEvent::Modified(pod) => pod,
        _ => return None,
    };

    let status = pod.status.unwrap_or_default();
    match status.phase.as_deref() {
        Some("Succeeded") => Some(Ok(())),
        Some("Failed") => Some(Err(OrkaError::ResourceFailed(format!(
            "failed to save image: {}",
            status.message.unwrap_or_default()
        )))),
        _ => None,
    }
}
