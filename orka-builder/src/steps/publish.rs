//! Choice between saving an image on the cluster and pushing it to a registry.

use oci_spec::distribution::Reference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStrategy {
    /// Save the VM disk as a named image in the cluster's image store.
    Save,
    /// Push the VM disk to the OCI registry named by the image reference.
    Push,
}

/// Pick the strategy for a destination image name.
///
/// Names that are fully qualified registry references select `Push`; bare
/// names and `org/image` style short names select `Save`.
pub fn select_strategy(image_name: &str) -> PublishStrategy {
    if is_qualified_reference(image_name) {
        PublishStrategy::Push
    } else {
        PublishStrategy::Save
    }
}

/// Whether `name` is a well-formed reference with an explicit registry host.
fn is_qualified_reference(name: &str) -> bool {
    let Some((domain, remainder)) = name.split_once('/') else {
        return false;
    };
    if remainder.is_empty() {
        return false;
    }
    let explicit_registry = domain.contains('.') || domain.contains(':') || domain == "localhost";
    explicit_registry && name.parse::<Reference>().is_ok()
}
