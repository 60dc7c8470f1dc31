//! Orka resource definitions.
//!
//! Only the fields the builder reads or writes are modelled; unknown fields
//! returned by the control plane are ignored on deserialization.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation holding the human-readable description of a saved image.
pub const DESCRIPTION_ANNOTATION_KEY: &str = "orka.macstadium.com/description";

/// Label identifying the kind of job a pod belongs to.
pub const ORKA_JOB_TYPE_LABEL: &str = "orka.macstadium.com/job.type";

/// `ORKA_JOB_TYPE_LABEL` value carried by registry push pods.
pub const ORKA_JOB_TYPE_REGISTRY_PUSH: &str = "registry-push";

/// Label the job controller puts on every pod it creates.
pub const JOB_NAME_LABEL: &str = "batch.kubernetes.io/job-name";

// ============================================================================
// VIRTUAL MACHINE INSTANCE
// ============================================================================

/// Desired state of an Orka VM.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "orka.macstadium.com",
    version = "v1",
    kind = "VirtualMachineInstance",
    plural = "virtualmachineinstances",
    shortname = "vmi",
    status = "VirtualMachineInstanceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Source image the VM boots from.
    pub image: String,

    pub cpu: u32,

    /// Node affinity tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Fail scheduling when no node carries `tag`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_required: Option<bool>,

    #[serde(default, rename = "legacyIO", skip_serializing_if = "Option::is_none")]
    pub legacy_io: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_boost: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VmPhase {
    #[default]
    Pending,
    Running,
    Failed,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    #[serde(default)]
    pub phase: VmPhase,

    #[serde(default, rename = "hostIP")]
    pub host_ip: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,

    #[serde(default)]
    pub error_message: String,
}

// ============================================================================
// IMAGE
// ============================================================================

/// Where an image's content comes from.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SourceType {
    Local,
    Remote,
    #[default]
    Vm,
    Generated,
    UserUpload,
}

/// Desired state of an Orka image.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "orka.macstadium.com",
    version = "v1",
    kind = "Image",
    plural = "images",
    status = "ImageStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Name of the source resource (the builder VM for saves).
    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub source_namespace: String,

    #[serde(default)]
    pub source_type: SourceType,

    /// Name of the image being produced.
    #[serde(default)]
    pub destination: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ImageState {
    #[default]
    Updating,
    Ready,
    Failed,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    #[serde(default)]
    pub state: ImageState,

    #[serde(default)]
    pub error_message: String,
}

impl Image {
    /// Observed state, treating a missing status as still updating.
    pub fn state(&self) -> ImageState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

// ============================================================================
// VM PUSH
// ============================================================================

/// Body of `POST /api/v1/namespaces/{ns}/vms/{name}/push`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmPushRequest {
    pub image_reference: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmPushResponse {
    pub job_name: String,
}

/// Reachable SSH endpoint of a running VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmEndpoint {
    pub host_ip: String,
    pub ssh_port: u16,
}
