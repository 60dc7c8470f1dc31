//! Control-plane client.
//!
//! `ControlPlane` is the seam every build step talks through. `OrkaClient`
//! implements it with typed resource access over the Orka cluster API plus a
//! plain HTTP client for the Orka endpoints that are not resources (cluster
//! discovery and VM push).

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::Api;
use kube::api::{DeleteParams, PostParams, WatchParams};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::types::{
    Image, JOB_NAME_LABEL, ORKA_JOB_TYPE_LABEL, ORKA_JOB_TYPE_REGISTRY_PUSH,
    VirtualMachineInstance, VmEndpoint, VmPushRequest, VmPushResponse,
};
use super::watch::{VmObservation, classify_image, classify_push_pod, classify_vm, next_terminal};
use crate::config::DEFAULT_ORKA_NAMESPACE;
use crate::errors::{OrkaError, OrkaResult, ignore_not_found};
use crate::retry::{RetryPolicy, retry_on_watch_error};

/// Ceiling for a single image save to become Ready.
pub const IMAGE_WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Ceiling for a registry push job to finish.
pub const PUSH_WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Operations the build steps need from the Orka control plane.
///
/// Waits take the build's cancellation token and re-subscribe on broken
/// watches internally; every other call is cancelled by dropping its future.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_vm(&self, vm: &VirtualMachineInstance) -> OrkaResult<()>;

    async fn get_vm(&self, namespace: &str, name: &str) -> OrkaResult<VirtualMachineInstance>;

    async fn delete_vm(&self, namespace: &str, name: &str) -> OrkaResult<()>;

    async fn create_image(&self, image: &Image) -> OrkaResult<()>;

    async fn get_image(&self, namespace: &str, name: &str) -> OrkaResult<Image>;

    async fn delete_image(&self, namespace: &str, name: &str) -> OrkaResult<()>;

    /// Wait for the VM to reach Running and return its SSH endpoint.
    ///
    /// A VM that reaches Failed is deleted (best effort) and its error message
    /// returned.
    async fn wait_for_vm(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> OrkaResult<VmEndpoint>;

    /// Wait for a saved image in the default namespace to become Ready.
    async fn wait_for_image(&self, name: &str, cancel: &CancellationToken) -> OrkaResult<()>;

    /// Ask the control plane to push the VM's disk to an OCI registry.
    ///
    /// Returns the name of the job performing the push.
    async fn push_vm_image(
        &self,
        namespace: &str,
        vm_name: &str,
        image_reference: &str,
    ) -> OrkaResult<String>;

    /// Wait for the registry push pod of `job_name` to finish.
    async fn wait_for_push(
        &self,
        namespace: &str,
        job_name: &str,
        cancel: &CancellationToken,
    ) -> OrkaResult<()>;
}

// ============================================================================
// CLUSTER DISCOVERY
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterInfo {
    api_endpoint: String,
    #[serde(default)]
    api_domain: String,
    #[serde(default)]
    cert_data: String,
}

/// Decode every certificate block of a PEM bundle to DER.
fn pem_to_der(bundle: &str) -> OrkaResult<Vec<Vec<u8>>> {
    let blocks = ::pem::parse_many(bundle.as_bytes())
        .map_err(|e| OrkaError::Config(format!("Invalid cluster certificate: {e}")))?;
    Ok(blocks.iter().map(|block| block.contents().to_vec()).collect())
}

/// Delete a VM that reached Failed and build the error reported for it.
///
/// The delete is best effort; its failure is appended to the VM's message.
async fn discard_failed_vm(
    client: &dyn ControlPlane,
    namespace: &str,
    name: &str,
    message: String,
) -> OrkaError {
    tracing::warn!(vm = %name, namespace = %namespace, error = %message, "VM failed, deleting it");
    let message = match ignore_not_found(client.delete_vm(namespace, name).await) {
        Ok(()) => message,
        Err(e) => format!("{message} (deleting the failed VM also failed: {e})"),
    };
    OrkaError::ResourceFailed(message)
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Resolve the Orka endpoint host to its first address.
async fn lookup_endpoint_ip(orka_endpoint: &str) -> Option<IpAddr> {
    let url = url::Url::parse(orka_endpoint).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default().unwrap_or(443);
    let mut addrs = tokio::net::lookup_host((host, port)).await.ok()?;
    addrs.next().map(|addr| addr.ip())
}

// ============================================================================
// ORKA CLIENT
// ============================================================================

/// `ControlPlane` backed by the Orka cluster API.
#[derive(Clone)]
pub struct OrkaClient {
    kube: kube::Client,
    http: reqwest::Client,
    orka_endpoint: String,
    auth_token: String,
}

impl OrkaClient {
    /// Discover the cluster API behind `orka_endpoint` and connect to it.
    pub async fn connect(orka_endpoint: &str, auth_token: &str) -> OrkaResult<Self> {
        let orka_endpoint = orka_endpoint.trim_end_matches('/').to_string();
        let http = reqwest::Client::new();

        let info: ClusterInfo = http
            .get(format!("{orka_endpoint}/api/v1/cluster-info"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tracing::debug!(
            api_endpoint = %info.api_endpoint,
            api_domain = %info.api_domain,
            "Discovered Orka cluster API"
        );

        let mut host = info.api_endpoint.clone();
        let mut tls_server_name = None;

        // Public deployments expose the API server by IP and serve a
        // certificate for the API domain.
        if !info.api_domain.is_empty()
            && let Some(ip) = lookup_endpoint_ip(&orka_endpoint).await
            && !is_private(ip)
        {
            host = match ip {
                IpAddr::V4(v4) => format!("https://{v4}"),
                IpAddr::V6(v6) => format!("https://[{v6}]"),
            };
            tls_server_name = Some(info.api_domain.clone());
        }

        let cluster_url = host
            .parse()
            .map_err(|e| OrkaError::Config(format!("Invalid cluster API endpoint '{host}': {e}")))?;
        let mut config = kube::Config::new(cluster_url);
        config.default_namespace = DEFAULT_ORKA_NAMESPACE.to_string();
        config.auth_info.token = Some(auth_token.to_string().into());
        config.tls_server_name = tls_server_name;
        if !info.cert_data.is_empty() {
            config.root_cert = Some(pem_to_der(&info.cert_data)?);
        }

        let kube = kube::Client::try_from(config)?;

        Ok(Self {
            kube,
            http,
            orka_endpoint,
            auth_token: auth_token.to_string(),
        })
    }

    fn vms(&self, namespace: &str) -> Api<VirtualMachineInstance> {
        Api::namespaced(self.kube.clone(), namespace)
    }

    fn images(&self, namespace: &str) -> Api<Image> {
        Api::namespaced(self.kube.clone(), namespace)
    }

    /// One subscription's worth of waiting for a VM.
    async fn watch_vm_once(&self, namespace: &str, name: &str) -> OrkaResult<VmEndpoint> {
        let api = self.vms(namespace);
        let params = WatchParams::default().fields(&format!("metadata.name={name}"));
        let mut events = api.watch(&params, "0").await?.boxed();

        match next_terminal(&mut events, "virtualmachineinstance", classify_vm).await? {
            VmObservation::Running(endpoint) => Ok(endpoint),
            VmObservation::Failed(message) => {
                drop(events);
                Err(discard_failed_vm(self, namespace, name, message).await)
            }
        }
    }

    async fn watch_image_once(&self, name: &str) -> OrkaResult<()> {
        let api = self.images(DEFAULT_ORKA_NAMESPACE);
        let params = WatchParams::default().fields(&format!("metadata.name={name}"));
        let mut events = api.watch(&params, "0").await?.boxed();

        next_terminal(&mut events, "image", classify_image).await
    }

    async fn watch_push_once(&self, namespace: &str, job_name: &str) -> OrkaResult<()> {
        let api: Api<Pod> = Api::namespaced(self.kube.clone(), namespace);
        let params = WatchParams::default().labels(&push_label_selector(job_name));
        let mut events = api
            .watch(&params, "0")
            .await
            .map_err(|e| OrkaError::from(e).context("push watcher failed to initialize"))?
            .boxed();

        next_terminal(&mut events, "pod", classify_push_pod).await
    }
}

/// Label selector matching registry push pods, optionally of one job.
fn push_label_selector(job_name: &str) -> String {
    let mut selector = format!("{ORKA_JOB_TYPE_LABEL}={ORKA_JOB_TYPE_REGISTRY_PUSH}");
    if !job_name.is_empty() {
        selector.push_str(&format!(",{JOB_NAME_LABEL}={job_name}"));
    }
    selector
}

/// Human-readable message of a failed push response.
fn push_error_message(status: u16, body: &[u8]) -> String {
    match serde_json::from_slice::<Status>(body) {
        Ok(parsed) => parsed
            .message
            .unwrap_or_else(|| format!("VM push failed with status code {status}")),
        Err(e) => format!("VM push failed with status code {status} and an unreadable body: {e}"),
    }
}

#[async_trait]
impl ControlPlane for OrkaClient {
    async fn create_vm(&self, vm: &VirtualMachineInstance) -> OrkaResult<()> {
        let namespace = vm.metadata.namespace.as_deref().unwrap_or(DEFAULT_ORKA_NAMESPACE);
        self.vms(namespace).create(&PostParams::default(), vm).await?;
        Ok(())
    }

    async fn get_vm(&self, namespace: &str, name: &str) -> OrkaResult<VirtualMachineInstance> {
        Ok(self.vms(namespace).get(name).await?)
    }

    async fn delete_vm(&self, namespace: &str, name: &str) -> OrkaResult<()> {
        self.vms(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn create_image(&self, image: &Image) -> OrkaResult<()> {
        let namespace = image
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(DEFAULT_ORKA_NAMESPACE);
        self.images(namespace)
            .create(&PostParams::default(), image)
            .await?;
        Ok(())
    }

    async fn get_image(&self, namespace: &str, name: &str) -> OrkaResult<Image> {
        Ok(self.images(namespace).get(name).await?)
    }

    async fn delete_image(&self, namespace: &str, name: &str) -> OrkaResult<()> {
        self.images(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn wait_for_vm(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> OrkaResult<VmEndpoint> {
        let policy = RetryPolicy::new(timeout);
        retry_on_watch_error(&policy, cancel, "wait_for_vm", || {
            self.watch_vm_once(namespace, name)
        })
        .await
    }

    async fn wait_for_image(&self, name: &str, cancel: &CancellationToken) -> OrkaResult<()> {
        let policy = RetryPolicy::new(IMAGE_WAIT_TIMEOUT);
        retry_on_watch_error(&policy, cancel, "wait_for_image", || self.watch_image_once(name))
            .await
    }

    async fn push_vm_image(
        &self,
        namespace: &str,
        vm_name: &str,
        image_reference: &str,
    ) -> OrkaResult<String> {
        let endpoint = format!(
            "{}/api/v1/namespaces/{}/vms/{}/push",
            self.orka_endpoint, namespace, vm_name
        );
        let endpoint = url::Url::parse(&endpoint).map_err(|e| {
            OrkaError::Config(format!("Failed to build VM push endpoint '{endpoint}': {e}"))
        })?;

        let response = self
            .http
            .post(endpoint)
            .bearer_auth(&self.auth_token)
            .json(&VmPushRequest {
                image_reference: image_reference.to_string(),
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if status != reqwest::StatusCode::OK {
            return Err(OrkaError::Api {
                status: status.as_u16(),
                message: push_error_message(status.as_u16(), &body),
            });
        }

        let parsed: VmPushResponse = serde_json::from_slice(&body)?;
        Ok(parsed.job_name)
    }

    async fn wait_for_push(
        &self,
        namespace: &str,
        job_name: &str,
        cancel: &CancellationToken,
    ) -> OrkaResult<()> {
        let policy = RetryPolicy::new(PUSH_WAIT_TIMEOUT);
        retry_on_watch_error(&policy, cancel, "wait_for_push", || {
            self.watch_push_once(namespace, job_name)
        })
        .await
    }
}

impl std::fmt::Debug for OrkaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrkaClient")
            .field("orka_endpoint", &self.orka_endpoint)
            .finish()
    }
}
