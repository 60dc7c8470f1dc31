//! Legacy Orka REST API.
//!
//! Older Orka deployments manage VMs through token-authenticated JSON
//! endpoints instead of cluster resources. Only the calls the legacy create
//! step needs are modelled.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{Method, StatusCode};
use semver::Version;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::errors::{OrkaError, OrkaResult};

/// Last server version that issues a single shared token per user. Tokens
/// from these servers are revoked after the build.
pub const SINGLE_TOKEN_VERSION: Version = Version::new(2, 1, 1);

#[derive(Debug, Clone, Serialize)]
pub struct TokenLoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenLoginResponse {
    pub message: String,
    pub token: String,
    pub errors: Vec<ApiErrorEntry>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiErrorEntry {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageCopyRequest {
    pub image: String,
    pub new_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageDeleteRequest {
    pub image: String,
}

/// VM configuration registered before deployment.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VmCreateRequest {
    pub orka_vm_name: String,
    pub orka_base_image: String,
    pub orka_image: String,
    pub orka_cpu_core: u32,
    pub vcpu_count: u32,
    pub io_boost: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmNameRequest {
    pub orka_vm_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmDeployResponse {
    pub vm_id: String,
    pub ip: String,
    /// Reported as a string by the server.
    pub ssh_port: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct MessageResponse {
    message: String,
    errors: Vec<ApiErrorEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HealthCheckResponse {
    version: String,
}

/// Calls against the legacy REST API. Everything but `login` and
/// `server_version` is authenticated with the token `login` returned.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LegacyApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> OrkaResult<String>;

    async fn copy_image(&self, token: &str, image: &str, new_name: &str) -> OrkaResult<()>;

    async fn delete_image(&self, token: &str, image: &str) -> OrkaResult<()>;

    async fn create_vm_config(&self, token: &str, request: &VmCreateRequest) -> OrkaResult<()>;

    async fn deploy_vm(&self, token: &str, vm_name: &str) -> OrkaResult<VmDeployResponse>;

    async fn purge_vm(&self, token: &str, vm_name: &str) -> OrkaResult<()>;

    /// Version string reported by `/health-check`.
    async fn server_version(&self) -> OrkaResult<String>;

    async fn revoke_token(&self, token: &str) -> OrkaResult<()>;
}

/// `LegacyApi` over HTTP.
#[derive(Debug, Clone)]
pub struct LegacyClient {
    http: reqwest::Client,
    endpoint: String,
}

impl LegacyClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// Send a JSON request and return the status and raw body.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<&B>,
    ) -> OrkaResult<(StatusCode, Vec<u8>)> {
        let url = format!("{}/{}", self.endpoint, path);
        tracing::debug!(method = %method, url = %url, "Legacy API request");

        let mut request = self.http.request(method, &url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body.to_vec()))
    }

    /// Fail unless `status` equals `expected`, folding any server messages into the error.
    fn expect_status(status: StatusCode, expected: StatusCode, body: &[u8]) -> OrkaResult<()> {
        if status == expected {
            return Ok(());
        }
        let parsed: MessageResponse = parse_body(body);
        Err(OrkaError::Api {
            status: status.as_u16(),
            message: describe_failure(status, &parsed.message, &parsed.errors),
        })
    }
}

fn describe_failure(status: StatusCode, message: &str, errors: &[ApiErrorEntry]) -> String {
    let mut parts = vec![format!("Error response from Orka API [{status}]")];
    if !message.is_empty() {
        parts.push(message.to_string());
    }
    parts.extend(
        errors
            .iter()
            .filter(|e| !e.message.is_empty())
            .map(|e| e.message.clone()),
    );
    parts.join(": ")
}

/// Lenient decode for bodies whose content is informational only.
fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> T {
    serde_json::from_slice(body).unwrap_or_default()
}

#[async_trait]
impl LegacyApi for LegacyClient {
    async fn login(&self, email: &str, password: &str) -> OrkaResult<String> {
        let request = TokenLoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let (status, body) = self
            .send(Method::POST, "token", None, Some(&request))
            .await
            .map_err(|e| e.context("Error while logging into the Orka API"))?;
        Self::expect_status(status, StatusCode::OK, &body)?;

        let response: TokenLoginResponse = parse_body(&body);
        if response.token.is_empty() {
            return Err(OrkaError::Api {
                status: status.as_u16(),
                message: describe_failure(status, "login returned no token", &response.errors),
            });
        }
        Ok(response.token)
    }

    async fn copy_image(&self, token: &str, image: &str, new_name: &str) -> OrkaResult<()> {
        let request = ImageCopyRequest {
            image: image.to_string(),
            new_name: new_name.to_string(),
        };
        let (status, body) = self
            .send(Method::POST, "resources/image/copy", Some(token), Some(&request))
            .await?;
        Self::expect_status(status, StatusCode::OK, &body)
    }

    async fn delete_image(&self, token: &str, image: &str) -> OrkaResult<()> {
        let request = ImageDeleteRequest {
            image: image.to_string(),
        };
        let (status, body) = self
            .send(Method::DELETE, "resources/image/delete", Some(token), Some(&request))
            .await?;
        Self::expect_status(status, StatusCode::OK, &body)
    }

    async fn create_vm_config(&self, token: &str, request: &VmCreateRequest) -> OrkaResult<()> {
        let (status, body) = self
            .send(Method::POST, "resources/vm/create", Some(token), Some(request))
            .await?;
        Self::expect_status(status, StatusCode::CREATED, &body)
    }

    async fn deploy_vm(&self, token: &str, vm_name: &str) -> OrkaResult<VmDeployResponse> {
        let request = VmNameRequest {
            orka_vm_name: vm_name.to_string(),
        };
        let (status, body) = self
            .send(Method::POST, "resources/vm/deploy", Some(token), Some(&request))
            .await?;
        Self::expect_status(status, StatusCode::OK, &body)
            .map_err(|e| e.context("Error from API while deploying Orka VM"))?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn purge_vm(&self, token: &str, vm_name: &str) -> OrkaResult<()> {
        let request = VmNameRequest {
            orka_vm_name: vm_name.to_string(),
        };
        let (status, body) = self
            .send(Method::DELETE, "resources/vm/purge", Some(token), Some(&request))
            .await?;
        Self::expect_status(status, StatusCode::OK, &body)
    }

    async fn server_version(&self) -> OrkaResult<String> {
        let (status, body) = self
            .send::<()>(Method::GET, "health-check", None, None)
            .await?;
        Self::expect_status(status, StatusCode::OK, &body)?;
        let response: HealthCheckResponse = parse_body(&body);
        Ok(response.version)
    }

    async fn revoke_token(&self, token: &str) -> OrkaResult<()> {
        let (status, body) = self
            .send::<()>(Method::DELETE, "token", Some(token), None)
            .await?;
        Self::expect_status(status, StatusCode::OK, &body)
    }
}

/// Parse a server-reported version, tolerating a leading `v` and missing
/// minor or patch components.
fn parse_server_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    let (core, suffix) = raw.split_at(raw.find(['-', '+']).unwrap_or(raw.len()));
    let mut core = core.to_string();
    for _ in core.split('.').count()..3 {
        core.push_str(".0");
    }
    Version::parse(&format!("{core}{suffix}")).ok()
}

/// Whether a server reporting `version` needs its token revoked after use.
///
/// Unparseable versions are treated as new servers.
pub fn requires_token_revocation(version: &str) -> bool {
    parse_server_version(version).is_some_and(|server| server <= SINGLE_TOKEN_VERSION)
}
