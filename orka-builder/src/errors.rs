//! Error types shared by the control-plane client, the retry wrapper and the
//! build steps.
//!
//! Errors fall into a handful of categories that the pipeline treats
//! differently:
//! - `WatchSubscription`: the event stream broke; the only retried category
//! - `ResourceFailed`: a VM, image or push job reached a terminal failure
//! - `Kube` / `Http` / `Api`: a request to the control plane failed
//! - `Config`: invalid configuration or policy violation
//! - `Provision`: a command run on the builder VM failed
//! - `Cancelled` / `Timeout`: the build was aborted or a deadline elapsed

use std::time::Duration;

use thiserror::Error;

pub type OrkaResult<T> = Result<T, OrkaError>;

#[derive(Debug, Error)]
pub enum OrkaError {
    /// The watch channel closed or errored before a terminal state was seen.
    #[error("watch subscription error: {0}")]
    WatchSubscription(String),

    /// A resource reached a terminal failure state. The message is surfaced verbatim.
    #[error("{0}")]
    ResourceFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("control plane error: {0}")]
    Kube(kube::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response from an HTTP endpoint.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// A command run on the builder VM failed.
    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("deadline exceeded after {0:?}")]
    Timeout(Duration),

    #[error("build cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<OrkaError>,
    },
}

impl OrkaError {
    /// Wrap this error with a message describing what was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        OrkaError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through `Context` wrappers.
    pub fn root(&self) -> &OrkaError {
        match self {
            OrkaError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_watch_subscription(&self) -> bool {
        matches!(self.root(), OrkaError::WatchSubscription(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), OrkaError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), OrkaError::Cancelled)
    }
}

impl From<kube::Error> for OrkaError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => OrkaError::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 => OrkaError::Conflict(resp.message.clone()),
            _ => OrkaError::Kube(err),
        }
    }
}

/// Treat `NotFound` as success, for "delete if exists" call sites.
pub fn ignore_not_found(result: OrkaResult<()>) -> OrkaResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_kube_status_codes_map_to_categories() {
        assert!(OrkaError::from(api_error(404)).is_not_found());
        assert!(matches!(OrkaError::from(api_error(409)), OrkaError::Conflict(_)));
        assert!(matches!(OrkaError::from(api_error(500)), OrkaError::Kube(_)));
    }

    #[test]
    fn test_context_preserves_category() {
        let err = OrkaError::WatchSubscription("closed".into()).context("waiting for VM");
        assert!(err.is_watch_subscription());
        assert_eq!(
            err.to_string(),
            "waiting for VM: watch subscription error: closed"
        );

        let err = OrkaError::Cancelled.context("a").context("b");
        assert!(err.is_cancelled());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(OrkaError::NotFound("image".into()))).is_ok());
        assert!(ignore_not_found(Err(OrkaError::Internal("boom".into()))).is_err());
        assert!(ignore_not_found(Ok(())).is_ok());
    }
}
