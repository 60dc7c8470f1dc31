//! Wait for the builder VM's SSH port.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::errors::{OrkaError, OrkaResult};
use crate::pipeline::{BuildContext, Step, StepAction};

const PROBE_INTERVAL: Duration = Duration::from_secs(2);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocks until the published SSH endpoint accepts TCP connections.
#[derive(Debug, Default)]
pub struct ConnectStep;

impl ConnectStep {
    pub fn new() -> Self {
        Self
    }
}

/// Probe `host:port` until a connection succeeds or `timeout` elapses.
pub(crate) async fn wait_for_port(host: &str, port: u16, timeout: Duration) -> OrkaResult<()> {
    let probe = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
                Ok(Ok(_)) => return,
                Ok(Err(e)) => {
                    tracing::debug!(host = %host, port = port, attempt = attempt, error = %e, "SSH port not ready");
                }
                Err(_) => {
                    tracing::debug!(host = %host, port = port, attempt = attempt, "SSH port probe timed out");
                }
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    };

    tokio::time::timeout(timeout, probe)
        .await
        .map_err(|_| OrkaError::Timeout(timeout).context(format!("waiting for SSH on {host}:{port}")))
}

#[async_trait]
impl Step for ConnectStep {
    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let Some((host, port)) = ctx.ssh_endpoint().map(|(h, p)| (h.to_string(), p)) else {
            return ctx.halt(OrkaError::Internal(
                "no SSH endpoint was published for the builder VM".to_string(),
            ));
        };

        ctx.ui().say("Waiting for SSH to become available...");
        let timeout = ctx.config().ssh_timeout();
        match ctx.cancellable(wait_for_port(&host, port, timeout)).await {
            Ok(()) => {
                ctx.ui().say("Connected to SSH!");
                StepAction::Continue
            }
            Err(e) => ctx.halt(e),
        }
    }

    async fn cleanup(&mut self, _ctx: &mut BuildContext) {}

    fn name(&self) -> &str {
        "connect"
    }
}
