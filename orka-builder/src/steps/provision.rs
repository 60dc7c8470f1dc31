//! Run inline shell commands on the builder VM over SSH.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::CommunicatorConfig;
use crate::errors::{OrkaError, OrkaResult};
use crate::pipeline::{BuildContext, Step, StepAction};

/// Runs each configured inline command through the system `ssh` client, then
/// flushes the VM's disk so the image captures every change.
#[derive(Debug, Default)]
pub struct ShellProvisionStep;

impl ShellProvisionStep {
    pub fn new() -> Self {
        Self
    }
}

/// Output of a remote command.
#[derive(Debug)]
struct RemoteOutput {
    status: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Build the `ssh` invocation for `remote_command`.
///
/// Key authentication is used when a key file is configured; otherwise the
/// password is handed to `sshpass` through its environment.
pub(crate) fn ssh_command(
    comm: &CommunicatorConfig,
    host: &str,
    port: u16,
    remote_command: &str,
) -> Command {
    let mut cmd = match &comm.ssh_private_key_file {
        Some(key) => {
            let mut cmd = Command::new("ssh");
            cmd.arg("-i").arg(key).args(["-o", "BatchMode=yes"]);
            cmd
        }
        None => {
            let mut cmd = Command::new("sshpass");
            cmd.env("SSHPASS", &comm.ssh_password).args(["-e", "ssh"]);
            cmd
        }
    };

    cmd.arg("-p")
        .arg(port.to_string())
        .args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "ConnectTimeout=30",
        ])
        .arg(format!("{}@{}", comm.ssh_username, host))
        .arg(remote_command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

async fn run_remote(
    comm: &CommunicatorConfig,
    host: &str,
    port: u16,
    remote_command: &str,
) -> OrkaResult<RemoteOutput> {
    tracing::debug!(host = %host, port = port, command = %remote_command, "Running remote command");
    let output = ssh_command(comm, host, port, remote_command)
        .output()
        .await
        .map_err(|e| OrkaError::Io(e).context("failed to start ssh"))?;

    Ok(RemoteOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn describe_status(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("status code {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl ShellProvisionStep {
    async fn provision(&self, ctx: &BuildContext, host: &str, port: u16) -> OrkaResult<()> {
        let comm = &ctx.config().communicator;

        for command in &ctx.config().provisioner.inline {
            ctx.ui()
                .say(&format!("Provisioning with shell command: {command}"));
            let output = ctx.cancellable(run_remote(comm, host, port, command)).await?;
            for line in output.stdout.lines() {
                ctx.ui().say(line);
            }
            if output.status != Some(0) {
                return Err(OrkaError::Provision(format!(
                    "command {command:?} exited with {}; stdErr={:?}",
                    describe_status(output.status),
                    output.stderr.trim_end()
                )));
            }
        }

        ctx.ui().say("Syncing disk changes...");
        let output = ctx.cancellable(run_remote(comm, host, port, "sync")).await?;
        if output.status != Some(0) {
            return Err(OrkaError::Provision(format!(
                "failed to sync disk changes: {}; stdErr={:?}",
                describe_status(output.status),
                output.stderr.trim_end()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Step for ShellProvisionStep {
    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let Some((host, port)) = ctx.ssh_endpoint().map(|(h, p)| (h.to_string(), p)) else {
            return ctx.halt(OrkaError::Internal(
                "no SSH endpoint was published for the builder VM".to_string(),
            ));
        };

        match self.provision(ctx, &host, port).await {
            Ok(()) => StepAction::Continue,
            Err(e) => ctx.halt(e),
        }
    }

    async fn cleanup(&mut self, _ctx: &mut BuildContext) {}

    fn name(&self) -> &str {
        "provision"
    }
}
