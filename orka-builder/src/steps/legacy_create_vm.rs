//! Builder VM creation through the legacy Orka REST API.

use std::sync::Arc;

use async_trait::async_trait;

use super::create_vm::reachable_host;
use crate::api::legacy::{LegacyApi, VmCreateRequest, requires_token_revocation};
use crate::config::BuilderConfig;
use crate::errors::{OrkaError, OrkaResult};
use crate::pipeline::{BuildContext, Step, StepAction, StepState};

/// Logs in, optionally pre-copies the source image to the destination name,
/// then creates and deploys the builder VM. Purges the VM on cleanup.
///
/// With pre-copy the builder VM boots from the copy, so the copy is the
/// resulting image.
pub struct LegacyCreateVmStep {
    api: Arc<dyn LegacyApi>,
    token: Option<String>,
    precopied: bool,
    state: StepState,
}

impl LegacyCreateVmStep {
    pub fn new(api: Arc<dyn LegacyApi>) -> Self {
        Self {
            api,
            token: None,
            precopied: false,
            state: StepState::NotRun,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Pre-copy (when enabled) and return the image the VM should boot from.
    async fn prepare_image(&mut self, ctx: &BuildContext, token: &str) -> OrkaResult<String> {
        let config = ctx.config();

        if !config.image_precopy {
            ctx.ui().say(&format!(
                "Builder VM configuration will use base image [{}]",
                config.source_image
            ));
            return Ok(config.source_image.clone());
        }
        if config.no_create_image {
            ctx.ui()
                .say("Skipping source image pre-copy because of 'no_create_image' being set");
            return Ok(config.source_image.clone());
        }

        ctx.ui().say(&format!(
            "Pre-copying source image [{}] to destination image [{}]",
            config.source_image, config.image_name
        ));
        ctx.ui().say(
            "This can take awhile depending on how big the source image is - please wait...",
        );
        ctx.cancellable(
            self.api
                .copy_image(token, &config.source_image, &config.image_name),
        )
        .await
        .map_err(|e| e.context("failed to pre-copy the source image"))?;

        self.precopied = true;
        ctx.ui().say("Image copied");
        ctx.ui().say(&format!(
            "Builder VM configuration will use pre-copied base image [{}]",
            config.image_name
        ));
        Ok(config.image_name.clone())
    }

    async fn revoke_token_if_needed(&self, ctx: &BuildContext, token: &str) {
        ctx.ui().say("Checking if token should be revoked");
        let version = match self.api.server_version().await {
            Ok(version) => version,
            Err(e) => {
                ctx.ui()
                    .error(&format!("failed to query the Orka API version: {e}"));
                return;
            }
        };
        if !requires_token_revocation(&version) {
            tracing::debug!(version = %version, "Server issues per-session tokens, not revoking");
            return;
        }

        ctx.ui().say("Revoking orka user token");
        match self.api.revoke_token(token).await {
            Ok(()) => ctx.ui().say("Revoked orka user token"),
            Err(e) => ctx
                .ui()
                .error(&format!("failed to revoke orka user token: {e}")),
        }
    }
}

pub(crate) fn vm_create_request(config: &BuilderConfig, base_image: &str) -> VmCreateRequest {
    VmCreateRequest {
        orka_vm_name: config.orka_vm_builder_name.clone(),
        orka_base_image: base_image.to_string(),
        orka_image: config.orka_vm_builder_name.clone(),
        orka_cpu_core: config.orka_vm_cpu_core,
        vcpu_count: config.orka_vm_cpu_core,
        io_boost: config.orka_vm_builder_enable_io_boost,
        tag: config.orka_vm_tag.clone(),
    }
}

#[async_trait]
impl Step for LegacyCreateVmStep {
    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let config = ctx.config().clone();

        ctx.ui().say("Logging into Orka API endpoint");
        let token = match ctx
            .cancellable(self.api.login(&config.orka_user, &config.orka_password))
            .await
        {
            Ok(token) => token,
            Err(e) => return ctx.halt(e),
        };
        ctx.ui().say("Logged in with token");
        self.token = Some(token.clone());

        let base_image = match self.prepare_image(ctx, &token).await {
            Ok(image) => image,
            Err(e) => {
                self.state = StepState::Failed;
                return ctx.halt(e);
            }
        };

        let name = config.orka_vm_builder_name.as_str();
        ctx.ui()
            .say(&format!("Creating a Builder VM configuration [{name}]"));
        let request = vm_create_request(&config, &base_image);
        if let Err(e) = ctx
            .cancellable(self.api.create_vm_config(&token, &request))
            .await
        {
            self.state = StepState::Failed;
            return ctx.halt(e.context("failed to create the builder VM configuration"));
        }
        ctx.ui()
            .say(&format!("Created builder VM configuration [{name}]"));

        // The configuration exists from here on; purging removes it along with any VM.
        self.state = StepState::Ran;

        ctx.ui().say(&format!(
            "Creating builder VM based on [{name}] configuration"
        ));
        let deployed = match ctx.cancellable(self.api.deploy_vm(&token, name)).await {
            Ok(deployed) => deployed,
            Err(e) => return ctx.halt(e),
        };

        ctx.vm_id = Some(deployed.vm_id.clone());
        ctx.ui().say(&format!("Created VM [{}]", deployed.vm_id));

        let ssh_port: u16 = match deployed.ssh_port.trim().parse() {
            Ok(port) => port,
            Err(_) => {
                return ctx.halt(OrkaError::Internal(format!(
                    "Orka API reported an invalid SSH port [{}]",
                    deployed.ssh_port
                )));
            }
        };
        let host = match reachable_host(&config, &deployed.ip) {
            Ok(host) => host,
            Err(e) => return ctx.halt(e),
        };
        if host != deployed.ip {
            ctx.ui().say(&format!(
                "Found Internal VM IP in map [{} -> {}]",
                deployed.ip, host
            ));
        }

        ctx.ui()
            .say(&format!("SSH server will be available at [{host}:{ssh_port}]"));
        ctx.ssh_host = Some(host);
        ctx.ssh_port = Some(ssh_port);

        StepAction::Continue
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) {
        let Some(token) = self.token.clone() else {
            return;
        };
        let config = ctx.config().clone();

        if config.no_delete_vm {
            ctx.ui().say(
                "We are skipping the deletion of the builder VM and its configuration because of no_delete_vm being set",
            );
            if self.precopied {
                ctx.ui().say(&format!(
                    "Pre-copy was performed: image {} will be left and not removed",
                    config.image_name
                ));
            }
            return;
        }

        match self.state {
            StepState::NotRun => {}
            StepState::Failed => {
                if self.precopied {
                    ctx.ui()
                        .say(&format!("Cleaning up pre-copied image {}", config.image_name));
                    match self.api.delete_image(&token, &config.image_name).await {
                        Ok(()) => ctx.ui().say("Image deleted"),
                        Err(e) => {
                            ctx.ui()
                                .error(&format!("Image could not be deleted [{e}]"));
                            return;
                        }
                    }
                }
                ctx.ui().say(
                    "Nothing to cleanup because the builder VM creation, deployment and/or provisioning failed.",
                );
            }
            StepState::Ran => {
                ctx.ui().say("Removing builder VM and its configuration...");
                match self.api.purge_vm(&token, &config.orka_vm_builder_name).await {
                    Ok(()) => ctx.ui().say("Builder VM and configuration purged"),
                    Err(e) => {
                        let e = e.context("failed to purge builder VM");
                        ctx.ui().error(&e.to_string());
                        ctx.record_error(e);
                    }
                }
                self.revoke_token_if_needed(ctx, &token).await;
            }
        }
    }

    fn name(&self) -> &str {
        "legacy_create_vm"
    }
}
