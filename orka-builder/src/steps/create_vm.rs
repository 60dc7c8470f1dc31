//! Builder VM creation.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ObjectMeta;

use crate::api::{ControlPlane, VirtualMachineInstance, VirtualMachineInstanceSpec};
use crate::config::BuilderConfig;
use crate::errors::OrkaError;
use crate::pipeline::{BuildContext, Step, StepAction, StepState};

/// Creates the builder VM, waits for it to run and publishes its SSH endpoint.
/// Deletes the VM on cleanup.
pub struct CreateVmStep {
    client: Arc<dyn ControlPlane>,
    state: StepState,
}

impl CreateVmStep {
    pub fn new(client: Arc<dyn ControlPlane>) -> Self {
        Self {
            client,
            state: StepState::NotRun,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }
}

pub(crate) fn vm_descriptor(config: &BuilderConfig) -> VirtualMachineInstance {
    VirtualMachineInstance {
        metadata: ObjectMeta {
            namespace: Some(config.orka_vm_builder_namespace.clone()),
            name: Some(config.orka_vm_builder_name.clone()),
            ..Default::default()
        },
        spec: VirtualMachineInstanceSpec {
            image: config.source_image.clone(),
            cpu: config.orka_vm_cpu_core,
            tag: config.orka_vm_tag.clone(),
            tag_required: config.orka_vm_tag_required,
            legacy_io: config.orka_legacy_io,
            net_boost: config.orka_net_boost,
        },
        status: None,
    }
}

/// Externally reachable address for `host_ip`, honoring the node IP map.
pub(crate) fn reachable_host(config: &BuilderConfig, host_ip: &str) -> Result<String, OrkaError> {
    if !config.enable_orka_node_ip_mapping {
        return Ok(host_ip.to_string());
    }
    config
        .orka_node_ip_map
        .get(host_ip)
        .cloned()
        .ok_or_else(|| {
            OrkaError::Config(format!(
                "VM IP [{host_ip}] is not tracked in the provided node IP map. Please provide a mapping for this VM"
            ))
        })
}

#[async_trait]
impl Step for CreateVmStep {
    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        let config = ctx.config().clone();
        let namespace = config.orka_vm_builder_namespace.as_str();
        let name = config.orka_vm_builder_name.as_str();

        ctx.ui().say(&format!(
            "Builder VM configuration will use base image [{}]",
            config.source_image
        ));
        ctx.ui()
            .say(&format!("Deploying a VM [{name}] in namespace [{namespace}]"));

        let vm = vm_descriptor(&config);
        if let Err(e) = ctx.cancellable(self.client.create_vm(&vm)).await {
            self.state = StepState::Failed;
            return ctx.halt(e.context("failed to deploy a VM"));
        }

        let waited = self
            .client
            .wait_for_vm(namespace, name, config.vm_wait_timeout(), ctx.cancel_token())
            .await;
        let endpoint = match waited {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.state = StepState::Failed;
                return ctx.halt(e.context("failed to wait for the VM"));
            }
        };

        // From here on the VM exists and cleanup must remove it.
        self.state = StepState::Ran;
        ctx.vm_id = Some(name.to_string());
        ctx.ui()
            .say(&format!("Created VM [{name}] in namespace [{namespace}]"));
        tracing::info!(vm = %name, namespace = %namespace, host_ip = %endpoint.host_ip, ssh_port = endpoint.ssh_port, "Builder VM is running");

        let host = match reachable_host(&config, &endpoint.host_ip) {
            Ok(host) => host,
            Err(e) => return ctx.halt(e),
        };
        if host != endpoint.host_ip {
            ctx.ui().say(&format!(
                "Found Internal VM IP in map [{} -> {}]",
                endpoint.host_ip, host
            ));
        }

        ctx.ui().say(&format!(
            "SSH server will be available at [{}:{}]",
            host, endpoint.ssh_port
        ));
        ctx.ssh_host = Some(host);
        ctx.ssh_port = Some(endpoint.ssh_port);

        StepAction::Continue
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) {
        let config = ctx.config().clone();
        if config.no_delete_vm {
            ctx.ui().say(
                "We are skipping the deletion of the builder VM because of no_delete_vm being set",
            );
            return;
        }

        match self.state {
            StepState::NotRun => {}
            StepState::Failed => {
                ctx.ui().say(
                    "Nothing to cleanup because the builder VM creation, deployment and/or provisioning failed.",
                );
            }
            StepState::Ran => {
                let namespace = config.orka_vm_builder_namespace.as_str();
                let name = config.orka_vm_builder_name.as_str();
                ctx.ui().say(&format!(
                    "Cleaning up builder VM [{name}] from namespace [{namespace}]"
                ));
                if let Err(e) = self.client.delete_vm(namespace, name).await {
                    let e = e.context("failed to delete builder VM");
                    ctx.ui().error(&e.to_string());
                    ctx.record_error(e);
                }
            }
        }
    }

    fn name(&self) -> &str {
        "create_vm"
    }
}
