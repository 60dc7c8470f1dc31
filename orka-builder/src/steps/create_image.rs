//! Image capture from the builder VM.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::ObjectMeta;

use super::publish::{PublishStrategy, select_strategy};
use crate::api::{
    ControlPlane, DESCRIPTION_ANNOTATION_KEY, Image, ImageSpec, ImageState, SourceType,
};
use crate::config::{BuilderConfig, DEFAULT_ORKA_NAMESPACE};
use crate::errors::{OrkaError, OrkaResult, ignore_not_found};
use crate::pipeline::{BuildContext, Step, StepAction};

/// Ceiling for the whole save or push, requests and waits included.
pub const IMAGE_SAVE_TIMEOUT: Duration = Duration::from_secs(5 * 60 * 60);

const WAIT_FOR_SAVE_MESSAGE: &str = "Please wait as this can take a little while...";

/// Saves the builder VM as an image, or pushes it to an OCI registry when the
/// image name is a registry reference. Removes a saved image that ended up
/// Failed on cleanup.
pub struct CreateImageStep {
    client: Arc<dyn ControlPlane>,
    attempted: Option<PublishStrategy>,
}

impl CreateImageStep {
    pub fn new(client: Arc<dyn ControlPlane>) -> Self {
        Self {
            client,
            attempted: None,
        }
    }

    async fn save(&self, ctx: &BuildContext) -> OrkaResult<()> {
        let config = ctx.config();
        let image = image_descriptor(config);

        ctx.ui().say(&format!(
            "Image creation is using VM [{}] in namespace [{}]",
            config.orka_vm_builder_name, config.orka_vm_builder_namespace
        ));
        ctx.ui()
            .say(&format!("Saving new image [{}]", config.image_name));
        ctx.ui().say(WAIT_FOR_SAVE_MESSAGE);

        if config.image_force_overwrite {
            ctx.cancellable(async {
                ignore_not_found(
                    self.client
                        .delete_image(DEFAULT_ORKA_NAMESPACE, &config.image_name)
                        .await,
                )
            })
            .await
            .map_err(|e| e.context("failed to delete existing VM image"))?;
        }

        ctx.cancellable(self.client.create_image(&image))
            .await
            .map_err(|e| e.context("failed to create a VM save request"))?;

        self.client
            .wait_for_image(&config.image_name, ctx.cancel_token())
            .await
            .map_err(|e| e.context("failed to save the image"))?;

        ctx.ui()
            .say(&format!("image [{}] saved successfully", config.image_name));
        Ok(())
    }

    async fn push(&self, ctx: &BuildContext) -> OrkaResult<()> {
        let config = ctx.config();
        let namespace = config.orka_vm_builder_namespace.as_str();
        let vm_name = config.orka_vm_builder_name.as_str();

        ctx.ui().say(&format!(
            "Image push is using VM [{vm_name}] in namespace [{namespace}]"
        ));
        ctx.ui()
            .say(&format!("Pushing new image to registry [{}]", config.image_name));

        let job_name = ctx
            .cancellable(self.client.push_vm_image(namespace, vm_name, &config.image_name))
            .await
            .map_err(|e| e.context("failed to send VM push request"))?;

        tracing::info!(job = %job_name, image = %config.image_name, "VM push job started");
        ctx.ui().say(&format!(
            "image [{}] push began successfully.",
            config.image_name
        ));
        ctx.ui().say(WAIT_FOR_SAVE_MESSAGE);

        self.client
            .wait_for_push(namespace, &job_name, ctx.cancel_token())
            .await
            .map_err(|e| e.context(format!("image [{}] push failed", config.image_name)))?;

        ctx.ui().say(&format!(
            "image [{}] push finished successfully.",
            config.image_name
        ));
        Ok(())
    }
}

pub(crate) fn image_descriptor(config: &BuilderConfig) -> Image {
    Image {
        metadata: ObjectMeta {
            namespace: Some(DEFAULT_ORKA_NAMESPACE.to_string()),
            name: Some(config.image_name.clone()),
            annotations: Some(BTreeMap::from([(
                DESCRIPTION_ANNOTATION_KEY.to_string(),
                config.image_description.clone(),
            )])),
            ..Default::default()
        },
        spec: ImageSpec {
            source: config.orka_vm_builder_name.clone(),
            source_namespace: config.orka_vm_builder_namespace.clone(),
            source_type: SourceType::Vm,
            destination: config.image_name.clone(),
        },
        status: None,
    }
}

#[async_trait]
impl Step for CreateImageStep {
    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction {
        if ctx.config().no_create_image {
            ctx.ui()
                .say("Skipping image creation because of 'no_create_image' being set");
            return StepAction::Continue;
        }

        let strategy = select_strategy(&ctx.config().image_name);
        tracing::debug!(image = %ctx.config().image_name, strategy = ?strategy, "Selected publish strategy");
        self.attempted = Some(strategy);

        let work = async {
            match strategy {
                PublishStrategy::Save => self.save(ctx).await,
                PublishStrategy::Push => self.push(ctx).await,
            }
        };
        let result = match tokio::time::timeout(IMAGE_SAVE_TIMEOUT, work).await {
            Ok(result) => result,
            Err(_) => Err(OrkaError::Timeout(IMAGE_SAVE_TIMEOUT).context("failed to save the image")),
        };

        match result {
            Ok(()) => StepAction::Continue,
            Err(e) => ctx.halt(e),
        }
    }

    async fn cleanup(&mut self, ctx: &mut BuildContext) {
        if self.attempted != Some(PublishStrategy::Save) {
            return;
        }

        let image_name = ctx.config().image_name.clone();
        match self.client.get_image(DEFAULT_ORKA_NAMESPACE, &image_name).await {
            Ok(image) if image.state() == ImageState::Failed => {
                ctx.ui().say(&format!("Cleaning up image [{image_name}]"));
                if let Err(e) = self
                    .client
                    .delete_image(DEFAULT_ORKA_NAMESPACE, &image_name)
                    .await
                {
                    ctx.ui()
                        .error(&format!("failed to delete image [{image_name}]: {e}"));
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(image = %image_name, error = %e, "Could not look up image during cleanup");
            }
        }
    }

    fn name(&self) -> &str {
        "create_image"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ImageStatus, MockControlPlane};
    use crate::testing::context_with;
    use tokio_util::sync::CancellationToken;

    fn config(image_name: &str) -> BuilderConfig {
        let mut config = BuilderConfig {
            orka_endpoint: "http://10.221.188.20".into(),
            orka_auth_token: "token".into(),
            source_image: "sonoma-90gb.orkasi".into(),
            orka_vm_builder_name: "packer-builder".into(),
            orka_vm_builder_namespace: "builds".into(),
            image_name: image_name.into(),
            image_description: "CI base image".into(),
            ..Default::default()
        };
        config.prepare().unwrap();
        config
    }

    fn image_in(state: ImageState) -> Image {
        let mut image = image_descriptor(&config("my-base-image"));
        image.status = Some(ImageStatus {
            state,
            error_message: String::new(),
        });
        image
    }

    #[test]
    fn test_image_descriptor() {
        let image = image_descriptor(&config("my-base-image"));
        assert_eq!(image.metadata.namespace.as_deref(), Some("orka-default"));
        assert_eq!(image.metadata.name.as_deref(), Some("my-base-image"));
        assert_eq!(
            image.metadata.annotations.unwrap()[DESCRIPTION_ANNOTATION_KEY],
            "CI base image"
        );
        assert_eq!(image.spec.source, "packer-builder");
        assert_eq!(image.spec.source_namespace, "builds");
        assert_eq!(image.spec.source_type, SourceType::Vm);
        assert_eq!(image.spec.destination, "my-base-image");
    }

    #[tokio::test]
    async fn test_no_create_image_skips_everything() {
        let mut config = config("my-base-image");
        config.no_create_image = true;
        let client = MockControlPlane::new();

        let (mut ctx, ui) = context_with(config, CancellationToken::new());
        let mut step = CreateImageStep::new(Arc::new(client));

        assert_eq!(step.run(&mut ctx).await, StepAction::Continue);
        step.cleanup(&mut ctx).await;
        assert!(ui.said("no_create_image"));
    }

    #[tokio::test]
    async fn test_plain_name_saves_image() {
        let mut client = MockControlPlane::new();
        client.expect_delete_image().never();
        client
            .expect_create_image()
            .withf(|image| image.spec.destination == "my-base-image")
            .times(1)
            .returning(|_| Ok(()));
        client
            .expect_wait_for_image()
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_push_vm_image().never();
        client
            .expect_get_image()
            .returning(|_, _| Ok(image_in(ImageState::Ready)));

        let (mut ctx, ui) = context_with(config("my-base-image"), CancellationToken::new());
        let mut step = CreateImageStep::new(Arc::new(client));

        assert_eq!(step.run(&mut ctx).await, StepAction::Continue);
        assert!(ui.said("image [my-base-image] saved successfully"));

        // A Ready image survives cleanup.
        step.cleanup(&mut ctx).await;
        assert!(ctx.error().is_none());
    }

    #[tokio::test]
    async fn test_force_overwrite_deletes_existing_image_first() {
        let mut config = config("my-base-image");
        config.image_force_overwrite = true;

        let mut client = MockControlPlane::new();
        client
            .expect_delete_image()
            .times(1)
            .returning(|_, _| Err(OrkaError::NotFound("my-base-image".into())));
        client.expect_create_image().times(1).returning(|_| Ok(()));
        client.expect_wait_for_image().returning(|_, _| Ok(()));

        let (mut ctx, _ui) = context_with(config, CancellationToken::new());
        let mut step = CreateImageStep::new(Arc::new(client));

        assert_eq!(step.run(&mut ctx).await, StepAction::Continue);
    }

    #[tokio::test]
    async fn test_failed_save_halts_and_cleanup_deletes_failed_image() {
        let mut client = MockControlPlane::new();
        client.expect_create_image().returning(|_| Ok(()));
        client
            .expect_wait_for_image()
            .returning(|_, _| Err(OrkaError::ResourceFailed("not enough space".into())));
        client
            .expect_get_image()
            .returning(|_, _| Ok(image_in(ImageState::Failed)));
        client
            .expect_delete_image()
            .times(1)
            .returning(|_, _| Ok(()));

        let (mut ctx, ui) = context_with(config("my-base-image"), CancellationToken::new());
        let mut step = CreateImageStep::new(Arc::new(client));

        assert_eq!(step.run(&mut ctx).await, StepAction::Halt);
        assert_eq!(
            ctx.error().unwrap().to_string(),
            "failed to save the image: not enough space"
        );

        step.cleanup(&mut ctx).await;
        assert!(ui.said("Cleaning up image [my-base-image]"));
    }

    #[tokio::test]
    async fn test_cleanup_delete_failure_is_only_reported() {
        let mut client = MockControlPlane::new();
        client.expect_create_image().returning(|_| Ok(()));
        client
            .expect_wait_for_image()
            .returning(|_, _| Err(OrkaError::ResourceFailed("not enough space".into())));
        client
            .expect_get_image()
            .returning(|_, _| Ok(image_in(ImageState::Failed)));
        client
            .expect_delete_image()
            .returning(|_, _| Err(OrkaError::Internal("connection reset".into())));

        let (mut ctx, ui) = context_with(config("my-base-image"), CancellationToken::new());
        let mut step = CreateImageStep::new(Arc::new(client));

        step.run(&mut ctx).await;
        step.cleanup(&mut ctx).await;

        assert!(ctx.error().unwrap().to_string().contains("not enough space"));
        assert_eq!(ui.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_registry_reference_pushes_image() {
        let mut client = MockControlPlane::new();
        client.expect_create_image().never();
        client
            .expect_push_vm_image()
            .withf(|ns, vm, image| {
                ns == "builds" && vm == "packer-builder" && image == "ghcr.io/org/image:latest"
            })
            .times(1)
            .returning(|_, _, _| Ok("push-job-1".to_string()));
        client
            .expect_wait_for_push()
            .withf(|ns, job, _| ns == "builds" && job == "push-job-1")
            .times(1)
            .returning(|_, _, _| Ok(()));
        client.expect_get_image().never();

        let (mut ctx, ui) = context_with(config("ghcr.io/org/image:latest"), CancellationToken::new());
        let mut step = CreateImageStep::new(Arc::new(client));

        assert_eq!(step.run(&mut ctx).await, StepAction::Continue);
        assert!(ui.said("push finished successfully"));

        step.cleanup(&mut ctx).await;
    }

    #[tokio::test]
    async fn test_push_rejection_surfaces_api_message() {
        let mut client = MockControlPlane::new();
        client.expect_push_vm_image().returning(|_, _, _| {
            Err(OrkaError::Api {
                status: 409,
                message: "vm builder is not running".into(),
            })
        });
        client.expect_wait_for_push().never();

        let (mut ctx, _ui) = context_with(config("ghcr.io/org/image:latest"), CancellationToken::new());
        let mut step = CreateImageStep::new(Arc::new(client));

        assert_eq!(step.run(&mut ctx).await, StepAction::Halt);
        assert!(ctx.error().unwrap().to_string().contains("vm builder is not running"));
    }

    #[tokio::test]
    async fn test_failed_push_job_halts() {
        let mut client = MockControlPlane::new();
        client
            .expect_push_vm_image()
            .returning(|_, _, _| Ok("push-job-1".to_string()));
        client.expect_wait_for_push().returning(|_, _, _| {
            Err(OrkaError::ResourceFailed(
                "failed to save image: registry unauthorized".into(),
            ))
        });

        let (mut ctx, _ui) = context_with(config("ghcr.io/org/image:latest"), CancellationToken::new());
        let mut step = CreateImageStep::new(Arc::new(client));

        assert_eq!(step.run(&mut ctx).await, StepAction::Halt);
        assert_eq!(
            ctx.error().unwrap().to_string(),
            "image [ghcr.io/org/image:latest] push failed: failed to save image: registry unauthorized"
        );
    }
}
