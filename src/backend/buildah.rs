use std::path::Path;

use crate::backend::{
    BackendAdapter, BackendKind, BackendPlan, BuildInvocation, PushStep, is_insecure_destination,
};
use crate::config::{Config, StorageDriver};
use crate::context::BuildContext;
use crate::errors::{ConfigError, PipelineError};
use crate::registry::auth::AuthArtifacts;
use crate::validation::{ImageReference, validate_image_reference};

/// Tag given to the working image when no destination names it, so the tar
/// export step has something to reference.
const LOCAL_BUILD_TAG: &str = "localhost/forgeron-build:latest";

/// Layer-based back-end: `buildah build` first, then one `buildah push` per
/// destination (or a docker-archive push for tar export).
pub struct BuildahAdapter;

impl BackendAdapter for BuildahAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Buildah
    }

    fn validate_storage_driver(&self, driver: StorageDriver) -> Result<(), ConfigError> {
        match driver {
            StorageDriver::Vfs | StorageDriver::Overlay => Ok(()),
            other => Err(ConfigError::UnsupportedStorageDriver {
                driver: other.to_string(),
                backend: "buildah".to_string(),
            }),
        }
    }

    fn synthesize(
        &self,
        config: &Config,
        context: &BuildContext,
        auth: &AuthArtifacts,
        scratch_dir: &Path,
    ) -> Result<BackendPlan, PipelineError> {
        if !config.attest_configs.is_empty() || config.attestation_enabled() {
            warn!("attestations are not supported by the layer back-end and will not be produced");
        }

        let mut args: Vec<String> = vec!["build".to_string()];

        if let Some(driver) = config.storage_driver {
            args.push("--storage-driver".to_string());
            args.push(driver.to_string());
        }

        args.push("-f".to_string());
        args.push(context.dockerfile_path(&config.dockerfile).display().to_string());

        for destination in &config.destinations {
            validate_image_reference(&destination.to_string())?;
            args.push("-t".to_string());
            args.push(destination.to_string());
        }
        if config.destinations.is_empty() && config.tar_path.is_some() {
            args.push("-t".to_string());
            args.push(LOCAL_BUILD_TAG.to_string());
        }

        if let Some(target) = &config.target {
            args.push("--target".to_string());
            args.push(target.clone());
        }
        if let Some(platform) = &config.platform {
            args.push("--platform".to_string());
            args.push(platform.clone());
        }

        for build_arg in &config.build_args {
            match build_arg.resolved_value() {
                Some(value) => {
                    args.push("--build-arg".to_string());
                    args.push(format!("{}={}", build_arg.key, value));
                }
                None => debug!("build arg {} has no value and is not in the environment, skipping", build_arg.key),
            }
        }

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }

        if config.cache {
            args.push("--layers".to_string());
            if config.cache_dir.is_some() {
                // buildah keeps its layer cache in container storage; there is
                // no flag pointing it at a directory
                warn!("--cache-dir has no effect with the layer back-end, layers are cached in container storage");
            }
        }

        if config.reproducible {
            let timestamp = config.timestamp.as_deref().unwrap_or("0");
            args.push("--timestamp".to_string());
            args.push(timestamp.to_string());
        }

        if config.insecure_pull || config.insecure || config.skip_tls_verify {
            args.push("--tls-verify=false".to_string());
        }

        if config.image_download_retry > 0 {
            args.push("--retry".to_string());
            args.push(config.image_download_retry.to_string());
        }

        if let Some(cert_dir) = &config.registry_certificate_dir {
            args.push("--cert-dir".to_string());
            args.push(cert_dir.display().to_string());
        }

        args.push("--authfile".to_string());
        args.push(auth.auth_file.display().to_string());

        for (key, value) in &config.backend_opts {
            args.push(format!("--{key}={value}"));
        }

        args.push(context.path.display().to_string());

        let build = BuildInvocation::new(self.kind().binary(), args).envs(&auth.env_overlay);

        let tar_export = config.tar_path.as_ref().map(|tar_path| {
            let source = config
                .destinations
                .first()
                .map(|d| d.to_string())
                .unwrap_or_else(|| LOCAL_BUILD_TAG.to_string());
            let args = vec![
                "push".to_string(),
                source,
                format!("docker-archive:{}", tar_path.display()),
            ];
            BuildInvocation::new(self.kind().binary(), args).envs(&auth.env_overlay)
        });

        // explicit pushes, except under no-push or tar export
        let pushes = if config.no_push || config.tar_path.is_some() {
            Vec::new()
        } else {
            config
                .destinations
                .iter()
                .enumerate()
                .map(|(index, destination)| self.synthesize_push(config, auth, scratch_dir, index, destination))
                .collect()
        };

        Ok(BackendPlan {
            backend: self.kind(),
            build,
            build_digest_file: None,
            pushes,
            tar_export,
        })
    }
}

impl BuildahAdapter {
    fn synthesize_push(
        &self,
        config: &Config,
        auth: &AuthArtifacts,
        scratch_dir: &Path,
        index: usize,
        destination: &ImageReference,
    ) -> PushStep {
        let digest_file = scratch_dir.join(format!("push-digest-{index}"));
        let mut args = vec!["push".to_string()];

        args.push("--digestfile".to_string());
        args.push(digest_file.display().to_string());

        if is_insecure_destination(config, destination) {
            args.push("--tls-verify=false".to_string());
        }
        if let Some(cert_dir) = &config.registry_certificate_dir {
            args.push("--cert-dir".to_string());
            args.push(cert_dir.display().to_string());
        }

        args.push("--authfile".to_string());
        args.push(auth.auth_file.display().to_string());

        args.push(destination.to_string());
        args.push(format!("docker://{destination}"));

        PushStep {
            destination: destination.clone(),
            invocation: BuildInvocation::new(self.kind().binary(), args).envs(&auth.env_overlay),
            digest_file: Some(digest_file),
        }
    }
}
