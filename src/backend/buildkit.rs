use std::path::Path;

use itertools::Itertools;

use crate::backend::{
    BackendAdapter, BackendKind, BackendPlan, BuildInvocation, is_insecure_destination,
};
use crate::config::{AttestationMode, Config, StorageDriver};
use crate::context::{BuildContext, ContextKind};
use crate::errors::{ConfigError, PipelineError};
use crate::registry::auth::AuthArtifacts;
use crate::validation::validate_image_reference;

/// Snapshot-based back-end: one `buildctl build` invocation solves the
/// Dockerfile and pushes or exports in the same step.
pub struct BuildKitAdapter;

impl BackendAdapter for BuildKitAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::BuildKit
    }

    fn validate_storage_driver(&self, driver: StorageDriver) -> Result<(), ConfigError> {
        match driver {
            StorageDriver::Native | StorageDriver::Overlay | StorageDriver::FuseOverlayfs => Ok(()),
            other => Err(ConfigError::UnsupportedStorageDriver {
                driver: other.to_string(),
                backend: "buildkit".to_string(),
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
        let mut args: Vec<String> = vec![
            "build".to_string(),
            "--frontend".to_string(),
            "dockerfile.v0".to_string(),
        ];

        match context.kind {
            ContextKind::Git => {
                let git_url = context.git_url.as_deref().unwrap_or_default();
                args.push("--opt".to_string());
                args.push(format!("context={git_url}"));
            }
            ContextKind::Local => {
                let dockerfile_dir = context
                    .dockerfile_path(&config.dockerfile)
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| context.path.clone());

                args.push("--local".to_string());
                args.push(format!("context={}", context.path.display()));
                args.push("--local".to_string());
                args.push(format!("dockerfile={}", dockerfile_dir.display()));
            }
        }

        let filename = Path::new(&config.dockerfile)
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "Dockerfile".to_string());
        push_opt(&mut args, format!("filename={filename}"));

        if let Some(target) = &config.target {
            push_opt(&mut args, format!("target={target}"));
        }
        if let Some(platform) = &config.platform {
            push_opt(&mut args, format!("platform={platform}"));
        }

        for build_arg in &config.build_args {
            match build_arg.resolved_value() {
                Some(value) => push_opt(&mut args, format!("build-arg:{}={}", build_arg.key, value)),
                None => debug!("build arg {} has no value and is not in the environment, skipping", build_arg.key),
            }
        }

        for (key, value) in &config.labels {
            push_opt(&mut args, format!("label:{key}={value}"));
        }

        if config.reproducible {
            let timestamp = config.timestamp.as_deref().unwrap_or("0");
            push_opt(&mut args, format!("build-arg:SOURCE_DATE_EPOCH={timestamp}"));
        }

        synthesize_attestations(config, &mut args);

        if config.cache {
            let cache_dir = config
                .cache_dir
                .clone()
                .unwrap_or_else(|| scratch_dir.join("cache"));
            args.push("--import-cache".to_string());
            args.push(format!("type=local,src={}", cache_dir.display()));
            args.push("--export-cache".to_string());
            args.push(format!("type=local,dest={}", cache_dir.display()));
        }

        // raw opts are appended last so they can override anything above
        for (key, value) in &config.backend_opts {
            push_opt(&mut args, format!("{key}={value}"));
        }

        let metadata_file = scratch_dir.join("build-metadata.json");
        args.push("--metadata-file".to_string());
        args.push(metadata_file.display().to_string());

        if let Some(output) = synthesize_output(config)? {
            args.push("--output".to_string());
            args.push(output);
        }

        let mut invocation = BuildInvocation::new(self.kind().binary(), args).envs(&auth.env_overlay);
        if config.reproducible {
            let timestamp = config.timestamp.as_deref().unwrap_or("0");
            invocation = invocation.env("SOURCE_DATE_EPOCH", timestamp);
        }
        if let Some(driver) = config.storage_driver {
            invocation = invocation.env("BUILDKITD_FLAGS", &snapshotter_flag(driver));
        }

        Ok(BackendPlan {
            backend: self.kind(),
            build: invocation,
            build_digest_file: Some(metadata_file),
            pushes: Vec::new(),
            tar_export: None,
        })
    }
}

fn push_opt(args: &mut Vec<String>, opt: String) {
    args.push("--opt".to_string());
    args.push(opt);
}

fn snapshotter_flag(driver: StorageDriver) -> String {
    let snapshotter = match driver {
        StorageDriver::Overlay => "overlayfs",
        StorageDriver::FuseOverlayfs => "fuse-overlayfs",
        _ => "native",
    };
    format!("--oci-worker-snapshotter={snapshotter}")
}

fn synthesize_attestations(config: &Config, args: &mut Vec<String>) {
    if !config.attest_configs.is_empty() {
        // structured configs are emitted verbatim
        for attest in &config.attest_configs {
            let rendered = attest.to_string();
            let (kind, options) = match rendered.split_once(',') {
                Some((kind, options)) => (kind, Some(options)),
                None => (rendered.as_str(), None),
            };
            let kind = kind.trim_start_matches("type=");
            push_opt(args, format!("attest:{}={}", kind, options.unwrap_or_default()));
        }
        return;
    }

    let mode = match config.attestation {
        AttestationMode::Off => return,
        AttestationMode::Min => "min",
        AttestationMode::Max => "max",
    };
    push_opt(args, "attest:sbom=".to_string());
    push_opt(args, format!("attest:provenance=mode={mode}"));
}

/// At most one `--output`: a tar export, an image export pushed (or not) to
/// every destination, or none at all for a destination-less no-push build.
fn synthesize_output(config: &Config) -> Result<Option<String>, PipelineError> {
    for destination in &config.destinations {
        // destinations were parsed at config build; re-validate before argv
        validate_image_reference(&destination.to_string())?;
    }

    let names = config.destinations.iter().map(|d| d.to_string()).join(",");

    if let Some(tar_path) = &config.tar_path {
        let mut output = "type=docker".to_string();
        if !names.is_empty() {
            output.push_str(&format!(",{}", quoted_names(&names)));
        }
        output.push_str(&format!(",dest={}", tar_path.display()));
        return Ok(Some(output));
    }

    if names.is_empty() {
        return Ok(None);
    }

    let push = !config.no_push;
    let mut output = format!("type=image,{},push={}", quoted_names(&names), push);
    if push
        && config
            .destinations
            .iter()
            .any(|dest| is_insecure_destination(config, dest))
    {
        output.push_str(",registry.insecure=true");
    }
    if config.reproducible {
        output.push_str(",rewrite-timestamp=true");
    }

    Ok(Some(output))
}

/// BuildKit output attributes are CSV; a multi-destination name list needs
/// its own quoting to survive the parser.
fn quoted_names(names: &str) -> String {
    if names.contains(',') {
        format!("\"name={names}\"")
    } else {
        format!("name={names}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttestConfig, BuildArg, Config};
    use crate::context::prepare_context;
    use crate::registry::auth::{AuthMaterializer, AuthSources};
    use crate::registry::helper::{CredentialResolver, HelperCredential};
    use crate::validation::validate_image_reference;
    use std::fs;
    use std::path::PathBuf;

    struct NoResolver;

    impl CredentialResolver for NoResolver {
        fn get(&self, helper: &str, registry: &str) -> Result<HelperCredential, crate::errors::AuthError> {
            Err(crate::errors::AuthError::HelperFailed {
                helper: helper.to_string(),
                registry: registry.to_string(),
                details: "none".to_string(),
            })
        }
    }

    fn auth_artifacts() -> AuthArtifacts {
        let home = tempfile::tempdir().unwrap();
        let sources = AuthSources {
            home: Some(home.path().to_path_buf()),
            ..Default::default()
        };
        AuthMaterializer::new(sources, &NoResolver).materialize(&[], &[]).unwrap()
    }

    fn local_context() -> (tempfile::TempDir, BuildContext) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let config = Config {
            context: dir.path().to_string_lossy().to_string(),
            dockerfile: "Dockerfile".to_string(),
            ..Default::default()
        };
        let context = prepare_context(&config, BackendKind::BuildKit).unwrap();
        (dir, context)
    }

    fn synthesize(config: &Config, context: &BuildContext) -> BackendPlan {
        let scratch = tempfile::tempdir().unwrap();
        BuildKitAdapter
            .synthesize(config, context, &auth_artifacts(), scratch.path())
            .unwrap()
    }

    fn arg_pairs(plan: &BackendPlan) -> Vec<(String, String)> {
        plan.build
            .args
            .windows(2)
            .map(|w| (w[0].clone(), w[1].clone()))
            .collect()
    }

    fn has_opt(plan: &BackendPlan, opt: &str) -> bool {
        arg_pairs(plan).contains(&("--opt".to_string(), opt.to_string()))
    }

    fn output_of(plan: &BackendPlan) -> String {
        let args = &plan.build.args;
        let idx = args.iter().position(|a| a == "--output").unwrap();
        args[idx + 1].clone()
    }

    #[test]
    fn test_storage_driver_mapping() {
        assert!(BuildKitAdapter.validate_storage_driver(StorageDriver::Native).is_ok());
        assert!(BuildKitAdapter.validate_storage_driver(StorageDriver::Overlay).is_ok());
        assert!(BuildKitAdapter.validate_storage_driver(StorageDriver::FuseOverlayfs).is_ok());
        assert!(BuildKitAdapter.validate_storage_driver(StorageDriver::Vfs).is_err());
    }

    #[test]
    fn test_single_invocation_with_push() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/a:v1").unwrap()],
            ..Default::default()
        };

        let plan = synthesize(&config, &context);

        assert!(plan.pushes.is_empty());
        assert!(plan.tar_export.is_none());
        assert!(plan.build.args.starts_with(&["build".to_string(), "--frontend".to_string(), "dockerfile.v0".to_string()]));
        assert!(has_opt(&plan, "filename=Dockerfile"));
        assert_eq!(output_of(&plan), "type=image,name=example.com/a:v1,push=true");
    }

    #[test]
    fn test_no_push_output() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/a:v1").unwrap()],
            no_push: true,
            ..Default::default()
        };

        let plan = synthesize(&config, &context);
        assert_eq!(output_of(&plan), "type=image,name=example.com/a:v1,push=false");
    }

    #[test]
    fn test_no_push_without_destination_has_no_output() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            no_push: true,
            ..Default::default()
        };

        let plan = synthesize(&config, &context);
        assert!(!plan.build.args.iter().any(|a| a == "--output"));
    }

    #[test]
    fn test_tar_export_output() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/a:v1").unwrap()],
            tar_path: Some(PathBuf::from("/out/image.tar")),
            ..Default::default()
        };

        let plan = synthesize(&config, &context);
        assert_eq!(output_of(&plan), "type=docker,name=example.com/a:v1,dest=/out/image.tar");
    }

    #[test]
    fn test_multiple_destinations_are_quoted() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![
                validate_image_reference("example.com/a:v1").unwrap(),
                validate_image_reference("example.com/b:v2").unwrap(),
            ],
            ..Default::default()
        };

        let plan = synthesize(&config, &context);
        assert_eq!(
            output_of(&plan),
            "type=image,\"name=example.com/a:v1,example.com/b:v2\",push=true"
        );
    }

    #[test]
    fn test_build_args_labels_target_platform() {
        let (_dir, context) = local_context();
        let mut config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/a:v1").unwrap()],
            target: Some("runtime".to_string()),
            platform: Some("linux/arm64".to_string()),
            build_args: vec![BuildArg::parse("HTTP_PROXY=http://proxy:3128")],
            ..Default::default()
        };
        config.labels.insert("org.example.team".to_string(), "core".to_string());

        let plan = synthesize(&config, &context);
        assert!(has_opt(&plan, "target=runtime"));
        assert!(has_opt(&plan, "platform=linux/arm64"));
        assert!(has_opt(&plan, "build-arg:HTTP_PROXY=http://proxy:3128"));
        assert!(has_opt(&plan, "label:org.example.team=core"));
    }

    #[test]
    fn test_reproducible_build() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/a:v1").unwrap()],
            reproducible: true,
            timestamp: Some("1700000000".to_string()),
            ..Default::default()
        };

        let plan = synthesize(&config, &context);

        assert!(
            plan.build
                .envs
                .iter()
                .any(|(k, v)| k == "SOURCE_DATE_EPOCH" && v == "1700000000")
        );
        assert!(has_opt(&plan, "build-arg:SOURCE_DATE_EPOCH=1700000000"));
        assert!(output_of(&plan).contains("rewrite-timestamp=true"));
    }

    #[test]
    fn test_attestation_modes() {
        let (_dir, context) = local_context();
        let mut config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/a:v1").unwrap()],
            attestation: crate::config::AttestationMode::Min,
            ..Default::default()
        };

        let plan = synthesize(&config, &context);
        assert!(has_opt(&plan, "attest:sbom="));
        assert!(has_opt(&plan, "attest:provenance=mode=min"));

        config.attestation = crate::config::AttestationMode::Max;
        let plan = synthesize(&config, &context);
        assert!(has_opt(&plan, "attest:provenance=mode=max"));

        config.attestation = crate::config::AttestationMode::Off;
        let plan = synthesize(&config, &context);
        assert!(!plan.build.args.iter().any(|a| a.starts_with("attest:")));
    }

    #[test]
    fn test_structured_attest_configs_win() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/a:v1").unwrap()],
            attestation: crate::config::AttestationMode::Min,
            attest_configs: vec![AttestConfig::parse("type=provenance,mode=max,builder-id=ci").unwrap()],
            ..Default::default()
        };

        let plan = synthesize(&config, &context);
        assert!(has_opt(&plan, "attest:provenance=mode=max,builder-id=ci"));
        assert!(!has_opt(&plan, "attest:sbom="));
    }

    #[test]
    fn test_git_context_uses_url_form() {
        let config = Config {
            context: "https://git.example.com/o/r.git".to_string(),
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/svc:1").unwrap()],
            git_branch: Some("main".to_string()),
            context_sub_path: Some("svc".to_string()),
            ..Default::default()
        };
        let context = prepare_context(&config, BackendKind::BuildKit).unwrap();

        let plan = synthesize(&config, &context);
        assert!(has_opt(&plan, "context=https://git.example.com/o/r.git#main:svc"));
        assert!(!plan.build.args.iter().any(|a| a.starts_with("context=") && a.contains("--local")));
    }

    #[test]
    fn test_insecure_registry_sets_output_attribute() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("local.test:5000/img:1").unwrap()],
            insecure_registries: vec!["local.test:5000".to_string()],
            ..Default::default()
        };

        let plan = synthesize(&config, &context);
        assert!(output_of(&plan).contains("registry.insecure=true"));
    }

    #[test]
    fn test_cache_and_raw_opts() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/a:v1").unwrap()],
            cache: true,
            cache_dir: Some(PathBuf::from("/var/cache/forgeron")),
            backend_opts: vec![("ulimit".to_string(), "nofile=1024".to_string())],
            ..Default::default()
        };

        let plan = synthesize(&config, &context);
        let pairs = arg_pairs(&plan);
        assert!(pairs.contains(&("--import-cache".to_string(), "type=local,src=/var/cache/forgeron".to_string())));
        assert!(pairs.contains(&("--export-cache".to_string(), "type=local,dest=/var/cache/forgeron".to_string())));
        assert!(has_opt(&plan, "ulimit=nofile=1024"));
    }

    #[test]
    fn test_storage_driver_env() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/a:v1").unwrap()],
            storage_driver: Some(StorageDriver::FuseOverlayfs),
            ..Default::default()
        };

        let plan = synthesize(&config, &context);
        assert!(
            plan.build
                .envs
                .iter()
                .any(|(k, v)| k == "BUILDKITD_FLAGS" && v == "--oci-worker-snapshotter=fuse-overlayfs")
        );
    }

    #[test]
    fn test_auth_env_overlay_is_applied() {
        let (_dir, context) = local_context();
        let config = Config {
            dockerfile: "Dockerfile".to_string(),
            destinations: vec![validate_image_reference("example.com/a:v1").unwrap()],
            ..Default::default()
        };

        let plan = synthesize(&config, &context);
        assert!(plan.build.envs.iter().any(|(k, _)| k == "REGISTRY_AUTH_FILE"));
        assert!(plan.build.envs.iter().any(|(k, _)| k == "DOCKER_CONFIG"));
    }
}
