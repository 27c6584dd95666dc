use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};

use crate::config::{AttestConfig, AttestationMode, BuildArg, Config, StorageDriver, resolve_timestamp};
use crate::errors::{ConfigError, PipelineError};
use crate::validation::validate_image_reference;

/// forgeron builds OCI container images from a Dockerfile without a daemon
/// and without root.
#[derive(Debug, Parser)]
#[command(name = "forgeron", version, about)]
pub struct Cli {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<ForgeronSubcommand>,

    /// Build context: a local directory or an http(s) Git URL
    #[arg(short = 'c', long, default_value = ".")]
    pub context: String,

    /// Sub directory of the context to build from
    #[arg(long)]
    pub context_sub_path: Option<String>,

    /// Path to the Dockerfile, relative to the effective context
    #[arg(short = 'f', long, default_value = "Dockerfile")]
    pub dockerfile: String,

    /// Destination image reference; repeatable
    #[arg(short = 'd', long = "destination")]
    pub destinations: Vec<String>,

    /// Target build stage
    #[arg(short = 't', long)]
    pub target: Option<String>,

    /// Build argument, K=V or bare K to inherit from the environment; repeatable
    #[arg(long = "build-arg")]
    pub build_args: Vec<String>,

    /// Image label, K=V; repeatable
    #[arg(long = "label")]
    pub labels: Vec<String>,

    /// Enable layer caching
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    pub cache: Option<bool>,

    /// Cache directory. Sharing one directory between concurrent builds is
    /// undefined behavior
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Storage driver (native, overlay, fuse-overlayfs, vfs)
    #[arg(long)]
    pub storage_driver: Option<String>,

    /// Target platform, os/arch[/variant]
    #[arg(long)]
    pub custom_platform: Option<String>,

    /// Build without pushing anywhere
    #[arg(long)]
    pub no_push: bool,

    /// Export the built image to a docker-archive tar at this path
    #[arg(long)]
    pub tar_path: Option<PathBuf>,

    /// Write the image digest to this file
    #[arg(long)]
    pub digest_file: Option<PathBuf>,

    /// Write `name@digest` for the first destination to this file
    #[arg(long)]
    pub image_name_with_digest_file: Option<PathBuf>,

    /// Write `name:tag@digest` per destination to this file
    #[arg(long)]
    pub image_name_tag_with_digest_file: Option<PathBuf>,

    /// Allow plaintext/unverified TLS for all registries
    #[arg(long)]
    pub insecure: bool,

    /// Allow plaintext/unverified TLS when pulling base images
    #[arg(long)]
    pub insecure_pull: bool,

    /// Registry to treat as insecure; repeatable
    #[arg(long = "insecure-registry")]
    pub insecure_registries: Vec<String>,

    /// Do not verify registry TLS certificates
    #[arg(long)]
    pub skip_tls_verify: bool,

    /// Retries after a failed push
    #[arg(long, default_value_t = 0)]
    pub push_retry: u32,

    /// Image download retries delegated to the back-end
    #[arg(long, default_value_t = 0)]
    pub image_download_retry: u32,

    /// Directory holding additional registry CA certificates
    #[arg(long = "registry-certificate")]
    pub registry_certificate: Option<PathBuf>,

    /// Git branch to build from a Git context
    #[arg(long)]
    pub git_branch: Option<String>,

    /// Git revision to build from a Git context
    #[arg(long)]
    pub git_revision: Option<String>,

    /// File containing the Git access token
    #[arg(long)]
    pub git_token_file: Option<PathBuf>,

    /// User name paired with the Git token
    #[arg(long, default_value = "oauth2")]
    pub git_token_user: String,

    /// Produce a reproducible image (fixed timestamps)
    #[arg(long)]
    pub reproducible: bool,

    /// Unix epoch for reproducible builds; defaults to SOURCE_DATE_EPOCH
    #[arg(long)]
    pub timestamp: Option<String>,

    /// Attestation level: off, min or max; bare flag means min
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "min")]
    pub attestation: Option<String>,

    /// Structured attestation, `type=<sbom|provenance>[,k=v…]`; repeatable
    #[arg(long = "attest")]
    pub attests: Vec<String>,

    /// Raw back-end option k=v, appended verbatim; repeatable
    #[arg(long = "backend-opt")]
    pub backend_opts: Vec<String>,

    /// Sign pushed images with cosign
    #[arg(long)]
    pub sign: bool,

    /// Path to the cosign private key
    #[arg(long)]
    pub cosign_key: Option<PathBuf>,

    /// Env var holding the cosign key password
    #[arg(long, default_value = "COSIGN_PASSWORD")]
    pub cosign_password_env: String,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    pub verbosity: String,

    /// Prefix log lines with timestamps
    #[arg(long)]
    pub log_timestamp: bool,
}

#[derive(Debug, Subcommand)]
pub enum ForgeronSubcommand {
    /// Inspect the environment and report whether rootless builds can work
    #[command(name = "check-environment")]
    CheckEnvironment,
}

impl Cli {
    /// Converts parsed arguments into the immutable Config, running every
    /// per-value validator and cross-flag constraint.
    pub fn into_config(self) -> Result<Config, PipelineError> {
        let destinations = self
            .destinations
            .iter()
            .map(|raw| validate_image_reference(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let mut labels = BTreeMap::new();
        for raw in &self.labels {
            let (key, value) = raw.split_once('=').ok_or(ConfigError::InvalidFlagValue {
                flag: "--label",
                value: raw.clone(),
                reason: "expected K=V".to_string(),
            })?;
            labels.insert(key.to_string(), value.to_string());
        }

        let attestation = match &self.attestation {
            Some(raw) => AttestationMode::from_str(raw).map_err(|_| ConfigError::InvalidAttestationMode {
                value: raw.clone(),
            })?,
            None => AttestationMode::Off,
        };

        let attest_configs = self
            .attests
            .iter()
            .map(|raw| AttestConfig::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let storage_driver = match &self.storage_driver {
            Some(raw) => Some(StorageDriver::from_str(raw).map_err(|_| ConfigError::UnknownStorageDriver {
                value: raw.clone(),
            })?),
            None => None,
        };

        let backend_opts = self
            .backend_opts
            .iter()
            .map(|raw| {
                raw.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or(ConfigError::InvalidBackendOpt { raw: raw.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let timestamp = if self.reproducible {
            Some(resolve_timestamp(self.timestamp.clone()))
        } else {
            self.timestamp.clone()
        };

        let config = Config {
            context: self.context,
            context_sub_path: self.context_sub_path,
            dockerfile: self.dockerfile,
            destinations,
            build_args: self.build_args.iter().map(|raw| BuildArg::parse(raw)).collect(),
            labels,
            target: self.target,
            platform: self.custom_platform,
            cache: self.cache.unwrap_or(false),
            cache_dir: self.cache_dir,
            storage_driver,
            insecure: self.insecure,
            insecure_pull: self.insecure_pull,
            insecure_registries: self.insecure_registries,
            skip_tls_verify: self.skip_tls_verify,
            registry_certificate_dir: self.registry_certificate,
            push_retry: self.push_retry,
            image_download_retry: self.image_download_retry,
            no_push: self.no_push,
            tar_path: self.tar_path,
            digest_file: self.digest_file,
            image_name_with_digest_file: self.image_name_with_digest_file,
            image_name_tag_with_digest_file: self.image_name_tag_with_digest_file,
            reproducible: self.reproducible,
            timestamp,
            attestation,
            attest_configs,
            backend_opts,
            sign: self.sign,
            cosign_key: self.cosign_key,
            cosign_password_env: self.cosign_password_env,
            git_branch: self.git_branch,
            git_revision: self.git_revision,
            git_token_file: self.git_token_file,
            git_token_user: self.git_token_user,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ConfigError, PipelineError};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("forgeron").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_both_flag_forms_are_accepted() {
        let space = parse(&["--context", "./ctx", "--destination", "example.com/a:v1"]);
        let equals = parse(&["--context=./ctx", "--destination=example.com/a:v1"]);
        assert_eq!(space.context, equals.context);
        assert_eq!(space.destinations, equals.destinations);
    }

    #[test]
    fn test_short_flags() {
        let cli = parse(&["-c", "./ctx", "-f", "Dockerfile.dev", "-d", "example.com/a:v1", "-t", "runtime"]);
        assert_eq!(cli.context, "./ctx");
        assert_eq!(cli.dockerfile, "Dockerfile.dev");
        assert_eq!(cli.target.as_deref(), Some("runtime"));
    }

    #[test]
    fn test_repeatable_flags() {
        let cli = parse(&[
            "--destination=example.com/a:v1",
            "--destination=example.com/b:v2",
            "--build-arg=A=1",
            "--build-arg=B",
            "--label=team=core",
            "--insecure-registry=local.test:5000",
        ]);
        assert_eq!(cli.destinations.len(), 2);
        assert_eq!(cli.build_args.len(), 2);
        assert_eq!(cli.insecure_registries, vec!["local.test:5000".to_string()]);
    }

    #[test]
    fn test_bare_attestation_means_min() {
        let cli = parse(&["--no-push", "--attestation"]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.attestation, AttestationMode::Min);

        let cli = parse(&["--no-push", "--attestation=max"]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.attestation, AttestationMode::Max);
    }

    #[test]
    fn test_invalid_attestation_value_is_config_error() {
        let cli = parse(&["--no-push", "--attestation=full"]);
        let err = cli.into_config().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::InvalidAttestationMode { .. })
        ));
    }

    #[test]
    fn test_bare_cache_means_true() {
        let cli = parse(&["--no-push", "--cache"]);
        assert_eq!(cli.cache, Some(true));
        let cli = parse(&["--no-push", "--cache=false"]);
        assert_eq!(cli.cache, Some(false));
        let cli = parse(&["--no-push"]);
        assert_eq!(cli.cache, None);
    }

    #[test]
    fn test_invalid_destination_is_rejected() {
        let cli = parse(&["--destination=Example.com/UPPER:tag"]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn test_sign_without_attestation_is_rejected() {
        let cli = parse(&["--destination=example.com/a:v1", "--sign"]);
        let err = cli.into_config().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::SignRequiresAttestation)
        ));
    }

    #[test]
    fn test_storage_driver_parsing() {
        let cli = parse(&["--no-push", "--storage-driver=fuse-overlayfs"]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.storage_driver, Some(StorageDriver::FuseOverlayfs));

        let cli = parse(&["--no-push", "--storage-driver=zfs"]);
        assert!(matches!(
            cli.into_config().unwrap_err(),
            PipelineError::Config(ConfigError::UnknownStorageDriver { .. })
        ));
    }

    #[test]
    fn test_reproducible_resolves_timestamp() {
        let cli = parse(&["--no-push", "--reproducible", "--timestamp=1700000000"]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.timestamp.as_deref(), Some("1700000000"));
    }

    #[test]
    fn test_check_environment_subcommand() {
        let cli = parse(&["check-environment"]);
        assert!(matches!(cli.subcommand, Some(ForgeronSubcommand::CheckEnvironment)));
    }

    #[test]
    fn test_labels_require_key_value() {
        let cli = parse(&["--no-push", "--label=bare"]);
        assert!(matches!(
            cli.into_config().unwrap_err(),
            PipelineError::Config(ConfigError::InvalidFlagValue { flag: "--label", .. })
        ));
    }

    #[test]
    fn test_backend_opts_require_key_value() {
        let cli = parse(&["--no-push", "--backend-opt=bare"]);
        assert!(matches!(
            cli.into_config().unwrap_err(),
            PipelineError::Config(ConfigError::InvalidBackendOpt { .. })
        ));
    }
}
