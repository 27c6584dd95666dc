use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use strum_macros::{Display, EnumString};

use crate::errors::{ConfigError, PipelineError};
use crate::registry::{extract_registry, normalize_registry_url};
use crate::validation::{
    ImageReference, validate_build_arg_key, validate_build_arg_value, validate_git_ref, validate_label_key,
    validate_platform, validate_registry_host,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum StorageDriver {
    Native,
    Overlay,
    FuseOverlayfs,
    Vfs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum AttestationMode {
    #[default]
    Off,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum AttestKind {
    Sbom,
    Provenance,
}

/// One `--attest type=<sbom|provenance>[,k=v…]` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestConfig {
    pub kind: AttestKind,
    pub options: Vec<(String, String)>,
}

impl AttestConfig {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let err = |reason: &str| ConfigError::InvalidAttestConfig {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut kind = None;
        let mut options = Vec::new();

        for segment in raw.split(',') {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| err("expected comma separated key=value pairs"))?;

            if key == "type" {
                // an empty `type=` is always a hard error, never a default
                let parsed = value
                    .parse::<AttestKind>()
                    .map_err(|_| err("type must be sbom or provenance"))?;
                kind = Some(parsed);
            } else {
                options.push((key.to_string(), value.to_string()));
            }
        }

        Ok(AttestConfig {
            kind: kind.ok_or_else(|| err("missing type="))?,
            options,
        })
    }
}

impl fmt::Display for AttestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type={}", self.kind)?;
        for (key, value) in &self.options {
            write!(f, ",{key}={value}")?;
        }
        Ok(())
    }
}

/// A `--build-arg` occurrence; a bare key inherits its value from the
/// process environment at synthesis time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArg {
    pub key: String,
    pub value: Option<String>,
}

impl BuildArg {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('=') {
            Some((key, value)) => BuildArg {
                key: key.to_string(),
                value: Some(value.to_string()),
            },
            None => BuildArg {
                key: raw.to_string(),
                value: None,
            },
        }
    }

    /// The effective value: explicit, else inherited from the environment.
    pub fn resolved_value(&self) -> Option<String> {
        match &self.value {
            Some(value) => Some(value.clone()),
            None => std::env::var(&self.key).ok(),
        }
    }
}

/// Immutable build request, produced once from the CLI and shared read-only
/// by the whole pipeline.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub context: String,
    pub context_sub_path: Option<String>,
    pub dockerfile: String,
    pub destinations: Vec<ImageReference>,
    pub build_args: Vec<BuildArg>,
    pub labels: BTreeMap<String, String>,
    pub target: Option<String>,
    pub platform: Option<String>,
    pub cache: bool,
    pub cache_dir: Option<PathBuf>,
    pub storage_driver: Option<StorageDriver>,
    pub insecure: bool,
    pub insecure_pull: bool,
    pub insecure_registries: Vec<String>,
    pub skip_tls_verify: bool,
    pub registry_certificate_dir: Option<PathBuf>,
    pub push_retry: u32,
    pub image_download_retry: u32,
    pub no_push: bool,
    pub tar_path: Option<PathBuf>,
    pub digest_file: Option<PathBuf>,
    pub image_name_with_digest_file: Option<PathBuf>,
    pub image_name_tag_with_digest_file: Option<PathBuf>,
    pub reproducible: bool,
    pub timestamp: Option<String>,
    pub attestation: AttestationMode,
    pub attest_configs: Vec<AttestConfig>,
    pub backend_opts: Vec<(String, String)>,
    pub sign: bool,
    pub cosign_key: Option<PathBuf>,
    pub cosign_password_env: String,
    pub git_branch: Option<String>,
    pub git_revision: Option<String>,
    pub git_token_file: Option<PathBuf>,
    pub git_token_user: String,
}

impl Config {
    pub fn attestation_enabled(&self) -> bool {
        self.attestation != AttestationMode::Off || !self.attest_configs.is_empty()
    }

    /// Unique normalized registry hosts across all destinations.
    pub fn destination_registries(&self) -> Vec<String> {
        let mut registries: Vec<String> = self
            .destinations
            .iter()
            .map(|dest| normalize_registry_url(&extract_registry(&dest.name)))
            .collect();
        registries.sort();
        registries.dedup();
        registries
    }

    /// Cross flag constraints, checked once right after parse.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.destinations.is_empty() && self.tar_path.is_none() && !self.no_push {
            return Err(ConfigError::MissingOutputIntent.into());
        }

        if self.sign && !self.attestation_enabled() {
            return Err(ConfigError::SignRequiresAttestation.into());
        }

        if self.sign && self.cosign_key.is_none() {
            return Err(ConfigError::SignRequiresCosignKey.into());
        }

        if self.reproducible {
            let timestamp = self.timestamp.as_deref().ok_or(ConfigError::MissingTimestamp)?;
            if timestamp.parse::<i64>().is_err() {
                return Err(ConfigError::InvalidFlagValue {
                    flag: "--timestamp",
                    value: timestamp.to_string(),
                    reason: "not a unix epoch".to_string(),
                }
                .into());
            }
        }

        for arg in &self.build_args {
            validate_build_arg_key(&arg.key)?;
            if let Some(value) = &arg.value {
                validate_build_arg_value(&arg.key, value)?;
            }
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        if let Some(platform) = &self.platform {
            validate_platform(platform)?;
        }

        for registry in &self.insecure_registries {
            validate_registry_host(&normalize_registry_url(registry))?;
        }

        if let Some(branch) = &self.git_branch {
            validate_git_ref(branch)?;
        }
        if let Some(revision) = &self.git_revision {
            validate_git_ref(revision)?;
        }

        if let Some(target) = &self.target
            && crate::validation::has_forbidden_chars(target)
        {
            return Err(ConfigError::InvalidFlagValue {
                flag: "--target",
                value: target.clone(),
                reason: "contains forbidden characters".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// Resolves the reproducible build timestamp: explicit flag, then
/// `SOURCE_DATE_EPOCH`, then the epoch itself.
pub fn resolve_timestamp(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("SOURCE_DATE_EPOCH").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "0".to_string())
}
