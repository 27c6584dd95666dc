use std::path::PathBuf;
use std::process::ExitStatus;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no output requested: provide at least one --destination, or --tar-path, or --no-push")]
    MissingOutputIntent,

    #[error("--sign requires attestations to be enabled (--attestation or --attest)")]
    SignRequiresAttestation,

    #[error("--sign requires a signing key (--cosign-key)")]
    SignRequiresCosignKey,

    #[error("invalid attestation mode {value:?}: expected off, min or max")]
    InvalidAttestationMode { value: String },

    #[error("invalid attest config {raw:?}: {reason}")]
    InvalidAttestConfig { raw: String, reason: String },

    #[error("invalid backend opt {raw:?}: expected key=value")]
    InvalidBackendOpt { raw: String },

    #[error("storage driver {driver:?} is not supported by {backend}")]
    UnsupportedStorageDriver { driver: String, backend: String },

    #[error("invalid storage driver {value:?}: expected native, overlay, fuse-overlayfs or vfs")]
    UnknownStorageDriver { value: String },

    #[error("invalid value {value:?} for {flag}: {reason}")]
    InvalidFlagValue {
        flag: &'static str,
        value: String,
        reason: String,
    },

    #[error("--reproducible requires a timestamp: pass --timestamp or set SOURCE_DATE_EPOCH")]
    MissingTimestamp,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{what} {value:?} contains forbidden characters")]
    ForbiddenCharacters { what: &'static str, value: String },

    #[error("invalid git ref {value:?}: {reason}")]
    InvalidGitRef { value: String, reason: String },

    #[error("invalid image name {value:?}: {reason}")]
    InvalidImageName { value: String, reason: String },

    #[error("invalid image tag {value:?}")]
    InvalidImageTag { value: String },

    #[error("invalid image reference {value:?}: {reason}")]
    InvalidImageReference { value: String, reason: String },

    #[error("invalid registry host {value:?}: {reason}")]
    InvalidRegistryHost { value: String, reason: String },

    #[error("invalid build arg key {value:?}")]
    InvalidBuildArgKey { value: String },

    #[error("invalid label key {value:?}")]
    InvalidLabelKey { value: String },

    #[error("invalid platform {value:?}: {reason}")]
    InvalidPlatform { value: String, reason: String },

    #[error("path {path:?} escapes base directory {base:?}")]
    PathEscapesBase { base: PathBuf, path: PathBuf },
}

#[derive(thiserror::Error, Debug)]
pub enum PreflightError {
    #[error("build environment is unusable: {}", errors.join("; "))]
    EnvironmentUnusable { errors: Vec<String> },
}

#[derive(thiserror::Error, Debug)]
pub enum ContextError {
    #[error("context path {path:?} does not exist")]
    PathNotFound { path: PathBuf },

    #[error("context path {path:?} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("context sub path {sub_path:?} does not exist under {base:?}")]
    SubPathNotFound { sub_path: String, base: PathBuf },

    #[error("invalid git context url {url:?}: {reason}")]
    InvalidGitUrl { url: String, reason: String },

    #[error("cannot read git token file {path:?}: {raw_error}")]
    TokenFileUnreadable {
        path: PathBuf,
        raw_error: std::io::Error,
    },

    #[error("git operation failed on {url}: {raw_error}")]
    GitOperation {
        // url is pre-redacted, never contains a token
        url: String,
        raw_error: git2::Error,
    },

    #[error("i/o error while {action}: {raw_error}")]
    Io {
        action: &'static str,
        raw_error: std::io::Error,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("cannot read registry auth config {path:?}: {raw_error}")]
    UnreadableConfig {
        path: PathBuf,
        raw_error: std::io::Error,
    },

    #[error("malformed registry auth config {path:?}: {raw_error}")]
    MalformedConfig {
        path: PathBuf,
        raw_error: serde_json::Error,
    },

    #[error("registry auth config {path:?} has an unrecognized shape")]
    UnknownConfigShape { path: PathBuf },

    #[error("credential helper {helper:?} is not in the allowed set")]
    HelperNotAllowed { helper: String },

    #[error("credential helper {helper} failed for registry {registry}: {details}")]
    HelperFailed {
        helper: String,
        registry: String,
        details: String,
    },

    #[error("credential helper {helper} returned malformed output: {raw_error}")]
    HelperMalformedOutput {
        helper: String,
        raw_error: serde_json::Error,
    },

    #[error("i/o error while {action}: {raw_error}")]
    Io {
        action: &'static str,
        raw_error: std::io::Error,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("no container build backend found in PATH: install buildctl (BuildKit) or buildah")]
    NoBackendAvailable,

    #[error("{backend} could not be started: {raw_error}")]
    BackendStart {
        backend: &'static str,
        raw_error: std::io::Error,
    },

    #[error("{backend} terminated with a non success exit status: {exit_status}")]
    BackendFailed {
        backend: &'static str,
        exit_status: ExitStatus,
    },

    #[error("build aborted by cancellation request")]
    Aborted,
}

#[derive(thiserror::Error, Debug)]
pub enum PushError {
    #[error("push of {destination} failed with a transient error: {details}")]
    Transient { destination: String, details: String },

    #[error("push of {destination} failed: {details}")]
    Fatal { destination: String, details: String },

    #[error("push of {destination} still failing after {attempts} attempts: {details}")]
    RetriesExhausted {
        destination: String,
        attempts: u32,
        details: String,
    },

    #[error("push of {destination} aborted by cancellation request")]
    Aborted { destination: String },
}

impl PushError {
    pub fn destination(&self) -> &str {
        match self {
            PushError::Transient { destination, .. }
            | PushError::Fatal { destination, .. }
            | PushError::RetriesExhausted { destination, .. }
            | PushError::Aborted { destination } => destination,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PushError::Transient { .. })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SignError {
    #[error("cosign binary not found in PATH")]
    CosignNotFound,

    #[error("signing password env var {env_var} is not set")]
    MissingPassword { env_var: String },

    #[error("cosign failed to sign {reference}: {details}")]
    SigningFailed { reference: String, details: String },
}

/// Top level error of the build pipeline. Every fatal exit funnels through
/// this type so the binary has a single place mapping causes to exit codes.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error(transparent)]
    Sign(#[from] SignError),
}

impl PipelineError {
    /// 0 is success, 1 covers validation/auth/build/push/sign failures,
    /// 2 is reserved for a preflight refusal.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Preflight(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let err = PipelineError::from(PreflightError::EnvironmentUnusable {
            errors: vec!["running as root".to_string()],
        });
        assert_eq!(err.exit_code(), 2);

        let err = PipelineError::from(ConfigError::MissingOutputIntent);
        assert_eq!(err.exit_code(), 1);

        let err = PipelineError::from(PushError::Fatal {
            destination: "example.com/app:1".to_string(),
            details: "unauthorized".to_string(),
        });
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_push_error_destination() {
        let err = PushError::RetriesExhausted {
            destination: "example.com/app:1".to_string(),
            attempts: 3,
            details: "503".to_string(),
        };
        assert_eq!(err.destination(), "example.com/app:1");
        assert!(!err.is_transient());
    }
}
