use std::io::Write;
use std::process::{Command, Stdio};

use serde::Deserialize;

use crate::errors::AuthError;

/// Helper binaries we are willing to execute. The name always comes from
/// this table, never from the user supplied config, so a hostile
/// `credHelpers` entry cannot name an arbitrary binary.
const ALLOWED_HELPERS: &[&str] = &[
    "docker-credential-ecr-login",
    "docker-credential-gcr",
    "docker-credential-gcloud",
    "docker-credential-desktop",
    "docker-credential-pass",
    "docker-credential-secretservice",
    "docker-credential-osxkeychain",
    "docker-credential-wincred",
];

/// Output of a `docker-credential-* get` call.
#[derive(Debug, Clone, Deserialize)]
pub struct HelperCredential {
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Secret")]
    pub secret: String,
}

/// External capability resolving a registry host to a credential.
/// Production uses the allowlisted docker credential helper binaries;
/// tests inject a fake.
pub trait CredentialResolver {
    fn get(&self, helper: &str, registry: &str) -> Result<HelperCredential, AuthError>;
}

/// Resolves the configured helper name to an allowlisted binary. Docker
/// configs name helpers by suffix (`ecr-login`), some tools by full binary
/// name; both are accepted as long as the resolved binary is in the table.
pub fn resolve_helper_binary(name: &str) -> Result<&'static str, AuthError> {
    let candidate = if name.starts_with("docker-credential-") {
        name.to_string()
    } else {
        format!("docker-credential-{name}")
    };

    ALLOWED_HELPERS
        .iter()
        .find(|allowed| **allowed == candidate)
        .copied()
        .ok_or(AuthError::HelperNotAllowed {
            helper: name.to_string(),
        })
}

/// Invokes helper binaries following the credential helper protocol:
/// registry host on stdin, `get` as the only argument, JSON on stdout.
#[derive(Debug, Default)]
pub struct HelperCommandResolver;

impl CredentialResolver for HelperCommandResolver {
    fn get(&self, helper: &str, registry: &str) -> Result<HelperCredential, AuthError> {
        let binary = resolve_helper_binary(helper)?;
        debug!("resolving credentials for {} via {}", registry, binary);

        let failed = |details: String| AuthError::HelperFailed {
            helper: binary.to_string(),
            registry: registry.to_string(),
            details,
        };

        let mut child = Command::new(binary)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| failed(format!("cannot start helper: {err}")))?;

        child
            .stdin
            .take()
            .ok_or_else(|| failed("cannot open helper stdin".to_string()))?
            .write_all(registry.as_bytes())
            .map_err(|err| failed(format!("cannot write helper stdin: {err}")))?;

        let output = child
            .wait_with_output()
            .map_err(|err| failed(format!("cannot wait for helper: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!(
                "helper exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|raw_error| AuthError::HelperMalformedOutput {
            helper: binary.to_string(),
            raw_error,
        })
    }
}
