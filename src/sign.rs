use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::BuildInvocation;
use crate::cmd::command::{CommandKiller, binary_in_path};
use crate::errors::SignError;
use crate::push::run_streamed;

const COSIGN_BINARY: &str = "cosign";

/// Signs one pushed reference (`name@digest`) with a cosign key pair. The
/// key password travels only through the child environment, never argv.
pub fn sign_reference(
    reference_with_digest: &str,
    key_path: &Path,
    password_env: &str,
    cancel: &AtomicBool,
) -> Result<(), SignError> {
    if binary_in_path(COSIGN_BINARY).is_none() {
        return Err(SignError::CosignNotFound);
    }

    let password = std::env::var(password_env).map_err(|_| SignError::MissingPassword {
        env_var: password_env.to_string(),
    })?;

    let args = vec![
        "sign".to_string(),
        "--key".to_string(),
        key_path.display().to_string(),
        "--yes".to_string(),
        reference_with_digest.to_string(),
    ];
    let invocation = BuildInvocation::new(COSIGN_BINARY, args).env("COSIGN_PASSWORD", &password);

    info!("signing {}", reference_with_digest);

    let is_canceled = || cancel.load(Ordering::Acquire);
    let killer = CommandKiller::from_cancelable(&is_canceled);
    let (result, stderr_tail) = run_streamed(&invocation, &killer);

    result.map_err(|err| SignError::SigningFailed {
        reference: reference_with_digest.to_string(),
        details: if stderr_tail.is_empty() {
            err.to_string()
        } else {
            stderr_tail.join("\n")
        },
    })
}
