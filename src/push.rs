use std::cell::Cell;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use retry::OperationResult;
use retry::delay::Exponential;

use crate::backend::{BuildInvocation, PushStep};
use crate::cmd::command::{CommandError, CommandKiller, ExecutableCommand, HostCommand};
use crate::errors::PushError;
use crate::registry::auth::AuthArtifacts;
use crate::registry::{DOCKER_HUB_REGISTRY, extract_registry, normalize_registry_url};
use crate::validation::{ImageReference, split_registry};

static DIGEST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"sha256:[0-9a-f]{64}").unwrap());

const MAX_PUSH_CONCURRENCY: usize = 4;
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Error categories worth retrying: infrastructure hiccups, not user
/// mistakes. Auth, naming and quota failures surface immediately.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "broken pipe",
    "timeout",
    "timed out",
    "tls handshake",
    "temporarily unavailable",
    "status 500",
    "status 502",
    "status 503",
    "status 504",
    "500 internal",
    "502 bad gateway",
    "503 service",
    "504 gateway",
    "i/o error",
];

pub fn is_transient_failure(details: &str) -> bool {
    let lowered = details.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Terminal state of one destination push.
#[derive(Debug)]
pub struct PushOutcome {
    pub destination: ImageReference,
    pub attempts: u32,
    pub digest: Option<String>,
    pub error: Option<PushError>,
}

impl PushOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs an invocation streaming its output to the logger, returning the
/// tail of both streams for failure classification and digest scraping.
pub fn run_streamed(invocation: &BuildInvocation, killer: &CommandKiller) -> (Result<(), CommandError>, Vec<String>) {
    info!("running: {}", invocation.display());

    let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
    let envs: Vec<(&str, &str)> = invocation
        .envs
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let mut cmd = HostCommand::new(&invocation.program, &args, &envs);
    if let Some(dir) = &invocation.working_dir {
        cmd.set_current_dir(dir);
    }

    const TAIL_LINES: usize = 64;
    let tail = Mutex::new(Vec::with_capacity(TAIL_LINES));
    let keep = |line: String| {
        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.len() >= TAIL_LINES {
            tail.remove(0);
        }
        tail.push(line);
    };

    let result = cmd.exec_with_abort(
        &mut |line| {
            info!("{}", line);
            keep(line);
        },
        &mut |line| {
            warn!("{}", line);
            keep(line);
        },
        killer,
    );

    (result, tail.into_inner().unwrap_or_else(|e| e.into_inner()))
}

/// Pushes one destination with up to `push_retry + 1` attempts, exponential
/// backoff from 1s capped at 30s, retrying only transient categories.
fn push_with_retries(
    step: &PushStep,
    push_retry: u32,
    cancel: &AtomicBool,
    push_once: &(dyn Fn(&PushStep) -> Result<(), PushError> + Sync),
) -> PushOutcome {
    let attempts = Cell::new(0u32);

    let delays = Exponential::from_millis(BACKOFF_START.as_millis() as u64)
        .map(|delay| delay.min(BACKOFF_CAP))
        .take(push_retry as usize);

    let result = retry::retry(delays, || {
        if cancel.load(Ordering::Acquire) {
            return OperationResult::Err(PushError::Aborted {
                destination: step.destination.to_string(),
            });
        }

        attempts.set(attempts.get() + 1);
        match push_once(step) {
            Ok(()) => OperationResult::Ok(()),
            Err(err) if err.is_transient() => {
                warn!(
                    "transient push failure for {} (attempt {}): {}",
                    step.destination,
                    attempts.get(),
                    err
                );
                OperationResult::Retry(err)
            }
            Err(err) => OperationResult::Err(err),
        }
    });

    let error = match result {
        Ok(()) => None,
        Err(retry::Error { error, .. }) => match error {
            PushError::Transient { destination, details } => Some(PushError::RetriesExhausted {
                destination,
                attempts: attempts.get(),
                details,
            }),
            other => Some(other),
        },
    };

    PushOutcome {
        destination: step.destination.clone(),
        attempts: attempts.get(),
        digest: None,
        error,
    }
}

/// Pushes all destinations with bounded parallelism (min(4, n)). A failing
/// destination does not cancel its siblings; outcomes are aggregated in
/// input order.
pub fn run_pushes(
    steps: &[PushStep],
    push_retry: u32,
    cancel: &AtomicBool,
    push_once: &(dyn Fn(&PushStep) -> Result<(), PushError> + Sync),
) -> Vec<PushOutcome> {
    if steps.is_empty() {
        return Vec::new();
    }

    let workers = MAX_PUSH_CONCURRENCY.min(steps.len());
    let queue: Mutex<VecDeque<usize>> = Mutex::new((0..steps.len()).collect());
    let outcomes: Mutex<Vec<Option<PushOutcome>>> = Mutex::new((0..steps.len()).map(|_| None).collect());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let index = {
                        let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                        match queue.pop_front() {
                            Some(index) => index,
                            None => break,
                        }
                    };

                    let outcome = push_with_retries(&steps[index], push_retry, cancel, push_once);
                    let mut outcomes = outcomes.lock().unwrap_or_else(|e| e.into_inner());
                    outcomes[index] = Some(outcome);
                }
            });
        }
    });

    outcomes
        .into_inner()
        .unwrap_or_else(|e| e.into_inner())
        .into_iter()
        .flatten()
        .collect()
}

/// Production push runner: executes the synthesized invocation and
/// classifies the failure from the stderr tail.
pub fn execute_push_step(step: &PushStep, cancel: &AtomicBool) -> Result<(), PushError> {
    let is_canceled = || cancel.load(Ordering::Acquire);
    let killer = CommandKiller::from_cancelable(&is_canceled);

    let (result, stderr_tail) = run_streamed(&step.invocation, &killer);
    match result {
        Ok(()) => Ok(()),
        Err(CommandError::Killed(_)) => Err(PushError::Aborted {
            destination: step.destination.to_string(),
        }),
        Err(err) => {
            let details = if stderr_tail.is_empty() {
                err.to_string()
            } else {
                stderr_tail.join("\n")
            };
            if is_transient_failure(&details) {
                Err(PushError::Transient {
                    destination: step.destination.to_string(),
                    details,
                })
            } else {
                Err(PushError::Fatal {
                    destination: step.destination.to_string(),
                    details,
                })
            }
        }
    }
}

/// First non-empty digest source wins: the back-end digest file, a digest
/// printed on the build output, then a HEAD on the pushed tag.
pub fn resolve_digest(
    destination: &ImageReference,
    digest_file: Option<&Path>,
    output_tail: &[String],
    auth: &AuthArtifacts,
    insecure: bool,
) -> Option<String> {
    if let Some(digest) = digest_file.and_then(digest_from_file) {
        return Some(digest);
    }
    if let Some(digest) = digest_from_output(output_tail) {
        return Some(digest);
    }
    digest_from_registry_head(destination, auth, insecure)
}

/// Reads a digest from a back-end output file: either a raw digest line
/// (buildah --digestfile) or build metadata JSON carrying
/// `containerimage.digest`.
pub fn digest_from_file(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let trimmed = raw.trim();

    if let Some(found) = DIGEST_RE.find(trimmed)
        && serde_json::from_str::<serde_json::Value>(trimmed).is_err()
    {
        return Some(found.as_str().to_string());
    }

    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    value
        .get("containerimage.digest")
        .and_then(|digest| digest.as_str())
        .map(str::to_string)
}

pub fn digest_from_output(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .rev()
        .find_map(|line| DIGEST_RE.find(line).map(|m| m.as_str().to_string()))
}

/// Registry HEAD fallback: asks the registry for the manifest digest of the
/// pushed tag.
pub fn digest_from_registry_head(
    destination: &ImageReference,
    auth: &AuthArtifacts,
    insecure: bool,
) -> Option<String> {
    let registry = normalize_registry_url(&extract_registry(&destination.name));
    let (_, repository) = split_registry(&destination.name);

    // docker.io serves the API from registry-1 and prefixes official images
    let (api_host, repository) = if registry == DOCKER_HUB_REGISTRY {
        let repository = if repository.contains('/') {
            repository.to_string()
        } else {
            format!("library/{repository}")
        };
        ("registry-1.docker.io".to_string(), repository)
    } else {
        (registry.clone(), repository.to_string())
    };

    let scheme = if insecure { "http" } else { "https" };
    let url = format!("{scheme}://{api_host}/v2/{repository}/manifests/{}", destination.effective_tag());

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .danger_accept_invalid_certs(insecure)
        .build()
        .ok()?;

    let mut request = client.head(&url).header(
        reqwest::header::ACCEPT,
        "application/vnd.oci.image.index.v1+json, \
         application/vnd.docker.distribution.manifest.list.v2+json, \
         application/vnd.oci.image.manifest.v1+json, \
         application/vnd.docker.distribution.manifest.v2+json",
    );
    if let Some(credential) = auth.credential_for(&registry) {
        request = request.header(reqwest::header::AUTHORIZATION, format!("Basic {credential}"));
    }

    let response = request.send().ok()?;
    if !response.status().is_success() {
        debug!("digest HEAD on {} returned {}", url, response.status());
        return None;
    }

    response
        .headers()
        .get("docker-content-digest")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
