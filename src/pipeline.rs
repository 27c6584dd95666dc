use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::backend::{BackendKind, BackendPlan, adapter_for, detect_backend};
use crate::cmd::command::{CommandError, CommandKiller};
use crate::config::{Config, StorageDriver};
use crate::context::prepare_context;
use crate::digest::record_digests;
use crate::errors::{BuildError, ContextError, PipelineError, PushError};
use crate::preflight::run_preflight;
use crate::push::{PushOutcome, execute_push_step, resolve_digest, run_pushes, run_streamed};
use crate::registry::auth::{AuthArtifacts, AuthMaterializer, AuthSources};
use crate::registry::helper::HelperCommandResolver;
use crate::registry::normalize_registry_url;
use crate::sign::sign_reference;

/// Aggregated result of a full pipeline run.
pub struct PipelineSummary {
    pub backend: BackendKind,
    pub outcomes: Vec<PushOutcome>,
    pub warnings: Vec<String>,
}

/// Drives the whole build:
/// Parsed -> Preflighted -> ContextReady -> AuthReady -> Built ->
/// {Pushed | Exported | Skipped} -> Recorded.
/// The context owns any checkout it created, so cleanup runs on every exit
/// path, failures included.
pub fn run(config: &Config, cancel: &AtomicBool) -> Result<PipelineSummary, PipelineError> {
    config.validate()?;
    let mut warnings = Vec::new();

    // Preflighted
    let driver_explicit = config.storage_driver.is_some();
    let driver = config.storage_driver.unwrap_or(StorageDriver::Native);
    let report = run_preflight(driver, driver_explicit).into_result()?;
    for warning in &report.warnings {
        warn!("{}", warning);
    }
    warnings.extend(report.warnings.iter().cloned());

    let backend = detect_backend()?;
    info!("using {} back-end", backend.name());
    let adapter = adapter_for(backend);
    if let Some(driver) = config.storage_driver {
        adapter.validate_storage_driver(driver)?;
    }

    // ContextReady
    let context = prepare_context(config, backend)?;

    // AuthReady
    let insecure_registries: Vec<String> = config
        .insecure_registries
        .iter()
        .map(|registry| normalize_registry_url(registry))
        .collect();
    let resolver = HelperCommandResolver;
    let workspace = Some(context.path.clone()).filter(|path| !path.as_os_str().is_empty());
    let sources = AuthSources::from_env(workspace);
    let auth = AuthMaterializer::new(sources, &resolver)
        .materialize(&config.destination_registries(), &insecure_registries)?;
    for warning in &auth.warnings {
        warn!("{}", warning);
    }
    warnings.extend(auth.warnings.iter().cloned());

    let scratch_dir = crate::fs::workspace_directory(std::env::temp_dir(), Uuid::new_v4().to_string())
        .map_err(|raw_error| ContextError::Io {
            action: "creating scratch directory",
            raw_error,
        })?;
    let _scratch_cleanup = scopeguard::guard(scratch_dir.clone(), |dir| {
        let _ = std::fs::remove_dir_all(dir);
    });
    let plan = adapter.synthesize(config, &context, &auth, &scratch_dir)?;

    // Built
    let is_canceled = || cancel.load(Ordering::Acquire);
    let killer = CommandKiller::from_cancelable(&is_canceled);
    let (build_result, build_tail) = run_streamed(&plan.build, &killer);
    build_result.map_err(|err| build_error(backend, err))?;

    // Pushed | Exported | Skipped
    let mut outcomes = finish_outputs(config, &plan, &auth, &build_tail, cancel)?;

    // Recorded
    if !outcomes.is_empty() {
        warnings.extend(record_digests(config, &outcomes));
    }

    if config.sign {
        sign_outcomes(config, &outcomes, cancel)?;
    }

    // failed destinations were aggregated; surface the first as the exit cause
    for failed in outcomes.iter().filter(|o| !o.succeeded()) {
        let cause = failed.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
        error!("push failed for {}: {}", failed.destination, cause);
    }
    if let Some(error) = first_push_error(&mut outcomes) {
        return Err(error.into());
    }

    context.cleanup();

    Ok(PipelineSummary {
        backend,
        outcomes,
        warnings,
    })
}

fn build_error(backend: BackendKind, err: CommandError) -> PipelineError {
    let backend = match backend {
        BackendKind::BuildKit => "buildkit",
        BackendKind::Buildah => "buildah",
    };
    match err {
        CommandError::Killed(_) | CommandError::TimeoutError(_) => BuildError::Aborted.into(),
        CommandError::ExitStatusError(exit_status) => BuildError::BackendFailed { backend, exit_status }.into(),
        CommandError::ExecutionError(raw_error) => BuildError::BackendStart { backend, raw_error }.into(),
    }
}

/// Runs whatever comes after the build invocation: nothing (single-shot
/// push or no-push), the tar export step, or the per-destination pushes.
fn finish_outputs(
    config: &Config,
    plan: &BackendPlan,
    auth: &AuthArtifacts,
    build_tail: &[String],
    cancel: &AtomicBool,
) -> Result<Vec<PushOutcome>, PipelineError> {
    if let Some(tar_invocation) = &plan.tar_export {
        let is_canceled = || cancel.load(Ordering::Acquire);
        let killer = CommandKiller::from_cancelable(&is_canceled);
        let (result, _) = run_streamed(tar_invocation, &killer);
        result.map_err(|err| build_error(plan.backend, err))?;
        let tar_path = config.tar_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
        info!("image exported to {}", tar_path);
        return Ok(Vec::new());
    }

    if !plan.pushes.is_empty() {
        let push_once = |step: &crate::backend::PushStep| execute_push_step(step, cancel);
        let mut outcomes = run_pushes(&plan.pushes, config.push_retry, cancel, &push_once);

        for (outcome, step) in outcomes.iter_mut().zip(&plan.pushes) {
            if outcome.succeeded() {
                outcome.digest = resolve_digest(
                    &outcome.destination,
                    step.digest_file.as_deref(),
                    &[],
                    auth,
                    crate::backend::is_insecure_destination(config, &outcome.destination),
                );
            }
        }
        return Ok(outcomes);
    }

    // single-invocation flow: the build already pushed (or was told not to)
    if config.no_push || config.tar_path.is_some() || config.destinations.is_empty() {
        return Ok(Vec::new());
    }

    let outcomes = config
        .destinations
        .iter()
        .map(|destination| PushOutcome {
            destination: destination.clone(),
            attempts: 1,
            digest: resolve_digest(
                destination,
                plan.build_digest_file.as_deref(),
                build_tail,
                auth,
                crate::backend::is_insecure_destination(config, destination),
            ),
            error: None,
        })
        .collect();

    Ok(outcomes)
}

fn sign_outcomes(config: &Config, outcomes: &[PushOutcome], cancel: &AtomicBool) -> Result<(), PipelineError> {
    // Config::validate guarantees a key whenever sign is set
    let Some(key_path) = &config.cosign_key else {
        return Ok(());
    };

    for outcome in outcomes.iter().filter(|o| o.succeeded()) {
        let reference = match &outcome.digest {
            Some(digest) => format!("{}@{}", outcome.destination.name, digest),
            None => outcome.destination.to_string(),
        };
        sign_reference(&reference, key_path, &config.cosign_password_env, cancel)?;
    }

    Ok(())
}

/// Maps a push failure list into a final fatal error once digests for the
/// successful destinations were recorded.
pub fn first_push_error(outcomes: &mut [PushOutcome]) -> Option<PushError> {
    outcomes
        .iter_mut()
        .find(|outcome| !outcome.succeeded())
        .and_then(|outcome| outcome.error.take())
}
