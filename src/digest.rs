use crate::config::Config;
use crate::fs::atomic_write;
use crate::push::PushOutcome;

/// Writes the digest output files. Failures here never fail the pipeline:
/// the image is already built and pushed, so problems are reported as
/// warnings and the exit status keeps reflecting the build/push result.
pub fn record_digests(config: &Config, outcomes: &[PushOutcome]) -> Vec<String> {
    let mut warnings = Vec::new();
    let successes: Vec<&PushOutcome> = outcomes.iter().filter(|o| o.succeeded() && o.digest.is_some()).collect();

    if let Some(path) = &config.digest_file {
        match successes.first().and_then(|o| o.digest.as_deref()) {
            Some(digest) => {
                if let Err(err) = atomic_write(path, format!("{digest}\n").as_bytes(), 0o644) {
                    warnings.push(format!("cannot write digest file {path:?}: {err}"));
                }
            }
            None => warnings.push(format!("no digest available, skipping digest file {path:?}")),
        }
    }

    if let Some(path) = &config.image_name_with_digest_file {
        match successes.first() {
            Some(outcome) => {
                let digest = outcome.digest.as_deref().unwrap_or_default();
                let line = format!("{}@{}\n", outcome.destination.name, digest);
                if let Err(err) = atomic_write(path, line.as_bytes(), 0o644) {
                    warnings.push(format!("cannot write image name with digest file {path:?}: {err}"));
                }
            }
            None => warnings.push(format!(
                "no pushed destination with digest, skipping image name file {path:?}"
            )),
        }
    }

    if let Some(path) = &config.image_name_tag_with_digest_file {
        if successes.is_empty() {
            warnings.push(format!(
                "no pushed destination with digest, skipping image name tag file {path:?}"
            ));
        } else {
            let mut contents = String::new();
            for outcome in &successes {
                let digest = outcome.digest.as_deref().unwrap_or_default();
                contents.push_str(&format!(
                    "{}:{}@{}\n",
                    outcome.destination.name,
                    outcome.destination.effective_tag(),
                    digest
                ));
            }
            if let Err(err) = atomic_write(path, contents.as_bytes(), 0o644) {
                warnings.push(format!("cannot write image name tag with digest file {path:?}: {err}"));
            }
        }
    }

    warnings
}
