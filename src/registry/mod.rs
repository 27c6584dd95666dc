pub mod auth;
pub mod helper;

use crate::validation::split_registry;

pub const DOCKER_HUB_REGISTRY: &str = "docker.io";

/// Legacy key Docker Hub credentials are stored under in older docker
/// configs; some tooling still only looks this one up.
pub const DOCKER_HUB_LEGACY_KEY: &str = "https://index.docker.io/v1/";

/// Cloud provider a registry host belongs to, when recognizable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudRegistry {
    AwsEcr,
    GoogleGcr,
    GoogleArtifactRegistry,
}

impl CloudRegistry {
    /// The docker credential helper conventionally installed for this cloud.
    pub fn helper_binary(&self) -> &'static str {
        match self {
            CloudRegistry::AwsEcr => "docker-credential-ecr-login",
            CloudRegistry::GoogleGcr => "docker-credential-gcr",
            CloudRegistry::GoogleArtifactRegistry => "docker-credential-gcloud",
        }
    }
}

/// Returns the registry host of an image reference, defaulting to Docker Hub
/// when the first component does not look like a host.
pub fn extract_registry(reference: &str) -> String {
    // trim digest, then the tag (a `:` only counts after the final `/`)
    let without_digest = reference.split('@').next().unwrap_or(reference);
    let without_tag = match without_digest.rfind('/') {
        Some(slash) => match without_digest[slash..].find(':') {
            Some(colon) => &without_digest[..slash + colon],
            None => without_digest,
        },
        None => without_digest.split(':').next().unwrap_or(without_digest),
    };

    match split_registry(without_tag) {
        (Some(host), _) => host.to_string(),
        (None, _) => DOCKER_HUB_REGISTRY.to_string(),
    }
}

/// Normalizes a registry location into the canonical host form used as a key
/// in the auth document. Idempotent.
pub fn normalize_registry_url(registry: &str) -> String {
    let mut r = registry.trim();
    for prefix in ["https://", "http://"] {
        if let Some(rest) = r.strip_prefix(prefix) {
            r = rest;
            break;
        }
    }

    let mut r = r.trim_end_matches('/');
    for suffix in ["/v1", "/v2"] {
        if let Some(rest) = r.strip_suffix(suffix) {
            r = rest;
            break;
        }
    }
    let r = r.trim_end_matches('/');

    let hub_aliases = ["index.docker.io", "registry-1.docker.io", "registry.docker.io"];
    if hub_aliases.contains(&r) {
        return DOCKER_HUB_REGISTRY.to_string();
    }

    r.to_string()
}

pub fn is_ecr(registry: &str) -> bool {
    registry.contains(".dkr.ecr.") && registry.ends_with(".amazonaws.com")
}

pub fn is_gcr(registry: &str) -> bool {
    registry == "gcr.io" || registry.ends_with(".gcr.io")
}

pub fn is_gar(registry: &str) -> bool {
    registry.ends_with("-docker.pkg.dev")
}

pub fn classify_cloud(registry: &str) -> Option<CloudRegistry> {
    if is_ecr(registry) {
        Some(CloudRegistry::AwsEcr)
    } else if is_gcr(registry) {
        Some(CloudRegistry::GoogleGcr)
    } else if is_gar(registry) {
        Some(CloudRegistry::GoogleArtifactRegistry)
    } else {
        None
    }
}
