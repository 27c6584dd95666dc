use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::errors::AuthError;
use crate::fs::write_with_mode;
use crate::registry::helper::CredentialResolver;
use crate::registry::{DOCKER_HUB_LEGACY_KEY, DOCKER_HUB_REGISTRY, classify_cloud, normalize_registry_url};

/// Environment and filesystem inputs of the materializer, snapshotted so the
/// algorithm itself stays deterministic and testable.
#[derive(Debug, Default, Clone)]
pub struct AuthSources {
    pub registry_auth_file: Option<PathBuf>,
    pub docker_config_dir: Option<PathBuf>,
    pub home: Option<PathBuf>,
    pub workspace: Option<PathBuf>,
    pub docker_username: Option<String>,
    pub docker_password: Option<String>,
    pub docker_registry: Option<String>,
}

impl AuthSources {
    pub fn from_env(workspace: Option<PathBuf>) -> Self {
        AuthSources {
            registry_auth_file: std::env::var_os("REGISTRY_AUTH_FILE").map(PathBuf::from),
            docker_config_dir: std::env::var_os("DOCKER_CONFIG").map(PathBuf::from),
            home: dirs::home_dir(),
            workspace,
            docker_username: std::env::var("DOCKER_USERNAME").ok().filter(|v| !v.is_empty()),
            docker_password: std::env::var("DOCKER_PASSWORD").ok().filter(|v| !v.is_empty()),
            docker_registry: std::env::var("DOCKER_REGISTRY").ok().filter(|v| !v.is_empty()),
        }
    }

    /// Candidate auth documents, highest priority first.
    fn candidate_paths(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Some(path) = &self.registry_auth_file {
            candidates.push(path.clone());
        }
        if let Some(dir) = &self.docker_config_dir {
            candidates.push(dir.join("config.json"));
            candidates.push(dir.join("auth.json"));
        }
        if let Some(home) = &self.home {
            candidates.push(home.join(".docker/config.json"));
            candidates.push(home.join(".config/containers/auth.json"));
        }
        if let Some(workspace) = &self.workspace {
            candidates.push(workspace.join("config.json"));
        }

        candidates
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
}

/// The docker-style source document shape. The same struct serializes the
/// emitted artifact, which is always in `auths` form.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
    #[serde(default, rename = "credHelpers", skip_serializing)]
    cred_helpers: BTreeMap<String, String>,
    #[serde(default, rename = "credsStore", skip_serializing)]
    creds_store: Option<String>,
}

/// Materialized credential view: the auth document and registries policy the
/// back-end reads, plus the env overlay pointing at them. The artifact
/// directory is owned and removed on drop.
pub struct AuthArtifacts {
    credentials: BTreeMap<String, String>,
    _artifact_dir: TempDir,
    pub auth_file: PathBuf,
    pub registries_conf: PathBuf,
    pub replicated: Vec<PathBuf>,
    pub env_overlay: Vec<(String, String)>,
    pub warnings: Vec<String>,
}

impl AuthArtifacts {
    /// Base64 `user:password` for a registry, if one is known. An empty
    /// entry (configured insecure or anonymous) yields `None`.
    pub fn credential_for(&self, registry: &str) -> Option<&str> {
        self.credentials
            .get(&normalize_registry_url(registry))
            .map(String::as_str)
            .filter(|auth| !auth.is_empty())
    }

    pub fn known_registries(&self) -> impl Iterator<Item = &str> {
        self.credentials.keys().map(String::as_str)
    }
}

pub struct AuthMaterializer<'a> {
    sources: AuthSources,
    resolver: &'a dyn CredentialResolver,
}

impl<'a> AuthMaterializer<'a> {
    pub fn new(sources: AuthSources, resolver: &'a dyn CredentialResolver) -> Self {
        AuthMaterializer { sources, resolver }
    }

    /// Produces the credential view for all destination and insecure
    /// registries, whatever the source format was.
    pub fn materialize(
        &self,
        destination_registries: &[String],
        insecure_registries: &[String],
    ) -> Result<AuthArtifacts, AuthError> {
        let mut warnings = Vec::new();
        let mut credentials: BTreeMap<String, String> = BTreeMap::new();

        let source = self.read_first_candidate(&mut warnings)?;
        if let Some((path, config)) = source {
            debug!("using registry auth source {:?}", path);
            self.ingest_source(config, &mut credentials, &mut warnings);
        }

        self.resolve_cloud_fallbacks(destination_registries, &mut credentials, &mut warnings);
        self.synthesize_from_env(destination_registries, &mut credentials);

        // every destination and insecure registry gets a key; an empty entry
        // means "no auth / insecure ok"
        for registry in destination_registries.iter().chain(insecure_registries) {
            credentials.entry(normalize_registry_url(registry)).or_default();
        }

        self.emit(credentials, insecure_registries, warnings)
    }

    fn read_first_candidate(
        &self,
        warnings: &mut Vec<String>,
    ) -> Result<Option<(PathBuf, DockerConfigFile)>, AuthError> {
        for path in self.sources.candidate_paths() {
            if !path.is_file() {
                continue;
            }

            let raw = match std::fs::read(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    // unreadable candidates are skipped, not fatal
                    warnings.push(format!("skipping unreadable auth config {path:?}: {err}"));
                    continue;
                }
            };

            // the chosen candidate must parse; a corrupt auth file silently
            // ignored would surface much later as an opaque push failure
            let value: serde_json::Value =
                serde_json::from_slice(&raw).map_err(|raw_error| AuthError::MalformedConfig {
                    path: path.clone(),
                    raw_error,
                })?;

            let config = classify_config(&path, value)?;
            return Ok(Some((path, config)));
        }

        Ok(None)
    }

    fn ingest_source(
        &self,
        config: DockerConfigFile,
        credentials: &mut BTreeMap<String, String>,
        warnings: &mut Vec<String>,
    ) {
        for (registry, entry) in &config.auths {
            let key = normalize_registry_url(registry);
            let auth = entry.auth.clone().unwrap_or_default();

            // the per-registry helper map takes precedence, then the default
            // credential store, for entries carrying no inline auth
            let helper = config
                .cred_helpers
                .get(registry)
                .or(config.creds_store.as_ref())
                .filter(|_| auth.is_empty());

            let resolved = match helper {
                Some(helper) => match self.resolver.get(helper, &key) {
                    Ok(credential) => encode_credential(&credential.username, &credential.secret),
                    Err(err) => {
                        warnings.push(format!("credential helper lookup failed for {key}: {err}"));
                        auth
                    }
                },
                None => auth,
            };

            insert_credential(credentials, key, resolved);
        }

        // helpers declared for registries absent from `auths`
        for (registry, helper) in &config.cred_helpers {
            let key = normalize_registry_url(registry);
            if credentials.get(&key).is_some_and(|auth| !auth.is_empty()) {
                continue;
            }
            match self.resolver.get(helper, &key) {
                Ok(credential) => {
                    let auth = encode_credential(&credential.username, &credential.secret);
                    insert_credential(credentials, key, auth);
                }
                Err(err) => {
                    warnings.push(format!("credential helper lookup failed for {key}: {err}"));
                }
            }
        }
    }

    /// ECR/GCR/GAR destinations without a credential get one more chance via
    /// the conventional cloud helper.
    fn resolve_cloud_fallbacks(
        &self,
        destination_registries: &[String],
        credentials: &mut BTreeMap<String, String>,
        warnings: &mut Vec<String>,
    ) {
        for registry in destination_registries {
            let key = normalize_registry_url(registry);
            if credentials.get(&key).is_some_and(|auth| !auth.is_empty()) {
                continue;
            }
            let Some(cloud) = classify_cloud(&key) else {
                continue;
            };

            match self.resolver.get(cloud.helper_binary(), &key) {
                Ok(credential) => {
                    let auth = encode_credential(&credential.username, &credential.secret);
                    insert_credential(credentials, key, auth);
                }
                Err(err) => {
                    warnings.push(format!("cloud credential helper failed for {key}: {err}"));
                }
            }
        }
    }

    /// `DOCKER_USERNAME`/`DOCKER_PASSWORD` are the last resort, used only
    /// when nothing else produced a credential.
    fn synthesize_from_env(
        &self,
        destination_registries: &[String],
        credentials: &mut BTreeMap<String, String>,
    ) {
        if credentials.values().any(|auth| !auth.is_empty()) {
            return;
        }
        let (Some(username), Some(password)) = (&self.sources.docker_username, &self.sources.docker_password)
        else {
            return;
        };

        let auth = encode_credential(username, password);
        let mut add = |registry: &str| {
            let key = normalize_registry_url(registry);
            if key == DOCKER_HUB_REGISTRY {
                // older tooling only looks up the legacy v1 key
                credentials.insert(DOCKER_HUB_LEGACY_KEY.to_string(), auth.clone());
            }
            credentials.insert(key, auth.clone());
        };

        match &self.sources.docker_registry {
            Some(registry) => add(registry),
            None => {
                for registry in destination_registries {
                    add(registry);
                }
            }
        }
    }

    fn emit(
        &self,
        credentials: BTreeMap<String, String>,
        insecure_registries: &[String],
        mut warnings: Vec<String>,
    ) -> Result<AuthArtifacts, AuthError> {
        let artifact_dir = tempfile::Builder::new()
            .prefix("forgeron-auth-")
            .tempdir()
            .map_err(|raw_error| AuthError::Io {
                action: "creating auth artifact directory",
                raw_error,
            })?;

        let document = DockerConfigFile {
            auths: credentials
                .iter()
                .map(|(registry, auth)| {
                    let entry = AuthEntry {
                        auth: Some(auth.clone()).filter(|a| !a.is_empty()),
                    };
                    (registry.clone(), entry)
                })
                .collect(),
            ..Default::default()
        };
        let rendered = serde_json::to_vec_pretty(&document).map_err(|err| AuthError::Io {
            action: "serializing auth document",
            raw_error: err.into(),
        })?;

        let auth_file = artifact_dir.path().join("config.json");
        write_with_mode(&auth_file, &rendered, 0o600).map_err(|raw_error| AuthError::Io {
            action: "writing auth document",
            raw_error,
        })?;

        // fan the document out to the locations back-ends look at on their own
        let mut replicated = Vec::new();
        if let Some(home) = &self.sources.home {
            for target in [home.join(".docker/config.json"), home.join(".config/containers/auth.json")] {
                match write_with_mode(&target, &rendered, 0o600) {
                    Ok(()) => replicated.push(target),
                    Err(err) => warnings.push(format!("cannot replicate auth document to {target:?}: {err}")),
                }
            }
        }

        let registries_conf = artifact_dir.path().join("registries.conf");
        write_with_mode(
            &registries_conf,
            render_registries_conf(insecure_registries).as_bytes(),
            0o600,
        )
        .map_err(|raw_error| AuthError::Io {
            action: "writing registries policy",
            raw_error,
        })?;

        let env_overlay = vec![
            ("REGISTRY_AUTH_FILE".to_string(), auth_file.display().to_string()),
            ("DOCKER_CONFIG".to_string(), artifact_dir.path().display().to_string()),
            (
                "CONTAINERS_REGISTRIES_CONF".to_string(),
                registries_conf.display().to_string(),
            ),
        ];

        Ok(AuthArtifacts {
            credentials,
            _artifact_dir: artifact_dir,
            auth_file,
            registries_conf,
            replicated,
            env_overlay,
            warnings,
        })
    }
}

/// Shape detection by structural inspection: a top level `auths` key is the
/// docker config form; a top level map of registry-host objects is the
/// native form; anything else is unusable.
fn classify_config(path: &Path, value: serde_json::Value) -> Result<DockerConfigFile, AuthError> {
    let serde_json::Value::Object(object) = &value else {
        return Err(AuthError::UnknownConfigShape {
            path: path.to_path_buf(),
        });
    };

    if object.contains_key("auths") || object.contains_key("credHelpers") || object.contains_key("credsStore") {
        return serde_json::from_value(value).map_err(|raw_error| AuthError::MalformedConfig {
            path: path.to_path_buf(),
            raw_error,
        });
    }

    if object.values().all(|entry| entry.is_object()) {
        let auths: BTreeMap<String, AuthEntry> =
            serde_json::from_value(value).map_err(|raw_error| AuthError::MalformedConfig {
                path: path.to_path_buf(),
                raw_error,
            })?;
        return Ok(DockerConfigFile {
            auths,
            ..Default::default()
        });
    }

    Err(AuthError::UnknownConfigShape {
        path: path.to_path_buf(),
    })
}

/// When two source keys collide under normalization, the entry carrying
/// credentials wins.
fn insert_credential(credentials: &mut BTreeMap<String, String>, key: String, auth: String) {
    match credentials.get(&key) {
        Some(existing) if !existing.is_empty() && auth.is_empty() => {}
        _ => {
            credentials.insert(key, auth);
        }
    }
}

pub fn encode_credential(username: &str, secret: &str) -> String {
    BASE64.encode(format!("{username}:{secret}"))
}

fn render_registries_conf(insecure_registries: &[String]) -> String {
    let mut out = String::from("unqualified-search-registries = ['docker.io', 'quay.io']\n");

    for registry in insecure_registries {
        let host = normalize_registry_url(registry);
        out.push_str("\n[[registry]]\n");
        out.push_str(&format!("location = \"{host}\"\n"));
        out.push_str("insecure = true\n");
    }

    out
}
