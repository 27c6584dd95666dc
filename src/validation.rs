use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ValidationError;

// Everything in this module is a pure predicate guarding a trust boundary:
// values cross into argv or filesystem calls only after passing here.

const FORBIDDEN_CHARS: &[char] = &[
    '\0', ';', '|', '&', '$', '`', '\n', '\r', '<', '>', '(', ')',
];

static GIT_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9/_.\-]*[A-Za-z0-9])?$").unwrap());

static OCI_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$").unwrap()
});

static IMAGE_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._\-]{0,127}$").unwrap());

static SHA256_DIGEST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^sha256:[0-9a-f]{64}$").unwrap());

static DNS_LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9\-]*[a-z0-9])?$").unwrap());

static BUILD_ARG_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").unwrap());

static LABEL_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9._/\-]*[a-z0-9])?$").unwrap());

const PLATFORM_OS: &[&str] = &[
    "linux", "darwin", "windows", "freebsd", "netbsd", "openbsd", "solaris", "aix",
];

const PLATFORM_ARCH: &[&str] = &[
    "amd64", "arm64", "arm", "386", "ppc64le", "ppc64", "s390x", "mips64le", "mips64", "riscv64",
];

pub fn has_forbidden_chars(value: &str) -> bool {
    value.chars().any(|c| FORBIDDEN_CHARS.contains(&c))
}

fn reject_forbidden(what: &'static str, value: &str) -> Result<(), ValidationError> {
    if has_forbidden_chars(value) {
        return Err(ValidationError::ForbiddenCharacters {
            what,
            value: value.to_string(),
        });
    }
    Ok(())
}

pub fn validate_git_ref(value: &str) -> Result<(), ValidationError> {
    reject_forbidden("git ref", value)?;

    let err = |reason: &str| ValidationError::InvalidGitRef {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(err("empty"));
    }
    if value.len() > 256 {
        return Err(err("longer than 256 characters"));
    }
    if value.contains("..") {
        return Err(err("contains `..`"));
    }
    if value.starts_with('/') || value.ends_with('/') {
        return Err(err("leading or trailing `/`"));
    }
    if value.contains("//") {
        return Err(err("contains `//`"));
    }
    if !GIT_REF_RE.is_match(value) {
        return Err(err("contains characters outside [A-Za-z0-9/_.-]"));
    }

    Ok(())
}

/// Splits an image name into its optional registry host and repository path.
/// The first `/` separated component is a registry only when it contains a
/// `.` or `:`, or is exactly `localhost`.
pub fn split_registry(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            (Some(first), rest)
        }
        _ => (None, name),
    }
}

pub fn validate_image_name(value: &str) -> Result<(), ValidationError> {
    reject_forbidden("image name", value)?;

    let err = |reason: &str| ValidationError::InvalidImageName {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(err("empty"));
    }
    if value.len() > 255 {
        return Err(err("longer than 255 characters"));
    }

    let (registry, path) = split_registry(value);
    if let Some(host) = registry {
        validate_registry_host(host).map_err(|_| err("invalid registry host component"))?;
    }

    if !OCI_PATH_RE.is_match(path) {
        return Err(err("repository path is not a lowercase OCI path"));
    }

    Ok(())
}

pub fn validate_image_tag(value: &str) -> Result<(), ValidationError> {
    reject_forbidden("image tag", value)?;

    if value.len() > 128 || !IMAGE_TAG_RE.is_match(value) {
        return Err(ValidationError::InvalidImageTag {
            value: value.to_string(),
        });
    }

    Ok(())
}

/// A destination image reference, decomposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Tag to use when talking to a registry; `latest` when unspecified.
    pub fn effective_tag(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Parses and validates `name[:tag][@sha256:<64 hex>]`. A `:` counts as a
/// tag separator only when it appears after the final `/`, so
/// `registry.io:5000/app` is a name with a registry port, not a tag.
pub fn validate_image_reference(value: &str) -> Result<ImageReference, ValidationError> {
    reject_forbidden("image reference", value)?;

    let err = |reason: &str| ValidationError::InvalidImageReference {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let (rest, digest) = match value.split_once('@') {
        Some((rest, digest)) => {
            if !SHA256_DIGEST_RE.is_match(digest) {
                return Err(err("digest is not sha256:<64 hex>"));
            }
            (rest, Some(digest.to_string()))
        }
        None => (value, None),
    };

    let tag_separator = match rest.rfind('/') {
        Some(slash) => rest[slash..].find(':').map(|i| slash + i),
        None => rest.find(':'),
    };

    let (name, tag) = match tag_separator {
        Some(idx) => {
            let (name, tag) = rest.split_at(idx);
            (name, Some(tag[1..].to_string()))
        }
        None => (rest, None),
    };

    if name.is_empty() {
        return Err(err("empty name"));
    }
    validate_image_name(name)?;
    if let Some(tag) = &tag {
        validate_image_tag(tag)?;
    }

    Ok(ImageReference {
        name: name.to_string(),
        tag,
        digest,
    })
}

/// Lexically normalizes a path, resolving `.` and `..` without touching the
/// filesystem, so the containment check works for paths that do not exist yet.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

pub fn validate_path_within_base(base: &Path, path: &Path) -> Result<PathBuf, ValidationError> {
    let abs_base = normalize_lexically(base);
    let abs_path = if path.is_absolute() {
        normalize_lexically(path)
    } else {
        normalize_lexically(&abs_base.join(path))
    };

    if !abs_path.starts_with(&abs_base) {
        return Err(ValidationError::PathEscapesBase {
            base: abs_base,
            path: abs_path,
        });
    }

    Ok(abs_path)
}

pub fn validate_registry_host(value: &str) -> Result<(), ValidationError> {
    reject_forbidden("registry host", value)?;

    let err = |reason: &str| ValidationError::InvalidRegistryHost {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(err("empty"));
    }
    if value.len() > 253 {
        return Err(err("longer than 253 characters"));
    }

    let lowered = value.to_ascii_lowercase();
    let (host, port) = match lowered.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (lowered.as_str(), None),
    };

    if let Some(port) = port {
        let port_num: u32 = port.parse().map_err(|_| err("port is not numeric"))?;
        if port_num == 0 || port_num > 99999 {
            return Err(err("port out of range 1-99999"));
        }
    }

    if host.is_empty() || host.split('.').any(|label| !DNS_LABEL_RE.is_match(label)) {
        return Err(err("not a valid DNS name"));
    }

    Ok(())
}

pub fn validate_build_arg_key(value: &str) -> Result<(), ValidationError> {
    if value.len() > 128 || !BUILD_ARG_KEY_RE.is_match(value) {
        return Err(ValidationError::InvalidBuildArgKey {
            value: value.to_string(),
        });
    }
    Ok(())
}

pub fn validate_build_arg_value(key: &str, value: &str) -> Result<(), ValidationError> {
    if value.contains('\0') {
        return Err(ValidationError::ForbiddenCharacters {
            what: "build arg value",
            value: format!("{key}=<value>"),
        });
    }
    Ok(())
}

pub fn validate_label_key(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || !LABEL_KEY_RE.is_match(value) {
        return Err(ValidationError::InvalidLabelKey {
            value: value.to_string(),
        });
    }
    Ok(())
}

pub fn validate_platform(value: &str) -> Result<(), ValidationError> {
    reject_forbidden("platform", value)?;

    let err = |reason: &str| ValidationError::InvalidPlatform {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = value.split('/').collect();
    let (os, arch, variant) = match parts.as_slice() {
        [os, arch] => (*os, *arch, None),
        [os, arch, variant] => (*os, *arch, Some(*variant)),
        _ => return Err(err("expected os/arch or os/arch/variant")),
    };

    if !PLATFORM_OS.contains(&os) {
        return Err(err("unknown os"));
    }
    if !PLATFORM_ARCH.contains(&arch) {
        return Err(err("unknown architecture"));
    }
    if let Some(variant) = variant {
        let valid = variant.len() > 1
            && variant.starts_with('v')
            && variant[1..].chars().all(|c| c.is_ascii_digit());
        if !valid {
            return Err(err("variant must be v<digits>"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_git_ref() {
        assert!(validate_git_ref("main").is_ok());
        assert!(validate_git_ref("feature/add-login").is_ok());
        assert!(validate_git_ref("v1.2.3").is_ok());
        assert!(validate_git_ref("release_2024-01").is_ok());

        assert!(validate_git_ref("").is_err());
        assert!(validate_git_ref("/main").is_err());
        assert!(validate_git_ref("main/").is_err());
        assert!(validate_git_ref("a//b").is_err());
        assert!(validate_git_ref("a..b").is_err());
        assert!(validate_git_ref("main; rm -rf /").is_err());
        assert!(validate_git_ref(&"x".repeat(257)).is_err());
        assert!(validate_git_ref("-main").is_err());
    }

    #[test]
    fn test_split_registry() {
        assert_eq!(split_registry("app"), (None, "app"));
        assert_eq!(split_registry("library/app"), (None, "library/app"));
        assert_eq!(split_registry("example.com/app"), (Some("example.com"), "app"));
        assert_eq!(
            split_registry("registry.io:5000/team/app"),
            (Some("registry.io:5000"), "team/app")
        );
        assert_eq!(split_registry("localhost/app"), (Some("localhost"), "app"));
    }

    #[test]
    fn test_image_name() {
        assert!(validate_image_name("app").is_ok());
        assert!(validate_image_name("library/nginx").is_ok());
        assert!(validate_image_name("example.com/team/app").is_ok());
        assert!(validate_image_name("registry.io:5000/app").is_ok());
        assert!(validate_image_name("localhost/app").is_ok());
        assert!(validate_image_name("example.com/app__server").is_ok());

        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("App").is_err());
        assert!(validate_image_name("example.com/App").is_err());
        assert!(validate_image_name("app$(whoami)").is_err());
        assert!(validate_image_name(&format!("example.com/{}", "a".repeat(300))).is_err());
    }

    #[test]
    fn test_image_tag() {
        assert!(validate_image_tag("latest").is_ok());
        assert!(validate_image_tag("v1.2.3").is_ok());
        assert!(validate_image_tag("_build").is_ok());
        assert!(validate_image_tag("1.0-rc.1").is_ok());

        assert!(validate_image_tag("").is_err());
        assert!(validate_image_tag(".hidden").is_err());
        assert!(validate_image_tag("-dash").is_err());
        assert!(validate_image_tag(&"t".repeat(129)).is_err());
    }

    #[test]
    fn test_image_reference_with_registry_port() {
        // the colon after registry.io is a port, the one after app is the tag
        let parsed = validate_image_reference("registry.io:5000/app:tag").unwrap();
        assert_eq!(parsed.name, "registry.io:5000/app");
        assert_eq!(parsed.tag.as_deref(), Some("tag"));
        assert_eq!(parsed.digest, None);
    }

    #[test]
    fn test_image_reference_forms() {
        let parsed = validate_image_reference("example.com/a").unwrap();
        assert_eq!(parsed.tag, None);
        assert_eq!(parsed.effective_tag(), "latest");

        let parsed = validate_image_reference("example.com/a:v1").unwrap();
        assert_eq!(parsed.tag.as_deref(), Some("v1"));

        let digest = format!("sha256:{}", "a".repeat(64));
        let parsed = validate_image_reference(&format!("example.com/a:v1@{digest}")).unwrap();
        assert_eq!(parsed.digest.as_deref(), Some(digest.as_str()));

        assert!(validate_image_reference("example.com/a@sha256:beef").is_err());
        assert!(validate_image_reference("example.com/a:UPPER:tag").is_err());
        assert!(validate_image_reference("example.com/a:v1;id").is_err());
    }

    #[test]
    fn test_path_within_base() {
        let base = Path::new("/work/context");
        assert!(validate_path_within_base(base, Path::new("svc")).is_ok());
        assert!(validate_path_within_base(base, Path::new("/work/context/svc/api")).is_ok());
        assert_eq!(
            validate_path_within_base(base, Path::new("a/./b")).unwrap(),
            PathBuf::from("/work/context/a/b")
        );

        assert!(validate_path_within_base(base, Path::new("../outside")).is_err());
        assert!(validate_path_within_base(base, Path::new("/etc/passwd")).is_err());
        assert!(validate_path_within_base(base, Path::new("svc/../../../etc")).is_err());
    }

    #[test]
    fn test_registry_host() {
        assert!(validate_registry_host("docker.io").is_ok());
        assert!(validate_registry_host("REGISTRY.EXAMPLE.COM").is_ok());
        assert!(validate_registry_host("registry.io:5000").is_ok());
        assert!(validate_registry_host("localhost:99999").is_ok());

        assert!(validate_registry_host("").is_err());
        assert!(validate_registry_host("registry.io:0").is_err());
        assert!(validate_registry_host("registry.io:100000").is_err());
        assert!(validate_registry_host("registry.io:abc").is_err());
        assert!(validate_registry_host("-bad.example.com").is_err());
        assert!(validate_registry_host(&format!("{}.com", "a".repeat(260))).is_err());
    }

    #[test]
    fn test_build_arg_key() {
        assert!(validate_build_arg_key("HTTP_PROXY").is_ok());
        assert!(validate_build_arg_key("_INTERNAL").is_ok());
        assert!(validate_build_arg_key("V2").is_ok());

        assert!(validate_build_arg_key("").is_err());
        assert!(validate_build_arg_key("2FA").is_err());
        assert!(validate_build_arg_key("http_proxy").is_err());
        assert!(validate_build_arg_key("KEY-NAME").is_err());
        assert!(validate_build_arg_key(&"K".repeat(129)).is_err());
    }

    #[test]
    fn test_label_key() {
        assert!(validate_label_key("maintainer").is_ok());
        assert!(validate_label_key("org.opencontainers.image.source").is_ok());
        assert!(validate_label_key("a").is_ok());

        assert!(validate_label_key("").is_err());
        assert!(validate_label_key("Maintainer").is_err());
        assert!(validate_label_key(".leading").is_err());
        assert!(validate_label_key("trailing.").is_err());
    }

    #[test]
    fn test_platform() {
        assert!(validate_platform("linux/amd64").is_ok());
        assert!(validate_platform("linux/arm/v7").is_ok());
        assert!(validate_platform("darwin/arm64").is_ok());
        assert!(validate_platform("linux/riscv64").is_ok());

        assert!(validate_platform("linux").is_err());
        assert!(validate_platform("plan9/amd64").is_err());
        assert!(validate_platform("linux/sparc").is_err());
        assert!(validate_platform("linux/arm/7").is_err());
        assert!(validate_platform("linux/amd64/v2/extra").is_err());
    }

    #[test]
    fn test_forbidden_characters() {
        for c in [';', '|', '&', '$', '`', '<', '>', '(', ')', '\n'] {
            let value = format!("name{c}");
            assert!(validate_image_name(&value).is_err(), "accepted {c:?}");
        }
    }
}
