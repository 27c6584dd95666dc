use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::config::StorageDriver;
use crate::errors::PreflightError;

const CAP_SETGID: u32 = 6;
const CAP_SETUID: u32 = 7;
const CAP_MKNOD: u32 = 27;

const MAX_USER_NAMESPACES_SYSCTL: &str = "/proc/sys/user/max_user_namespaces";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightStatus {
    Success,
    Warning,
    Error,
}

/// Effective capability bits of the current process, plus the NoNewPrivs
/// flag that decides whether setuid helpers can still elevate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilitySnapshot {
    pub effective: u64,
    pub no_new_privs: bool,
}

impl CapabilitySnapshot {
    pub fn has(&self, cap: u32) -> bool {
        self.effective & (1u64 << cap) != 0
    }

    pub fn has_setuid_setgid(&self) -> bool {
        self.has(CAP_SETUID) && self.has(CAP_SETGID)
    }

    pub fn has_mknod(&self) -> bool {
        self.has(CAP_MKNOD)
    }
}

/// A `newuidmap`/`newgidmap` helper found in PATH.
#[derive(Debug, Clone)]
pub struct SetuidHelper {
    pub path: PathBuf,
    pub setuid_root: bool,
}

#[derive(Debug)]
pub struct PreflightReport {
    pub euid: u32,
    pub capabilities: CapabilitySnapshot,
    pub newuidmap: Option<SetuidHelper>,
    pub newgidmap: Option<SetuidHelper>,
    pub max_user_namespaces: u64,
    pub userns_probe_ok: bool,
    pub storage_driver: StorageDriver,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PreflightReport {
    pub fn status(&self) -> PreflightStatus {
        if !self.errors.is_empty() {
            PreflightStatus::Error
        } else if !self.warnings.is_empty() {
            PreflightStatus::Warning
        } else {
            PreflightStatus::Success
        }
    }

    /// Gate for the pipeline: an Error report must not proceed.
    pub fn into_result(self) -> Result<PreflightReport, PreflightError> {
        match self.status() {
            PreflightStatus::Error => Err(PreflightError::EnvironmentUnusable { errors: self.errors }),
            _ => Ok(self),
        }
    }

    /// Human readable report for `check-environment`.
    pub fn render(&self) -> String {
        let yes_no = |ok: bool| if ok { "yes" } else { "no" };
        let mut out = String::new();

        let _ = writeln!(out, "uid: {}", self.euid);
        let _ = writeln!(
            out,
            "capabilities: setuid={} setgid={} mknod={} no_new_privs={}",
            yes_no(self.capabilities.has(CAP_SETUID)),
            yes_no(self.capabilities.has(CAP_SETGID)),
            yes_no(self.capabilities.has_mknod()),
            yes_no(self.capabilities.no_new_privs),
        );
        for (name, helper) in [("newuidmap", &self.newuidmap), ("newgidmap", &self.newgidmap)] {
            match helper {
                Some(h) => {
                    let _ = writeln!(out, "{}: {} (setuid root: {})", name, h.path.display(), yes_no(h.setuid_root));
                }
                None => {
                    let _ = writeln!(out, "{name}: not found");
                }
            }
        }
        let _ = writeln!(out, "max_user_namespaces: {}", self.max_user_namespaces);
        let _ = writeln!(out, "user namespace probe: {}", yes_no(self.userns_probe_ok));
        let _ = writeln!(out, "storage driver: {}", self.storage_driver);

        for warning in &self.warnings {
            let _ = writeln!(out, "[WARN] {warning}");
        }
        for error in &self.errors {
            let _ = writeln!(out, "error: {error}");
        }

        let status = match self.status() {
            PreflightStatus::Success => "OK",
            PreflightStatus::Warning => "OK (with warnings)",
            PreflightStatus::Error => "UNUSABLE",
        };
        let _ = writeln!(out, "environment: {status}");

        out
    }
}

/// Inspects the environment and classifies it. `driver_explicit` records
/// whether the storage driver was requested by the user; explicit requests
/// turn downgrades into refusals.
pub fn run_preflight(storage_driver: StorageDriver, driver_explicit: bool) -> PreflightReport {
    let euid = unsafe { libc::geteuid() };
    let capabilities = read_capabilities().unwrap_or_default();
    let newuidmap = find_setuid_helper("newuidmap");
    let newgidmap = find_setuid_helper("newgidmap");
    let max_user_namespaces = read_max_user_namespaces();
    let userns_probe_ok = max_user_namespaces > 0 && probe_user_namespace();

    let mut report = PreflightReport {
        euid,
        capabilities,
        newuidmap,
        newgidmap,
        max_user_namespaces,
        userns_probe_ok,
        storage_driver,
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    evaluate(&mut report, driver_explicit);
    report
}

fn evaluate(report: &mut PreflightReport, driver_explicit: bool) {
    if report.euid == 0 {
        report
            .errors
            .push("running as root (UID 0): rootless builds require an unprivileged user".to_string());
    }

    // a privilege path exists either through process capabilities or through
    // usable setuid-root id-map helpers
    let helpers_usable = !report.capabilities.no_new_privs
        && report.newuidmap.as_ref().is_some_and(|h| h.setuid_root)
        && report.newgidmap.as_ref().is_some_and(|h| h.setuid_root);

    if !report.capabilities.has_setuid_setgid() && !helpers_usable {
        let mut detail = "no path to SETUID/SETGID: process lacks the capabilities and \
             setuid-root newuidmap/newgidmap are not usable"
            .to_string();
        if report.capabilities.no_new_privs {
            detail.push_str(" (NoNewPrivs is set)");
        }
        report.errors.push(detail);
    }

    if report.max_user_namespaces == 0 {
        report
            .errors
            .push(format!("user namespaces disabled ({MAX_USER_NAMESPACES_SYSCTL} is 0)"));
    } else if !report.userns_probe_ok {
        report
            .errors
            .push("user namespace creation probe failed (unshare(CLONE_NEWUSER))".to_string());
    }

    if matches!(report.storage_driver, StorageDriver::Overlay) && !report.capabilities.has_mknod() {
        let msg = "overlay storage driver without CAP_MKNOD".to_string();
        if driver_explicit {
            report.errors.push(format!("{msg}: requested driver is unusable"));
        } else {
            report.warnings.push(format!("{msg}: expect degraded behavior on some images"));
        }
    }
}

/// Parses CapEff and NoNewPrivs out of /proc/self/status.
fn read_capabilities() -> Option<CapabilitySnapshot> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    parse_proc_status(&status)
}

fn parse_proc_status(status: &str) -> Option<CapabilitySnapshot> {
    let mut effective = None;
    let mut no_new_privs = false;

    for line in status.lines() {
        if let Some(value) = line.strip_prefix("CapEff:") {
            effective = u64::from_str_radix(value.trim(), 16).ok();
        } else if let Some(value) = line.strip_prefix("NoNewPrivs:") {
            no_new_privs = value.trim() == "1";
        }
    }

    effective.map(|effective| CapabilitySnapshot {
        effective,
        no_new_privs,
    })
}

fn read_max_user_namespaces() -> u64 {
    fs::read_to_string(MAX_USER_NAMESPACES_SYSCTL)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

fn find_setuid_helper(name: &str) -> Option<SetuidHelper> {
    let path_var = std::env::var_os("PATH")?;

    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        let Ok(metadata) = candidate.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let mode = metadata.permissions().mode();
        let setuid_root = mode & 0o4000 != 0 && metadata.uid() == 0;
        return Some(SetuidHelper {
            path: candidate,
            setuid_root,
        });
    }

    None
}

/// Forks and calls unshare(CLONE_NEWUSER) in the child, so the parent never
/// changes namespaces. The child exit code carries the verdict.
fn probe_user_namespace() -> bool {
    unsafe {
        let pid = libc::fork();
        match pid {
            -1 => false,
            0 => {
                let code = if libc::unshare(libc::CLONE_NEWUSER) == 0 { 0 } else { 1 };
                libc::_exit(code);
            }
            _ => {
                let mut status: libc::c_int = 0;
                if libc::waitpid(pid, &mut status, 0) != pid {
                    return false;
                }
                libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
            }
        }
    }
}

/// True when `path` is a regular executable file; used by backend detection.
pub fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with(capabilities: CapabilitySnapshot, euid: u32) -> PreflightReport {
        PreflightReport {
            euid,
            capabilities,
            newuidmap: None,
            newgidmap: None,
            max_user_namespaces: 65536,
            userns_probe_ok: true,
            storage_driver: StorageDriver::Native,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn caps(bits: &[u32]) -> CapabilitySnapshot {
        let mut effective = 0u64;
        for bit in bits {
            effective |= 1 << bit;
        }
        CapabilitySnapshot {
            effective,
            no_new_privs: false,
        }
    }

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\tforgeron\nCapEff:\t00000000000000c0\nNoNewPrivs:\t0\n";
        let snapshot = parse_proc_status(status).unwrap();
        assert!(snapshot.has(CAP_SETGID));
        assert!(snapshot.has(CAP_SETUID));
        assert!(!snapshot.has_mknod());
        assert!(!snapshot.no_new_privs);

        let status = "CapEff:\t0000000000000000\nNoNewPrivs:\t1\n";
        let snapshot = parse_proc_status(status).unwrap();
        assert_eq!(snapshot.effective, 0);
        assert!(snapshot.no_new_privs);

        assert!(parse_proc_status("Name:\tnothing\n").is_none());
    }

    #[test]
    fn test_uid_zero_is_always_an_error() {
        let mut report = report_with(caps(&[CAP_SETUID, CAP_SETGID, CAP_MKNOD]), 0);
        evaluate(&mut report, false);

        assert_eq!(report.status(), PreflightStatus::Error);
        assert!(report.errors.iter().any(|e| e.contains("UID 0")));
    }

    #[test]
    fn test_capability_path_through_process_caps() {
        let mut report = report_with(caps(&[CAP_SETUID, CAP_SETGID, CAP_MKNOD]), 1000);
        evaluate(&mut report, false);
        assert_eq!(report.status(), PreflightStatus::Success);
    }

    #[test]
    fn test_capability_path_through_setuid_helpers() {
        let mut report = report_with(caps(&[]), 1000);
        report.newuidmap = Some(SetuidHelper {
            path: PathBuf::from("/usr/bin/newuidmap"),
            setuid_root: true,
        });
        report.newgidmap = Some(SetuidHelper {
            path: PathBuf::from("/usr/bin/newgidmap"),
            setuid_root: true,
        });
        evaluate(&mut report, false);
        assert_eq!(report.status(), PreflightStatus::Success);
    }

    #[test]
    fn test_no_new_privs_disables_setuid_helpers() {
        let mut report = report_with(
            CapabilitySnapshot {
                effective: 0,
                no_new_privs: true,
            },
            1000,
        );
        report.newuidmap = Some(SetuidHelper {
            path: PathBuf::from("/usr/bin/newuidmap"),
            setuid_root: true,
        });
        report.newgidmap = Some(SetuidHelper {
            path: PathBuf::from("/usr/bin/newgidmap"),
            setuid_root: true,
        });
        evaluate(&mut report, false);

        assert_eq!(report.status(), PreflightStatus::Error);
        assert!(report.errors.iter().any(|e| e.contains("NoNewPrivs")));
    }

    #[test]
    fn test_disabled_user_namespaces_is_an_error() {
        let mut report = report_with(caps(&[CAP_SETUID, CAP_SETGID]), 1000);
        report.max_user_namespaces = 0;
        evaluate(&mut report, false);
        assert_eq!(report.status(), PreflightStatus::Error);
    }

    #[test]
    fn test_overlay_without_mknod() {
        // implicit driver choice downgrades to a warning
        let mut report = report_with(caps(&[CAP_SETUID, CAP_SETGID]), 1000);
        report.storage_driver = StorageDriver::Overlay;
        evaluate(&mut report, false);
        assert_eq!(report.status(), PreflightStatus::Warning);

        // an explicit request fails instead
        let mut report = report_with(caps(&[CAP_SETUID, CAP_SETGID]), 1000);
        report.storage_driver = StorageDriver::Overlay;
        evaluate(&mut report, true);
        assert_eq!(report.status(), PreflightStatus::Error);
    }

    #[test]
    fn test_into_result_blocks_errors() {
        let mut report = report_with(caps(&[]), 0);
        evaluate(&mut report, false);
        assert!(report.into_result().is_err());

        let mut report = report_with(caps(&[CAP_SETUID, CAP_SETGID]), 1000);
        evaluate(&mut report, false);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_render_mentions_the_verdict() {
        let mut report = report_with(caps(&[CAP_SETUID, CAP_SETGID]), 1000);
        evaluate(&mut report, false);
        let rendered = report.render();
        assert!(rendered.contains("uid: 1000"));
        assert!(rendered.contains("environment: OK"));
    }
}
