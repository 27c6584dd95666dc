use std::fs::{self, create_dir_all};
use std::io::{Error, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

pub fn delete_file_if_exists(file: &Path) -> Result<(), Error> {
    if !file.exists() {
        return Ok(());
    }

    fs::remove_file(file)
}

/// Creates (if needed) and returns a directory for per-execution scratch
/// files, namespaced under the working root.
pub fn workspace_directory<X, S>(working_root_dir: X, execution_id: S) -> Result<PathBuf, Error>
where
    X: AsRef<Path>,
    S: AsRef<Path>,
{
    let dir = working_root_dir
        .as_ref()
        .join(".forgeron-workspace")
        .join(execution_id);

    create_dir_all(&dir)?;

    Ok(dir)
}

/// Writes `contents` to `path` with the given unix mode, creating parent
/// directories. Not atomic; use `atomic_write` for files other processes
/// may observe mid-write.
pub fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }

    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;

    Ok(())
}

/// Atomic write: temp file in the destination directory, then rename.
pub fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> Result<(), Error> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            create_dir_all(parent)?;
            parent.to_path_buf()
        }
        _ => PathBuf::from("."),
    };

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(contents)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))?;
    tmp.persist(path).map_err(|err| err.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_write_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/auth.json");

        write_with_mode(&path, b"{}", 0o600).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"{}");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digest");

        atomic_write(&path, b"sha256:aaa\n", 0o644).unwrap();
        atomic_write(&path, b"sha256:bbb\n", 0o644).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "sha256:bbb\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_delete_file_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        assert!(delete_file_if_exists(&path).is_ok());
        fs::write(&path, "x").unwrap();
        assert!(delete_file_if_exists(&path).is_ok());
        assert!(!path.exists());
    }

    #[test]
    fn test_workspace_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_directory(dir.path(), "exec-1").unwrap();
        assert!(ws.is_dir());
        assert!(ws.ends_with(".forgeron-workspace/exec-1"));
    }
}
