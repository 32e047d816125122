use crate::error::{Error, IoContext, Result};
use std::io::Write;
use std::path::Path;

/// Replaces `path` with `contents` such that readers see either the old file or the complete new
/// one. The temporary file lives next to the destination so the final rename stays on one
/// filesystem. The result is world-readable (0644), as nginx may run as another user.
pub fn write_atomic<P: AsRef<Path>>(path: P, contents: &[u8]) -> Result<()> {
    write_atomic_with_mode(path, contents, 0o644)
}

/// Like [`write_atomic`], with the final file restricted to `mode` (e.g. `0o600` for secrets).
/// The mode is applied before the rename, so the file never appears with other permissions.
pub fn write_atomic_with_mode<P: AsRef<Path>>(path: P, contents: &[u8], mode: u32) -> Result<()> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .ok_or_else(|| Error::configuration(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(dir).with_path(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir).with_path(dir)?;
    file.write_all(contents).with_path(file.path().to_path_buf())?;
    set_mode(file.path(), mode)?;
    file.as_file().sync_all().with_path(file.path().to_path_buf())?;
    file.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

#[cfg(unix)]
pub fn set_mode<P: AsRef<Path>>(path: P, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let path = path.as_ref();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).with_path(path)
}

#[cfg(not(unix))]
pub fn set_mode<P: AsRef<Path>>(_path: P, _mode: u32) -> Result<()> {
    Ok(())
}

/// Removes a file. A missing file is only an error when `throw_on_missing` is set; returns whether
/// something was removed.
pub fn remove_file<P: AsRef<Path>>(path: P, throw_on_missing: bool) -> Result<bool> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !throw_on_missing => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::not_found(path.display()))
        }
        Err(e) => Err(Error::io(path, e)),
    }
}

pub fn remove_dir_all<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_creates_parents_and_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy_host").join("1.conf");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        // No temporary files left next to the destination
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_with_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials-1");

        write_atomic_with_mode(&path, b"token = abc", 0o600).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("1.conf");

        write_atomic(&path, b"server {}").unwrap();
        write_atomic_with_mode(&path, b"secret", 0o600).unwrap();
        write_atomic(&path, b"server {}").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_remove_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.conf");

        assert!(!remove_file(&path, false).unwrap());
        assert!(matches!(remove_file(&path, true), Err(Error::NotFound(_))));

        std::fs::write(&path, "x").unwrap();
        assert!(remove_file(&path, true).unwrap());
        assert!(!path.exists());
    }
}
