// Startup checks on the directory holding the tunnel document

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::{debug, info};
use tunnel_panel_common::Error;

/// Uid and gid the daemon runs as
pub fn current_ids() -> (u32, u32) {
    // SAFETY: getuid/getgid cannot fail and touch no memory
    unsafe { (libc::getuid(), libc::getgid()) }
}

/// Refuse to serve a config directory that is missing or owned by someone else
pub fn check_config_directory(dir: &Path) -> Result<(), Error> {
    let metadata = match fs::metadata(dir) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::Config(format!(
                "config directory {} does not exist",
                dir.display()
            )));
        }
        Err(e) => {
            return Err(Error::Config(format!(
                "cannot inspect config directory {}: {}",
                dir.display(),
                e
            )));
        }
    };

    if !metadata.is_dir() {
        return Err(Error::Config(format!(
            "config path {} is not a directory",
            dir.display()
        )));
    }

    let (uid, gid) = current_ids();
    verify_ownership(dir, (metadata.uid(), metadata.gid()), (uid, gid))?;

    info!("Config directory {} owned by {}:{}", dir.display(), uid, gid);
    Ok(())
}

/// Compare a directory's owner against the expected uid/gid
pub fn verify_ownership(dir: &Path, actual: (u32, u32), expected: (u32, u32)) -> Result<(), Error> {
    debug!(
        "Ownership of {}: {}:{} (expected {}:{})",
        dir.display(),
        actual.0,
        actual.1,
        expected.0,
        expected.1
    );

    if actual != expected {
        return Err(Error::PermissionDenied(format!(
            "{} is owned by {}:{} but the daemon runs as {}:{}",
            dir.display(),
            actual.0,
            actual.1,
            expected.0,
            expected.1
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_own_directory_passes() {
        let temp_dir = TempDir::new().unwrap();
        assert!(check_config_directory(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_missing_directory_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("tunnels");

        let err = check_config_directory(&missing).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_file_is_not_a_config_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("config.yaml");
        fs::write(&file, "tunnels: []\n").unwrap();

        let err = check_config_directory(&file).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_foreign_owner_is_rejected() {
        let dir = Path::new("/srv/tunnels");
        assert!(verify_ownership(dir, (1000, 1000), (1000, 1000)).is_ok());

        let err = verify_ownership(dir, (0, 0), (1000, 1000)).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        // Group alone is enough to refuse
        let err = verify_ownership(dir, (1000, 0), (1000, 1000)).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }
}
