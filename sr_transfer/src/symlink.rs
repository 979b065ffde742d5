//! Transfer by linking the destination to the source.
use crate::agent::TransferAgent;
use crate::errors::SymlinkError;
use anyhow::Result;
use log::warn;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct SymlinkAgent {
    pub src_path: PathBuf,
    pub dest_path: PathBuf,
    /// Replace an existing destination instead of refusing.
    pub overwrite: bool,
    pub validate: bool,
}

impl SymlinkAgent {
    pub fn new(src_path: &Path, dest_path: &Path) -> SymlinkAgent {
        SymlinkAgent {
            src_path: src_path.to_path_buf(),
            dest_path: dest_path.to_path_buf(),
            overwrite: true,
            validate: true,
        }
    }

    fn remove_existing(&self, meta: &fs::Metadata) -> Result<()> {
        let path = &self.dest_path;
        let file_type = meta.file_type();
        if file_type.is_symlink() || file_type.is_file() {
            fs::remove_file(path).map_err(|source| SymlinkError::Io {
                action: "remove",
                path: path.clone(),
                source,
            })?;
        } else if file_type.is_dir() {
            if is_mount_point(path)? {
                return Err(SymlinkError::MountPoint { path: path.clone() }.into());
            }
            fs::remove_dir_all(path).map_err(|source| SymlinkError::Io {
                action: "remove directory",
                path: path.clone(),
                source,
            })?;
        } else {
            return Err(SymlinkError::UnsupportedEntry { path: path.clone() }.into());
        }
        Ok(())
    }
}

/// True if `path` is a directory on a different device than its parent, or
/// is the filesystem root.
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let meta = fs::symlink_metadata(path).map_err(|source| SymlinkError::Io {
        action: "inspect",
        path: path.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Ok(false);
    }
    let parent = fs::metadata(path.join("..")).map_err(|source| SymlinkError::Io {
        action: "inspect parent of",
        path: path.to_path_buf(),
        source,
    })?;
    Ok(meta.dev() != parent.dev() || meta.ino() == parent.ino())
}

impl TransferAgent for SymlinkAgent {
    fn src_path(&self) -> &Path {
        &self.src_path
    }

    fn dest_path(&self) -> Option<&Path> {
        Some(&self.dest_path)
    }

    fn transfer(&self) -> Result<bool> {
        self.validate_src_path()?;
        self.validate_dest_path()?;
        let dest = &self.dest_path;

        if let Ok(meta) = fs::symlink_metadata(dest) {
            if !self.overwrite {
                warn!(
                    "{} exists and overwrite is disabled, not linking {}",
                    dest.display(),
                    self.src_path.display()
                );
                return Ok(false);
            }
            self.remove_existing(&meta)?;
        }

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SymlinkError::Io {
                action: "create directory",
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::os::unix::fs::symlink(&self.src_path, dest).map_err(|source| SymlinkError::Io {
            action: "create link",
            path: dest.clone(),
            source,
        })?;

        if self.validate {
            return self.validate_transfer();
        }
        Ok(true)
    }

    /// The destination must be a link resolving to the source.
    fn validate_transfer(&self) -> Result<bool> {
        let is_link = fs::symlink_metadata(&self.dest_path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            return Ok(false);
        }
        match (
            fs::canonicalize(&self.dest_path),
            fs::canonicalize(&self.src_path),
        ) {
            (Ok(dest), Ok(src)) => Ok(dest == src),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransferError;
    use tempfile::tempdir;

    #[test]
    fn test_link_creates_missing_parents() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("src.txt");
        fs::write(&src, "data")?;
        let dest = dir.path().join("a/b/c/dest.txt");

        assert!(SymlinkAgent::new(&src, &dest).transfer()?);
        assert_eq!(fs::read_link(&dest)?, src);
        assert_eq!(fs::read_to_string(&dest)?, "data");
        Ok(())
    }

    #[test]
    fn test_missing_source_creates_nothing() -> Result<()> {
        let dir = tempdir()?;
        let dest = dir.path().join("parent/dest");
        let err = SymlinkAgent::new(&dir.path().join("missing"), &dest)
            .transfer()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::MissingSource { .. })
        ));
        assert!(!dir.path().join("parent").exists());
        Ok(())
    }

    #[test]
    fn test_no_overwrite_leaves_destination() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("src.txt");
        let dest = dir.path().join("dest.txt");
        fs::write(&src, "new")?;
        fs::write(&dest, "old")?;

        let mut agent = SymlinkAgent::new(&src, &dest);
        agent.overwrite = false;
        assert!(!agent.transfer()?);
        assert!(!fs::symlink_metadata(&dest)?.file_type().is_symlink());
        assert_eq!(fs::read_to_string(&dest)?, "old");
        Ok(())
    }

    #[test]
    fn test_overwrite_file_and_link() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("src.txt");
        let dest = dir.path().join("dest.txt");
        fs::write(&src, "new")?;
        fs::write(&dest, "old")?;

        let agent = SymlinkAgent::new(&src, &dest);
        assert!(agent.transfer()?);
        assert_eq!(fs::read_to_string(&dest)?, "new");
        // an existing link is replaced as well
        assert!(agent.transfer()?);
        assert_eq!(fs::read_link(&dest)?, src);
        Ok(())
    }

    #[test]
    fn test_overwrite_directory() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        fs::create_dir(&src)?;
        fs::create_dir_all(dest.join("nested"))?;
        fs::write(dest.join("nested/file.txt"), "old")?;

        assert!(SymlinkAgent::new(&src, &dest).transfer()?);
        assert!(fs::symlink_metadata(&dest)?.file_type().is_symlink());
        assert!(!src.join("nested").exists());
        Ok(())
    }

    #[test]
    fn test_os_failure_is_a_symlink_error() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("src.txt");
        let blocker = dir.path().join("blocker");
        fs::write(&src, "data")?;
        fs::write(&blocker, "a file where a directory is needed")?;

        let err = SymlinkAgent::new(&src, &blocker.join("sub/dest"))
            .transfer()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SymlinkError>(),
            Some(SymlinkError::Io {
                action: "create directory",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_mount_point() -> Result<()> {
        let dir = tempdir()?;
        assert!(is_mount_point(Path::new("/"))?);
        assert!(!is_mount_point(dir.path())?);
        Ok(())
    }

    #[test]
    fn test_mount_point_is_never_replaced() -> Result<()> {
        // procfs refuses removal, so a broken check cannot destroy anything
        let mount = Path::new("/proc");
        if !mount.is_dir() || !is_mount_point(mount)? {
            return Ok(());
        }
        let dir = tempdir()?;
        let src = dir.path().join("src");
        fs::create_dir(&src)?;

        let agent = SymlinkAgent::new(&src, mount);
        assert!(agent.overwrite);
        let err = agent.transfer().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SymlinkError>(),
            Some(SymlinkError::MountPoint { path }) if path == mount
        ));
        let meta = fs::symlink_metadata(mount)?;
        assert!(meta.is_dir());
        assert!(!meta.file_type().is_symlink());
        assert!(is_mount_point(mount)?);
        Ok(())
    }

    #[test]
    fn test_validate_transfer() -> Result<()> {
        let dir = tempdir()?;
        let src = dir.path().join("src.txt");
        let other = dir.path().join("other.txt");
        let dest = dir.path().join("dest.txt");
        fs::write(&src, "data")?;
        fs::write(&other, "data")?;

        let agent = SymlinkAgent::new(&src, &dest);
        assert!(!agent.validate_transfer()?);
        std::os::unix::fs::symlink(&other, &dest)?;
        assert!(!agent.validate_transfer()?);
        assert!(agent.transfer()?);
        assert!(agent.validate_transfer()?);
        Ok(())
    }
}
