//! On-disk state under the instance's config root. Every write goes through
//! a temp file followed by a rename so that unexpected termination leaves
//! either the old or the new file, never a torn one.

use std::path::{Path, PathBuf};

use crate::error::LatticaError;

/// Canonical file layout below a config root directory.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identities_dir(&self) -> PathBuf {
        self.root.join("identities")
    }

    pub fn identity(&self, name: &str) -> PathBuf {
        self.identities_dir().join(name)
    }

    pub fn destination_table(&self) -> PathBuf {
        self.root.join("storage").join("destination_table")
    }

    pub fn packet_hashlist(&self) -> PathBuf {
        self.root.join("storage").join("packet_hashlist")
    }

    pub fn tunnels(&self) -> PathBuf {
        self.root.join("storage").join("tunnels")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("storage").join("cache")
    }

    pub fn ratchets_dir(&self) -> PathBuf {
        self.root.join("storage").join("ratchets")
    }

    pub fn ensure_layout(&self) -> Result<(), LatticaError> {
        ensure_dir(&self.identities_dir())?;
        ensure_dir(&self.root.join("storage"))?;
        ensure_dir(&self.cache_dir())?;
        ensure_dir(&self.ratchets_dir())
    }
}

pub fn ensure_dir(path: &Path) -> Result<(), LatticaError> {
    std::fs::create_dir_all(path).map_err(|_| LatticaError::ConnectionError)
}

/// Write-then-rename. The temp file lives next to the target so the rename
/// stays on one filesystem.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), LatticaError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let tmp_path = path.with_extension("out");
    std::fs::write(&tmp_path, data).map_err(|_| LatticaError::ConnectionError)?;
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    std::fs::rename(&tmp_path, path).map_err(|_| LatticaError::ConnectionError)
}

pub fn read_optional(path: &Path) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{read_optional, write_atomic, StoragePaths};

    #[test]
    fn layout_creates_expected_directories() {
        let temp = TempDir::new().expect("temp dir");
        let paths = StoragePaths::new(temp.path());
        paths.ensure_layout().expect("layout");

        assert!(paths.identities_dir().is_dir());
        assert!(paths.cache_dir().is_dir());
        assert!(paths.ratchets_dir().is_dir());
    }

    #[test]
    fn atomic_write_replaces_previous_content() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("storage").join("destination_table");

        write_atomic(&path, b"first").expect("write");
        write_atomic(&path, b"second").expect("rewrite");

        assert_eq!(read_optional(&path).expect("content"), b"second");
        assert!(!path.with_extension("out").exists());
    }
}
