//! Local rootfs store.
//!
//! Image pulling, layer extraction, and ext4 image creation happen outside
//! this binary; the sandbox controller consumes a ready rootfs path. This
//! module maps an image reference to an entry in the local store
//! (`$MATCHLOCK_IMAGE_DIR` or `~/.matchlock/images/<ref>/rootfs.ext4`) and
//! also accepts a direct filesystem path to a rootfs image.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(
        "image {reference:?} not found in the local store ({path}); \
         build it first (e.g. `matchlock-image build {reference}`) or pass a rootfs path"
    )]
    NotFound { reference: String, path: String },
}

/// Resolver over the on-disk image store.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

/// A resolved rootfs.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub rootfs_path: PathBuf,
    pub size_bytes: u64,
}

impl Store {
    pub fn new() -> Self {
        let root = std::env::var_os("MATCHLOCK_IMAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"));
                home.join(".matchlock").join("images")
            });
        Self { root }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an image reference to a rootfs path.
    ///
    /// A reference that names an existing file is used as the rootfs
    /// directly; otherwise the store is consulted. `force_pull` is accepted
    /// for CLI parity but acquisition lives outside this binary, so it only
    /// changes the error message's suggestion.
    pub fn resolve(&self, reference: &str, _force_pull: bool) -> Result<Resolved, ImageError> {
        let direct = Path::new(reference);
        if direct.is_file() {
            let size_bytes = std::fs::metadata(direct).map(|m| m.len()).unwrap_or(0);
            return Ok(Resolved {
                rootfs_path: direct.to_path_buf(),
                size_bytes,
            });
        }

        let entry = self.root.join(sanitize_ref(reference)).join("rootfs.ext4");
        if entry.is_file() {
            let size_bytes = std::fs::metadata(&entry).map(|m| m.len()).unwrap_or(0);
            return Ok(Resolved {
                rootfs_path: entry,
                size_bytes,
            });
        }

        Err(ImageError::NotFound {
            reference: reference.to_string(),
            path: entry.display().to_string(),
        })
    }

    /// Kernel image shipped alongside the store (`$MATCHLOCK_KERNEL` override).
    pub fn kernel_path(&self) -> PathBuf {
        std::env::var_os("MATCHLOCK_KERNEL")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.root.join("vmlinux"))
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Filesystem-safe directory name for an image reference.
fn sanitize_ref(reference: &str) -> String {
    reference
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_ref() {
        assert_eq!(sanitize_ref("alpine:latest"), "alpine_latest");
        assert_eq!(sanitize_ref("ghcr.io/acme/tool:1.2"), "ghcr.io_acme_tool_1.2");
    }

    #[test]
    fn test_resolve_direct_path() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("custom.ext4");
        std::fs::write(&rootfs, b"ext4").unwrap();

        let store = Store::with_root(dir.path().join("store"));
        let resolved = store
            .resolve(rootfs.to_str().unwrap(), false)
            .unwrap();
        assert_eq!(resolved.rootfs_path, rootfs);
    }

    #[test]
    fn test_resolve_store_entry() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("alpine_latest");
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join("rootfs.ext4"), b"ext4").unwrap();

        let store = Store::with_root(dir.path());
        let resolved = store.resolve("alpine:latest", false).unwrap();
        assert!(resolved.rootfs_path.ends_with("alpine_latest/rootfs.ext4"));
    }

    #[test]
    fn test_resolve_missing_names_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::with_root(dir.path());
        let err = store.resolve("nosuch:latest", false).unwrap_err();
        assert!(err.to_string().contains("nosuch:latest"));
    }
}
