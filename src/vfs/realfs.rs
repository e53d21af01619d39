//! Host-directory mount backend.
//!
//! A `real_fs { host_path, readonly }` mount maps a subtree of the host
//! filesystem into the guest's workspace. Every op re-resolves its path and
//! rejects anything that would escape the mount root after symlink
//! normalization; readonly enforcement happens one level up in the router,
//! uniformly for all backends.

use super::protocol::{Attr, DirEntry, FileKind};
use super::MountBackend;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

pub struct RealFs {
    root: PathBuf,
    readonly: bool,
}

fn errno_of(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn kind_of(file_type: fs::FileType) -> FileKind {
    if file_type.is_dir() {
        FileKind::Dir
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    }
}

fn attr_of(meta: &fs::Metadata) -> Attr {
    Attr {
        kind: kind_of(meta.file_type()),
        size: meta.size(),
        mode: meta.permissions().mode() & 0o7777,
        mtime: meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
    }
}

impl RealFs {
    pub fn new(host_path: &Path, readonly: bool) -> Result<Self, std::io::Error> {
        let root = host_path.canonicalize()?;
        Ok(Self { root, readonly })
    }

    /// Map a relative guest path onto the host, refusing escapes.
    ///
    /// The relative path is already lexically clean (the router rejects
    /// `..`); what is checked here is symlink escape: the deepest existing
    /// ancestor must canonicalize to somewhere under the mount root.
    fn host_path(&self, rel: &str) -> Result<PathBuf, i32> {
        let joined = if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        };

        let mut probe = joined.clone();
        let resolved = loop {
            match probe.canonicalize() {
                Ok(resolved) => break resolved,
                Err(_) => match probe.parent() {
                    Some(parent) => probe = parent.to_path_buf(),
                    None => return Err(libc::EACCES),
                },
            }
        };
        if !resolved.starts_with(&self.root) {
            return Err(libc::EACCES);
        }
        Ok(joined)
    }
}

impl MountBackend for RealFs {
    fn readonly(&self) -> bool {
        self.readonly
    }

    fn getattr(&self, path: &str) -> Result<Attr, i32> {
        let host = self.host_path(path)?;
        let meta = fs::symlink_metadata(&host).map_err(|e| errno_of(&e))?;
        Ok(attr_of(&meta))
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, i32> {
        let host = self.host_path(path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&host).map_err(|e| errno_of(&e))? {
            let entry = entry.map_err(|e| errno_of(&e))?;
            let file_type = entry.file_type().map_err(|e| errno_of(&e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: kind_of(file_type),
            });
        }
        Ok(entries)
    }

    fn read(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, i32> {
        let host = self.host_path(path)?;
        let mut file = fs::File::open(&host).map_err(|e| errno_of(&e))?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| errno_of(&e))?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(errno_of(&e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&self, path: &str, offset: u64, payload: &[u8]) -> Result<u64, i32> {
        let host = self.host_path(path)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&host)
            .map_err(|e| errno_of(&e))?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| errno_of(&e))?;
        file.write_all(payload).map_err(|e| errno_of(&e))?;
        Ok(payload.len() as u64)
    }

    fn create(&self, path: &str, mode: u32) -> Result<Attr, i32> {
        let host = self.host_path(path)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&host)
            .map_err(|e| errno_of(&e))?;
        let _ = file.set_permissions(fs::Permissions::from_mode(mode & 0o7777));
        let meta = file.metadata().map_err(|e| errno_of(&e))?;
        Ok(attr_of(&meta))
    }

    fn unlink(&self, path: &str) -> Result<(), i32> {
        let host = self.host_path(path)?;
        fs::remove_file(&host).map_err(|e| errno_of(&e))
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<Attr, i32> {
        let host = self.host_path(path)?;
        fs::create_dir(&host).map_err(|e| errno_of(&e))?;
        let _ = fs::set_permissions(&host, fs::Permissions::from_mode(mode & 0o7777));
        let meta = fs::symlink_metadata(&host).map_err(|e| errno_of(&e))?;
        Ok(attr_of(&meta))
    }

    fn rmdir(&self, path: &str) -> Result<(), i32> {
        let host = self.host_path(path)?;
        fs::remove_dir(&host).map_err(|e| errno_of(&e))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), i32> {
        let from_host = self.host_path(from)?;
        let to_host = self.host_path(to)?;
        fs::rename(&from_host, &to_host).map_err(|e| errno_of(&e))
    }

    fn symlink(&self, target: &str, link: &str) -> Result<Attr, i32> {
        let host = self.host_path(link)?;
        std::os::unix::fs::symlink(target, &host).map_err(|e| errno_of(&e))?;
        let meta = fs::symlink_metadata(&host).map_err(|e| errno_of(&e))?;
        Ok(attr_of(&meta))
    }

    fn readlink(&self, path: &str) -> Result<String, i32> {
        let host = self.host_path(path)?;
        let target = fs::read_link(&host).map_err(|e| errno_of(&e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn truncate(&self, path: &str, size: u64) -> Result<(), i32> {
        let host = self.host_path(path)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&host)
            .map_err(|e| errno_of(&e))?;
        file.set_len(size).map_err(|e| errno_of(&e))
    }

    fn setattr(
        &self,
        path: &str,
        mode: Option<u32>,
        size: Option<u64>,
        _mtime: Option<i64>,
    ) -> Result<Attr, i32> {
        let host = self.host_path(path)?;
        if let Some(size) = size {
            self.truncate(path, size)?;
        }
        if let Some(mode) = mode {
            fs::set_permissions(&host, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| errno_of(&e))?;
        }
        let meta = fs::symlink_metadata(&host).map_err(|e| errno_of(&e))?;
        Ok(attr_of(&meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fs(readonly: bool) -> (tempfile::TempDir, RealFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFs::new(dir.path(), readonly).unwrap();
        (dir, fs)
    }

    #[test]
    fn test_create_write_read_roundtrip() {
        let (_dir, fs) = test_fs(false);
        fs.create("f.txt", 0o644).unwrap();
        fs.write("f.txt", 0, b"hello world").unwrap();
        assert_eq!(fs.read("f.txt", 0, 1024).unwrap(), b"hello world");
        assert_eq!(fs.read("f.txt", 6, 5).unwrap(), b"world");
        assert_eq!(fs.getattr("f.txt").unwrap().size, 11);
    }

    #[test]
    fn test_mkdir_readdir() {
        let (_dir, fs) = test_fs(false);
        fs.mkdir("sub", 0o755).unwrap();
        fs.create("sub/inner", 0o644).unwrap();

        let entries = fs.readdir("sub").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "inner");
        assert_eq!(entries[0].kind, FileKind::File);
    }

    #[test]
    fn test_symlink_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("inside");
        fs::create_dir(&inside).unwrap();
        std::os::unix::fs::symlink("/etc", inside.join("sneaky")).unwrap();

        let backend = RealFs::new(&inside, false).unwrap();
        assert_eq!(backend.getattr("sneaky/passwd").unwrap_err(), libc::EACCES);
        assert_eq!(backend.read("sneaky/passwd", 0, 16).unwrap_err(), libc::EACCES);
    }

    #[test]
    fn test_missing_file_errno() {
        let (_dir, fs) = test_fs(false);
        assert_eq!(fs.getattr("nope").unwrap_err(), libc::ENOENT);
        assert_eq!(fs.read("nope", 0, 16).unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn test_rename_within_mount() {
        let (_dir, fs) = test_fs(false);
        fs.create("a", 0o644).unwrap();
        fs.write("a", 0, b"data").unwrap();
        fs.rename("a", "b").unwrap();
        assert_eq!(fs.getattr("a").unwrap_err(), libc::ENOENT);
        assert_eq!(fs.read("b", 0, 16).unwrap(), b"data");
    }

    #[test]
    fn test_symlink_and_readlink() {
        let (_dir, fs) = test_fs(false);
        fs.symlink("a/b", "ln").unwrap();
        assert_eq!(fs.readlink("ln").unwrap(), "a/b");
    }
}
