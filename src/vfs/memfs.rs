//! In-memory mount backend.
//!
//! A `memory {}` mount is a private tree keyed by relative path, initially
//! empty, living only as long as the sandbox. All state sits behind one
//! `RwLock`; individual ops are short and copy at most one file's bytes.

use super::protocol::{Attr, DirEntry, FileKind};
use super::MountBackend;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, mode: u32, mtime: i64 },
    Dir { mode: u32, mtime: i64 },
    Symlink { target: String, mtime: i64 },
}

impl Node {
    fn attr(&self) -> Attr {
        match self {
            Node::File { data, mode, mtime } => Attr {
                kind: FileKind::File,
                size: data.len() as u64,
                mode: *mode,
                mtime: *mtime,
            },
            Node::Dir { mode, mtime } => Attr {
                kind: FileKind::Dir,
                size: 0,
                mode: *mode,
                mtime: *mtime,
            },
            Node::Symlink { target, mtime } => Attr {
                kind: FileKind::Symlink,
                size: target.len() as u64,
                mode: 0o777,
                mtime: *mtime,
            },
        }
    }

    fn kind(&self) -> FileKind {
        match self {
            Node::File { .. } => FileKind::File,
            Node::Dir { .. } => FileKind::Dir,
            Node::Symlink { .. } => FileKind::Symlink,
        }
    }
}

/// The in-memory tree. Keys are relative paths; `""` is the mount root.
pub struct MemFs {
    nodes: RwLock<BTreeMap<String, Node>>,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    }
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node::Dir {
                mode: 0o755,
                mtime: now(),
            },
        );
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    fn require_parent_dir(
        nodes: &BTreeMap<String, Node>,
        path: &str,
    ) -> Result<(), i32> {
        match nodes.get(parent_of(path)) {
            Some(Node::Dir { .. }) => Ok(()),
            Some(_) => Err(libc::ENOTDIR),
            None => Err(libc::ENOENT),
        }
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MountBackend for MemFs {
    fn readonly(&self) -> bool {
        false
    }

    fn getattr(&self, path: &str) -> Result<Attr, i32> {
        let nodes = self.nodes.read().unwrap();
        nodes.get(path).map(Node::attr).ok_or(libc::ENOENT)
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, i32> {
        let nodes = self.nodes.read().unwrap();
        match nodes.get(path) {
            Some(Node::Dir { .. }) => {}
            Some(_) => return Err(libc::ENOTDIR),
            None => return Err(libc::ENOENT),
        }
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };
        let entries = nodes
            .iter()
            .filter(|(key, _)| !key.is_empty() && key.starts_with(&prefix))
            .filter_map(|(key, node)| {
                let rest = &key[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(DirEntry {
                        name: rest.to_string(),
                        kind: node.kind(),
                    })
                }
            })
            .collect();
        Ok(entries)
    }

    fn read(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, i32> {
        let nodes = self.nodes.read().unwrap();
        match nodes.get(path) {
            Some(Node::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = (start + size as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(Node::Dir { .. }) => Err(libc::EISDIR),
            Some(Node::Symlink { .. }) => Err(libc::EINVAL),
            None => Err(libc::ENOENT),
        }
    }

    fn write(&self, path: &str, offset: u64, payload: &[u8]) -> Result<u64, i32> {
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get_mut(path) {
            Some(Node::File { data, mtime, .. }) => {
                let offset = offset as usize;
                if data.len() < offset + payload.len() {
                    data.resize(offset + payload.len(), 0);
                }
                data[offset..offset + payload.len()].copy_from_slice(payload);
                *mtime = now();
                Ok(payload.len() as u64)
            }
            Some(Node::Dir { .. }) => Err(libc::EISDIR),
            Some(Node::Symlink { .. }) => Err(libc::EINVAL),
            None => Err(libc::ENOENT),
        }
    }

    fn create(&self, path: &str, mode: u32) -> Result<Attr, i32> {
        if path.is_empty() {
            return Err(libc::EEXIST);
        }
        let mut nodes = self.nodes.write().unwrap();
        Self::require_parent_dir(&nodes, path)?;
        if let Some(existing) = nodes.get(path) {
            return match existing {
                // FUSE create on an existing file truncates.
                Node::File { .. } => {
                    let node = Node::File {
                        data: Vec::new(),
                        mode,
                        mtime: now(),
                    };
                    let attr = node.attr();
                    nodes.insert(path.to_string(), node);
                    Ok(attr)
                }
                _ => Err(libc::EEXIST),
            };
        }
        let node = Node::File {
            data: Vec::new(),
            mode,
            mtime: now(),
        };
        let attr = node.attr();
        nodes.insert(path.to_string(), node);
        Ok(attr)
    }

    fn unlink(&self, path: &str) -> Result<(), i32> {
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get(path) {
            Some(Node::Dir { .. }) => Err(libc::EISDIR),
            Some(_) => {
                nodes.remove(path);
                Ok(())
            }
            None => Err(libc::ENOENT),
        }
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<Attr, i32> {
        if path.is_empty() {
            return Err(libc::EEXIST);
        }
        let mut nodes = self.nodes.write().unwrap();
        Self::require_parent_dir(&nodes, path)?;
        if nodes.contains_key(path) {
            return Err(libc::EEXIST);
        }
        let node = Node::Dir {
            mode,
            mtime: now(),
        };
        let attr = node.attr();
        nodes.insert(path.to_string(), node);
        Ok(attr)
    }

    fn rmdir(&self, path: &str) -> Result<(), i32> {
        if path.is_empty() {
            return Err(libc::EBUSY);
        }
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get(path) {
            Some(Node::Dir { .. }) => {}
            Some(_) => return Err(libc::ENOTDIR),
            None => return Err(libc::ENOENT),
        }
        let prefix = format!("{path}/");
        if nodes.keys().any(|key| key.starts_with(&prefix)) {
            return Err(libc::ENOTEMPTY);
        }
        nodes.remove(path);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), i32> {
        if from.is_empty() || to.is_empty() {
            return Err(libc::EBUSY);
        }
        let mut nodes = self.nodes.write().unwrap();
        if !nodes.contains_key(from) {
            return Err(libc::ENOENT);
        }
        Self::require_parent_dir(&nodes, to)?;
        if matches!(nodes.get(to), Some(Node::Dir { .. })) {
            return Err(libc::EEXIST);
        }

        // Move the node plus, for directories, its whole subtree.
        let from_prefix = format!("{from}/");
        let moved: Vec<(String, Node)> = nodes
            .iter()
            .filter(|(key, _)| key.as_str() == from || key.starts_with(&from_prefix))
            .map(|(key, node)| {
                let suffix = &key[from.len()..];
                (format!("{to}{suffix}"), node.clone())
            })
            .collect();
        nodes.retain(|key, _| key != from && !key.starts_with(&from_prefix));
        nodes.remove(to);
        for (key, node) in moved {
            nodes.insert(key, node);
        }
        Ok(())
    }

    fn symlink(&self, target: &str, link: &str) -> Result<Attr, i32> {
        let mut nodes = self.nodes.write().unwrap();
        Self::require_parent_dir(&nodes, link)?;
        if nodes.contains_key(link) {
            return Err(libc::EEXIST);
        }
        let node = Node::Symlink {
            target: target.to_string(),
            mtime: now(),
        };
        let attr = node.attr();
        nodes.insert(link.to_string(), node);
        Ok(attr)
    }

    fn readlink(&self, path: &str) -> Result<String, i32> {
        let nodes = self.nodes.read().unwrap();
        match nodes.get(path) {
            Some(Node::Symlink { target, .. }) => Ok(target.clone()),
            Some(_) => Err(libc::EINVAL),
            None => Err(libc::ENOENT),
        }
    }

    fn truncate(&self, path: &str, size: u64) -> Result<(), i32> {
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get_mut(path) {
            Some(Node::File { data, mtime, .. }) => {
                data.resize(size as usize, 0);
                *mtime = now();
                Ok(())
            }
            Some(_) => Err(libc::EISDIR),
            None => Err(libc::ENOENT),
        }
    }

    fn setattr(
        &self,
        path: &str,
        mode: Option<u32>,
        size: Option<u64>,
        mtime: Option<i64>,
    ) -> Result<Attr, i32> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes.get_mut(path).ok_or(libc::ENOENT)?;
        match node {
            Node::File {
                data,
                mode: node_mode,
                mtime: node_mtime,
            } => {
                if let Some(size) = size {
                    data.resize(size as usize, 0);
                }
                if let Some(mode) = mode {
                    *node_mode = mode;
                }
                if let Some(mtime) = mtime {
                    *node_mtime = mtime;
                }
            }
            Node::Dir {
                mode: node_mode,
                mtime: node_mtime,
            } => {
                if size.is_some() {
                    return Err(libc::EISDIR);
                }
                if let Some(mode) = mode {
                    *node_mode = mode;
                }
                if let Some(mtime) = mtime {
                    *node_mtime = mtime;
                }
            }
            Node::Symlink { mtime: node_mtime, .. } => {
                if let Some(mtime) = mtime {
                    *node_mtime = mtime;
                }
            }
        }
        Ok(node.attr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_exists() {
        let fs = MemFs::new();
        let attr = fs.getattr("").unwrap();
        assert_eq!(attr.kind, FileKind::Dir);
        assert!(fs.readdir("").unwrap().is_empty());
    }

    #[test]
    fn test_create_write_read() {
        let fs = MemFs::new();
        fs.create("hello.txt", 0o644).unwrap();
        assert_eq!(fs.write("hello.txt", 0, b"hello ").unwrap(), 6);
        assert_eq!(fs.write("hello.txt", 6, b"world").unwrap(), 5);

        assert_eq!(fs.read("hello.txt", 0, 1024).unwrap(), b"hello world");
        assert_eq!(fs.read("hello.txt", 6, 1024).unwrap(), b"world");
        assert_eq!(fs.getattr("hello.txt").unwrap().size, 11);
    }

    #[test]
    fn test_write_missing_parent() {
        let fs = MemFs::new();
        assert_eq!(fs.create("a/b.txt", 0o644).unwrap_err(), libc::ENOENT);
        fs.mkdir("a", 0o755).unwrap();
        fs.create("a/b.txt", 0o644).unwrap();
    }

    #[test]
    fn test_readdir_lists_immediate_children() {
        let fs = MemFs::new();
        fs.mkdir("d", 0o755).unwrap();
        fs.create("d/f1", 0o644).unwrap();
        fs.mkdir("d/sub", 0o755).unwrap();
        fs.create("d/sub/deep", 0o644).unwrap();

        let mut names: Vec<String> = fs.readdir("d").unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec!["f1", "sub"]);
    }

    #[test]
    fn test_rmdir_refuses_nonempty() {
        let fs = MemFs::new();
        fs.mkdir("d", 0o755).unwrap();
        fs.create("d/f", 0o644).unwrap();
        assert_eq!(fs.rmdir("d").unwrap_err(), libc::ENOTEMPTY);
        fs.unlink("d/f").unwrap();
        fs.rmdir("d").unwrap();
    }

    #[test]
    fn test_rename_moves_subtree() {
        let fs = MemFs::new();
        fs.mkdir("src", 0o755).unwrap();
        fs.create("src/f", 0o644).unwrap();
        fs.write("src/f", 0, b"payload").unwrap();
        fs.mkdir("dst", 0o755).unwrap();

        fs.rename("src", "dst/moved").unwrap();
        assert_eq!(fs.getattr("src").unwrap_err(), libc::ENOENT);
        assert_eq!(fs.read("dst/moved/f", 0, 1024).unwrap(), b"payload");
    }

    #[test]
    fn test_symlink_roundtrip() {
        let fs = MemFs::new();
        fs.symlink("target/file", "link").unwrap();
        assert_eq!(fs.readlink("link").unwrap(), "target/file");
        assert_eq!(fs.getattr("link").unwrap().kind, FileKind::Symlink);
    }

    #[test]
    fn test_truncate_and_setattr() {
        let fs = MemFs::new();
        fs.create("f", 0o644).unwrap();
        fs.write("f", 0, b"0123456789").unwrap();
        fs.truncate("f", 4).unwrap();
        assert_eq!(fs.read("f", 0, 1024).unwrap(), b"0123");

        let attr = fs.setattr("f", Some(0o600), Some(8), None).unwrap();
        assert_eq!(attr.mode, 0o600);
        assert_eq!(attr.size, 8);
        assert_eq!(fs.read("f", 4, 1024).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn test_read_past_end() {
        let fs = MemFs::new();
        fs.create("f", 0o644).unwrap();
        fs.write("f", 0, b"abc").unwrap();
        assert!(fs.read("f", 10, 10).unwrap().is_empty());
    }
}
