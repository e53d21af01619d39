//! Host-side VFS: mount routing and the op server for the guest FUSE driver.
//!
//! An incoming guest path is owned by the longest-prefix entry in the mount
//! table. `real_fs` mounts hit the mapped host directory; `memory` mounts
//! hit a private in-process tree. Readonly mounts fail every mutating op
//! with `EROFS` before the backend is consulted.
//!
//! Concurrency: a lock per `(mount, relative path)` serializes conflicting
//! ops while reads of the same key run in parallel. Ops run on the blocking
//! pool; the serving loop itself stays async on the vsock stream.

pub mod memfs;
pub mod protocol;
pub mod realfs;

use crate::api::{MountConfig, VfsConfig};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use memfs::MemFs;
use protocol::{Attr, DirEntry, VfsRequest, VfsResponse};
use realfs::RealFs;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};

/// Chunk size used by whole-file helpers (`WriteFile`/`ReadFile`).
pub const FILE_CHUNK: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("mount {guest_path:?}: {source}")]
    Mount {
        guest_path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("VFS channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("file operation failed (errno {0})")]
    Errno(i32),
}

/// One mount's op set over relative paths.
///
/// Implementations return raw errnos; the router translates them onto the
/// wire. Readonly enforcement lives in the router, not here.
pub trait MountBackend: Send + Sync {
    fn readonly(&self) -> bool;
    fn getattr(&self, path: &str) -> Result<Attr, i32>;
    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, i32>;
    fn read(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, i32>;
    fn write(&self, path: &str, offset: u64, payload: &[u8]) -> Result<u64, i32>;
    fn create(&self, path: &str, mode: u32) -> Result<Attr, i32>;
    fn unlink(&self, path: &str) -> Result<(), i32>;
    fn mkdir(&self, path: &str, mode: u32) -> Result<Attr, i32>;
    fn rmdir(&self, path: &str) -> Result<(), i32>;
    fn rename(&self, from: &str, to: &str) -> Result<(), i32>;
    fn symlink(&self, target: &str, link: &str) -> Result<Attr, i32>;
    fn readlink(&self, path: &str) -> Result<String, i32>;
    fn truncate(&self, path: &str, size: u64) -> Result<(), i32>;
    fn setattr(
        &self,
        path: &str,
        mode: Option<u32>,
        size: Option<u64>,
        mtime: Option<i64>,
    ) -> Result<Attr, i32>;
}

struct Mount {
    guest_path: String,
    backend: Box<dyn MountBackend>,
}

/// Longest-prefix mount table plus the per-inode lock map.
pub struct MountRouter {
    /// Sorted by guest path length, longest first.
    mounts: Vec<Mount>,
    locks: Mutex<HashMap<(usize, String), Arc<RwLock<()>>>>,
}

impl MountRouter {
    /// Build the router from a validated VFS config.
    pub fn new(config: &VfsConfig) -> Result<Self, VfsError> {
        let mut mounts = Vec::new();
        for (guest_path, mount) in &config.mounts {
            let backend: Box<dyn MountBackend> = match mount {
                MountConfig::Memory {} => Box::new(MemFs::new()),
                MountConfig::RealFs {
                    host_path,
                    readonly,
                } => Box::new(RealFs::new(host_path, *readonly).map_err(|source| {
                    VfsError::Mount {
                        guest_path: guest_path.clone(),
                        source,
                    }
                })?),
            };
            mounts.push(Mount {
                guest_path: guest_path.trim_end_matches('/').to_string(),
                backend,
            });
        }
        mounts.sort_by_key(|mount| std::cmp::Reverse(mount.guest_path.len()));
        Ok(Self {
            mounts,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Longest-prefix resolution of an absolute guest path.
    fn resolve(&self, guest_path: &str) -> Result<(usize, &Mount, String), i32> {
        let normalized = crate::api::normalize_guest_path(Path::new(guest_path))
            .ok_or(libc::EACCES)?;
        let normalized = normalized.to_string_lossy().into_owned();

        for (index, mount) in self.mounts.iter().enumerate() {
            if normalized == mount.guest_path {
                return Ok((index, mount, String::new()));
            }
            if let Some(rest) = normalized.strip_prefix(&format!("{}/", mount.guest_path)) {
                return Ok((index, mount, rest.to_string()));
            }
        }
        Err(libc::ENOENT)
    }

    fn lock_for(&self, mount: usize, rel: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry((mount, rel.to_string()))
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Execute one request synchronously. Never panics on bad input; every
    /// failure maps to an errno on the wire.
    pub fn dispatch(&self, request: &VfsRequest) -> VfsResponse {
        let (mount_index, mount, rel) = match self.resolve(request.path()) {
            Ok(resolved) => resolved,
            Err(errno) => return VfsResponse::error(errno),
        };

        if request.is_mutating() && mount.backend.readonly() {
            return VfsResponse::error(libc::EROFS);
        }

        let lock = self.lock_for(mount_index, &rel);
        let _guard_write;
        let _guard_read;
        if request.is_mutating() {
            _guard_write = lock.write().unwrap();
        } else {
            _guard_read = lock.read().unwrap();
        }

        let backend = mount.backend.as_ref();
        let result = match request {
            VfsRequest::Lookup { .. } | VfsRequest::Getattr { .. } => {
                backend.getattr(&rel).map(VfsResponse::with_attr)
            }
            VfsRequest::Opendir { .. } => backend.getattr(&rel).and_then(|attr| {
                if attr.kind == protocol::FileKind::Dir {
                    Ok(VfsResponse::done())
                } else {
                    Err(libc::ENOTDIR)
                }
            }),
            VfsRequest::Readdir { .. } => backend.readdir(&rel).map(|entries| VfsResponse {
                ok: true,
                entries: Some(entries),
                ..Default::default()
            }),
            VfsRequest::Open { write, .. } => {
                if *write && backend.readonly() {
                    Err(libc::EROFS)
                } else {
                    backend.getattr(&rel).map(VfsResponse::with_attr)
                }
            }
            VfsRequest::Read { offset, size, .. } => {
                backend.read(&rel, *offset, *size).map(|data| VfsResponse {
                    ok: true,
                    data_b64: Some(B64.encode(data)),
                    ..Default::default()
                })
            }
            VfsRequest::Write {
                offset, data_b64, ..
            } => B64
                .decode(data_b64)
                .map_err(|_| libc::EINVAL)
                .and_then(|payload| backend.write(&rel, *offset, &payload))
                .map(|written| VfsResponse {
                    ok: true,
                    written: Some(written),
                    ..Default::default()
                }),
            VfsRequest::Create { mode, .. } => {
                backend.create(&rel, *mode).map(VfsResponse::with_attr)
            }
            VfsRequest::Unlink { .. } => backend.unlink(&rel).map(|()| VfsResponse::done()),
            VfsRequest::Mkdir { mode, .. } => {
                backend.mkdir(&rel, *mode).map(VfsResponse::with_attr)
            }
            VfsRequest::Rmdir { .. } => backend.rmdir(&rel).map(|()| VfsResponse::done()),
            VfsRequest::Rename { to, .. } => self.rename(mount_index, &rel, to),
            VfsRequest::Symlink { target, .. } => {
                backend.symlink(target, &rel).map(VfsResponse::with_attr)
            }
            VfsRequest::Readlink { .. } => backend.readlink(&rel).map(|target| VfsResponse {
                ok: true,
                target: Some(target),
                ..Default::default()
            }),
            VfsRequest::Truncate { size, .. } => {
                backend.truncate(&rel, *size).map(|()| VfsResponse::done())
            }
            VfsRequest::Setattr {
                mode, size, mtime, ..
            } => backend
                .setattr(&rel, *mode, *size, *mtime)
                .map(VfsResponse::with_attr),
            VfsRequest::Release { .. } | VfsRequest::Flush { .. } => Ok(VfsResponse::done()),
        };

        result.unwrap_or_else(VfsResponse::error)
    }

    /// Rename, including the cross-mount copy-on-write move.
    fn rename(
        &self,
        from_mount: usize,
        from_rel: &str,
        to_guest: &str,
    ) -> Result<VfsResponse, i32> {
        let (to_mount, to, to_rel) = self.resolve(to_guest)?;
        if to.backend.readonly() {
            return Err(libc::EROFS);
        }
        if to_mount == from_mount {
            self.mounts[from_mount]
                .backend
                .rename(from_rel, &to_rel)
                .map(|()| VfsResponse::done())
        } else {
            let from = self.mounts[from_mount].backend.as_ref();
            copy_tree(from, from_rel, to.backend.as_ref(), &to_rel)?;
            remove_tree(from, from_rel)?;
            Ok(VfsResponse::done())
        }
    }

    /// Whole-file write used by the controller's `WriteFile`.
    pub fn write_file(&self, guest_path: &str, bytes: &[u8]) -> Result<(), i32> {
        let (_, mount, rel) = self.resolve(guest_path)?;
        if mount.backend.readonly() {
            return Err(libc::EROFS);
        }
        mount.backend.create(&rel, 0o644)?;
        let mut offset = 0u64;
        for chunk in bytes.chunks(FILE_CHUNK) {
            mount.backend.write(&rel, offset, chunk)?;
            offset += chunk.len() as u64;
        }
        Ok(())
    }

    /// Whole-file read used by the controller's `ReadFile`.
    pub fn read_file(&self, guest_path: &str) -> Result<Vec<u8>, i32> {
        let (_, mount, rel) = self.resolve(guest_path)?;
        let attr = mount.backend.getattr(&rel)?;
        let mut out = Vec::with_capacity(attr.size as usize);
        let mut offset = 0u64;
        loop {
            let chunk = mount.backend.read(&rel, offset, FILE_CHUNK as u32)?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Recursive copy across mounts.
fn copy_tree(
    from: &dyn MountBackend,
    from_rel: &str,
    to: &dyn MountBackend,
    to_rel: &str,
) -> Result<(), i32> {
    let attr = from.getattr(from_rel)?;
    match attr.kind {
        protocol::FileKind::File => {
            to.create(to_rel, attr.mode)?;
            let mut offset = 0u64;
            loop {
                let chunk = from.read(from_rel, offset, FILE_CHUNK as u32)?;
                if chunk.is_empty() {
                    break;
                }
                to.write(to_rel, offset, &chunk)?;
                offset += chunk.len() as u64;
            }
            Ok(())
        }
        protocol::FileKind::Dir => {
            to.mkdir(to_rel, attr.mode)?;
            for entry in from.readdir(from_rel)? {
                let child_from = join_rel(from_rel, &entry.name);
                let child_to = join_rel(to_rel, &entry.name);
                copy_tree(from, &child_from, to, &child_to)?;
            }
            Ok(())
        }
        protocol::FileKind::Symlink => {
            let target = from.readlink(from_rel)?;
            to.symlink(&target, to_rel)?;
            Ok(())
        }
    }
}

fn remove_tree(backend: &dyn MountBackend, rel: &str) -> Result<(), i32> {
    let attr = backend.getattr(rel)?;
    match attr.kind {
        protocol::FileKind::Dir => {
            for entry in backend.readdir(rel)? {
                remove_tree(backend, &join_rel(rel, &entry.name))?;
            }
            backend.rmdir(rel)
        }
        _ => backend.unlink(rel),
    }
}

fn join_rel(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// Serve one guest VFS stream until EOF.
pub async fn serve_stream<S>(stream: S, router: Arc<MountRouter>) -> Result<(), VfsError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let request: Option<VfsRequest> =
            crate::vsock::protocol::read_json(&mut reader).await?;
        let Some(request) = request else {
            debug!("VFS stream closed by guest");
            return Ok(());
        };

        let router = router.clone();
        let response = tokio::task::spawn_blocking(move || router.dispatch(&request))
            .await
            .unwrap_or_else(|e| {
                warn!("VFS op panicked: {e}");
                VfsResponse::error(libc::EIO)
            });

        crate::vsock::protocol::write_json(&mut write_half, &response).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::VfsConfig;
    use std::collections::BTreeMap;

    fn router_with(mounts: BTreeMap<String, MountConfig>) -> MountRouter {
        MountRouter::new(&VfsConfig {
            workspace: "/workspace".to_string(),
            mounts,
        })
        .unwrap()
    }

    fn memory_router() -> MountRouter {
        let mut mounts = BTreeMap::new();
        mounts.insert("/workspace".to_string(), MountConfig::Memory {});
        router_with(mounts)
    }

    #[test]
    fn test_longest_prefix_routing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("host-file"), b"from host").unwrap();

        let mut mounts = BTreeMap::new();
        mounts.insert("/workspace".to_string(), MountConfig::Memory {});
        mounts.insert(
            "/workspace/data".to_string(),
            MountConfig::RealFs {
                host_path: dir.path().to_path_buf(),
                readonly: false,
            },
        );
        let router = router_with(mounts);

        // Inside the nested mount: served from the host directory.
        let data = router.read_file("/workspace/data/host-file").unwrap();
        assert_eq!(data, b"from host");

        // Outside it: served by the memory root.
        router.write_file("/workspace/note", b"in memory").unwrap();
        assert_eq!(router.read_file("/workspace/note").unwrap(), b"in memory");
        assert!(!dir.path().join("note").exists());
    }

    #[test]
    fn test_readonly_mount_erofs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("y"), b"original").unwrap();

        let mut mounts = BTreeMap::new();
        mounts.insert("/workspace".to_string(), MountConfig::Memory {});
        mounts.insert(
            "/workspace/data".to_string(),
            MountConfig::RealFs {
                host_path: dir.path().to_path_buf(),
                readonly: true,
            },
        );
        let router = router_with(mounts);

        let err = router.write_file("/workspace/data/y", b"x").unwrap_err();
        assert_eq!(err, libc::EROFS);

        let response = router.dispatch(&VfsRequest::Unlink {
            path: "/workspace/data/y".to_string(),
        });
        assert_eq!(response.errno, Some(libc::EROFS));

        // Reads still work.
        assert_eq!(router.read_file("/workspace/data/y").unwrap(), b"original");
    }

    #[test]
    fn test_write_read_roundtrip_large() {
        let router = memory_router();
        // Spans several chunks to exercise the chunked helpers.
        let payload: Vec<u8> = (0..(3 * FILE_CHUNK + 17)).map(|i| (i % 251) as u8).collect();
        router.write_file("/workspace/big.bin", &payload).unwrap();
        assert_eq!(router.read_file("/workspace/big.bin").unwrap(), payload);
    }

    #[test]
    fn test_unknown_path_enoent() {
        let router = memory_router();
        let response = router.dispatch(&VfsRequest::Getattr {
            path: "/elsewhere/x".to_string(),
        });
        assert!(!response.ok);
        assert_eq!(response.errno, Some(libc::ENOENT));
    }

    #[test]
    fn test_traversal_rejected() {
        let router = memory_router();
        let response = router.dispatch(&VfsRequest::Getattr {
            path: "/workspace/../etc/passwd".to_string(),
        });
        assert_eq!(response.errno, Some(libc::EACCES));
    }

    #[test]
    fn test_cross_mount_rename_copies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src.txt"), b"move me").unwrap();

        let mut mounts = BTreeMap::new();
        mounts.insert("/workspace".to_string(), MountConfig::Memory {});
        mounts.insert(
            "/workspace/data".to_string(),
            MountConfig::RealFs {
                host_path: dir.path().to_path_buf(),
                readonly: false,
            },
        );
        let router = router_with(mounts);

        let response = router.dispatch(&VfsRequest::Rename {
            from: "/workspace/data/src.txt".to_string(),
            to: "/workspace/dst.txt".to_string(),
        });
        assert!(response.ok, "rename failed: {:?}", response.errno);

        assert_eq!(router.read_file("/workspace/dst.txt").unwrap(), b"move me");
        assert!(!dir.path().join("src.txt").exists());
    }

    #[test]
    fn test_dispatch_full_op_walk() {
        let router = memory_router();

        let mkdir = router.dispatch(&VfsRequest::Mkdir {
            path: "/workspace/d".to_string(),
            mode: 0o755,
        });
        assert!(mkdir.ok);

        let create = router.dispatch(&VfsRequest::Create {
            path: "/workspace/d/f".to_string(),
            mode: 0o644,
        });
        assert!(create.ok);

        let write = router.dispatch(&VfsRequest::Write {
            path: "/workspace/d/f".to_string(),
            offset: 0,
            data_b64: B64.encode(b"abc"),
        });
        assert_eq!(write.written, Some(3));

        let read = router.dispatch(&VfsRequest::Read {
            path: "/workspace/d/f".to_string(),
            offset: 0,
            size: 16,
        });
        assert_eq!(read.data_b64.as_deref(), Some(B64.encode(b"abc").as_str()));

        let entries = router
            .dispatch(&VfsRequest::Readdir {
                path: "/workspace/d".to_string(),
            })
            .entries
            .unwrap();
        assert_eq!(entries.len(), 1);

        assert!(router
            .dispatch(&VfsRequest::Flush {
                path: "/workspace/d/f".to_string()
            })
            .ok);
        assert!(router
            .dispatch(&VfsRequest::Release {
                path: "/workspace/d/f".to_string()
            })
            .ok);

        let unlink = router.dispatch(&VfsRequest::Unlink {
            path: "/workspace/d/f".to_string(),
        });
        assert!(unlink.ok);
        let rmdir = router.dispatch(&VfsRequest::Rmdir {
            path: "/workspace/d".to_string(),
        });
        assert!(rmdir.ok);
    }

    #[tokio::test]
    async fn test_serve_stream_end_to_end() {
        let router = Arc::new(memory_router());
        let (host_end, guest_end) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_stream(host_end, router));

        let (read_half, mut write_half) = tokio::io::split(guest_end);
        let mut reader = BufReader::new(read_half);

        crate::vsock::protocol::write_json(
            &mut write_half,
            &VfsRequest::Create {
                path: "/workspace/hi".to_string(),
                mode: 0o644,
            },
        )
        .await
        .unwrap();
        let response: VfsResponse = crate::vsock::protocol::read_json(&mut reader)
            .await
            .unwrap()
            .unwrap();
        assert!(response.ok);

        drop(write_half);
        drop(reader);
        server.await.unwrap().unwrap();
    }
}
