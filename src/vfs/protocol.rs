//! Wire protocol for the host-side VFS server.
//!
//! The guest FUSE driver connects on the `VFS` vsock port and sends
//! newline-delimited JSON requests mirroring the FUSE op set; the host
//! answers one response line per request, in order. Read and write payloads
//! ride in `data_b64`.

use serde::{Deserialize, Serialize};

/// FUSE-shaped requests from the guest driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VfsRequest {
    Lookup { path: String },
    Getattr { path: String },
    Opendir { path: String },
    Readdir { path: String },
    Open {
        path: String,
        #[serde(default)]
        write: bool,
    },
    Read {
        path: String,
        offset: u64,
        size: u32,
    },
    Write {
        path: String,
        offset: u64,
        data_b64: String,
    },
    Create { path: String, mode: u32 },
    Unlink { path: String },
    Mkdir { path: String, mode: u32 },
    Rmdir { path: String },
    Rename { from: String, to: String },
    Symlink { target: String, link: String },
    Readlink { path: String },
    Truncate { path: String, size: u64 },
    Setattr {
        path: String,
        #[serde(default)]
        mode: Option<u32>,
        #[serde(default)]
        size: Option<u64>,
        #[serde(default)]
        mtime: Option<i64>,
    },
    Release { path: String },
    Flush { path: String },
}

impl VfsRequest {
    /// Whether the op mutates the tree (fails with `EROFS` on a readonly
    /// mount).
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            VfsRequest::Write { .. }
                | VfsRequest::Create { .. }
                | VfsRequest::Unlink { .. }
                | VfsRequest::Mkdir { .. }
                | VfsRequest::Rmdir { .. }
                | VfsRequest::Rename { .. }
                | VfsRequest::Symlink { .. }
                | VfsRequest::Truncate { .. }
                | VfsRequest::Setattr { .. }
        )
    }

    /// Primary path the op touches (lock key).
    pub fn path(&self) -> &str {
        match self {
            VfsRequest::Lookup { path }
            | VfsRequest::Getattr { path }
            | VfsRequest::Opendir { path }
            | VfsRequest::Readdir { path }
            | VfsRequest::Open { path, .. }
            | VfsRequest::Read { path, .. }
            | VfsRequest::Write { path, .. }
            | VfsRequest::Create { path, .. }
            | VfsRequest::Unlink { path }
            | VfsRequest::Mkdir { path, .. }
            | VfsRequest::Rmdir { path }
            | VfsRequest::Readlink { path }
            | VfsRequest::Truncate { path, .. }
            | VfsRequest::Setattr { path, .. }
            | VfsRequest::Release { path }
            | VfsRequest::Flush { path } => path,
            VfsRequest::Rename { from, .. } => from,
            VfsRequest::Symlink { link, .. } => link,
        }
    }
}

/// File kinds the VFS understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

/// Attributes returned by lookup/getattr/create/setattr.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attr {
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
}

/// One readdir entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// Uniform response line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VfsResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr: Option<Attr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<DirEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<u64>,
}

impl VfsResponse {
    pub fn done() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn error(errno: i32) -> Self {
        Self {
            ok: false,
            errno: Some(errno),
            ..Default::default()
        }
    }

    pub fn with_attr(attr: Attr) -> Self {
        Self {
            ok: true,
            attr: Some(attr),
            ..Default::default()
        }
    }
}
