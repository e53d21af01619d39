//! Backend capability contract.
//!
//! A backend is the thin seam between the controller and a concrete VMM.
//! It must create a VM wired to the sandbox's rootfs, frame transport, and
//! vsock device, and expose exactly the capability set the controller
//! consumes: start, wait, kill, vsock dial/listen, and whether PTY exec is
//! available. No further behavior is assumed; everything else (policy,
//! interception, VFS, exec protocol) lives above this trait.

pub mod firecracker;

use crate::vsock::VsockStream;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmmError {
    #[error("VMM process error: {0}")]
    Process(#[source] std::io::Error),

    #[error("VMM configuration error: {0}")]
    Config(String),

    #[error("vsock connection failed: {0}")]
    Vsock(#[source] std::io::Error),

    #[error("vsock handshake failed: {0}")]
    VsockHandshake(String),

    #[error("VM is not running")]
    NotRunning,
}

/// Everything a backend needs to assemble a VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub cpus: u32,
    pub memory_mb: u32,
    pub kernel: PathBuf,
    pub cmdline: String,
    pub rootfs: PathBuf,
    /// TAP netdev name the virtio-net device attaches to.
    pub tap_device: String,
    /// MAC assigned to the guest side.
    pub guest_mac: String,
    /// Host path of the vsock device's Unix socket.
    pub vsock_uds: PathBuf,
}

/// Listener for guest-initiated vsock streams on one port.
pub struct VsockListener {
    inner: tokio::net::UnixListener,
}

impl VsockListener {
    pub fn new(inner: tokio::net::UnixListener) -> Self {
        Self { inner }
    }

    pub async fn accept(&self) -> std::io::Result<VsockStream> {
        let (stream, _) = self.inner.accept().await?;
        Ok(Box::new(stream))
    }
}

/// Capability set every backend must provide.
#[async_trait]
pub trait Machine: Send + Sync {
    /// Boot the VM.
    async fn start(&self) -> Result<(), VmmError>;

    /// Wait for the VMM process to exit; returns its exit code.
    async fn wait(&self) -> Result<i32, VmmError>;

    /// Hard-kill the VMM process. Idempotent.
    async fn kill(&self) -> Result<(), VmmError>;

    /// VMM process id, if running.
    fn pid(&self) -> Option<u32>;

    /// Open a host-initiated stream to a guest vsock port.
    async fn vsock_connect(&self, port: u32) -> Result<VsockStream, VmmError>;

    /// Listen for guest-initiated streams on a vsock port.
    async fn vsock_listen(&self, port: u32) -> Result<VsockListener, VmmError>;

    /// Whether interactive (PTY) exec is supported.
    fn pty_supported(&self) -> bool;
}
