//! Vsock transport and the guest-control protocol.
//!
//! The backend realizes vsock streams however its VMM exposes them (for
//! Firecracker, host-side Unix sockets with the `CONNECT <port>` handshake);
//! this module only sees opaque byte streams. [`ControlDialer`] is the
//! narrow seam between the two: the controller hands the client a dialer
//! backed by the running machine.

pub mod control;
pub mod protocol;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use control::{ControlClient, ControlError, ExecSpec};
pub use protocol::{CONTROL_PORT, VFS_PORT};

/// Object-safe byte-stream bound for vsock channels.
pub trait VsockIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> VsockIo for T {}

impl std::fmt::Debug for dyn VsockIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VsockStream")
    }
}

/// A bidirectional vsock byte stream.
pub type VsockStream = Box<dyn VsockIo>;

/// Opens host-initiated vsock streams to the guest.
#[async_trait]
pub trait ControlDialer: Send + Sync {
    async fn dial(&self, port: u32) -> std::io::Result<VsockStream>;
}
