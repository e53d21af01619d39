//! Guest networking: frame transport, userspace TCP/IP stack, DNS
//! forwarder, and the allowlist policy engine.
//!
//! No guest traffic reaches the host's routing table except through an
//! explicit stack-initiated outbound socket after policy approval; the
//! frame FD is owned by the stack thread for the sandbox's lifetime.

pub mod dns;
pub mod policy;
pub mod stack;
pub mod transport;

pub use policy::{PolicyEngine, Verdict, VerdictReason};
pub use stack::{NetStack, StackConfig};
pub use transport::{FrameDevice, FrameTransport};
