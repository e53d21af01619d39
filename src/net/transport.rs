//! Frame transport: the host end of the guest's virtio-net link.
//!
//! Both variants expose identical semantics: one file descriptor where a
//! read yields exactly one Ethernet frame and a write accepts one.
//!
//! - **TAP** (Linux/Firecracker): the VMM attaches to a named TAP device;
//!   the host side binds an `AF_PACKET` socket to the same netdev, which
//!   sees every frame the guest emits and can inject frames back.
//! - **Socketpair** (file-handle network devices): an `AF_UNIX`/`SOCK_DGRAM`
//!   pair, one end handed to the VMM, the other kept here.
//!
//! The transport is deliberately dumb; [`FrameDevice`] layers the smoltcp
//! `Device` contract on top, with a pending queue the stack fills after
//! sniffing inbound frames for SYN-triggered listener registration.

use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Ethernet MTU plus the 14-byte header.
pub const MAX_FRAME_LEN: usize = 1514;

/// One end of the guest's L2 link.
#[derive(Debug)]
pub struct FrameTransport {
    fd: OwnedFd,
}

impl FrameTransport {
    /// Attach to an existing TAP netdev via an `AF_PACKET` socket.
    #[cfg(target_os = "linux")]
    pub fn attach_tap(name: &str) -> io::Result<Self> {
        let cname = std::ffi::CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad interface name"))?;
        let ifindex = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if ifindex == 0 {
            return Err(io::Error::last_os_error());
        }

        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as i32,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex as i32;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd })
    }

    /// Create a datagram socketpair; the returned [`OwnedFd`] is the guest
    /// end, handed to a VMM with a file-handle network device.
    pub fn socketpair() -> io::Result<(Self, OwnedFd)> {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let host = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let guest = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblocking(host.as_raw_fd())?;
        Ok((Self { fd: host }, guest))
    }

    /// Read one frame. `WouldBlock` when no frame is pending.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Write one frame. A frame dropped on `WouldBlock` is recovered by the
    /// guest's TCP retransmit; the link is lossy-tolerant by contract.
    pub fn send(&self, frame: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a TAP netdev for the VMM and bring the link up.
#[cfg(target_os = "linux")]
pub fn create_tap(name: &str) -> io::Result<()> {
    run_ip(&["tuntap", "add", name, "mode", "tap"])?;
    run_ip(&["link", "set", name, "up"])
}

/// Tear a TAP netdev down.
#[cfg(target_os = "linux")]
pub fn delete_tap(name: &str) -> io::Result<()> {
    run_ip(&["link", "del", name])
}

#[cfg(target_os = "linux")]
fn run_ip(args: &[&str]) -> io::Result<()> {
    let output = std::process::Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(())
}

/// smoltcp device over a [`FrameTransport`].
///
/// Inbound frames are not read here: the stack drains the transport itself
/// (so it can sniff SYNs before smoltcp sees them) and queues frames via
/// [`FrameDevice::enqueue`]. Outbound frames go straight to the transport.
pub struct FrameDevice {
    transport: FrameTransport,
    pending: VecDeque<Vec<u8>>,
}

impl FrameDevice {
    pub fn new(transport: FrameTransport) -> Self {
        Self {
            transport,
            pending: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> &FrameTransport {
        &self.transport
    }

    /// Queue an inbound frame for the next poll.
    pub fn enqueue(&mut self, frame: Vec<u8>) {
        self.pending.push_back(frame);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

pub struct FrameRxToken(Vec<u8>);

impl phy::RxToken for FrameRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0)
    }
}

pub struct FrameTxToken<'a>(&'a FrameTransport);

impl<'a> phy::TxToken for FrameTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        let _ = self.0.send(&frame);
        result
    }
}

impl Device for FrameDevice {
    type RxToken<'a> = FrameRxToken
    where
        Self: 'a;
    type TxToken<'a> = FrameTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.pending.pop_front()?;
        Some((FrameRxToken(frame), FrameTxToken(&self.transport)))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(FrameTxToken(&self.transport))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = MAX_FRAME_LEN;
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::phy::{RxToken, TxToken};

    #[test]
    fn test_socketpair_roundtrip() {
        let (host, guest) = FrameTransport::socketpair().unwrap();

        // Guest end writes one frame; host end reads exactly that frame.
        let frame = [0xabu8; 64];
        let n = unsafe {
            libc::send(
                guest.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        assert_eq!(n, 64);

        let mut buf = [0u8; MAX_FRAME_LEN];
        assert_eq!(host.recv(&mut buf).unwrap(), 64);
        assert_eq!(&buf[..64], &frame);
    }

    #[test]
    fn test_socketpair_nonblocking_empty() {
        let (host, _guest) = FrameTransport::socketpair().unwrap();
        let mut buf = [0u8; MAX_FRAME_LEN];
        let err = host.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_device_queue_order() {
        let (host, _guest) = FrameTransport::socketpair().unwrap();
        let mut device = FrameDevice::new(host);
        device.enqueue(vec![1, 1, 1]);
        device.enqueue(vec![2, 2, 2]);

        let (rx, _tx) = device.receive(Instant::now()).unwrap();
        rx.consume(|frame| assert_eq!(frame, &[1, 1, 1]));
        let (rx, _tx) = device.receive(Instant::now()).unwrap();
        rx.consume(|frame| assert_eq!(frame, &[2, 2, 2]));
        assert!(device.receive(Instant::now()).is_none());
    }

    #[test]
    fn test_transmit_reaches_peer() {
        let (host, guest) = FrameTransport::socketpair().unwrap();
        let mut device = FrameDevice::new(host);

        let tx = device.transmit(Instant::now()).unwrap();
        tx.consume(42, |frame| frame.fill(0x55));

        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = unsafe {
            libc::recv(
                guest.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        assert_eq!(n, 42);
        assert!(buf[..42].iter().all(|&b| b == 0x55));
    }
}
