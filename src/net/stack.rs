//! Userspace TCP/IP stack over the frame transport.
//!
//! One dedicated OS thread per sandbox drives a smoltcp interface bound to
//! the frame FD. The interface owns the gateway address of the sandbox's
//! /30 and runs with `any_ip`, so it terminates guest TCP regardless of the
//! destination address.
//!
//! # Flow routing
//!
//! Inbound frames are sniffed before smoltcp sees them: a TCP SYN to a port
//! with no live listener registers one on the fly, which is how the stack
//! accepts connections to arbitrary `(ip, port)` pairs without a listener
//! per port. Accepted flows are spliced byte-wise into host sockets:
//!
//! - port 80  -> the HTTP interceptor's Unix socket
//! - port 443 -> the TLS interceptor's Unix socket
//! - others   -> a direct host connection, but only when policy allows the
//!   destination address; denied SYNs never get a listener, so smoltcp
//!   answers them with RST
//!
//! UDP 53 is answered by the DNS forwarder on its own worker thread.
//! Backpressure propagates naturally: when a host socket stops accepting
//! writes the stack stops draining the guest socket, the TCP window closes,
//! and the guest blocks.

use crate::net::dns;
use crate::net::policy::{is_private, PolicyEngine};
use crate::net::transport::{FrameDevice, FrameTransport, MAX_FRAME_LEN};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, HardwareAddress, IpAddress, IpCidr,
    IpProtocol, Ipv4Address, Ipv4Packet, TcpPacket,
};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Default gateway address handed to each sandbox.
pub const DEFAULT_GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 3, 1);
/// Default guest address.
pub const DEFAULT_GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 3, 2);
/// The /30 shared by gateway and guest.
pub const DEFAULT_PREFIX_LEN: u8 = 30;

/// Locally-administered MAC presented by the gateway.
const GATEWAY_MAC: [u8; 6] = [0x02, 0x4d, 0x4c, 0x00, 0x00, 0x01];

/// Per-socket buffer sizing; also the effective per-flow window.
const SOCKET_BUFFER_LEN: usize = 64 * 1024;

/// Upper bound on dynamically registered listener ports.
const MAX_DYNAMIC_PORTS: usize = 512;

/// Outbound host dials give up after this long.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stack configuration handed over by the controller.
pub struct StackConfig {
    pub gateway_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub prefix_len: u8,
    /// Unix socket of the plain-HTTP interceptor.
    pub http_socket: PathBuf,
    /// Unix socket of the TLS interceptor.
    pub tls_socket: PathBuf,
    pub policy: Arc<PolicyEngine>,
}

/// Handle to the running stack thread.
pub struct NetStack {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl NetStack {
    /// Spawn the stack thread on the given transport.
    pub fn spawn(transport: FrameTransport, config: StackConfig) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("matchlock-net".to_string())
            .spawn(move || run(transport, config, flag))
            .expect("failed to spawn stack thread");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the stack and wait for the thread to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NetStack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Where a guest flow is spliced to.
enum HostConn {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl HostConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            HostConn::Unix(s) => s.read(buf),
            HostConn::Tcp(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            HostConn::Unix(s) => s.write(buf),
            HostConn::Tcp(s) => s.write(buf),
        }
    }

    fn shutdown_write(&self) {
        let _ = match self {
            HostConn::Unix(s) => s.shutdown(std::net::Shutdown::Write),
            HostConn::Tcp(s) => s.shutdown(std::net::Shutdown::Write),
        };
    }

    /// Whether a pending nonblocking connect has finished.
    fn poll_connected(&self) -> io::Result<bool> {
        match self {
            HostConn::Unix(_) => Ok(true),
            HostConn::Tcp(s) => match s.peer_addr() {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    // Connect still in flight, or failed; SO_ERROR tells.
                    match socket_error(s.as_raw_fd())? {
                        0 => Ok(false),
                        errno => Err(io::Error::from_raw_os_error(errno)),
                    }
                }
                Err(e) => Err(e),
            },
        }
    }
}

/// One spliced guest connection.
struct Flow {
    handle: SocketHandle,
    host: HostConn,
    connected: bool,
    connect_deadline: std::time::Instant,
    to_host: Vec<u8>,
    to_guest: Vec<u8>,
    guest_eof: bool,
    host_eof: bool,
    fin_sent: bool,
    done: bool,
}

fn run(transport: FrameTransport, config: StackConfig, shutdown: Arc<AtomicBool>) {
    let mut device = FrameDevice::new(transport);

    let mut iface_config = Config::new(HardwareAddress::Ethernet(EthernetAddress(GATEWAY_MAC)));
    iface_config.random_seed = rand::random();
    let mut iface = Interface::new(iface_config, &mut device, Instant::now());
    iface.update_ip_addrs(|addrs| {
        let _ = addrs.push(IpCidr::new(
            IpAddress::Ipv4(Ipv4Address(config.gateway_ip.octets())),
            config.prefix_len,
        ));
    });
    iface.set_any_ip(true);

    let mut sockets = SocketSet::new(Vec::new());

    let dns_handle = {
        let rx = udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 64], vec![0; 65535]);
        let tx = udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 64], vec![0; 65535]);
        let mut socket = udp::Socket::new(rx, tx);
        if let Err(e) = socket.bind(53) {
            warn!("failed to bind DNS socket: {e}");
        }
        sockets.add(socket)
    };

    // DNS resolution blocks, so it lives on its own worker thread.
    let (query_tx, query_rx) = mpsc::channel::<(Vec<u8>, udp::UdpMetadata)>();
    let (reply_tx, reply_rx) = mpsc::channel::<(Vec<u8>, udp::UdpMetadata)>();
    let dns_policy = config.policy.clone();
    let dns_worker = std::thread::Builder::new()
        .name("matchlock-dns".to_string())
        .spawn(move || {
            while let Ok((data, meta)) = query_rx.recv() {
                if let Some(response) = dns::handle_query(&data, &dns_policy) {
                    if reply_tx.send((response, meta)).is_err() {
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn DNS worker");

    let mut listeners: HashMap<u16, Vec<SocketHandle>> = HashMap::new();
    ensure_listener(&mut sockets, &mut listeners, 80);
    ensure_listener(&mut sockets, &mut listeners, 443);

    let mut flows: Vec<Flow> = Vec::new();
    let mut frame = [0u8; MAX_FRAME_LEN + 64];

    info!(
        gateway = %config.gateway_ip,
        guest = %config.guest_ip,
        "userspace stack running"
    );

    while !shutdown.load(Ordering::Relaxed) {
        let mut activity = false;

        // Drain the transport, registering listeners for fresh SYNs before
        // smoltcp processes the frames.
        loop {
            match device.transport().recv(&mut frame) {
                Ok(0) => break,
                Ok(n) => {
                    activity = true;
                    if let Some((dst, port)) = sniff_tcp_syn(&frame[..n]) {
                        handle_syn(&mut sockets, &mut listeners, &config, dst, port);
                    }
                    device.enqueue(frame[..n].to_vec());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("frame transport read failed, stopping stack: {e}");
                    shutdown.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }

        activity |= iface.poll(Instant::now(), &mut device, &mut sockets);

        // DNS: hand queries to the worker, flush finished answers.
        {
            let socket = sockets.get_mut::<udp::Socket>(dns_handle);
            loop {
                match socket.recv() {
                    Ok((data, meta)) => {
                        activity = true;
                        let _ = query_tx.send((data.to_vec(), meta));
                    }
                    Err(_) => break,
                }
            }
            while let Ok((payload, query_meta)) = reply_rx.try_recv() {
                activity = true;
                let reply_meta = udp::UdpMetadata::from(query_meta.endpoint);
                if let Err(e) = socket.send_slice(&payload, reply_meta) {
                    debug!("DNS reply dropped: {e}");
                }
            }
        }

        // Promote listener sockets that accepted a connection into flows.
        let mut promoted: Vec<(u16, SocketHandle)> = Vec::new();
        for (port, handles) in listeners.iter_mut() {
            handles.retain(|&handle| {
                let socket = sockets.get_mut::<tcp::Socket>(handle);
                match socket.state() {
                    tcp::State::Listen => true,
                    tcp::State::Closed => {
                        // Aborted before establishing; relisten.
                        let _ = socket.listen(*port);
                        true
                    }
                    _ => {
                        promoted.push((*port, handle));
                        false
                    }
                }
            });
        }
        for (port, handle) in promoted {
            activity = true;
            if let Some(flow) = open_flow(&mut sockets, &config, handle, port) {
                flows.push(flow);
            }
            // Keep the port accepting: replace the consumed listener.
            ensure_listener(&mut sockets, &mut listeners, port);
        }

        // Pump all spliced flows.
        for flow in flows.iter_mut() {
            activity |= pump_flow(&mut sockets, flow);
        }
        flows.retain(|flow| {
            if flow.done {
                sockets.remove(flow.handle);
            }
            !flow.done
        });

        if !activity {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    debug!("stack thread exiting");
    drop(query_tx);
    let _ = dns_worker.join();
}

/// Decide whether a SYN deserves a listener.
fn handle_syn(
    sockets: &mut SocketSet<'_>,
    listeners: &mut HashMap<u16, Vec<SocketHandle>>,
    config: &StackConfig,
    dst: Ipv4Addr,
    port: u16,
) {
    if listeners
        .get(&port)
        .is_some_and(|handles| !handles.is_empty())
    {
        return;
    }
    if port == 80 || port == 443 {
        // The MITM layer enforces the allowlist by hostname, but the
        // private-IP rule has no port carve-out: a SYN straight at a
        // private address never gets a listener.
        if config.policy.block_private_ips() && is_private(IpAddr::V4(dst)) {
            info!(dst = %dst, port, reason = "private-ip", "TCP connection denied");
            return;
        }
        ensure_listener(sockets, listeners, port);
        return;
    }
    if listeners.len() >= MAX_DYNAMIC_PORTS {
        warn!(port, "dynamic listener limit reached, SYN will be reset");
        return;
    }
    // No hostname at SYN time: policy runs on the destination address. A
    // denied SYN gets no listener, so smoltcp answers with RST.
    let verdict = config.policy.evaluate_ip(IpAddr::V4(dst));
    if verdict.allow {
        ensure_listener(sockets, listeners, port);
    } else {
        info!(
            dst = %dst,
            port,
            reason = verdict.reason.as_str(),
            "TCP connection denied"
        );
    }
}

/// Add a fresh listening socket for `port`.
fn ensure_listener(
    sockets: &mut SocketSet<'_>,
    listeners: &mut HashMap<u16, Vec<SocketHandle>>,
    port: u16,
) {
    let handles = listeners.entry(port).or_default();
    if !handles.is_empty() {
        return;
    }
    let rx = tcp::SocketBuffer::new(vec![0; SOCKET_BUFFER_LEN]);
    let tx = tcp::SocketBuffer::new(vec![0; SOCKET_BUFFER_LEN]);
    let mut socket = tcp::Socket::new(rx, tx);
    if let Err(e) = socket.listen(port) {
        warn!(port, "listen failed: {e}");
        return;
    }
    handles.push(sockets.add(socket));
    trace!(port, "listener registered");
}

/// Splice a freshly accepted guest connection to its host-side peer.
fn open_flow(
    sockets: &mut SocketSet<'_>,
    config: &StackConfig,
    handle: SocketHandle,
    port: u16,
) -> Option<Flow> {
    let socket = sockets.get_mut::<tcp::Socket>(handle);
    let local = socket.local_endpoint();

    let host = match port {
        80 => connect_unix(&config.http_socket),
        443 => connect_unix(&config.tls_socket),
        _ => {
            let dst_ip = match local {
                Some(endpoint) => ip_from_smoltcp(endpoint.addr),
                None => None,
            };
            match dst_ip {
                Some(ip) => connect_tcp_nonblocking(SocketAddr::new(ip, port)),
                None => Err(io::Error::new(io::ErrorKind::Other, "unknown destination")),
            }
        }
    };

    match host {
        Ok(host) => {
            debug!(port, "flow opened");
            Some(Flow {
                handle,
                host,
                connected: false,
                connect_deadline: std::time::Instant::now() + CONNECT_TIMEOUT,
                to_host: Vec::new(),
                to_guest: Vec::new(),
                guest_eof: false,
                host_eof: false,
                fin_sent: false,
                done: false,
            })
        }
        Err(e) => {
            debug!(port, "host dial failed, resetting guest flow: {e}");
            socket.abort();
            sockets.remove(handle);
            None
        }
    }
}

/// Move bytes both ways for one flow; true when anything moved.
fn pump_flow(sockets: &mut SocketSet<'_>, flow: &mut Flow) -> bool {
    let socket = sockets.get_mut::<tcp::Socket>(flow.handle);
    let mut moved = false;

    if !flow.connected {
        match flow.host.poll_connected() {
            Ok(true) => flow.connected = true,
            Ok(false) => {
                if std::time::Instant::now() > flow.connect_deadline {
                    debug!("host dial timed out, resetting flow");
                    socket.abort();
                    flow.done = true;
                }
                return false;
            }
            Err(e) => {
                debug!("host dial failed: {e}");
                socket.abort();
                flow.done = true;
                return false;
            }
        }
    }

    // Guest -> host. An unflushed buffer pauses guest reads, closing the
    // window toward the guest (backpressure).
    loop {
        if flow.to_host.is_empty() && socket.can_recv() {
            let mut tmp = [0u8; 4096];
            if let Ok(n) = socket.recv_slice(&mut tmp) {
                if n > 0 {
                    flow.to_host.extend_from_slice(&tmp[..n]);
                }
            }
        }
        if flow.to_host.is_empty() {
            break;
        }
        match flow.host.write(&flow.to_host) {
            Ok(0) => {
                socket.abort();
                flow.done = true;
                return true;
            }
            Ok(n) => {
                flow.to_host.drain(..n);
                moved = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("host write failed: {e}");
                socket.abort();
                flow.done = true;
                return true;
            }
        }
    }

    if !flow.guest_eof && !socket.may_recv() && flow.to_host.is_empty() {
        flow.guest_eof = true;
        flow.host.shutdown_write();
        moved = true;
    }

    // Host -> guest.
    loop {
        if flow.to_guest.is_empty() && !flow.host_eof {
            let mut tmp = [0u8; 4096];
            match flow.host.read(&mut tmp) {
                Ok(0) => {
                    flow.host_eof = true;
                }
                Ok(n) => {
                    flow.to_guest.extend_from_slice(&tmp[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("host read failed: {e}");
                    socket.abort();
                    flow.done = true;
                    return true;
                }
            }
        }
        if flow.to_guest.is_empty() || !socket.can_send() {
            break;
        }
        match socket.send_slice(&flow.to_guest) {
            Ok(0) => break,
            Ok(n) => {
                flow.to_guest.drain(..n);
                moved = true;
            }
            Err(_) => {
                flow.done = true;
                return true;
            }
        }
    }

    if flow.host_eof && flow.to_guest.is_empty() && !flow.fin_sent {
        socket.close();
        flow.fin_sent = true;
        moved = true;
    }

    if socket.state() == tcp::State::Closed {
        flow.done = true;
    }

    moved
}

/// Parse a frame just enough to see a TCP SYN's destination.
fn sniff_tcp_syn(frame: &[u8]) -> Option<(Ipv4Addr, u16)> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != IpProtocol::Tcp {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    if tcp.syn() && !tcp.ack() {
        Some((Ipv4Addr::from(ip.dst_addr().0), tcp.dst_port()))
    } else {
        None
    }
}

fn ip_from_smoltcp(addr: IpAddress) -> Option<IpAddr> {
    match addr {
        IpAddress::Ipv4(v4) => Some(IpAddr::V4(Ipv4Addr::from(v4.0))),
    }
}

fn connect_unix(path: &PathBuf) -> io::Result<HostConn> {
    let stream = UnixStream::connect(path)?;
    stream.set_nonblocking(true)?;
    Ok(HostConn::Unix(stream))
}

/// Nonblocking TCP dial; completion is observed via `poll_connected`.
fn connect_tcp_nonblocking(addr: SocketAddr) -> io::Result<HostConn> {
    let (domain, sockaddr, len) = match addr {
        SocketAddr::V4(v4) => {
            let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sa as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (
                libc::AF_INET,
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sa as *const libc::sockaddr_in6 as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (
                libc::AF_INET6,
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    };

    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let stream = unsafe { TcpStream::from_raw_fd(fd) };

    let rc = unsafe {
        libc::connect(
            stream.as_raw_fd(),
            &sockaddr as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }
    Ok(HostConn::Tcp(stream))
}

fn socket_error(fd: i32) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal Ethernet+IPv4+TCP SYN frame for sniff tests.
    fn syn_frame(dst: [u8; 4], dst_port: u16, syn: bool, ack: bool) -> Vec<u8> {
        use smoltcp::wire::{Ipv4Repr, TcpControl, TcpRepr, TcpSeqNumber};

        let tcp_repr = TcpRepr {
            src_port: 40000,
            dst_port,
            control: if syn { TcpControl::Syn } else { TcpControl::None },
            seq_number: TcpSeqNumber(100),
            ack_number: if ack { Some(TcpSeqNumber(1)) } else { None },
            window_len: 64_000,
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None, None, None],
            payload: &[],
        };
        let ip_repr = Ipv4Repr {
            src_addr: Ipv4Address([10, 0, 3, 2]),
            dst_addr: Ipv4Address(dst),
            next_header: IpProtocol::Tcp,
            payload_len: tcp_repr.buffer_len(),
            hop_limit: 64,
        };

        let mut frame = vec![0u8; 14 + ip_repr.buffer_len() + tcp_repr.buffer_len()];
        {
            let mut eth = EthernetFrame::new_unchecked(&mut frame[..]);
            eth.set_src_addr(EthernetAddress([0x02, 0, 0, 0, 0, 2]));
            eth.set_dst_addr(EthernetAddress(GATEWAY_MAC));
            eth.set_ethertype(EthernetProtocol::Ipv4);
        }
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut frame[14..]);
            ip_repr.emit(&mut ip, &smoltcp::phy::ChecksumCapabilities::default());
        }
        {
            let mut tcp = TcpPacket::new_unchecked(&mut frame[14 + ip_repr.buffer_len()..]);
            tcp_repr.emit(
                &mut tcp,
                &IpAddress::Ipv4(ip_repr.src_addr),
                &IpAddress::Ipv4(ip_repr.dst_addr),
                &smoltcp::phy::ChecksumCapabilities::default(),
            );
        }
        frame
    }

    #[test]
    fn test_sniff_detects_syn() {
        let frame = syn_frame([93, 184, 216, 34], 8443, true, false);
        let (dst, port) = sniff_tcp_syn(&frame).unwrap();
        assert_eq!(dst, Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_sniff_ignores_ack_and_non_syn() {
        let ack = syn_frame([93, 184, 216, 34], 8443, true, true);
        assert!(sniff_tcp_syn(&ack).is_none());

        let plain = syn_frame([93, 184, 216, 34], 8443, false, false);
        assert!(sniff_tcp_syn(&plain).is_none());
    }

    #[test]
    fn test_sniff_ignores_garbage() {
        assert!(sniff_tcp_syn(&[0u8; 10]).is_none());
        assert!(sniff_tcp_syn(&[]).is_none());
    }

    fn syn_test_config(block_private_ips: bool) -> StackConfig {
        StackConfig {
            gateway_ip: DEFAULT_GATEWAY_IP,
            guest_ip: DEFAULT_GUEST_IP,
            prefix_len: DEFAULT_PREFIX_LEN,
            http_socket: PathBuf::from("/nonexistent/http.sock"),
            tls_socket: PathBuf::from("/nonexistent/tls.sock"),
            policy: Arc::new(PolicyEngine::new(&crate::api::NetworkConfig {
                allowed_hosts: vec!["*".to_string()],
                block_private_ips,
                secrets: Default::default(),
            })),
        }
    }

    #[test]
    fn test_syn_to_private_http_target_gets_no_listener() {
        let mut sockets = SocketSet::new(Vec::new());
        let mut listeners = HashMap::new();
        let config = syn_test_config(true);

        // Metadata-service style target: private, port 80, allowlist "*".
        handle_syn(
            &mut sockets,
            &mut listeners,
            &config,
            Ipv4Addr::new(169, 254, 169, 254),
            80,
        );
        assert!(listeners.get(&80).map_or(true, |handles| handles.is_empty()));

        handle_syn(
            &mut sockets,
            &mut listeners,
            &config,
            Ipv4Addr::new(93, 184, 216, 34),
            80,
        );
        assert_eq!(listeners.get(&80).unwrap().len(), 1);
    }

    #[test]
    fn test_syn_to_private_https_allowed_when_blocking_off() {
        let mut sockets = SocketSet::new(Vec::new());
        let mut listeners = HashMap::new();
        let config = syn_test_config(false);

        handle_syn(
            &mut sockets,
            &mut listeners,
            &config,
            Ipv4Addr::new(192, 168, 1, 10),
            443,
        );
        assert_eq!(listeners.get(&443).unwrap().len(), 1);
    }

    #[test]
    fn test_syn_other_port_policy_checked() {
        let mut sockets = SocketSet::new(Vec::new());
        let mut listeners = HashMap::new();
        let config = syn_test_config(true);

        handle_syn(
            &mut sockets,
            &mut listeners,
            &config,
            Ipv4Addr::new(10, 0, 0, 5),
            8443,
        );
        assert!(listeners.get(&8443).map_or(true, |handles| handles.is_empty()));

        handle_syn(
            &mut sockets,
            &mut listeners,
            &config,
            Ipv4Addr::new(93, 184, 216, 34),
            8443,
        );
        assert_eq!(listeners.get(&8443).unwrap().len(), 1);
    }

    #[test]
    fn test_dial_does_not_block() {
        // 198.51.100.1 (TEST-NET-2) never answers; the dial itself must
        // return immediately whatever the network situation is.
        let started = std::time::Instant::now();
        let _ = connect_tcp_nonblocking(SocketAddr::new("198.51.100.1".parse().unwrap(), 81));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
