//! Firecracker backend.
//!
//! The VM is described by a config file passed at spawn; no API-socket
//! choreography is needed for this use. Vsock follows Firecracker's
//! host-side Unix socket contract:
//!
//! - host-initiated: connect to the device's UDS, send `CONNECT <port>\n`,
//!   expect `OK <assigned>\n`, then the stream is raw bytes
//! - guest-initiated: Firecracker connects to `<uds>_<port>` on the host,
//!   so listening is a plain `UnixListener` bound before boot

use super::{Machine, VmSpec, VmmError, VsockListener};
use crate::vsock::VsockStream;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Binary name; overridable for packaged installs.
fn firecracker_binary() -> String {
    std::env::var("MATCHLOCK_FIRECRACKER").unwrap_or_else(|_| "firecracker".to_string())
}

pub struct FirecrackerMachine {
    spec: VmSpec,
    config_path: PathBuf,
    api_socket: PathBuf,
    console_log: PathBuf,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
}

impl FirecrackerMachine {
    /// Write the VM config under `dir` and prepare the machine. Nothing is
    /// spawned until [`Machine::start`].
    pub fn create(spec: VmSpec, dir: &std::path::Path) -> Result<Arc<Self>, VmmError> {
        let config = serde_json::json!({
            "boot-source": {
                "kernel_image_path": spec.kernel,
                "boot_args": spec.cmdline,
            },
            "drives": [{
                "drive_id": "rootfs",
                "path_on_host": spec.rootfs,
                "is_root_device": true,
                "is_read_only": false,
            }],
            "machine-config": {
                "vcpu_count": spec.cpus,
                "mem_size_mib": spec.memory_mb,
                "smt": false,
            },
            "network-interfaces": [{
                "iface_id": "eth0",
                "guest_mac": spec.guest_mac,
                "host_dev_name": spec.tap_device,
            }],
            "vsock": {
                "guest_cid": 3,
                "uds_path": spec.vsock_uds,
            },
        });

        let config_path = dir.join("firecracker.json");
        std::fs::write(
            &config_path,
            serde_json::to_vec_pretty(&config).map_err(|e| VmmError::Config(e.to_string()))?,
        )
        .map_err(VmmError::Process)?;

        Ok(Arc::new(Self {
            api_socket: dir.join("firecracker.sock"),
            console_log: dir.join("console.log"),
            config_path,
            spec,
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
        }))
    }

    /// Serial console output path (boot diagnostics).
    pub fn console_log(&self) -> &std::path::Path {
        &self.console_log
    }
}

#[async_trait]
impl Machine for FirecrackerMachine {
    async fn start(&self) -> Result<(), VmmError> {
        let console = std::fs::File::create(&self.console_log).map_err(VmmError::Process)?;
        let child = Command::new(firecracker_binary())
            .arg("--api-sock")
            .arg(&self.api_socket)
            .arg("--config-file")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(console.try_clone().map_err(VmmError::Process)?))
            .stderr(Stdio::from(console))
            .kill_on_drop(true)
            .spawn()
            .map_err(VmmError::Process)?;

        if let Some(pid) = child.id() {
            self.pid.store(pid, Ordering::Relaxed);
        }
        info!(
            pid = self.pid.load(Ordering::Relaxed),
            kernel = %self.spec.kernel.display(),
            "firecracker spawned"
        );
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn wait(&self) -> Result<i32, VmmError> {
        // Take the child out so kill() can run concurrently via the pid.
        let mut child = self
            .child
            .lock()
            .await
            .take()
            .ok_or(VmmError::NotRunning)?;
        let status = child.wait().await.map_err(VmmError::Process)?;
        self.pid.store(0, Ordering::Relaxed);
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&self) -> Result<(), VmmError> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match child.start_kill() {
                Ok(()) => {
                    let _ = child.wait().await;
                }
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                    // Already exited.
                }
                Err(e) => warn!("kill failed: {e}"),
            }
            self.pid.store(0, Ordering::Relaxed);
        } else {
            // A waiter owns the child; signal by pid and let it reap.
            let pid = self.pid.load(Ordering::Relaxed);
            if pid != 0 {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    async fn vsock_connect(&self, port: u32) -> Result<VsockStream, VmmError> {
        let stream = UnixStream::connect(&self.spec.vsock_uds)
            .await
            .map_err(VmmError::Vsock)?;
        let mut stream = BufReader::new(stream);

        stream
            .get_mut()
            .write_all(format!("CONNECT {port}\n").as_bytes())
            .await
            .map_err(VmmError::Vsock)?;

        let mut line = String::new();
        stream
            .read_line(&mut line)
            .await
            .map_err(VmmError::Vsock)?;
        if !line.starts_with("OK ") {
            return Err(VmmError::VsockHandshake(format!(
                "guest port {port} refused: {}",
                line.trim()
            )));
        }
        debug!(port, "vsock stream established");
        Ok(Box::new(stream))
    }

    async fn vsock_listen(&self, port: u32) -> Result<VsockListener, VmmError> {
        let path = PathBuf::from(format!("{}_{port}", self.spec.vsock_uds.display()));
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).map_err(VmmError::Vsock)?;
        debug!(port, path = %path.display(), "vsock listener bound");
        Ok(VsockListener::new(listener))
    }

    fn pty_supported(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec(dir: &std::path::Path) -> VmSpec {
        VmSpec {
            cpus: 2,
            memory_mb: 512,
            kernel: dir.join("vmlinux"),
            cmdline: "console=ttyS0 reboot=k panic=1".to_string(),
            rootfs: dir.join("rootfs.ext4"),
            tap_device: "tap-test0".to_string(),
            guest_mac: "02:4d:4c:00:00:02".to_string(),
            vsock_uds: dir.join("vsock.sock"),
        }
    }

    #[test]
    fn test_config_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FirecrackerMachine::create(test_spec(dir.path()), dir.path()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("firecracker.json")).unwrap();
        let config: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(config["machine-config"]["vcpu_count"], 2);
        assert_eq!(config["machine-config"]["mem_size_mib"], 512);
        assert_eq!(config["vsock"]["guest_cid"], 3);
        assert_eq!(
            config["network-interfaces"][0]["host_dev_name"],
            "tap-test0"
        );
        assert!(machine.pid().is_none());
        assert!(machine.pty_supported());
    }

    #[tokio::test]
    async fn test_vsock_connect_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FirecrackerMachine::create(test_spec(dir.path()), dir.path()).unwrap();

        // Fake the Firecracker vsock UDS endpoint.
        let uds = dir.path().join("vsock.sock");
        let listener = tokio::net::UnixListener::bind(&uds).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "CONNECT 1024\n");
            reader
                .get_mut()
                .write_all(b"OK 1073741824\n")
                .await
                .unwrap();
            reader.get_mut().write_all(b"payload").await.unwrap();
        });

        let mut stream = machine.vsock_connect(1024).await.unwrap();
        let mut buf = [0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut stream, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"payload");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_vsock_connect_refused() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FirecrackerMachine::create(test_spec(dir.path()), dir.path()).unwrap();

        let uds = dir.path().join("vsock.sock");
        let listener = tokio::net::UnixListener::bind(&uds).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let _ = reader.get_mut().write_all(b"FAILED\n").await;
        });

        let err = machine.vsock_connect(1024).await.unwrap_err();
        assert!(matches!(err, VmmError::VsockHandshake(_)));
    }

    #[tokio::test]
    async fn test_vsock_listen_binds_port_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FirecrackerMachine::create(test_spec(dir.path()), dir.path()).unwrap();

        let _listener = machine.vsock_listen(1025).await.unwrap();
        assert!(dir.path().join("vsock.sock_1025").exists());
    }
}
