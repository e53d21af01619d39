//! Sandbox lifecycle controller.
//!
//! Composes the frame transport, userspace stack, MITM listeners, VMM
//! backend, control client, VFS server, and exec relay, and owns their
//! lifetimes. Boot is strictly ordered and any failure unwinds everything
//! already started; teardown attempts every step independently and
//! aggregates errors instead of aborting.
//!
//! Cross-component references are data (paths, Arcs of immutable state),
//! never shared mutable structures: the stack gets the policy engine and
//! two socket paths, the interceptor gets the policy engine and the CA,
//! the relay gets the control client and the VFS router.

pub mod ca;
pub mod error;
pub mod relay;

pub use error::SandboxError;
pub use relay::{exec_interactive_via_relay, exec_via_relay};

use crate::api::{Config, ExecOptions, ExecResult};
use crate::net::policy::PolicyEngine;
use crate::net::stack::{self, NetStack, StackConfig};
use crate::net::transport::{self, FrameTransport};
use crate::proxy::Interceptor;
use crate::state::{self, Status};
use crate::vfs::MountRouter;
use crate::vmm::firecracker::FirecrackerMachine;
use crate::vmm::{Machine, VmSpec};
use crate::vsock::{ControlClient, ControlDialer, ControlError, ExecSpec, VsockStream, VFS_PORT};
use async_trait::async_trait;
use ca::EphemeralCa;
use relay::{ExecRelay, RelayContext};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default deadline for the guest's ready handshake.
pub const BOOT_DEADLINE: Duration = Duration::from_secs(30);

/// Construction options the CLI resolves before `Sandbox::new`.
#[derive(Debug, Clone)]
pub struct Options {
    pub rootfs_path: PathBuf,
    pub kernel_path: PathBuf,
    /// Remove the state directory after a clean close (`--rm`).
    pub remove_on_close: bool,
    /// State root override (tests, embedding).
    pub state: Option<state::Manager>,
}

/// A single micro-VM sandbox.
pub struct Sandbox {
    id: String,
    config: Config,
    options: Options,
    state: state::Manager,
    dir: PathBuf,
    tap_name: String,

    policy: Arc<PolicyEngine>,
    router: Arc<MountRouter>,

    shutdown_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    machine: OnceLock<Arc<FirecrackerMachine>>,
    control: OnceLock<ControlClient>,
    net: Mutex<Option<NetStack>>,
    relay: Mutex<Option<ExecRelay>>,
    vfs_task: Mutex<Option<tokio::task::JoinHandle<()>>>,

    status: Mutex<Status>,
    crashed: AtomicBool,
    closing: Arc<AtomicBool>,
    close_result: OnceCell<Result<(), String>>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox").field("id", &self.id).finish()
    }
}

struct MachineDialer(Arc<dyn Machine>);

#[async_trait]
impl ControlDialer for MachineDialer {
    async fn dial(&self, port: u32) -> std::io::Result<VsockStream> {
        self.0
            .vsock_connect(port)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e))
    }
}

impl Sandbox {
    /// Validate the config and set up host-side bookkeeping. Does not touch
    /// the VMM.
    pub fn new(mut config: Config, options: Options) -> Result<Self, SandboxError> {
        config.validate()?;
        config.normalize();

        let id = state::generate_id();
        let state = options.state.clone().unwrap_or_default();
        state.create(&id, &config)?;
        let dir = state.vm_dir(&id);

        let policy = Arc::new(PolicyEngine::new(&config.network));
        let router = Arc::new(MountRouter::new(&config.vfs).map_err(|e| {
            SandboxError::Config(crate::api::ConfigError::InvalidVolume {
                input: String::new(),
                reason: e.to_string(),
            })
        })?);

        // Interface names are capped at 15 chars; the 8-hex id suffix fits.
        let tap_name = format!("tap-{}", &id[3..]);

        let (shutdown_tx, _) = watch::channel(false);
        info!(id = %id, image = %config.image, "sandbox created");

        Ok(Self {
            id,
            config,
            options,
            state,
            dir,
            tap_name,
            policy,
            router,
            shutdown_tx,
            cancel: CancellationToken::new(),
            machine: OnceLock::new(),
            control: OnceLock::new(),
            net: Mutex::new(None),
            relay: Mutex::new(None),
            vfs_task: Mutex::new(None),
            status: Mutex::new(Status::Creating),
            crashed: AtomicBool::new(false),
            closing: Arc::new(AtomicBool::new(false)),
            close_result: OnceCell::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    /// Cancellation token wired into every in-flight exec; the CLI cancels
    /// it from its signal handler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_status(&self, status: Status) {
        *self.status.lock().unwrap() = status;
        if let Err(e) = self.state.set_status(&self.id, status) {
            warn!(id = %self.id, "failed to persist status: {e}");
        }
    }

    /// Boot the sandbox: transport, stack, interception, VMM, ready
    /// handshake, VFS, relay. Any failure tears down what was started and
    /// surfaces as a boot error.
    pub async fn start(&self) -> Result<(), SandboxError> {
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(id = %self.id, "boot failed, unwinding: {e}");
                let _ = self.close().await;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), SandboxError> {
        let boot = |stage: &'static str| move |e: std::io::Error| SandboxError::boot(stage, e);

        // (i) interception listeners, so the stack has somewhere to splice.
        let ca = Arc::new(
            EphemeralCa::generate(&self.dir.join("ca"), &self.id)
                .map_err(|e| SandboxError::boot("ca", e))?,
        );
        let http_socket = self.dir.join("http.sock");
        let tls_socket = self.dir.join("tls.sock");
        let _ = std::fs::remove_file(&http_socket);
        let _ = std::fs::remove_file(&tls_socket);
        let http_listener =
            tokio::net::UnixListener::bind(&http_socket).map_err(boot("proxy-listen"))?;
        let tls_listener =
            tokio::net::UnixListener::bind(&tls_socket).map_err(boot("proxy-listen"))?;

        let interceptor = Arc::new(
            Interceptor::new(self.policy.clone(), ca.clone())
                .map_err(|e| SandboxError::boot("proxy", e))?,
        );
        tokio::spawn(
            interceptor
                .clone()
                .serve_http(http_listener, self.shutdown_tx.subscribe()),
        );
        tokio::spawn(interceptor.serve_tls(tls_listener, self.shutdown_tx.subscribe()));

        // (ii) frame transport + userspace stack.
        transport::create_tap(&self.tap_name).map_err(boot("tap"))?;
        let frame_fd = FrameTransport::attach_tap(&self.tap_name).map_err(boot("tap-attach"))?;
        let net = NetStack::spawn(
            frame_fd,
            StackConfig {
                gateway_ip: stack::DEFAULT_GATEWAY_IP,
                guest_ip: stack::DEFAULT_GUEST_IP,
                prefix_len: stack::DEFAULT_PREFIX_LEN,
                http_socket,
                tls_socket,
                policy: self.policy.clone(),
            },
        );
        *self.net.lock().unwrap() = Some(net);

        // (iii) the VMM itself. The VFS listener must exist before boot so
        // the guest's connect lands on a bound socket.
        let cmdline = format!(
            "console=ttyS0 reboot=k panic=1 pci=off \
             ip={guest}::{gateway}:255.255.255.252::eth0:off \
             matchlock.workspace={workspace} matchlock.privileged={privileged}",
            guest = stack::DEFAULT_GUEST_IP,
            gateway = stack::DEFAULT_GATEWAY_IP,
            workspace = self.config.vfs.workspace,
            privileged = self.config.privileged,
        );
        let spec = VmSpec {
            cpus: self.config.resources.cpus,
            memory_mb: self.config.resources.memory_mb,
            kernel: self.options.kernel_path.clone(),
            cmdline,
            rootfs: self.options.rootfs_path.clone(),
            tap_device: self.tap_name.clone(),
            guest_mac: "02:4d:4c:00:00:02".to_string(),
            vsock_uds: self.dir.join("vsock.sock"),
        };
        let machine =
            FirecrackerMachine::create(spec, &self.dir).map_err(|e| SandboxError::boot("vmm", e))?;
        let vfs_listener = machine
            .vsock_listen(VFS_PORT)
            .await
            .map_err(|e| SandboxError::boot("vfs-listen", e))?;
        machine
            .start()
            .await
            .map_err(|e| SandboxError::boot("vmm-spawn", e))?;
        let _ = self.machine.set(machine.clone());

        if let Some(pid) = machine.pid() {
            self.state.set_pid(&self.id, pid)?;
        }

        // Crash watcher: a VMM exit outside close() marks the sandbox
        // crashed and cancels in-flight execs.
        {
            let machine = machine.clone();
            let closing = self.closing.clone();
            let cancel = self.cancel.clone();
            let state = self.state.clone();
            let id = self.id.clone();
            tokio::spawn(async move {
                let exit = machine.wait().await;
                if !closing.load(Ordering::Relaxed) {
                    warn!(id = %id, ?exit, "VMM exited unexpectedly");
                    let _ = state.set_status(&id, Status::Crashed);
                    cancel.cancel();
                }
            });
        }

        // (iv) ready handshake.
        let control = ControlClient::new(Arc::new(MachineDialer(machine.clone())));
        control
            .wait_ready(BOOT_DEADLINE)
            .await
            .map_err(|e| SandboxError::boot("ready", e))?;
        let _ = self.control.set(control.clone());

        // (v) VFS serving: accept the guest FUSE driver's stream, then keep
        // accepting so a remount can reconnect.
        let router = self.router.clone();
        let first = tokio::time::timeout(BOOT_DEADLINE, vfs_listener.accept())
            .await
            .map_err(|_| {
                SandboxError::boot(
                    "vfs-mount",
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "guest FUSE driver did not connect",
                    ),
                )
            })?
            .map_err(|e| SandboxError::boot("vfs-mount", e))?;
        let vfs_task = tokio::spawn(async move {
            let serve_router = router.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::vfs::serve_stream(first, serve_router).await {
                    debug!("VFS stream ended: {e}");
                }
            });
            loop {
                match vfs_listener.accept().await {
                    Ok(stream) => {
                        let router = router.clone();
                        tokio::spawn(async move {
                            if let Err(e) = crate::vfs::serve_stream(stream, router).await {
                                debug!("VFS stream ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        debug!("VFS listener closed: {e}");
                        break;
                    }
                }
            }
        });
        *self.vfs_task.lock().unwrap() = Some(vfs_task);

        // (vi) exec relay for sibling CLI processes.
        let relay = ExecRelay::start(
            self.state.exec_socket_path(&self.id),
            RelayContext {
                control,
                router: self.router.clone(),
                base_env: self.base_env(),
                default_workdir: self.config.vfs.workspace.clone(),
            },
            self.cancel.clone(),
        )
        .map_err(boot("relay"))?;
        *self.relay.lock().unwrap() = Some(relay);

        self.set_status(Status::Running);
        info!(id = %self.id, "sandbox running");
        Ok(())
    }

    /// Environment every guest exec inherits: secret placeholders only,
    /// never values.
    fn base_env(&self) -> HashMap<String, String> {
        self.config
            .network
            .secrets
            .iter()
            .map(|(name, secret)| (name.clone(), secret.placeholder.clone()))
            .collect()
    }

    fn exec_spec(&self, cmd: &str, options: &ExecOptions) -> ExecSpec {
        let mut env = self.base_env();
        env.extend(options.env.clone());
        ExecSpec {
            cmd: cmd.to_string(),
            env,
            cwd: options
                .working_dir
                .clone()
                .unwrap_or_else(|| self.config.vfs.workspace.clone()),
            stdin: options.stdin.clone(),
        }
    }

    fn control(&self) -> Result<&ControlClient, SandboxError> {
        if self.crashed.load(Ordering::Relaxed) {
            return Err(SandboxError::Crash("vsock channel lost".into()));
        }
        match self.status() {
            Status::Running => {}
            other => return Err(SandboxError::WrongState(other)),
        }
        self.control
            .get()
            .ok_or(SandboxError::WrongState(Status::Creating))
    }

    fn map_exec_err(&self, err: ControlError) -> SandboxError {
        match err {
            ControlError::Dial(_) | ControlError::Io(_) => {
                // A lost vsock while running is a crash, not a retry.
                self.crashed.store(true, Ordering::Relaxed);
                self.set_status(Status::Crashed);
                SandboxError::Crash(err.to_string())
            }
            other => SandboxError::Exec(other),
        }
    }

    /// Buffered exec.
    pub async fn exec(&self, cmd: &str, options: &ExecOptions) -> Result<ExecResult, SandboxError> {
        let control = self.control()?;
        control
            .run(self.exec_spec(cmd, options), &self.cancel)
            .await
            .map_err(|e| self.map_exec_err(e))
    }

    /// Streaming exec: stdout/stderr frames land on the caller's writers in
    /// arrival order.
    pub async fn exec_stream<O, E>(
        &self,
        cmd: &str,
        options: &ExecOptions,
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<ExecResult, SandboxError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let control = self.control()?;
        control
            .run_stream(self.exec_spec(cmd, options), stdout, stderr, &self.cancel)
            .await
            .map_err(|e| self.map_exec_err(e))
    }

    /// Interactive exec with a guest PTY.
    pub async fn exec_interactive<I, O>(
        &self,
        cmd: &str,
        options: &ExecOptions,
        rows: u16,
        cols: u16,
        stdin: I,
        stdout: O,
        resize: mpsc::Receiver<(u16, u16)>,
    ) -> Result<i32, SandboxError>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        if !self
            .machine
            .get()
            .map(|machine| machine.pty_supported())
            .unwrap_or(false)
        {
            return Err(SandboxError::NoPty);
        }
        let control = self.control()?;
        control
            .run_pty(
                self.exec_spec(cmd, options),
                rows,
                cols,
                stdin,
                stdout,
                resize,
                &self.cancel,
            )
            .await
            .map_err(|e| self.map_exec_err(e))
    }

    /// Write a file through the VFS mount table.
    pub async fn write_file(&self, path: &str, bytes: Vec<u8>) -> Result<(), SandboxError> {
        let router = self.router.clone();
        let path_owned = path.to_string();
        tokio::task::spawn_blocking(move || router.write_file(&path_owned, &bytes))
            .await
            .unwrap_or(Err(libc::EIO))
            .map_err(|errno| SandboxError::File {
                path: path.to_string(),
                errno,
            })
    }

    /// Read a file through the VFS mount table.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let router = self.router.clone();
        let path_owned = path.to_string();
        tokio::task::spawn_blocking(move || router.read_file(&path_owned))
            .await
            .unwrap_or(Err(libc::EIO))
            .map_err(|errno| SandboxError::File {
                path: path.to_string(),
                errno,
            })
    }

    /// Idempotent teardown with no graceful-shutdown budget.
    pub async fn close(&self) -> Result<(), SandboxError> {
        self.close_with(Duration::ZERO).await
    }

    /// Idempotent teardown. Concurrent and repeated calls resolve one
    /// teardown and all observe the same aggregated result.
    pub async fn close_with(&self, grace: Duration) -> Result<(), SandboxError> {
        let result = self
            .close_result
            .get_or_init(|| self.teardown(grace))
            .await;
        result
            .clone()
            .map_err(SandboxError::Close)
    }

    async fn teardown(&self, grace: Duration) -> Result<(), String> {
        self.closing.store(true, Ordering::Relaxed);
        let mut errors: Vec<String> = Vec::new();
        info!(id = %self.id, "tearing down");

        if self.status() == Status::Running {
            self.set_status(Status::Stopping);
        }

        // Graceful path first: ask the guest to power off, give the VMM the
        // caller's budget to exit on its own.
        if grace > Duration::ZERO {
            if let Some(control) = self.control.get() {
                if let Err(e) = tokio::time::timeout(grace, control.shutdown()).await {
                    debug!("graceful shutdown request timed out: {e}");
                }
            }
            if let Some(machine) = self.machine.get() {
                let deadline = tokio::time::timeout(grace, async {
                    while machine.pid().is_some() {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                });
                let _ = deadline.await;
            }
        }

        self.cancel.cancel();

        if let Some(machine) = self.machine.get() {
            if let Err(e) = machine.kill().await {
                errors.push(format!("kill VMM: {e}"));
            }
        }

        if let Some(relay) = self.relay.lock().unwrap().take() {
            relay.stop();
        }

        if let Some(task) = self.vfs_task.lock().unwrap().take() {
            task.abort();
        }

        // Stops the interceptor accept loops, if any were started.
        let _ = self.shutdown_tx.send(true);

        let net = self.net.lock().unwrap().take();
        if let Some(net) = net {
            // Joining the stack thread blocks; keep it off the runtime.
            let joined = tokio::task::spawn_blocking(move || drop(net)).await;
            if let Err(e) = joined {
                errors.push(format!("stop stack: {e}"));
            }
        }

        if let Err(e) = transport::delete_tap(&self.tap_name) {
            debug!("tap removal: {e}");
        }

        for socket in ["http.sock", "tls.sock", "exec.sock", "vsock.sock"] {
            let _ = std::fs::remove_file(self.dir.join(socket));
        }
        let _ = std::fs::remove_file(self.dir.join(format!("vsock.sock_{VFS_PORT}")));
        let _ = std::fs::remove_dir_all(self.dir.join("ca"));

        let final_status = if self.crashed.load(Ordering::Relaxed) {
            Status::Crashed
        } else {
            Status::Stopped
        };
        self.set_status(final_status);

        if self.options.remove_on_close && final_status == Status::Stopped {
            if let Err(e) = self.state.remove(&self.id) {
                errors.push(format!("remove state dir: {e}"));
            }
        }

        info!(id = %self.id, status = %final_status, "teardown complete");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}
