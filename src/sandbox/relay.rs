//! Exec relay: host-local access into a running sandbox.
//!
//! A Unix listener at `<state>/<id>/exec.sock` re-exposes the control-plane
//! operations to other host processes. This is how a second CLI invocation
//! (`matchlock exec <id>`) reaches a sandbox owned by the first one. Each
//! inbound connection carries exactly one framed request:
//!
//! - `exec`: one JSON request line, one JSON result line
//! - `exec_interactive`: one JSON request line, then the stream switches to
//!   the PTY binary framing from [`crate::vsock::protocol`]
//! - `read_file` / `write_file`: one JSON request line, one JSON result line
//!
//! The relay starts after the guest's ready handshake and stops at close.

use crate::api::{ExecOptions, ExecResult};
use crate::vfs::MountRouter;
use crate::vsock::protocol::{self, PtyExit, FRAME_DATA, FRAME_EXIT, FRAME_RESIZE};
use crate::vsock::{ControlClient, ExecSpec};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One request per relay connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayRequest {
    Exec {
        cmd: String,
        #[serde(default)]
        workdir: Option<String>,
    },
    ExecInteractive {
        cmd: String,
        #[serde(default)]
        workdir: Option<String>,
        rows: u16,
        cols: u16,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        data_b64: String,
    },
}

/// Reply for the single-shot ops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
}

impl RelayResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// What the relay needs from the controller: exec plumbing, the VFS router,
/// and the env/cwd defaults applied to relayed commands.
#[derive(Clone)]
pub struct RelayContext {
    pub control: ControlClient,
    pub router: Arc<MountRouter>,
    pub base_env: HashMap<String, String>,
    pub default_workdir: String,
}

impl RelayContext {
    fn spec(&self, cmd: String, workdir: Option<String>) -> ExecSpec {
        ExecSpec {
            cmd,
            env: self.base_env.clone(),
            cwd: workdir.unwrap_or_else(|| self.default_workdir.clone()),
            stdin: None,
        }
    }
}

/// Running relay listener.
pub struct ExecRelay {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl ExecRelay {
    /// Bind the relay socket (0600) and start serving.
    pub fn start(
        path: PathBuf,
        context: RelayContext,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        let accept_path = path.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let context = context.clone();
                                let cancel = cancel.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, context, cancel).await {
                                        debug!("relay connection ended: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("relay accept failed: {e}");
                                break;
                            }
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!(path = %accept_path.display(), "relay stopped");
        });

        Ok(Self { path, task })
    }

    /// Stop the listener and remove the socket file.
    pub fn stop(&self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(
    stream: UnixStream,
    context: RelayContext,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let request: Option<RelayRequest> = protocol::read_json(&mut reader).await?;
    let Some(request) = request else {
        return Ok(());
    };

    match request {
        RelayRequest::Exec { cmd, workdir } => {
            let response = match context
                .control
                .run(context.spec(cmd, workdir), &cancel)
                .await
            {
                Ok(result) => RelayResponse {
                    ok: true,
                    exit: Some(result.exit_code),
                    stdout_b64: Some(B64.encode(&result.stdout)),
                    stderr_b64: Some(B64.encode(&result.stderr)),
                    ..Default::default()
                },
                Err(e) => RelayResponse::failure(e.to_string()),
            };
            protocol::write_json(&mut write_half, &response).await
        }
        RelayRequest::ExecInteractive {
            cmd,
            workdir,
            rows,
            cols,
        } => {
            // Bridge the relay stream's binary frames into a PTY session:
            // inbound data/resize frames feed the guest, PTY output flows
            // back as data frames, then one exit frame.
            let (resize_tx, resize_rx) = mpsc::channel(4);
            let (stdin_pipe_read, stdin_pipe_write) = tokio::io::duplex(16 * 1024);
            let (mut stdout_pipe_read, stdout_pipe_write) = tokio::io::duplex(16 * 1024);

            let pump = tokio::spawn(pump_relay_frames(reader, stdin_pipe_write, resize_tx));
            let forwarder = tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stdout_pipe_read.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if protocol::write_frame(&mut write_half, FRAME_DATA, &chunk[..n])
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                write_half
            });

            let result = context
                .control
                .run_pty(
                    context.spec(cmd, workdir),
                    rows,
                    cols,
                    stdin_pipe_read,
                    stdout_pipe_write,
                    resize_rx,
                    &cancel,
                )
                .await;
            pump.abort();

            let Ok(mut write_half) = forwarder.await else {
                return Ok(());
            };
            let exit = PtyExit {
                exit: result.unwrap_or(-1),
                killed: None,
            };
            let payload = serde_json::to_vec(&exit).expect("exit payload serializes");
            protocol::write_frame(&mut write_half, FRAME_EXIT, &payload).await
        }
        RelayRequest::ReadFile { path } => {
            let router = context.router.clone();
            let read = tokio::task::spawn_blocking(move || router.read_file(&path))
                .await
                .unwrap_or(Err(libc::EIO));
            let response = match read {
                Ok(bytes) => RelayResponse {
                    ok: true,
                    data_b64: Some(B64.encode(&bytes)),
                    ..Default::default()
                },
                Err(errno) => RelayResponse::failure(format!("errno {errno}")),
            };
            protocol::write_json(&mut write_half, &response).await
        }
        RelayRequest::WriteFile { path, data_b64 } => {
            let response = match B64.decode(&data_b64) {
                Ok(bytes) => {
                    let router = context.router.clone();
                    let write =
                        tokio::task::spawn_blocking(move || router.write_file(&path, &bytes))
                            .await
                            .unwrap_or(Err(libc::EIO));
                    match write {
                        Ok(()) => RelayResponse {
                            ok: true,
                            ..Default::default()
                        },
                        Err(errno) => RelayResponse::failure(format!("errno {errno}")),
                    }
                }
                Err(e) => RelayResponse::failure(format!("bad payload encoding: {e}")),
            };
            protocol::write_json(&mut write_half, &response).await
        }
    }
}

/// Feed inbound relay frames into the PTY session's stdin/resize channels.
async fn pump_relay_frames<R, W>(
    mut reader: R,
    mut stdin_sink: W,
    resize_tx: mpsc::Sender<(u16, u16)>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    loop {
        match protocol::read_frame(&mut reader).await {
            Ok(Some((FRAME_DATA, payload))) => {
                if payload.is_empty() {
                    let _ = stdin_sink.shutdown().await;
                } else if stdin_sink.write_all(&payload).await.is_err() {
                    break;
                }
            }
            Ok(Some((FRAME_RESIZE, payload))) => {
                if let Ok(resize) = serde_json::from_slice::<protocol::PtyResize>(&payload) {
                    let _ = resize_tx.send((resize.rows, resize.cols)).await;
                }
            }
            Ok(Some(_)) | Ok(None) | Err(_) => break,
        }
    }
}

/// Client side: buffered exec through a sandbox's relay socket.
pub async fn exec_via_relay(
    socket_path: &Path,
    cmd: &str,
    options: &ExecOptions,
) -> std::io::Result<ExecResult> {
    let started = std::time::Instant::now();
    let stream = UnixStream::connect(socket_path).await?;
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    protocol::write_json(
        &mut write_half,
        &RelayRequest::Exec {
            cmd: cmd.to_string(),
            workdir: options.working_dir.clone(),
        },
    )
    .await?;

    let response: RelayResponse = protocol::read_json(&mut reader)
        .await?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "relay closed"))?;
    if !response.ok {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            response.error.unwrap_or_else(|| "relay exec failed".into()),
        ));
    }

    let decode = |field: Option<String>| {
        field
            .map(|b64| B64.decode(b64))
            .transpose()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    };
    Ok(ExecResult {
        stdout: decode(response.stdout_b64)?.unwrap_or_default(),
        stderr: decode(response.stderr_b64)?.unwrap_or_default(),
        exit_code: response.exit.unwrap_or(-1),
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// Client side: interactive exec through a sandbox's relay socket.
pub async fn exec_interactive_via_relay<I, O>(
    socket_path: &Path,
    cmd: &str,
    options: &ExecOptions,
    rows: u16,
    cols: u16,
    mut stdin: I,
    mut stdout: O,
    mut resize: mpsc::Receiver<(u16, u16)>,
) -> std::io::Result<i32>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let stream = UnixStream::connect(socket_path).await?;
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    protocol::write_json(
        &mut write_half,
        &RelayRequest::ExecInteractive {
            cmd: cmd.to_string(),
            workdir: options.working_dir.clone(),
            rows,
            cols,
        },
    )
    .await?;

    let mut stdin_buf = [0u8; 4096];
    let mut stdin_open = true;
    loop {
        tokio::select! {
            frame = protocol::read_frame(&mut read_half) => {
                match frame? {
                    Some((FRAME_DATA, payload)) => {
                        stdout.write_all(&payload).await?;
                        stdout.flush().await?;
                    }
                    Some((FRAME_EXIT, payload)) => {
                        let exit: PtyExit = serde_json::from_slice(&payload)
                            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                        return Ok(exit.exit);
                    }
                    Some(_) | None => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "relay session ended without exit",
                        ));
                    }
                }
            }
            read = stdin.read(&mut stdin_buf), if stdin_open => {
                match read {
                    Ok(0) => {
                        stdin_open = false;
                        protocol::write_frame(&mut write_half, FRAME_DATA, &[]).await?;
                    }
                    Ok(n) => {
                        protocol::write_frame(&mut write_half, FRAME_DATA, &stdin_buf[..n]).await?;
                    }
                    Err(_) => stdin_open = false,
                }
            }
            geometry = resize.recv() => {
                if let Some((rows, cols)) = geometry {
                    let payload = serde_json::to_vec(&protocol::PtyResize { rows, cols })
                        .expect("resize payload serializes");
                    protocol::write_frame(&mut write_half, FRAME_RESIZE, &payload).await?;
                }
            }
        }
    }
}
