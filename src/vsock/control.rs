//! Host-side control client for the guest agent.
//!
//! Every operation opens its own vsock stream (ordering on one stream is
//! strict, concurrency comes from distinct streams) and follows the framing
//! in [`super::protocol`]. Cancellation is signalled by closing the stream;
//! the guest SIGKILLs the spawned process group and acks with
//! `{"exit":N,"killed":true}` before closing its side.

use super::protocol::{
    self, Ack, ControlRequest, PtyExit, PtyResize, RunResult, StreamEvent, CONTROL_PORT,
    FRAME_DATA, FRAME_EXIT, FRAME_RESIZE,
};
use super::{ControlDialer, VsockStream};
use crate::api::ExecResult;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How long to wait for the guest's kill acknowledgement after cancelling.
const KILL_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry cadence while waiting for the guest agent to come up.
const READY_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("guest agent connection failed: {0}")]
    Dial(#[source] std::io::Error),

    #[error("control channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("guest agent rejected request: {0}")]
    Rejected(String),

    #[error("operation cancelled (guest process killed)")]
    Cancelled,

    #[error("guest agent did not become ready within {0:?}")]
    ReadyTimeout(Duration),
}

/// Everything needed to run one command in the guest.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub cmd: String,
    pub env: HashMap<String, String>,
    pub cwd: String,
    pub stdin: Option<Vec<u8>>,
}

/// Control-plane client; cheap to clone, one vsock stream per operation.
#[derive(Clone)]
pub struct ControlClient {
    dialer: Arc<dyn ControlDialer>,
}

impl ControlClient {
    pub fn new(dialer: Arc<dyn ControlDialer>) -> Self {
        Self { dialer }
    }

    async fn dial(&self) -> Result<VsockStream, ControlError> {
        self.dialer
            .dial(CONTROL_PORT)
            .await
            .map_err(ControlError::Dial)
    }

    /// Block until the guest agent answers `ready`, or the deadline passes.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<(), ControlError> {
        let start = Instant::now();
        loop {
            if start.elapsed() > deadline {
                return Err(ControlError::ReadyTimeout(deadline));
            }
            match self.try_ready().await {
                Ok(()) => return Ok(()),
                Err(e) => trace!("guest not ready yet: {e}"),
            }
            tokio::time::sleep(READY_RETRY_INTERVAL).await;
        }
    }

    async fn try_ready(&self) -> Result<(), ControlError> {
        let stream = self.dial().await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        protocol::write_json(&mut write_half, &ControlRequest::Ready).await?;
        let ack: Ack = protocol::read_json(&mut reader)
            .await?
            .ok_or_else(|| ControlError::Protocol("EOF before ready ack".into()))?;
        if !ack.ok {
            return Err(ControlError::Rejected(
                ack.error.unwrap_or_else(|| "not ready".into()),
            ));
        }
        Ok(())
    }

    /// Buffered exec: returns collected stdout/stderr and the exit code.
    pub async fn run(
        &self,
        spec: ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, ControlError> {
        let started = Instant::now();
        let stream = self.dial().await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let request = ControlRequest::Run {
            cmd: spec.cmd,
            env: spec.env,
            cwd: spec.cwd,
            stdin_b64: spec.stdin.map(|bytes| B64.encode(bytes)),
        };
        protocol::write_json(&mut write_half, &request).await?;

        let response = tokio::select! {
            response = protocol::read_json(&mut reader) => Some(response),
            _ = cancel.cancelled() => None,
        };
        let Some(response) = response else {
            // Closing our write half tells the guest to SIGKILL the process
            // group; give it a moment to ack.
            let _ = write_half.shutdown().await;
            let ack = tokio::time::timeout(
                KILL_ACK_TIMEOUT,
                protocol::read_json::<_, RunResult>(&mut reader),
            )
            .await;
            if let Ok(Ok(Some(result))) = ack {
                debug!(killed = ?result.killed, "guest acknowledged cancellation");
            }
            return Err(ControlError::Cancelled);
        };
        let result: RunResult = response?
            .ok_or_else(|| ControlError::Protocol("EOF before run result".into()))?;

        Ok(ExecResult {
            stdout: B64
                .decode(&result.stdout_b64)
                .map_err(|e| ControlError::Protocol(format!("bad stdout encoding: {e}")))?,
            stderr: B64
                .decode(&result.stderr_b64)
                .map_err(|e| ControlError::Protocol(format!("bad stderr encoding: {e}")))?,
            exit_code: result.exit,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Streaming exec: output chunks are written to the caller's writers in
    /// arrival order. Writer backpressure pauses frame reads, which closes
    /// the window toward the guest.
    pub async fn run_stream<O, E>(
        &self,
        spec: ExecSpec,
        stdout: &mut O,
        stderr: &mut E,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, ControlError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let stream = self.dial().await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let request = ControlRequest::RunStream {
            cmd: spec.cmd,
            env: spec.env,
            cwd: spec.cwd,
            stdin_b64: spec.stdin.map(|bytes| B64.encode(bytes)),
        };
        protocol::write_json(&mut write_half, &request).await?;

        loop {
            let read = tokio::select! {
                event = protocol::read_json(&mut reader) => Some(event),
                _ = cancel.cancelled() => None,
            };
            let Some(read) = read else {
                let _ = write_half.shutdown().await;
                let _ = tokio::time::timeout(
                    KILL_ACK_TIMEOUT,
                    protocol::read_json::<_, StreamEvent>(&mut reader),
                )
                .await;
                return Err(ControlError::Cancelled);
            };
            let event: Option<StreamEvent> = read?;
            match event {
                Some(StreamEvent::Data { ch, bytes_b64 }) => {
                    let bytes = B64
                        .decode(&bytes_b64)
                        .map_err(|e| ControlError::Protocol(format!("bad chunk encoding: {e}")))?;
                    match ch {
                        1 => stdout.write_all(&bytes).await?,
                        2 => stderr.write_all(&bytes).await?,
                        other => {
                            return Err(ControlError::Protocol(format!(
                                "unknown stream channel {other}"
                            )))
                        }
                    }
                }
                Some(StreamEvent::Exit { exit, killed }) => {
                    if killed == Some(true) {
                        warn!("guest reports streamed process was killed");
                    }
                    return Ok(ExecResult {
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                        exit_code: exit,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                None => {
                    return Err(ControlError::Protocol(
                        "stream closed before exit event".into(),
                    ))
                }
            }
        }
    }

    /// Interactive exec with a guest-side PTY.
    ///
    /// Stdin bytes and resize events go down as binary frames; PTY output
    /// comes back strictly ordered. Returns the process exit code.
    pub async fn run_pty<I, O>(
        &self,
        spec: ExecSpec,
        rows: u16,
        cols: u16,
        mut stdin: I,
        mut stdout: O,
        mut resize: mpsc::Receiver<(u16, u16)>,
        cancel: &CancellationToken,
    ) -> Result<i32, ControlError>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let stream = self.dial().await?;
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let request = ControlRequest::RunPty {
            cmd: spec.cmd,
            env: spec.env,
            cwd: spec.cwd,
            rows,
            cols,
        };
        protocol::write_json(&mut write_half, &request).await?;

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
                                .map_err(|e| ControlError::Protocol(format!("bad exit frame: {e}")))?;
                            return Ok(exit.exit);
                        }
                        Some((tag, _)) => {
                            return Err(ControlError::Protocol(format!("unexpected frame tag {tag}")));
                        }
                        None => {
                            return Err(ControlError::Protocol("PTY stream closed without exit".into()));
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
                        Err(e) => {
                            debug!("stdin read failed: {e}");
                            stdin_open = false;
                        }
                    }
                }
                geometry = resize.recv() => {
                    if let Some((rows, cols)) = geometry {
                        let payload = serde_json::to_vec(&PtyResize { rows, cols })
                            .expect("resize payload serializes");
                        protocol::write_frame(&mut write_half, FRAME_RESIZE, &payload).await?;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        // Cancelled: close our write half (the kill signal) and give the
        // guest a moment to ack before tearing the stream down.
        let _ = write_half.shutdown().await;
        let _ =
            tokio::time::timeout(KILL_ACK_TIMEOUT, protocol::read_frame(&mut read_half)).await;
        Err(ControlError::Cancelled)
    }

    /// Graceful guest shutdown request.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        let stream = self.dial().await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        protocol::write_json(&mut write_half, &ControlRequest::Shutdown).await?;
        match protocol::read_json::<_, Ack>(&mut reader).await {
            Ok(Some(ack)) if ack.ok => Ok(()),
            Ok(_) => Ok(()),
            Err(e) => {
                // The guest may power off before flushing the ack.
                debug!("shutdown ack not received: {e}");
                Ok(())
            }
        }
    }
}
