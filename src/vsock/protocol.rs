//! Control-plane wire protocol between host and guest agent.
//!
//! Two framings share the vsock byte streams:
//!
//! - **Control**: newline-delimited JSON. One request line, then either one
//!   response line (`ready`, `run`, `resize_pty`, `shutdown`) or a response
//!   stream (`run_stream` emits `{"ch":N,"bytes_b64":...}` events and ends
//!   with `{"exit":N}`).
//! - **PTY**: after the `run_pty` request line is acknowledged, the stream
//!   switches to length-prefixed binary frames: a 4-byte big-endian length,
//!   one tag byte, then the payload. Tag 0 carries terminal bytes in either
//!   direction, tag 1 carries a resize (JSON payload), tag 2 carries the
//!   final exit (JSON payload).
//!
//! On one stream, responses are strictly ordered with requests; concurrent
//! operations use distinct streams. Closing a stream mid-operation tells
//! the guest to SIGKILL the spawned process group; the guest acks with
//! `{"exit":N,"killed":true}` before closing its side.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Well-known guest port for control streams (host-initiated).
pub const CONTROL_PORT: u32 = 1024;
/// Well-known guest port for the VFS stream (guest-initiated).
pub const VFS_PORT: u32 = 1025;

/// PTY frame tags.
pub const FRAME_DATA: u8 = 0;
pub const FRAME_RESIZE: u8 = 1;
pub const FRAME_EXIT: u8 = 2;

/// Largest accepted frame payload (1 MiB); anything bigger is a protocol error.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Host-to-guest control requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Ready,
    Run {
        cmd: String,
        env: HashMap<String, String>,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stdin_b64: Option<String>,
    },
    RunStream {
        cmd: String,
        env: HashMap<String, String>,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stdin_b64: Option<String>,
    },
    RunPty {
        cmd: String,
        env: HashMap<String, String>,
        cwd: String,
        rows: u16,
        cols: u16,
    },
    ResizePty {
        rows: u16,
        cols: u16,
    },
    Shutdown,
}

/// Simple acknowledgement (`ready`, `resize_pty`, `shutdown`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Buffered `run` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub exit: i32,
    #[serde(default)]
    pub stdout_b64: String,
    #[serde(default)]
    pub stderr_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killed: Option<bool>,
}

/// `run_stream` events: interleaved output chunks, then the exit marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Data {
        /// 1 = stdout, 2 = stderr.
        ch: u8,
        bytes_b64: String,
    },
    Exit {
        exit: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        killed: Option<bool>,
    },
}

/// Resize payload carried in a tag-1 PTY frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyResize {
    pub rows: u16,
    pub cols: u16,
}

/// Exit payload carried in a tag-2 PTY frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyExit {
    pub exit: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killed: Option<bool>,
}

/// Write one JSON line.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Read one JSON line; `Ok(None)` on clean EOF.
pub async fn read_json<R, T>(reader: &mut BufReader<R>) -> std::io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut line = String::new();
    let n = tokio::io::AsyncBufReadExt::read_line(reader, &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Write one binary frame: 4-byte big-endian length, tag, payload.
pub async fn write_frame<W>(writer: &mut W, tag: u8, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() as u32 + 1;
    writer.write_u32(len).await?;
    writer.write_u8(tag).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one binary frame; `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} out of range"),
        ));
    }
    let tag = reader.read_u8().await?;
    let mut payload = vec![0u8; len as usize - 1];
    reader.read_exact(&mut payload).await?;
    Ok(Some((tag, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = ControlRequest::Run {
            cmd: "echo hello".to_string(),
            env: HashMap::new(),
            cwd: "/workspace".to_string(),
            stdin_b64: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""op":"run""#));
        assert!(!json.contains("stdin_b64"));

        let parsed: ControlRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ControlRequest::Run { .. }));
    }

    #[test]
    fn test_stream_event_untagged() {
        let data: StreamEvent =
            serde_json::from_str(r#"{"ch":1,"bytes_b64":"aGk="}"#).unwrap();
        assert!(matches!(data, StreamEvent::Data { ch: 1, .. }));

        let exit: StreamEvent = serde_json::from_str(r#"{"exit":0}"#).unwrap();
        assert!(matches!(exit, StreamEvent::Exit { exit: 0, killed: None }));

        let killed: StreamEvent = serde_json::from_str(r#"{"exit":137,"killed":true}"#).unwrap();
        assert!(matches!(
            killed,
            StreamEvent::Exit {
                exit: 137,
                killed: Some(true)
            }
        ));
    }

    #[tokio::test]
    async fn test_json_line_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut client_write) = tokio::io::split(client);
        let (server_read, _) = tokio::io::split(server);

        write_json(&mut client_write, &ControlRequest::Ready)
            .await
            .unwrap();
        drop(client_write);

        let mut reader = BufReader::new(server_read);
        let req: ControlRequest = read_json(&mut reader).await.unwrap().unwrap();
        assert!(matches!(req, ControlRequest::Ready));

        let eof: Option<ControlRequest> = read_json(&mut reader).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut client_write) = tokio::io::split(client);
        let (mut server_read, _) = tokio::io::split(server);

        write_frame(&mut client_write, FRAME_DATA, b"terminal bytes")
            .await
            .unwrap();
        write_frame(&mut client_write, FRAME_EXIT, br#"{"exit":0}"#)
            .await
            .unwrap();
        drop(client_write);

        let (tag, payload) = read_frame(&mut server_read).await.unwrap().unwrap();
        assert_eq!(tag, FRAME_DATA);
        assert_eq!(payload, b"terminal bytes");

        let (tag, payload) = read_frame(&mut server_read).await.unwrap().unwrap();
        assert_eq!(tag, FRAME_EXIT);
        let exit: PtyExit = serde_json::from_slice(&payload).unwrap();
        assert_eq!(exit.exit, 0);

        assert!(read_frame(&mut server_read).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_length_bound() {
        let (client, server) = tokio::io::duplex(64);
        let (_, mut client_write) = tokio::io::split(client);
        let (mut server_read, _) = tokio::io::split(server);

        tokio::spawn(async move {
            let _ = client_write.write_u32(MAX_FRAME_LEN + 1).await;
        });

        let err = read_frame(&mut server_read).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
