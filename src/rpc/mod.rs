//! JSON-RPC 2.0 mode (`matchlock rpc`).
//!
//! Newline-delimited JSON-RPC over stdin/stdout for programmatic access.
//! Methods: `create`, `start`, `exec`, `exec_stream`, `write_file`,
//! `read_file`, `close`. `exec_stream` interleaves chunk notifications
//! (no id) before the final response; clients skip notifications when
//! matching replies.
//!
//! Error codes: the `-32700..-32603` standards, plus `-32000` VM failed,
//! `-32001` exec failed, `-32002` file failed.

use crate::api::{Config, ExecOptions};
use crate::sandbox::{Sandbox, SandboxError};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

pub const ERR_PARSE: i64 = -32700;
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;
pub const ERR_VM_FAILED: i64 = -32000;
pub const ERR_EXEC_FAILED: i64 = -32001;
pub const ERR_FILE_FAILED: i64 = -32002;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

impl Response {
    fn result(id: Option<u64>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn error(id: Option<u64>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

fn error_code(err: &SandboxError) -> i64 {
    match err {
        SandboxError::Config(_) => ERR_INVALID_PARAMS,
        SandboxError::Boot { .. } | SandboxError::Crash(_) | SandboxError::Close(_) => {
            ERR_VM_FAILED
        }
        SandboxError::Exec(_) | SandboxError::WrongState(_) | SandboxError::NoPty => {
            ERR_EXEC_FAILED
        }
        SandboxError::File { .. } => ERR_FILE_FAILED,
        SandboxError::State(_) => ERR_INTERNAL,
    }
}

/// Builds a sandbox from an RPC `create` config (resolves the rootfs).
pub type SandboxFactory =
    Box<dyn Fn(Config) -> Result<Sandbox, SandboxError> + Send + Sync>;

/// Serve JSON-RPC until EOF on the input. Requests are processed in order;
/// `exec_stream` notifications are emitted inline.
pub async fn serve<R, W>(input: R, mut output: W, factory: SandboxFactory) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(input);
    let mut sandboxes: HashMap<String, Arc<Sandbox>> = HashMap::new();

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(e) => {
                write_response(
                    &mut output,
                    &Response::error(None, ERR_PARSE, format!("parse error: {e}")),
                )
                .await?;
                continue;
            }
        };

        if request.jsonrpc != "2.0" {
            write_response(
                &mut output,
                &Response::error(request.id, ERR_INVALID_REQUEST, "jsonrpc must be \"2.0\""),
            )
            .await?;
            continue;
        }

        let response =
            dispatch(&request, &mut sandboxes, &factory, &mut output).await?;
        write_response(&mut output, &response).await?;
    }

    // EOF: tear down anything the client left running.
    for (id, sandbox) in sandboxes {
        debug!(id = %id, "closing sandbox on RPC EOF");
        if let Err(e) = sandbox.close().await {
            warn!(id = %id, "close on EOF failed: {e}");
        }
    }
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(
    output: &mut W,
    response: &Response,
) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    output.write_all(&payload).await?;
    output.flush().await
}

fn param_str(params: &Value, key: &str) -> Result<String, Response> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Response::error(None, ERR_INVALID_PARAMS, format!("missing param {key:?}")))
}

fn lookup<'a>(
    sandboxes: &'a HashMap<String, Arc<Sandbox>>,
    id: &str,
) -> Result<&'a Arc<Sandbox>, Response> {
    sandboxes
        .get(id)
        .ok_or_else(|| Response::error(None, ERR_VM_FAILED, format!("unknown sandbox {id:?}")))
}

async fn dispatch<W: AsyncWrite + Unpin>(
    request: &Request,
    sandboxes: &mut HashMap<String, Arc<Sandbox>>,
    factory: &SandboxFactory,
    output: &mut W,
) -> std::io::Result<Response> {
    let id = request.id;
    let params = &request.params;

    let with_id = |mut response: Response| {
        response.id = id;
        response
    };

    let response = match request.method.as_str() {
        "create" => {
            let config: Config = match serde_json::from_value(params.get("config").cloned().unwrap_or_default()) {
                Ok(config) => config,
                Err(e) => {
                    return Ok(Response::error(
                        id,
                        ERR_INVALID_PARAMS,
                        format!("bad config: {e}"),
                    ))
                }
            };
            match factory(config) {
                Ok(sandbox) => {
                    let vm_id = sandbox.id().to_string();
                    sandboxes.insert(vm_id.clone(), Arc::new(sandbox));
                    Response::result(id, json!({ "id": vm_id }))
                }
                Err(e) => Response::error(id, error_code(&e), e.to_string()),
            }
        }
        "start" => match param_str(params, "id") {
            Err(response) => with_id(response),
            Ok(vm_id) => match lookup(sandboxes, &vm_id) {
                Err(response) => with_id(response),
                Ok(sandbox) => match sandbox.start().await {
                    Ok(()) => Response::result(id, json!({ "ok": true })),
                    Err(e) => Response::error(id, error_code(&e), e.to_string()),
                },
            },
        },
        "exec" => match exec_params(params) {
            Err(response) => with_id(response),
            Ok((vm_id, cmd, options)) => match lookup(sandboxes, &vm_id) {
                Err(response) => with_id(response),
                Ok(sandbox) => match sandbox.exec(&cmd, &options).await {
                    Ok(result) => Response::result(
                        id,
                        json!({
                            "exit_code": result.exit_code,
                            "stdout_b64": B64.encode(&result.stdout),
                            "stderr_b64": B64.encode(&result.stderr),
                            "duration_ms": result.duration_ms,
                        }),
                    ),
                    Err(e) => Response::error(id, error_code(&e), e.to_string()),
                },
            },
        },
        "exec_stream" => match exec_params(params) {
            Err(response) => with_id(response),
            Ok((vm_id, cmd, options)) => match lookup(sandboxes, &vm_id) {
                Err(response) => with_id(response),
                Ok(sandbox) => {
                    exec_stream(sandbox.clone(), &vm_id, id, &cmd, options, output).await?
                }
            },
        },
        "write_file" => {
            let parsed = param_str(params, "id").and_then(|vm_id| {
                let path = param_str(params, "path")?;
                let data = param_str(params, "data_b64")?;
                Ok((vm_id, path, data))
            });
            match parsed {
                Err(response) => with_id(response),
                Ok((vm_id, path, data_b64)) => match lookup(sandboxes, &vm_id) {
                    Err(response) => with_id(response),
                    Ok(sandbox) => match B64.decode(&data_b64) {
                        Err(e) => {
                            Response::error(id, ERR_INVALID_PARAMS, format!("bad data_b64: {e}"))
                        }
                        Ok(bytes) => match sandbox.write_file(&path, bytes).await {
                            Ok(()) => Response::result(id, json!({ "ok": true })),
                            Err(e) => Response::error(id, error_code(&e), e.to_string()),
                        },
                    },
                },
            }
        }
        "read_file" => {
            let parsed =
                param_str(params, "id").and_then(|vm_id| Ok((vm_id, param_str(params, "path")?)));
            match parsed {
                Err(response) => with_id(response),
                Ok((vm_id, path)) => match lookup(sandboxes, &vm_id) {
                    Err(response) => with_id(response),
                    Ok(sandbox) => match sandbox.read_file(&path).await {
                        Ok(bytes) => {
                            Response::result(id, json!({ "data_b64": B64.encode(&bytes) }))
                        }
                        Err(e) => Response::error(id, error_code(&e), e.to_string()),
                    },
                },
            }
        }
        "close" => match param_str(params, "id") {
            Err(response) => with_id(response),
            Ok(vm_id) => match sandboxes.remove(&vm_id) {
                None => Response::error(id, ERR_VM_FAILED, format!("unknown sandbox {vm_id:?}")),
                Some(sandbox) => match sandbox.close().await {
                    Ok(()) => Response::result(id, json!({ "ok": true })),
                    Err(e) => Response::error(id, error_code(&e), e.to_string()),
                },
            },
        },
        other => Response::error(
            id,
            ERR_METHOD_NOT_FOUND,
            format!("unknown method {other:?}"),
        ),
    };

    Ok(response)
}

fn exec_params(params: &Value) -> Result<(String, String, ExecOptions), Response> {
    let vm_id = param_str(params, "id")?;
    let cmd = param_str(params, "cmd")?;
    let mut options = ExecOptions::default();
    if let Some(workdir) = params.get("workdir").and_then(Value::as_str) {
        options.working_dir = Some(workdir.to_string());
    }
    Ok((vm_id, cmd, options))
}

/// Run one streaming exec, emitting chunk notifications before the reply.
async fn exec_stream<W: AsyncWrite + Unpin>(
    sandbox: Arc<Sandbox>,
    vm_id: &str,
    id: Option<u64>,
    cmd: &str,
    options: ExecOptions,
    output: &mut W,
) -> std::io::Result<Response> {
    let (mut out_read, mut out_write) = tokio::io::duplex(64 * 1024);
    let (mut err_read, mut err_write) = tokio::io::duplex(64 * 1024);

    let exec = {
        let sandbox = sandbox.clone();
        let cmd = cmd.to_string();
        tokio::spawn(async move {
            let result = sandbox
                .exec_stream(&cmd, &options, &mut out_write, &mut err_write)
                .await;
            drop(out_write);
            drop(err_write);
            result
        })
    };

    let mut out_done = false;
    let mut err_done = false;
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    while !(out_done && err_done) {
        tokio::select! {
            n = out_read.read(&mut out_buf), if !out_done => {
                match n? {
                    0 => out_done = true,
                    n => notify_chunk(output, vm_id, 1, &out_buf[..n]).await?,
                }
            }
            n = err_read.read(&mut err_buf), if !err_done => {
                match n? {
                    0 => err_done = true,
                    n => notify_chunk(output, vm_id, 2, &err_buf[..n]).await?,
                }
            }
        }
    }

    let result = exec
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(match result {
        Ok(result) => Response::result(
            id,
            json!({ "exit_code": result.exit_code, "duration_ms": result.duration_ms }),
        ),
        Err(e) => Response::error(id, error_code(&e), e.to_string()),
    })
}

async fn notify_chunk<W: AsyncWrite + Unpin>(
    output: &mut W,
    vm_id: &str,
    ch: u8,
    bytes: &[u8],
) -> std::io::Result<()> {
    let notification = json!({
        "jsonrpc": "2.0",
        "method": "exec_stream.chunk",
        "params": { "id": vm_id, "ch": ch, "bytes_b64": B64.encode(bytes) },
    });
    let mut payload = serde_json::to_vec(&notification)?;
    payload.push(b'\n');
    output.write_all(&payload).await?;
    output.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Options;
    use crate::state;

    fn factory_for(dir: std::path::PathBuf) -> SandboxFactory {
        Box::new(move |config: Config| {
            Sandbox::new(
                config,
                Options {
                    rootfs_path: dir.join("rootfs.ext4"),
                    kernel_path: dir.join("vmlinux"),
                    remove_on_close: false,
                    state: Some(state::Manager::with_root(dir.join("state"))),
                },
            )
        })
    }

    async fn roundtrip(requests: &str) -> Vec<Value> {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory_for(dir.path().to_path_buf());

        let mut output = Vec::new();
        serve(requests.as_bytes(), &mut output, factory)
            .await
            .unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_parse_error() {
        let responses = roundtrip("this is not json\n").await;
        assert_eq!(responses[0]["error"]["code"], ERR_PARSE);
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let responses =
            roundtrip("{\"jsonrpc\":\"2.0\",\"method\":\"nope\",\"id\":1}\n").await;
        assert_eq!(responses[0]["error"]["code"], ERR_METHOD_NOT_FOUND);
        assert_eq!(responses[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_invalid_version() {
        let responses = roundtrip("{\"jsonrpc\":\"1.0\",\"method\":\"create\",\"id\":2}\n").await;
        assert_eq!(responses[0]["error"]["code"], ERR_INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_create_write_read_close() {
        let create = r#"{"jsonrpc":"2.0","method":"create","params":{"config":{"image":"alpine:latest"}},"id":1}"#;
        let data = B64.encode(b"hello rpc");

        let dir = tempfile::tempdir().unwrap();
        let factory = factory_for(dir.path().to_path_buf());

        let (client, server_in) = tokio::io::duplex(64 * 1024);
        let (client_read, mut client_write) = tokio::io::split(client);
        let server = tokio::spawn(async move {
            let mut out = Vec::new();
            serve(server_in, &mut out, factory).await.unwrap();
        });
        let mut reader = BufReader::new(client_read);
        let mut line = String::new();

        client_write
            .write_all(format!("{create}\n").as_bytes())
            .await
            .unwrap();
        reader.read_line(&mut line).await.unwrap();
        let created: Value = serde_json::from_str(&line).unwrap();
        let vm_id = created["result"]["id"].as_str().unwrap().to_string();
        assert!(vm_id.starts_with("vm-"));

        let write_req = format!(
            "{{\"jsonrpc\":\"2.0\",\"method\":\"write_file\",\"params\":{{\"id\":\"{vm_id}\",\"path\":\"/workspace/f\",\"data_b64\":\"{data}\"}},\"id\":2}}\n"
        );
        client_write.write_all(write_req.as_bytes()).await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let wrote: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(wrote["result"]["ok"], true);

        let read_req = format!(
            "{{\"jsonrpc\":\"2.0\",\"method\":\"read_file\",\"params\":{{\"id\":\"{vm_id}\",\"path\":\"/workspace/f\"}},\"id\":3}}\n"
        );
        client_write.write_all(read_req.as_bytes()).await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let read: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(read["result"]["data_b64"].as_str().unwrap(), data);

        let close_req = format!(
            "{{\"jsonrpc\":\"2.0\",\"method\":\"close\",\"params\":{{\"id\":\"{vm_id}\"}},\"id\":4}}\n"
        );
        client_write.write_all(close_req.as_bytes()).await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let closed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(closed["result"]["ok"], true);

        drop(client_write);
        drop(reader);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_on_unstarted_sandbox_fails_with_exec_code() {
        let create = r#"{"jsonrpc":"2.0","method":"create","params":{"config":{"image":"alpine:latest"}},"id":1}"#;
        let dir = tempfile::tempdir().unwrap();
        let factory = factory_for(dir.path().to_path_buf());

        let (client, server_in) = tokio::io::duplex(64 * 1024);
        let (client_read, mut client_write) = tokio::io::split(client);
        let server = tokio::spawn(async move {
            let mut out = Vec::new();
            serve(server_in, &mut out, factory).await.unwrap();
            out
        });

        client_write
            .write_all(format!("{create}\n").as_bytes())
            .await
            .unwrap();
        let mut reader = BufReader::new(client_read);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let created: Value = serde_json::from_str(&line).unwrap();
        let vm_id = created["result"]["id"].as_str().unwrap();

        let exec = format!(
            "{{\"jsonrpc\":\"2.0\",\"method\":\"exec\",\"params\":{{\"id\":\"{vm_id}\",\"cmd\":\"echo hi\"}},\"id\":2}}\n"
        );
        client_write.write_all(exec.as_bytes()).await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["error"]["code"], ERR_EXEC_FAILED);

        drop(client_write);
        drop(reader);
        server.await.unwrap();
    }
}
