//! Child-process stdio transport.
//!
//! Frames are newline-delimited JSON over the child's stdin/stdout. Stderr
//! is drained to the log so a noisy upstream can't block on a full pipe.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use super::{Connection, Transport, TransportError, new_inbox};
use crate::config::UpstreamSpec;

pub struct StdioTransport {
    upstream_id: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    connected: AtomicBool,
}

/// Spawn the configured command and wire its pipes.
///
/// # Errors
///
/// Returns [`TransportError::Spawn`] when the process cannot start or its
/// pipes are unavailable.
pub async fn connect(spec: &UpstreamSpec) -> Result<Connection, TransportError> {
    let command_name = spec
        .command
        .clone()
        .ok_or_else(|| TransportError::Handshake("stdio transport needs a command".into()))?;

    let mut command = Command::new(&command_name);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !spec.env.is_empty() {
        command.envs(&spec.env);
    }
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(|source| TransportError::Spawn {
        command: command_name.clone(),
        source,
    })?;

    let stdin = child.stdin.take().ok_or_else(|| TransportError::Spawn {
        command: command_name.clone(),
        source: std::io::Error::other("stdin not piped"),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| TransportError::Spawn {
        command: command_name.clone(),
        source: std::io::Error::other("stdout not piped"),
    })?;
    let stderr = child.stderr.take();

    if let Some(pid) = child.id() {
        tracing::info!(upstream = %spec.id, pid, command = %command_name, "spawned local MCP server");
    }

    let transport = Arc::new(StdioTransport {
        upstream_id: spec.id.clone(),
        stdin: Mutex::new(stdin),
        child: Mutex::new(Some(child)),
        connected: AtomicBool::new(true),
    });

    let (tx, incoming) = new_inbox();

    // Reader task owns the only inbox sender: when the child's stdout ends,
    // dropping it signals close to the session.
    let reader_transport = transport.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(frame) => {
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                upstream = %reader_transport.upstream_id,
                                error = %e,
                                "dropping unparseable frame from child stdout"
                            );
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!(upstream = %reader_transport.upstream_id, "child stdout closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(upstream = %reader_transport.upstream_id, error = %e, "child stdout read failed");
                    break;
                }
            }
        }
        reader_transport.connected.store(false, Ordering::SeqCst);
    });

    if let Some(stderr) = stderr {
        let upstream_id = spec.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "hatago_hub::upstream_stderr", upstream = %upstream_id, "{line}");
            }
        });
    }

    Ok(Connection { transport, incoming })
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: Value) -> Result<(), TransportError> {
        if !self.connected() {
            return Err(TransportError::Closed);
        }
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        if let Err(e) = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        }
        .await
        {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(upstream = %self.upstream_id, error = %e, "kill on close");
            }
            let _ = child.wait().await;
            tracing::info!(upstream = %self.upstream_id, "local MCP server stopped");
        }
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(command: &str, args: &[&str]) -> UpstreamSpec {
        UpstreamSpec {
            id: "child".to_string(),
            command: Some(command.to_string()),
            args: args.iter().map(ToString::to_string).collect(),
            ..UpstreamSpec::default()
        }
    }

    #[tokio::test]
    async fn round_trips_one_frame() {
        // cat echoes stdin lines straight back.
        let mut conn = connect(&spec_for("cat", &[])).await.unwrap();
        conn.transport
            .send(serde_json::json!({"jsonrpc":"2.0","method":"ping","id":1}))
            .await
            .unwrap();

        let frame = conn.incoming.recv().await.unwrap();
        assert_eq!(frame["method"], "ping");
        conn.transport.close().await;
    }

    #[tokio::test]
    async fn inbox_ends_when_child_exits() {
        let mut conn = connect(&spec_for("true", &[])).await.unwrap();
        assert!(conn.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = connect(&spec_for("definitely-not-a-real-binary-hatago", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let conn = connect(&spec_for("cat", &[])).await.unwrap();
        conn.transport.close().await;
        let err = conn
            .transport
            .send(serde_json::json!({"jsonrpc":"2.0","method":"ping"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
