//! Downstream stdio transport.
//!
//! Newline-delimited JSON-RPC on stdin/stdout. Progress notifications are
//! written inline between responses; session and SSE semantics do not
//! apply.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::hub::Hub;
use crate::protocol::RpcBody;
use crate::router::{RequestContext, parse_error_response};

/// Serve the hub over stdio until stdin closes.
pub async fn run_stdio(hub: Arc<Hub>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    // One writer task keeps responses and relayed notifications ordered.
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = out_rx.recv().await {
            let Ok(mut bytes) = serde_json::to_vec(&frame) else { continue };
            bytes.push(b'\n');
            if stdout.write_all(&bytes).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    tracing::info!("hub ready on stdio");

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            tracing::info!("stdin closed, shutting down");
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let body: RpcBody = match serde_json::from_str(trimmed) {
            Ok(body) => body,
            Err(e) => {
                let _ = out_tx.send(serde_json::to_value(&parse_error_response(&e))?);
                continue;
            }
        };

        let ctx = RequestContext {
            session: None,
            response_stream: Some(out_tx.clone()),
            cancel: CancellationToken::new(),
        };
        for response in hub.handle_body(body, &ctx).await {
            let _ = out_tx.send(serde_json::to_value(&response)?);
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}
