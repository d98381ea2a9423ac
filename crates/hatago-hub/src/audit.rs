//! Optional append-only audit log.
//!
//! JSONL records with size-triggered rotation. Writes go through an
//! unbounded channel to a single writer task: audit failures are logged and
//! never fail the request that produced them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::config::defaults;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    ConfigRead,
    ConfigWrite,
    ServerAdded,
    ServerRemoved,
    ServerModified,
    ServerActivated,
    ServerDeactivated,
    UnauthorizedAccess,
    Error,
    ToolCalled,
}

impl AuditEventKind {
    /// Severity derived from the kind unless the caller overrides it.
    #[must_use]
    pub fn severity(self) -> &'static str {
        match self {
            Self::UnauthorizedAccess | Self::Error => "error",
            Self::ServerRemoved | Self::ServerModified => "warn",
            _ => "info",
        }
    }
}

#[derive(Debug, Serialize)]
struct AuditRecord {
    timestamp: String,
    kind: AuditEventKind,
    severity: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    details: Value,
}

/// Handle for emitting audit events. Cloning shares the writer task.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditRecord>,
    redact_keys: std::sync::Arc<HashSet<String>>,
}

impl AuditLog {
    /// Derived audit path for a config file.
    #[must_use]
    pub fn path_for(config_path: &Path) -> PathBuf {
        let mut name = config_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_string());
        name.push_str(".audit.log");
        config_path.with_file_name(name)
    }

    /// Open the log and start the writer task.
    #[must_use]
    pub fn open(path: PathBuf, redact_keys: &[String]) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path, rx));
        Self {
            tx,
            redact_keys: std::sync::Arc::new(
                redact_keys.iter().map(|k| k.to_lowercase()).collect(),
            ),
        }
    }

    /// Record one event. Fire and forget.
    pub fn record(&self, kind: AuditEventKind, details: Value) {
        let mut details = details;
        redact(&mut details, &self.redact_keys);
        let record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            kind,
            severity: kind.severity(),
            details,
        };
        let _ = self.tx.send(record);
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish()
    }
}

/// Mask values of configured keys anywhere in the payload.
fn redact(value: &mut Value, keys: &HashSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if keys.contains(&key.to_lowercase()) {
                    *entry = Value::String("[redacted]".to_string());
                } else {
                    redact(entry, keys);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact(item, keys);
            }
        }
        _ => {}
    }
}

async fn writer_task(path: PathBuf, mut rx: mpsc::UnboundedReceiver<AuditRecord>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = append(&path, &record).await {
            tracing::warn!(path = %path.display(), error = %e, "audit write failed");
        }
    }
}

async fn append(path: &Path, record: &AuditRecord) -> std::io::Result<()> {
    rotate_if_needed(path).await?;

    let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    Ok(())
}

/// Size-triggered rotation: `.log` shifts to `.log.1`, `.1` to `.2`, and so
/// on; the oldest generation falls off.
async fn rotate_if_needed(path: &Path) -> std::io::Result<()> {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if size < defaults::AUDIT_MAX_BYTES {
        return Ok(());
    }

    for generation in (1..defaults::AUDIT_GENERATIONS).rev() {
        let from = generation_path(path, generation);
        let to = generation_path(path, generation + 1);
        if tokio::fs::metadata(&from).await.is_ok() {
            tokio::fs::rename(&from, &to).await?;
        }
    }
    tokio::fs::rename(path, generation_path(path, 1)).await?;
    tracing::info!(path = %path.display(), "rotated audit log");
    Ok(())
}

fn generation_path(path: &Path, generation: u32) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(&format!(".{generation}"));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_derives_from_kind() {
        assert_eq!(AuditEventKind::ToolCalled.severity(), "info");
        assert_eq!(AuditEventKind::ServerRemoved.severity(), "warn");
        assert_eq!(AuditEventKind::UnauthorizedAccess.severity(), "error");
    }

    #[test]
    fn redaction_is_recursive_and_case_insensitive() {
        let keys: HashSet<String> = ["authorization".to_string()].into_iter().collect();
        let mut value = serde_json::json!({
            "Authorization": "Bearer abc",
            "nested": [{"authorization": "xyz", "other": 1}]
        });
        redact(&mut value, &keys);
        assert_eq!(value["Authorization"], "[redacted]");
        assert_eq!(value["nested"][0]["authorization"], "[redacted]");
        assert_eq!(value["nested"][0]["other"], 1);
    }

    #[tokio::test]
    async fn records_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.audit.log");

        let log = AuditLog::open(path.clone(), &["token".to_string()]);
        log.record(
            AuditEventKind::ToolCalled,
            serde_json::json!({"tool": "echo_say", "token": "secret"}),
        );
        log.record(AuditEventKind::ConfigRead, Value::Null);

        // The writer task is asynchronous; poll briefly for both lines.
        let mut content = String::new();
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if content.lines().count() == 2 {
                break;
            }
        }

        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "TOOL_CALLED");
        assert_eq!(first["severity"], "info");
        assert_eq!(first["details"]["token"], "[redacted]");
    }

    #[tokio::test]
    async fn rotation_shifts_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.audit.log");

        // Oversized current log plus an existing first generation.
        let big = vec![b'x'; usize::try_from(defaults::AUDIT_MAX_BYTES).unwrap() + 1];
        tokio::fs::write(&path, &big).await.unwrap();
        tokio::fs::write(generation_path(&path, 1), b"old-1").await.unwrap();

        let record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            kind: AuditEventKind::Error,
            severity: "error",
            details: Value::Null,
        };
        append(&path, &record).await.unwrap();

        let shifted = tokio::fs::read_to_string(generation_path(&path, 2)).await.unwrap();
        assert_eq!(shifted, "old-1");
        let rotated = tokio::fs::metadata(generation_path(&path, 1)).await.unwrap();
        assert_eq!(rotated.len(), big.len() as u64);
        let fresh = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(fresh.lines().count(), 1);
    }
}
