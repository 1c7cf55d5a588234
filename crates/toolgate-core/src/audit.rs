//! Structured audit trail: one event per invocation.
//!
//! Events go to stderr with a `[audit] ` prefix so they survive whatever the
//! tracing subscriber is doing, and optionally to an append-only file (bare
//! JSON lines). File write failures are reported and swallowed; audit sink
//! trouble must never fail the invocation it describes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::error::ErrorCode;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_file: None,
        }
    }
}

/// Gate decision axis. Execution-phase failures still record `allow` and
/// distinguish themselves via `error_code`: a deny means the gateway refused
/// the request before the handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub request_id: Uuid,
    pub tool: String,
    pub actor: String,
    pub args_sha256: String,
    pub decision: Decision,
    pub reason: String,
    pub duration_ms: u64,
    pub result_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

/// Captured at the start of an invocation; consumed by exactly one `log` call.
pub struct AuditContext {
    pub request_id: Uuid,
    pub tool: String,
    pub args_sha256: String,
    started: Instant,
}

/// SHA-256 over the RFC 8785 canonical JSON encoding of the arguments:
/// object keys sorted, shortest number forms. Two invocations with the same
/// arguments hash identically regardless of key order or wall-clock.
pub fn args_sha256(args: &Map<String, Value>) -> String {
    let canonical = serde_jcs::to_vec(&Value::Object(args.clone())).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}

pub struct AuditLogger {
    actor: String,
    enabled: bool,
    file: Option<Mutex<File>>,
}

impl AuditLogger {
    pub fn new(config: &AuditConfig, actor: &str) -> Self {
        let file = if config.enabled {
            config.log_file.as_ref().and_then(|path| {
                if let Some(parent) = path.parent()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    warn!(path = %path.display(), error = %e, "cannot create audit log directory");
                    return None;
                }
                match OpenOptions::new().create(true).append(true).open(path) {
                    Ok(f) => Some(Mutex::new(f)),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cannot open audit log file");
                        None
                    }
                }
            })
        } else {
            None
        };
        Self {
            actor: actor.to_string(),
            enabled: config.enabled,
            file,
        }
    }

    pub fn disabled(actor: &str) -> Self {
        Self::new(
            &AuditConfig {
                enabled: false,
                log_file: None,
            },
            actor,
        )
    }

    /// Always produces a request id, even when the logger is disabled:
    /// callers correlate responses with it.
    pub fn create_context(&self, tool: &str, args: &Map<String, Value>) -> AuditContext {
        AuditContext {
            request_id: Uuid::new_v4(),
            tool: tool.to_string(),
            args_sha256: args_sha256(args),
            started: Instant::now(),
        }
    }

    pub fn log(
        &self,
        ctx: AuditContext,
        decision: Decision,
        reason: &str,
        result: Option<&Value>,
        error_code: Option<ErrorCode>,
    ) {
        if !self.enabled {
            return;
        }

        let result_bytes = result
            .and_then(|v| serde_json::to_vec(v).ok())
            .map(|b| b.len() as u64)
            .unwrap_or(0);
        let event = AuditEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id: ctx.request_id,
            tool: ctx.tool,
            actor: self.actor.clone(),
            args_sha256: ctx.args_sha256,
            decision,
            reason: reason.to_string(),
            duration_ms: u64::try_from(ctx.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            result_bytes,
            error_code,
        };

        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        let _ = writeln!(std::io::stderr(), "[audit] {line}");
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
            && let Err(e) = writeln!(file, "{line}")
        {
            warn!(error = %e, "audit log append failed");
        }
    }

    pub fn log_success(&self, ctx: AuditContext, result: &Value) {
        self.log(ctx, Decision::Allow, "execution_success", Some(result), None);
    }

    pub fn log_denied(&self, ctx: AuditContext, reason: &str) {
        self.log(ctx, Decision::Deny, reason, None, None);
    }

    pub fn log_error(&self, ctx: AuditContext, code: ErrorCode, message: &str) {
        self.log(
            ctx,
            Decision::Allow,
            &format!("error: {message}"),
            None,
            Some(code),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().expect("object").clone()
    }

    #[test]
    fn hash_is_deterministic_and_key_order_independent() {
        let a = args(json!({"b": 2, "a": null, "nested": {"y": 1.0, "x": "s"}}));
        let b = args(json!({"nested": {"x": "s", "y": 1.0}, "a": null, "b": 2}));
        assert_eq!(args_sha256(&a), args_sha256(&b));
        assert_eq!(args_sha256(&a).len(), 64);
    }

    #[test]
    fn hash_distinguishes_different_args() {
        let a = args(json!({"path": "/tmp/a"}));
        let b = args(json!({"path": "/tmp/b"}));
        assert_ne!(args_sha256(&a), args_sha256(&b));
    }

    #[test]
    fn disabled_logger_still_issues_request_ids() {
        let logger = AuditLogger::disabled("tester");
        let a = logger.create_context("fs.readFile", &args(json!({})));
        let b = logger.create_context("fs.readFile", &args(json!({})));
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn file_sink_appends_one_json_line_per_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("audit.jsonl");
        let logger = AuditLogger::new(
            &AuditConfig {
                enabled: true,
                log_file: Some(path.clone()),
            },
            "tester",
        );

        let ctx = logger.create_context("fs.readFile", &args(json!({"path": "/tmp/x"})));
        let expected_hash = ctx.args_sha256.clone();
        logger.log_success(ctx, &json!({"content": "hi"}));

        let ctx = logger.create_context("fs.readFile", &args(json!({})));
        logger.log_denied(ctx, "default_deny");

        let contents = std::fs::read_to_string(&path).expect("read audit log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(first["decision"], json!("allow"));
        assert_eq!(first["reason"], json!("execution_success"));
        assert_eq!(first["args_sha256"], json!(expected_hash));
        assert_eq!(first["actor"], json!("tester"));
        assert!(first["result_bytes"].as_u64().expect("bytes") > 0);
        assert!(first.get("error_code").is_none());

        let second: Value = serde_json::from_str(lines[1]).expect("json line");
        assert_eq!(second["decision"], json!("deny"));
        assert_eq!(second["reason"], json!("default_deny"));
        assert_eq!(second["result_bytes"], json!(0));
    }

    #[test]
    fn error_events_record_allow_plus_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::new(
            &AuditConfig {
                enabled: true,
                log_file: Some(path.clone()),
            },
            "tester",
        );

        let ctx = logger.create_context("web.fetch", &args(json!({})));
        logger.log_error(ctx, ErrorCode::Timeout, "timeout");

        let contents = std::fs::read_to_string(&path).expect("read audit log");
        let event: Value = serde_json::from_str(contents.lines().next().expect("line"))
            .expect("json line");
        assert_eq!(event["decision"], json!("allow"));
        assert_eq!(event["error_code"], json!("timeout"));
        assert_eq!(event["reason"], json!("error: timeout"));
    }

    #[test]
    fn timestamps_are_utc_millis() {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.split('.').count(), 2);
    }
}
