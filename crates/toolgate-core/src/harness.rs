//! The invocation pipeline: lookup, validate, enforce policy, execute under
//! the envelope, check result size, audit.
//!
//! Exactly one audit event is emitted per `invoke` call. The `deny` decision
//! is reserved for requests the gateway refused before the handler ran;
//! failures during an accepted execution record `allow` plus an error code.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditLogger, Decision};
use crate::error::{ErrorCode, GatewayError};
use crate::policy::PolicyEngine;
use crate::registry::{ToolContext, ToolMetadata, ToolRegistry};

/// The value returned to the caller: success or failure, never both, always
/// carrying the request id for audit correlation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvokeOutcome {
    Success {
        result: Value,
        request_id: Uuid,
    },
    Error {
        code: ErrorCode,
        message: String,
        request_id: Uuid,
    },
}

impl InvokeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvokeOutcome::Success { .. })
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            InvokeOutcome::Success { request_id, .. } => *request_id,
            InvokeOutcome::Error { request_id, .. } => *request_id,
        }
    }
}

pub struct Gateway {
    registry: Arc<ToolRegistry>,
    policy: PolicyEngine,
    audit: AuditLogger,
}

impl Gateway {
    pub fn new(registry: Arc<ToolRegistry>, policy: PolicyEngine, audit: AuditLogger) -> Self {
        Self {
            registry,
            policy,
            audit,
        }
    }

    pub fn list_tools(&self) -> Vec<ToolMetadata> {
        self.registry.metadata()
    }

    pub async fn invoke(&self, name: &str, args: Map<String, Value>) -> InvokeOutcome {
        let ctx = self.audit.create_context(name, &args);
        let request_id = ctx.request_id;

        let Some(tool) = self.registry.lookup(name) else {
            self.audit.log_denied(ctx, "tool_not_found");
            return InvokeOutcome::Error {
                code: ErrorCode::ToolNotFound,
                message: format!("unknown tool: {name}"),
                request_id,
            };
        };

        let parsed = match tool.schema.parse(&args) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.audit.log_denied(ctx, &format!("validation_failed: {e}"));
                return InvokeOutcome::Error {
                    code: ErrorCode::ValidationError,
                    message: e.to_string(),
                    request_id,
                };
            }
        };

        let decision = self.policy.decide(name, &parsed);
        if !decision.allowed {
            self.audit.log_denied(ctx, &decision.reason);
            return InvokeOutcome::Error {
                code: ErrorCode::PolicyDenied,
                message: decision.reason,
                request_id,
            };
        }
        let envelope = decision.envelope;

        // The handler runs in its own task: a panic becomes a JoinError
        // instead of unwinding through the gateway, and an expired deadline
        // leaves the task to be aborted rather than polled to completion.
        let cancel = CancellationToken::new();
        let tool_ctx = ToolContext {
            request_id,
            cancel: cancel.clone(),
        };
        let handler = Arc::clone(&tool.handler);
        let mut task = tokio::spawn(async move {
            handler.call(Value::Object(parsed), tool_ctx).await
        });

        let joined = tokio::select! {
            res = &mut task => Some(res),
            () = tokio::time::sleep(Duration::from_millis(envelope.timeout_ms)) => None,
        };

        let Some(joined) = joined else {
            // Deadline elapsed: cancel in-flight I/O, abandon the task, and
            // audit with the fixed reason the deadline path always uses.
            cancel.cancel();
            task.abort();
            let err = GatewayError::timeout(envelope.timeout_ms);
            self.audit
                .log(ctx, Decision::Allow, "error: timeout", None, Some(err.code));
            return InvokeOutcome::Error {
                code: err.code,
                message: err.message,
                request_id,
            };
        };

        let executed = match joined {
            Ok(handler_result) => handler_result,
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    let panic = join_err.into_panic();
                    panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string())
                } else {
                    join_err.to_string()
                };
                Err(GatewayError::internal(message))
            }
        };

        match executed {
            Err(err) => {
                self.audit.log_error(ctx, err.code, &err.message);
                InvokeOutcome::Error {
                    code: err.code,
                    message: err.message,
                    request_id,
                }
            }
            Ok(result) => {
                let size = serde_json::to_vec(&result).map(|b| b.len()).unwrap_or(0);
                if size as u64 > envelope.max_bytes {
                    let err = GatewayError::max_bytes(size, envelope.max_bytes);
                    self.audit.log_error(ctx, err.code, &err.message);
                    return InvokeOutcome::Error {
                        code: err.code,
                        message: err.message,
                        request_id,
                    };
                }
                self.audit.log_success(ctx, &result);
                InvokeOutcome::Success { result, request_id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditConfig;
    use crate::policy::{PolicyConfig, ToolPolicy};
    use crate::registry::{Tool, ToolHandler};
    use crate::schema::{FieldType, InputSchema};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value, _ctx: ToolContext) -> Result<Value, GatewayError> {
            Ok(args)
        }
    }

    struct Sleeper {
        millis: u64,
    }

    #[async_trait]
    impl ToolHandler for Sleeper {
        async fn call(&self, _args: Value, _ctx: ToolContext) -> Result<Value, GatewayError> {
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            Ok(json!({"slept": self.millis}))
        }
    }

    struct Panicker;

    #[async_trait]
    impl ToolHandler for Panicker {
        async fn call(&self, _args: Value, _ctx: ToolContext) -> Result<Value, GatewayError> {
            panic!("boom");
        }
    }

    struct Refuser;

    #[async_trait]
    impl ToolHandler for Refuser {
        async fn call(&self, _args: Value, _ctx: ToolContext) -> Result<Value, GatewayError> {
            Err(GatewayError::security("outside the allowed paths"))
        }
    }

    struct Blob {
        bytes: usize,
    }

    #[async_trait]
    impl ToolHandler for Blob {
        async fn call(&self, _args: Value, _ctx: ToolContext) -> Result<Value, GatewayError> {
            Ok(Value::String("x".repeat(self.bytes)))
        }
    }

    struct Fixture {
        gateway: Gateway,
        audit_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn events(&self) -> Vec<Value> {
            let contents = std::fs::read_to_string(&self.audit_path).unwrap_or_default();
            contents
                .lines()
                .map(|l| serde_json::from_str(l).expect("audit line"))
                .collect()
        }
    }

    fn fixture(policy: PolicyConfig) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit_path = dir.path().join("audit.jsonl");

        let mut registry = ToolRegistry::new();
        registry
            .register_many(vec![
                Tool::new(
                    "test.echo",
                    "echo back the arguments",
                    InputSchema::new().required("text", FieldType::string(), "Text to echo"),
                    Arc::new(Echo),
                ),
                Tool::new(
                    "test.sleep",
                    "sleep then return",
                    InputSchema::new(),
                    Arc::new(Sleeper { millis: 100 }),
                ),
                Tool::new(
                    "test.panic",
                    "panic on call",
                    InputSchema::new(),
                    Arc::new(Panicker),
                ),
                Tool::new(
                    "test.refuse",
                    "always refuses",
                    InputSchema::new(),
                    Arc::new(Refuser),
                ),
                Tool::new(
                    "test.blob",
                    "returns a fixed-size string",
                    InputSchema::new(),
                    Arc::new(Blob { bytes: 100 }),
                ),
            ])
            .expect("register");

        let gateway = Gateway::new(
            Arc::new(registry),
            PolicyEngine::new(policy).expect("policy"),
            AuditLogger::new(
                &AuditConfig {
                    enabled: true,
                    log_file: Some(audit_path.clone()),
                },
                "tester",
            ),
        );
        Fixture {
            gateway,
            audit_path,
            _dir: dir,
        }
    }

    fn open_policy() -> PolicyConfig {
        PolicyConfig {
            default_deny: false,
            ..PolicyConfig::default()
        }
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().expect("object").clone()
    }

    #[tokio::test]
    async fn success_path_audits_allow_with_result_bytes() {
        let f = fixture(open_policy());
        let outcome = f.gateway.invoke("test.echo", args(json!({"text": "hi"}))).await;
        let InvokeOutcome::Success { result, request_id } = outcome else {
            panic!("expected success");
        };
        assert_eq!(result["text"], json!("hi"));

        let events = f.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["decision"], json!("allow"));
        assert_eq!(events[0]["reason"], json!("execution_success"));
        assert_eq!(events[0]["request_id"], json!(request_id.to_string()));
        assert!(events[0]["result_bytes"].as_u64().expect("bytes") > 0);
        assert!(events[0].get("error_code").is_none());
    }

    #[tokio::test]
    async fn unknown_tool_is_a_deny() {
        let f = fixture(open_policy());
        let outcome = f.gateway.invoke("test.missing", args(json!({}))).await;
        let InvokeOutcome::Error { code, .. } = &outcome else {
            panic!("expected error");
        };
        assert_eq!(*code, ErrorCode::ToolNotFound);

        let events = f.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["decision"], json!("deny"));
        assert_eq!(events[0]["reason"], json!("tool_not_found"));
    }

    #[tokio::test]
    async fn validation_failure_names_the_field() {
        let f = fixture(open_policy());
        let outcome = f.gateway.invoke("test.echo", args(json!({"text": 5}))).await;
        let InvokeOutcome::Error { code, message, .. } = &outcome else {
            panic!("expected error");
        };
        assert_eq!(*code, ErrorCode::ValidationError);
        assert!(message.contains("text"));

        let events = f.events();
        assert_eq!(events[0]["decision"], json!("deny"));
        assert!(
            events[0]["reason"]
                .as_str()
                .expect("reason")
                .starts_with("validation_failed: text")
        );
    }

    #[tokio::test]
    async fn policy_deny_stops_before_the_handler() {
        let f = fixture(PolicyConfig::default());
        let outcome = f.gateway.invoke("test.echo", args(json!({"text": "hi"}))).await;
        let InvokeOutcome::Error { code, message, .. } = &outcome else {
            panic!("expected error");
        };
        assert_eq!(*code, ErrorCode::PolicyDenied);
        assert_eq!(message, "default_deny");

        let events = f.events();
        assert_eq!(events[0]["decision"], json!("deny"));
        assert_eq!(events[0]["reason"], json!("default_deny"));
    }

    #[tokio::test]
    async fn timeout_cancels_and_audits_allow_plus_code() {
        let mut policy = open_policy();
        policy.per_tool.insert(
            "test.sleep".to_string(),
            ToolPolicy {
                timeout_ms: Some(10),
                ..ToolPolicy::default()
            },
        );
        let f = fixture(policy);

        let started = std::time::Instant::now();
        let outcome = f.gateway.invoke("test.sleep", args(json!({}))).await;
        assert!(started.elapsed() < Duration::from_millis(80));

        let InvokeOutcome::Error { code, .. } = &outcome else {
            panic!("expected error");
        };
        assert_eq!(*code, ErrorCode::Timeout);

        let events = f.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["decision"], json!("allow"));
        assert_eq!(events[0]["error_code"], json!("timeout"));
        assert_eq!(events[0]["reason"], json!("error: timeout"));
    }

    #[tokio::test]
    async fn handler_completing_within_deadline_succeeds() {
        let mut policy = open_policy();
        policy.per_tool.insert(
            "test.sleep".to_string(),
            ToolPolicy {
                timeout_ms: Some(5_000),
                ..ToolPolicy::default()
            },
        );
        let f = fixture(policy);
        let outcome = f.gateway.invoke("test.sleep", args(json!({}))).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn result_at_the_cap_passes_one_over_fails() {
        // Blob returns 100 "x" chars; the JSON encoding adds two quotes.
        let mut policy = open_policy();
        policy.per_tool.insert(
            "test.blob".to_string(),
            ToolPolicy {
                max_bytes: Some(102),
                ..ToolPolicy::default()
            },
        );
        let f = fixture(policy);
        assert!(f.gateway.invoke("test.blob", args(json!({}))).await.is_success());

        let mut policy = open_policy();
        policy.per_tool.insert(
            "test.blob".to_string(),
            ToolPolicy {
                max_bytes: Some(101),
                ..ToolPolicy::default()
            },
        );
        let f = fixture(policy);
        let outcome = f.gateway.invoke("test.blob", args(json!({}))).await;
        let InvokeOutcome::Error { code, .. } = &outcome else {
            panic!("expected error");
        };
        assert_eq!(*code, ErrorCode::MaxBytesExceeded);
        assert_eq!(f.events()[0]["error_code"], json!("max_bytes_exceeded"));
    }

    #[tokio::test]
    async fn typed_handler_error_surfaces_unchanged() {
        let f = fixture(open_policy());
        let outcome = f.gateway.invoke("test.refuse", args(json!({}))).await;
        let InvokeOutcome::Error { code, message, .. } = &outcome else {
            panic!("expected error");
        };
        assert_eq!(*code, ErrorCode::SecurityError);
        assert_eq!(message, "outside the allowed paths");

        let events = f.events();
        assert_eq!(events[0]["decision"], json!("allow"));
        assert_eq!(events[0]["error_code"], json!("security_error"));
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        let f = fixture(open_policy());
        let outcome = f.gateway.invoke("test.panic", args(json!({}))).await;
        let InvokeOutcome::Error { code, message, .. } = &outcome else {
            panic!("expected error");
        };
        assert_eq!(*code, ErrorCode::InternalError);
        assert!(message.contains("boom"));
        assert_eq!(f.events()[0]["error_code"], json!("internal_error"));
    }

    #[tokio::test]
    async fn request_ids_are_unique_and_every_invoke_audits_once() {
        let f = fixture(open_policy());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let outcome = f.gateway.invoke("test.echo", args(json!({"text": "x"}))).await;
            assert!(seen.insert(outcome.request_id()));
        }
        // One audit line per invocation, ids matching the outcomes.
        let events = f.events();
        assert_eq!(events.len(), 5);
        let audited: std::collections::HashSet<String> = events
            .iter()
            .map(|e| e["request_id"].as_str().expect("id").to_string())
            .collect();
        assert_eq!(audited.len(), 5);
    }

    #[tokio::test]
    async fn defaults_applied_before_policy_sees_args() {
        // The allowlist restricts `encoding`; the schema default must satisfy
        // it without the caller passing anything.
        let mut registry = ToolRegistry::new();
        registry
            .register(Tool::new(
                "test.encode",
                "echo with encoding default",
                InputSchema::new().with_default(
                    "encoding",
                    FieldType::enumeration(&["utf-8", "base64"]),
                    "Encoding",
                    json!("utf-8"),
                ),
                Arc::new(Echo),
            ))
            .expect("register");

        let mut policy = open_policy();
        let allowlist: std::collections::HashMap<String, crate::policy::ArgRuleSpec> =
            serde_json::from_value(json!({"encoding": ["utf-8"]})).expect("allowlist");
        policy.per_tool.insert(
            "test.encode".to_string(),
            ToolPolicy {
                allow: Some(true),
                arg_allowlist: Some(allowlist),
                ..ToolPolicy::default()
            },
        );

        let gateway = Gateway::new(
            Arc::new(registry),
            PolicyEngine::new(policy).expect("policy"),
            AuditLogger::disabled("tester"),
        );
        let outcome = gateway.invoke("test.encode", args(json!({}))).await;
        assert!(outcome.is_success());

        let outcome = gateway
            .invoke("test.encode", args(json!({"encoding": "base64"})))
            .await;
        let InvokeOutcome::Error { code, .. } = &outcome else {
            panic!("expected error");
        };
        assert_eq!(*code, ErrorCode::PolicyDenied);
    }
}
