//! Static allow/deny policy and resource envelopes.
//!
//! The engine is built once from configuration and is immutable afterwards.
//! Decision precedence, most specific first: the deny list always wins, then
//! per-tool entries (including their argument allowlists), then the allow
//! list, then `default_deny`.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::GatewayError;

fn default_true() -> bool {
    true
}

fn default_global_timeout_ms() -> u64 {
    30_000
}

fn default_global_max_bytes() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub default_deny: bool,
    #[serde(default)]
    pub allow_tools: Vec<String>,
    #[serde(default)]
    pub deny_tools: Vec<String>,
    #[serde(default)]
    pub per_tool: HashMap<String, ToolPolicy>,
    #[serde(default = "default_global_timeout_ms")]
    pub global_timeout_ms: u64,
    #[serde(default = "default_global_max_bytes")]
    pub global_max_bytes: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_deny: true,
            allow_tools: Vec::new(),
            deny_tools: Vec::new(),
            per_tool: HashMap::new(),
            global_timeout_ms: default_global_timeout_ms(),
            global_max_bytes: default_global_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub allow: Option<bool>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_bytes: Option<u64>,
    #[serde(default)]
    pub arg_allowlist: Option<HashMap<String, ArgRuleSpec>>,
}

/// Config-side shape of one argument allowlist entry: `true` accepts any
/// value, a list is a membership check, a `regex:` string is a pattern match,
/// and any other literal means exact equality.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgRuleSpec {
    Flag(bool),
    OneOf(Vec<Value>),
    Literal(Value),
}

enum ArgRule {
    Any,
    OneOf(Vec<Value>),
    Pattern(Regex),
    Exact(Value),
}

impl ArgRule {
    fn compile(spec: &ArgRuleSpec) -> Result<Self, PolicyError> {
        Ok(match spec {
            ArgRuleSpec::Flag(true) => ArgRule::Any,
            ArgRuleSpec::Flag(false) => ArgRule::Exact(Value::Bool(false)),
            ArgRuleSpec::OneOf(values) => ArgRule::OneOf(values.clone()),
            ArgRuleSpec::Literal(Value::String(s)) => match s.strip_prefix("regex:") {
                Some(pattern) => ArgRule::Pattern(
                    Regex::new(pattern)
                        .map_err(|e| PolicyError::BadPattern(pattern.to_string(), e))?,
                ),
                None => ArgRule::Exact(Value::String(s.clone())),
            },
            ArgRuleSpec::Literal(other) => ArgRule::Exact(other.clone()),
        })
    }

    /// `None` when the value is acceptable, otherwise a description of what
    /// was expected.
    fn mismatch(&self, value: &Value) -> Option<String> {
        match self {
            ArgRule::Any => None,
            ArgRule::OneOf(values) => {
                if values.contains(value) {
                    None
                } else {
                    let expected = values
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    Some(format!("expected one of: {expected}"))
                }
            }
            ArgRule::Pattern(re) => match value.as_str() {
                Some(s) if re.is_match(s) => None,
                Some(_) => Some(format!("must match pattern {}", re.as_str())),
                None => Some("pattern rules apply to string values".to_string()),
            },
            ArgRule::Exact(expected) => {
                if value == expected {
                    None
                } else {
                    Some(format!("must equal {expected}"))
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid arg_allowlist pattern `{0}`: {1}")]
    BadPattern(String, regex::Error),
    #[error("{0} must be strictly positive")]
    NonPositiveLimit(String),
}

/// The resource limits applied to a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub timeout_ms: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub envelope: Envelope,
}

pub struct PolicyEngine {
    config: PolicyConfig,
    arg_rules: HashMap<String, HashMap<String, ArgRule>>,
}

impl PolicyEngine {
    /// Compiles argument patterns up front so a bad regex fails at startup,
    /// not on the first matching invocation. Envelope values must be
    /// strictly positive: a zero timeout or byte cap is a misconfiguration,
    /// not a deny.
    pub fn new(config: PolicyConfig) -> Result<Self, PolicyError> {
        if config.global_timeout_ms == 0 {
            return Err(PolicyError::NonPositiveLimit("global_timeout_ms".into()));
        }
        if config.global_max_bytes == 0 {
            return Err(PolicyError::NonPositiveLimit("global_max_bytes".into()));
        }
        for (tool, policy) in &config.per_tool {
            if policy.timeout_ms == Some(0) {
                return Err(PolicyError::NonPositiveLimit(format!(
                    "per_tool.{tool}.timeout_ms"
                )));
            }
            if policy.max_bytes == Some(0) {
                return Err(PolicyError::NonPositiveLimit(format!(
                    "per_tool.{tool}.max_bytes"
                )));
            }
        }

        let mut arg_rules = HashMap::new();
        for (tool, policy) in &config.per_tool {
            if let Some(allowlist) = &policy.arg_allowlist {
                let mut compiled = HashMap::new();
                for (key, spec) in allowlist {
                    compiled.insert(key.clone(), ArgRule::compile(spec)?);
                }
                arg_rules.insert(tool.clone(), compiled);
            }
        }
        Ok(Self { config, arg_rules })
    }

    fn envelope_for(&self, tool: &str) -> Envelope {
        let per_tool = self.config.per_tool.get(tool);
        Envelope {
            timeout_ms: per_tool
                .and_then(|p| p.timeout_ms)
                .unwrap_or(self.config.global_timeout_ms),
            max_bytes: per_tool
                .and_then(|p| p.max_bytes)
                .unwrap_or(self.config.global_max_bytes),
        }
    }

    pub fn decide(&self, tool: &str, args: &Map<String, Value>) -> PolicyDecision {
        // The envelope is computed regardless of the outcome so deny events
        // can still record the limits that would have applied.
        let envelope = self.envelope_for(tool);
        let decision = |allowed: bool, reason: String| PolicyDecision {
            allowed,
            reason,
            envelope,
        };

        if self.config.deny_tools.iter().any(|t| t == tool) {
            return decision(false, format!("deny_tools: {tool}"));
        }

        if let Some(per_tool) = self.config.per_tool.get(tool) {
            if per_tool.allow == Some(false) {
                return decision(false, "per_tool denied".to_string());
            }
            if let Some(rules) = self.arg_rules.get(tool) {
                for (key, value) in args {
                    let Some(rule) = rules.get(key) else {
                        return decision(false, format!("arg_allowlist: unexpected argument: {key}"));
                    };
                    if let Some(why) = rule.mismatch(value) {
                        return decision(false, format!("arg_allowlist: {key}: {why}"));
                    }
                }
            }
            if per_tool.allow == Some(true) {
                return decision(true, "per_tool allow".to_string());
            }
        }

        if self.config.allow_tools.iter().any(|t| t == tool) {
            return decision(true, format!("allow_tools: {tool}"));
        }

        if self.config.default_deny {
            return decision(false, "default_deny".to_string());
        }

        decision(true, "default allow".to_string())
    }

    /// `decide`, raising `policy_denied` on a deny.
    pub fn enforce(
        &self,
        tool: &str,
        args: &Map<String, Value>,
    ) -> Result<Envelope, GatewayError> {
        let decision = self.decide(tool, args);
        if decision.allowed {
            Ok(decision.envelope)
        } else {
            Err(GatewayError::policy_denied(decision.reason))
        }
    }
}
