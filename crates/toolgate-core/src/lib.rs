//! Core of the toolgate gateway: the pieces that decide whether a tool call
//! may run and under which resource envelope, run it bounded, and record what
//! happened.
//!
//! This crate deliberately contains no transport or connector code so it can
//! be shared by the daemon and any future embedding.

pub mod audit;
pub mod error;
pub mod harness;
pub mod policy;
pub mod registry;
pub mod schema;

pub use audit::{AuditConfig, AuditContext, AuditEvent, AuditLogger, Decision, args_sha256};
pub use error::{ErrorCode, GatewayError};
pub use harness::{Gateway, InvokeOutcome};
pub use policy::{ArgRuleSpec, Envelope, PolicyConfig, PolicyDecision, PolicyEngine, ToolPolicy};
pub use registry::{
    RegistryError, Tool, ToolContext, ToolHandler, ToolMetadata, ToolRegistry,
};
pub use schema::{FieldType, InputSchema, SchemaError};

// Re-exported so connectors observe the same cancellation primitive the
// harness hands out without depending on tokio-util directly.
pub use tokio_util::sync::CancellationToken;
