//! Tool registration and lookup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::schema::InputSchema;

/// Per-invocation context handed to handlers.
///
/// The cancellation token is owned by the harness; handlers propagate it to
/// their I/O so deadline expiry actually interrupts in-flight work.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub request_id: Uuid,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: ToolContext) -> Result<Value, GatewayError>;
}

/// A named, schema-validated operation. Registered once at startup and never
/// mutated afterwards.
pub struct Tool {
    pub name: String,
    pub description: String,
    pub schema: InputSchema,
    pub handler: Arc<dyn ToolHandler>,
}

impl Tool {
    pub fn new(
        name: &str,
        description: &str,
        schema: InputSchema,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            handler,
        }
    }
}

/// Discovery record for one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),
}

/// Write-once-before-serve registry. Listing preserves registration order.
#[derive(Default)]
pub struct ToolRegistry {
    order: Vec<String>,
    tools: HashMap<String, Arc<Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) -> Result<(), RegistryError> {
        if self.tools.contains_key(&tool.name) {
            return Err(RegistryError::DuplicateTool(tool.name));
        }
        self.order.push(tool.name.clone());
        self.tools.insert(tool.name.clone(), Arc::new(tool));
        Ok(())
    }

    pub fn register_many(&mut self, tools: Vec<Tool>) -> Result<(), RegistryError> {
        for tool in tools {
            self.register(tool)?;
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list_names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn metadata(&self) -> Vec<ToolMetadata> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolMetadata {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.schema.to_json_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;

    struct Noop;

    #[async_trait]
    impl ToolHandler for Noop {
        async fn call(&self, _args: Value, _ctx: ToolContext) -> Result<Value, GatewayError> {
            Ok(Value::Null)
        }
    }

    fn tool(name: &str) -> Tool {
        Tool::new(
            name,
            "test tool",
            InputSchema::new().optional("x", FieldType::string(), "x"),
            Arc::new(Noop),
        )
    }

    #[test]
    fn listing_preserves_registration_order() {
        let mut reg = ToolRegistry::new();
        reg.register_many(vec![tool("a.one"), tool("b.two"), tool("c.three")])
            .expect("register");
        assert_eq!(reg.list_names(), vec!["a.one", "b.two", "c.three"]);
        assert_eq!(reg.metadata()[1].name, "b.two");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = ToolRegistry::new();
        reg.register(tool("a.one")).expect("first");
        let err = reg.register(tool("a.one")).expect_err("duplicate");
        assert!(matches!(err, RegistryError::DuplicateTool(n) if n == "a.one"));
    }

    #[test]
    fn lookup_misses_return_none() {
        let reg = ToolRegistry::new();
        assert!(reg.lookup("nope").is_none());
    }
}
