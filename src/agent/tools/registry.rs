use crate::agent::tools::base::{Tool, ToolContext};
use crate::providers::base::ToolDefinition;
use std::sync::Arc;
use tracing::warn;

/// The agent's tool palette. Order of registration is preserved (it shapes
/// the schema list sent to the provider).
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        if name.is_empty() || name.chars().any(char::is_control) {
            warn!("rejecting tool with invalid name");
            return;
        }
        if self.get(name).is_some() {
            warn!("overwriting duplicate tool '{}'", name);
            self.tools.retain(|t| t.name() != name);
        }
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn remove(&mut self, name: &str) {
        self.tools.retain(|t| t.name() != name);
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.iter()
    }

    /// Push the per-agent context into every tool.
    pub fn configure_all(&self, ctx: &ToolContext) {
        for tool in &self.tools {
            tool.configure(ctx);
        }
    }

    /// Serialize the palette into provider function schemas.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| {
                let schema = t.to_schema();
                ToolDefinition {
                    name: schema["function"]["name"].as_str().unwrap_or_default().to_string(),
                    description: schema["function"]["description"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    parameters: schema["function"]["parameters"].clone(),
                }
            })
            .collect()
    }
}
