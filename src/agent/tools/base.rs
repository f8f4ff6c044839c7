use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Blocks on the user (or the TAP bridge) for a free-text answer.
#[async_trait]
pub trait InputCallback: Send + Sync {
    async fn ask(&self, question: &str) -> String;
}

/// Blocks on the user (or the TAP bridge) for a yes/no confirmation.
#[async_trait]
pub trait ConfirmCallback: Send + Sync {
    async fn confirm(&self, message: &str) -> bool;
}

/// Per-agent state injected into tools by the engine before the first call.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub agent_name: Option<String>,
    pub parent_agent_name: Option<String>,
    pub is_architect: bool,
    pub model_key: Option<String>,
    pub blackboard_dir: Option<PathBuf>,
    pub root_path: Option<PathBuf>,
    pub keys_path: Option<PathBuf>,
    pub max_iterations: usize,
    pub input_callback: Option<Arc<dyn InputCallback>>,
    pub confirm_callback: Option<Arc<dyn ConfirmCallback>>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("agent_name", &self.agent_name)
            .field("parent_agent_name", &self.parent_agent_name)
            .field("is_architect", &self.is_architect)
            .field("model_key", &self.model_key)
            .field("blackboard_dir", &self.blackboard_dir)
            .field("max_iterations", &self.max_iterations)
            .finish_non_exhaustive()
    }
}

/// One agent capability. Results are plain strings fed back to the LLM;
/// recoverable failures are `Ok` strings starting with `Error: ` so the
/// model can react, while `Err` is reserved for infrastructure breakage
/// (the engine formats those the same way).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> String;
    fn parameters(&self) -> Value;

    async fn execute(&self, params: Value) -> anyhow::Result<String>;

    /// Inject per-agent state (identity, callbacks, paths). Called once by
    /// the engine at construction; implementations use interior mutability.
    fn configure(&self, _ctx: &ToolContext) {}

    fn to_schema(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": self.parameters(),
            }
        })
    }
}

/// Strict schema validation: required fields present, no unknown fields,
/// primitive types match. Returns the rejection message for the LLM.
pub fn validate_params(schema: &Value, params: &Value) -> Option<String> {
    let properties = schema.get("properties").and_then(Value::as_object);
    let Some(properties) = properties else {
        return None;
    };
    let Some(params_map) = params.as_object() else {
        return Some("Error: Tool arguments must be a JSON object.".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !params_map.contains_key(field) {
                return Some(format!("Error: Missing required parameter '{}'.", field));
            }
        }
    }

    for key in params_map.keys() {
        if !properties.contains_key(key) {
            let known: Vec<&String> = properties.keys().collect();
            return Some(format!(
                "Error: Unexpected parameter '{}'. This tool only accepts: {:?}.",
                key, known
            ));
        }
    }

    for (key, value) in params_map {
        let Some(expected) = properties.get(key).and_then(|p| p.get("type")).and_then(Value::as_str)
        else {
            continue;
        };
        let ok = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !ok {
            return Some(format!("Error: Parameter '{}' must be a {}.", key, expected));
        }
    }

    None
}

/// Reject absolute system paths and `..` traversal in path-like arguments.
pub fn environment_guard(params: &Value) -> Option<String> {
    const PATH_KEYS: &[&str] = &["path", "directory", "filename", "filepath", "content_path"];
    let map = params.as_object()?;
    for key in PATH_KEYS {
        if let Some(value) = map.get(*key).and_then(Value::as_str) {
            for prefix in ["/etc", "/var", "/root", "/proc", "/sys"] {
                if value.starts_with(prefix) {
                    return Some(format!(
                        "Error: Access to system path '{}' is prohibited for security reasons.",
                        value
                    ));
                }
            }
            if value.contains("..") {
                return Some("Error: Relative paths with '..' are not allowed.".to_string());
            }
        }
    }
    None
}

/// Resolve `{{blackboard}}` and `{{root_path}}` in string arguments so the
/// model can address the sandbox without knowing absolute paths.
pub fn substitute_path_variables(params: &mut Value, ctx: &ToolContext) {
    fn resolve(value: &mut Value, blackboard: Option<&str>, root: Option<&str>) {
        match value {
            Value::String(s) => {
                if let Some(blackboard) = blackboard {
                    *s = s.replace("{{blackboard}}", blackboard);
                }
                if let Some(root) = root {
                    *s = s.replace("{{root_path}}", root);
                }
            }
            Value::Array(items) => {
                for item in items {
                    resolve(item, blackboard, root);
                }
            }
            Value::Object(map) => {
                for item in map.values_mut() {
                    resolve(item, blackboard, root);
                }
            }
            _ => {}
        }
    }
    let blackboard = ctx
        .blackboard_dir
        .as_ref()
        .map(|p| p.to_string_lossy().to_string());
    let root = ctx
        .root_path
        .as_ref()
        .map(|p| p.to_string_lossy().to_string());
    resolve(params, blackboard.as_deref(), root.as_deref());
}
