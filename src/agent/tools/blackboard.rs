use crate::agent::tools::base::{Tool, ToolContext};
use crate::blackboard::{AgentIdentity, Blackboard, CENTRAL_PLAN};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::RwLock;

/// The primary collaboration interface of the swarm: every coordination
/// read/write goes through this tool, keeping CAS and plan validation in one
/// place. Heavy artifacts belong in `resources/` via file tools; indices
/// point at them.
pub struct BlackboardTool {
    board: Blackboard,
    identity: RwLock<AgentIdentity>,
}

impl BlackboardTool {
    pub fn new(board: Blackboard) -> Self {
        Self {
            board,
            identity: RwLock::new(AgentIdentity::default()),
        }
    }
}

#[async_trait]
impl Tool for BlackboardTool {
    fn name(&self) -> &str {
        "blackboard"
    }

    fn description(&self) -> String {
        r#"The Primary Collaboration Interface for the Swarm.

**Directory Semantics**:
- `global_indices/`: **Coordination Layer**. Shared state, plans, and coordination signals. MUST use the `blackboard` tool for all operations here.
- `resources/`: **Working Directory (Storage Layer)**. Raw artifacts, code files, data, and reports. Use file tools directly with `{{blackboard}}/resources` as the base path.
- **Protocol**: "Indices point to Resources". Metadata lives in indices; heavy data lives in resources.

Operations:
1. `list_indices()`: Discover available index files.
2. `read_index(filename)`: Read an index (e.g. 'central_plan.md'). Returns content and `checksum`.
3. `update_task(task_id, updates, expected_checksum, filename?)`: Atomic task update. **(CAS protected, mandatory checksum)**. `filename` defaults to 'central_plan.md'.
4. `append_to_index(filename, content)`: Append a log entry to a timeline file. **(No CAS required, append-only)**.
5. `update_index(filename, content, expected_checksum)`: Full-file update. **(CAS protected, mandatory checksum)**.
6. `create_index(filename, content)`: Create a new global communication channel (index file).
   - **MANDATORY**: `content` MUST start with YAML frontmatter containing `name`, `description` and `usage_policy`.
   - **TIP**: Always wrap YAML values in double quotes to avoid parsing errors with special characters like `:`, `[`, `]`.
7. `list_templates()` / `read_template(filename)`: Browse the static index templates.
8. `list_resources()`: List files under `resources/`."#
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["list_indices", "read_index", "update_index", "append_to_index",
                             "update_task", "create_index", "list_templates", "read_template",
                             "list_resources"],
                    "description": "Operation name"
                },
                "filename": {
                    "type": "string",
                    "description": "Target filename for index or template operations."
                },
                "task_id": {
                    "type": "integer",
                    "description": "ID of the task to update (for update_task)"
                },
                "updates": {
                    "type": "object",
                    "description": "Fields to update (for update_task)"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write or append"
                },
                "expected_checksum": {
                    "type": "string",
                    "description": "Expected SHA-256 checksum for CAS updates (mandatory for update_index/update_task)"
                }
            },
            "required": ["operation"]
        })
    }

    fn configure(&self, ctx: &ToolContext) {
        if let Some(name) = &ctx.agent_name
            && let Ok(mut identity) = self.identity.write()
        {
            *identity = AgentIdentity::new(name.clone(), ctx.is_architect);
        }
    }

    async fn execute(&self, params: Value) -> anyhow::Result<String> {
        let board = self.board.clone();
        let identity = self
            .identity
            .read()
            .map(|i| i.clone())
            .unwrap_or_default();
        // Lock acquisition can block up to its timeout; keep it off the
        // async workers.
        let result =
            tokio::task::spawn_blocking(move || run_operation(&board, &identity, &params)).await?;
        Ok(result)
    }
}

fn str_arg<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn run_operation(board: &Blackboard, identity: &AgentIdentity, params: &Value) -> String {
    let Some(operation) = str_arg(params, "operation") else {
        return "Error: Operation is required.".to_string();
    };

    match operation.to_lowercase().as_str() {
        "list_indices" => match board.list_indices() {
            Ok(indices) if indices.is_empty() => "No indices found.".to_string(),
            Ok(indices) => serde_json::to_string_pretty(&indices).unwrap_or_default(),
            Err(e) => format!("Error: {}", e),
        },

        "read_index" => {
            let Some(filename) = str_arg(params, "filename") else {
                return "Error: filename is required for read_index.".to_string();
            };
            match board.read_index(filename) {
                Ok(doc) => serde_json::to_string_pretty(&json!({
                    "metadata": doc.metadata,
                    "content": doc.body,
                    "checksum": doc.checksum,
                }))
                .unwrap_or_default(),
                Err(e) => format!("Error: {}", e),
            }
        }

        "append_to_index" => {
            let Some(filename) = str_arg(params, "filename") else {
                return "Error: filename is required for append_to_index.".to_string();
            };
            let content = str_arg(params, "content").unwrap_or_default();
            match board.append_to_index(filename, content) {
                Ok(()) => "Success: Appended to index.".to_string(),
                Err(e) => format!("Error: {}", e),
            }
        }

        "update_index" => {
            let Some(filename) = str_arg(params, "filename") else {
                return "Error: filename is required for update_index.".to_string();
            };
            let content = str_arg(params, "content").unwrap_or_default();
            let checksum = str_arg(params, "expected_checksum").unwrap_or_default();
            match board.update_index(filename, content, checksum) {
                Ok(()) => "Success: Index updated.".to_string(),
                Err(e) => format!("Error: {}", e),
            }
        }

        "update_task" => {
            let filename = str_arg(params, "filename").unwrap_or(CENTRAL_PLAN);
            let Some(task_id) = params.get("task_id").and_then(Value::as_i64) else {
                return "Error: task_id is required for update_task.".to_string();
            };
            let updates: Map<String, Value> = params
                .get("updates")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let checksum = str_arg(params, "expected_checksum").unwrap_or_default();
            match board.update_task(identity, filename, task_id, &updates, checksum) {
                Ok(()) => "Success: Task updated.".to_string(),
                Err(e) => format!("Error: {}", e),
            }
        }

        "create_index" => {
            let Some(filename) = str_arg(params, "filename") else {
                return "Error: filename is required for create_index.".to_string();
            };
            let content = str_arg(params, "content").unwrap_or_default();
            match board.create_index(filename, content) {
                Ok(()) => format!("Success: Created index '{}'", filename),
                Err(e) => format!("Error: {}", e),
            }
        }

        "list_templates" => match board.list_templates() {
            Ok(templates) if templates.is_empty() => "No templates directory found.".to_string(),
            Ok(templates) => serde_json::to_string_pretty(&templates).unwrap_or_default(),
            Err(e) => format!("Error: {}", e),
        },

        "read_template" => {
            let Some(filename) = str_arg(params, "filename") else {
                return "Error: filename is required for read_template.".to_string();
            };
            match board.read_template(filename) {
                Ok(content) => content,
                Err(e) => format!("Error: {}", e),
            }
        }

        "list_resources" => match board.list_resources() {
            Ok(resources) => serde_json::to_string_pretty(&resources).unwrap_or_default(),
            Err(e) => format!("Error: {}", e),
        },

        other => format!("Error: Unknown operation {}", other),
    }
}
