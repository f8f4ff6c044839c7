use crate::blackboard::Blackboard;
use serde_json::Value;

/// Builds the system prompt from the core swarm protocol, the live index
/// listing (indices are self-describing via their front matter), the
/// available templates, and the agent's role and scenario.
pub struct PromptBuilder {
    board: Blackboard,
}

impl PromptBuilder {
    pub fn new(board: Blackboard) -> Self {
        Self { board }
    }

    pub fn build(&self, role_definition: &str, scenario_context: &str) -> String {
        let sections = [
            core_prompt().to_string(),
            self.indices_section(),
            self.templates_section(),
            role_section(role_definition),
            scenario_section(scenario_context),
        ];
        sections
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn indices_section(&self) -> String {
        let indices = self.board.list_indices().unwrap_or_default();
        if indices.is_empty() {
            return "## ACTIVE INDICES\nThe blackboard has no indices yet. If you are the Architect, create `central_plan.md` first.".to_string();
        }
        let mut lines = vec!["## ACTIVE INDICES".to_string()];
        for index in indices {
            let filename = index
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or("?");
            let description = index
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("(no description)");
            let usage = index
                .get("usage_policy")
                .and_then(Value::as_str)
                .unwrap_or("(no usage policy)");
            lines.push(format!("- `{}`: {} Usage: {}", filename, description, usage));
        }
        lines.join("\n")
    }

    fn templates_section(&self) -> String {
        let templates = self.board.list_templates().unwrap_or_default();
        if templates.is_empty() {
            return String::new();
        }
        format!(
            "## INDEX TEMPLATES\nTemplates available via `read_template`: {}",
            templates.join(", ")
        )
    }
}

fn role_section(role: &str) -> String {
    if role.is_empty() {
        String::new()
    } else {
        format!("## YOUR ROLE\n{}", role)
    }
}

fn scenario_section(scenario: &str) -> String {
    if scenario.is_empty() {
        String::new()
    } else {
        format!("## SCENARIO\n{}", scenario)
    }
}

fn core_prompt() -> &'static str {
    r#"# CORE CAPABILITIES
You are an autonomous AI Agent operating within a Swarm.
Your primary environment is the local file system, specifically the `{{blackboard}}` directory.
You interact with other agents and the system by reading and writing files.

## CRITICAL BEHAVIORAL GUIDELINES
1. **STRICT ROLE ADHERENCE**:
   - You MUST ONLY perform tasks assigned to your specific Role.
   - Do NOT try to do everything (e.g., if you are a Planner, do not write code; if you are a Coder, do not update the high-level plan).
   - **Finishing**: When a task is DONE, update its status to "DONE" and provide `result_summary` (a short outcome description) plus `artifact_link` if you produced a file under `resources/`.
   - If you have no active tasks in your subscribed indices: call `wait` (duration <= 15). Do not hallucinate tasks.

2. **Blackboard Usage & Directory Semantics**:
   - All communication MUST happen via the Blackboard.
   - `global_indices/` is the coordination layer: every file there starts with YAML frontmatter carrying `name`, `description` and `usage_policy`. Wrap YAML values containing special characters (`:`, `[`, `]`, `-`, `#`) in double quotes.
   - `resources/` is the storage layer for raw artifacts; indices point to resources.
   - Task updates go through `blackboard update_task` with the current `expected_checksum`; on a CAS failure, re-read the index and retry with the fresh checksum.

3. **Concurrency Discipline**:
   - Never overwrite an index blindly: read first, then CAS-update.
   - Claim a task by setting its status to IN_PROGRESS and yourself as assignee; only claim tasks whose dependencies are DONE."#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_includes_role_and_indices() {
        let dir = tempfile::tempdir().unwrap();
        let board = Blackboard::new(dir.path().join(".blackboard")).unwrap();
        board
            .create_index(
                "timeline.md",
                "---\nname: \"Timeline\"\ndescription: \"Event log\"\nusage_policy: \"append only\"\n---\n",
            )
            .unwrap();

        let builder = PromptBuilder::new(board);
        let prompt = builder.build("You are the Root Architect.", "Plan the mission.");
        assert!(prompt.contains("CORE CAPABILITIES"));
        assert!(prompt.contains("`timeline.md`: Event log"));
        assert!(prompt.contains("## YOUR ROLE\nYou are the Root Architect."));
        assert!(prompt.contains("## SCENARIO\nPlan the mission."));
    }

    #[test]
    fn empty_board_mentions_missing_indices() {
        let dir = tempfile::tempdir().unwrap();
        let board = Blackboard::new(dir.path().join(".blackboard")).unwrap();
        let prompt = PromptBuilder::new(board).build("role", "");
        assert!(prompt.contains("no indices yet"));
        assert!(!prompt.contains("## SCENARIO"));
    }
}
