use crate::providers::base::{Message, ToolDefinition};
use serde_json::Value;
use std::collections::HashMap;

/// The system prompt as a base plus replaceable extra sections. Middlewares
/// that refresh live state (swarm status, notifications) address their
/// section by header so it is replaced in place instead of growing.
#[derive(Debug, Clone, Default)]
pub struct SystemPromptConfig {
    pub base_prompt: String,
    pub extra_sections: Vec<String>,
}

impl SystemPromptConfig {
    pub fn new(base_prompt: impl Into<String>) -> Self {
        Self {
            base_prompt: base_prompt.into(),
            extra_sections: Vec::new(),
        }
    }

    pub fn build(&self) -> String {
        let mut parts = vec![self.base_prompt.clone()];
        parts.extend(self.extra_sections.iter().cloned());
        parts.retain(|p| !p.is_empty());
        parts.join("\n\n")
    }

    /// Replace the section starting with `header` in place, or insert it.
    pub fn upsert_section(&mut self, header: &str, section: String, front: bool) {
        if let Some(existing) = self
            .extra_sections
            .iter_mut()
            .find(|s| s.starts_with(header))
        {
            *existing = section;
        } else if front {
            self.extra_sections.insert(0, section);
        } else {
            self.extra_sections.push(section);
        }
    }

    /// Append a section, skipping an immediate duplicate.
    pub fn append_section(&mut self, section: String) {
        if self.extra_sections.last() != Some(&section) {
            self.extra_sections.push(section);
        }
    }
}

/// Per-call engine session: ordered history, recursion depth, the tool
/// schemas offered to the provider, and a scratch metadata map middlewares
/// use to pass counters between turns. Lives for one `AgentEngine::run`.
#[derive(Debug, Default)]
pub struct AgentSession {
    pub history: Vec<Message>,
    pub depth: usize,
    pub system_config: SystemPromptConfig,
    pub tools: Vec<ToolDefinition>,
    pub metadata: HashMap<String, Value>,
}

impl AgentSession {
    pub fn new(
        history: Vec<Message>,
        depth: usize,
        system_config: SystemPromptConfig,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        Self {
            history,
            depth,
            system_config,
            tools,
            metadata: HashMap::new(),
        }
    }

    /// Number of assistant turns so far, the unit both the budget manager
    /// and the result cache count in.
    pub fn assistant_turns(&self) -> usize {
        self.history.iter().filter(|m| m.is_assistant()).count()
    }

    pub fn metadata_usize(&self, key: &str) -> Option<usize> {
        self.metadata.get(key)?.as_u64().map(|v| v as usize)
    }

    pub fn set_metadata_usize(&mut self, key: &str, value: usize) {
        self.metadata.insert(key.to_string(), Value::from(value as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_joins_sections() {
        let mut config = SystemPromptConfig::new("base");
        config.extra_sections.push("extra".to_string());
        assert_eq!(config.build(), "base\n\nextra");
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut config = SystemPromptConfig::new("base");
        config.upsert_section("## STATUS", "## STATUS\nv1".to_string(), false);
        config.upsert_section("## STATUS", "## STATUS\nv2".to_string(), false);
        assert_eq!(config.extra_sections.len(), 1);
        assert!(config.extra_sections[0].ends_with("v2"));
    }

    #[test]
    fn upsert_front_inserts_first() {
        let mut config = SystemPromptConfig::new("base");
        config.extra_sections.push("other".to_string());
        config.upsert_section("## SWARM", "## SWARM\nx".to_string(), true);
        assert!(config.extra_sections[0].starts_with("## SWARM"));
    }

    #[test]
    fn append_section_dedupes_consecutive() {
        let mut config = SystemPromptConfig::new("base");
        config.append_section("warn".to_string());
        config.append_section("warn".to_string());
        assert_eq!(config.extra_sections.len(), 1);
    }

    #[test]
    fn assistant_turn_count() {
        let mut session = AgentSession::default();
        session.history.push(Message::user("q"));
        session.history.push(Message::assistant("a"));
        session.history.push(Message::assistant("b"));
        assert_eq!(session.assistant_turns(), 2);
    }
}
