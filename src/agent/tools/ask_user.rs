use crate::agent::tools::base::{InputCallback, Tool, ToolContext};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Arc, RwLock};

/// Pauses execution to ask the user a question. In TAP mode the injected
/// callback routes the question to the UI; headless mode falls back to a
/// console prompt.
pub struct AskUserTool {
    input_callback: RwLock<Option<Arc<dyn InputCallback>>>,
}

impl AskUserTool {
    pub fn new(input_callback: Option<Arc<dyn InputCallback>>) -> Self {
        Self {
            input_callback: RwLock::new(input_callback),
        }
    }
}

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> String {
        "Pauses execution to ask the user a question and waits for their input. Useful for clarifying requirements or requesting confirmation.".to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask the user."
                }
            },
            "required": ["question"]
        })
    }

    fn configure(&self, ctx: &ToolContext) {
        if ctx.input_callback.is_some()
            && let Ok(mut cb) = self.input_callback.write()
        {
            cb.clone_from(&ctx.input_callback);
        }
    }

    async fn execute(&self, params: Value) -> anyhow::Result<String> {
        let question = params
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let callback = self.input_callback.read().ok().and_then(|cb| cb.clone());
        if let Some(callback) = callback {
            return Ok(callback.ask(&question).await);
        }

        // Headless fallback: prompt on the terminal.
        println!("\n[AskUser] {}", question);
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(_) => line.trim().to_string(),
                Err(_) => String::new(),
            }
        })
        .await?;
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedInput(&'static str);

    #[async_trait]
    impl InputCallback for CannedInput {
        async fn ask(&self, _question: &str) -> String {
            self.0.to_string()
        }
    }

    #[tokio::test]
    async fn callback_answers_question() {
        let tool = AskUserTool::new(Some(Arc::new(CannedInput("yes, proceed"))));
        let result = tool
            .execute(json!({"question": "Approve the plan?"}))
            .await
            .unwrap();
        assert_eq!(result, "yes, proceed");
    }

    #[tokio::test]
    async fn configure_injects_callback() {
        let tool = AskUserTool::new(None);
        tool.configure(&ToolContext {
            input_callback: Some(Arc::new(CannedInput("configured answer"))),
            ..Default::default()
        });
        let result = tool.execute(json!({"question": "q"})).await.unwrap();
        assert_eq!(result, "configured answer");
    }
}
