use super::{Middleware, Next};
use crate::agent::session::AgentSession;
use crate::agent::tools::base::ConfirmCallback;
use crate::mailbox::{RequestManager, STATUS_APPROVED, STATUS_DENIED};
use crate::providers::base::ChunkStream;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// The Architect's side of the permission IPC: on every turn, list pending
/// requests from `B/requests/` and resolve each through the confirmation
/// hook (the TAP bridge in UI mode, a console prompt headless). The
/// requesting worker is blocked polling for the answer.
pub struct RequestMonitor {
    requests: Option<RequestManager>,
    confirm: Option<Arc<dyn ConfirmCallback>>,
}

impl RequestMonitor {
    pub fn new(
        blackboard_dir: &std::path::Path,
        confirm: Option<Arc<dyn ConfirmCallback>>,
    ) -> Self {
        let requests = RequestManager::new(blackboard_dir)
            .map_err(|e| error!("request monitor unavailable: {}", e))
            .ok();
        Self { requests, confirm }
    }

    async fn check_and_handle_requests(&self) {
        let Some(requests) = &self.requests else {
            return;
        };
        let pending = requests.list_pending();
        if pending.is_empty() {
            return;
        }
        info!("found {} pending permission requests", pending.len());

        for request in pending {
            let message = format!(
                "### PENDING PERMISSION REQUEST\n\n**Agent**: `{}`\n\n**Action**: {}\n\n**Command/Content**:\n```\n{}\n```\n**Reason**: *{}*\n\n**Approve this action?**",
                request.agent_name,
                request.request_type,
                request.content,
                if request.reason.is_empty() {
                    "No reason provided"
                } else {
                    &request.reason
                }
            );

            let approved = match &self.confirm {
                Some(confirm) => confirm.confirm(&message).await,
                None => Self::console_confirm(&message).await,
            };

            let status = if approved { STATUS_APPROVED } else { STATUS_DENIED };
            if let Err(e) = requests.update_status(&request.id, status) {
                error!("failed to resolve request {}: {}", request.id, e);
            }
        }
    }

    /// Headless fallback: y/n prompt on the terminal.
    async fn console_confirm(message: &str) -> bool {
        println!("\n{}\n{}\n{}", "=".repeat(60), message, "=".repeat(60));
        tokio::task::spawn_blocking(|| {
            loop {
                print!("  >> Approve this action? (y/n): ");
                use std::io::Write;
                let _ = std::io::stdout().flush();
                let mut line = String::new();
                if std::io::stdin().read_line(&mut line).is_err() {
                    return false;
                }
                match line.trim().to_lowercase().as_str() {
                    "y" | "yes" => return true,
                    "n" | "no" => return false,
                    _ => println!("  Please enter 'y' or 'n'."),
                }
            }
        })
        .await
        .unwrap_or(false)
    }
}

#[async_trait]
impl Middleware for RequestMonitor {
    async fn call(&self, session: &mut AgentSession, next: Next<'_>) -> Result<ChunkStream> {
        self.check_and_handle_requests().await;
        next.run(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Approver(AtomicBool);

    #[async_trait]
    impl ConfirmCallback for Approver {
        async fn confirm(&self, message: &str) -> bool {
            self.0.store(true, Ordering::SeqCst);
            message.contains("rm -rf") == false
        }
    }

    #[tokio::test]
    async fn pending_request_is_resolved_via_callback() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RequestManager::new(dir.path()).unwrap();
        let id = manager
            .create_request("Coder", "bash", "cargo build", "compile check")
            .unwrap();

        let approver = Arc::new(Approver(AtomicBool::new(false)));
        let monitor = RequestMonitor::new(dir.path(), Some(approver.clone()));
        monitor.check_and_handle_requests().await;

        assert!(approver.0.load(Ordering::SeqCst));
        assert!(manager.list_pending().is_empty());
        let status = manager
            .wait_for_response(&id, std::time::Duration::from_millis(10))
            .await;
        assert_eq!(status, STATUS_APPROVED);
    }

    #[tokio::test]
    async fn denial_is_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RequestManager::new(dir.path()).unwrap();
        let id = manager
            .create_request("Coder", "bash", "rm -rf /important", "cleanup")
            .unwrap();

        let monitor = RequestMonitor::new(
            dir.path(),
            Some(Arc::new(Approver(AtomicBool::new(false)))),
        );
        monitor.check_and_handle_requests().await;

        let status = manager
            .wait_for_response(&id, std::time::Duration::from_millis(10))
            .await;
        assert_eq!(status, STATUS_DENIED);
    }
}
