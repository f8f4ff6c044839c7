use crate::blackboard::Blackboard;
use crate::registry::AgentRegistry;
use crate::utils::unix_time_secs;
use serde_json::{Value, json};
use std::io::Write;
use std::path::Path;
use tracing::{error, info};

/// Full blackboard side-effects for a closing agent: registry row goes DEAD,
/// the termination is traced, and the swarm is notified. Reused by normal
/// exits, SIGTERM handlers, and the parent-death monitor.
pub fn cleanup_agent(registry: &AgentRegistry, board: &Blackboard, name: &str, reason: &str) {
    if let Err(e) = registry.deregister_agent(name, reason) {
        error!("[{}] failed to update registry during cleanup: {}", name, e);
    } else {
        info!("[{}] status updated to DEAD in registry", name);
    }

    log_event(
        board.root(),
        name,
        "lifecycle",
        json!({"event": "terminated", "reason": reason}),
    );

    board.broadcast_notification(&format!(
        "Agent [{}] has left the swarm. Reason: {}",
        name, reason
    ));
}

/// Append one structured entry to the agent's JSONL trace.
pub fn log_event(blackboard_dir: &Path, name: &str, event_type: &str, data: Value) {
    let log_dir = blackboard_dir.join("logs");
    if std::fs::create_dir_all(&log_dir).is_err() {
        return;
    }
    let path = log_dir.join(format!("{}.jsonl", name));
    let entry = json!({
        "timestamp": unix_time_secs(),
        "type": event_type,
        "data": data,
    });
    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(mut file) => {
            let _ = writeln!(file, "{}", entry);
        }
        Err(e) => error!("[{}] failed to write JSONL trace: {}", name, e),
    }
}

/// Append one line to the agent's human-readable text log.
pub fn log_text(blackboard_dir: &Path, name: &str, line: &str) {
    let log_dir = blackboard_dir.join("logs");
    if std::fs::create_dir_all(&log_dir).is_err() {
        return;
    }
    let path = log_dir.join(format!("{}.log", name));
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentStatus;

    #[test]
    fn cleanup_marks_dead_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(".blackboard");
        let board = Blackboard::new(&root).unwrap();
        let registry = AgentRegistry::new(&root).unwrap();
        registry.register_agent("Coder", "Engineer", 1234).unwrap();

        cleanup_agent(&registry, &board, "Coder", "finished its task");

        assert_eq!(registry.get_agent("Coder").unwrap().status, AgentStatus::Dead);
        let tail = board.tail_notifications(5, 5000).unwrap().unwrap();
        assert!(tail.contains("Agent [Coder] has left the swarm"));

        let trace = std::fs::read_to_string(root.join("logs/Coder.jsonl")).unwrap();
        assert!(trace.contains("\"terminated\""));
    }
}
