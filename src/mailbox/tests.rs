use super::*;

fn test_mailbox() -> (tempfile::TempDir, Mailbox) {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = Mailbox::new(dir.path()).unwrap();
    (dir, mailbox)
}

#[test]
fn push_then_drain_marks_read() {
    let (_dir, mailbox) = test_mailbox();
    mailbox
        .push("Coder", MailMessage::new("please prioritize task 3"))
        .unwrap();

    let drained = mailbox.drain_unread("Coder").unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].content, "please prioritize task 3");
    assert_eq!(drained[0].status, "read");
    assert!(drained[0].read_time.is_some());

    // Second drain finds nothing unread.
    assert!(mailbox.drain_unread("Coder").unwrap().is_empty());
}

#[test]
fn drain_preserves_order() {
    let (_dir, mailbox) = test_mailbox();
    mailbox.push("Coder", MailMessage::new("first")).unwrap();
    mailbox.push("Coder", MailMessage::new("second")).unwrap();

    let drained = mailbox.drain_unread("Coder").unwrap();
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].content, "first");
    assert_eq!(drained[1].content, "second");
}

#[test]
fn drain_missing_mailbox_is_empty() {
    let (_dir, mailbox) = test_mailbox();
    assert!(mailbox.drain_unread("Nobody").unwrap().is_empty());
}

#[test]
fn legacy_single_message_object_is_accepted() {
    let (_dir, mailbox) = test_mailbox();
    let legacy = serde_json::json!({
        "timestamp": "2025-01-01T00:00:00Z",
        "role": "user",
        "content": "legacy format",
        "status": "unread"
    });
    std::fs::write(mailbox.path_for("Old"), legacy.to_string()).unwrap();

    let drained = mailbox.drain_unread("Old").unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].content, "legacy format");
}

#[test]
fn typed_message_round_trips_extras() {
    let (_dir, mailbox) = test_mailbox();
    let msg = MailMessage::new("worker stopped")
        .from_agent("Coder")
        .typed("max_iterations_reached")
        .with_extra("in_progress_count", serde_json::json!(2));
    mailbox.push("Watchdog", msg).unwrap();

    let raw = std::fs::read_to_string(mailbox.path_for("Watchdog")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed[0]["type"], "max_iterations_reached");
    assert_eq!(parsed[0]["from"], "Coder");
    assert_eq!(parsed[0]["in_progress_count"], 2);
}

mod requests {
    use super::*;

    fn test_manager() -> (tempfile::TempDir, RequestManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = RequestManager::new(dir.path()).unwrap();
        (dir, manager)
    }

    #[test]
    fn create_and_list_pending() {
        let (_dir, manager) = test_manager();
        let id = manager
            .create_request("Coder", "bash", "rm -rf build/", "clean rebuild")
            .unwrap();

        let pending = manager.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].agent_name, "Coder");
        assert_eq!(pending[0].status, STATUS_PENDING);
    }

    #[test]
    fn update_status_resolves_request() {
        let (_dir, manager) = test_manager();
        let id = manager.create_request("Coder", "bash", "ls", "").unwrap();
        manager.update_status(&id, STATUS_APPROVED).unwrap();

        assert!(manager.list_pending().is_empty());
    }

    #[test]
    fn pending_sorted_by_timestamp() {
        let (_dir, manager) = test_manager();
        let first = manager.create_request("A", "bash", "x", "").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let second = manager.create_request("B", "bash", "y", "").unwrap();

        let pending = manager.list_pending();
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[1].id, second);
    }

    #[tokio::test]
    async fn wait_observes_approval() {
        let (_dir, manager) = test_manager();
        let id = manager.create_request("Coder", "write_file", "/tmp/x", "").unwrap();

        let waiter = manager.clone();
        let wait_id = id.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_response(&wait_id, Duration::from_secs(10))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.update_status(&id, STATUS_APPROVED).unwrap();

        assert_eq!(handle.await.unwrap(), STATUS_APPROVED);
    }

    #[tokio::test]
    async fn wait_times_out_as_denial() {
        let (_dir, manager) = test_manager();
        let id = manager.create_request("Coder", "bash", "sudo rm", "").unwrap();
        let status = manager
            .wait_for_response(&id, Duration::from_millis(50))
            .await;
        assert_eq!(status, STATUS_TIMEOUT);
    }

    #[tokio::test]
    async fn wait_on_missing_file_errors() {
        let (_dir, manager) = test_manager();
        let status = manager
            .wait_for_response("no-such-id", Duration::from_millis(50))
            .await;
        assert_eq!(status, "ERROR_FILE_MISSING");
    }
}
