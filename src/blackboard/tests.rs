use super::*;
use serde_json::json;

fn test_board() -> (tempfile::TempDir, Blackboard) {
    let dir = tempfile::tempdir().unwrap();
    let board = Blackboard::new(dir.path().join(".blackboard")).unwrap();
    (dir, board)
}

fn plan_document(tasks: serde_json::Value) -> String {
    format!(
        "---\nname: \"Central Plan\"\ndescription: \"The task graph\"\nusage_policy: \"Architect writes; workers update their tasks\"\n---\n# Plan\n\n```json\n{}\n```\n",
        serde_json::to_string_pretty(&json!({
            "mission_goal": "test mission",
            "status": "IN_PROGRESS",
            "summary": "",
            "tasks": tasks
        }))
        .unwrap()
    )
}

fn seed_plan(board: &Blackboard) -> String {
    let doc = plan_document(json!([
        {"id": 1, "type": "standard", "description": "research", "status": "PENDING",
         "assignees": ["Researcher"], "dependencies": []},
        {"id": 2, "type": "standard", "description": "write", "status": "BLOCKED",
         "assignees": ["Writer"], "dependencies": [1]}
    ]));
    board.create_index(CENTRAL_PLAN, &doc).unwrap();
    board.read_index(CENTRAL_PLAN).unwrap().checksum
}

#[test]
fn create_then_read_round_trips_metadata() {
    let (_dir, board) = test_board();
    let doc = "---\nname: \"Timeline\"\ndescription: \"Event log\"\nusage_policy: \"append only\"\n---\nbody text\n";
    board.create_index("timeline.md", doc).unwrap();

    let read = board.read_index("timeline.md").unwrap();
    assert_eq!(read.metadata["name"], "Timeline");
    assert_eq!(read.metadata["usage_policy"], "append only");
    assert_eq!(read.body, "body text\n");
    assert_eq!(read.checksum, Blackboard::checksum(doc));
}

#[test]
fn create_requires_frontmatter_fields() {
    let (_dir, board) = test_board();
    let err = board
        .create_index("bad.md", "---\nname: \"x\"\n---\nbody\n")
        .unwrap_err();
    assert!(matches!(err, BlackboardError::MetadataIncomplete(_)));
    assert!(err.to_string().contains("description"));
}

#[test]
fn create_rejects_missing_delimiter() {
    let (_dir, board) = test_board();
    let err = board.create_index("bad.md", "no frontmatter").unwrap_err();
    assert!(matches!(err, BlackboardError::MetadataMissing));
}

#[test]
fn create_twice_fails() {
    let (_dir, board) = test_board();
    let doc = "---\nname: \"a\"\ndescription: \"b\"\nusage_policy: \"c\"\n---\nx\n";
    board.create_index("dup.md", doc).unwrap();
    let err = board.create_index("dup.md", doc).unwrap_err();
    assert!(matches!(err, BlackboardError::AlreadyExists(_)));
}

#[test]
fn filename_prefix_is_sanitized() {
    let (_dir, board) = test_board();
    let doc = "---\nname: \"a\"\ndescription: \"b\"\nusage_policy: \"c\"\n---\nx\n";
    board.create_index("global_indices/chan.md", doc).unwrap();
    assert!(board.read_index("chan.md").is_ok());
}

#[test]
fn list_indices_includes_metadata() {
    let (_dir, board) = test_board();
    let doc = "---\nname: \"Chan A\"\ndescription: \"d\"\nusage_policy: \"u\"\n---\nx\n";
    board.create_index("a.md", doc).unwrap();
    let list = board.list_indices().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["filename"], "a.md");
    assert_eq!(list[0]["name"], "Chan A");
}

#[test]
fn append_does_not_require_cas() {
    let (_dir, board) = test_board();
    let doc = "---\nname: \"a\"\ndescription: \"b\"\nusage_policy: \"c\"\n---\nstart";
    board.create_index("log.md", doc).unwrap();
    board.append_to_index("log.md", "entry one").unwrap();
    board.append_to_index("log.md", "\nentry two").unwrap();
    let read = board.read_index("log.md").unwrap();
    assert!(read.body.contains("entry one"));
    assert!(read.body.contains("entry two"));
}

#[test]
fn update_index_cas_mismatch_fails() {
    let (_dir, board) = test_board();
    let doc = "---\nname: \"a\"\ndescription: \"b\"\nusage_policy: \"c\"\n---\nv1\n";
    board.create_index("f.md", doc).unwrap();

    let err = board
        .update_index(
            "f.md",
            "---\nname: \"a\"\ndescription: \"b\"\nusage_policy: \"c\"\n---\nv2\n",
            "stale-checksum",
        )
        .unwrap_err();
    assert!(matches!(err, BlackboardError::CasConflict { .. }));

    // Content untouched after the failed write.
    assert_eq!(board.read_index("f.md").unwrap().body, "v1\n");
}

#[test]
fn update_index_cas_success_and_checksum_rotates() {
    let (_dir, board) = test_board();
    let doc = "---\nname: \"a\"\ndescription: \"b\"\nusage_policy: \"c\"\n---\nv1\n";
    board.create_index("f.md", doc).unwrap();
    let checksum = board.read_index("f.md").unwrap().checksum;

    let v2 = "---\nname: \"a\"\ndescription: \"b\"\nusage_policy: \"c\"\n---\nv2\n";
    board.update_index("f.md", v2, &checksum).unwrap();

    let read = board.read_index("f.md").unwrap();
    assert_eq!(read.body, "v2\n");
    assert_eq!(read.checksum, Blackboard::checksum(v2));
    assert_ne!(read.checksum, checksum);
}

#[test]
fn update_index_validates_central_plan() {
    let (_dir, board) = test_board();
    let checksum = seed_plan(&board);

    let broken = plan_document(json!([
        {"id": 1, "status": "PENDING", "dependencies": [42]}
    ]));
    let err = board.update_index(CENTRAL_PLAN, &broken, &checksum).unwrap_err();
    assert!(matches!(err, BlackboardError::InvalidPlan(_)));
    assert!(err.to_string().contains("non-existent task 42"));
}

#[test]
fn concurrent_cas_exactly_one_winner() {
    let (_dir, board) = test_board();
    let checksum = seed_plan(&board);
    let architect = AgentIdentity::new("Architect", true);

    let mut updates_a = serde_json::Map::new();
    updates_a.insert("status".to_string(), json!("IN_PROGRESS"));
    board
        .update_task(&architect, CENTRAL_PLAN, 1, &updates_a, &checksum)
        .unwrap();

    // Second writer holds the now-stale checksum.
    let mut updates_b = serde_json::Map::new();
    updates_b.insert("result_summary".to_string(), json!("late"));
    let err = board
        .update_task(&architect, CENTRAL_PLAN, 2, &updates_b, &checksum)
        .unwrap_err();
    assert!(matches!(err, BlackboardError::CasConflict { .. }));

    // Retry with a fresh read succeeds and both updates land.
    let fresh = board.read_index(CENTRAL_PLAN).unwrap().checksum;
    board
        .update_task(&architect, CENTRAL_PLAN, 2, &updates_b, &fresh)
        .unwrap();

    let plan = board.read_plan().unwrap().unwrap();
    assert_eq!(plan.task(1).unwrap().status, plan::TaskStatus::InProgress);
    assert_eq!(plan.task(2).unwrap().result_summary.as_deref(), Some("late"));
}

#[test]
fn worker_cannot_touch_foreign_task() {
    let (_dir, board) = test_board();
    let checksum = seed_plan(&board);
    let intruder = AgentIdentity::new("Researcher", false);

    let mut updates = serde_json::Map::new();
    updates.insert("result_summary".to_string(), json!("not mine"));
    let err = board
        .update_task(&intruder, CENTRAL_PLAN, 2, &updates, &checksum)
        .unwrap_err();
    assert!(matches!(err, BlackboardError::AccessDenied(_)));
}

#[test]
fn worker_can_claim_unassigned_task() {
    let (_dir, board) = test_board();
    let doc = plan_document(json!([
        {"id": 1, "status": "PENDING", "assignees": [], "dependencies": []}
    ]));
    board.create_index(CENTRAL_PLAN, &doc).unwrap();
    let checksum = board.read_index(CENTRAL_PLAN).unwrap().checksum;

    let worker = AgentIdentity::new("Coder", false);
    let mut updates = serde_json::Map::new();
    updates.insert("status".to_string(), json!("IN_PROGRESS"));
    updates.insert("assignees".to_string(), json!(["Coder"]));
    board
        .update_task(&worker, CENTRAL_PLAN, 1, &updates, &checksum)
        .unwrap();

    let plan = board.read_plan().unwrap().unwrap();
    assert_eq!(plan.task(1).unwrap().assignees, vec!["Coder"]);
}

#[test]
fn worker_transition_table_enforced() {
    let (_dir, board) = test_board();
    let doc = plan_document(json!([
        {"id": 1, "status": "DONE", "assignees": ["Coder"], "dependencies": []}
    ]));
    board.create_index(CENTRAL_PLAN, &doc).unwrap();
    let checksum = board.read_index(CENTRAL_PLAN).unwrap().checksum;

    let worker = AgentIdentity::new("Coder", false);
    let mut updates = serde_json::Map::new();
    updates.insert("status".to_string(), json!("PENDING"));
    let err = board
        .update_task(&worker, CENTRAL_PLAN, 1, &updates, &checksum)
        .unwrap_err();
    assert!(matches!(err, BlackboardError::Transition(_)));

    // Failed call leaves the plan byte-identical.
    assert_eq!(board.read_index(CENTRAL_PLAN).unwrap().checksum, checksum);
}

#[test]
fn update_task_auto_unblocks_in_same_window() {
    let (_dir, board) = test_board();
    let doc = plan_document(json!([
        {"id": 1, "status": "DONE", "assignees": ["A"], "dependencies": []},
        {"id": 2, "status": "BLOCKED", "assignees": ["B"], "dependencies": [1]}
    ]));
    board.create_index(CENTRAL_PLAN, &doc).unwrap();
    let checksum = board.read_index(CENTRAL_PLAN).unwrap().checksum;

    // Any update_task pass runs auto-fix: task 2 comes back PENDING even
    // though the patch only touches task 1.
    let architect = AgentIdentity::new("Architect", true);
    let mut updates = serde_json::Map::new();
    updates.insert("result_summary".to_string(), json!("done earlier"));
    board
        .update_task(&architect, CENTRAL_PLAN, 1, &updates, &checksum)
        .unwrap();

    let plan = board.read_plan().unwrap().unwrap();
    assert_eq!(plan.task(2).unwrap().status, plan::TaskStatus::Pending);
}

#[test]
fn notifications_append_and_tail() {
    let (_dir, board) = test_board();
    for i in 0..30 {
        board.append_notification(&format!("\n- event {}", i)).unwrap();
    }
    let tail = board.tail_notifications(5, 5000).unwrap().unwrap();
    assert!(tail.contains("event 29"));
    assert!(!tail.contains("event 10"));
}

#[test]
fn notifications_tail_char_bound() {
    let (_dir, board) = test_board();
    board
        .append_notification(&format!("\n- {}", "x".repeat(400)))
        .unwrap();
    let tail = board.tail_notifications(20, 100).unwrap().unwrap();
    assert!(tail.starts_with("...[Older notifications truncated]"));
}

#[test]
fn templates_listing_and_confinement() {
    let dir = tempfile::tempdir().unwrap();
    let templates = dir.path().join("blackboard_templates");
    std::fs::create_dir_all(&templates).unwrap();
    std::fs::write(templates.join("report.md"), "# Report template").unwrap();

    let board = Blackboard::new(dir.path().join(".blackboard")).unwrap();
    assert_eq!(board.list_templates().unwrap(), vec!["report.md"]);
    assert_eq!(board.read_template("report.md").unwrap(), "# Report template");
    assert!(board.read_template("../secrets.md").is_err());
}

#[test]
fn list_resources_recurses() {
    let (_dir, board) = test_board();
    std::fs::create_dir_all(board.resources_dir().join("sub")).unwrap();
    std::fs::write(board.resources_dir().join("a.txt"), "x").unwrap();
    std::fs::write(board.resources_dir().join("sub/b.txt"), "y").unwrap();
    let resources = board.list_resources().unwrap();
    assert_eq!(resources, vec!["a.txt", "sub/b.txt"]);
}

#[test]
fn run_auto_fix_persists() {
    let (_dir, board) = test_board();
    let doc = plan_document(json!([
        {"id": 1, "status": "DONE", "dependencies": []},
        {"id": 2, "status": "BLOCKED", "dependencies": [1]}
    ]));
    board.create_index(CENTRAL_PLAN, &doc).unwrap();

    assert!(board.run_auto_fix().unwrap());
    let plan = board.read_plan().unwrap().unwrap();
    assert_eq!(plan.task(2).unwrap().status, plan::TaskStatus::Pending);

    // Second pass is a no-op.
    assert!(!board.run_auto_fix().unwrap());
}
