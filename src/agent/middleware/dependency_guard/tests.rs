use super::*;
use crate::blackboard::CENTRAL_PLAN;
use futures_util::StreamExt;
use serde_json::json;

fn seeded_board() -> (tempfile::TempDir, Blackboard) {
    let dir = tempfile::tempdir().unwrap();
    let board = Blackboard::new(dir.path().join(".blackboard")).unwrap();
    let doc = format!(
        "---\nname: \"Central Plan\"\ndescription: \"d\"\nusage_policy: \"u\"\n---\n```json\n{}\n```\n",
        serde_json::to_string_pretty(&json!({
            "mission_goal": "m",
            "status": "IN_PROGRESS",
            "tasks": [
                {"id": 1, "type": "standard", "description": "research phase", "status": "IN_PROGRESS",
                 "assignees": ["Researcher"], "dependencies": []},
                {"id": 2, "type": "standard", "description": "write phase", "status": "BLOCKED",
                 "assignees": ["Writer"], "dependencies": [1]}
            ]
        }))
        .unwrap()
    );
    board.create_index(CENTRAL_PLAN, &doc).unwrap();
    (dir, board)
}

fn guard(board: &Blackboard) -> GuardInterceptor {
    GuardInterceptor {
        board: board.clone(),
        buffer: BTreeMap::new(),
    }
}

async fn run_through(
    interceptor: GuardInterceptor,
    chunks: Vec<StreamChunk>,
) -> Vec<StreamChunk> {
    let inner: ChunkStream = Box::pin(futures_util::stream::iter(chunks.into_iter().map(Ok)));
    intercept(inner, interceptor)
        .map(|r| r.unwrap())
        .collect()
        .await
}

fn assembled(calls: &[StreamChunk]) -> (String, serde_json::Value) {
    let delta = &calls[0].tool_calls[0];
    let args: serde_json::Value =
        serde_json::from_str(delta.arguments.as_deref().unwrap()).unwrap();
    (delta.name.clone().unwrap(), args)
}

#[tokio::test]
async fn claim_with_open_dependency_rewritten_to_wait() {
    let (_dir, board) = seeded_board();
    let chunks = vec![StreamChunk::tool_call(
        "call_1",
        "blackboard",
        json!({
            "operation": "update_task",
            "task_id": 2,
            "updates": {"status": "IN_PROGRESS"},
            "expected_checksum": "abc"
        })
        .to_string(),
        0,
    )];

    let out = run_through(guard(&board), chunks).await;
    let (name, args) = assembled(&out);
    assert_eq!(name, "wait");
    let reason = args["reason"].as_str().unwrap();
    assert!(reason.contains("BLOCKED BY GUARD"));
    assert!(reason.contains("Dependency Task 1"));
    // The rewritten call survives dispatch: id kept, arguments parseable.
    assert_eq!(out[0].tool_calls[0].id.as_deref(), Some("call_1"));
}

#[tokio::test]
async fn fragmented_call_is_reassembled_before_validation() {
    let (_dir, board) = seeded_board();
    let full = json!({
        "operation": "update_task",
        "task_id": 2,
        "updates": {"status": "IN_PROGRESS"},
        "expected_checksum": "abc"
    })
    .to_string();
    let (head, tail) = full.split_at(20);

    let chunks = vec![
        StreamChunk {
            content: None,
            tool_calls: vec![crate::providers::base::ToolCallDelta {
                index: 0,
                id: Some("call_2".to_string()),
                name: Some("blackboard".to_string()),
                arguments: Some(head.to_string()),
            }],
        },
        StreamChunk {
            content: None,
            tool_calls: vec![crate::providers::base::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments: Some(tail.to_string()),
            }],
        },
    ];

    let out = run_through(guard(&board), chunks).await;
    let (name, _) = assembled(&out);
    assert_eq!(name, "wait");
}

#[tokio::test]
async fn satisfied_dependency_passes_through() {
    let (_dir, board) = seeded_board();
    // Finish task 1 so task 2 becomes claimable (auto-unblock runs on write).
    let architect = crate::blackboard::AgentIdentity::new("Architect", true);
    let checksum = board.read_index(CENTRAL_PLAN).unwrap().checksum;
    let mut updates = serde_json::Map::new();
    updates.insert("status".to_string(), json!("DONE"));
    board
        .update_task(&architect, CENTRAL_PLAN, 1, &updates, &checksum)
        .unwrap();

    let chunks = vec![StreamChunk::tool_call(
        "call_3",
        "blackboard",
        json!({
            "operation": "update_task",
            "task_id": 2,
            "updates": {"status": "IN_PROGRESS"},
            "expected_checksum": "abc"
        })
        .to_string(),
        0,
    )];

    let out = run_through(guard(&board), chunks).await;
    let (name, args) = assembled(&out);
    assert_eq!(name, "blackboard");
    assert_eq!(args["operation"], "update_task");
}

#[tokio::test]
async fn multi_assignee_on_standard_task_rewritten() {
    let (_dir, board) = seeded_board();
    let chunks = vec![StreamChunk::tool_call(
        "call_4",
        "blackboard",
        json!({
            "operation": "update_task",
            "task_id": 1,
            "updates": {"assignees": ["A", "B"]},
            "expected_checksum": "abc"
        })
        .to_string(),
        0,
    )];

    let out = run_through(guard(&board), chunks).await;
    let (name, args) = assembled(&out);
    assert_eq!(name, "wait");
    assert!(args["reason"].as_str().unwrap().contains("multiple agents"));
}

#[tokio::test]
async fn unrelated_tools_pass_untouched() {
    let (_dir, board) = seeded_board();
    let chunks = vec![
        StreamChunk::token("thinking"),
        StreamChunk::tool_call("call_5", "wait", r#"{"duration": 2}"#, 0),
    ];

    let out = run_through(guard(&board), chunks).await;
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].content.as_deref(), Some("thinking"));
    let (name, _) = assembled(&out[1..]);
    assert_eq!(name, "wait");
}

#[tokio::test]
async fn parallel_calls_keep_their_indices() {
    let (_dir, board) = seeded_board();
    let chunks = vec![
        StreamChunk::tool_call("call_a", "wait", r#"{"duration": 1}"#, 0),
        StreamChunk::tool_call(
            "call_b",
            "blackboard",
            json!({"operation": "read_index", "filename": "central_plan.md"}).to_string(),
            1,
        ),
    ];

    let out = run_through(guard(&board), chunks).await;
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].tool_calls[0].index, 0);
    assert_eq!(out[1].tool_calls[0].index, 1);
    assert_eq!(out[1].tool_calls[0].name.as_deref(), Some("blackboard"));
}
