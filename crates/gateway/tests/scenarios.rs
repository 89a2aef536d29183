//! End-to-end scenarios through the HTTP surface, using the dry-run
//! command runner and the scripted language model.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;
use uuid::Uuid;

use af_agent::llm::{AgentReply, ScriptedModel};
use af_agent::{GraphDriver, ToolCall, ToolRegistry};
use af_domain::config::Config;
use af_domain::session::{ConversationStatus, SessionStatus};
use af_gateway::quota::QuotaLedger;
use af_gateway::state::AppState;
use af_gateway::{api, bootstrap};
use af_sandbox::Reaper;

async fn test_state(dir: &std::path::Path) -> AppState {
    let mut config = Config::default();
    config.workspace.state_path = dir.join("state");
    config.sandbox.image = "demo-sandbox:latest".into();
    bootstrap::build_state(Arc::new(config)).await.unwrap()
}

/// Swap in a scripted model for scenarios that need specific agent turns.
fn with_model(mut state: AppState, replies: Vec<AgentReply>) -> AppState {
    let driver = GraphDriver::new(
        ScriptedModel::new(replies),
        Arc::new(ToolRegistry::sandbox_defaults(None)),
        state.manager.clone(),
        state.conversations.clone(),
        state.bus.clone(),
        state.inbox.clone(),
        state.checkpointer.clone(),
        100,
    );
    state.driver = Arc::new(driver);
    state
}

fn app(state: AppState) -> Router {
    api::router(state.clone()).with_state(state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn wait_for_status(
    state: &AppState,
    id: &Uuid,
    wanted: ConversationStatus,
) -> ConversationStatus {
    for _ in 0..300 {
        let status = state.conversations.get(id).map(|c| c.status);
        if status == Some(wanted) {
            return wanted;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    state
        .conversations
        .get(id)
        .map(|c| c.status)
        .unwrap_or(ConversationStatus::Created)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 1 — happy-path exec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_exec() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let app = app(state);

    let (status, session) = send(
        &app,
        post_json(
            "/sandbox/sessions/",
            serde_json::json!({"image": "demo-sandbox:latest", "mode": "local"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["status"], "ready");
    assert_eq!(session["workspace_path"], "/workspace");
    let id = session["id"].as_str().unwrap().to_string();

    let (status, result) = send(
        &app,
        post_json(
            &format!("/sandbox/sessions/{id}/shell/"),
            serde_json::json!({"argv": ["echo", "hello"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["exit_code"], 0);
    assert!(result["stdout"].is_string());
    assert!(result["stderr"].is_string());
    assert!(result["duration_sec"].is_number());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 2 — idempotent provision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn idempotent_provision() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let app_router = app(state.clone());

    let (_, session) = send(
        &app_router,
        post_json("/sandbox/sessions/", serde_json::json!({})),
    )
    .await;
    let id: Uuid = session["id"].as_str().unwrap().parse().unwrap();
    let original_ref = session["backend_ref"].as_str().unwrap().to_string();

    // Simulated worker restart: provision again.
    let again = state.manager.provision(&id).await.unwrap();
    assert_eq!(again.backend_ref, original_ref);
    assert_eq!(again.status, SessionStatus::Ready);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 3 — snapshot then restore into a new session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn snapshot_then_restore() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let app = app(state.clone());

    let (_, session_a) = send(
        &app,
        post_json("/sandbox/sessions/", serde_json::json!({})),
    )
    .await;
    let id_a = session_a["id"].as_str().unwrap();

    let (status, _) = send(
        &app,
        post_json(
            &format!("/sandbox/sessions/{id_a}/upload/"),
            serde_json::json!({"path": "/workspace/foo.txt", "content": "alpha\n"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, snapshot) = send(
        &app,
        post_json(
            &format!("/sandbox/sessions/{id_a}/snapshot"),
            serde_json::json!({"label": "s1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(snapshot["label"], "s1");
    let snapshot_id = snapshot["id"].as_str().unwrap().to_string();

    // Session B restores from s1 during provisioning.
    let (status, session_b) = send(
        &app,
        post_json(
            "/sandbox/sessions/",
            serde_json::json!({"restore_snapshot_id": snapshot_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session_b["status"], "ready");
    assert_eq!(
        session_b["metadata"]["latest_snapshot_id"].as_str().unwrap(),
        snapshot_id
    );

    // Snapshot listing for A shows exactly one snapshot.
    let (_, listing) = send(&app, get(&format!("/sandbox/sessions/{id_a}/snapshots"))).await;
    assert_eq!(listing["count"], 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 4 — idle reaper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn idle_reaper_pass() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let app = app(state.clone());

    let (_, session) = send(
        &app,
        post_json("/sandbox/sessions/", serde_json::json!({})),
    )
    .await;
    let id: Uuid = session["id"].as_str().unwrap().parse().unwrap();

    state.manager.sessions().update(&id, |s| {
        s.idle_timeout_sec = Some(60);
        s.max_lifetime_sec = None;
        s.expires_at = None;
        let stale = chrono::Utc::now() - chrono::Duration::seconds(120);
        s.last_activity_at = Some(stale);
        s.last_heartbeat_at = Some(stale);
    });

    let reaper = Reaper::new(state.manager.clone(), Duration::from_secs(60));
    let report = reaper.run_pass(chrono::Utc::now()).await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.terminated, 1);

    let reaped = state.manager.sessions().get(&id).unwrap();
    assert_eq!(reaped.status, SessionStatus::Terminated);
    assert_eq!(
        reaped.metadata.get("terminated_reason").unwrap(),
        "idle_timeout"
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 5 — interrupt + resume with a human reply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn interrupt_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let state = with_model(
        state,
        vec![
            AgentReply::ToolCall(ToolCall {
                id: String::new(),
                name: "ask_user".into(),
                arguments: serde_json::json!({
                    "question": "PDF or PowerPoint?",
                    "choices": ["PDF", "PowerPoint"],
                }),
            }),
            AgentReply::Text("<final_answer>Exported as PDF.</final_answer>".into()),
        ],
    );
    let app = app(state.clone());

    let (status, conversation) = send(
        &app,
        post_json(
            "/astra-control/sessions/",
            serde_json::json!({"goal": "export the report"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id: Uuid = conversation["id"].as_str().unwrap().parse().unwrap();

    assert_eq!(
        wait_for_status(&state, &id, ConversationStatus::Paused).await,
        ConversationStatus::Paused
    );

    // The stream backlog carries the interrupt event with the question.
    let mut sub = state.bus.subscribe(id);
    let mut interrupt_description = None;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(300), sub.next()).await
    {
        if matches!(event.kind, af_domain::event::EventKind::Interrupt) {
            interrupt_description = event
                .payload
                .and_then(|p| p["description"].as_str().map(String::from));
            break;
        }
    }
    assert!(interrupt_description.unwrap().contains("PDF or PowerPoint?"));

    // Operator replies through the message endpoint.
    let (status, reply) = send(
        &app,
        post_json(
            &format!("/astra-control/sessions/{id}/message"),
            serde_json::json!({"message": "PDF"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["status"], "message sent to paused session");

    assert_eq!(
        wait_for_status(&state, &id, ConversationStatus::Completed).await,
        ConversationStatus::Completed
    );

    // The next agent invocation saw "PDF" as a human message.
    let checkpoint = state.checkpointer.load(&id).unwrap().unwrap();
    assert!(checkpoint.messages.iter().any(|m| matches!(
        m,
        af_agent::ChatMessage::User { content } if content == "PDF"
    )));

    let conversation = state.conversations.get(&id).unwrap();
    assert_eq!(conversation.summary, "Exported as PDF.");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 6 — computer-use policy block
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn computer_use_policy_block() {
    use af_agent::computer::{
        ComputerUseRunner, RunState, RunStatus, RunnerConfig, ScriptedDecisions, StubBrowser,
    };
    use af_agent::trace::TraceStore;
    use af_domain::config::ComputerUseConfig;

    let dir = tempfile::tempdir().unwrap();
    let store = TraceStore::new(dir.path(), 10);
    let mut trace = store.start_run("run-evil", &serde_json::json!({})).unwrap();

    let policy = ComputerUseConfig {
        allowed_domains: vec!["example.com".into()],
        ..ComputerUseConfig::default()
    };
    let provider = ScriptedDecisions::new(vec![serde_json::json!({
        "action": {"type": "visit_url", "url": "https://evil.com"},
    })]);
    let browser = StubBrowser::new();
    let mut runner = ComputerUseRunner {
        provider: &provider,
        browser: &browser,
        policy: &policy,
        config: RunnerConfig::default(),
        trace: &mut trace,
    };

    let (result, _state) = runner.run("visit evil", RunState::default()).await.unwrap();
    assert_eq!(result.status, RunStatus::BlockedPolicy);
    assert_eq!(result.stop_reason.as_deref(), Some("blocked_policy"));

    let timeline =
        std::fs::read_to_string(dir.path().join("run-evil/timeline.jsonl")).unwrap();
    let decision = timeline
        .lines()
        .find(|l| l.contains("policy_decision"))
        .expect("policy_decision traced");
    assert!(decision.contains("\"decision\":\"block\""));
    assert!(decision.contains("domain_blocked"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth scope (I8) and quotas
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn sessions_are_scoped_to_their_owner() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let app = app(state);

    let request = Request::builder()
        .method("POST")
        .uri("/sandbox/sessions/")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", "alice")
        .body(Body::from("{}"))
        .unwrap();
    let (status, session) = send(&app, request).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = session["id"].as_str().unwrap();

    // A different caller cannot see the session at all.
    let request = Request::builder()
        .uri(format!("/sandbox/sessions/{id}/"))
        .header("x-user-id", "mallory")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The owner can.
    let request = Request::builder()
        .uri(format!("/sandbox/sessions/{id}/"))
        .header("x-user-id", "alice")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn concurrent_sandbox_quota_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let state = bootstrap::with_quotas(
        state,
        QuotaLedger::new(af_domain::config::QuotaConfig {
            requests_per_month: None,
            concurrent_sandboxes: Some(1),
            sandboxes_per_month: None,
        }),
    );
    let app = app(state);

    let (status, _) = send(&app, post_json("/sandbox/sessions/", serde_json::json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) =
        send(&app, post_json("/sandbox/sessions/", serde_json::json!({}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("live sandboxes"));
}

#[tokio::test]
async fn terminate_endpoint_returns_no_content() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let app = app(state.clone());

    let (_, session) = send(&app, post_json("/sandbox/sessions/", serde_json::json!({}))).await;
    let id: Uuid = session["id"].as_str().unwrap().parse().unwrap();

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/sandbox/sessions/{id}/"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        state.manager.sessions().get(&id).unwrap().status,
        SessionStatus::Terminated
    );
}

#[tokio::test]
async fn screenshot_falls_back_to_placeholder_png() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let app = app(state);

    let (_, session) = send(&app, post_json("/sandbox/sessions/", serde_json::json!({}))).await;
    let id = session["id"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(get(&format!("/sandbox/sessions/{id}/screenshot")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/png"
    );
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    // PNG magic of the 1×1 placeholder.
    assert_eq!(&bytes[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
}

#[tokio::test]
async fn cancel_unblocks_a_paused_run() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let state = with_model(
        state,
        vec![AgentReply::ToolCall(ToolCall {
            id: String::new(),
            name: "ask_user".into(),
            arguments: serde_json::json!({"question": "continue?"}),
        })],
    );
    let app = app(state.clone());

    let (_, conversation) = send(
        &app,
        post_json(
            "/astra-control/sessions/",
            serde_json::json!({"goal": "never finishes"}),
        ),
    )
    .await;
    let id: Uuid = conversation["id"].as_str().unwrap().parse().unwrap();
    wait_for_status(&state, &id, ConversationStatus::Paused).await;

    let (status, _) = send(
        &app,
        post_json(
            &format!("/astra-control/sessions/{id}/cancel"),
            serde_json::json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        wait_for_status(&state, &id, ConversationStatus::Cancelled).await,
        ConversationStatus::Cancelled
    );
}
