//! End-to-end runs of the orchestration core against scripted agents.

use std::sync::Arc;
use std::time::Duration;

use morf_kernel::agent::AgentKind;
use morf_kernel::error::FailureKind;
use morf_kernel::policy::{AgentPolicy, BreakerConfig, PolicySet, RetryConfig};
use morf_kernel::session::{ConversionSession, SessionState};
use morf_kernel::storage::DynBlobStore;
use morf_kernel::workflow::{WorkflowDefinition, WorkflowStep};
use morf_runtime::breaker::BreakerState;
use morf_runtime::memory::MemoryBlobStore;
use morf_runtime::scheduler::ExecutionEvent;
use morf_runtime::{RuntimeConfig, SessionManager};

use morf_testing::agents::{AskingAgent, EchoAgent, FlakyAgent, SlowAgent};
use morf_testing::init_tracing;

async fn wait_until<F>(manager: &SessionManager, session_id: &str, pred: F) -> ConversionSession
where
    F: Fn(&ConversionSession) -> bool,
{
    for _ in 0..400 {
        if let Some(snap) = manager.get_status(session_id).await {
            if pred(&snap) {
                return snap;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session '{session_id}' never reached the awaited condition");
}

async fn wait_terminal(manager: &SessionManager, session_id: &str) -> ConversionSession {
    wait_until(manager, session_id, |s| s.state.is_terminal()).await
}

fn full_pipeline() -> WorkflowDefinition {
    WorkflowDefinition::builder("convert-to-nwb")
        .step(WorkflowStep::new("detect", AgentKind::Conversation))
        .step(WorkflowStep::new("collect", AgentKind::MetadataQuestioner))
        .step(
            WorkflowStep::new("convert", AgentKind::Conversion)
                .with_retry(RetryConfig::fixed(3, 10)),
        )
        .step(WorkflowStep::new("evaluate", AgentKind::Evaluation))
        .dependency("detect", "collect")
        .dependency("collect", "convert")
        .dependency("convert", "evaluate")
        .build()
        .unwrap()
}

#[tokio::test]
async fn flaky_conversion_retries_then_completes() {
    init_tracing();
    let manager = SessionManager::new(RuntimeConfig::default());
    let convert = Arc::new(FlakyAgent::new(AgentKind::Conversion, 2));
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversation)));
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::MetadataQuestioner)));
    manager.register_agent(Arc::clone(&convert) as _);
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Evaluation)));
    manager.register_workflow(full_pipeline());

    let session_id = manager
        .start("convert-to-nwb", serde_json::json!({"path": "/data/in.csv"}))
        .await
        .unwrap();
    let snap = wait_terminal(&manager, &session_id).await;

    assert_eq!(snap.state, SessionState::Completed);
    assert_eq!(convert.calls(), 3);

    let result = &snap.step_results["convert"];
    assert_eq!(result.attempts, 3);
    assert_eq!(result.retry_count, 2);
    assert_eq!(result.output.as_ref().unwrap()["attempts_used"], 3);

    // The provenance trail carries the same attempt accounting.
    let graph = manager.export_provenance(&session_id).unwrap();
    let activity = &graph["activities"]["activity:convert"];
    assert_eq!(activity["attributes"]["attempt_number"], 3);
    assert_eq!(activity["attributes"]["retry_count"], 2);
}

#[tokio::test]
async fn required_failure_finalizes_with_structured_failure() {
    init_tracing();
    let manager = SessionManager::new(RuntimeConfig::default());
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversation)));
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::MetadataQuestioner)));
    manager.register_agent(Arc::new(FlakyAgent::permanent(AgentKind::Conversion)));
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Evaluation)));
    manager.register_workflow(full_pipeline());

    let session_id = manager
        .start("convert-to-nwb", serde_json::json!({}))
        .await
        .unwrap();
    let snap = wait_terminal(&manager, &session_id).await;

    assert_eq!(snap.state, SessionState::Failed);
    let failure = snap.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.step_id.as_deref(), Some("convert"));
    assert_eq!(failure.agent, Some(AgentKind::Conversion));
    assert!(failure.message.contains("scripted permanent failure"));
    // The evaluation step downstream of the failure never ran.
    assert!(!snap.step_results.contains_key("evaluate"));
}

#[tokio::test]
async fn optional_failure_is_tolerated() {
    init_tracing();
    let manager = SessionManager::new(RuntimeConfig::default());
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversion)));
    manager.register_agent(Arc::new(FlakyAgent::permanent(AgentKind::Evaluation)));
    manager.register_workflow(
        WorkflowDefinition::builder("tolerant")
            .step(WorkflowStep::new("convert", AgentKind::Conversion))
            .step(
                WorkflowStep::new("evaluate", AgentKind::Evaluation)
                    .with_retry(RetryConfig::none())
                    .optional(),
            )
            .dependency("convert", "evaluate")
            .build()
            .unwrap(),
    );

    let session_id = manager.start("tolerant", serde_json::json!({})).await.unwrap();
    let snap = wait_terminal(&manager, &session_id).await;

    assert_eq!(snap.state, SessionState::Completed);
    assert!(snap.step_results["convert"].is_success());
    assert!(!snap.step_results["evaluate"].is_success());
}

#[tokio::test]
async fn suspension_resumes_on_user_input() {
    init_tracing();
    let manager = SessionManager::new(RuntimeConfig::default());
    let asking = Arc::new(AskingAgent::new("Which species was recorded?"));
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversation)));
    manager.register_agent(Arc::clone(&asking) as _);
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversion)));
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Evaluation)));
    manager.register_workflow(full_pipeline());

    let session_id = manager
        .start("convert-to-nwb", serde_json::json!({}))
        .await
        .unwrap();

    let suspended = wait_until(&manager, &session_id, |s| {
        s.state == SessionState::Suspended
    })
    .await;
    assert_eq!(
        suspended.pending_prompt.as_deref(),
        Some("Which species was recorded?")
    );

    assert!(
        manager
            .supply_user_input(&session_id, serde_json::json!({"species": "mouse"}))
            .await
    );
    let snap = wait_terminal(&manager, &session_id).await;

    assert_eq!(snap.state, SessionState::Completed);
    assert_eq!(asking.calls(), 2);
    assert_eq!(
        snap.step_results["collect"].output.as_ref().unwrap()["metadata"]["species"],
        "mouse"
    );
    assert!(snap.pending_prompt.is_none());
}

#[tokio::test]
async fn cancel_while_suspended_is_immediate() {
    init_tracing();
    let manager = SessionManager::new(RuntimeConfig::default());
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversation)));
    manager.register_agent(Arc::new(AskingAgent::new("Which species?")));
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversion)));
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Evaluation)));
    manager.register_workflow(full_pipeline());

    let session_id = manager
        .start("convert-to-nwb", serde_json::json!({}))
        .await
        .unwrap();
    wait_until(&manager, &session_id, |s| s.state == SessionState::Suspended).await;

    assert!(manager.cancel(&session_id).await);
    let snap = manager.get_status(&session_id).await.unwrap();
    assert_eq!(snap.state, SessionState::Cancelled);
    assert_eq!(snap.failure.unwrap().kind, FailureKind::Cancelled);

    // Cancelling a finalized session is a no-op.
    assert!(!manager.cancel(&session_id).await);
    // So is answering it.
    assert!(
        !manager
            .supply_user_input(&session_id, serde_json::json!("late"))
            .await
    );
}

#[tokio::test]
async fn open_breaker_fails_fast_without_contacting_the_agent() {
    init_tracing();
    let policies = PolicySet::default().with_override(
        AgentKind::Conversion,
        AgentPolicy {
            timeout_ms: 5_000,
            retry: RetryConfig::none(),
            breaker: BreakerConfig {
                failure_threshold: 1,
                cooldown_ms: 60_000,
            },
        },
    );
    let manager = SessionManager::new(RuntimeConfig {
        policies,
        ..RuntimeConfig::default()
    });
    let convert = Arc::new(FlakyAgent::permanent(AgentKind::Conversion));
    manager.register_agent(Arc::clone(&convert) as _);
    manager.register_workflow(
        WorkflowDefinition::builder("convert-only")
            .step(WorkflowStep::new("convert", AgentKind::Conversion))
            .build()
            .unwrap(),
    );

    let first = manager
        .start("convert-only", serde_json::json!({}))
        .await
        .unwrap();
    let snap = wait_terminal(&manager, &first).await;
    assert_eq!(snap.state, SessionState::Failed);
    assert_eq!(convert.calls(), 1);
    assert_eq!(
        manager.breaker_states().await[&AgentKind::Conversion],
        BreakerState::Open
    );

    // Second session is rejected at the gate; the agent is never called.
    let second = manager
        .start("convert-only", serde_json::json!({}))
        .await
        .unwrap();
    let snap = wait_terminal(&manager, &second).await;
    assert_eq!(snap.state, SessionState::Failed);
    assert!(snap.failure.unwrap().message.contains("Circuit open"));
    assert_eq!(convert.calls(), 1);

    // An operator override re-admits traffic.
    manager.force_close_breaker(AgentKind::Conversion).await;
    assert_eq!(
        manager.breaker_states().await[&AgentKind::Conversion],
        BreakerState::Closed
    );
}

#[tokio::test]
async fn input_request_outside_metadata_fails_the_step() {
    init_tracing();
    let manager = SessionManager::new(RuntimeConfig::default());
    manager.register_agent(Arc::new(AskingAgent::with_kind(
        AgentKind::Conversion,
        "cannot proceed",
    )));
    manager.register_workflow(
        WorkflowDefinition::builder("misdirected")
            .step(
                WorkflowStep::new("convert", AgentKind::Conversion)
                    .with_retry(RetryConfig::none()),
            )
            .build()
            .unwrap(),
    );

    let session_id = manager
        .start("misdirected", serde_json::json!({}))
        .await
        .unwrap();
    let snap = wait_terminal(&manager, &session_id).await;

    // The conversion agent asking for input is a fault, not a completion.
    assert_eq!(snap.state, SessionState::Failed);
    assert!(!snap.step_results["convert"].is_success());
    let failure = snap.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.step_id.as_deref(), Some("convert"));
    assert!(failure.message.contains("outside the metadata phase"));
}

#[tokio::test]
async fn resume_from_checkpoint_skips_completed_steps() {
    init_tracing();
    let blobs: DynBlobStore = MemoryBlobStore::shared();

    // First manager runs until the metadata question suspends the session.
    let first = SessionManager::with_blob_store(RuntimeConfig::default(), Arc::clone(&blobs));
    first.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversation)));
    first.register_agent(Arc::new(AskingAgent::new("Which species?")));
    first.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversion)));
    first.register_agent(Arc::new(EchoAgent::new(AgentKind::Evaluation)));
    first.register_workflow(full_pipeline());

    let session_id = first
        .start("convert-to-nwb", serde_json::json!({"path": "/data/in.csv"}))
        .await
        .unwrap();
    wait_until(&first, &session_id, |s| s.state == SessionState::Suspended).await;
    first.shutdown();

    // Second manager shares the blob store and picks the session back up.
    // Its metadata agent answers without asking, so the run completes.
    let second = SessionManager::with_blob_store(RuntimeConfig::default(), blobs);
    let detect = Arc::new(FlakyAgent::new(AgentKind::Conversation, 0));
    second.register_agent(Arc::clone(&detect) as _);
    second.register_agent(Arc::new(EchoAgent::new(AgentKind::MetadataQuestioner)));
    second.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversion)));
    second.register_agent(Arc::new(EchoAgent::new(AgentKind::Evaluation)));
    second.register_workflow(full_pipeline());

    let restored = second.resume(&session_id).await.unwrap();
    assert_eq!(restored.state, SessionState::Suspended);
    assert!(restored.step_results.contains_key("detect"));

    let snap = wait_terminal(&second, &session_id).await;
    assert_eq!(snap.state, SessionState::Completed);
    assert_eq!(snap.step_results.len(), 4);
    // The detect step's checkpointed result was reused, not re-executed.
    assert_eq!(detect.calls(), 0);
}

#[tokio::test]
async fn step_timeout_fails_the_session_as_timeout() {
    init_tracing();
    let manager = SessionManager::new(RuntimeConfig::default());
    manager.register_agent(Arc::new(SlowAgent::new(
        AgentKind::Conversion,
        Duration::from_millis(300),
    )));
    manager.register_workflow(
        WorkflowDefinition::builder("slow")
            .step(
                WorkflowStep::new("convert", AgentKind::Conversion)
                    .with_timeout_ms(30)
                    .with_retry(RetryConfig::none()),
            )
            .build()
            .unwrap(),
    );

    let session_id = manager.start("slow", serde_json::json!({})).await.unwrap();
    let snap = wait_terminal(&manager, &session_id).await;

    assert_eq!(snap.state, SessionState::Failed);
    let failure = snap.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(failure.message.contains("timed out"));
}

#[tokio::test]
async fn expiry_sweep_force_fails_and_archives() {
    init_tracing();
    let manager = SessionManager::new(RuntimeConfig {
        archive_after_ms: 0,
        checkpoint_keep_last: Some(1),
        maintenance_interval_ms: 20,
        ..RuntimeConfig::default()
    });
    manager.register_agent(Arc::new(SlowAgent::new(
        AgentKind::Conversion,
        Duration::from_millis(500),
    )));
    manager.register_workflow(
        WorkflowDefinition::builder("overdue")
            .step(WorkflowStep::new("convert", AgentKind::Conversion))
            .global_timeout_ms(40)
            .build()
            .unwrap(),
    );
    let sweep = manager.spawn_maintenance();

    let session_id = manager.start("overdue", serde_json::json!({})).await.unwrap();
    let snap = wait_terminal(&manager, &session_id).await;
    assert_eq!(snap.state, SessionState::Failed);
    assert_eq!(snap.failure.unwrap().kind, FailureKind::Timeout);
    // The interrupted invocation's result was discarded, not recorded.
    assert!(!snap.step_results.contains_key("convert"));

    // The next sweep archives the terminal session and prunes history.
    for _ in 0..100 {
        if manager.get_status(&session_id).await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(manager.get_status(&session_id).await.is_none());
    let checkpoints = manager.checkpoints().list(&session_id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].state, SessionState::Failed);

    sweep.stop().await;
}

#[tokio::test]
async fn observed_sessions_stream_execution_events() {
    init_tracing();
    let manager = SessionManager::new(RuntimeConfig::default());
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversation)));
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversion)));
    manager.register_workflow(
        WorkflowDefinition::builder("observed")
            .step(WorkflowStep::new("detect", AgentKind::Conversation))
            .step(WorkflowStep::new("convert", AgentKind::Conversion))
            .dependency("detect", "convert")
            .build()
            .unwrap(),
    );

    let (session_id, mut events) = manager
        .start_observed("observed", serde_json::json!({}))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let done = event == ExecutionEvent::SessionCompleted;
        seen.push(event);
        if done {
            break;
        }
    }

    assert!(seen.iter().any(|e| matches!(
        e,
        ExecutionEvent::StepStarted { step_id, .. } if step_id == "detect"
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        ExecutionEvent::StepCompleted { step_id } if step_id == "convert"
    )));
    assert_eq!(seen.last(), Some(&ExecutionEvent::SessionCompleted));

    let snap = manager.get_status(&session_id).await.unwrap();
    assert_eq!(snap.state, SessionState::Completed);
}

#[tokio::test]
async fn health_and_utilization_are_observable() {
    init_tracing();
    let manager = SessionManager::new(RuntimeConfig::default());
    manager.register_agent(Arc::new(EchoAgent::new(AgentKind::Conversion)));

    let health = manager.agent_health().await;
    assert_eq!(health.len(), 1);

    let utilization = manager.utilization();
    assert_eq!(utilization.slots_in_use, 0);
    assert_eq!(utilization.memory_in_use_mb, 0);
}
