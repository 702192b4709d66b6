mod support;

use futures::StreamExt;
use probe_agent::testing::{ScriptedExecutor, ScriptedReasoner};
use probe_eventlog::{EventKind, EventSource, SessionStatus};
use probe_graph::{
    AbandonedRange, Checkpointer, GraphConfig, GraphNode, MemoryCheckpointer, Reconciliation,
    SessionError, SessionManager, SessionManagerConfig, StepResult, StepStatus, ThreadState,
};
use std::sync::Arc;
use std::time::Duration;
use support::{Deployment, FlakyBackend, FlakyCheckpointer, click, finish};
use tokio_util::sync::CancellationToken;

fn slow_browser(delay: Duration) -> Deployment {
    Deployment::in_memory().browser(
        ScriptedExecutor::always_succeeding().with_delay(delay),
        two_step_script(),
    )
}

fn two_step_script() -> ScriptedReasoner {
    ScriptedReasoner::new(vec![
        Ok(click("#a")),
        Ok(finish("first")),
        Ok(click("#b")),
        Ok(finish("second")),
    ])
}

async fn resume_and_post(
    manager: &SessionManager,
    session_id: &str,
    message: &str,
) -> Result<StepResult, SessionError> {
    manager.resume_session(session_id).await?;
    manager.post_message(session_id, message).await
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn concurrent_posts_same_session_expected_one_concurrent_modification() {
    let deployment = slow_browser(Duration::from_millis(200));
    let manager = deployment.manager();
    let session_id = manager.create_session().await.expect("session");

    let (first, second) = tokio::join!(
        manager.post_message(&session_id, "click a"),
        manager.post_message(&session_id, "click b"),
    );

    let first = first.expect("first post should win the lease");
    assert_eq!(first.status, StepStatus::Completed);
    assert!(matches!(
        second,
        Err(SessionError::ConcurrentModification { .. })
    ));

    let view = manager.state(&session_id).await.expect("state");
    assert_eq!(view.thread.version, 1);
    assert_eq!(view.thread.messages, vec!["click a".to_string()]);
    assert_eq!(view.event_count, 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn lease_wait_serializes_posts_on_same_session() {
    let mut deployment = slow_browser(Duration::from_millis(200));
    deployment.session = SessionManagerConfig {
        lease_wait_ms: 60_000,
    };
    let manager = deployment.manager();
    let session_id = manager.create_session().await.expect("session");

    let (first, second) = tokio::join!(
        manager.post_message(&session_id, "click a"),
        manager.post_message(&session_id, "click b"),
    );
    let first = first.expect("first post");
    let second = second.expect("second post");

    assert_eq!(first.thread.version, 1);
    assert_eq!(second.thread.version, 2);
    let positions: Vec<_> = first
        .events
        .iter()
        .chain(second.events.iter())
        .map(|event| event.position)
        .collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn posts_on_different_sessions_run_in_parallel() {
    let deployment = Deployment::in_memory();
    let manager = Arc::new(deployment.manager());
    let mut sessions = Vec::new();
    for _ in 0..4 {
        sessions.push(manager.create_session().await.expect("session"));
    }

    let mut handles = Vec::new();
    for session_id in sessions.clone() {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.post_message(&session_id, "review the session").await
        }));
    }
    for handle in handles {
        let step = handle
            .await
            .expect("task should join")
            .expect("step should commit");
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.thread.version, 1);
    }

    let mut listed = manager.session_ids();
    listed.sort();
    sessions.sort();
    assert_eq!(listed, sessions);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cancel_step_mid_action_expected_nothing_committed() {
    let deployment = slow_browser(Duration::from_secs(10));
    let manager = deployment.manager();
    let session_id = manager.create_session().await.expect("session");

    let (posted, cancelled) = tokio::join!(
        manager.post_message(&session_id, "click a"),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            manager.cancel_step(&session_id)
        }
    );

    assert!(cancelled.expect("cancel should find the session"));
    assert!(matches!(posted, Err(SessionError::Cancelled)));
    // The in-flight action finished before the step was abandoned.
    assert_eq!(deployment.browser_executor.executed().len(), 1);

    let view = manager.state(&session_id).await.expect("state");
    assert_eq!(view.event_count, 0);
    assert_eq!(view.thread.version, 0);
    assert!(
        deployment
            .checkpointer
            .load_committed(&session_id)
            .await
            .expect("load")
            .is_none()
    );
    assert!(!manager.cancel_step(&session_id).expect("session"));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn caller_token_cancelled_before_step_expected_cancelled() {
    let deployment = slow_browser(Duration::from_millis(10));
    let manager = deployment.manager();
    let session_id = manager.create_session().await.expect("session");
    let token = CancellationToken::new();
    token.cancel();

    let error = manager
        .post_message_with_cancel(&session_id, "click a", token)
        .await
        .expect_err("cancelled step should fail");
    assert!(matches!(error, SessionError::Cancelled));
    assert!(deployment.browser_executor.executed().is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn worker_timeout_expected_committed_timeout_failure() {
    let mut deployment = Deployment::in_memory().browser(
        ScriptedExecutor::always_succeeding().with_delay(Duration::from_secs(10)),
        ScriptedReasoner::repeating(click("#slow")),
    );
    deployment.graph = GraphConfig {
        worker_timeout_ms: 100,
        ..GraphConfig::default()
    };
    let manager = deployment.manager();
    let session_id = manager.create_session().await.expect("session");

    let step = manager
        .post_message(&session_id, "click slow")
        .await
        .expect("timeout should commit a failure");

    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.error_type(), Some("Timeout"));
    assert_eq!(step.events.len(), 1);
    assert_eq!(step.events[0].kind(), Some(EventKind::Failure));
    assert_eq!(step.thread.node, GraphNode::Failed);
    assert_eq!(
        manager.state(&session_id).await.expect("state").event_count,
        1
    );
}

#[tokio::test(flavor = "current_thread")]
async fn stream_from_position_resumes_and_ends_on_close() {
    let deployment = slow_browser(Duration::from_millis(1));
    let manager = deployment.manager();
    let session_id = manager.create_session().await.expect("session");
    manager
        .post_message(&session_id, "click a")
        .await
        .expect("first step");

    let live = manager.stream_events(&session_id, 2).expect("stream");
    let collector = tokio::spawn(async move {
        live.map(|event| (event.position, event.kind()))
            .collect::<Vec<_>>()
            .await
    });
    manager
        .post_message(&session_id, "click b")
        .await
        .expect("second step");

    // Reconnect from the last acknowledged position.
    let replayed: Vec<_> = manager
        .stream_events(&session_id, 1)
        .expect("stream")
        .take(3)
        .map(|event| event.position)
        .collect()
        .await;
    assert_eq!(replayed, vec![1, 2, 3]);

    manager.close_session(&session_id).expect("close");
    let delivered = collector.await.expect("collector should join");
    assert_eq!(
        delivered,
        vec![
            (2, Some(EventKind::Action)),
            (3, Some(EventKind::Observation)),
        ]
    );

    assert!(matches!(
        manager.stream_events(&session_id, 0),
        Err(SessionError::NotFound(_))
    ));
    let view = manager
        .resume_session(&session_id)
        .await
        .expect("closed session should resume");
    assert_eq!(view.event_count, 4);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn racing_resumes_share_one_lease() {
    let backend = Arc::new(FlakyBackend::new());
    let deployment = Deployment::with_storage(backend, Arc::new(MemoryCheckpointer::new()))
        .browser(
            ScriptedExecutor::always_succeeding().with_delay(Duration::from_millis(200)),
            two_step_script(),
        );
    let manager = deployment.manager();
    let session_id = manager.create_session().await.expect("session");
    manager.close_session(&session_id).expect("close");

    let (first, second) = tokio::join!(
        resume_and_post(&manager, &session_id, "click a"),
        resume_and_post(&manager, &session_id, "click b"),
    );

    assert_eq!(first.expect("first post").status, StepStatus::Completed);
    assert!(matches!(
        second,
        Err(SessionError::ConcurrentModification { .. })
    ));
    // The losing post never reached a worker.
    assert_eq!(deployment.browser_executor.executed().len(), 1);
    assert_eq!(manager.session_ids(), vec![session_id.clone()]);

    let stream = manager.stream_events(&session_id, 0).expect("stream");
    manager.close_session(&session_id).expect("close");
    let positions: Vec<_> = stream.map(|event| event.position).collect().await;
    assert_eq!(positions, vec![0, 1]);
}

#[tokio::test(flavor = "current_thread")]
async fn event_append_failure_expected_storage_unavailable_and_nothing_committed() {
    let backend = Arc::new(FlakyBackend::new());
    let deployment = Deployment::with_storage(backend.clone(), Arc::new(MemoryCheckpointer::new()))
        .browser(ScriptedExecutor::always_succeeding(), two_step_script());
    let manager = deployment.manager();
    let session_id = manager.create_session().await.expect("session");

    backend.fail_appends(true);
    let error = manager
        .post_message(&session_id, "click a")
        .await
        .expect_err("append should fail");
    assert!(matches!(error, SessionError::StorageUnavailable(_)));
    assert_eq!(error.kind(), "StorageUnavailable");

    let view = manager.state(&session_id).await.expect("state");
    assert_eq!(view.thread.version, 0);
    assert_eq!(view.log_len, 0);
    assert_eq!(view.session_state.status, SessionStatus::Idle);

    backend.fail_appends(false);
    let step = manager
        .post_message(&session_id, "click b")
        .await
        .expect("retry should commit");
    assert_eq!(step.reconciliation, Reconciliation::InSync);
    let positions: Vec<_> = step.events.iter().map(|event| event.position).collect();
    assert_eq!(positions, vec![0, 1]);
    assert_eq!(step.thread.version, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn checkpoint_save_failure_expected_uncommitted_events_hidden_then_abandoned() {
    let deployment = Deployment::with_storage(
        Arc::new(FlakyBackend::new()),
        Arc::new(FlakyCheckpointer::failing_saves(1)),
    )
    .browser(ScriptedExecutor::always_succeeding(), two_step_script());
    let manager = deployment.manager();
    let session_id = manager.create_session().await.expect("session");

    let error = manager
        .post_message(&session_id, "click a")
        .await
        .expect_err("save should fail");
    assert!(matches!(error, SessionError::StorageUnavailable(_)));

    let view = manager.state(&session_id).await.expect("state");
    assert_eq!(view.thread.version, 0);
    assert_eq!(view.event_count, 0);
    assert_eq!(view.log_len, 2);
    assert_eq!(view.session_state.status, SessionStatus::Idle);
    assert_eq!(view.session_state.event_count, 0);

    let step = manager
        .post_message(&session_id, "click b")
        .await
        .expect("next step should commit");

    assert_eq!(step.reconciliation, Reconciliation::LogAhead { by: 2 });
    assert_eq!(step.thread.abandoned, vec![AbandonedRange { from: 0, to: 2 }]);
    let marker = &step.events[0];
    assert_eq!(marker.position, 2);
    assert_eq!(marker.source, EventSource::System);
    assert_eq!(
        marker.failure().map(|failure| failure.error_type.as_str()),
        Some("StorageUnavailable")
    );
    assert_eq!(step.events.len(), 3);
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.session_state.status, SessionStatus::Completed);
    assert_eq!(step.session_state.event_count, 3);

    let view = manager.state(&session_id).await.expect("state");
    assert_eq!(view.thread.version, 1);
    assert_eq!(view.event_count, 5);
    assert_eq!(view.log_len, 5);
    assert_eq!(view.session_state, step.session_state);
}

#[tokio::test(flavor = "current_thread")]
async fn checkpoint_ahead_of_log_expected_reported_and_tolerated() {
    let deployment = Deployment::in_memory()
        .browser(ScriptedExecutor::always_succeeding(), two_step_script());
    let manager = deployment.manager();
    let session_id = manager.create_session().await.expect("session");

    let mut stale = ThreadState::new(session_id.clone());
    stale.committed_position = 5;
    deployment
        .checkpointer
        .save(&stale, 0)
        .await
        .expect("seed checkpoint");

    let step = manager
        .post_message(&session_id, "click a")
        .await
        .expect("step should commit");

    assert_eq!(step.reconciliation, Reconciliation::CheckpointAhead { by: 5 });
    let positions: Vec<_> = step.events.iter().map(|event| event.position).collect();
    assert_eq!(positions, vec![0, 1]);
    assert_eq!(step.thread.committed_position, 2);
    assert_eq!(step.thread.version, 2);
    assert!(step.thread.abandoned.is_empty());
}
