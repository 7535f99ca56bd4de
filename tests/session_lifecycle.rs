//! Channel session behavior through the public API, driven by the scripted
//! connection so no agent process is needed.

use std::sync::Arc;
use std::time::Duration;

use agentlane::connection::{
    AgentEvent, ConnectOptions, ResultEvent, ScriptedConnection, ScriptedFactory,
};
use agentlane::engine::{ChannelSession, RunReply};
use agentlane::{ActiveRunRegistry, EngineError, RunRequest};

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn open_session(
    factory: &ScriptedFactory,
    registry: &Arc<ActiveRunRegistry>,
) -> (ChannelSession, Arc<ScriptedConnection>) {
    let session = ChannelSession::open(
        "room-1",
        ConnectOptions::default(),
        factory,
        Arc::clone(registry),
        300,
    )
    .await
    .expect("scripted open succeeds");
    let connection = factory.wait_for_connection(0).await;
    (session, connection)
}

fn request(prompt: &str) -> RunRequest {
    RunRequest::new("room-1", prompt, "/repo")
}

fn submit(session: &ChannelSession, prompt: &str) -> RunReply {
    session.submit(request(prompt)).expect("session is open")
}

// ─────────────────────────────────────────────────────────────────────────────
// Ordering
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn results_follow_submission_order_under_jittered_delivery() {
    let factory = ScriptedFactory::new();
    let registry = Arc::new(ActiveRunRegistry::new());
    let (session, connection) = open_session(&factory, &registry).await;

    let prompts = ["p0", "p1", "p2", "p3", "p4"];
    let replies: Vec<RunReply> = prompts.iter().map(|p| submit(&session, p)).collect();

    // Answer each prompt once it is written, with uneven pauses between events.
    let driver = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            for (i, prompt) in prompts.iter().enumerate() {
                let seen = connection.wait_for_prompts(i + 1).await;
                assert_eq!(seen[i], *prompt);
                let pause = Duration::from_millis(((i * 7) % 5) as u64);
                connection.push(AgentEvent::text_delta(format!("answer-{i}")));
                tokio::time::sleep(pause).await;
                connection.push(AgentEvent::Result(ResultEvent::success("")));
            }
        })
    };

    for (i, reply) in replies.into_iter().enumerate() {
        let result = reply.await.expect("run resolves");
        assert_eq!(result.text, format!("answer-{i}"));
        assert!(session.streaming_count() <= 1);
    }
    driver.await.unwrap();
    assert_eq!(session.pending_len(), 0);
    assert!(!registry.is_active("room-1"));
}

#[tokio::test]
async fn next_run_starts_before_its_events_and_closure_rejects_the_rest() {
    let factory = ScriptedFactory::new();
    let registry = Arc::new(ActiveRunRegistry::new());
    let (session, connection) = open_session(&factory, &registry).await;

    let r1 = submit(&session, "R1");
    let r2 = submit(&session, "R2");
    let r3 = submit(&session, "R3");
    let first_handle = registry.get("room-1").expect("R1 is registered");

    connection.push(AgentEvent::text_delta("one"));
    connection.push(AgentEvent::Result(ResultEvent::success("one")));
    assert_eq!(r1.await.unwrap().text, "one");

    // R2 is streaming before any of its events were delivered.
    assert_eq!(session.streaming_count(), 1);
    assert_eq!(session.pending_len(), 2);
    let second_handle = registry.get("room-1").expect("R2 is registered");
    assert!(!Arc::ptr_eq(&first_handle, &second_handle));
    assert_eq!(connection.wait_for_prompts(2).await, vec!["R1", "R2"]);

    connection.push(AgentEvent::text_delta("tw"));
    let closure = EngineError::closed("operator closed the session");
    session.close(closure.clone());

    assert_eq!(r2.await, Err(closure.clone()));
    assert_eq!(r3.await, Err(closure.clone()));
    assert_eq!(session.pending_len(), 0);
    assert!(session.is_closed());
    assert!(!registry.is_active("room-1"));
    assert_eq!(connection.prompts(), vec!["R1", "R2"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Cancellation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn queued_cancel_is_local_and_head_cancel_is_global() {
    let factory = ScriptedFactory::new();
    let registry = Arc::new(ActiveRunRegistry::new());
    let (session, connection) = open_session(&factory, &registry).await;

    let head_token = tokio_util::sync::CancellationToken::new();
    let queued_token = tokio_util::sync::CancellationToken::new();
    let head = session
        .submit(request("head").with_cancellation(head_token.clone()))
        .unwrap();
    let queued = session
        .submit(request("queued").with_cancellation(queued_token.clone()))
        .unwrap();
    let tail = submit(&session, "tail");

    queued_token.cancel();
    assert_eq!(queued.await, Err(EngineError::Cancelled));
    assert!(!session.is_closed());
    assert_eq!(session.pending_len(), 2);

    connection.push(AgentEvent::text_delta("so far"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    head_token.cancel();

    let interrupted = head.await.unwrap();
    assert_eq!(interrupted.text, "so far");
    assert!(interrupted.is_interrupted());
    assert_eq!(tail.await, Err(EngineError::closed("run aborted")));
    assert!(session.is_closed());
    assert_eq!(connection.close_count(), 1);
}

#[tokio::test]
async fn registry_abort_routes_teardown_through_the_session() {
    let factory = ScriptedFactory::new();
    let registry = Arc::new(ActiveRunRegistry::new());
    let (session, connection) = open_session(&factory, &registry).await;

    let head = submit(&session, "long task");
    connection.wait_for_prompts(1).await;
    assert!(registry.abort("room-1"));

    let result = head.await.unwrap();
    assert_eq!(result.text, agentlane::engine::INTERRUPTED_TEXT);
    assert!(session.is_closed());
    assert_eq!(connection.close_count(), 1);
    assert!(session.submit(request("after")).is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream integrity
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_ending_mid_run_rejects_head_and_queue() {
    let factory = ScriptedFactory::new();
    let registry = Arc::new(ActiveRunRegistry::new());
    let (session, connection) = open_session(&factory, &registry).await;

    let r1 = submit(&session, "r1");
    let r2 = submit(&session, "r2");
    connection.push(AgentEvent::text_delta("partial"));
    connection.finish();

    assert_eq!(r1.await, Err(EngineError::StreamEnded));
    assert_eq!(r2.await, Err(EngineError::StreamEnded));
    assert_eq!(session.close_error(), Some(EngineError::StreamEnded));
    assert_eq!(
        EngineError::StreamEnded.to_string(),
        "Agent stream ended unexpectedly"
    );
}
