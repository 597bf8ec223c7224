//! Engine fallback through the full queue and worker pool.

mod common;

use common::{wait_all_terminal, Behavior, FakeEngine, Harness};
use mediaq::{EngineError, FailureKind, JobSpec, JobStatus};

#[tokio::test]
async fn test_falls_back_past_unavailable_engines() {
    let first = FakeEngine::new("first", 30, Behavior::Unavailable);
    let second = FakeEngine::new("second", 20, Behavior::Unavailable);
    let third = FakeEngine::quick("third", 10);
    let harness = Harness::start(&[first.clone(), second.clone(), third.clone()], 1);

    let id = harness
        .queue
        .submit(JobSpec::new("a.mp4", "b.mp4", "default"))
        .unwrap();
    assert!(wait_all_terminal(&harness.queue).await);

    let job = harness.queue.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.engine_used.as_deref(), Some("third"));
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.progress, 100.0);
    assert_eq!(first.runs() + second.runs(), 0);
    assert_eq!(third.runs(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_unavailable_preference_falls_back_to_generic() {
    let accelerated = FakeEngine::new("accelerated", 100, Behavior::Unavailable);
    let generic = FakeEngine::quick("generic", 10);
    let harness = Harness::start(&[accelerated, generic], 1);

    let id = harness
        .queue
        .submit(JobSpec::new("a.mp4", "b.mp4", "default").with_engine_preference("accelerated"))
        .unwrap();
    assert!(wait_all_terminal(&harness.queue).await);

    let job = harness.queue.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.engine_used.as_deref(), Some("generic"));
    assert_eq!(job.retry_count, 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_every_engine_failing_reports_each_attempt() {
    let broken = FakeEngine::new(
        "broken",
        20,
        Behavior::Fail(EngineError::Execution("encoder crashed".to_string())),
    );
    let missing = FakeEngine::new("missing", 10, Behavior::Unavailable);
    let harness = Harness::start(&[broken, missing], 1);

    let id = harness
        .queue
        .submit(JobSpec::new("a.mp4", "b.mp4", "default"))
        .unwrap();
    assert!(wait_all_terminal(&harness.queue).await);

    let job = harness.queue.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    let failure = job.error.unwrap();
    assert_eq!(failure.kind, FailureKind::Exhausted);
    let engines: Vec<&str> = failure.attempts.iter().map(|a| a.engine.as_str()).collect();
    assert_eq!(engines, vec!["broken", "missing"]);
    assert_eq!(failure.attempts[0].stage.as_deref(), Some("prepare"));
    assert!(failure.message.contains("encoder crashed"));

    harness.stop().await;
}

#[tokio::test]
async fn test_fatal_error_stops_the_chain() {
    let corrupt = FakeEngine::new(
        "strict",
        20,
        Behavior::Fail(EngineError::Fatal("corrupt input".to_string())),
    );
    let backup = FakeEngine::quick("backup", 10);
    let harness = Harness::start(&[corrupt, backup.clone()], 1);

    let id = harness
        .queue
        .submit(JobSpec::new("a.mp4", "b.mp4", "default"))
        .unwrap();
    assert!(wait_all_terminal(&harness.queue).await);

    let job = harness.queue.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, FailureKind::Fatal);
    assert_eq!(backup.runs(), 0);

    harness.stop().await;
}
