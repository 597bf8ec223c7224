//! Crash recovery from the persisted job table.

mod common;

use common::{policy, wait_all_terminal, FakeEngine, Harness};
use mediaq::{load_jobs, save_jobs, Job, JobQueue, JobSpec, JobStatus, QueueSettings};
use tempfile::TempDir;

fn settings(dir: &TempDir) -> QueueSettings {
    QueueSettings {
        state_path: Some(dir.path().join("jobs.json")),
        ..QueueSettings::default()
    }
}

#[tokio::test]
async fn test_processing_job_reloads_as_pending_and_runs() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let path = settings.state_path.clone().unwrap();

    let mut interrupted = Job::new(1, JobSpec::new("a.mp4", "b.mp4", "default"));
    interrupted.transition(JobStatus::Processing).unwrap();
    interrupted.advance_progress(40.0);
    interrupted.current_stage = Some("encode".to_string());
    let mut done = Job::new(2, JobSpec::new("c.mp4", "d.mp4", "default"));
    done.transition(JobStatus::Processing).unwrap();
    done.transition(JobStatus::Completed).unwrap();
    save_jobs(&path, [&interrupted, &done]).unwrap();

    let (queue, recovered) = JobQueue::restore(policy(), settings).unwrap();
    assert_eq!(recovered, 1);
    let job = queue.get(&interrupted.id).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.current_stage, None);
    assert_eq!(queue.get(&done.id).unwrap().status, JobStatus::Completed);

    let engine = FakeEngine::quick("generic", 10);
    let harness = Harness::start_with(queue, &[engine.clone()], 1);
    assert!(wait_all_terminal(&harness.queue).await);
    assert_eq!(
        harness.queue.get(&interrupted.id).unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(engine.runs(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn test_queue_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let (queue, _) = JobQueue::restore(policy(), settings(&dir)).unwrap();
    let kept = queue.submit(JobSpec::new("a.mp4", "b.mp4", "default")).unwrap();
    let dropped = queue.submit(JobSpec::new("c.mp4", "d.mp4", "default")).unwrap();
    queue.cancel(&dropped).unwrap();
    queue.persist().await.unwrap();

    let (restored, recovered) = JobQueue::restore(policy(), settings(&dir)).unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(restored.list(None).len(), 2);
    assert_eq!(restored.get(&kept).unwrap().status, JobStatus::Pending);
    assert_eq!(restored.get(&dropped).unwrap().status, JobStatus::Cancelled);

    let next = restored.submit(JobSpec::new("e.mp4", "f.mp4", "default")).unwrap();
    let seq_next = restored.get(&next).unwrap().seq;
    assert!(seq_next > restored.get(&dropped).unwrap().seq);
}

#[tokio::test]
async fn test_shutdown_requeues_running_job() {
    let dir = TempDir::new().unwrap();
    let (queue, _) = JobQueue::restore(policy(), settings(&dir)).unwrap();
    let engine = FakeEngine::new(
        "generic",
        10,
        common::Behavior::Succeed {
            delay: std::time::Duration::from_millis(100),
        },
    );
    let harness = Harness::start_with(queue, &[engine], 1);
    let id = harness
        .queue
        .submit(JobSpec::new("a.mp4", "b.mp4", "default"))
        .unwrap();
    assert!(common::wait_for_status(&harness.queue, &id, JobStatus::Processing).await);

    let queue = harness.queue.clone();
    harness.stop().await;
    queue.persist().await.unwrap();

    assert_eq!(queue.get(&id).unwrap().status, JobStatus::Pending);
    let loaded = load_jobs(&dir.path().join("jobs.json")).unwrap();
    assert_eq!(loaded.jobs.len(), 1);
    assert_eq!(loaded.jobs[0].status, JobStatus::Pending);
}
