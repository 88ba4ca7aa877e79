use std::sync::Arc;
use std::time::Duration;

use grader_config::Config;
use grader_job_queue::{JobId, JobOutcome, JobQueue, MemoryBroker, DEFAULT_TOPIC};
use grader_service::config_helpers::{broker_from_config, queue_options_from_config};
use grader_service::{
    FsArtifactStore, GraderService, ServiceDeps, ServiceError, Submission, SubmissionService,
};
use grader_workers::{
    grade_fn, FileTracker, JobRecord, LifecycleTracker, MemoryTracker, PoolError,
};
use tempfile::TempDir;
use uuid::Uuid;

fn test_config(dir: &TempDir) -> Config {
    let mut cfg = Config::default();
    cfg.server.port = 0;
    cfg.workers.concurrency = 2;
    cfg.workers.shutdown_timeout_secs = 5;
    cfg.queue.spool_dir = dir.path().join("spool").display().to_string();
    cfg.queue.poll_interval_ms = 20;
    cfg.queue.drain_timeout_secs = 1;
    cfg.storage.artifacts_dir = dir.path().join("artifacts").display().to_string();
    cfg.storage.state_dir = dir.path().join("state").display().to_string();
    cfg
}

fn submission(payload: &[u8]) -> Submission {
    Submission {
        payload: payload.to_vec(),
        submission_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        assessment_id: Uuid::new_v4(),
    }
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn wait_for_outcome(tracker: &dyn LifecycleTracker, id: &JobId) -> JobRecord {
    for _ in 0..500 {
        if let Some(record) = tracker.record(id).await.unwrap() {
            if record.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never finished");
}

#[tokio::test]
async fn service_grades_submissions_and_shuts_down_once() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let tracker = Arc::new(MemoryTracker::new());
    let deps = ServiceDeps {
        broker: Some(broker.clone()),
        tracker: Some(tracker.clone()),
        artifacts: None,
        grade: Some(grade_fn(|job| async move {
            Ok(JobOutcome::graded(100, format!("graded {}", job.id)))
        })),
    };

    let service = GraderService::start(&test_config(&dir), deps).await.unwrap();
    assert!(service.pool().is_running());
    let ready = http_get(service.health_addr(), "/ready").await;
    assert!(ready.starts_with("HTTP/1.1 200"), "{ready}");

    let job = service
        .submissions()
        .submit(submission(b"answer = 42"))
        .await
        .unwrap();
    let record = wait_for_outcome(tracker.as_ref(), &job.id).await;
    assert_eq!(
        record.outcome(),
        Some(&JobOutcome::graded(100, format!("graded {}", job.id)))
    );

    service.shutdown().await.unwrap();
    assert!(!service.pool().is_running());
    assert!(service.queue().is_stopped());
    assert!(broker.is_closed());
    assert_eq!(broker.stats(DEFAULT_TOPIC).acked, 1);

    // Misuse aborts the sequence instead of repeating it.
    assert!(matches!(
        service.shutdown().await,
        Err(ServiceError::Pool(PoolError::AlreadyStopped))
    ));
}

#[tokio::test]
async fn run_until_shuts_down_when_signalled() {
    let dir = TempDir::new().unwrap();
    let deps = ServiceDeps {
        broker: Some(Arc::new(MemoryBroker::new())),
        tracker: Some(Arc::new(MemoryTracker::new())),
        artifacts: None,
        grade: Some(grade_fn(|_job| async move { Ok(JobOutcome::graded(1, "")) })),
    };
    let service = GraderService::start(&test_config(&dir), deps).await.unwrap();

    let signal = tokio_util::sync::CancellationToken::new();
    let trigger = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), service.run_until(signal))
        .await
        .expect("shutdown finished")
        .unwrap();
    assert!(service.queue().is_stopped());
}

#[tokio::test]
async fn bind_failure_rolls_back_pool_and_queue() {
    let dir = TempDir::new().unwrap();
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut cfg = test_config(&dir);
    cfg.server.port = taken.local_addr().unwrap().port();

    let broker = Arc::new(MemoryBroker::new());
    let deps = ServiceDeps {
        broker: Some(broker.clone()),
        tracker: Some(Arc::new(MemoryTracker::new())),
        artifacts: None,
        grade: Some(grade_fn(|_job| async move { Ok(JobOutcome::graded(1, "")) })),
    };

    let result = GraderService::start(&cfg, deps).await;
    assert!(matches!(result, Err(ServiceError::Io(_))));
    assert!(broker.is_closed());
}

#[tokio::test]
async fn start_without_grader_command_fails() {
    let dir = TempDir::new().unwrap();
    let deps = ServiceDeps {
        broker: Some(Arc::new(MemoryBroker::new())),
        ..ServiceDeps::default()
    };
    let result = GraderService::start(&test_config(&dir), deps).await;
    assert!(matches!(result, Err(ServiceError::NoGrader)));
}

#[cfg(unix)]
#[tokio::test]
async fn spool_producer_and_command_grader_worker_share_state() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.grading.command = Some("sh".into());
    cfg.grading.args = vec![
        "-c".into(),
        r#"if grep -q PASS "$1"; then echo '{"score": 100}'; else echo 'no PASS marker' >&2; exit 2; fi"#
            .into(),
        "grader".into(),
    ];

    // Worker process: everything built from config.
    let service = GraderService::start(&cfg, ServiceDeps::default()).await.unwrap();

    // Producer process: its own queue handle and tracker over the same directories.
    let producer_tracker: Arc<dyn LifecycleTracker> =
        Arc::new(FileTracker::open(&cfg.storage.state_dir).await.unwrap());
    let producer_queue = JobQueue::new(
        broker_from_config(&cfg.queue),
        queue_options_from_config(&cfg.queue),
    );
    let producer = SubmissionService::new(
        Arc::new(FsArtifactStore::open(&cfg.storage.artifacts_dir).await.unwrap()),
        producer_queue.clone(),
        producer_tracker.clone(),
    );

    let passing = producer.submit(submission(b"PASS")).await.unwrap();
    let failing = producer.submit(submission(b"FAIL")).await.unwrap();

    let passed = wait_for_outcome(producer_tracker.as_ref(), &passing.id).await;
    assert_eq!(passed.outcome(), Some(&JobOutcome::graded(100, "")));
    let rejected = wait_for_outcome(producer_tracker.as_ref(), &failing.id).await;
    assert_eq!(
        rejected.outcome(),
        Some(&JobOutcome::rejected("no PASS marker"))
    );

    producer_queue.stop().await.unwrap();
    service.shutdown().await.unwrap();
    assert_eq!(service.pool().stats().graded, 1);
    assert_eq!(service.pool().stats().rejected, 1);
}
