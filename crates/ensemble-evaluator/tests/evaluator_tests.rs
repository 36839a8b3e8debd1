//! End-to-end tests against a running evaluator.
//!
//! Each test starts a real [`Evaluator`] on an ephemeral port, connects
//! observers with [`Monitor`] and reporters with a raw
//! `tokio-tungstenite` client, and checks what the observers see.
//! `stop()` blocks until the service thread exits, so tests call it
//! through `spawn_blocking`.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ensemble_core::config::{EnsembleSpec, EvaluatorConfig, StageSpec, StepSpec};
use ensemble_core::topology::{Ensemble, StaticEnsemble};
use ensemble_evaluator::{Evaluator, EvaluatorError, Monitor, MonitorEvent};
use ensemble_types::{EnsembleStatus, Status};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Reporter = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

// =========================================================================
// Helpers
// =========================================================================

fn ensemble(size: usize) -> Arc<dyn Ensemble> {
    let spec = EnsembleSpec {
        size,
        stages: vec![StageSpec {
            id: String::from("0"),
            steps: vec![StepSpec {
                id: String::from("0"),
                jobs: vec![String::from("RMS"), String::from("FLOW")],
            }],
        }],
        metadata: BTreeMap::from([(String::from("iteration"), json!(0))]),
    };
    Arc::new(StaticEnsemble::from_spec(&spec))
}

fn config(drain_timeout_secs: u64) -> EvaluatorConfig {
    EvaluatorConfig {
        drain_timeout_secs,
        ..EvaluatorConfig::default()
    }
}

fn start(size: usize) -> Arc<Evaluator> {
    start_with(size, config(5))
}

fn start_with(size: usize, config: EvaluatorConfig) -> Arc<Evaluator> {
    let evaluator = Evaluator::new(ensemble(size), config).unwrap();
    evaluator.run().unwrap();
    Arc::new(evaluator)
}

async fn stop(evaluator: &Arc<Evaluator>) {
    let evaluator = Arc::clone(evaluator);
    tokio::task::spawn_blocking(move || evaluator.stop())
        .await
        .unwrap();
}

async fn observe(evaluator: &Evaluator) -> Monitor {
    let mut monitor = evaluator.monitor().await.unwrap();
    let first = next(&mut monitor).await;
    assert!(matches!(first, MonitorEvent::Snapshot { .. }), "{first:?}");
    monitor
}

async fn next(monitor: &mut Monitor) -> MonitorEvent {
    tokio::time::timeout(WAIT, monitor.next_event())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

/// Read events until `terminated` or the connection ends.
async fn drain_events(monitor: &mut Monitor) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Ok(Ok(Some(event))) = tokio::time::timeout(WAIT, monitor.next_event()).await {
        let done = matches!(event, MonitorEvent::Terminated { .. });
        events.push(event);
        if done {
            break;
        }
    }
    events
}

async fn reporter(evaluator: &Evaluator) -> Reporter {
    let url = evaluator.dispatch_url().unwrap();
    connect_async(url.as_str()).await.unwrap().0
}

fn job_event(kind: &str, real: usize, job: usize) -> Message {
    let envelope = json!({
        "type": kind,
        "source": format!("/reporter/real/{real}/stage/0/step/0/job/{job}"),
        "id": 0,
    });
    Message::Text(envelope.to_string().into())
}

async fn close_code(reporter: &mut Reporter) -> Option<CloseCode> {
    loop {
        match tokio::time::timeout(WAIT, reporter.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| f.code),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

fn job_status(event: &MonitorEvent, real: &str, job: &str) -> Option<Status> {
    match event {
        MonitorEvent::SnapshotUpdate { update, .. } => {
            update.job(real, "0", "0", job).and_then(|j| j.status)
        }
        _ => None,
    }
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_job_runs_to_success() {
    let evaluator = start(2);
    let mut monitor = observe(&evaluator).await;

    let tree = monitor.snapshot();
    assert_eq!(tree.status, EnsembleStatus::Running);
    assert_eq!(tree.jobs().count(), 4);
    assert_eq!(tree.metadata.get("iteration"), Some(&json!(0)));

    let mut dispatch = reporter(&evaluator).await;
    for kind in [
        "forward-model-job-start",
        "forward-model-job-running",
        "forward-model-job-success",
    ] {
        dispatch.send(job_event(kind, 0, 0)).await.unwrap();
    }

    let mut statuses = Vec::new();
    for _ in 0..3 {
        statuses.push(job_status(&next(&mut monitor).await, "0", "0"));
    }
    assert_eq!(
        statuses,
        vec![Some(Status::Pending), Some(Status::Running), Some(Status::Success)]
    );

    let job = monitor.snapshot().job("0", "0", "0", "0").unwrap();
    assert_eq!(job.status, Status::Success);
    let (started, ended) = (job.start_time.unwrap(), job.end_time.unwrap());
    assert!(ended >= started);
    assert_eq!(
        monitor.snapshot().job("1", "0", "0", "0").unwrap().status,
        Status::Unknown
    );

    dispatch.close(None).await.unwrap();
    stop(&evaluator).await;

    let rest = drain_events(&mut monitor).await;
    assert_eq!(rest.len(), 2, "{rest:?}");
    assert!(matches!(
        rest.first(),
        Some(MonitorEvent::SnapshotUpdate { update, .. }) if update.status == Some(EnsembleStatus::Stopped)
    ));
    assert!(matches!(rest.last(), Some(MonitorEvent::Terminated { .. })));
    assert_eq!(monitor.snapshot().status, EnsembleStatus::Stopped);
}

#[tokio::test]
async fn test_event_indices_strictly_increase() {
    let evaluator = start(1);
    let mut monitor = evaluator.monitor().await.unwrap();
    let mut dispatch = reporter(&evaluator).await;

    let mut indices = vec![next(&mut monitor).await.index()];
    for kind in ["job_start", "job_running", "job_success"] {
        dispatch.send(job_event(kind, 0, 1)).await.unwrap();
        indices.push(next(&mut monitor).await.index());
    }
    dispatch.close(None).await.unwrap();
    stop(&evaluator).await;
    indices.extend(drain_events(&mut monitor).await.iter().map(MonitorEvent::index));

    assert!(
        indices.windows(2).all(|pair| matches!(pair, [a, b] if a < b)),
        "{indices:?}"
    );
    assert_eq!(monitor.last_index(), indices.last().copied());
}

#[tokio::test]
async fn test_null_sentinel_ends_reporter_stream() {
    let evaluator = start_with(1, config(30));
    let mut monitor = observe(&evaluator).await;
    let mut dispatch = reporter(&evaluator).await;

    dispatch.send(job_event("job_start", 0, 0)).await.unwrap();
    dispatch.send(Message::Text(String::from("null").into())).await.unwrap();

    assert_eq!(
        job_status(&next(&mut monitor).await, "0", "0"),
        Some(Status::Pending)
    );
    assert_eq!(close_code(&mut dispatch).await, Some(CloseCode::Normal));

    // The reporter is no longer counted, so shutdown does not wait out the
    // 30 second drain timeout.
    let began = Instant::now();
    stop(&evaluator).await;
    assert!(began.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_terminate_request_sends_one_terminated() {
    let evaluator = start(1);
    let mut monitor = observe(&evaluator).await;

    monitor.signal_done().await.unwrap();
    let events = drain_events(&mut monitor).await;
    let terminated = events
        .iter()
        .filter(|e| matches!(e, MonitorEvent::Terminated { .. }))
        .count();
    assert_eq!(terminated, 1, "{events:?}");
    assert!(matches!(events.last(), Some(MonitorEvent::Terminated { .. })));
    assert!(matches!(
        tokio::time::timeout(WAIT, monitor.next_event()).await.unwrap(),
        Ok(None) | Err(_)
    ));

    // No new observer is served after termination.
    if let Ok(mut late) = Monitor::connect(&evaluator.monitor_url().unwrap()).await {
        assert!(!matches!(
            tokio::time::timeout(WAIT, late.next_event()).await.unwrap(),
            Ok(Some(_))
        ));
    }

    stop(&evaluator).await;
}

#[tokio::test]
async fn test_unknown_event_types_are_skipped() {
    let evaluator = start(1);
    let mut monitor = observe(&evaluator).await;
    let mut dispatch = reporter(&evaluator).await;

    dispatch
        .send(job_event("com.example.heartbeat", 0, 0))
        .await
        .unwrap();
    // Unknown job: logged and dropped, nothing broadcast.
    dispatch.send(job_event("job_running", 0, 9)).await.unwrap();
    dispatch.send(job_event("job_running", 0, 1)).await.unwrap();

    let event = next(&mut monitor).await;
    assert_eq!(job_status(&event, "0", "1"), Some(Status::Running));

    // The reporter connection survived.
    dispatch.send(job_event("job_failure", 0, 1)).await.unwrap();
    assert_eq!(
        job_status(&next(&mut monitor).await, "0", "1"),
        Some(Status::Failure)
    );

    dispatch.close(None).await.unwrap();
    stop(&evaluator).await;
}

#[tokio::test]
async fn test_malformed_reporter_frame_closes_connection() {
    let evaluator = start(1);
    let mut dispatch = reporter(&evaluator).await;

    dispatch.send(Message::Text(String::from("{not json").into())).await.unwrap();
    assert_eq!(close_code(&mut dispatch).await, Some(CloseCode::Protocol));

    stop(&evaluator).await;
}

#[tokio::test]
async fn test_stale_update_does_not_revert_success() {
    let evaluator = start(1);
    let mut monitor = observe(&evaluator).await;
    let mut first = reporter(&evaluator).await;
    let mut second = reporter(&evaluator).await;

    first.send(job_event("job_success", 0, 0)).await.unwrap();
    assert_eq!(
        job_status(&next(&mut monitor).await, "0", "0"),
        Some(Status::Success)
    );
    second.send(job_event("job_running", 0, 0)).await.unwrap();
    second.close(None).await.unwrap();
    first.close(None).await.unwrap();
    stop(&evaluator).await;

    // Only the shutdown messages follow; the stale update changed nothing.
    let rest = drain_events(&mut monitor).await;
    assert_eq!(rest.len(), 2, "{rest:?}");
    assert_eq!(
        monitor.snapshot().job("0", "0", "0", "0").unwrap().status,
        Status::Success
    );
}

#[tokio::test]
async fn test_observers_see_the_same_order() {
    let evaluator = start(2);
    let mut left = observe(&evaluator).await;
    let mut right = observe(&evaluator).await;

    let mut reporters = vec![reporter(&evaluator).await, reporter(&evaluator).await];
    for kind in ["job_start", "job_running", "job_success"] {
        for (real, dispatch) in reporters.iter_mut().enumerate() {
            dispatch.send(job_event(kind, real, 0)).await.unwrap();
        }
    }
    for dispatch in &mut reporters {
        dispatch.close(None).await.unwrap();
    }
    stop(&evaluator).await;

    let left_events = drain_events(&mut left).await;
    let right_events = drain_events(&mut right).await;
    assert_eq!(left_events.len(), 8, "{left_events:?}");
    assert_eq!(left_events, right_events);
    assert_eq!(left.snapshot(), right.snapshot());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let evaluator = start(1);

    let a = Arc::clone(&evaluator);
    let b = Arc::clone(&evaluator);
    let (first, second) = tokio::join!(
        tokio::task::spawn_blocking(move || a.stop()),
        tokio::task::spawn_blocking(move || b.stop()),
    );
    assert!(first.is_ok() && second.is_ok());
    stop(&evaluator).await;

    assert!(matches!(evaluator.run(), Err(EvaluatorError::AlreadyRunning)));
    assert!(Monitor::connect(&evaluator.monitor_url().unwrap()).await.is_err());
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let evaluator = Evaluator::new(
        ensemble(1),
        EvaluatorConfig {
            port,
            ..EvaluatorConfig::default()
        },
    )
    .unwrap();
    assert!(matches!(evaluator.run(), Err(EvaluatorError::Bind { .. })));
    assert!(evaluator.monitor_url().is_none());
}
