use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use relay_core::{
    ErrorCode, EventBody, RelayConfig, ReportSink, Request, RequestId, SessionStore, StorageError,
    now_millis,
};
use relay_dispatch::{
    BuiltinDeps, HandlerFailure, HandlerOutput, ParamSchema, Registry, handler_fn,
    register_builtins,
};
use relay_reports::FileReportSink;
use relay_session::{
    CoordinatorError, FileSessionStore, Handshake, MemoryStore, SessionCoordinator,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;

const HOUR: i64 = 3_600_000;

struct Harness {
    coordinator: SessionCoordinator,
    reports: Arc<dyn ReportSink>,
    gated_calls: Arc<AtomicUsize>,
    gate: Arc<Notify>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = RelayConfig {
        reports_root: dir.path().join("reports"),
        ..RelayConfig::default()
    };
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new(config.sweep_policy()));
    let reports: Arc<dyn ReportSink> =
        Arc::new(FileReportSink::open(&config.reports_root).unwrap());

    let gated_calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let mut builder = Registry::builder(config.handler_timeout);
    register_builtins(
        &mut builder,
        BuiltinDeps {
            config: config.clone(),
            store: Arc::clone(&store),
            reports: Arc::clone(&reports),
        },
    )
    .unwrap();
    {
        let calls = Arc::clone(&gated_calls);
        let gate = Arc::clone(&gate);
        builder
            .register(
                "gated",
                ParamSchema::any(),
                handler_fn(move |inv| {
                    let calls = Arc::clone(&calls);
                    let gate = Arc::clone(&gate);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok::<_, HandlerFailure>(HandlerOutput::value(inv.request.params))
                    }
                }),
            )
            .unwrap();
    }

    let coordinator = SessionCoordinator::new(
        store,
        Arc::clone(&reports),
        Arc::new(builder.build()),
        config,
    );
    Harness {
        coordinator,
        reports,
        gated_calls,
        gate,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_echo_round_trip_and_replay() {
    let h = harness();
    let attachment = h.coordinator.open(Handshake::default()).await.unwrap();
    assert!(!attachment.resumed);
    let id = attachment.session_id;

    let handle = h
        .coordinator
        .submit(id, Request::new("1", "echo", json!({"x": 1})))
        .await
        .unwrap();
    assert!(!handle.coalesced);
    let event = handle.wait().await.unwrap();
    assert_eq!(event.seq, 1);
    assert_eq!(event.request_id, Some(RequestId::from("1")));
    assert_eq!(
        event.body,
        EventBody::Result {
            value: json!({"x": 1}),
            report_id: None
        }
    );

    h.coordinator.detach(id).await;
    let resumed = h
        .coordinator
        .open(Handshake {
            session_id: Some(id),
            last_seen: Some(0),
        })
        .await
        .unwrap();
    assert!(resumed.resumed);
    let mut events = resumed.events(16);
    assert_eq!(events.next().await.unwrap(), event);
}

#[tokio::test]
async fn test_unknown_method_yields_error_event() {
    let h = harness();
    let id = h.coordinator.open(Handshake::default()).await.unwrap().session_id;

    let event = h
        .coordinator
        .submit(id, Request::new("7", "nope", json!({})))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(event.request_id, Some(RequestId::from("7")));
    assert_eq!(event.body.error_code(), Some(ErrorCode::UnknownMethod));

    // The identifier is not recorded, so the session has nothing in flight.
    let status = h.coordinator.status(id).await.unwrap();
    assert_eq!(status.in_flight, 0);
    assert_eq!(status.head, 1);
}

#[tokio::test]
async fn test_invalid_params_rejected_without_invocation() {
    let h = harness();
    let id = h.coordinator.open(Handshake::default()).await.unwrap().session_id;

    let event = h
        .coordinator
        .submit(id, Request::new("1", "report/write", json!({"content": 5})))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(event.body.error_code(), Some(ErrorCode::InvalidParams));
    assert!(h.reports.list(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_duplicates_coalesce() {
    let h = harness();
    let attachment = h.coordinator.open(Handshake::default()).await.unwrap();
    let id = attachment.session_id;

    let first = h
        .coordinator
        .submit(id, Request::new("dup", "gated", json!("a")))
        .await
        .unwrap();
    let second = h
        .coordinator
        .submit(id, Request::new("dup", "gated", json!("a")))
        .await
        .unwrap();
    assert!(!first.coalesced);
    assert!(second.coalesced);

    h.gate.notify_one();
    let (a, b) = tokio::join!(first.wait(), second.wait());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a, b);
    assert_eq!(h.gated_calls.load(Ordering::SeqCst), 1);
    assert_eq!(attachment.feed.pending_len(), 1);
}

#[tokio::test]
async fn test_completed_request_id_is_rejected() {
    let h = harness();
    let id = h.coordinator.open(Handshake::default()).await.unwrap().session_id;

    h.coordinator
        .submit(id, Request::new("1", "echo", json!(1)))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let err = h
        .coordinator
        .submit(id, Request::new("1", "echo", json!(1)))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CoordinatorError::DuplicateRequest(ref rid) if rid.as_str() == "1"));
}

#[tokio::test]
async fn test_sequence_is_gap_free_across_resume() {
    let h = harness();
    let id = h.coordinator.open(Handshake::default()).await.unwrap().session_id;

    for n in 1..=3u64 {
        let event = h
            .coordinator
            .submit(id, Request::new(n, "echo", json!(n)))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(event.seq, n);
    }
    h.coordinator.detach(id).await;

    let resumed = h
        .coordinator
        .open(Handshake {
            session_id: Some(id),
            last_seen: Some(1),
        })
        .await
        .unwrap();
    assert_eq!(resumed.last_acked, 1);
    assert_eq!(resumed.head, 3);

    let mut events = resumed.events(16);
    assert_eq!(events.next().await.unwrap().seq, 2);
    assert_eq!(events.next().await.unwrap().seq, 3);

    h.coordinator
        .submit(id, Request::new(4u64, "echo", json!(4)))
        .await
        .unwrap();
    assert_eq!(events.next().await.unwrap().seq, 4);

    let note = h
        .coordinator
        .notify(id, "progress", json!({"done": true}))
        .await
        .unwrap();
    assert_eq!(note.seq, 5);
    assert!(note.request_id.is_none());
    assert_eq!(events.next().await.unwrap(), note);
}

#[tokio::test]
async fn test_artifact_written_before_result() {
    let h = harness();
    let id = h.coordinator.open(Handshake::default()).await.unwrap().session_id;

    let event = h
        .coordinator
        .submit(id, Request::new("r1", "report/write", json!({"content": "# Findings"})))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let EventBody::Result {
        report_id: Some(report_id),
        ..
    } = event.body.clone()
    else {
        panic!("expected a result carrying a report id: {event:?}");
    };

    let report = h.reports.read(&report_id).await.unwrap();
    assert_eq!(report.payload, b"# Findings");
    assert_eq!(report.session_id, id);
}

#[tokio::test]
async fn test_sweep_expires_session_and_ends_feed() {
    let h = harness();
    let attachment = h.coordinator.open(Handshake::default()).await.unwrap();
    let id = attachment.session_id;

    let report = h.coordinator.sweep(now_millis() + 8 * HOUR + HOUR / 2).await.unwrap();
    assert_eq!(report.expired, vec![id]);
    assert!(attachment.feed.cursor().closed);

    let err = h
        .coordinator
        .submit(id, Request::new("1", "echo", json!(1)))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CoordinatorError::Storage(StorageError::Expired(_))));

    let err = h
        .coordinator
        .open(Handshake {
            session_id: Some(id),
            last_seen: None,
        })
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CoordinatorError::Storage(StorageError::Expired(_))));
}

#[tokio::test]
async fn test_close_destroys_session() {
    let h = harness();
    let attachment = h.coordinator.open(Handshake::default()).await.unwrap();
    let id = attachment.session_id;

    h.coordinator.close(id).await.unwrap();
    assert!(attachment.feed.cursor().closed);
    assert!(matches!(
        h.coordinator.status(id).await,
        Err(CoordinatorError::Storage(StorageError::NotFound(_)))
    ));
}

#[tokio::test]
async fn test_ack_trims_pending() {
    let h = harness();
    let attachment = h.coordinator.open(Handshake::default()).await.unwrap();
    let id = attachment.session_id;

    for n in 1..=2u64 {
        h.coordinator
            .submit(id, Request::new(n, "echo", json!(n)))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
    }
    assert_eq!(h.coordinator.ack(id, 1).await.unwrap(), 1);
    assert_eq!(attachment.feed.pending_len(), 1);
    // Acks beyond the head are clamped.
    assert_eq!(h.coordinator.ack(id, 99).await.unwrap(), 2);
    assert_eq!(h.coordinator.status(id).await.unwrap().pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_times_out_as_error_event() {
    let h = harness();
    let id = h.coordinator.open(Handshake::default()).await.unwrap().session_id;

    let handle = h
        .coordinator
        .submit(id, Request::new("slow", "gated", json!(null)))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    let event = handle.wait().await.unwrap();
    assert_eq!(event.body.error_code(), Some(ErrorCode::HandlerTimeout));
}

/// Coordinator over a file store rooted under `dir`, as a fresh process sees it.
fn file_coordinator(dir: &Path) -> SessionCoordinator {
    let config = RelayConfig {
        sessions_root: dir.join("sessions"),
        reports_root: dir.join("reports"),
        ..RelayConfig::default()
    };
    let store: Arc<dyn SessionStore> =
        Arc::new(FileSessionStore::open(&config.sessions_root, config.sweep_policy()).unwrap());
    let reports: Arc<dyn ReportSink> =
        Arc::new(FileReportSink::open(&config.reports_root).unwrap());
    let mut builder = Registry::builder(config.handler_timeout);
    register_builtins(
        &mut builder,
        BuiltinDeps {
            config: config.clone(),
            store: Arc::clone(&store),
            reports: Arc::clone(&reports),
        },
    )
    .unwrap();
    SessionCoordinator::new(store, reports, Arc::new(builder.build()), config)
}

#[tokio::test]
async fn test_session_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (id, first) = {
        let coordinator = file_coordinator(dir.path());
        let id = coordinator.open(Handshake::default()).await.unwrap().session_id;
        let event = coordinator
            .submit(id, Request::new("1", "echo", json!({"x": 1})))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        (id, event)
    };

    let coordinator = file_coordinator(dir.path());
    let resumed = coordinator
        .open(Handshake {
            session_id: Some(id),
            last_seen: Some(0),
        })
        .await
        .unwrap();
    assert!(resumed.resumed);
    assert_eq!(resumed.head, 1);
    let mut events = resumed.events(16);
    let replayed = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replayed, first);

    let next = coordinator
        .submit(id, Request::new("2", "echo", json!(2)))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(next.seq, 2);

    let err = coordinator
        .submit(id, Request::new("1", "echo", json!({"x": 1})))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CoordinatorError::DuplicateRequest(ref rid) if rid.as_str() == "1"));
}
