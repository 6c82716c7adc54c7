// tests/engine_generator.rs

mod common;
use crate::common::{FIELD, MODEL, engine_options, init_tracing, registry_with, wait_until, with_timeout};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use fieldgen::engine::{
    CancelFlag, EngineOptions, GenerationRequest, Generator, IterCursor, RowCursor, RunSummary,
};
use fieldgen::errors::{GenerationError, StoreError};
use fieldgen::types::{BoxFuture, ErrorPolicy, RowId};
use fieldgen_test_utils::builders::{field_spec, id_snapshot, requests};
use fieldgen_test_utils::fakes::{RecordingHandler, RecordingSink, ScriptedBackend};

fn prepare(backend: &Arc<ScriptedBackend>, options: EngineOptions) -> Generator {
    let registry = registry_with(Arc::clone(backend));
    let sink = RecordingSink::new();
    Generator::prepare(&field_spec(FIELD, "scripted", MODEL), &registry, &sink, options)
        .expect("scripted field should prepare")
}

fn with_workers(max_concurrency: usize) -> EngineOptions {
    EngineOptions {
        max_concurrency,
        ..engine_options()
    }
}

/// Yields rows `1..=last_ok`, then fails.
struct FailingCursor {
    next: RowId,
    last_ok: RowId,
}

impl RowCursor for FailingCursor {
    fn next_request(&mut self) -> BoxFuture<'_, Result<Option<GenerationRequest>, StoreError>> {
        let result = if self.next > self.last_ok {
            Err(StoreError::Unavailable("table went away".to_string()))
        } else {
            let request = GenerationRequest::new(self.next, id_snapshot(self.next));
            self.next += 1;
            Ok(Some(request))
        };
        Box::pin(std::future::ready(result))
    }
}

#[tokio::test]
async fn ten_rows_with_three_workers_all_succeed() {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]).with_delay(Duration::from_millis(5)));
    let generator = prepare(&backend, with_workers(3));

    let mut cursor = IterCursor::new(requests(1..=10));
    let mut handler = RecordingHandler::new();
    let summary = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect("run should succeed");

    assert_eq!(summary.dispatched, 10);
    assert_eq!(summary.finished, 10);
    assert_eq!(summary.failed, 0);
    assert_eq!(handler.applied.len(), 10);
    assert_eq!(handler.applied[&4], "value for row 4");
    assert!(backend.peak() <= 3, "peak was {}", backend.peak());
}

#[tokio::test]
async fn failing_row_is_reported_after_every_row_drained() {
    init_tracing();
    // Row 3 answers last, so rows 4 and 5 are already dispatched when its
    // failure is observed.
    let backend = Arc::new(
        ScriptedBackend::new(&[MODEL])
            .with_delay(Duration::from_millis(1))
            .slow_on("row 3", Duration::from_millis(100))
            .failing_on("row 3"),
    );
    let generator = prepare(&backend, with_workers(2));

    let mut cursor = IterCursor::new(requests(1..=5));
    let mut handler = RecordingHandler::new();
    let err = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect_err("row 3 fails");

    match err {
        GenerationError::Aggregate(message) => assert!(message.contains("row 3"), "{message}"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(handler.seen_rows(), vec![1, 2, 3, 4, 5]);
    assert_eq!(handler.applied.len(), 4);
    assert!(!handler.applied.contains_key(&3));
}

#[tokio::test]
async fn no_row_is_dispatched_after_the_first_failure() {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]).failing_on("row 2"));
    let generator = prepare(&backend, with_workers(1));

    let mut cursor = IterCursor::new(requests(1..=5));
    let mut handler = RecordingHandler::new();
    let err = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect_err("row 2 fails");

    assert!(matches!(err, GenerationError::Aggregate(_)));
    assert_eq!(backend.calls(), vec!["row 1", "row 2"]);
    assert_eq!(handler.seen_rows(), vec![1, 2]);
}

#[tokio::test]
async fn rows_are_dispatched_in_cursor_order() {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]));
    let generator = prepare(&backend, with_workers(1));

    let mut cursor = IterCursor::new(requests([5, 2, 9]));
    let mut handler = RecordingHandler::new();
    with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect("run should succeed");

    assert_eq!(backend.calls(), vec!["row 5", "row 2", "row 9"]);
}

#[tokio::test]
async fn in_flight_rows_never_exceed_max_concurrency() {
    init_tracing();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]).gated(Arc::clone(&gate)));
    let generator = prepare(&backend, with_workers(3));

    let run = {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move {
            let mut cursor = IterCursor::new(requests(1..=10));
            let mut handler = RecordingHandler::new();
            let summary = generator.process(&mut cursor, &mut handler).await;
            (summary, handler, backend)
        })
    };

    wait_until(|| backend.in_flight() == 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.in_flight(), 3);
    assert_eq!(backend.call_count(), 3);

    gate.add_permits(10);
    let (summary, handler, backend) = with_timeout(run).await.expect("run task panicked");
    let summary = summary.expect("run should succeed");

    assert_eq!(summary.finished, 10);
    assert_eq!(handler.applied.len(), 10);
    assert_eq!(backend.peak(), 3);
}

#[tokio::test]
async fn field_max_concurrency_overrides_engine_default() {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]).with_delay(Duration::from_millis(2)));
    let registry = registry_with(Arc::clone(&backend));
    let mut field = field_spec(FIELD, "scripted", MODEL);
    field.max_concurrency = Some(1);

    let generator = Generator::prepare(&field, &registry, &RecordingSink::new(), with_workers(4))
        .expect("field should prepare");
    assert_eq!(generator.max_concurrency(), 1);

    let mut cursor = IterCursor::new(requests(1..=6));
    let mut handler = RecordingHandler::new();
    with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect("run should succeed");

    assert_eq!(backend.peak(), 1);
    assert_eq!(handler.applied.len(), 6);
}

#[tokio::test]
async fn duplicate_row_ids_are_dispatched_once() {
    init_tracing();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]).gated(Arc::clone(&gate)));
    let generator = prepare(&backend, with_workers(3));
    gate.add_permits(3);

    let mut cursor = IterCursor::new(requests([1, 1, 2]));
    let mut handler = RecordingHandler::new();
    let summary = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect("run should succeed");

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.finished, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.finished + summary.skipped, 3, "every yielded row is accounted for");
    assert_eq!(backend.call_count(), 2);
    assert_eq!(handler.seen_rows(), vec![1, 2]);
}

#[tokio::test]
async fn error_policy_all_keeps_every_message() {
    init_tracing();
    let backend = Arc::new(
        ScriptedBackend::new(&[MODEL])
            .failing_on("row 1")
            .failing_on("row 2"),
    );
    let options = EngineOptions {
        error_policy: ErrorPolicy::All,
        ..with_workers(3)
    };
    let generator = prepare(&backend, options);

    let mut cursor = IterCursor::new(requests(1..=3));
    let mut handler = RecordingHandler::new();
    let err = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect_err("two rows fail");

    let message = err.to_string();
    assert!(message.starts_with("AI model responded with errors"), "{message}");
    assert!(message.contains("row 1"), "{message}");
    assert!(message.contains("row 2"), "{message}");
    assert_eq!(handler.applied.len(), 1);
}

#[tokio::test]
async fn error_policy_first_keeps_one_message() {
    init_tracing();
    let backend = Arc::new(
        ScriptedBackend::new(&[MODEL])
            .failing_on("row 1")
            .failing_on("row 2"),
    );
    let generator = prepare(&backend, with_workers(3));

    let mut cursor = IterCursor::new(requests(1..=3));
    let mut handler = RecordingHandler::new();
    let err = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect_err("two rows fail");

    let message = err.to_string();
    assert_eq!(message.matches("scripted failure").count(), 1, "{message}");
}

#[tokio::test]
async fn cancel_stops_dispatch_but_drains_rows_in_flight() {
    init_tracing();
    let gate = Arc::new(Semaphore::new(0));
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]).gated(Arc::clone(&gate)));
    let cancel = CancelFlag::new();
    let generator = prepare(&backend, with_workers(3)).with_cancel(cancel.clone());

    let run = tokio::spawn(async move {
        let mut cursor = IterCursor::new(requests(1..=6));
        let mut handler = RecordingHandler::new();
        let summary = generator.process(&mut cursor, &mut handler).await;
        (summary, handler)
    });

    wait_until(|| backend.in_flight() == 3).await;
    cancel.cancel();
    gate.add_permits(6);

    let (summary, handler) = with_timeout(run).await.expect("run task panicked");
    let summary = summary.expect("cancelled run is not a failure");

    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.finished, 3);
    assert_eq!(handler.seen_rows(), vec![1, 2, 3]);
    assert_eq!(backend.call_count(), 3);
}

#[tokio::test]
async fn vanished_row_is_a_soft_skip() {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]));
    let generator = prepare(&backend, with_workers(2));

    let mut cursor = IterCursor::new(requests(1..=5));
    let mut handler = RecordingHandler::new().with_gone(2);
    let summary = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect("a vanished row does not fail the run");

    assert_eq!(summary.finished, 5);
    assert_eq!(summary.skipped, 1);
    assert_eq!(handler.applied.len(), 4);
}

#[tokio::test]
async fn apply_failure_stops_dispatch_without_failing_the_run() {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]));
    let generator = prepare(&backend, with_workers(1));

    let mut cursor = IterCursor::new(requests(1..=5));
    let mut handler = RecordingHandler::new().with_broken(2);
    let summary = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect("apply failures are not row failures");

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(backend.calls(), vec!["row 1", "row 2"]);
}

#[tokio::test]
async fn row_source_error_is_returned_after_draining() {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]).with_delay(Duration::from_millis(5)));
    let generator = prepare(&backend, with_workers(3));

    let mut cursor = FailingCursor { next: 1, last_ok: 2 };
    let mut handler = RecordingHandler::new();
    let err = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect_err("the source fails after two rows");

    assert!(matches!(err, GenerationError::RowSource(_)), "{err:?}");
    assert_eq!(handler.seen_rows(), vec![1, 2]);
    assert_eq!(handler.applied.len(), 2);
}

#[tokio::test]
async fn panicking_backend_fails_only_its_row() {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]).panicking_on("row 2"));
    let generator = prepare(&backend, with_workers(3));

    let mut cursor = IterCursor::new(requests(1..=3));
    let mut handler = RecordingHandler::new();
    let err = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect_err("the panicking row fails");

    assert!(err.to_string().contains("generation task failed"), "{err}");
    assert_eq!(handler.seen_rows(), vec![1, 2, 3]);
    assert_eq!(handler.applied.len(), 2);
}

#[tokio::test]
async fn empty_cursor_finishes_immediately() {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new(&[MODEL]));
    let generator = prepare(&backend, with_workers(3));

    let mut cursor = IterCursor::new(Vec::<GenerationRequest>::new());
    let mut handler = RecordingHandler::new();
    let summary = with_timeout(generator.process(&mut cursor, &mut handler))
        .await
        .expect("nothing to do is a success");

    assert_eq!(summary, RunSummary::default());
    assert_eq!(backend.call_count(), 0);
}

#[test]
fn unknown_backend_is_reported_without_rows() {
    init_tracing();
    let registry = registry_with(Arc::new(ScriptedBackend::new(&[MODEL])));
    let sink = RecordingSink::new();

    let err = Generator::prepare(
        &field_spec(FIELD, "missing", MODEL),
        &registry,
        &sink,
        engine_options(),
    )
    .expect_err("backend is not registered");

    assert!(err.is_configuration());
    assert!(matches!(err, GenerationError::UnknownBackend(ref name) if name == "missing"));
    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].field, FIELD);
    assert!(reports[0].rows.is_empty());
}

#[test]
fn disabled_model_fails_preparation() {
    init_tracing();
    let registry = registry_with(Arc::new(ScriptedBackend::new(&[MODEL])));
    let sink = RecordingSink::new();

    let err = Generator::prepare(
        &field_spec(FIELD, "scripted", "other-model"),
        &registry,
        &sink,
        engine_options(),
    )
    .expect_err("model is not enabled");

    assert!(matches!(err, GenerationError::ModelUnavailable { .. }));
    assert!(sink.reports()[0].message.contains("other-model"));
}
