use std::time::Duration;

use wgprobe_core::backend::resolve_counters;
use wgprobe_core::counters::names;
use wgprobe_core::dispatch::{DispatchExtents, DispatchGeometry, WorkgroupSize};
use wgprobe_core::error::{ErrorCategory, ProbeError};
use wgprobe_core::lock::{CounterUnitLock, ExplicitLock, RetryBeginLock, RetryPolicy};
use wgprobe_core::measure::{MeasureOptions, dispatch_unmeasured, measure};
use wgprobe_core::pixel::OutputReadback;
use wgprobe_core::query::QueryKind;
use wgprobe_core::report::{ReportSink, STATS_CSV_HEADER, StatsCsv};
use wgprobe_core::simulated::{
    Event, Flavor, RecordingBackoff, SIMULATED_OCCUPANCY_PCT, SimulatedBackend,
};

fn geometry() -> DispatchGeometry {
    DispatchGeometry::new(
        DispatchExtents {
            width: 64,
            height: 64,
            depth: 1,
        },
        WorkgroupSize { x: 8, y: 8, z: 1 },
    )
    .expect("64x64x1 with 8x8x1 groups is valid")
}

fn retry_lock() -> RetryBeginLock<RecordingBackoff> {
    RetryBeginLock::new(RetryPolicy::default(), RecordingBackoff::default())
}

fn position(events: &[Event], event: &Event) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("missing event {event:?} in {events:?}"))
}

#[test]
fn legacy_measurement_follows_immediate_protocol() {
    let mut backend = SimulatedBackend::new(Flavor::Legacy).with_geometry(geometry());
    let plan = resolve_counters(&mut backend).expect("legacy counters resolve");
    let mut lock = retry_lock();
    let report = measure(
        &mut backend,
        &mut lock,
        &plan,
        &MeasureOptions::new(geometry()),
    )
    .expect("measurement succeeds");

    assert_eq!(report.threads_dispatched, 512);
    assert_eq!(report.cs_invocations, 4096);
    assert_eq!(report.simd_width, 8);
    assert_eq!(report.gpu_time_ns, 1_000 + 2 * 4096);
    assert_eq!(report.eu_occupancy_pct, SIMULATED_OCCUPANCY_PCT);
    assert_eq!(report.passes, 1);

    use Event::*;
    use QueryKind::{Metrics, PipelineStatistics as Stats};
    assert_eq!(
        backend.events(),
        vec![
            Create(Metrics),
            Create(Stats),
            Reset(Metrics),
            Reset(Stats),
            Begin(Metrics),
            Begin(Stats),
            SubmitReset,
            Wait,
            Dispatch(None),
            Wait,
            End(Stats),
            End(Metrics),
            Read(Metrics),
            Read(Stats),
            Destroy(Stats),
            Destroy(Metrics),
        ]
    );
    assert!(lock.backoff().sleeps().is_empty());
}

#[test]
fn busy_counter_unit_is_retried_without_surfacing_an_error() {
    let mut backend = SimulatedBackend::new(Flavor::Legacy).with_busy_begins(3);
    let plan = resolve_counters(&mut backend).expect("plan");
    let mut lock = retry_lock();
    measure(
        &mut backend,
        &mut lock,
        &plan,
        &MeasureOptions::new(geometry()),
    )
    .expect("contention is recovered locally");

    assert_eq!(lock.backoff().sleeps(), [Duration::from_millis(10); 3]);
    let events = backend.events();
    let busy = events
        .iter()
        .filter(|e| **e == Event::Busy(QueryKind::Metrics))
        .count();
    assert_eq!(busy, 3);
    assert!(
        position(&events, &Event::Begin(QueryKind::Metrics))
            < position(&events, &Event::Dispatch(None))
    );
}

#[test]
fn exhausted_retry_budget_is_fatal_and_cleans_up() {
    let mut backend = SimulatedBackend::new(Flavor::Legacy).with_busy_begins(u32::MAX);
    let plan = resolve_counters(&mut backend).expect("plan");
    let mut lock = RetryBeginLock::new(
        RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_millis(10),
        },
        RecordingBackoff::default(),
    );
    let err = measure(
        &mut backend,
        &mut lock,
        &plan,
        &MeasureOptions::new(geometry()),
    )
    .expect_err("budget exhausted");

    assert!(matches!(err, ProbeError::CounterUnitBusy { attempts: 5 }));
    assert_eq!(err.category(), ErrorCategory::Contention);
    assert_eq!(backend.live_queries(), 0);
    assert!(
        !backend
            .events()
            .iter()
            .any(|e| matches!(e, Event::Dispatch(_))),
        "no dispatch without a started query"
    );
}

#[test]
fn modern_multi_pass_replays_recorded_dispatch_under_lock() {
    let mut backend = SimulatedBackend::new(Flavor::Modern)
        .with_geometry(geometry())
        .with_passes(3);
    let plan = resolve_counters(&mut backend).expect("plan");
    assert_eq!(plan.passes.num_passes(), 3);
    let mut lock = ExplicitLock::new(backend.profiling_lock(), None);

    let report = measure(
        &mut backend,
        &mut lock,
        &plan,
        &MeasureOptions::new(geometry()),
    )
    .expect("multi-pass measurement succeeds");
    assert_eq!(report.passes, 3);
    assert_eq!(report.threads_dispatched, 512);

    let events = backend.events();
    let dispatches: Vec<&Event> = events
        .iter()
        .filter(|e| matches!(e, Event::Dispatch(_)))
        .collect();
    assert_eq!(
        dispatches,
        [
            &Event::Dispatch(Some(0)),
            &Event::Dispatch(Some(1)),
            &Event::Dispatch(Some(2))
        ]
    );
    assert_eq!(
        events.iter().filter(|e| **e == Event::SubmitReset).count(),
        1,
        "reset is submitted once, before the first pass"
    );
    assert_eq!(
        events.iter().filter(|e| **e == Event::Recorded).count(),
        1,
        "every pass replays the same recording"
    );

    let acquired = position(&events, &Event::LockAcquired);
    let released = position(&events, &Event::LockReleased);
    assert!(acquired < position(&events, &Event::Begin(QueryKind::Metrics)));
    assert!(released > position(&events, &Event::Dispatch(Some(2))));
    assert!(released < position(&events, &Event::Read(QueryKind::Metrics)));
    assert!(!lock.is_held());
}

#[test]
fn short_result_read_is_rejected_and_queries_destroyed() {
    let mut backend = SimulatedBackend::new(Flavor::Modern).with_short_read(8);
    let plan = resolve_counters(&mut backend).expect("plan");
    let mut lock = ExplicitLock::new(backend.profiling_lock(), None);
    let err = measure(
        &mut backend,
        &mut lock,
        &plan,
        &MeasureOptions::new(geometry()),
    )
    .expect_err("short read is fatal");

    assert!(matches!(
        err,
        ProbeError::ResultSizeMismatch {
            expected: 24,
            actual: 16,
            ..
        }
    ));
    assert_eq!(err.category(), ErrorCategory::ResultIntegrity);
    assert_eq!(backend.live_queries(), 0);
}

#[test]
fn missing_counter_aborts_before_any_query_or_dispatch() {
    let mut backend =
        SimulatedBackend::new(Flavor::Legacy).without_counter(names::EU_THREAD_OCCUPANCY);
    let err = resolve_counters(&mut backend).expect_err("missing counter");
    assert!(matches!(
        err,
        ProbeError::CounterNotFound { ref counter, .. } if counter == names::EU_THREAD_OCCUPANCY
    ));
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(backend.events().is_empty());
}

#[test]
fn busy_begin_under_profiling_lock_is_a_lock_error() {
    let mut backend = SimulatedBackend::new(Flavor::Modern).with_busy_begins(1);
    let plan = resolve_counters(&mut backend).expect("plan");
    let mut lock = ExplicitLock::new(backend.profiling_lock(), None);
    let err = measure(
        &mut backend,
        &mut lock,
        &plan,
        &MeasureOptions::new(geometry()),
    )
    .expect_err("busy while locked");
    assert!(matches!(err, ProbeError::ProfilingLock(_)));
    assert_eq!(backend.live_queries(), 0);
    assert!(backend.events().contains(&Event::LockReleased));
}

#[test]
fn unmeasured_run_dispatches_once_and_reads_back() {
    let geometry = geometry();
    assert_eq!(geometry.num_groups(), [8, 8, 1]);

    let mut backend = SimulatedBackend::new(Flavor::Legacy).with_geometry(geometry);
    dispatch_unmeasured(&mut backend, &MeasureOptions::new(geometry)).expect("dispatch");
    assert_eq!(backend.events(), vec![Event::Dispatch(None), Event::Wait]);

    let pixels = backend.read_output().expect("output after completion");
    assert_eq!(pixels.len(), 64 * 64);
    assert_eq!(pixels[0].num_work_groups.x, 8);
}

#[test]
fn measured_csv_run_appends_exactly_one_row() {
    let mut backend = SimulatedBackend::new(Flavor::Legacy).with_geometry(geometry());
    let plan = resolve_counters(&mut backend).expect("plan");
    let report = measure(
        &mut backend,
        &mut retry_lock(),
        &plan,
        &MeasureOptions::new(geometry()),
    )
    .expect("measurement");

    let mut csv = StatsCsv::new(Vec::new()).expect("header");
    csv.emit(&report).expect("row");
    let text = String::from_utf8(csv.into_inner()).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], STATS_CSV_HEADER);
    let fields: Vec<&str> = lines[1].split(',').collect();
    assert_eq!(fields.len(), 9);
    assert!(fields.iter().all(|f| f.parse::<i64>().is_ok()), "{fields:?}");
    assert_eq!(&fields[..3], ["8", "8", "1"]);
    assert_eq!(fields[6], "8");
}
