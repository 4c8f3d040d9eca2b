//! Backend-agnostic measurement driver.

use std::time::Duration;

use tracing::{debug, info, info_span};

use crate::backend::{Bracketing, CounterBackend, CounterPlan};
use crate::dispatch::DispatchGeometry;
use crate::error::Result;
use crate::extract::{self, ExtractedCounters};
use crate::lock::{CounterUnitLock, LockGuard};
use crate::query::QuerySession;
use crate::report::MeasurementReport;
use crate::schedule::{self, PassRun};

/// Default bound on a single fence wait.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(100);

#[derive(Clone, Copy, Debug)]
pub struct MeasureOptions {
    pub geometry: DispatchGeometry,
    pub fence_timeout: Duration,
}

impl MeasureOptions {
    pub fn new(geometry: DispatchGeometry) -> Self {
        Self {
            geometry,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
        }
    }
}

/// Run one counter-instrumented dispatch and return its report.
///
/// `plan` comes from [`crate::backend::resolve_counters`]. Every query object
/// opened here is destroyed before returning, and the counter unit is
/// released on every path.
pub fn measure<B, L>(
    backend: &mut B,
    lock: &mut L,
    plan: &CounterPlan,
    options: &MeasureOptions,
) -> Result<MeasurementReport>
where
    B: CounterBackend + ?Sized,
    L: CounterUnitLock + ?Sized,
{
    let span = info_span!("measure", backend = backend.name());
    let _enter = span.enter();

    let mut session = QuerySession::open(backend, &plan.sets, plan.passes)?;
    let outcome = run_session(backend, lock, &mut session, options);
    session.close(backend);
    let (run, counters) = outcome?;

    let report = MeasurementReport::from_counters(
        backend.name(),
        options.geometry.workgroup,
        &counters,
        &run,
    )?;
    info!(
        passes = run.passes,
        gpu_time_ns = report.gpu_time_ns,
        cpu_time_ns = report.cpu_time_ns,
        "measurement complete"
    );
    Ok(report)
}

fn run_session<B, L>(
    backend: &mut B,
    lock: &mut L,
    session: &mut QuerySession<B::Handle>,
    options: &MeasureOptions,
) -> Result<(PassRun, ExtractedCounters)>
where
    B: CounterBackend + ?Sized,
    L: CounterUnitLock + ?Sized,
{
    let plan = *session.plan();
    let run = {
        let mut guard = LockGuard::acquire(lock)?;
        session.reset(backend)?;
        session.begin(backend, guard.lock())?;

        match backend.bracketing() {
            Bracketing::Recorded => {
                backend.record_dispatch()?;
                session.end(backend)?;
                schedule::run_passes(backend, &plan, options.fence_timeout)?
            }
            Bracketing::Immediate => {
                let run = schedule::run_passes(backend, &plan, options.fence_timeout);
                // End even when the dispatch failed so the unit is not left busy.
                let ended = session.end(backend);
                let run = run?;
                ended?;
                run
            }
        }
    };
    debug!(
        passes = run.passes,
        cpu_time_ns = run.cpu_time_ns(),
        "passes complete, counter unit released"
    );

    let mut counters = ExtractedCounters::default();
    let results = session.read_all(backend)?;
    for ((_, raw, written), query) in results.iter().zip(session.queries()) {
        counters.merge(extract::extract(&query.counters, raw, *written)?);
    }
    Ok((run, counters))
}

/// One dispatch without counters: no query object, no reset, no lock.
pub fn dispatch_unmeasured<B>(backend: &mut B, options: &MeasureOptions) -> Result<()>
where
    B: CounterBackend + ?Sized,
{
    let span = info_span!("dispatch", backend = backend.name(), measured = false);
    let _enter = span.enter();
    if backend.bracketing() == Bracketing::Recorded {
        backend.record_dispatch()?;
    }
    schedule::run_unmeasured(backend, options.fence_timeout)?;
    info!(groups = ?options.geometry.num_groups(), "unmeasured dispatch complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::resolve_counters;
    use crate::dispatch::{DispatchExtents, WorkgroupSize};
    use crate::error::ProbeError;
    use crate::lock::{ExplicitLock, RetryBeginLock, RetryPolicy};
    use crate::simulated::{Event, Flavor, RecordingBackoff, SimulatedBackend};

    fn options() -> MeasureOptions {
        let geometry = DispatchGeometry::new(
            DispatchExtents {
                width: 64,
                height: 64,
                depth: 1,
            },
            WorkgroupSize { x: 8, y: 8, z: 1 },
        )
        .expect("geometry");
        MeasureOptions::new(geometry)
    }

    #[test]
    fn immediate_backend_ends_queries_after_failed_dispatch() {
        let mut backend = SimulatedBackend::new(Flavor::Legacy).failing_submit_at(1);
        let plan = resolve_counters(&mut backend).expect("plan");
        let mut lock = RetryBeginLock::new(RetryPolicy::default(), RecordingBackoff::default());
        let err = measure(&mut backend, &mut lock, &plan, &options()).expect_err("submit fails");
        assert!(matches!(err, ProbeError::Submission(_)));
        assert_eq!(backend.live_queries(), 0);
        assert_eq!(backend.active_queries(), 0);
        assert!(!lock.is_held());
    }

    #[test]
    fn recorded_backend_releases_lock_after_fence_timeout() {
        let mut backend = SimulatedBackend::new(Flavor::Modern).failing_wait_at(2);
        let plan = resolve_counters(&mut backend).expect("plan");
        let mut lock = ExplicitLock::new(backend.profiling_lock(), None);
        let err = measure(&mut backend, &mut lock, &plan, &options()).expect_err("wait fails");
        assert!(matches!(err, ProbeError::FenceTimeout { .. }));
        assert!(!lock.is_held());
        assert_eq!(backend.live_queries(), 0);
        assert!(backend.events().contains(&Event::LockReleased));
    }

    #[test]
    fn unmeasured_dispatch_touches_no_query() {
        let mut backend = SimulatedBackend::new(Flavor::Modern);
        dispatch_unmeasured(&mut backend, &options()).expect("dispatch");
        assert_eq!(
            backend.events(),
            vec![Event::Recorded, Event::Dispatch(None), Event::Wait]
        );
    }
}
