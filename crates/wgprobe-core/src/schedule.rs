//! Multi-pass submission scheduling.
//!
//! Some counter sets can only be sampled by replaying the same command
//! sequence several times. The schedule is strictly sequential: pass `n + 1`
//! is not submitted before pass `n` has completed, because every pass begins
//! and ends the same query object.

use std::time::{Duration, Instant};

use tracing::{debug, info_span};

use crate::error::{ProbeError, Result};

/// Number of full replays needed to sample a counter selection once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassPlan {
    num_passes: u32,
}

impl PassPlan {
    /// Plan for single-pass mechanisms.
    pub const fn single() -> Self {
        Self { num_passes: 1 }
    }

    pub fn new(num_passes: u32) -> Result<Self> {
        if num_passes == 0 {
            return Err(ProbeError::InvalidConfig(
                "driver reported zero passes for the selected counters".into(),
            ));
        }
        Ok(Self { num_passes })
    }

    pub fn num_passes(&self) -> u32 {
        self.num_passes
    }

    pub fn is_multi_pass(&self) -> bool {
        self.num_passes > 1
    }

    /// Pass-index metadata for `pass`; single-pass plans carry none.
    pub fn pass_index(&self, pass: u32) -> Option<u32> {
        self.is_multi_pass().then_some(pass)
    }
}

impl Default for PassPlan {
    fn default() -> Self {
        Self::single()
    }
}

/// Submission half of a backend.
pub trait Submitter {
    /// Submit the query reset work on its own.
    fn submit_reset(&mut self) -> Result<()>;

    /// Submit the dispatch, tagged with a pass index on multi-pass plans.
    fn submit_dispatch(&mut self, pass_index: Option<u32>) -> Result<()>;

    /// Block until everything submitted so far has completed.
    ///
    /// Must fail with [`ProbeError::FenceTimeout`] rather than return early.
    fn wait_complete(&mut self, timeout: Duration) -> Result<()>;
}

/// Outcome of a completed schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassRun {
    pub passes: u32,
    /// Wall-clock time across the dispatch and wait region of every pass.
    pub cpu_time: Duration,
}

impl PassRun {
    pub fn cpu_time_ns(&self) -> u64 {
        u64::try_from(self.cpu_time.as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Reset once, then dispatch and wait `plan.num_passes()` times.
///
/// Any failure aborts the schedule; no partial run is reported.
pub fn run_passes<S>(submitter: &mut S, plan: &PassPlan, timeout: Duration) -> Result<PassRun>
where
    S: Submitter + ?Sized,
{
    let span = info_span!("passes", passes = plan.num_passes());
    let _enter = span.enter();

    submitter.submit_reset()?;
    submitter.wait_complete(timeout)?;

    let start = Instant::now();
    for pass in 0..plan.num_passes() {
        let pass_index = plan.pass_index(pass);
        debug!(pass, ?pass_index, "submitting dispatch");
        submitter.submit_dispatch(pass_index)?;
        submitter.wait_complete(timeout)?;
    }
    let cpu_time = start.elapsed();

    Ok(PassRun {
        passes: plan.num_passes(),
        cpu_time,
    })
}

/// One reset-free dispatch and wait, for runs without counters.
pub fn run_unmeasured<S>(submitter: &mut S, timeout: Duration) -> Result<()>
where
    S: Submitter + ?Sized,
{
    submitter.submit_dispatch(None)?;
    submitter.wait_complete(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Op {
        Reset,
        Dispatch(Option<u32>),
        Wait,
    }

    #[derive(Default)]
    struct Recorder {
        ops: Vec<Op>,
        fail_wait_at: Option<usize>,
        waits: usize,
    }

    impl Submitter for Recorder {
        fn submit_reset(&mut self) -> Result<()> {
            self.ops.push(Op::Reset);
            Ok(())
        }

        fn submit_dispatch(&mut self, pass_index: Option<u32>) -> Result<()> {
            self.ops.push(Op::Dispatch(pass_index));
            Ok(())
        }

        fn wait_complete(&mut self, timeout: Duration) -> Result<()> {
            self.ops.push(Op::Wait);
            self.waits += 1;
            if self.fail_wait_at == Some(self.waits) {
                return Err(ProbeError::FenceTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Ok(())
        }
    }

    #[test]
    fn single_pass_is_one_cycle_without_index() {
        let mut rec = Recorder::default();
        let run = run_passes(&mut rec, &PassPlan::single(), Duration::from_secs(1))
            .expect("single pass runs");
        assert_eq!(run.passes, 1);
        assert_eq!(
            rec.ops,
            vec![Op::Reset, Op::Wait, Op::Dispatch(None), Op::Wait]
        );
    }

    #[test]
    fn multi_pass_threads_indices_sequentially() {
        let mut rec = Recorder::default();
        let plan = PassPlan::new(3).expect("three passes");
        let run = run_passes(&mut rec, &plan, Duration::from_secs(1)).expect("passes run");
        assert_eq!(run.passes, 3);
        assert_eq!(
            rec.ops,
            vec![
                Op::Reset,
                Op::Wait,
                Op::Dispatch(Some(0)),
                Op::Wait,
                Op::Dispatch(Some(1)),
                Op::Wait,
                Op::Dispatch(Some(2)),
                Op::Wait,
            ]
        );
    }

    #[test]
    fn fence_timeout_aborts_remaining_passes() {
        let mut rec = Recorder {
            fail_wait_at: Some(3),
            ..Recorder::default()
        };
        let plan = PassPlan::new(4).expect("four passes");
        let err = run_passes(&mut rec, &plan, Duration::from_millis(250))
            .expect_err("timeout must abort");
        assert!(matches!(err, ProbeError::FenceTimeout { timeout_ms: 250 }));
        let dispatches = rec
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Dispatch(_)))
            .count();
        assert_eq!(dispatches, 2);
    }

    #[test]
    fn unmeasured_run_skips_reset() {
        let mut rec = Recorder::default();
        run_unmeasured(&mut rec, Duration::from_secs(1)).expect("unmeasured run");
        assert_eq!(rec.ops, vec![Op::Dispatch(None), Op::Wait]);
    }

    #[test]
    fn zero_passes_is_a_configuration_error() {
        let err = PassPlan::new(0).expect_err("zero passes");
        assert!(matches!(err, ProbeError::InvalidConfig(_)));
    }
}
