//! Query session lifecycle.
//!
//! A [`QuerySession`] owns one hardware query object per query kind for the
//! duration of a single measurement and walks them through
//! `open → reset → begin → end → close`. Out-of-order calls are rejected with
//! [`ProbeError::QueryState`] instead of being forwarded to the driver.

use std::fmt;

use tracing::{debug, warn};

use crate::counters::CounterSet;
use crate::error::{ProbeError, Result};
use crate::lock::CounterUnitLock;
use crate::schedule::PassPlan;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Vendor performance counters (occupancy, threads, GPU time).
    Metrics,
    /// Pipeline statistics (compute shader invocations).
    PipelineStatistics,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metrics => f.write_str("metrics"),
            Self::PipelineStatistics => f.write_str("pipeline-statistics"),
        }
    }
}

/// Result of a single begin attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeginStatus {
    Started,
    /// Another client holds the counter unit; nothing was started.
    Busy,
}

/// Driver-side query object operations.
pub trait QueryDevice {
    type Handle: Copy + fmt::Debug;

    fn create_query(
        &mut self,
        kind: QueryKind,
        counters: &CounterSet,
        plan: &PassPlan,
    ) -> Result<Self::Handle>;

    fn reset_query(&mut self, handle: Self::Handle) -> Result<()>;

    fn begin_query(&mut self, handle: Self::Handle) -> Result<BeginStatus>;

    fn end_query(&mut self, handle: Self::Handle) -> Result<()>;

    /// Blocking read into `out`; returns the number of bytes the driver wrote.
    fn read_query(&mut self, handle: Self::Handle, out: &mut [u8]) -> Result<usize>;

    fn destroy_query(&mut self, handle: Self::Handle);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Open,
    Reset,
    Active,
    Ended,
    Closed,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Reset => "reset",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Closed => "closed",
        }
    }
}

/// One query object bound to a counter set.
#[derive(Debug)]
pub struct SessionQuery<H> {
    pub kind: QueryKind,
    pub handle: H,
    pub counters: CounterSet,
}

pub struct QuerySession<H> {
    queries: Vec<SessionQuery<H>>,
    plan: PassPlan,
    state: SessionState,
}

impl<H: Copy + fmt::Debug> QuerySession<H> {
    /// Create one query object per counter set.
    ///
    /// If any creation fails, the objects created so far are destroyed
    /// before the error is returned.
    pub fn open<D>(device: &mut D, sets: &[(QueryKind, CounterSet)], plan: PassPlan) -> Result<Self>
    where
        D: QueryDevice<Handle = H> + ?Sized,
    {
        let mut queries: Vec<SessionQuery<H>> = Vec::with_capacity(sets.len());
        for (kind, counters) in sets {
            match device.create_query(*kind, counters, &plan) {
                Ok(handle) => {
                    debug!(%kind, ?handle, query = counters.query(), "created query");
                    queries.push(SessionQuery {
                        kind: *kind,
                        handle,
                        counters: counters.clone(),
                    });
                }
                Err(err) => {
                    for query in queries.iter().rev() {
                        device.destroy_query(query.handle);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self {
            queries,
            plan,
            state: SessionState::Open,
        })
    }

    pub fn plan(&self) -> &PassPlan {
        &self.plan
    }

    pub fn queries(&self) -> &[SessionQuery<H>] {
        &self.queries
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    fn expect_state(&self, op: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ProbeError::QueryState {
                op,
                state: self.state.name(),
            })
        }
    }

    /// Must precede the first begin.
    pub fn reset<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: QueryDevice<Handle = H> + ?Sized,
    {
        self.expect_state("reset", &[SessionState::Open, SessionState::Ended])?;
        for query in &self.queries {
            device.reset_query(query.handle)?;
        }
        self.state = SessionState::Reset;
        Ok(())
    }

    /// Begin every query, each through `lock` so contention is handled by
    /// the lock's policy.
    ///
    /// If a later query fails to begin, the ones already begun are ended
    /// again before the error is returned.
    pub fn begin<D, L>(&mut self, device: &mut D, lock: &mut L) -> Result<()>
    where
        D: QueryDevice<Handle = H> + ?Sized,
        L: CounterUnitLock + ?Sized,
    {
        self.expect_state("begin", &[SessionState::Reset])?;
        for (started, query) in self.queries.iter().enumerate() {
            let handle = query.handle;
            let outcome = lock.begin(&mut || device.begin_query(handle));
            if let Err(err) = outcome {
                for begun in self.queries[..started].iter().rev() {
                    if let Err(end_err) = device.end_query(begun.handle) {
                        warn!(error = %end_err, kind = %begun.kind, "failed to end query after begin failure");
                    }
                }
                self.state = SessionState::Ended;
                return Err(err);
            }
        }
        self.state = SessionState::Active;
        Ok(())
    }

    /// End every query, in reverse begin order.
    pub fn end<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: QueryDevice<Handle = H> + ?Sized,
    {
        self.expect_state("end", &[SessionState::Active])?;
        // Leave the session ended even if one end fails, so close does not
        // try to end it a second time.
        self.state = SessionState::Ended;
        let mut first_err = None;
        for query in self.queries.iter().rev() {
            if let Err(err) = device.end_query(query.handle)
                && first_err.is_none()
            {
                first_err = Some(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Blocking read of every query's raw result, in open order.
    pub fn read_all<D>(&self, device: &mut D) -> Result<Vec<(QueryKind, Vec<u8>, usize)>>
    where
        D: QueryDevice<Handle = H> + ?Sized,
    {
        self.expect_state("read", &[SessionState::Ended])?;
        let mut results = Vec::with_capacity(self.queries.len());
        for query in &self.queries {
            let mut raw = vec![0u8; query.counters.result_size()];
            let written = device.read_query(query.handle, &mut raw)?;
            debug!(kind = %query.kind, written, expected = raw.len(), "read query result");
            results.push((query.kind, raw, written));
        }
        Ok(results)
    }

    /// Destroy every query object exactly once. Ends an active session first.
    pub fn close<D>(mut self, device: &mut D)
    where
        D: QueryDevice<Handle = H> + ?Sized,
    {
        if self.state == SessionState::Active
            && let Err(err) = self.end(device)
        {
            warn!(error = %err, "failed to end active queries during close");
        }
        for query in self.queries.drain(..).rev() {
            debug!(kind = %query.kind, handle = ?query.handle, "destroying query");
            device.destroy_query(query.handle);
        }
        self.state = SessionState::Closed;
    }
}

impl<H> Drop for QuerySession<H> {
    fn drop(&mut self) {
        if self.state != SessionState::Closed && !self.queries.is_empty() {
            warn!(
                leaked = self.queries.len(),
                "query session dropped without close; query objects leaked"
            );
        }
    }
}
