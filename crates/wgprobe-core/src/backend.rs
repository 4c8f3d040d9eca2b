//! Backend capability: what a counter-query mechanism must provide so the
//! backend-agnostic orchestrator in [`crate::measure`] can drive it.

use tracing::{debug, info};

use crate::counters::{self, Catalog, CounterExpectation, CounterSet};
use crate::error::Result;
use crate::query::{QueryDevice, QueryKind};
use crate::schedule::{PassPlan, Submitter};

/// How query begin/end relate to the dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bracketing {
    /// Begin, dispatch and end are recorded into a command buffer that is
    /// replayed once per pass.
    Recorded,
    /// Begin and end execute immediately around the submitted dispatch.
    Immediate,
}

/// A GPU counter-query backend.
///
/// Backends own their device, pipeline and output buffer; the orchestrator
/// only sees query objects, submissions and counter catalogs.
pub trait CounterBackend: QueryDevice + Submitter {
    /// Short name used in logs and reports.
    fn name(&self) -> &'static str;

    fn bracketing(&self) -> Bracketing;

    /// Query kinds this backend opens, in begin order.
    fn query_kinds(&self) -> &'static [QueryKind] {
        &[QueryKind::Metrics, QueryKind::PipelineStatistics]
    }

    /// Enumerate every counter the driver exposes for `kind`.
    fn enumerate_counters(&mut self, kind: QueryKind) -> Result<Catalog>;

    /// Counters this backend requires from `kind`, with their contract.
    fn expectations(&self, kind: QueryKind) -> &'static [CounterExpectation];

    /// Number of replays needed to sample every resolved set once.
    fn plan_passes(&mut self, sets: &[(QueryKind, CounterSet)]) -> Result<PassPlan>;

    /// Record the bind, dispatch and completion barrier between the begin
    /// and end of the queries. Only called on [`Bracketing::Recorded`]
    /// backends, and once more without queries for unmeasured runs.
    fn record_dispatch(&mut self) -> Result<()>;
}

/// Resolved counter sets plus the pass plan that samples them.
#[derive(Clone, Debug, PartialEq)]
pub struct CounterPlan {
    pub sets: Vec<(QueryKind, CounterSet)>,
    pub passes: PassPlan,
}

impl CounterPlan {
    pub fn set(&self, kind: QueryKind) -> Option<&CounterSet> {
        self.sets.iter().find(|(k, _)| *k == kind).map(|(_, s)| s)
    }
}

/// Enumerate, resolve and plan every query kind the backend exposes.
///
/// Runs before any query object exists. Any missing or mistyped counter
/// fails the whole plan.
pub fn resolve_counters<B>(backend: &mut B) -> Result<CounterPlan>
where
    B: CounterBackend + ?Sized,
{
    let mut sets = Vec::with_capacity(backend.query_kinds().len());
    for &kind in backend.query_kinds() {
        let catalog = backend.enumerate_counters(kind)?;
        debug!(
            backend = backend.name(),
            %kind,
            query = %catalog.query,
            counters = catalog.entries.len(),
            "enumerated counter catalog"
        );
        let set = counters::resolve(&catalog, backend.expectations(kind))?;
        sets.push((kind, set));
    }
    let passes = backend.plan_passes(&sets)?;
    info!(
        backend = backend.name(),
        passes = passes.num_passes(),
        "counter plan ready"
    );
    Ok(CounterPlan { sets, passes })
}
