//! Deterministic stand-in for a GPU counter unit.
//!
//! [`SimulatedBackend`] implements [`CounterBackend`] without hardware. It
//! exposes catalogs shaped like the two real mechanisms ([`Flavor::Legacy`]
//! reports byte offsets and classes, [`Flavor::Modern`] reports enumeration
//! indices and may need several passes), enforces the same ordering rules a
//! driver would, and logs every protocol step as an [`Event`].
//!
//! Used by unit tests, the integration tests and `WGPROBE_MOCK_RUN`.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::backend::{Bracketing, CounterBackend};
use crate::counters::{
    self, Catalog, CatalogEntry, CatalogLocator, CounterClass, CounterDataType,
    CounterExpectation, CounterRole, CounterSet, names,
};
use crate::dispatch::{DispatchExtents, DispatchGeometry, WorkgroupSize};
use crate::error::{ProbeError, Result};
use crate::extract::CounterValue;
use crate::lock::{Backoff, ProfilingLockDevice};
use crate::pixel::{OutputReadback, Pixel, UVec4};
use crate::query::{BeginStatus, QueryDevice, QueryKind};
use crate::schedule::{PassPlan, Submitter};

/// Hardware subgroup width the simulation reports.
pub const SIMULATED_SUBGROUP_SIZE: u32 = 8;

/// Occupancy the simulation reports, in percent.
pub const SIMULATED_OCCUPANCY_PCT: f32 = 87.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    /// Single pass, offsets, immediate begin/end, busy-retry contention.
    Legacy,
    /// Indices, recorded begin/end, explicit profiling lock, multi-pass.
    Modern,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Create(QueryKind),
    Reset(QueryKind),
    Busy(QueryKind),
    Begin(QueryKind),
    End(QueryKind),
    Recorded,
    SubmitReset,
    Dispatch(Option<u32>),
    Wait,
    Read(QueryKind),
    Destroy(QueryKind),
    LockAcquired,
    LockReleased,
}

#[derive(Debug, Default)]
struct Shared {
    events: Vec<Event>,
    lock_held: bool,
}

type SharedState = Rc<RefCell<Shared>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SimQueryState {
    Created,
    Active,
    Ended,
    Destroyed,
}

#[derive(Debug)]
struct SimQuery {
    kind: QueryKind,
    counters: CounterSet,
    num_passes: u32,
    state: SimQueryState,
    sampled: BTreeSet<u32>,
}

/// Handle of a simulated query object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimQueryId(usize);

pub struct SimulatedBackend {
    flavor: Flavor,
    geometry: DispatchGeometry,
    passes: u32,
    busy_begins: u32,
    short_read: usize,
    missing: Option<&'static str>,
    fail_submit_at: Option<u32>,
    fail_wait_at: Option<u32>,
    submits: u32,
    waits: u32,
    queries: Vec<SimQuery>,
    recorded: Option<Vec<SimQueryId>>,
    in_flight: bool,
    completed_dispatches: u32,
    shared: SharedState,
}

impl SimulatedBackend {
    pub fn new(flavor: Flavor) -> Self {
        let geometry = DispatchGeometry {
            extents: DispatchExtents {
                width: 64,
                height: 64,
                depth: 1,
            },
            workgroup: WorkgroupSize { x: 8, y: 8, z: 1 },
        };
        Self {
            flavor,
            geometry,
            passes: 1,
            busy_begins: 0,
            short_read: 0,
            missing: None,
            fail_submit_at: None,
            fail_wait_at: None,
            submits: 0,
            waits: 0,
            queries: Vec::new(),
            recorded: None,
            in_flight: false,
            completed_dispatches: 0,
            shared: SharedState::default(),
        }
    }

    pub fn with_geometry(mut self, geometry: DispatchGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Passes the modern flavor reports for its selection.
    pub fn with_passes(mut self, passes: u32) -> Self {
        self.passes = passes;
        self
    }

    /// Report the first `n` begin attempts as busy.
    pub fn with_busy_begins(mut self, n: u32) -> Self {
        self.busy_begins = n;
        self
    }

    /// Make the metrics query report `bytes` fewer bytes than expected.
    pub fn with_short_read(mut self, bytes: usize) -> Self {
        self.short_read = bytes;
        self
    }

    pub fn without_counter(mut self, name: &'static str) -> Self {
        self.missing = Some(name);
        self
    }

    /// Reject the `n`-th dispatch submission (1-based).
    pub fn failing_submit_at(mut self, n: u32) -> Self {
        self.fail_submit_at = Some(n);
        self
    }

    /// Time out the `n`-th wait (1-based).
    pub fn failing_wait_at(mut self, n: u32) -> Self {
        self.fail_wait_at = Some(n);
        self
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Profiling-lock handle sharing this backend's state.
    pub fn profiling_lock(&self) -> SimulatedLock {
        SimulatedLock {
            shared: Rc::clone(&self.shared),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.borrow().events.clone()
    }

    pub fn live_queries(&self) -> usize {
        self.queries
            .iter()
            .filter(|q| q.state != SimQueryState::Destroyed)
            .count()
    }

    pub fn active_queries(&self) -> usize {
        self.queries
            .iter()
            .filter(|q| q.state == SimQueryState::Active)
            .count()
    }

    /// Invocations the hardware actually runs, partial groups included.
    pub fn executed_invocations(&self) -> u64 {
        self.group_count().saturating_mul(self.workgroup_invocations())
    }

    pub fn hardware_threads(&self) -> u64 {
        let per_group = self
            .workgroup_invocations()
            .div_ceil(u64::from(SIMULATED_SUBGROUP_SIZE));
        self.group_count().saturating_mul(per_group)
    }

    pub fn gpu_time_ns(&self) -> u64 {
        self.executed_invocations().saturating_mul(2).saturating_add(1_000)
    }

    fn group_count(&self) -> u64 {
        let [gx, gy, gz] = self.geometry.num_groups();
        u64::from(gx) * u64::from(gy) * u64::from(gz)
    }

    fn workgroup_invocations(&self) -> u64 {
        let wg = self.geometry.workgroup;
        u64::from(wg.x) * u64::from(wg.y) * u64::from(wg.z)
    }

    fn log(&self, event: Event) {
        self.shared.borrow_mut().events.push(event);
    }

    fn query_mut(&mut self, id: SimQueryId) -> Result<&mut SimQuery> {
        match self.queries.get_mut(id.0) {
            Some(q) if q.state != SimQueryState::Destroyed => Ok(q),
            _ => Err(ProbeError::Driver {
                call: "simulated query",
                detail: format!("invalid query handle {id:?}"),
            }),
        }
    }

    fn value_for(&self, role: CounterRole) -> CounterValue {
        match role {
            CounterRole::Occupancy => CounterValue::Float32(SIMULATED_OCCUPANCY_PCT),
            CounterRole::ThreadsDispatched => CounterValue::UInt64(self.hardware_threads()),
            CounterRole::GpuTime => CounterValue::UInt64(self.gpu_time_ns()),
            CounterRole::ShaderInvocations => CounterValue::UInt64(self.executed_invocations()),
        }
    }

    fn catalog(&self, kind: QueryKind) -> Catalog {
        let mut catalog = match (self.flavor, kind) {
            (Flavor::Legacy, QueryKind::Metrics) => legacy_metrics_catalog(),
            (Flavor::Legacy, QueryKind::PipelineStatistics) => legacy_statistics_catalog(),
            (Flavor::Modern, QueryKind::Metrics) => modern_metrics_catalog(),
            (Flavor::Modern, QueryKind::PipelineStatistics) => modern_statistics_catalog(),
        };
        if let Some(missing) = self.missing {
            catalog.entries.retain(|e| e.name != missing);
        }
        catalog
    }
}

fn offset_entry(
    name: &str,
    data_type: CounterDataType,
    class: CounterClass,
    offset: usize,
) -> CatalogEntry {
    CatalogEntry {
        name: name.to_string(),
        data_type,
        class: Some(class),
        data_size: Some(data_type.size()),
        locator: CatalogLocator::Offset(offset),
    }
}

fn index_entry(name: &str, data_type: CounterDataType, index: u32) -> CatalogEntry {
    CatalogEntry {
        name: name.to_string(),
        data_type,
        class: None,
        data_size: None,
        locator: CatalogLocator::Index(index),
    }
}

fn legacy_metrics_catalog() -> Catalog {
    use CounterClass as C;
    use CounterDataType as T;
    Catalog {
        query: "Compute Metrics Basic Gen9".into(),
        entries: vec![
            offset_entry(names::GPU_TIME_ELAPSED, T::UInt64, C::Raw, 0),
            offset_entry("GPU Core Clocks", T::UInt64, C::Event, 8),
            offset_entry("EU Active", T::Float32, C::DurationNorm, 16),
            offset_entry(names::EU_THREAD_OCCUPANCY, T::Float32, C::Raw, 20),
            offset_entry(names::CS_THREADS_DISPATCHED, T::UInt64, C::Event, 24),
        ],
        result_size: Some(32),
    }
}

fn legacy_statistics_catalog() -> Catalog {
    use CounterClass::Raw;
    use CounterDataType::UInt64;
    Catalog {
        query: "Pipeline Statistics Registers".into(),
        entries: vec![
            offset_entry("N vertices submitted", UInt64, Raw, 0),
            offset_entry("N primitives submitted", UInt64, Raw, 8),
            offset_entry(names::N_CS_INVOCATIONS, UInt64, Raw, 16),
        ],
        result_size: Some(24),
    }
}

fn modern_metrics_catalog() -> Catalog {
    use CounterDataType::{Float32, UInt64};
    Catalog {
        query: "VK_KHR_performance_query".into(),
        entries: vec![
            index_entry(names::GPU_TIME_ELAPSED, UInt64, 0),
            index_entry("GPU Core Clocks", UInt64, 1),
            index_entry("EU Active", Float32, 2),
            index_entry(names::EU_THREAD_OCCUPANCY, Float32, 3),
            index_entry(names::CS_THREADS_DISPATCHED, UInt64, 4),
        ],
        result_size: None,
    }
}

fn modern_statistics_catalog() -> Catalog {
    Catalog {
        query: "VK_QUERY_TYPE_PIPELINE_STATISTICS".into(),
        entries: vec![index_entry(names::CS_INVOCATIONS, CounterDataType::UInt64, 0)],
        result_size: None,
    }
}

fn write_value(out: &mut [u8], offset: usize, value: CounterValue) {
    let mut put = |bytes: &[u8]| {
        if let Some(dst) = out.get_mut(offset..offset + bytes.len()) {
            dst.copy_from_slice(bytes);
        }
    };
    match value {
        CounterValue::UInt32(v) => put(&v.to_ne_bytes()),
        CounterValue::UInt64(v) => put(&v.to_ne_bytes()),
        CounterValue::Int32(v) => put(&v.to_ne_bytes()),
        CounterValue::Int64(v) => put(&v.to_ne_bytes()),
        CounterValue::Float32(v) => put(&v.to_ne_bytes()),
        CounterValue::Float64(v) => put(&v.to_ne_bytes()),
        CounterValue::Bool32(v) => put(&u32::from(v).to_ne_bytes()),
    }
}

impl QueryDevice for SimulatedBackend {
    type Handle = SimQueryId;

    fn create_query(
        &mut self,
        kind: QueryKind,
        counters: &CounterSet,
        plan: &PassPlan,
    ) -> Result<SimQueryId> {
        self.log(Event::Create(kind));
        self.queries.push(SimQuery {
            kind,
            counters: counters.clone(),
            num_passes: plan.num_passes(),
            state: SimQueryState::Created,
            sampled: BTreeSet::new(),
        });
        Ok(SimQueryId(self.queries.len() - 1))
    }

    fn reset_query(&mut self, handle: SimQueryId) -> Result<()> {
        let query = self.query_mut(handle)?;
        query.sampled.clear();
        let kind = query.kind;
        self.log(Event::Reset(kind));
        Ok(())
    }

    fn begin_query(&mut self, handle: SimQueryId) -> Result<BeginStatus> {
        let busy = self.busy_begins > 0;
        let query = self.query_mut(handle)?;
        let kind = query.kind;
        if query.state == SimQueryState::Active {
            return Err(ProbeError::Driver {
                call: "begin_query",
                detail: format!("{kind} query already active"),
            });
        }
        if busy {
            self.busy_begins -= 1;
            self.log(Event::Busy(kind));
            return Ok(BeginStatus::Busy);
        }
        query.state = SimQueryState::Active;
        self.log(Event::Begin(kind));
        Ok(BeginStatus::Started)
    }

    fn end_query(&mut self, handle: SimQueryId) -> Result<()> {
        let query = self.query_mut(handle)?;
        if query.state != SimQueryState::Active {
            return Err(ProbeError::Driver {
                call: "end_query",
                detail: format!("{} query not active", query.kind),
            });
        }
        query.state = SimQueryState::Ended;
        let kind = query.kind;
        self.log(Event::End(kind));
        Ok(())
    }

    fn read_query(&mut self, handle: SimQueryId, out: &mut [u8]) -> Result<usize> {
        let short = self.short_read;
        let (kind, counters, complete) = {
            let query = self.query_mut(handle)?;
            let complete = (0..query.num_passes).all(|p| query.sampled.contains(&p));
            (query.kind, query.counters.clone(), complete)
        };
        self.log(Event::Read(kind));
        if !complete {
            return Err(ProbeError::Synchronization(format!(
                "{kind} query results not ready"
            )));
        }
        for counter in counters.iter() {
            write_value(out, counter.byte_offset(), self.value_for(counter.role));
        }
        let written = counters.result_size().min(out.len());
        Ok(match kind {
            QueryKind::Metrics => written.saturating_sub(short),
            QueryKind::PipelineStatistics => written,
        })
    }

    fn destroy_query(&mut self, handle: SimQueryId) {
        if let Ok(query) = self.query_mut(handle) {
            query.state = SimQueryState::Destroyed;
            let kind = query.kind;
            self.log(Event::Destroy(kind));
        }
    }
}

impl Submitter for SimulatedBackend {
    fn submit_reset(&mut self) -> Result<()> {
        self.log(Event::SubmitReset);
        self.in_flight = true;
        Ok(())
    }

    fn submit_dispatch(&mut self, pass_index: Option<u32>) -> Result<()> {
        self.submits += 1;
        self.log(Event::Dispatch(pass_index));
        if self.fail_submit_at == Some(self.submits) {
            return Err(ProbeError::Submission(format!(
                "simulated rejection of submission {}",
                self.submits
            )));
        }

        let pass = pass_index.unwrap_or(0);
        let sampled: Vec<usize> = match self.flavor {
            Flavor::Legacy => self
                .queries
                .iter()
                .enumerate()
                .filter(|(_, q)| q.state == SimQueryState::Active)
                .map(|(i, _)| i)
                .collect(),
            Flavor::Modern => {
                let Some(recorded) = &self.recorded else {
                    return Err(ProbeError::Submission("no dispatch recorded".into()));
                };
                let ids: Vec<usize> = recorded.iter().map(|id| id.0).collect();
                if !ids.is_empty() && !self.shared.borrow().lock_held {
                    return Err(ProbeError::Submission(
                        "performance query submitted without the profiling lock".into(),
                    ));
                }
                ids
            }
        };
        for i in sampled {
            if let Some(query) = self.queries.get_mut(i) {
                if query.num_passes > 1 && pass_index.is_none() {
                    return Err(ProbeError::Submission(format!(
                        "{} query needs a pass index",
                        query.kind
                    )));
                }
                query.sampled.insert(pass);
            }
        }
        self.in_flight = true;
        Ok(())
    }

    fn wait_complete(&mut self, timeout: Duration) -> Result<()> {
        self.waits += 1;
        self.log(Event::Wait);
        if self.fail_wait_at == Some(self.waits) {
            return Err(ProbeError::FenceTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        if self.in_flight {
            self.in_flight = false;
            if self.submits > 0 {
                self.completed_dispatches = self.submits;
            }
        }
        Ok(())
    }
}

impl CounterBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        match self.flavor {
            Flavor::Legacy => "simulated-legacy",
            Flavor::Modern => "simulated-modern",
        }
    }

    fn bracketing(&self) -> Bracketing {
        match self.flavor {
            Flavor::Legacy => Bracketing::Immediate,
            Flavor::Modern => Bracketing::Recorded,
        }
    }

    fn enumerate_counters(&mut self, kind: QueryKind) -> Result<Catalog> {
        let catalog = self.catalog(kind);
        for entry in &catalog.entries {
            debug!(
                query = %catalog.query,
                counter = %entry.name,
                locator = ?entry.locator,
                data_type = ?entry.data_type,
                "catalog entry"
            );
        }
        Ok(catalog)
    }

    fn expectations(&self, kind: QueryKind) -> &'static [CounterExpectation] {
        match (self.flavor, kind) {
            (Flavor::Legacy, QueryKind::Metrics) => counters::LEGACY_METRICS,
            (Flavor::Legacy, QueryKind::PipelineStatistics) => counters::LEGACY_PIPELINE_STATISTICS,
            (Flavor::Modern, QueryKind::Metrics) => counters::MODERN_METRICS,
            (Flavor::Modern, QueryKind::PipelineStatistics) => {
                counters::MODERN_PIPELINE_STATISTICS
            }
        }
    }

    fn plan_passes(&mut self, _sets: &[(QueryKind, CounterSet)]) -> Result<PassPlan> {
        match self.flavor {
            Flavor::Legacy => Ok(PassPlan::single()),
            Flavor::Modern => PassPlan::new(self.passes),
        }
    }

    fn record_dispatch(&mut self) -> Result<()> {
        let active = self
            .queries
            .iter()
            .enumerate()
            .filter(|(_, q)| q.state == SimQueryState::Active)
            .map(|(i, _)| SimQueryId(i))
            .collect();
        self.recorded = Some(active);
        self.log(Event::Recorded);
        Ok(())
    }
}

impl OutputReadback for SimulatedBackend {
    fn read_output(&mut self) -> Result<Vec<Pixel>> {
        if self.completed_dispatches == 0 || self.in_flight {
            return Err(ProbeError::Synchronization(
                "output buffer read before the dispatch completed".into(),
            ));
        }
        let DispatchGeometry { extents, workgroup } = self.geometry;
        let [gx, gy, gz] = self.geometry.num_groups();
        let num_subgroups = self
            .workgroup_invocations()
            .div_ceil(u64::from(SIMULATED_SUBGROUP_SIZE));
        // Shader built-ins are 32-bit uints.
        let num_subgroups = u32::try_from(num_subgroups).unwrap_or(u32::MAX);
        let width = u64::from(extents.width);
        let plane = width * u64::from(extents.height);

        let pixels = (0..extents.invocation_count() as u64)
            .map(|i| {
                // Each coordinate is bounded by its u32 extent.
                let x = ((i % plane) % width) as u32;
                let y = ((i % plane) / width) as u32;
                let z = (i / plane) as u32;
                let local = UVec4::new(x % workgroup.x, y % workgroup.y, z % workgroup.z, 0);
                let local_index = local
                    .x
                    .wrapping_add(local.y.wrapping_mul(workgroup.x))
                    .wrapping_add(local.z.wrapping_mul(workgroup.x.wrapping_mul(workgroup.y)));
                Pixel {
                    r: x as f32 / extents.width as f32,
                    g: y as f32 / extents.height as f32,
                    b: z as f32 / extents.depth as f32,
                    a: 1.0,
                    num_work_groups: UVec4::new(gx, gy, gz, 0),
                    work_group_size: UVec4::new(workgroup.x, workgroup.y, workgroup.z, 0),
                    work_group_id: UVec4::new(x / workgroup.x, y / workgroup.y, z / workgroup.z, 0),
                    local_invocation_id: local,
                    global_invocation_id: UVec4::new(x, y, z, 0),
                    local_invocation_index: UVec4::new(local_index, 0, 0, 0),
                    subgroup: UVec4::new(
                        local_index / SIMULATED_SUBGROUP_SIZE,
                        local_index % SIMULATED_SUBGROUP_SIZE,
                        SIMULATED_SUBGROUP_SIZE,
                        num_subgroups,
                    ),
                }
            })
            .collect();
        Ok(pixels)
    }
}

/// Profiling lock of a [`SimulatedBackend`].
pub struct SimulatedLock {
    shared: SharedState,
}

impl ProfilingLockDevice for SimulatedLock {
    fn acquire_profiling_lock(&mut self, _timeout: Option<Duration>) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.lock_held {
            return Err(ProbeError::ProfilingLock("already held".into()));
        }
        shared.lock_held = true;
        shared.events.push(Event::LockAcquired);
        Ok(())
    }

    fn release_profiling_lock(&mut self) {
        let mut shared = self.shared.borrow_mut();
        shared.lock_held = false;
        shared.events.push(Event::LockReleased);
    }
}

/// Records requested backoff sleeps instead of sleeping.
#[derive(Clone, Debug, Default)]
pub struct RecordingBackoff {
    sleeps: Vec<Duration>,
}

impl RecordingBackoff {
    pub fn sleeps(&self) -> &[Duration] {
        &self.sleeps
    }
}

impl Backoff for RecordingBackoff {
    fn sleep(&mut self, duration: Duration) {
        self.sleeps.push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_figures_follow_geometry() {
        let backend = SimulatedBackend::new(Flavor::Legacy);
        assert_eq!(backend.executed_invocations(), 4096);
        assert_eq!(backend.hardware_threads(), 512);
    }

    #[test]
    fn output_cannot_be_read_before_completion() {
        let mut backend = SimulatedBackend::new(Flavor::Legacy);
        assert!(matches!(
            backend.read_output(),
            Err(ProbeError::Synchronization(_))
        ));
        backend.submit_dispatch(None).expect("submit");
        assert!(backend.read_output().is_err());
        backend
            .wait_complete(Duration::from_secs(1))
            .expect("wait");
        let pixels = backend.read_output().expect("pixels");
        assert_eq!(pixels.len(), 4096);
        let p = pixels[9 * 64 + 10];
        assert_eq!(p.global_invocation_id, UVec4::new(10, 9, 0, 0));
        assert_eq!(p.work_group_id, UVec4::new(1, 1, 0, 0));
        assert_eq!(p.local_invocation_index.x, 2 + 8);
        assert_eq!(p.subgroup, UVec4::new(1, 2, 8, 8));
    }

    #[test]
    fn oversized_workgroup_counts_in_64_bits() {
        let geometry = DispatchGeometry::new(
            DispatchExtents {
                width: 1,
                height: 1,
                depth: 1,
            },
            WorkgroupSize {
                x: 65_536,
                y: 65_536,
                z: 1,
            },
        )
        .expect("valid geometry");
        let mut backend = SimulatedBackend::new(Flavor::Legacy).with_geometry(geometry);
        assert_eq!(backend.executed_invocations(), 1 << 32);
        assert_eq!(backend.hardware_threads(), (1 << 32) / 8);
        assert_eq!(backend.gpu_time_ns(), 1_000 + (1 << 33));

        backend.submit_dispatch(None).expect("submit");
        backend
            .wait_complete(Duration::from_secs(1))
            .expect("wait");
        let pixels = backend.read_output().expect("pixels");
        assert_eq!(pixels.len(), 1);
        assert_eq!(pixels[0].local_invocation_index.x, 0);
        assert_eq!(pixels[0].subgroup.w, 1 << 29);
    }

    #[test]
    fn modern_dispatch_requires_profiling_lock_when_measuring() {
        let mut backend = SimulatedBackend::new(Flavor::Modern);
        let set = counters::resolve(&modern_statistics_catalog(), counters::MODERN_PIPELINE_STATISTICS)
            .expect("stats set");
        let id = backend
            .create_query(QueryKind::PipelineStatistics, &set, &PassPlan::single())
            .expect("create");
        backend.reset_query(id).expect("reset");
        backend.begin_query(id).expect("begin");
        backend.record_dispatch().expect("record");
        backend.end_query(id).expect("end");
        let err = backend.submit_dispatch(None).expect_err("no lock held");
        assert!(matches!(err, ProbeError::Submission(_)));
    }
}
