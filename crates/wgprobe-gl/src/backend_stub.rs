//! Stub for hosts without EGL/GBM.

use std::path::PathBuf;
use std::time::Duration;

use wgprobe_core::backend::{Bracketing, CounterBackend};
use wgprobe_core::counters::{self, Catalog, CounterExpectation, CounterSet};
use wgprobe_core::dispatch::DispatchGeometry;
use wgprobe_core::error::{ProbeError, Result};
use wgprobe_core::pixel::{OutputReadback, Pixel};
use wgprobe_core::query::{BeginStatus, QueryDevice, QueryKind};
use wgprobe_core::schedule::{PassPlan, Submitter};

fn unavailable() -> ProbeError {
    ProbeError::Device("wgprobe-gl built in stub mode: the GL backend needs Linux".into())
}

#[derive(Clone, Debug, Default)]
pub struct GlOptions {
    pub render_node: PathBuf,
    pub variable_group_size: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlQuery;

/// Never constructed; [`GlBackend::new`] always fails.
#[derive(Debug)]
pub struct GlBackend {
    _private: (),
}

impl GlBackend {
    pub fn new(options: &GlOptions) -> Result<Self> {
        let _ = options;
        Err(unavailable())
    }

    pub fn load_program(&mut self, template: &str, geometry: DispatchGeometry) -> Result<()> {
        let _ = (template, geometry);
        Err(unavailable())
    }
}

impl QueryDevice for GlBackend {
    type Handle = GlQuery;

    fn create_query(&mut self, _: QueryKind, _: &CounterSet, _: &PassPlan) -> Result<GlQuery> {
        Err(unavailable())
    }

    fn reset_query(&mut self, _: GlQuery) -> Result<()> {
        Err(unavailable())
    }

    fn begin_query(&mut self, _: GlQuery) -> Result<BeginStatus> {
        Err(unavailable())
    }

    fn end_query(&mut self, _: GlQuery) -> Result<()> {
        Err(unavailable())
    }

    fn read_query(&mut self, _: GlQuery, _: &mut [u8]) -> Result<usize> {
        Err(unavailable())
    }

    fn destroy_query(&mut self, _: GlQuery) {}
}

impl Submitter for GlBackend {
    fn submit_reset(&mut self) -> Result<()> {
        Err(unavailable())
    }

    fn submit_dispatch(&mut self, _: Option<u32>) -> Result<()> {
        Err(unavailable())
    }

    fn wait_complete(&mut self, _: Duration) -> Result<()> {
        Err(unavailable())
    }
}

impl CounterBackend for GlBackend {
    fn name(&self) -> &'static str {
        "gl"
    }

    fn bracketing(&self) -> Bracketing {
        Bracketing::Immediate
    }

    fn enumerate_counters(&mut self, _: QueryKind) -> Result<Catalog> {
        Err(unavailable())
    }

    fn expectations(&self, kind: QueryKind) -> &'static [CounterExpectation] {
        match kind {
            QueryKind::Metrics => counters::LEGACY_METRICS,
            QueryKind::PipelineStatistics => counters::LEGACY_PIPELINE_STATISTICS,
        }
    }

    fn plan_passes(&mut self, _: &[(QueryKind, CounterSet)]) -> Result<PassPlan> {
        Ok(PassPlan::single())
    }

    fn record_dispatch(&mut self) -> Result<()> {
        Err(unavailable())
    }
}

impl OutputReadback for GlBackend {
    fn read_output(&mut self) -> Result<Vec<Pixel>> {
        Err(unavailable())
    }
}
