//! Measurement report and its output formats.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::counters::CounterRole;
use crate::dispatch::WorkgroupSize;
use crate::error::Result;
use crate::extract::ExtractedCounters;
use crate::schedule::PassRun;

/// Column header of the CSV report. Written once, when the file is opened.
pub const STATS_CSV_HEADER: &str = "x:int,y:int,z:int,time_ns:int,threads:int,invocations:int,simd:int,thread_occupancy_pct:int,cpu_time_ns:int";

/// Decoded and derived values of one measurement.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MeasurementReport {
    pub backend: &'static str,
    pub workgroup: WorkgroupSize,
    pub passes: u32,
    pub eu_occupancy_pct: f32,
    pub threads_dispatched: u64,
    pub gpu_time_ns: u64,
    pub cs_invocations: u64,
    pub simd_width: u64,
    pub cpu_time_ns: u64,
}

impl MeasurementReport {
    pub fn from_counters(
        backend: &'static str,
        workgroup: WorkgroupSize,
        counters: &ExtractedCounters,
        run: &PassRun,
    ) -> Result<Self> {
        let threads_dispatched = counters.require_u64(CounterRole::ThreadsDispatched)?;
        let cs_invocations = counters.require_u64(CounterRole::ShaderInvocations)?;
        Ok(Self {
            backend,
            workgroup,
            passes: run.passes,
            eu_occupancy_pct: counters.require_f32(CounterRole::Occupancy)?,
            threads_dispatched,
            gpu_time_ns: counters.require_u64(CounterRole::GpuTime)?,
            cs_invocations,
            simd_width: simd_width(cs_invocations, threads_dispatched),
            cpu_time_ns: run.cpu_time_ns(),
        })
    }

    /// Occupancy as the CSV reports it: truncated toward zero.
    pub fn occupancy_pct_int(&self) -> i32 {
        self.eu_occupancy_pct as i32
    }
}

/// Invocations per hardware thread, floor division. Zero threads yields 0.
pub fn simd_width(invocations: u64, threads: u64) -> u64 {
    invocations.checked_div(threads).unwrap_or(0)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReportFormat {
    #[default]
    Text,
    Csv,
    Json,
}

pub trait ReportSink {
    fn emit(&mut self, report: &MeasurementReport) -> Result<()>;
}

/// Six labelled lines.
pub struct TextReport<W: Write> {
    out: W,
}

impl<W: Write> TextReport<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> ReportSink for TextReport<W> {
    fn emit(&mut self, report: &MeasurementReport) -> Result<()> {
        let out = &mut self.out;
        writeln!(out, "EU Thread Occupancy:   {:.6} %", report.eu_occupancy_pct)?;
        writeln!(out, "CS Threads Dispatched: {}", report.threads_dispatched)?;
        writeln!(out, "GPU Time Elapsed:      {} ns", report.gpu_time_ns)?;
        writeln!(out, "CS Invocations:        {}", report.cs_invocations)?;
        writeln!(out, "SIMD Width:            {}", report.simd_width)?;
        writeln!(out, "CPU Time Elapsed:      {} ns", report.cpu_time_ns)?;
        out.flush()?;
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonReport<W: Write> {
    out: W,
}

impl<W: Write> JsonReport<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> ReportSink for JsonReport<W> {
    fn emit(&mut self, report: &MeasurementReport) -> Result<()> {
        let line = serde_json::to_string(report)?;
        writeln!(self.out, "{line}")?;
        self.out.flush()?;
        Ok(())
    }
}

/// CSV report with the header written at construction and a flush per row.
pub struct StatsCsv<W: Write> {
    out: W,
}

impl StatsCsv<BufWriter<File>> {
    /// Create or truncate `path` and write the header.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> StatsCsv<W> {
    pub fn new(mut out: W) -> Result<Self> {
        writeln!(out, "{STATS_CSV_HEADER}")?;
        out.flush()?;
        Ok(Self { out })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ReportSink for StatsCsv<W> {
    fn emit(&mut self, report: &MeasurementReport) -> Result<()> {
        let wg = report.workgroup;
        writeln!(
            self.out,
            "{},{},{},{},{},{},{},{},{}",
            wg.x,
            wg.y,
            wg.z,
            report.gpu_time_ns,
            report.threads_dispatched,
            report.cs_invocations,
            report.simd_width,
            report.occupancy_pct_int(),
            report.cpu_time_ns
        )?;
        self.out.flush()?;
        Ok(())
    }
}
