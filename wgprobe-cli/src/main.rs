//! wgprobe CLI entrypoint.
//!
//! ```bash
//! wgprobe vulkan 1024 1024 1 8 8 1 --shader mandelbrot.spv
//! wgprobe gl 1024 1024 1 8 8 1 --shader mandelbrot.comp --render-node /dev/dri/renderD128
//! CSV=1 wgprobe gl 1024 1024 1 16 16 1 --shader mandelbrot.comp
//! PERF_ENABLED=0 wgprobe vulkan 64 64 1 8 8 1 --shader mandelbrot.spv
//! wgprobe counters vulkan --json
//! ```

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use wgprobe_core::backend::{CounterBackend, CounterPlan, resolve_counters};
use wgprobe_core::config::{self, ProbeConfig, STATS_CSV_PATH};
use wgprobe_core::counters::{Catalog, CatalogLocator};
use wgprobe_core::dispatch::{DispatchExtents, DispatchGeometry, WorkgroupSize};
use wgprobe_core::error::{ProbeError, Result};
use wgprobe_core::lock::{CounterUnitLock, ExplicitLock, RetryBeginLock, RetryPolicy, ThreadSleep};
use wgprobe_core::measure::{MeasureOptions, dispatch_unmeasured, measure};
use wgprobe_core::pixel::{DATA_CSV_PATH, OutputReadback, save_data_csv};
use wgprobe_core::query::QueryKind;
use wgprobe_core::report::{JsonReport, ReportFormat, ReportSink, StatsCsv, TextReport};
use wgprobe_core::simulated::{Flavor, SimulatedBackend};
use wgprobe_gl::{GlBackend, GlOptions};
use wgprobe_vulkan::{VulkanBackend, VulkanProfilingLock};

/// Run against the in-tree simulated counter unit instead of a GPU.
const MOCK_RUN_ENV: &str = "WGPROBE_MOCK_RUN";

/// Process status for every fatal error.
const FAILURE_EXIT_CODE: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "wgprobe",
    version,
    about = "Measure GPU compute dispatches with hardware performance counters",
    arg_required_else_help = true,
    after_help = "Examples:\n  wgprobe vulkan 1024 1024 1 8 8 1 --shader mandelbrot.spv\n  wgprobe gl 1024 1024 1 8 8 1 --shader mandelbrot.comp\n  CSV=1 wgprobe gl 1024 1024 1 16 16 1 --shader mandelbrot.comp\n  wgprobe counters gl\n\nEnvironment:\n  PERF_ENABLED=0            single unmeasured dispatch, no counters\n  CSV=1                     write the report to stats.csv\n  USE_VARIABLE_GROUP_SIZE=1 (gl) pass the work-group size at dispatch time\n  WGPROBE_MOCK_RUN=1        use the simulated counter unit"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Measure one dispatch through Vulkan and VK_KHR_performance_query.
    Vulkan(VulkanArgs),
    /// Measure one dispatch through OpenGL and GL_INTEL_performance_query.
    Gl(GlArgs),
    /// List the counters a backend exposes and check the required ones resolve.
    Counters(CountersArgs),
}

#[derive(Args, Debug, Clone, Copy)]
struct GeometryArgs {
    /// Dispatch width in invocations.
    width: u32,
    /// Dispatch height in invocations.
    height: u32,
    /// Dispatch depth in invocations.
    depth: u32,
    /// Work-group size along x.
    group_x: u32,
    /// Work-group size along y.
    group_y: u32,
    /// Work-group size along z.
    group_z: u32,
}

impl GeometryArgs {
    fn geometry(&self) -> Result<DispatchGeometry> {
        DispatchGeometry::new(
            DispatchExtents {
                width: self.width,
                height: self.height,
                depth: self.depth,
            },
            WorkgroupSize {
                x: self.group_x,
                y: self.group_y,
                z: self.group_z,
            },
        )
    }
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    geometry: GeometryArgs,

    /// Upper bound on each fence wait, in milliseconds.
    #[arg(long = "fence-timeout-ms", default_value_t = 100_000)]
    fence_timeout_ms: u64,

    /// Query begin attempts while the counter unit is busy.
    #[arg(long = "retry-attempts", default_value_t = 500)]
    retry_attempts: u32,

    /// Sleep between busy query begins, in milliseconds.
    #[arg(long = "retry-backoff-ms", default_value_t = 10)]
    retry_backoff_ms: u64,

    /// Report format. `CSV=1` in the environment selects csv.
    #[arg(long, value_enum, default_value_t = FormatArg::Text)]
    format: FormatArg,

    /// Per-invocation dump destination.
    #[arg(long = "dump-path", default_value = DATA_CSV_PATH)]
    dump_path: PathBuf,

    /// Skip the per-invocation dump.
    #[arg(long = "no-dump", default_value_t = false)]
    no_dump: bool,
}

#[derive(Args, Debug, Clone)]
struct VulkanArgs {
    #[command(flatten)]
    run: RunArgs,

    /// SPIR-V compute shader (entry point `main`).
    #[arg(long)]
    shader: Option<PathBuf>,

    /// Profiling lock timeout in milliseconds. Waits indefinitely when omitted.
    #[arg(long = "lock-timeout-ms")]
    lock_timeout_ms: Option<u64>,
}

#[derive(Args, Debug, Clone)]
struct GlArgs {
    #[command(flatten)]
    run: RunArgs,

    /// GLSL compute shader template.
    #[arg(long)]
    shader: Option<PathBuf>,

    /// DRM render node to open [default: /dev/dri/renderD128].
    #[arg(long = "render-node")]
    render_node: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct CountersArgs {
    /// Backend whose catalog to list.
    #[arg(value_enum)]
    backend: BackendArg,

    /// DRM render node for the gl backend.
    #[arg(long = "render-node")]
    render_node: Option<PathBuf>,

    /// Emit JSON instead of a table.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Gl,
    Vulkan,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum FormatArg {
    Text,
    Csv,
    Json,
}

impl From<FormatArg> for ReportFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Text => ReportFormat::Text,
            FormatArg::Csv => ReportFormat::Csv,
            FormatArg::Json => ReportFormat::Json,
        }
    }
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Vulkan(args) => run_vulkan(args),
        Commands::Gl(args) => run_gl(args),
        Commands::Counters(args) => run_counters(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(
                error = %err,
                code = err.error_code(),
                category = %err.category(),
                "Command failed"
            );
            std::process::exit(FAILURE_EXIT_CODE);
        }
    }
}

// ── Run settings ────────────────────────────────────────────────────────

/// Everything a measured or unmeasured run needs besides the backend.
struct RunSettings {
    config: ProbeConfig,
    geometry: DispatchGeometry,
    options: MeasureOptions,
    retry: RetryPolicy,
    sink: Option<Box<dyn ReportSink>>,
    dump: Option<PathBuf>,
}

impl RunArgs {
    /// Validate the geometry, then open the report destination. `stats.csv`
    /// is created here, once, before any device work.
    fn settings(&self, config: ProbeConfig) -> Result<RunSettings> {
        let geometry = self.geometry.geometry()?;
        if self.fence_timeout_ms == 0 {
            return Err(ProbeError::InvalidConfig(
                "--fence-timeout-ms must be positive".into(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ProbeError::InvalidConfig(
                "--retry-attempts must be at least 1".into(),
            ));
        }

        let sink = if config.perf_enabled {
            let format = if config.csv_report() {
                ReportFormat::Csv
            } else {
                self.format.into()
            };
            Some(open_report_sink(format)?)
        } else {
            None
        };

        Ok(RunSettings {
            config,
            geometry,
            options: MeasureOptions {
                geometry,
                fence_timeout: Duration::from_millis(self.fence_timeout_ms),
            },
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                backoff: Duration::from_millis(self.retry_backoff_ms),
            },
            sink,
            dump: (!self.no_dump).then(|| self.dump_path.clone()),
        })
    }
}

fn open_report_sink(format: ReportFormat) -> Result<Box<dyn ReportSink>> {
    Ok(match format {
        ReportFormat::Text => Box::new(TextReport::new(io::stdout())),
        ReportFormat::Json => Box::new(JsonReport::new(io::stdout())),
        ReportFormat::Csv => {
            let sink = StatsCsv::create(Path::new(STATS_CSV_PATH))?;
            debug!(path = STATS_CSV_PATH, "opened CSV report");
            Box::new(sink)
        }
    })
}

fn mock_run_enabled() -> bool {
    std::env::var(MOCK_RUN_ENV)
        .ok()
        .and_then(|raw| config::parse_flag(&raw))
        .unwrap_or(false)
}

fn read_shader(path: Option<&Path>) -> Result<Vec<u8>> {
    let path = path.ok_or_else(|| ProbeError::InvalidConfig("--shader is required".into()))?;
    std::fs::read(path).map_err(|e| ProbeError::Shader(format!("read {}: {e}", path.display())))
}

fn gl_options(render_node: Option<PathBuf>, variable_group_size: bool) -> GlOptions {
    let defaults = GlOptions::default();
    GlOptions {
        render_node: render_node.unwrap_or(defaults.render_node),
        variable_group_size,
    }
}

// ── Measurement commands ────────────────────────────────────────────────

fn run_vulkan(args: VulkanArgs) -> Result<()> {
    let mut run = args.run.settings(ProbeConfig::from_env())?;
    let lock_timeout = args.lock_timeout_ms.map(Duration::from_millis);

    if mock_run_enabled() {
        info!("{MOCK_RUN_ENV} set, using the simulated counter unit");
        let mut backend = SimulatedBackend::new(Flavor::Modern).with_geometry(run.geometry);
        let mut lock = ExplicitLock::new(backend.profiling_lock(), lock_timeout);
        let plan = resolve_plan(&mut backend, &run)?;
        let lock: &mut dyn CounterUnitLock = &mut lock;
        return execute(&mut backend, plan.as_ref().map(|p| (p, lock)), &mut run);
    }

    let spirv = read_shader(args.shader.as_deref())?;
    let mut backend = VulkanBackend::new(run.config.perf_enabled)?;
    let plan = resolve_plan(&mut backend, &run)?;
    backend.load_pipeline(&spirv, run.geometry)?;

    match plan {
        Some(plan) => {
            let mut lock = ExplicitLock::new(VulkanProfilingLock::new(&backend)?, lock_timeout);
            execute(&mut backend, Some((&plan, &mut lock)), &mut run)
        }
        None => execute(&mut backend, None, &mut run),
    }
}

fn run_gl(args: GlArgs) -> Result<()> {
    let mut run = args.run.settings(ProbeConfig::from_env())?;
    let mut lock = RetryBeginLock::new(run.retry, ThreadSleep);

    if mock_run_enabled() {
        info!("{MOCK_RUN_ENV} set, using the simulated counter unit");
        let mut backend = SimulatedBackend::new(Flavor::Legacy).with_geometry(run.geometry);
        let plan = resolve_plan(&mut backend, &run)?;
        let lock: &mut dyn CounterUnitLock = &mut lock;
        return execute(&mut backend, plan.as_ref().map(|p| (p, lock)), &mut run);
    }

    let source = read_shader(args.shader.as_deref())?;
    let template = String::from_utf8(source)
        .map_err(|e| ProbeError::Shader(format!("shader template is not UTF-8: {e}")))?;
    let options = gl_options(args.render_node, run.config.variable_group_size);
    let mut backend = GlBackend::new(&options)?;
    let plan = resolve_plan(&mut backend, &run)?;
    backend.load_program(&template, run.geometry)?;

    let lock: &mut dyn CounterUnitLock = &mut lock;
    execute(&mut backend, plan.as_ref().map(|p| (p, lock)), &mut run)
}

/// Resolve counters before the pipeline exists, or skip when unmeasured.
fn resolve_plan<B: CounterBackend>(backend: &mut B, run: &RunSettings) -> Result<Option<CounterPlan>> {
    if !run.config.perf_enabled {
        debug!("performance queries disabled");
        return Ok(None);
    }
    let plan = resolve_counters(backend)?;
    info!(
        backend = backend.name(),
        passes = plan.passes.num_passes(),
        "counters resolved"
    );
    Ok(Some(plan))
}

fn execute<B>(
    backend: &mut B,
    measured: Option<(&CounterPlan, &mut dyn CounterUnitLock)>,
    run: &mut RunSettings,
) -> Result<()>
where
    B: CounterBackend + OutputReadback,
{
    match measured {
        Some((plan, lock)) => {
            let report = measure(backend, lock, plan, &run.options)?;
            if let Some(sink) = run.sink.as_mut() {
                sink.emit(&report)?;
            }
        }
        None => dispatch_unmeasured(backend, &run.options)?,
    }

    if let Some(path) = &run.dump {
        let pixels = backend.read_output()?;
        save_data_csv(path, &pixels, &run.geometry.extents)?;
        info!(
            path = %path.display(),
            invocations = run.geometry.invocation_count(),
            "wrote per-invocation dump"
        );
    }
    Ok(())
}

// ── Catalog listing ─────────────────────────────────────────────────────

fn run_counters(args: CountersArgs) -> Result<()> {
    if mock_run_enabled() {
        let flavor = match args.backend {
            BackendArg::Gl => Flavor::Legacy,
            BackendArg::Vulkan => Flavor::Modern,
        };
        return list_counters(&mut SimulatedBackend::new(flavor), args.json);
    }
    match args.backend {
        BackendArg::Gl => {
            let mut backend = GlBackend::new(&gl_options(args.render_node, false))?;
            list_counters(&mut backend, args.json)
        }
        BackendArg::Vulkan => list_counters(&mut VulkanBackend::new(true)?, args.json),
    }
}

fn list_counters<B: CounterBackend>(backend: &mut B, json: bool) -> Result<()> {
    let mut catalogs: Vec<(QueryKind, Catalog)> = Vec::new();
    for &kind in backend.query_kinds() {
        catalogs.push((kind, backend.enumerate_counters(kind)?));
    }
    let plan = resolve_counters(backend)?;

    let mut out = io::stdout().lock();
    if json {
        let value = catalog_json(backend.name(), &catalogs, &plan);
        let text = serde_json::to_string_pretty(&value)?;
        writeln!(out, "{text}")?;
        return Ok(());
    }

    for (kind, catalog) in &catalogs {
        match catalog.result_size {
            Some(size) => writeln!(out, "{kind}: {} ({size} bytes)", catalog.query)?,
            None => writeln!(out, "{kind}: {}", catalog.query)?,
        }
        let selected = plan.set(*kind);
        for entry in &catalog.entries {
            let mark = if selected.is_some_and(|set| set.get(&entry.name).is_some()) {
                '*'
            } else {
                ' '
            };
            let class = entry
                .class
                .map(|c| format!("{c:?}"))
                .unwrap_or_else(|| "-".into());
            writeln!(
                out,
                "{mark} {:<14} {:<48} {:?} {class}",
                locator_label(entry.locator),
                entry.name,
                entry.data_type,
            )?;
        }
    }
    writeln!(out, "passes: {}", plan.passes.num_passes())?;
    Ok(())
}

fn locator_label(locator: CatalogLocator) -> String {
    match locator {
        CatalogLocator::Offset(offset) => format!("offset {offset}"),
        CatalogLocator::Index(index) => format!("index {index}"),
    }
}

fn catalog_json(
    backend: &str,
    catalogs: &[(QueryKind, Catalog)],
    plan: &CounterPlan,
) -> serde_json::Value {
    let queries: Vec<serde_json::Value> = catalogs
        .iter()
        .map(|(kind, catalog)| {
            let selected = plan.set(*kind);
            let counters: Vec<serde_json::Value> = catalog
                .entries
                .iter()
                .map(|entry| {
                    serde_json::json!({
                        "name": entry.name,
                        "locator": locator_label(entry.locator),
                        "data_type": format!("{:?}", entry.data_type),
                        "class": entry.class.map(|c| format!("{c:?}")),
                        "data_size": entry.data_size,
                        "selected": selected.is_some_and(|set| set.get(&entry.name).is_some()),
                    })
                })
                .collect();
            serde_json::json!({
                "kind": kind.to_string(),
                "query": catalog.query,
                "result_size": catalog.result_size,
                "counters": counters,
            })
        })
        .collect();
    serde_json::json!({
        "backend": backend,
        "passes": plan.passes.num_passes(),
        "queries": queries,
    })
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse")
    }

    #[test]
    fn positional_geometry_parses_in_order() {
        let cli = parse(&["wgprobe", "gl", "640", "480", "2", "16", "8", "1"]);
        let Commands::Gl(args) = cli.command else {
            panic!("expected gl subcommand");
        };
        let g = args.run.geometry.geometry().expect("geometry");
        assert_eq!(
            g.extents,
            DispatchExtents {
                width: 640,
                height: 480,
                depth: 2
            }
        );
        assert_eq!(g.workgroup, WorkgroupSize { x: 16, y: 8, z: 1 });
        assert_eq!(args.run.format, FormatArg::Text);
        assert_eq!(args.run.dump_path, PathBuf::from(DATA_CSV_PATH));
    }

    #[test]
    fn missing_work_group_size_is_rejected() {
        assert!(Cli::try_parse_from(["wgprobe", "vulkan", "64", "64", "1", "8", "8"]).is_err());
    }

    #[test]
    fn no_dump_and_unmeasured_runs_open_nothing() {
        let cli = parse(&[
            "wgprobe", "vulkan", "8", "8", "1", "8", "8", "1", "--no-dump", "--format", "csv",
        ]);
        let Commands::Vulkan(args) = cli.command else {
            panic!("expected vulkan subcommand");
        };
        let config = ProbeConfig {
            perf_enabled: false,
            csv: true,
            variable_group_size: false,
        };
        let run = args.run.settings(config).ok().expect("settings");
        assert!(run.sink.is_none(), "unmeasured runs have no report sink");
        assert!(run.dump.is_none());
        assert_eq!(run.options.fence_timeout, Duration::from_secs(100));
    }

    #[test]
    fn zero_retry_budget_is_a_configuration_error() {
        let cli = parse(&[
            "wgprobe",
            "gl",
            "8",
            "8",
            "1",
            "8",
            "8",
            "1",
            "--retry-attempts",
            "0",
        ]);
        let Commands::Gl(args) = cli.command else {
            panic!("expected gl subcommand");
        };
        let config = ProbeConfig {
            perf_enabled: false,
            ..ProbeConfig::default()
        };
        let err = args
            .run
            .settings(config)
            .err()
            .expect("zero attempts must fail");
        assert_eq!(err.error_code() / 100, 1);
    }

    #[test]
    fn locator_labels_name_the_addressing_mode() {
        assert_eq!(locator_label(CatalogLocator::Offset(16)), "offset 16");
        assert_eq!(locator_label(CatalogLocator::Index(3)), "index 3");
    }
}
