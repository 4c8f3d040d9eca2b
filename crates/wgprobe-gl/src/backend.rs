//! `GL_INTEL_performance_query` implementation of [`CounterBackend`].

use std::ffi::{CString, c_char, c_void};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use glow::HasContext;
use tracing::{debug, info, warn};
use wgprobe_core::backend::{Bracketing, CounterBackend};
use wgprobe_core::counters::{
    self, Catalog, CatalogEntry, CatalogLocator, CounterClass, CounterDataType,
    CounterExpectation, CounterSet,
};
use wgprobe_core::dispatch::DispatchGeometry;
use wgprobe_core::error::{ProbeError, Result};
use wgprobe_core::pixel::{self, OutputReadback, Pixel};
use wgprobe_core::query::{BeginStatus, QueryDevice, QueryKind};
use wgprobe_core::schedule::{PassPlan, Submitter};

use crate::context::{DEFAULT_RENDER_NODE, GlContext};
use crate::shader::{self, TemplateParams};
use crate::sys::{self, DispatchGroupSizeFn, IntelPerfQuery};

const PERF_QUERY_EXTENSION: &str = "GL_INTEL_performance_query";
const VARIABLE_GROUP_SIZE_EXTENSION: &str = "GL_ARB_compute_variable_group_size";

/// Driver query names, per kind.
pub const METRICS_QUERY: &str = "Compute Metrics Basic Gen9";
pub const PIPELINE_STATISTICS_QUERY: &str = "Pipeline Statistics Registers";

const QUERY_NAME_LEN: usize = 4096;
const COUNTER_NAME_LEN: usize = 256;
const COUNTER_DESC_LEN: usize = 1024;

#[derive(Clone, Debug)]
pub struct GlOptions {
    pub render_node: PathBuf,
    /// Dispatch with `glDispatchComputeGroupSizeARB` and template `1` into
    /// `USE_VARIABLE_GROUP_SIZE`.
    pub variable_group_size: bool,
}

impl Default for GlOptions {
    fn default() -> Self {
        Self {
            render_node: PathBuf::from(DEFAULT_RENDER_NODE),
            variable_group_size: false,
        }
    }
}

/// INTEL query handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlQuery {
    handle: u32,
    kind: QueryKind,
}

fn query_name(kind: QueryKind) -> &'static str {
    match kind {
        QueryKind::Metrics => METRICS_QUERY,
        QueryKind::PipelineStatistics => PIPELINE_STATISTICS_QUERY,
    }
}

fn counter_class(raw: u32) -> Option<CounterClass> {
    Some(match raw {
        sys::GL_PERFQUERY_COUNTER_EVENT_INTEL => CounterClass::Event,
        sys::GL_PERFQUERY_COUNTER_DURATION_NORM_INTEL => CounterClass::DurationNorm,
        sys::GL_PERFQUERY_COUNTER_DURATION_RAW_INTEL => CounterClass::DurationRaw,
        sys::GL_PERFQUERY_COUNTER_THROUGHPUT_INTEL => CounterClass::Throughput,
        sys::GL_PERFQUERY_COUNTER_RAW_INTEL => CounterClass::Raw,
        sys::GL_PERFQUERY_COUNTER_TIMESTAMP_INTEL => CounterClass::Timestamp,
        _ => return None,
    })
}

fn counter_data_type(raw: u32) -> CounterDataType {
    match raw {
        sys::GL_PERFQUERY_COUNTER_DATA_UINT32_INTEL => CounterDataType::UInt32,
        sys::GL_PERFQUERY_COUNTER_DATA_UINT64_INTEL => CounterDataType::UInt64,
        sys::GL_PERFQUERY_COUNTER_DATA_FLOAT_INTEL => CounterDataType::Float32,
        sys::GL_PERFQUERY_COUNTER_DATA_DOUBLE_INTEL => CounterDataType::Float64,
        sys::GL_PERFQUERY_COUNTER_DATA_BOOL32_INTEL => CounterDataType::Bool32,
        other => CounterDataType::Unknown(other),
    }
}

fn c_buf_to_string(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub struct GlBackend {
    perf: Option<IntelPerfQuery>,
    dispatch_group_size: Option<DispatchGroupSizeFn>,
    query_ids: Vec<(QueryKind, u32)>,
    program: Option<glow::Program>,
    ssbo: Option<glow::Buffer>,
    geometry: Option<DispatchGeometry>,
    variable_group_size: bool,
    fence: Option<glow::Fence>,
    ctx: GlContext,
}

impl std::fmt::Debug for GlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlBackend")
            .field("ctx", &self.ctx)
            .field("perf", &self.perf.is_some())
            .field("variable_group_size", &self.variable_group_size)
            .finish()
    }
}

impl GlBackend {
    pub fn new(options: &GlOptions) -> Result<Self> {
        let ctx = GlContext::new(&options.render_node)?;
        let perf = if ctx.has_extension(PERF_QUERY_EXTENSION) {
            Some(IntelPerfQuery::load(ctx.egl).map_err(ProbeError::Loader)?)
        } else {
            debug!("{PERF_QUERY_EXTENSION} not advertised");
            None
        };
        let dispatch_group_size = if options.variable_group_size {
            if !ctx.has_extension(VARIABLE_GROUP_SIZE_EXTENSION) {
                return Err(ProbeError::MissingExtension(
                    VARIABLE_GROUP_SIZE_EXTENSION.into(),
                ));
            }
            Some(sys::load_dispatch_group_size(ctx.egl).map_err(ProbeError::Loader)?)
        } else {
            None
        };
        Ok(Self {
            perf,
            dispatch_group_size,
            query_ids: Vec::new(),
            program: None,
            ssbo: None,
            geometry: None,
            variable_group_size: options.variable_group_size,
            fence: None,
            ctx,
        })
    }

    fn gl(&self) -> &glow::Context {
        &self.ctx.gl
    }

    fn check_gl(&self, call: &'static str) -> Result<()> {
        // SAFETY: the context is current on this thread.
        match unsafe { self.gl().get_error() } {
            glow::NO_ERROR => Ok(()),
            code => Err(ProbeError::Driver {
                call,
                detail: format!("GL error 0x{code:x}"),
            }),
        }
    }

    fn perf(&self) -> Result<IntelPerfQuery> {
        self.perf
            .ok_or_else(|| ProbeError::MissingExtension(PERF_QUERY_EXTENSION.into()))
    }

    /// Instantiate `template`, compile and link it, and allocate the output
    /// SSBO at binding 0.
    pub fn load_program(&mut self, template: &str, geometry: DispatchGeometry) -> Result<()> {
        let source = shader::instantiate(
            template,
            &TemplateParams {
                geometry,
                variable_group_size: self.variable_group_size,
            },
        );
        self.release_program();

        let size = pixel::output_buffer_size(&geometry.extents)?;
        let size = i32::try_from(size).map_err(|_| {
            ProbeError::InvalidDimensions(format!("output buffer of {size} bytes exceeds GL limits"))
        })?;
        let gl = &self.ctx.gl;
        // SAFETY: the context is current; every object is owned by self.
        unsafe {
            let ssbo = gl
                .create_buffer()
                .map_err(|e| ProbeError::Device(format!("glGenBuffers: {e}")))?;
            self.ssbo = Some(ssbo);
            gl.bind_buffer(glow::SHADER_STORAGE_BUFFER, Some(ssbo));
            gl.buffer_data_size(glow::SHADER_STORAGE_BUFFER, size, glow::STATIC_READ);
            gl.bind_buffer_base(glow::SHADER_STORAGE_BUFFER, 0, Some(ssbo));
        }
        self.check_gl("glBufferData")?;

        // SAFETY: as above.
        let program = unsafe {
            let shader = gl
                .create_shader(glow::COMPUTE_SHADER)
                .map_err(|e| ProbeError::Shader(format!("glCreateShader: {e}")))?;
            gl.shader_source(shader, &source);
            gl.compile_shader(shader);
            if !gl.get_shader_compile_status(shader) {
                let log = gl.get_shader_info_log(shader);
                gl.delete_shader(shader);
                return Err(ProbeError::Shader(format!("compile failed: {log}")));
            }
            let program = gl
                .create_program()
                .map_err(|e| ProbeError::Shader(format!("glCreateProgram: {e}")))?;
            gl.attach_shader(program, shader);
            gl.link_program(program);
            gl.delete_shader(shader);
            if !gl.get_program_link_status(program) {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(ProbeError::Shader(format!("link failed: {log}")));
            }
            gl.use_program(Some(program));
            program
        };
        self.program = Some(program);
        self.check_gl("glUseProgram")?;
        self.geometry = Some(geometry);
        debug!(bytes = size, groups = ?geometry.num_groups(), "compute program ready");
        Ok(())
    }

    fn release_program(&mut self) {
        let gl = &self.ctx.gl;
        // SAFETY: the context is current; handles are owned by self.
        unsafe {
            if let Some(program) = self.program.take() {
                gl.delete_program(program);
            }
            if let Some(ssbo) = self.ssbo.take() {
                gl.delete_buffer(ssbo);
            }
        }
    }

    fn query_id(&mut self, kind: QueryKind) -> Result<u32> {
        if let Some((_, id)) = self.query_ids.iter().find(|(k, _)| *k == kind) {
            return Ok(*id);
        }
        let perf = self.perf()?;
        let name = query_name(kind);
        let cname = CString::new(name).map_err(|_| ProbeError::QueryNotFound(name.into()))?;
        let mut id = 0u32;
        // SAFETY: cname is NUL-terminated and the driver only reads it.
        unsafe { (perf.get_query_id_by_name)(cname.as_ptr().cast_mut(), &mut id) };
        // SAFETY: the context is current.
        if unsafe { self.gl().get_error() } != glow::NO_ERROR {
            return Err(ProbeError::QueryNotFound(name.into()));
        }
        debug!(query = name, id, "performance query id");
        self.query_ids.push((kind, id));
        Ok(id)
    }

    fn intel_catalog(&mut self, kind: QueryKind) -> Result<Catalog> {
        let id = self.query_id(kind)?;
        let perf = self.perf()?;

        let mut name_buf = vec![0 as c_char; QUERY_NAME_LEN];
        let (mut data_size, mut num_counters, mut num_instances, mut caps) = (0u32, 0u32, 0u32, 0u32);
        // SAFETY: buffers are sized as declared to the driver.
        unsafe {
            (perf.get_query_info)(
                id,
                QUERY_NAME_LEN as u32,
                name_buf.as_mut_ptr(),
                &mut data_size,
                &mut num_counters,
                &mut num_instances,
                &mut caps,
            )
        };
        self.check_gl("glGetPerfQueryInfoINTEL")?;
        let query = c_buf_to_string(&name_buf);
        debug!(%query, data_size, num_counters, "performance query info");

        let mut entries = Vec::with_capacity(num_counters as usize);
        // Counter ids are 1-based.
        for counter_id in 1..=num_counters {
            let mut counter_name = vec![0 as c_char; COUNTER_NAME_LEN];
            let mut counter_desc = vec![0 as c_char; COUNTER_DESC_LEN];
            let (mut offset, mut size, mut type_enum, mut data_type_enum) = (0u32, 0u32, 0u32, 0u32);
            let mut raw_max = 0u64;
            // SAFETY: as above.
            unsafe {
                (perf.get_counter_info)(
                    id,
                    counter_id,
                    COUNTER_NAME_LEN as u32,
                    counter_name.as_mut_ptr(),
                    COUNTER_DESC_LEN as u32,
                    counter_desc.as_mut_ptr(),
                    &mut offset,
                    &mut size,
                    &mut type_enum,
                    &mut data_type_enum,
                    &mut raw_max,
                )
            };
            self.check_gl("glGetPerfCounterInfoINTEL")?;
            let name = c_buf_to_string(&counter_name);
            debug!(
                id = counter_id,
                counter = %name,
                offset,
                data_size = size,
                "catalog entry"
            );
            entries.push(CatalogEntry {
                name,
                data_type: counter_data_type(data_type_enum),
                class: counter_class(type_enum),
                data_size: Some(size as usize),
                locator: CatalogLocator::Offset(offset as usize),
            });
        }
        Ok(Catalog {
            query,
            entries,
            result_size: Some(data_size as usize),
        })
    }
}

impl QueryDevice for GlBackend {
    type Handle = GlQuery;

    fn create_query(
        &mut self,
        kind: QueryKind,
        _counters: &CounterSet,
        _plan: &PassPlan,
    ) -> Result<GlQuery> {
        let id = self.query_id(kind)?;
        let perf = self.perf()?;
        let mut handle = 0u32;
        // SAFETY: id came from the driver; handle is an out parameter.
        unsafe { (perf.create_query)(id, &mut handle) };
        self.check_gl("glCreatePerfQueryINTEL")?;
        Ok(GlQuery { handle, kind })
    }

    fn reset_query(&mut self, _handle: GlQuery) -> Result<()> {
        // INTEL queries restart from zero on every begin.
        Ok(())
    }

    fn begin_query(&mut self, query: GlQuery) -> Result<BeginStatus> {
        let perf = self.perf()?;
        // SAFETY: handle came from glCreatePerfQueryINTEL.
        unsafe { (perf.begin_query)(query.handle) };
        // SAFETY: the context is current.
        match unsafe { self.gl().get_error() } {
            glow::NO_ERROR => Ok(BeginStatus::Started),
            glow::INVALID_OPERATION => Ok(BeginStatus::Busy),
            code => Err(ProbeError::Driver {
                call: "glBeginPerfQueryINTEL",
                detail: format!("GL error 0x{code:x}"),
            }),
        }
    }

    fn end_query(&mut self, query: GlQuery) -> Result<()> {
        let perf = self.perf()?;
        // SAFETY: handle is active.
        unsafe { (perf.end_query)(query.handle) };
        self.check_gl("glEndPerfQueryINTEL")
    }

    fn read_query(&mut self, query: GlQuery, out: &mut [u8]) -> Result<usize> {
        let perf = self.perf()?;
        let len = i32::try_from(out.len()).map_err(|_| ProbeError::ResultOutOfBounds {
            offset: 0,
            size: out.len(),
            len: i32::MAX as usize,
        })?;
        let mut written = 0u32;
        // SAFETY: out is writable for len bytes.
        unsafe {
            (perf.get_query_data)(
                query.handle,
                sys::GL_PERFQUERY_WAIT_INTEL,
                len,
                out.as_mut_ptr().cast::<c_void>(),
                &mut written,
            )
        };
        self.check_gl("glGetPerfQueryDataINTEL")?;
        Ok(written as usize)
    }

    fn destroy_query(&mut self, query: GlQuery) {
        if let Some(perf) = self.perf {
            // SAFETY: handle is not active; each handle is deleted once.
            unsafe { (perf.delete_query)(query.handle) };
            if let Err(err) = self.check_gl("glDeletePerfQueryINTEL") {
                warn!(kind = %query.kind, %err, "query delete reported an error");
            }
        }
    }
}

impl Submitter for GlBackend {
    fn submit_reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn submit_dispatch(&mut self, pass_index: Option<u32>) -> Result<()> {
        if let Some(pass) = pass_index {
            return Err(ProbeError::Submission(format!(
                "legacy backend has no counter passes (got pass {pass})"
            )));
        }
        if self.fence.is_some() {
            return Err(ProbeError::Submission(
                "previous dispatch has not been waited on".into(),
            ));
        }
        let (Some(program), Some(geometry)) = (self.program, self.geometry) else {
            return Err(ProbeError::InvalidConfig(
                "dispatch before the program was loaded".into(),
            ));
        };
        let [gx, gy, gz] = geometry.num_groups();
        let gl = &self.ctx.gl;
        // SAFETY: the context is current; program and ssbo are live.
        unsafe {
            gl.use_program(Some(program));
            gl.bind_buffer_base(glow::SHADER_STORAGE_BUFFER, 0, self.ssbo);
            match self.dispatch_group_size {
                Some(dispatch) => {
                    let w = geometry.workgroup;
                    dispatch(gx, gy, gz, w.x, w.y, w.z);
                }
                None => gl.dispatch_compute(gx, gy, gz),
            }
        }
        self.check_gl("glDispatchCompute")?;
        // SAFETY: as above.
        let fence = unsafe {
            gl.memory_barrier(glow::ALL_BARRIER_BITS);
            gl.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0)
        }
        .map_err(|e| ProbeError::Submission(format!("glFenceSync: {e}")))?;
        self.fence = Some(fence);
        Ok(())
    }

    fn wait_complete(&mut self, timeout: Duration) -> Result<()> {
        let Some(fence) = self.fence else {
            // Nothing outstanding.
            // SAFETY: the context is current.
            unsafe { self.gl().finish() };
            return Ok(());
        };
        let deadline = Instant::now() + timeout;
        let mut flags = glow::SYNC_FLUSH_COMMANDS_BIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // glow takes the timeout as i32 nanoseconds.
            let chunk = i32::try_from(remaining.as_nanos()).unwrap_or(i32::MAX);
            // SAFETY: fence is live.
            let status = unsafe { self.gl().client_wait_sync(fence, flags, chunk) };
            flags = 0;
            match status {
                glow::ALREADY_SIGNALED | glow::CONDITION_SATISFIED => break,
                glow::TIMEOUT_EXPIRED if !remaining.is_zero() => continue,
                glow::TIMEOUT_EXPIRED => {
                    return Err(ProbeError::FenceTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                other => {
                    return Err(ProbeError::Synchronization(format!(
                        "glClientWaitSync returned 0x{other:x}"
                    )));
                }
            }
        }
        self.fence = None;
        // SAFETY: the fence is signalled.
        unsafe { self.gl().delete_sync(fence) };
        Ok(())
    }
}

impl CounterBackend for GlBackend {
    fn name(&self) -> &'static str {
        "gl"
    }

    fn bracketing(&self) -> Bracketing {
        Bracketing::Immediate
    }

    fn enumerate_counters(&mut self, kind: QueryKind) -> Result<Catalog> {
        self.intel_catalog(kind)
    }

    fn expectations(&self, kind: QueryKind) -> &'static [CounterExpectation] {
        match kind {
            QueryKind::Metrics => counters::LEGACY_METRICS,
            QueryKind::PipelineStatistics => counters::LEGACY_PIPELINE_STATISTICS,
        }
    }

    fn plan_passes(&mut self, _sets: &[(QueryKind, CounterSet)]) -> Result<PassPlan> {
        Ok(PassPlan::single())
    }

    fn record_dispatch(&mut self) -> Result<()> {
        // Immediate mode: the dispatch is issued by submit_dispatch.
        Ok(())
    }
}

impl OutputReadback for GlBackend {
    fn read_output(&mut self) -> Result<Vec<Pixel>> {
        if self.fence.is_some() {
            return Err(ProbeError::Synchronization(
                "output buffer read before the dispatch completed".into(),
            ));
        }
        let (Some(ssbo), Some(geometry)) = (self.ssbo, self.geometry) else {
            return Err(ProbeError::InvalidConfig(
                "output read before the program was loaded".into(),
            ));
        };
        let mut bytes = vec![0u8; pixel::output_buffer_size(&geometry.extents)?];
        // SAFETY: the context is current and the buffer holds bytes.len() bytes.
        unsafe {
            self.gl().bind_buffer(glow::SHADER_STORAGE_BUFFER, Some(ssbo));
            self.gl()
                .get_buffer_sub_data(glow::SHADER_STORAGE_BUFFER, 0, &mut bytes);
        }
        self.check_gl("glGetBufferSubData")?;
        info!(bytes = bytes.len(), "output buffer read back");
        pixel::decode_pixels(&bytes, geometry.extents.invocation_count())
    }
}

impl Drop for GlBackend {
    fn drop(&mut self) {
        if let Some(fence) = self.fence.take() {
            // SAFETY: the context is current; finish retires the fence.
            unsafe {
                self.ctx.gl.finish();
                self.ctx.gl.delete_sync(fence);
            }
        }
        self.release_program();
    }
}
