//! `VK_KHR_performance_query` implementation of [`CounterBackend`].
//!
//! Begin, dispatch and end are recorded once into the dispatch command
//! buffer; the scheduler replays that buffer for every counter pass. Query
//! resets live in their own command buffer because a performance query may
//! not be reset in a buffer that also begins it.

use std::ffi::c_void;
use std::mem::size_of;
use std::time::Duration;

use ash::vk;
use tracing::{debug, info};
use wgprobe_core::backend::{Bracketing, CounterBackend};
use wgprobe_core::counters::{
    self, Catalog, CatalogEntry, CatalogLocator, CounterDataType, CounterExpectation, CounterSet,
    RESULT_SLOT_SIZE,
};
use wgprobe_core::dispatch::DispatchGeometry;
use wgprobe_core::error::{ProbeError, Result};
use wgprobe_core::pixel::{self, OutputReadback, Pixel};
use wgprobe_core::query::{BeginStatus, QueryDevice, QueryKind};
use wgprobe_core::schedule::{PassPlan, Submitter};

use crate::context::{VulkanContext, fixed_str, teardown_ok, vk_err};
use crate::pipeline::ComputePipeline;

const _: () = assert!(size_of::<vk::PerformanceCounterResultKHR>() == RESULT_SLOT_SIZE);

/// Handle to one single-query pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VulkanQuery {
    pool: vk::QueryPool,
    kind: QueryKind,
}

#[derive(Clone, Copy, Debug, Default)]
struct CommandState {
    cb: vk::CommandBuffer,
    recording: bool,
}

pub struct VulkanBackend {
    command_pool: vk::CommandPool,
    reset: CommandState,
    dispatch: CommandState,
    /// Set once the dispatch buffer holds a bound, barriered dispatch.
    dispatch_recorded: bool,
    pools: Vec<(vk::QueryPool, usize)>,
    in_flight: Option<vk::Fence>,
    pipeline: Option<ComputePipeline>,
    geometry: Option<DispatchGeometry>,
    ctx: VulkanContext,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("ctx", &self.ctx)
            .field("pools", &self.pools.len())
            .field("pipeline", &self.pipeline.is_some())
            .finish()
    }
}

impl VulkanBackend {
    /// Create the device, command pool and both command buffers.
    ///
    /// The pipeline comes later through [`VulkanBackend::load_pipeline`], so
    /// counters can be resolved before any shader work.
    pub fn new(measured: bool) -> Result<Self> {
        let ctx = VulkanContext::new(measured)?;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(ctx.queue_family);
        // SAFETY: ctx.device is live; the pool is destroyed in Drop.
        let command_pool = unsafe { ctx.device.create_command_pool(&pool_info, None) }
            .map_err(vk_err("vkCreateCommandPool"))?;
        let mut backend = Self {
            command_pool,
            reset: CommandState::default(),
            dispatch: CommandState::default(),
            dispatch_recorded: false,
            pools: Vec::new(),
            in_flight: None,
            pipeline: None,
            geometry: None,
            ctx,
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(2);
        // SAFETY: command_pool was created above on this device.
        let buffers = unsafe { backend.ctx.device.allocate_command_buffers(&alloc_info) }
            .map_err(vk_err("vkAllocateCommandBuffers"))?;
        backend.reset.cb = buffers[0];
        backend.dispatch.cb = buffers[1];
        Ok(backend)
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    /// Build the compute pipeline and output buffer for `geometry`.
    pub fn load_pipeline(&mut self, spirv: &[u8], geometry: DispatchGeometry) -> Result<()> {
        if let Some(mut old) = self.pipeline.take() {
            self.wait_idle();
            old.destroy(&self.ctx.device);
        }
        self.pipeline = Some(ComputePipeline::new(&self.ctx, spirv, &geometry)?);
        self.geometry = Some(geometry);
        Ok(())
    }

    fn wait_idle(&self) {
        // SAFETY: device is live.
        let result = unsafe { self.ctx.device.device_wait_idle() };
        teardown_ok("vkDeviceWaitIdle", result);
    }

    fn submit(&mut self, cb: vk::CommandBuffer, pass_index: Option<u32>) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(ProbeError::Submission(
                "previous submission has not been waited on".into(),
            ));
        }
        let device = &self.ctx.device;
        // SAFETY: device is live; the fence is destroyed in wait_complete or Drop.
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(vk_err("vkCreateFence"))?;

        let cbs = [cb];
        let mut perf_submit = vk::PerformanceQuerySubmitInfoKHR::default();
        let mut submit = vk::SubmitInfo::default().command_buffers(&cbs);
        if let Some(index) = pass_index {
            perf_submit = perf_submit.counter_pass_index(index);
            submit = submit.push_next(&mut perf_submit);
        }
        // SAFETY: cb is executable; submit only references locals.
        if let Err(e) = unsafe { device.queue_submit(self.ctx.queue, &[submit], fence) } {
            // SAFETY: the fence was never submitted.
            unsafe { device.destroy_fence(fence, None) };
            return Err(ProbeError::Submission(format!("vkQueueSubmit: {e:?}")));
        }
        self.in_flight = Some(fence);
        Ok(())
    }

    fn performance_catalog(&self) -> Result<Catalog> {
        let perf = self.ctx.perf()?;
        let pd = self.ctx.physical_device;
        let qf = self.ctx.queue_family;
        // SAFETY: pd and qf come from this instance.
        let len = unsafe {
            perf.instance
                .enumerate_physical_device_queue_family_performance_query_counters_len(pd, qf)
        }
        .map_err(vk_err("vkEnumeratePhysicalDeviceQueueFamilyPerformanceQueryCountersKHR"))?;
        let mut counters = vec![vk::PerformanceCounterKHR::default(); len];
        let mut descriptions = vec![vk::PerformanceCounterDescriptionKHR::default(); len];
        // SAFETY: both output slices have the length reported above.
        unsafe {
            perf.instance
                .enumerate_physical_device_queue_family_performance_query_counters(
                    pd,
                    qf,
                    &mut counters,
                    &mut descriptions,
                )
        }
        .map_err(vk_err("vkEnumeratePhysicalDeviceQueueFamilyPerformanceQueryCountersKHR"))?;

        let mut entries = Vec::with_capacity(len);
        for (index, (counter, description)) in counters.iter().zip(&descriptions).enumerate() {
            let name = fixed_str(&description.name);
            debug!(
                index,
                counter = %name,
                category = %fixed_str(&description.category),
                storage = ?counter.storage,
                unit = ?counter.unit,
                scope = ?counter.scope,
                "performance counter"
            );
            entries.push(CatalogEntry {
                name,
                data_type: storage_type(counter.storage),
                class: None,
                data_size: None,
                locator: CatalogLocator::Index(index as u32),
            });
        }
        Ok(Catalog {
            query: "VK_KHR_performance_query".into(),
            entries,
            result_size: None,
        })
    }
}

/// Start recording into `state.cb` unless it already is. Returns whether a
/// fresh recording was started.
fn begin_recording(device: &ash::Device, state: &mut CommandState) -> Result<bool> {
    if state.recording {
        return Ok(false);
    }
    // SAFETY: the buffer is not pending; every submission is waited on
    // before the next recording starts.
    unsafe {
        device
            .reset_command_buffer(state.cb, vk::CommandBufferResetFlags::empty())
            .map_err(vk_err("vkResetCommandBuffer"))?;
        device
            .begin_command_buffer(state.cb, &vk::CommandBufferBeginInfo::default())
            .map_err(vk_err("vkBeginCommandBuffer"))?;
    }
    state.recording = true;
    Ok(true)
}

fn finish_recording(device: &ash::Device, state: &mut CommandState) -> Result<()> {
    if !state.recording {
        return Ok(());
    }
    state.recording = false;
    // SAFETY: state.cb is in the recording state.
    unsafe { device.end_command_buffer(state.cb) }.map_err(vk_err("vkEndCommandBuffer"))
}

fn storage_type(storage: vk::PerformanceCounterStorageKHR) -> CounterDataType {
    use vk::PerformanceCounterStorageKHR as S;
    match storage {
        S::INT32 => CounterDataType::Int32,
        S::INT64 => CounterDataType::Int64,
        S::UINT32 => CounterDataType::UInt32,
        S::UINT64 => CounterDataType::UInt64,
        S::FLOAT32 => CounterDataType::Float32,
        S::FLOAT64 => CounterDataType::Float64,
        other => CounterDataType::Unknown(other.as_raw() as u32),
    }
}

/// Bytes of query result the driver wrote for a `requested`-byte read.
///
/// Only `VK_SUCCESS` means every requested byte was written. A caller buffer
/// smaller than the pool's result yields a short count, which extraction
/// rejects against the counter set's result size.
fn query_result_len(kind: QueryKind, result: vk::Result, requested: usize) -> Result<usize> {
    match result {
        vk::Result::SUCCESS => Ok(requested),
        vk::Result::NOT_READY | vk::Result::INCOMPLETE => Err(ProbeError::Synchronization(
            format!("{kind} query results not available ({result:?})"),
        )),
        other => Err(ProbeError::Driver {
            call: "vkGetQueryPoolResults",
            detail: format!("{other:?}"),
        }),
    }
}

fn statistics_catalog() -> Catalog {
    Catalog {
        query: "VK_QUERY_TYPE_PIPELINE_STATISTICS".into(),
        entries: vec![CatalogEntry {
            name: counters::names::CS_INVOCATIONS.into(),
            data_type: CounterDataType::UInt64,
            class: None,
            data_size: Some(size_of::<u64>()),
            locator: CatalogLocator::Index(0),
        }],
        result_size: None,
    }
}

fn performance_create_info<'a>(
    queue_family: u32,
    indices: &'a [u32],
) -> vk::QueryPoolPerformanceCreateInfoKHR<'a> {
    vk::QueryPoolPerformanceCreateInfoKHR::default()
        .queue_family_index(queue_family)
        .counter_indices(indices)
}

impl QueryDevice for VulkanBackend {
    type Handle = VulkanQuery;

    fn create_query(
        &mut self,
        kind: QueryKind,
        counters: &CounterSet,
        _plan: &PassPlan,
    ) -> Result<VulkanQuery> {
        let device = &self.ctx.device;
        let indices = counters.selected_indices();
        let mut perf_info = performance_create_info(self.ctx.queue_family, &indices);
        let info = match kind {
            QueryKind::Metrics => vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::PERFORMANCE_QUERY_KHR)
                .query_count(1)
                .push_next(&mut perf_info),
            QueryKind::PipelineStatistics => vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::PIPELINE_STATISTICS)
                .query_count(1)
                .pipeline_statistics(vk::QueryPipelineStatisticFlags::COMPUTE_SHADER_INVOCATIONS),
        };
        // SAFETY: info only references locals.
        let pool = unsafe { device.create_query_pool(&info, None) }
            .map_err(vk_err("vkCreateQueryPool"))?;
        self.pools.push((pool, counters.result_size()));
        Ok(VulkanQuery { pool, kind })
    }

    fn reset_query(&mut self, handle: VulkanQuery) -> Result<()> {
        begin_recording(&self.ctx.device, &mut self.reset)?;
        // SAFETY: reset buffer is recording; pool is live.
        unsafe {
            self.ctx
                .device
                .cmd_reset_query_pool(self.reset.cb, handle.pool, 0, 1)
        };
        Ok(())
    }

    fn begin_query(&mut self, handle: VulkanQuery) -> Result<BeginStatus> {
        if begin_recording(&self.ctx.device, &mut self.dispatch)? {
            self.dispatch_recorded = false;
        }
        // SAFETY: dispatch buffer is recording; the profiling lock is held
        // by the caller for performance pools.
        unsafe {
            self.ctx.device.cmd_begin_query(
                self.dispatch.cb,
                handle.pool,
                0,
                vk::QueryControlFlags::empty(),
            )
        };
        // Busy is reported through the profiling lock, never at begin.
        Ok(BeginStatus::Started)
    }

    fn end_query(&mut self, handle: VulkanQuery) -> Result<()> {
        if !self.dispatch.recording {
            return Err(ProbeError::Submission(format!(
                "end of {} query outside a recording",
                handle.kind
            )));
        }
        // SAFETY: the query was begun in this recording.
        unsafe {
            self.ctx
                .device
                .cmd_end_query(self.dispatch.cb, handle.pool, 0)
        };
        Ok(())
    }

    fn read_query(&mut self, handle: VulkanQuery, out: &mut [u8]) -> Result<usize> {
        let expected = self
            .pools
            .iter()
            .find(|(pool, _)| *pool == handle.pool)
            .map(|(_, size)| *size)
            .ok_or_else(|| ProbeError::Synchronization(format!("unknown query pool {handle:?}")))?;
        let len = expected.min(out.len());
        let flags = match handle.kind {
            QueryKind::Metrics => vk::QueryResultFlags::WAIT,
            QueryKind::PipelineStatistics => {
                vk::QueryResultFlags::WAIT | vk::QueryResultFlags::TYPE_64
            }
        };
        let device = &self.ctx.device;
        // The typed ash wrapper assumes one element per query; a performance
        // query returns one slot per counter, so go through the raw entry point.
        // SAFETY: out has at least `len` bytes; one query is read with a
        // stride covering its whole result.
        let result = unsafe {
            (device.fp_v1_0().get_query_pool_results)(
                device.handle(),
                handle.pool,
                0,
                1,
                len,
                out.as_mut_ptr().cast::<c_void>(),
                len as vk::DeviceSize,
                flags,
            )
        };
        query_result_len(handle.kind, result, len)
    }

    fn destroy_query(&mut self, handle: VulkanQuery) {
        self.pools.retain(|(pool, _)| *pool != handle.pool);
        // SAFETY: the session waited for every submission referencing it.
        unsafe { self.ctx.device.destroy_query_pool(handle.pool, None) };
    }
}

impl Submitter for VulkanBackend {
    fn submit_reset(&mut self) -> Result<()> {
        finish_recording(&self.ctx.device, &mut self.reset)?;
        self.submit(self.reset.cb, None)
    }

    fn submit_dispatch(&mut self, pass_index: Option<u32>) -> Result<()> {
        finish_recording(&self.ctx.device, &mut self.dispatch)?;
        if !self.dispatch_recorded {
            return Err(ProbeError::Submission(
                "no dispatch has been recorded".into(),
            ));
        }
        self.submit(self.dispatch.cb, pass_index)
    }

    fn wait_complete(&mut self, timeout: Duration) -> Result<()> {
        let Some(fence) = self.in_flight else {
            return Err(ProbeError::Synchronization(
                "wait without a pending submission".into(),
            ));
        };
        let device = &self.ctx.device;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        // SAFETY: fence belongs to this device.
        let waited = unsafe { device.wait_for_fences(&[fence], true, timeout_ns) };
        match waited {
            Ok(()) => {
                self.in_flight = None;
                // SAFETY: the fence is signalled and no longer in use.
                unsafe { device.destroy_fence(fence, None) };
                Ok(())
            }
            // The fence stays in flight; Drop waits for the device and frees it.
            Err(vk::Result::TIMEOUT) => Err(ProbeError::FenceTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(e) => Err(ProbeError::Synchronization(format!("vkWaitForFences: {e:?}"))),
        }
    }
}

impl CounterBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn bracketing(&self) -> Bracketing {
        Bracketing::Recorded
    }

    fn enumerate_counters(&mut self, kind: QueryKind) -> Result<Catalog> {
        match kind {
            QueryKind::Metrics => self.performance_catalog(),
            QueryKind::PipelineStatistics => Ok(statistics_catalog()),
        }
    }

    fn expectations(&self, kind: QueryKind) -> &'static [CounterExpectation] {
        match kind {
            QueryKind::Metrics => counters::MODERN_METRICS,
            QueryKind::PipelineStatistics => counters::MODERN_PIPELINE_STATISTICS,
        }
    }

    fn plan_passes(&mut self, sets: &[(QueryKind, CounterSet)]) -> Result<PassPlan> {
        let Some((_, metrics)) = sets.iter().find(|(kind, _)| *kind == QueryKind::Metrics) else {
            return Ok(PassPlan::single());
        };
        let indices = metrics.selected_indices();
        let info = performance_create_info(self.ctx.queue_family, &indices);
        let perf = self.ctx.perf()?;
        // SAFETY: info only references locals.
        let passes = unsafe {
            perf.instance
                .get_physical_device_queue_family_performance_query_passes(
                    self.ctx.physical_device,
                    &info,
                )
        };
        info!(passes, counters = ?indices, "performance query pass count");
        PassPlan::new(passes)
    }

    fn record_dispatch(&mut self) -> Result<()> {
        let (Some(pipeline), Some(geometry)) = (self.pipeline.as_ref(), self.geometry) else {
            return Err(ProbeError::InvalidConfig(
                "dispatch recorded before the pipeline was loaded".into(),
            ));
        };
        let [gx, gy, gz] = geometry.num_groups();
        let (pipe, layout, set) = (pipeline.pipeline, pipeline.layout, pipeline.descriptor_set);

        begin_recording(&self.ctx.device, &mut self.dispatch)?;
        let device = &self.ctx.device;
        let cb = self.dispatch.cb;
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ);
        // SAFETY: cb is recording; pipeline objects outlive the recording.
        unsafe {
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipe);
            device.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &[set],
                &[],
            );
            device.cmd_dispatch(cb, gx, gy, gz);
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        self.dispatch_recorded = true;
        debug!(groups = ?[gx, gy, gz], "dispatch recorded");
        Ok(())
    }
}

impl OutputReadback for VulkanBackend {
    fn read_output(&mut self) -> Result<Vec<Pixel>> {
        if self.in_flight.is_some() {
            return Err(ProbeError::Synchronization(
                "output buffer read before the dispatch completed".into(),
            ));
        }
        let (Some(pipeline), Some(geometry)) = (self.pipeline.as_ref(), self.geometry) else {
            return Err(ProbeError::InvalidConfig(
                "output read before the pipeline was loaded".into(),
            ));
        };
        let bytes = pipeline.read_bytes(&self.ctx.device)?;
        pixel::decode_pixels(&bytes, geometry.extents.invocation_count())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        self.wait_idle();
        let device = &self.ctx.device;
        // SAFETY: the device is idle; each handle is destroyed once.
        unsafe {
            if let Some(fence) = self.in_flight.take() {
                device.destroy_fence(fence, None);
            }
            for (pool, _) in self.pools.drain(..) {
                device.destroy_query_pool(pool, None);
            }
            device.destroy_command_pool(self.command_pool, None);
        }
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.destroy(device);
        }
    }
}
