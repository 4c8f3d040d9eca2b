//! `vkAcquireProfilingLockKHR` as a [`ProfilingLockDevice`].

use std::time::Duration;

use ash::{khr, vk};
use tracing::debug;
use wgprobe_core::error::{ProbeError, Result};
use wgprobe_core::lock::ProfilingLockDevice;

use crate::backend::VulkanBackend;

/// Device-wide profiling lock.
///
/// Holds a copy of the device's extension entry points, so it must be
/// dropped (and thereby released) before the [`VulkanBackend`] it came from.
pub struct VulkanProfilingLock {
    fns: khr::performance_query::Device,
}

impl VulkanProfilingLock {
    pub fn new(backend: &VulkanBackend) -> Result<Self> {
        Ok(Self {
            fns: backend.context().perf()?.device.clone(),
        })
    }
}

impl std::fmt::Debug for VulkanProfilingLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanProfilingLock")
            .field("device", &self.fns.device())
            .finish()
    }
}

/// `None` waits indefinitely.
fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

impl ProfilingLockDevice for VulkanProfilingLock {
    fn acquire_profiling_lock(&mut self, timeout: Option<Duration>) -> Result<()> {
        let info = vk::AcquireProfilingLockInfoKHR::default().timeout(timeout_ns(timeout));
        // SAFETY: the device outlives this lock; info is a local.
        unsafe { self.fns.acquire_profiling_lock(&info) }.map_err(|e| match e {
            vk::Result::TIMEOUT => ProbeError::ProfilingLock(format!(
                "not acquired within {} ms",
                timeout.map_or(u128::MAX, |t| t.as_millis())
            )),
            other => ProbeError::ProfilingLock(format!("vkAcquireProfilingLockKHR: {other:?}")),
        })?;
        debug!("profiling lock acquired");
        Ok(())
    }

    fn release_profiling_lock(&mut self) {
        // SAFETY: only called while held; the device outlives this lock.
        unsafe { self.fns.release_profiling_lock() };
        debug!("profiling lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_timeout_maps_to_max() {
        assert_eq!(timeout_ns(None), u64::MAX);
        assert_eq!(timeout_ns(Some(Duration::from_millis(5))), 5_000_000);
        assert_eq!(timeout_ns(Some(Duration::MAX)), u64::MAX);
    }
}
