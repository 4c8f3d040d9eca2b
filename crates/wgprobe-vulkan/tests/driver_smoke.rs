use std::env;
use std::time::Duration;

use wgprobe_core::backend::resolve_counters;
use wgprobe_core::dispatch::{DispatchExtents, DispatchGeometry, WorkgroupSize};
use wgprobe_core::lock::ExplicitLock;
use wgprobe_core::measure::{MeasureOptions, dispatch_unmeasured, measure};
use wgprobe_core::pixel::OutputReadback;
use wgprobe_vulkan::{VulkanBackend, VulkanProfilingLock};

fn geometry() -> DispatchGeometry {
    DispatchGeometry::new(
        DispatchExtents {
            width: 32,
            height: 32,
            depth: 1,
        },
        WorkgroupSize { x: 8, y: 8, z: 1 },
    )
    .expect("geometry")
}

fn spirv() -> Vec<u8> {
    let path = env::var("WGPROBE_TEST_SPIRV").expect("set WGPROBE_TEST_SPIRV");
    std::fs::read(path).expect("read SPIR-V")
}

#[test]
#[ignore = "requires a Vulkan driver with VK_KHR_performance_query"]
fn catalog_exposes_required_counters() {
    let mut backend = VulkanBackend::new(true).expect("measured device");
    let plan = resolve_counters(&mut backend).expect("counter plan");
    assert!(plan.passes.num_passes() >= 1);
}

#[test]
#[ignore = "requires a Vulkan driver with VK_KHR_performance_query and WGPROBE_TEST_SPIRV"]
fn measured_dispatch_reports_every_invocation() {
    let mut backend = VulkanBackend::new(true).expect("measured device");
    let plan = resolve_counters(&mut backend).expect("counter plan");
    backend
        .load_pipeline(&spirv(), geometry())
        .expect("pipeline");
    let report = {
        let mut lock = ExplicitLock::new(
            VulkanProfilingLock::new(&backend).expect("lock"),
            Some(Duration::from_secs(5)),
        );
        measure(
            &mut backend,
            &mut lock,
            &plan,
            &MeasureOptions::new(geometry()),
        )
        .expect("measurement")
    };
    assert_eq!(report.cs_invocations, 32 * 32);
    assert!(report.threads_dispatched > 0);
}

#[test]
#[ignore = "requires a Vulkan driver and WGPROBE_TEST_SPIRV"]
fn unmeasured_dispatch_fills_output() {
    let mut backend = VulkanBackend::new(false).expect("device");
    backend
        .load_pipeline(&spirv(), geometry())
        .expect("pipeline");
    dispatch_unmeasured(&mut backend, &MeasureOptions::new(geometry())).expect("dispatch");
    let pixels = backend.read_output().expect("read back");
    assert_eq!(pixels.len(), 32 * 32);
    assert_eq!(pixels[0].num_work_groups.x, 4);
}
