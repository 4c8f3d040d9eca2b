#![cfg(target_os = "linux")]

use std::env;

use wgprobe_core::backend::resolve_counters;
use wgprobe_core::counters::CounterRole;
use wgprobe_core::dispatch::{DispatchExtents, DispatchGeometry, WorkgroupSize};
use wgprobe_core::lock::{RetryBeginLock, RetryPolicy, ThreadSleep};
use wgprobe_core::measure::{MeasureOptions, measure};
use wgprobe_core::query::QueryKind;
use wgprobe_gl::{GlBackend, GlOptions};

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

#[test]
#[ignore = "requires Mesa with GL_INTEL_performance_query on /dev/dri/renderD128"]
fn intel_catalog_resolves_required_counters() {
    let mut backend = GlBackend::new(&GlOptions::default()).expect("GL backend");
    let plan = resolve_counters(&mut backend).expect("counter plan");
    let stats = plan
        .set(QueryKind::PipelineStatistics)
        .expect("pipeline statistics set");
    assert!(stats.by_role(CounterRole::ShaderInvocations).is_some());
}

#[test]
#[ignore = "requires Mesa with GL_INTEL_performance_query and WGPROBE_TEST_GLSL"]
fn measured_dispatch_counts_every_invocation() {
    let template = std::fs::read_to_string(
        env::var("WGPROBE_TEST_GLSL").expect("set WGPROBE_TEST_GLSL"),
    )
    .expect("read GLSL template");
    let mut backend = GlBackend::new(&GlOptions::default()).expect("GL backend");
    let plan = resolve_counters(&mut backend).expect("counter plan");
    backend
        .load_program(&template, geometry())
        .expect("program");
    let mut lock = RetryBeginLock::new(RetryPolicy::default(), ThreadSleep);
    let report = measure(
        &mut backend,
        &mut lock,
        &plan,
        &MeasureOptions::new(geometry()),
    )
    .expect("measurement");
    assert_eq!(report.cs_invocations, 32 * 32);
}
