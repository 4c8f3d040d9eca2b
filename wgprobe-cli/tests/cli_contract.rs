use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

const STATS_HEADER: &str = "x:int,y:int,z:int,time_ns:int,threads:int,invocations:int,simd:int,thread_occupancy_pct:int,cpu_time_ns:int";

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "wgprobe_cli_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Run the binary in `dir` against the simulated counter unit.
fn mock_run(dir: &Path, args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_wgprobe"));
    cmd.current_dir(dir)
        .args(args)
        .env("WGPROBE_MOCK_RUN", "1")
        .env("NO_COLOR", "1")
        .env_remove("CSV")
        .env_remove("PERF_ENABLED")
        .env_remove("RUST_LOG");
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.output().expect("run wgprobe")
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{what} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_wgprobe"))
        .arg("help")
        .output()
        .expect("run wgprobe help");
    assert_success(&output, "wgprobe help");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("vulkan"), "missing vulkan in help output");
    assert!(stdout.contains("gl"), "missing gl in help output");
    assert!(stdout.contains("counters"), "missing counters in help output");
}

#[test]
fn gl_text_report_prints_six_lines_and_dumps_data() {
    let dir = unique_temp_dir("gl_text");
    let output = mock_run(&dir, &["gl", "16", "16", "1", "8", "8", "1"], &[]);
    assert_success(&output, "mock gl run");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 6, "unexpected report: {stdout}");
    assert!(lines[0].starts_with("EU Thread Occupancy:"));
    assert!(lines[3].starts_with("CS Invocations:"));
    assert!(lines[3].ends_with(" 256"), "{}", lines[3]);
    assert!(lines[4].starts_with("SIMD Width:"));
    assert!(lines[5].ends_with(" ns"));

    assert!(!dir.join("stats.csv").exists(), "text mode must not create stats.csv");
    let data = fs::read_to_string(dir.join("data.csv")).expect("data.csv");
    assert!(data.starts_with("z:int,GIID.z:int,"));
    assert_eq!(data.lines().count(), 1 + 16 * 16);
}

#[test]
fn csv_env_writes_header_and_one_row() {
    let dir = unique_temp_dir("csv");
    let output = mock_run(
        &dir,
        &["vulkan", "16", "16", "1", "8", "8", "1", "--no-dump"],
        &[("CSV", "1")],
    );
    assert_success(&output, "mock vulkan csv run");
    assert!(
        output.stdout.is_empty(),
        "csv mode prints nothing on stdout: {}",
        String::from_utf8_lossy(&output.stdout)
    );

    let stats = fs::read_to_string(dir.join("stats.csv")).expect("stats.csv");
    let lines: Vec<&str> = stats.lines().collect();
    assert_eq!(lines.len(), 2, "{stats}");
    assert_eq!(lines[0], STATS_HEADER);
    let fields: Vec<&str> = lines[1].split(',').collect();
    assert_eq!(fields.len(), 9);
    assert!(fields.iter().all(|f| f.parse::<i64>().is_ok()), "{fields:?}");
    assert_eq!(&fields[..3], ["8", "8", "1"]);
    assert_eq!(fields[5], "256");
    assert!(!dir.join("data.csv").exists(), "--no-dump must skip data.csv");
}

#[test]
fn perf_disabled_skips_report_but_still_dumps() {
    let dir = unique_temp_dir("unmeasured");
    let output = mock_run(
        &dir,
        &["gl", "8", "4", "2", "4", "4", "1"],
        &[("PERF_ENABLED", "0"), ("CSV", "1")],
    );
    assert_success(&output, "mock unmeasured run");

    assert!(output.stdout.is_empty(), "no report when counters are off");
    assert!(!dir.join("stats.csv").exists(), "CSV needs measurement enabled");
    let data = fs::read_to_string(dir.join("data.csv")).expect("data.csv");
    assert_eq!(data.lines().count(), 1 + 8 * 4 * 2);
}

#[test]
fn json_format_emits_one_object() {
    let dir = unique_temp_dir("json");
    let output = mock_run(
        &dir,
        &["vulkan", "32", "8", "1", "8", "8", "1", "--format", "json", "--no-dump"],
        &[],
    );
    assert_success(&output, "mock json run");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).expect("json report");
    assert_eq!(value.get("backend").and_then(|v| v.as_str()), Some("simulated-modern"));
    assert_eq!(value.get("cs_invocations").and_then(|v| v.as_u64()), Some(256));
    assert!(value.get("passes").and_then(|v| v.as_u64()).is_some());
}

#[test]
fn zero_dimension_exits_with_status_two() {
    let dir = unique_temp_dir("zero_dim");
    let output = mock_run(&dir, &["gl", "0", "16", "1", "8", "8", "1"], &[]);

    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Command failed"), "stderr: {stderr}");
    assert!(!dir.join("data.csv").exists());
}

#[test]
fn counters_lists_both_simulated_queries() {
    let dir = unique_temp_dir("counters");
    let output = mock_run(&dir, &["counters", "gl"], &[]);
    assert_success(&output, "mock counters listing");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("EU Thread Occupancy"), "{stdout}");
    assert!(stdout.contains("pipeline-statistics:"), "{stdout}");
    assert!(stdout.trim_end().ends_with("passes: 1"), "{stdout}");
}

#[test]
fn oversized_dimensions_fail_cleanly() {
    let dir = unique_temp_dir("oversized");
    let output = mock_run(
        &dir,
        &["gl", "4294967295", "4294967295", "2", "1", "1", "1"],
        &[],
    );

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Command failed"), "stderr: {stderr}");
    assert!(!stderr.contains("panicked"), "stderr: {stderr}");
}
