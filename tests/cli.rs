//! Runs the `simbench` binary the way a user would.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use simbench::report::{ReportWriter, RunMode};

const SCENE: &str = r#"
name: studio
levels:
  - height: 0.0
    map: |
      #######
      #.....#
      #..3..#
      #.....#
      #######
objects:
  - id: 3
    category: lamp
"#;

fn simbench(dir: &Path, args: &[&str]) -> Output {
    let scene = dir.join("studio.yaml");
    fs::write(&scene, SCENE).unwrap();
    Command::new(env!("CARGO_BIN_EXE_simbench"))
        .args(args)
        .args(["--scene", scene.to_str().unwrap()])
        .args(["--width", "24", "--height", "16", "--max-frames", "6", "--silent"])
        .output()
        .unwrap()
}

#[test]
fn example_prints_the_performance_banner() {
    let dir = tempfile::tempdir().unwrap();
    let output = simbench(dir.path(), &["example"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Performance"));
    assert!(stdout.contains(" 24 x 16, total time "));
}

#[test]
fn benchmark_writes_a_report() {
    let dir = tempfile::tempdir().unwrap();
    let reports = dir.path().join("reports");
    let output = simbench(
        dir.path(),
        &[
            "benchmark",
            "--num-processes",
            "2",
            "--report-dir",
            reports.to_str().unwrap(),
        ],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8(output.stdout).unwrap().contains("Aggregate Performance"));

    let files: Vec<_> = fs::read_dir(&reports).unwrap().collect();
    assert_eq!(files.len(), 1);
    let report = ReportWriter::load(&files[0].as_ref().unwrap().path()).unwrap();
    assert_eq!(report.mode, RunMode::Benchmark);
    assert_eq!(report.workers.len(), 2);
    assert_eq!(report.aggregate.unwrap().workers, 2);
}

#[test]
fn fps_below_threshold_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let output = simbench(dir.path(), &["example", "--min-fps", "1e12"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("regression threshold"));
}

#[test]
fn missing_physics_config_is_a_construction_failure() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("physics.json");
    let output = simbench(
        dir.path(),
        &[
            "benchmark",
            "--threads",
            "--enable-physics",
            "--physics-config-file",
            missing.to_str().unwrap(),
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("physics config"));
}
