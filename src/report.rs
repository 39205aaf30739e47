//! Human-readable performance banners and JSON run reports.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BenchmarkSettings;
use crate::harness::{AggregateReport, BenchmarkOutcome, WorkerReport};
use crate::runner::TrialResult;

const RULE: &str = " ============================================================== ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Example,
    Benchmark,
}

impl RunMode {
    fn as_str(self) -> &'static str {
        match self {
            RunMode::Example => "example",
            RunMode::Benchmark => "benchmark",
        }
    }
}

fn banner(title: &str, body: String) -> String {
    format!(" ========================= {title} ======================== \n{body}\n{RULE}")
}

fn performance_line(width: u32, height: u32, total_time: f64, frame_time: f64, fps: f64) -> String {
    format!(
        " {width} x {height}, total time {total_time:.2} s, frame time {:.3} ms ({fps:.1} FPS)",
        frame_time * 1000.0
    )
}

pub fn performance_banner(width: u32, height: u32, result: &TrialResult) -> String {
    banner(
        "Performance",
        performance_line(width, height, result.total_time, result.frame_time, result.fps),
    )
}

pub fn aggregate_banner(width: u32, height: u32, aggregate: &AggregateReport) -> String {
    let mut body = format!(" {} worker(s)\n", aggregate.workers);
    body.push_str(&performance_line(
        width,
        height,
        aggregate.total_time,
        aggregate.frame_time,
        aggregate.fps,
    ));
    banner("Aggregate Performance", body)
}

/// Fails when a threshold is given and `fps` falls below it.
pub fn check_fps(fps: f64, min_fps: Option<f64>) -> Result<()> {
    if let Some(min_fps) = min_fps {
        ensure!(
            fps >= min_fps,
            "FPS is below regression threshold: {fps:.1} < {min_fps:.1}"
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub mode: RunMode,
    pub settings: BenchmarkSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<WorkerReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<TrialResult>,
}

impl RunReport {
    pub fn example(settings: &BenchmarkSettings, result: TrialResult) -> Self {
        Self {
            generated_at: Utc::now(),
            mode: RunMode::Example,
            settings: settings.clone(),
            aggregate: None,
            workers: Vec::new(),
            example: Some(result),
        }
    }

    pub fn benchmark(settings: &BenchmarkSettings, outcome: BenchmarkOutcome) -> Self {
        Self {
            generated_at: Utc::now(),
            mode: RunMode::Benchmark,
            settings: settings.clone(),
            aggregate: Some(outcome.aggregate),
            workers: outcome.workers,
            example: None,
        }
    }
}

/// Writes run reports as pretty JSON, one file per run.
pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create report dir {}", output_dir.display()))?;
        Ok(Self { output_dir })
    }

    pub fn write(&self, report: &RunReport) -> Result<PathBuf> {
        let name = format!(
            "{}_{}.json",
            report.mode.as_str(),
            report.generated_at.format("%Y-%m-%d_%H-%M-%S%.3f")
        );
        let path = self.output_dir.join(name);
        let json = serde_json::to_string_pretty(report)?;
        let mut file =
            File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        file.write_all(json.as_bytes())?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<RunReport> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read report {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }
}
