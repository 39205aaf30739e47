use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use simbench::{
    harness::{
        process::{read_start, run_worker_process},
        Harness, ProcessPool, ThreadPool,
    },
    report::{aggregate_banner, check_fps, performance_banner, ReportWriter, RunReport},
    run_example,
    sim::KinematicFactory,
    BenchmarkSettings, SettingsLoader,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Simulator stepping throughput benchmark")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one simulator for a single timed trial
    Example(RunArgs),
    /// Run the multi-worker benchmark (best of three trials per worker)
    Benchmark {
        #[command(flatten)]
        run: RunArgs,

        /// Run workers as threads of this process instead of child processes
        #[arg(long)]
        threads: bool,
    },
    /// Worker process body, driven by the benchmark coordinator over stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Settings YAML file; flags below override its values
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Scene description YAML
    #[arg(long)]
    scene: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Frames per trial
    #[arg(long)]
    max_frames: Option<u64>,

    /// Number of benchmark workers
    #[arg(long)]
    num_processes: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    save_png: bool,

    #[arg(long)]
    disable_color_sensor: bool,

    #[arg(long)]
    depth_sensor: bool,

    #[arg(long)]
    semantic_sensor: bool,

    /// Drop per-frame logs to trace level
    #[arg(long)]
    silent: bool,

    #[arg(long)]
    enable_physics: bool,

    #[arg(long)]
    physics_config_file: Option<PathBuf>,

    #[arg(long)]
    compute_shortest_path: bool,

    /// Goal for shortest path queries as X Y Z
    #[arg(long, num_args = 3, allow_negative_numbers = true, value_names = ["X", "Y", "Z"])]
    goal: Option<Vec<f32>>,

    /// Plan the action sequence to sampled goals each frame
    #[arg(long)]
    compute_action_shortest_path: bool,

    /// Final yaw in degrees of each sampled action-path goal
    #[arg(long, num_args = 1.., allow_negative_numbers = true)]
    goal_headings: Option<Vec<f32>>,

    /// Log each frame's pose in the replica frame
    #[arg(long)]
    convert_pose: bool,

    #[arg(long)]
    print_semantic_scene: bool,

    #[arg(long)]
    print_semantic_mask_stats: bool,

    /// Directory for saved observation images
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Write a JSON run report into this directory
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Fail when the reported FPS is below this threshold
    #[arg(long)]
    min_fps: Option<f64>,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

impl RunArgs {
    fn settings(&self) -> Result<BenchmarkSettings> {
        let mut settings = match &self.settings {
            Some(path) => SettingsLoader::new(".").load(path)?,
            None => BenchmarkSettings::default(),
        };

        if let Some(scene) = &self.scene {
            settings.scene = scene.clone();
        }
        if let Some(width) = self.width {
            settings.width = width;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if let Some(max_frames) = self.max_frames {
            settings.max_frames = max_frames;
        }
        if let Some(num_processes) = self.num_processes {
            settings.num_processes = num_processes;
        }
        if let Some(seed) = self.seed {
            settings.seed = seed;
        }
        if let Some(path) = &self.physics_config_file {
            settings.physics_config_file = path.clone();
        }
        if let Some(dir) = &self.output_dir {
            settings.output_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            settings.log_level = level.clone();
        }
        if let Some(headings) = &self.goal_headings {
            settings.goal_headings = headings.clone();
        }
        if let Some(goal) = &self.goal {
            if let [x, y, z] = goal[..] {
                settings.goal_position = Some([x, y, z]);
            }
        }

        // Flags can only switch features on; the file may already have.
        settings.save_png |= self.save_png;
        settings.color_sensor &= !self.disable_color_sensor;
        settings.depth_sensor |= self.depth_sensor;
        settings.semantic_sensor |= self.semantic_sensor;
        settings.silent |= self.silent;
        settings.enable_physics |= self.enable_physics;
        settings.compute_shortest_path |= self.compute_shortest_path;
        settings.compute_action_shortest_path |= self.compute_action_shortest_path;
        settings.convert_pose |= self.convert_pose;
        settings.print_semantic_scene |= self.print_semantic_scene;
        settings.print_semantic_mask_stats |= self.print_semantic_mask_stats;

        settings.validate()?;
        Ok(settings)
    }

    fn write_report(&self, report: &RunReport) -> Result<()> {
        if let Some(dir) = &self.report_dir {
            let path = ReportWriter::new(dir)?.write(report)?;
            info!("report written to {}", path.display());
        }
        Ok(())
    }
}

fn init_logging(default_filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn example(args: RunArgs) -> Result<()> {
    let settings = args.settings()?;
    init_logging(&settings.log_level);

    let result = run_example(&KinematicFactory::new(), &settings)?;
    println!("{}", performance_banner(settings.width, settings.height, &result));

    let fps = result.fps;
    args.write_report(&RunReport::example(&settings, result))?;
    check_fps(fps, args.min_fps)
}

fn benchmark(args: RunArgs, threads: bool) -> Result<()> {
    let settings = args.settings()?;
    init_logging(&settings.log_level);

    let outcome = if threads {
        Harness::new(ThreadPool::new(KinematicFactory::new())).benchmark(&settings)?
    } else {
        let pool = ProcessPool::current_exe().context("Failed to locate the worker executable")?;
        Harness::new(pool).benchmark(&settings)?
    };

    for report in &outcome.workers {
        info!(
            "worker {}: best frame time {:.3} ms ({:.1} FPS), trials {:?}",
            report.worker,
            report.best.frame_time * 1000.0,
            report.best.fps,
            report.trial_frame_times
        );
    }
    println!(
        "{}",
        aggregate_banner(settings.width, settings.height, &outcome.aggregate)
    );

    let fps = outcome.aggregate.fps;
    args.write_report(&RunReport::benchmark(&settings, outcome))?;
    check_fps(fps, args.min_fps)
}

fn worker() -> Result<()> {
    let mut stdin = io::stdin().lock();
    let (index, settings) = read_start(&mut stdin)?;
    init_logging(&settings.log_level);
    let stdout = io::stdout();
    run_worker_process(&KinematicFactory::new(), index, &settings, stdin, stdout.lock())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Example(args) => example(args),
        Command::Benchmark { run, threads } => benchmark(run, threads),
        Command::Worker => worker(),
    }
}
