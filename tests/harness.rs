//! Multi-worker benchmark runs on threads and child processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use simbench::harness::{
    AggregateReport, Harness, ProcessPool, ThreadPool, WorkerPool, WorkerReport, TRIALS,
};
use simbench::runner::TrialResult;
use simbench::sim::{
    AgentId, AgentState, KinematicFactory, Observations, Pathfinder, SemanticScene, Simulator,
    SimulatorFactory,
};
use simbench::{BenchmarkSettings, HarnessError, SimError};

const SCENE: &str = r#"
name: hall
cell_size: 0.5
levels:
  - height: 0.0
    map: |
      ##########
      #........#
      #..2.....#
      #........#
      ##########
  - height: 3.0
    map: |
      #####
      #...#
      #####
objects:
  - id: 2
    category: crate
"#;

fn write_scene(dir: &Path) -> PathBuf {
    let path = dir.join("hall.yaml");
    fs::write(&path, SCENE).unwrap();
    path
}

fn settings(scene: PathBuf, workers: usize) -> BenchmarkSettings {
    BenchmarkSettings {
        scene,
        width: 16,
        height: 12,
        max_frames: 8,
        num_processes: workers,
        silent: true,
        barrier_timeout_secs: 30,
        ..BenchmarkSettings::default()
    }
}

/// Delegates to the kinematic backend but refuses to build one worker.
struct RefusingFactory {
    refuse: usize,
}

impl SimulatorFactory for RefusingFactory {
    fn create(
        &self,
        settings: &BenchmarkSettings,
        worker: usize,
    ) -> Result<Box<dyn Simulator>, SimError> {
        if worker == self.refuse {
            return Err(SimError::SceneLoad {
                path: settings.scene.clone(),
                message: "refused".to_string(),
            });
        }
        KinematicFactory::new().create(settings, worker)
    }
}

/// Kinematic simulator that errors once it has taken `fail_at` steps.
struct StumblingSim {
    inner: Box<dyn Simulator>,
    steps: u64,
    fail_at: u64,
}

impl Simulator for StumblingSim {
    fn action_names(&self, agent: AgentId) -> Result<Vec<String>, SimError> {
        self.inner.action_names(agent)
    }

    fn initialize_agent(&mut self, agent: AgentId) -> Result<AgentState, SimError> {
        self.inner.initialize_agent(agent)
    }

    fn agent_state(&self, agent: AgentId) -> Result<AgentState, SimError> {
        self.inner.agent_state(agent)
    }

    fn set_agent_state(&mut self, agent: AgentId, state: AgentState) -> Result<(), SimError> {
        self.inner.set_agent_state(agent, state)
    }

    fn step(&mut self, action: &str) -> Result<Observations, SimError> {
        if self.steps == self.fail_at {
            return Err(SimError::UnknownAction(format!("{action} at step {}", self.steps)));
        }
        self.steps += 1;
        self.inner.step(action)
    }

    fn last_state(&self) -> AgentState {
        self.inner.last_state()
    }

    fn pathfinder(&mut self) -> &mut dyn Pathfinder {
        self.inner.pathfinder()
    }

    fn semantic_scene(&self) -> &SemanticScene {
        self.inner.semantic_scene()
    }

    fn seed(&mut self, seed: u64) {
        self.inner.seed(seed)
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

/// One worker's simulator fails partway through its stepping.
struct StumblingFactory {
    worker: usize,
    fail_at: u64,
}

impl SimulatorFactory for StumblingFactory {
    fn create(
        &self,
        settings: &BenchmarkSettings,
        worker: usize,
    ) -> Result<Box<dyn Simulator>, SimError> {
        let inner = KinematicFactory::new().create(settings, worker)?;
        if worker != self.worker {
            return Ok(inner);
        }
        Ok(Box::new(StumblingSim {
            inner,
            steps: 0,
            fail_at: self.fail_at,
        }))
    }
}

#[test]
fn thread_pool_runs_every_worker_through_all_trials() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(write_scene(dir.path()), 4);
    let outcome = Harness::new(ThreadPool::new(KinematicFactory::new()))
        .benchmark(&settings)
        .unwrap();

    assert_eq!(outcome.workers.len(), 4);
    for (index, report) in outcome.workers.iter().enumerate() {
        assert_eq!(report.worker, index);
        assert_eq!(report.trial_frame_times.len(), TRIALS);
        assert_eq!(report.best.frames, 8);
        let min = report
            .trial_frame_times
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        assert_eq!(report.best.frame_time, min);
    }
    assert_eq!(outcome.aggregate.workers, 4);
    let fps: f64 = outcome.workers.iter().map(|r| r.best.fps).sum();
    assert!((outcome.aggregate.fps - fps).abs() < 1e-9 * fps);
}

#[test]
fn failed_construction_fails_the_whole_run() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(write_scene(dir.path()), 3);
    let factory = RefusingFactory { refuse: 1 };
    match Harness::new(ThreadPool::new(factory)).benchmark(&settings) {
        Err(HarnessError::WorkerFailed { index, message }) => {
            assert_eq!(index, 1);
            assert!(message.contains("refused"));
        }
        other => panic!("expected worker failure, got {other:?}"),
    }
}

#[test]
fn invalid_settings_never_reach_the_pool() {
    let settings = BenchmarkSettings {
        num_processes: 0,
        ..BenchmarkSettings::default()
    };
    let factory = RefusingFactory { refuse: usize::MAX };
    let harness = Harness::new(ThreadPool::new(factory));
    assert!(matches!(
        harness.benchmark(&settings),
        Err(HarnessError::Settings(_))
    ));
}

#[test]
fn stepping_failure_tears_down_threads_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(write_scene(dir.path()), 3);
    // Frame 4 of the second trial.
    let factory = StumblingFactory {
        worker: 1,
        fail_at: settings.max_frames + 4,
    };
    let started = Instant::now();
    match Harness::new(ThreadPool::new(factory)).benchmark(&settings) {
        Err(HarnessError::WorkerFailed { index, message }) => {
            assert_eq!(index, 1);
            assert!(message.contains("at step 12"), "{message}");
        }
        other => panic!("expected worker failure, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn pools_reject_invalid_settings_when_called_directly() {
    let settings = BenchmarkSettings {
        num_processes: 0,
        ..BenchmarkSettings::default()
    };
    let threads = ThreadPool::new(KinematicFactory::new());
    assert!(matches!(threads.run(&settings), Err(HarnessError::Settings(_))));
    let processes = ProcessPool::new(env!("CARGO_BIN_EXE_simbench"), vec!["worker".to_string()]);
    assert!(matches!(processes.run(&settings), Err(HarnessError::Settings(_))));
}

#[test]
fn aggregate_of_identical_workers_scales_with_worker_count() {
    let f = 0.004;
    let t = 1.5;
    for workers in 1..=8 {
        let reports: Vec<WorkerReport> = (0..workers)
            .map(|worker| {
                let trial = TrialResult {
                    frames: 100,
                    total_time: t,
                    frame_time: f,
                    fps: 1.0 / f,
                    per_step_times: Vec::new(),
                };
                WorkerReport::from_trials(worker, vec![trial.clone(), trial.clone(), trial]).unwrap()
            })
            .collect();
        let aggregate = AggregateReport::from_workers(&reports).unwrap();
        let p = workers as f64;
        assert!((aggregate.frame_time - p * f).abs() < 1e-12);
        assert!((aggregate.fps - p / f).abs() < 1e-9);
        assert!((aggregate.total_time - t).abs() < 1e-12);
    }
}

#[test]
fn process_pool_runs_workers_as_child_processes() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(write_scene(dir.path()), 2);
    let pool = ProcessPool::new(env!("CARGO_BIN_EXE_simbench"), vec!["worker".to_string()]);
    let outcome = Harness::new(pool).benchmark(&settings).unwrap();

    assert_eq!(outcome.workers.len(), 2);
    assert_eq!(outcome.workers[0].worker, 0);
    assert_eq!(outcome.workers[1].worker, 1);
    for report in &outcome.workers {
        assert_eq!(report.trial_frame_times.len(), TRIALS);
        assert_eq!(report.best.per_step_times.len(), 8);
    }
}

#[test]
fn process_pool_reports_worker_failure() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path().join("missing.yaml"), 2);
    let pool = ProcessPool::new(env!("CARGO_BIN_EXE_simbench"), vec!["worker".to_string()]);
    match Harness::new(pool).benchmark(&settings) {
        Err(HarnessError::WorkerFailed { message, .. }) => {
            assert!(message.contains("missing.yaml"), "{message}");
        }
        other => panic!("expected worker failure, got {other:?}"),
    }
}

/// Plays the worker side of the protocol: worker 1 fails after the second
/// release, worker 0 keeps waiting at the third rendezvous.
#[cfg(unix)]
const FAILING_WORKER: &str = r#"
read -r start
case "$start" in *'"worker":0,'*) w=0 ;; *) w=1 ;; esac
g=0
while :; do
  if [ "$w" = 1 ] && [ "$g" = 2 ]; then
    echo '{"kind":"failed","message":"step failed in trial 1"}'
    exit 1
  fi
  echo "{\"kind\":\"arrive\",\"generation\":$g}"
  read -r release || exit 0
  if [ "$w" = 0 ]; then echo '{"kind":"reset"}'; fi
  g=$((g+1))
done
"#;

#[cfg(unix)]
#[test]
fn process_pool_tears_down_on_mid_run_failure() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(write_scene(dir.path()), 2);
    let pool = ProcessPool::new("sh", vec!["-c".to_string(), FAILING_WORKER.to_string()]);
    let started = Instant::now();
    match Harness::new(pool).benchmark(&settings) {
        Err(HarnessError::WorkerFailed { index, message }) => {
            assert_eq!(index, 1);
            assert!(message.contains("trial 1"), "{message}");
        }
        other => panic!("expected worker failure, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
}
