//! Step loop behavior against scripted simulators.

use std::cell::Cell;
use std::fs;
use std::rc::Rc;

use anyhow::Result;
use glam::{Quat, Vec3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use simbench::runner::{
    init_agent_state, FrameContext, FrameObserver, StepLoopBuilder, START_SAMPLE_LIMIT,
};
use simbench::sim::{
    AgentId, AgentState, Observations, Pathfinder, SemanticScene, ShortestPath, Simulator,
};
use simbench::{run_example, BenchmarkSettings, SimError};

/// Navigable points all sit at a fixed height; counts how often it is asked.
struct CountingPathfinder {
    height: f32,
    samples: usize,
}

impl Pathfinder for CountingPathfinder {
    fn random_navigable_point(&mut self) -> Vec3 {
        self.samples += 1;
        Vec3::new(self.samples as f32, self.height, 0.0)
    }

    fn find_path(&self, _path: &mut ShortestPath) -> bool {
        false
    }

    fn is_navigable(&self, _point: Vec3) -> bool {
        true
    }
}

/// Steps instantly and records every action it receives.
struct ScriptedSim {
    start: Vec3,
    state: AgentState,
    pathfinder: CountingPathfinder,
    scene: SemanticScene,
    actions: Vec<String>,
    fail_at: Option<usize>,
}

impl ScriptedSim {
    fn new(start: Vec3, point_height: f32) -> Self {
        Self {
            start,
            state: AgentState::default(),
            pathfinder: CountingPathfinder {
                height: point_height,
                samples: 0,
            },
            scene: SemanticScene::default(),
            actions: Vec::new(),
            fail_at: None,
        }
    }
}

impl Simulator for ScriptedSim {
    fn action_names(&self, _agent: AgentId) -> Result<Vec<String>, SimError> {
        Ok(vec!["move_forward".to_string(), "turn_left".to_string()])
    }

    fn initialize_agent(&mut self, _agent: AgentId) -> Result<AgentState, SimError> {
        self.state = AgentState {
            position: self.start,
            rotation: Quat::IDENTITY,
        };
        Ok(self.state)
    }

    fn agent_state(&self, _agent: AgentId) -> Result<AgentState, SimError> {
        Ok(self.state)
    }

    fn set_agent_state(&mut self, _agent: AgentId, state: AgentState) -> Result<(), SimError> {
        self.state = state;
        Ok(())
    }

    fn step(&mut self, action: &str) -> Result<Observations, SimError> {
        if self.fail_at == Some(self.actions.len()) {
            return Err(SimError::Closed);
        }
        self.actions.push(action.to_string());
        Ok(Observations::default())
    }

    fn last_state(&self) -> AgentState {
        self.state
    }

    fn pathfinder(&mut self) -> &mut dyn Pathfinder {
        &mut self.pathfinder
    }

    fn semantic_scene(&self) -> &SemanticScene {
        &self.scene
    }

    fn seed(&mut self, _seed: u64) {}

    fn close(&mut self) {}
}

struct FrameCounter {
    frames: Rc<Cell<u64>>,
}

impl FrameObserver for FrameCounter {
    fn name(&self) -> &str {
        "frame_counter"
    }

    fn observe(&mut self, ctx: &FrameContext<'_>, _sim: &mut dyn Simulator) -> Result<()> {
        assert_eq!(ctx.frame, self.frames.get());
        self.frames.set(self.frames.get() + 1);
        Ok(())
    }
}

fn settings(max_frames: u64) -> BenchmarkSettings {
    BenchmarkSettings {
        max_frames,
        silent: true,
        ..BenchmarkSettings::default()
    }
}

#[test]
fn start_below_threshold_is_kept_without_sampling() {
    let mut sim = ScriptedSim::new(Vec3::new(1.0, 0.1, 2.0), 5.0);
    let placement = init_agent_state(&mut sim, 0, 0.5).unwrap();
    assert_eq!(placement.samples, 0);
    assert!(placement.accepted);
    assert_eq!(placement.state.position, Vec3::new(1.0, 0.1, 2.0));
    assert_eq!(sim.pathfinder.samples, 0);
}

#[test]
fn sampling_gives_up_after_the_limit_and_keeps_the_last_point() {
    let mut sim = ScriptedSim::new(Vec3::new(0.0, 3.0, 0.0), 1.0);
    let placement = init_agent_state(&mut sim, 0, 0.5).unwrap();
    assert_eq!(placement.samples, START_SAMPLE_LIMIT);
    assert_eq!(sim.pathfinder.samples, 100);
    assert!(!placement.accepted);
    assert_eq!(placement.state.position, Vec3::new(100.0, 1.0, 0.0));
    assert_eq!(sim.state, placement.state);
}

#[test]
fn sampling_stops_at_first_point_on_the_ground_floor() {
    let mut sim = ScriptedSim::new(Vec3::new(0.0, 3.0, 0.0), 0.0);
    let placement = init_agent_state(&mut sim, 0, 0.5).unwrap();
    assert_eq!(placement.samples, 1);
    assert!(placement.accepted);
}

#[test]
fn trial_repeats_one_action_for_every_frame() {
    let mut sim = ScriptedSim::new(Vec3::ZERO, 0.0);
    let frames = Rc::new(Cell::new(0));
    let mut step_loop = StepLoopBuilder::new(&settings(25))
        .with_observer(FrameCounter {
            frames: frames.clone(),
        })
        .build();
    assert_eq!(step_loop.observer_names(), vec!["frame_counter"]);

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let result = step_loop.run_trial(&mut sim, &mut rng).unwrap();

    assert_eq!(result.frames, 25);
    assert_eq!(result.per_step_times.len(), 25);
    assert_eq!(frames.get(), 25);
    assert_eq!(sim.actions.len(), 25);
    assert!(sim.actions.iter().all(|action| action == &sim.actions[0]));
    assert!(result.frame_time > 0.0);
    assert_eq!(result.fps, 1.0 / result.frame_time);
}

#[test]
fn single_frame_trial_is_well_defined() {
    let mut sim = ScriptedSim::new(Vec3::ZERO, 0.0);
    let mut step_loop = StepLoopBuilder::new(&settings(1)).build();
    let result = step_loop
        .run_trial(&mut sim, &mut ChaCha8Rng::seed_from_u64(1))
        .unwrap();
    assert_eq!(result.frames, 1);
    assert!(result.frame_time > 0.0);
    assert!(result.fps.is_finite());
}

#[test]
fn step_failure_aborts_the_trial() {
    let mut sim = ScriptedSim::new(Vec3::ZERO, 0.0);
    sim.fail_at = Some(3);
    let mut step_loop = StepLoopBuilder::new(&settings(10)).build();
    let err = step_loop
        .run_trial(&mut sim, &mut ChaCha8Rng::seed_from_u64(1))
        .unwrap_err();
    assert!(err.downcast_ref::<SimError>().is_some());
    assert_eq!(sim.actions.len(), 3);
}

#[test]
fn huge_frame_budget_does_not_preallocate() {
    let mut sim = ScriptedSim::new(Vec3::ZERO, 0.0);
    sim.fail_at = Some(2);
    let mut step_loop = StepLoopBuilder::new(&settings(u64::MAX)).build();
    let err = step_loop
        .run_trial(&mut sim, &mut ChaCha8Rng::seed_from_u64(3))
        .unwrap_err();
    assert!(err.downcast_ref::<SimError>().is_some());
    assert_eq!(sim.actions.len(), 2);
}

#[test]
fn example_runs_end_to_end_on_a_scene_file() {
    let dir = tempfile::tempdir().unwrap();
    let scene = dir.path().join("room.yaml");
    fs::write(
        &scene,
        r#"
name: room
cell_size: 0.5
levels:
  - height: 0.0
    map: |
      ########
      #......#
      #..2...#
      #......#
      ########
objects:
  - id: 2
    category: chair
"#,
    )
    .unwrap();

    let settings = BenchmarkSettings {
        scene,
        width: 32,
        height: 24,
        max_frames: 20,
        depth_sensor: true,
        semantic_sensor: true,
        print_semantic_scene: true,
        print_semantic_mask_stats: true,
        convert_pose: true,
        compute_shortest_path: true,
        goal_position: Some([1.0, 0.0, 1.0]),
        compute_action_shortest_path: true,
        save_png: true,
        output_dir: dir.path().join("frames"),
        silent: true,
        ..BenchmarkSettings::default()
    };
    let result = run_example(&simbench::sim::KinematicFactory::new(), &settings).unwrap();
    assert_eq!(result.frames, 20);
    assert!(result.fps > 0.0);

    let frames = dir.path().join("frames");
    for name in ["test.rgba.00000.png", "test.depth.00019.png", "test.sem.00010.png"] {
        assert!(frames.join(name).exists(), "{name} missing");
    }
}

#[test]
fn example_rejects_invalid_settings() {
    let settings = BenchmarkSettings {
        max_frames: 0,
        ..BenchmarkSettings::default()
    };
    assert!(run_example(&simbench::sim::KinematicFactory::new(), &settings).is_err());
}
