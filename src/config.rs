use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

fn default_scene() -> PathBuf {
    PathBuf::from("scenes/two_storey.yaml")
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_max_frames() -> u64 {
    1000
}

fn default_num_processes() -> usize {
    1
}

fn default_sensor_height() -> f32 {
    1.5
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    1
}

fn default_physics_config_file() -> PathBuf {
    PathBuf::from("data/default.phys_scene_config.json")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_start_height_threshold() -> f32 {
    0.5
}

fn default_goal_headings() -> Vec<f32> {
    vec![0.0, 90.0]
}

fn default_barrier_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Everything needed to construct a simulator and drive a benchmark run.
///
/// The recognized keys are exactly the fields below; unknown keys are
/// rejected when deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkSettings {
    #[serde(default = "default_scene")]
    pub scene: PathBuf,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_max_frames")]
    pub max_frames: u64,
    #[serde(default = "default_num_processes")]
    pub num_processes: usize,
    #[serde(default)]
    pub default_agent: usize,
    #[serde(default = "default_sensor_height")]
    pub sensor_height: f32,
    #[serde(default = "default_true")]
    pub color_sensor: bool,
    #[serde(default)]
    pub depth_sensor: bool,
    #[serde(default)]
    pub semantic_sensor: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub enable_physics: bool,
    #[serde(default = "default_physics_config_file")]
    pub physics_config_file: PathBuf,
    #[serde(default)]
    pub save_png: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub compute_shortest_path: bool,
    #[serde(default)]
    pub goal_position: Option<[f32; 3]>,
    #[serde(default)]
    pub compute_action_shortest_path: bool,
    /// Final yaw in degrees for each sampled action-path goal.
    #[serde(default = "default_goal_headings")]
    pub goal_headings: Vec<f32>,
    #[serde(default)]
    pub convert_pose: bool,
    #[serde(default)]
    pub print_semantic_scene: bool,
    #[serde(default)]
    pub print_semantic_mask_stats: bool,
    /// Start positions above this height are resampled (ground floor only).
    #[serde(default = "default_start_height_threshold")]
    pub start_height_threshold: f32,
    #[serde(default = "default_barrier_timeout_secs")]
    pub barrier_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            scene: default_scene(),
            width: default_width(),
            height: default_height(),
            max_frames: default_max_frames(),
            num_processes: default_num_processes(),
            default_agent: 0,
            sensor_height: default_sensor_height(),
            color_sensor: true,
            depth_sensor: false,
            semantic_sensor: false,
            seed: default_seed(),
            silent: false,
            enable_physics: false,
            physics_config_file: default_physics_config_file(),
            save_png: false,
            output_dir: default_output_dir(),
            compute_shortest_path: false,
            goal_position: None,
            compute_action_shortest_path: false,
            goal_headings: default_goal_headings(),
            convert_pose: false,
            print_semantic_scene: false,
            print_semantic_mask_stats: false,
            start_height_threshold: default_start_height_threshold(),
            barrier_timeout_secs: default_barrier_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl BenchmarkSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.num_processes == 0 {
            return Err(SettingsError::Validation(
                "num_processes must be at least 1".into(),
            ));
        }
        if self.max_frames == 0 {
            return Err(SettingsError::Validation(
                "max_frames must be at least 1".into(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(SettingsError::Validation(format!(
                "sensor resolution {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if !(self.color_sensor || self.depth_sensor || self.semantic_sensor) {
            return Err(SettingsError::Validation(
                "at least one sensor must be enabled".into(),
            ));
        }
        if !self.start_height_threshold.is_finite() {
            return Err(SettingsError::Validation(
                "start_height_threshold must be finite".into(),
            ));
        }
        if self.compute_shortest_path && self.goal_position.is_none() {
            return Err(SettingsError::Validation(
                "compute_shortest_path requires goal_position".into(),
            ));
        }
        if self.compute_action_shortest_path
            && (self.goal_headings.is_empty() || !self.goal_headings.iter().all(|h| h.is_finite()))
        {
            return Err(SettingsError::Validation(
                "compute_action_shortest_path requires finite goal_headings".into(),
            ));
        }
        if self.print_semantic_mask_stats && !self.semantic_sensor {
            return Err(SettingsError::Validation(
                "print_semantic_mask_stats requires semantic_sensor".into(),
            ));
        }
        if self.barrier_timeout_secs == 0 {
            return Err(SettingsError::Validation(
                "barrier_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn barrier_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.barrier_timeout_secs)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let settings: BenchmarkSettings =
            serde_yaml::from_str(text).context("Failed to parse benchmark settings")?;
        settings.validate()?;
        Ok(settings)
    }
}

pub struct SettingsLoader {
    base_dir: PathBuf,
}

impl SettingsLoader {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Reads a YAML settings file. Validation is left to the caller so that
    /// CLI overrides can be applied first.
    ///
    /// Relative `scene` and `physics_config_file` paths written in the file
    /// are taken relative to the file's own directory. Defaults stay relative
    /// to the working directory.
    pub fn load(&self, file: impl AsRef<Path>) -> Result<BenchmarkSettings> {
        let path = self.base_dir.join(file);
        let data = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let raw: serde_yaml::Value = serde_yaml::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let scene_given = raw.get("scene").is_some();
        let physics_given = raw.get("physics_config_file").is_some();
        let mut settings: BenchmarkSettings = serde_yaml::from_value(raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        if scene_given {
            settings.scene = relative_to(dir, &settings.scene);
        }
        if physics_given {
            settings.physics_config_file = relative_to(dir, &settings.physics_config_file);
        }
        Ok(settings)
    }
}

fn relative_to(dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}
