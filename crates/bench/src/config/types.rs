use encbench_buffer_encoder::{Resolution, SessionConfig};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    pub meta: MetaConfig,
    #[serde(default)]
    pub run: RunConfig,
    /// Raw source to generate before any test runs.
    #[serde(default)]
    pub pattern: Option<PatternConfig>,
    #[serde(rename = "test", default)]
    pub tests: Vec<SessionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: u64,
    #[serde(default)]
    pub max_consecutive_rejections: Option<u32>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("encbench-output")
}

fn default_start_timeout() -> u64 {
    5000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            parallel: false,
            output_dir: default_output_dir(),
            start_timeout_ms: default_start_timeout(),
            max_consecutive_rejections: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub path: PathBuf,
    pub resolution: Resolution,
    #[serde(default = "default_pattern_frames")]
    pub frames: u32,
}

fn default_pattern_frames() -> u32 {
    60
}

/// Which family of devices the tests are run against.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process device, no codec libraries needed.
    #[default]
    Synthetic,
    /// libavcodec encoders written into mp4 files.
    Ffmpeg,
}

impl BackendKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::Synthetic => "synthetic",
            BackendKind::Ffmpeg => "ffmpeg",
        }
    }
}

impl TestConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.run.start_timeout_ms)
    }
}
