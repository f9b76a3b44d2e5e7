//! Configuration for the orchestrator: directories, server bind address,
//! stage executables and deadlines.
//!
//! Settings come from an optional `isxflow.toml`, overridden by environment
//! variables (`ISX_DATA_DIR`, `ISX_EXECUTABLE_ROOT`, `ISX_BIND`) and the
//! `--data-dir` CLI flag.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::events::StageId;
use crate::hub::DEFAULT_SUBSCRIBER_BUFFER;

/// Grace window between soft and hard termination of a stage process.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_hub_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}

fn default_watch_debounce_ms() -> u64 {
    100
}

/// Per-stage overrides from the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOverride {
    /// Executable name or path; relative paths resolve under the executable root.
    pub executable: Option<PathBuf>,
    pub deadline_secs: Option<u64>,
}

/// Application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root for downloads, generated reports and metrics.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Working directory for stage binaries.
    #[serde(default)]
    pub executable_root: Option<PathBuf>,

    /// HTTP bind address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Per-subscriber event queue capacity.
    #[serde(default = "default_hub_buffer")]
    pub hub_buffer: usize,

    /// Coalescing window for filesystem events.
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,

    /// Per-stage configuration, keyed by stage id.
    #[serde(default)]
    pub stages: HashMap<String, StageOverride>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            executable_root: None,
            bind: default_bind(),
            hub_buffer: default_hub_buffer(),
            watch_debounce_ms: default_watch_debounce_ms(),
            stages: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings: config file (if present), then environment overrides,
    /// then an explicit `--data-dir` flag.
    pub fn load(config_path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut settings = match config_path {
            Some(path) => Self::from_file(path)?,
            None => match Self::find_config_file() {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        if let Ok(dir) = std::env::var("ISX_DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Ok(root) = std::env::var("ISX_EXECUTABLE_ROOT") {
            settings.executable_root = Some(PathBuf::from(root));
        }
        if let Ok(bind) = std::env::var("ISX_BIND") {
            settings.bind = bind;
        }
        if let Some(dir) = data_dir {
            settings.data_dir = dir;
        }
        Ok(settings)
    }

    /// Working directory first, then the user config directory.
    fn find_config_file() -> Option<PathBuf> {
        let local = Path::new("isxflow.toml");
        if local.exists() {
            return Some(local.to_path_buf());
        }
        dirs::config_dir()
            .map(|dir| dir.join("isxflow").join("isxflow.toml"))
            .filter(|path| path.exists())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Where stage binaries run from; relative stage arguments resolve here.
    pub fn executable_root(&self) -> PathBuf {
        self.executable_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("bin"))
    }

    /// Raw daily report downloads.
    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    /// Generated CSV/JSON outputs; also the file watcher root.
    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.data_dir.join("metrics")
    }

    /// Configured executable for a stage, if overridden.
    pub fn stage_executable(&self, stage: StageId) -> Option<PathBuf> {
        self.stages
            .get(stage.as_str())
            .and_then(|s| s.executable.clone())
    }

    /// Configured deadline for a stage, if overridden.
    pub fn stage_deadline(&self, stage: StageId) -> Option<Duration> {
        self.stages
            .get(stage.as_str())
            .and_then(|s| s.deadline_secs)
            .map(Duration::from_secs)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}
