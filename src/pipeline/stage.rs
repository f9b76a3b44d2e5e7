//! Launch specifications and skip preconditions for the four stages.
//!
//! Stages differ only in executable, argument vector, deadline and the
//! outputs that let an incremental run skip them; one runner drives all of
//! them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Settings;
use crate::events::StageId;
use crate::pipeline::state::PipelineRequest;

/// Exit code conventions for stage binaries.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INPUT_NOT_FOUND: i32 = 2;

/// Everything needed to launch one external stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: StageId,
    /// Executable path; relative paths resolve under the working directory.
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub deadline: Duration,
}

fn default_executable(stage: StageId) -> &'static str {
    match stage {
        StageId::Scraping => "isx-scraper",
        StageId::Processing => "isx-process",
        StageId::Indices => "isx-indexcsv",
        StageId::Analysis => "isx-analyze",
    }
}

fn default_deadline(stage: StageId) -> Duration {
    match stage {
        StageId::Scraping => Duration::from_secs(30 * 60),
        StageId::Processing => Duration::from_secs(15 * 60),
        StageId::Indices => Duration::from_secs(5 * 60),
        StageId::Analysis => Duration::from_secs(5 * 60),
    }
}

impl StageSpec {
    /// Build the launch spec for a stage from settings and the run request.
    pub fn build(stage: StageId, settings: &Settings, request: &PipelineRequest) -> Self {
        let executable = settings
            .stage_executable(stage)
            .unwrap_or_else(|| PathBuf::from(default_executable(stage)));
        let deadline = settings
            .stage_deadline(stage)
            .unwrap_or_else(|| default_deadline(stage));

        let downloads = settings.downloads_dir();
        let reports = settings.reports_dir();
        let mut args = Vec::new();
        match stage {
            StageId::Scraping => {
                if let Some(from) = &request.from {
                    args.push("--from".to_string());
                    args.push(from.clone());
                }
                if let Some(to) = &request.to {
                    args.push("--to".to_string());
                    args.push(to.clone());
                }
                args.push("--out".to_string());
                args.push(downloads.display().to_string());
                if request.headless {
                    args.push("--headless".to_string());
                }
            }
            StageId::Processing => {
                args.push("--in".to_string());
                args.push(downloads.display().to_string());
                args.push("--out".to_string());
                args.push(reports.display().to_string());
            }
            StageId::Indices => {
                args.push("--in".to_string());
                args.push(downloads.display().to_string());
                args.push("--out".to_string());
                args.push(reports.join("indexes.csv").display().to_string());
            }
            StageId::Analysis => {
                args.push("--in".to_string());
                args.push(reports.display().to_string());
                args.push("--out".to_string());
                args.push(reports.display().to_string());
            }
        }

        Self {
            id: stage,
            executable,
            args,
            deadline,
        }
    }
}

/// If the stage's outputs already exist, the reason it can be skipped.
///
/// Only consulted for incremental runs. Analysis always re-runs: it is
/// cheap and derives entirely from the other outputs.
pub fn skip_reason(stage: StageId, settings: &Settings) -> Option<String> {
    match stage {
        StageId::Scraping => {
            if dir_has_prefix(&settings.downloads_dir(), "isx_daily_") {
                Some("daily reports already downloaded".to_string())
            } else {
                None
            }
        }
        StageId::Processing => {
            if settings.reports_dir().join("isx_combined_data.csv").exists() {
                Some("combined data already generated".to_string())
            } else {
                None
            }
        }
        StageId::Indices => {
            if settings.reports_dir().join("indexes.csv").exists() {
                Some("index file already generated".to_string())
            } else {
                None
            }
        }
        StageId::Analysis => None,
    }
}

fn dir_has_prefix(dir: &Path, prefix: &str) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(prefix)
        {
            return true;
        }
    }
    false
}
