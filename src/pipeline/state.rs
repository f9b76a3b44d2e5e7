//! Pipeline and stage run state.
//!
//! State is owned by the manager; everything else sees snapshots. Stage
//! transitions only move forward: Pending -> Active -> one of Completed,
//! Failed or Skipped. Progress never decreases after a stage goes Active.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::{ErrorPayload, RunStatus, StageId, StageSummary};

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl From<PipelineStatus> for RunStatus {
    fn from(status: PipelineStatus) -> Self {
        match status {
            PipelineStatus::Pending => RunStatus::Pending,
            PipelineStatus::Running => RunStatus::Running,
            PipelineStatus::Completed => RunStatus::Completed,
            PipelineStatus::Failed => RunStatus::Failed,
            PipelineStatus::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// Status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl From<StageStatus> for RunStatus {
    fn from(status: StageStatus) -> Self {
        match status {
            StageStatus::Pending => RunStatus::Pending,
            StageStatus::Active => RunStatus::Active,
            StageStatus::Completed => RunStatus::Completed,
            StageStatus::Failed => RunStatus::Failed,
            StageStatus::Skipped => RunStatus::Skipped,
        }
    }
}

/// How a run treats existing outputs and partial scrape results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Full run from scratch.
    Initial,
    /// Skip stages whose outputs already exist.
    Incremental,
    /// Continue past a recoverable scraping failure with partial data.
    BestEffort,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Incremental => "incremental",
            Self::BestEffort => "best_effort",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(Self::Initial),
            "incremental" => Some(Self::Incremental),
            "best_effort" => Some(Self::BestEffort),
            _ => None,
        }
    }
}

/// Parameters of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub mode: RunMode,
    /// Inclusive start date, `YYYY-MM-DD`. Required when scraping runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Inclusive end date, `YYYY-MM-DD`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Stages to run, in order.
    pub stages: Vec<StageId>,
    /// Correlation id from the triggering HTTP request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

fn default_headless() -> bool {
    true
}

impl PipelineRequest {
    /// A full four-stage run.
    pub fn full(mode: RunMode, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            mode,
            from: Some(from.into()),
            to: Some(to.into()),
            headless: true,
            stages: StageId::ALL.to_vec(),
            request_id: None,
        }
    }

    /// A single-stage run over existing inputs.
    pub fn single(stage: StageId) -> Self {
        Self {
            mode: RunMode::Initial,
            from: None,
            to: None,
            headless: true,
            stages: vec![stage],
            request_id: None,
        }
    }

    /// Validate the date range when the run includes scraping.
    pub fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err("no stages requested".to_string());
        }
        if !self.stages.contains(&StageId::Scraping) {
            return Ok(());
        }
        let from = parse_date(self.from.as_deref(), "from")?;
        let to = parse_date(self.to.as_deref(), "to")?;
        if from > to {
            return Err(format!("from {} is after to {}", from, to));
        }
        Ok(())
    }
}

fn parse_date(value: Option<&str>, field: &str) -> Result<NaiveDate, String> {
    let raw = value.ok_or_else(|| format!("missing required date '{}'", field))?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("'{}' is not a valid date (expected YYYY-MM-DD): {}", field, raw))
}

/// State of one stage within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub id: StageId,
    pub name: String,
    pub status: StageStatus,
    /// Percent complete, 0 to 100.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl StageState {
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            name: id.display_name().to_string(),
            status: StageStatus::Pending,
            progress: 0.0,
            message: None,
            started_at: None,
            ended_at: None,
            error: None,
            metadata: Map::new(),
        }
    }

    /// Move to Active, resetting progress. Ignored once terminal.
    pub fn activate(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StageStatus::Active;
        self.progress = 0.0;
        self.started_at = Some(Utc::now());
    }

    /// Raise progress; stale or lower values are ignored.
    pub fn set_progress(&mut self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0);
        if percent > self.progress {
            self.progress = percent;
        }
    }

    pub fn complete(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StageStatus::Completed;
        self.progress = 100.0;
        self.ended_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: ErrorPayload) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StageStatus::Failed;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
    }

    /// Mark as not run. For precondition skips the stage counts as done.
    pub fn skip(&mut self, reason: &str, satisfied: bool) {
        if self.status.is_terminal() {
            return;
        }
        self.status = if satisfied {
            StageStatus::Completed
        } else {
            StageStatus::Skipped
        };
        if satisfied {
            self.progress = 100.0;
        }
        self.metadata.insert("skipped".into(), Value::Bool(true));
        self.metadata
            .insert("reason".into(), Value::String(reason.to_string()));
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

/// Full state of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub id: String,
    pub request: PipelineRequest,
    pub status: PipelineStatus,
    pub stages: Vec<StageState>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl PipelineState {
    pub fn new(id: String, request: PipelineRequest) -> Self {
        let stages = request.stages.iter().map(|&s| StageState::new(s)).collect();
        Self {
            id,
            request,
            status: PipelineStatus::Pending,
            stages,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    pub fn stage(&self, id: StageId) -> Option<&StageState> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_mut(&mut self, id: StageId) -> Option<&mut StageState> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    pub fn mark_running(&mut self) {
        self.status = PipelineStatus::Running;
        self.started_at = Utc::now();
    }

    /// Move to a terminal status. The first terminal status wins.
    pub fn finish(&mut self, status: PipelineStatus, error: Option<ErrorPayload>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        match self.ended_at {
            Some(end) => (end - self.started_at).num_milliseconds().max(0) as u64,
            None => (Utc::now() - self.started_at).num_milliseconds().max(0) as u64,
        }
    }

    /// Per-stage summary for the completion event.
    pub fn stage_summaries(&self) -> Vec<StageSummary> {
        self.stages
            .iter()
            .map(|s| StageSummary {
                stage: s.id,
                status: s.status.into(),
                duration_ms: s.duration_ms(),
            })
            .collect()
    }
}

static PIPELINE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Generate a time-prefixed, strictly monotonic pipeline id.
pub fn new_pipeline_id() -> String {
    let seq = PIPELINE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:04}", Utc::now().format("%Y%m%dT%H%M%S"), seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ErrorCode;

    #[test]
    fn test_pipeline_ids_are_unique_and_ordered() {
        let a = new_pipeline_id();
        let b = new_pipeline_id();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_stage_transitions_are_monotonic() {
        let mut stage = StageState::new(StageId::Scraping);
        assert_eq!(stage.status, StageStatus::Pending);

        stage.activate();
        assert_eq!(stage.status, StageStatus::Active);
        assert!(stage.started_at.is_some());

        stage.complete();
        assert_eq!(stage.status, StageStatus::Completed);

        // Terminal states do not revert.
        stage.activate();
        assert_eq!(stage.status, StageStatus::Completed);
        stage.fail(ErrorPayload::from_code(ErrorCode::ParseFailed, "x", None));
        assert_eq!(stage.status, StageStatus::Completed);
        assert!(stage.error.is_none());
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut stage = StageState::new(StageId::Processing);
        stage.activate();
        stage.set_progress(40.0);
        stage.set_progress(25.0);
        assert_eq!(stage.progress, 40.0);
        stage.set_progress(250.0);
        assert_eq!(stage.progress, 100.0);
    }

    #[test]
    fn test_activate_resets_progress() {
        let mut stage = StageState::new(StageId::Processing);
        stage.set_progress(30.0);
        stage.activate();
        assert_eq!(stage.progress, 0.0);
    }

    #[test]
    fn test_skip_with_satisfied_preconditions_counts_as_completed() {
        let mut stage = StageState::new(StageId::Scraping);
        stage.skip("daily reports already downloaded", true);
        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(stage.progress, 100.0);
        assert_eq!(stage.metadata.get("skipped"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_skip_after_failure_is_plain_skip() {
        let mut stage = StageState::new(StageId::Analysis);
        stage.skip("earlier stage failed", false);
        assert_eq!(stage.status, StageStatus::Skipped);
        assert_eq!(stage.progress, 0.0);
    }

    #[test]
    fn test_request_validation() {
        let ok = PipelineRequest::full(RunMode::Initial, "2025-01-01", "2025-01-05");
        assert!(ok.validate().is_ok());

        let reversed = PipelineRequest::full(RunMode::Initial, "2025-02-01", "2025-01-05");
        assert!(reversed.validate().is_err());

        let garbage = PipelineRequest::full(RunMode::Initial, "01/02/2025", "2025-01-05");
        assert!(garbage.validate().is_err());

        let mut missing = PipelineRequest::full(RunMode::Initial, "2025-01-01", "2025-01-05");
        missing.from = None;
        assert!(missing.validate().is_err());

        // Date-less requests are fine when scraping is not involved.
        let process_only = PipelineRequest::single(StageId::Processing);
        assert!(process_only.validate().is_ok());
    }

    #[test]
    fn test_pipeline_finish_is_latched() {
        let req = PipelineRequest::single(StageId::Processing);
        let mut state = PipelineState::new(new_pipeline_id(), req);
        state.mark_running();
        state.finish(PipelineStatus::Cancelled, None);
        state.finish(PipelineStatus::Completed, None);
        assert_eq!(state.status, PipelineStatus::Cancelled);
    }

    #[test]
    fn test_stage_summaries_cover_all_requested_stages() {
        let req = PipelineRequest::full(RunMode::Initial, "2025-01-01", "2025-01-02");
        let state = PipelineState::new(new_pipeline_id(), req);
        let summaries = state.stage_summaries();
        assert_eq!(summaries.len(), 4);
        assert_eq!(summaries[0].stage, StageId::Scraping);
    }
}
