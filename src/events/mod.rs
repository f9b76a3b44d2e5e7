//! Wire-level event contracts for the dashboard protocol.
//!
//! Every frame sent to a connected client is a single JSON envelope with a
//! stable `type` tag, an RFC3339 server timestamp, and a type-specific
//! `data` payload. These identifiers are protocol-visible; renaming any of
//! them is a breaking change for deployed frontends.

mod codes;

pub use codes::ErrorCode;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Scraping,
    Processing,
    Indices,
    Analysis,
}

impl StageId {
    /// All stages in execution order.
    pub const ALL: [StageId; 4] = [
        StageId::Scraping,
        StageId::Processing,
        StageId::Indices,
        StageId::Analysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scraping => "scraping",
            Self::Processing => "processing",
            Self::Indices => "indices",
            Self::Analysis => "analysis",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "scraping" => Some(Self::Scraping),
            "processing" => Some(Self::Processing),
            "indices" => Some(Self::Indices),
            "analysis" => Some(Self::Analysis),
            _ => None,
        }
    }

    /// Human-readable stage name shown in the dashboard.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Scraping => "Data Scraping",
            Self::Processing => "Data Processing",
            Self::Indices => "Index Extraction",
            Self::Analysis => "Ticker Analysis",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an `output` or `log` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl OutputLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// What happened to a data artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataAction {
    Created,
    Updated,
    Deleted,
    Refresh,
}

impl DataAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Refresh => "refresh",
        }
    }
}

/// Recognized artifact categories for `data_update` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    TickerSummary,
    CombinedData,
    Indexes,
    DailyReport,
    TickerHistory,
    /// Whole-dataset refresh after a completed run.
    All,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TickerSummary => "ticker_summary",
            Self::CombinedData => "combined_data",
            Self::Indexes => "indexes",
            Self::DailyReport => "daily_report",
            Self::TickerHistory => "ticker_history",
            Self::All => "all",
        }
    }
}

/// Status values carried by `pipeline:status` events.
///
/// Covers both pipeline-level statuses (`running`, `completed`, ...) and
/// stage-level statuses (`active`, `skipped`); the optional `stage` field of
/// the payload tells the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Active,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Whether this status ends a run or stage.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

/// WebSocket connection lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Payload of a `connection` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPayload {
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Payload of an `output` event: one line of stage or server output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub level: OutputLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
}

/// Payload of a `data_update` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUpdatePayload {
    pub subtype: DataKind,
    pub action: DataAction,
    pub payload: Value,
}

/// Payload of a `pipeline:status` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatusPayload {
    pub pipeline_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Payload of a `pipeline:progress` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineProgressPayload {
    pub pipeline_id: String,
    pub stage: StageId,
    /// Percent complete, 0 to 100.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
}

/// Payload of a `pipeline:reset` event, published when a new run begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResetPayload {
    pub pipeline_id: String,
}

/// Per-stage entry in a `pipeline:complete` summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: StageId,
    pub status: RunStatus,
    pub duration_ms: u64,
}

/// Payload of a `pipeline:complete` event, published after the terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCompletePayload {
    pub pipeline_id: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub stages: Vec<StageSummary>,
}

/// Payload of an `error` event.
///
/// `recoverable` is authoritative: clients decide whether to offer a retry
/// from the boolean, never from the message text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: String,
    pub title: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ErrorPayload {
    /// Build a payload from a taxonomy code, filling title, hint and
    /// recoverability from the static tables.
    pub fn from_code(code: ErrorCode, detail: impl Into<String>, stage: Option<StageId>) -> Self {
        Self {
            error_code: code.as_str().to_string(),
            title: code.title().to_string(),
            detail: detail.into(),
            stage,
            recoverable: code.recoverable(),
            hint: Some(code.hint().to_string()),
            metadata: None,
        }
    }
}

/// Payload of a `log` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: OutputLevel,
    pub message: String,
    pub source: String,
}

/// Tagged union of every event shape, keyed by the wire `type` string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    Connection(ConnectionPayload),
    Output(OutputPayload),
    DataUpdate(DataUpdatePayload),
    #[serde(rename = "pipeline:status")]
    PipelineStatus(PipelineStatusPayload),
    #[serde(rename = "pipeline:progress")]
    PipelineProgress(PipelineProgressPayload),
    #[serde(rename = "pipeline:reset")]
    PipelineReset(PipelineResetPayload),
    #[serde(rename = "pipeline:complete")]
    PipelineComplete(PipelineCompletePayload),
    Error(ErrorPayload),
    Log(LogPayload),
}

impl EventKind {
    /// The wire `type` string for this event.
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Output(_) => "output",
            Self::DataUpdate(_) => "data_update",
            Self::PipelineStatus(_) => "pipeline:status",
            Self::PipelineProgress(_) => "pipeline:progress",
            Self::PipelineReset(_) => "pipeline:reset",
            Self::PipelineComplete(_) => "pipeline:complete",
            Self::Error(_) => "error",
            Self::Log(_) => "log",
        }
    }
}

/// A complete event envelope as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Event {
    /// Wrap an event kind with the current server timestamp.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    /// Attach a request id for correlation with the triggering HTTP call.
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn connection(status: ConnectionStatus, client_id: Option<String>) -> Self {
        Self::new(EventKind::Connection(ConnectionPayload { status, client_id }))
    }

    pub fn output(level: OutputLevel, message: impl Into<String>, stage: Option<StageId>) -> Self {
        Self::new(EventKind::Output(OutputPayload {
            level,
            message: message.into(),
            stage,
        }))
    }

    pub fn data_update(subtype: DataKind, action: DataAction, payload: Value) -> Self {
        Self::new(EventKind::DataUpdate(DataUpdatePayload {
            subtype,
            action,
            payload,
        }))
    }

    pub fn pipeline_status(
        pipeline_id: impl Into<String>,
        status: RunStatus,
        stage: Option<StageId>,
        details: Option<String>,
    ) -> Self {
        Self::new(EventKind::PipelineStatus(PipelineStatusPayload {
            pipeline_id: pipeline_id.into(),
            status,
            stage,
            details,
        }))
    }

    pub fn pipeline_reset(pipeline_id: impl Into<String>) -> Self {
        Self::new(EventKind::PipelineReset(PipelineResetPayload {
            pipeline_id: pipeline_id.into(),
        }))
    }

    pub fn error(payload: ErrorPayload) -> Self {
        Self::new(EventKind::Error(payload))
    }

    pub fn log(level: OutputLevel, message: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(EventKind::Log(LogPayload {
            level,
            message: message.into(),
            source: source.into(),
        }))
    }

    /// Serialize to the canonical single-line JSON frame.
    pub fn to_frame(&self) -> String {
        // Event serialization cannot fail: every payload is plain data.
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("failed to serialize event: {}", e);
            String::from("{\"type\":\"log\",\"data\":{\"level\":\"error\",\"message\":\"serialization failure\",\"source\":\"hub\"}}")
        })
    }
}
