//! The stdout protocol spoken by external stage binaries.
//!
//! A stage reports structured events by prefixing a single-line JSON payload
//! with one of the `[WEBSOCKET_*]` markers. Everything else on stdout and
//! stderr is plain output, with a severity inferred from conventional
//! `[ERROR]`-style prefixes.

use serde::Deserialize;
use tracing::debug;

use crate::events::OutputLevel;

pub const PROGRESS_MARKER: &str = "[WEBSOCKET_PROGRESS]";
pub const STATUS_MARKER: &str = "[WEBSOCKET_STATUS]";
pub const ERROR_MARKER: &str = "[WEBSOCKET_ERROR]";

/// Payload of a `[WEBSOCKET_PROGRESS]` line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressLine {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub current: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of a `[WEBSOCKET_STATUS]` line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusLine {
    #[serde(default)]
    pub stage: Option<String>,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of a `[WEBSOCKET_ERROR]` line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorLine {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub recoverable: Option<bool>,
    #[serde(default)]
    pub hint: Option<String>,
}

/// One parsed line of stage output.
#[derive(Debug, Clone, PartialEq)]
pub enum StageLine {
    Progress(ProgressLine),
    Status(StatusLine),
    Error(ErrorLine),
    Output { level: OutputLevel, message: String },
}

/// Parse one stdout line from a stage process.
///
/// A marker followed by a payload that does not parse is an anomaly, not a
/// failure: the raw line is demoted to plain output so nothing is lost.
pub fn parse_stdout_line(line: &str) -> StageLine {
    let line = line.trim_end();

    if let Some(rest) = line.strip_prefix(PROGRESS_MARKER) {
        match serde_json::from_str(rest.trim_start()) {
            Ok(payload) => return StageLine::Progress(payload),
            Err(e) => debug!("malformed progress payload: {} in {:?}", e, line),
        }
    } else if let Some(rest) = line.strip_prefix(STATUS_MARKER) {
        match serde_json::from_str(rest.trim_start()) {
            Ok(payload) => return StageLine::Status(payload),
            Err(e) => debug!("malformed status payload: {} in {:?}", e, line),
        }
    } else if let Some(rest) = line.strip_prefix(ERROR_MARKER) {
        match serde_json::from_str(rest.trim_start()) {
            Ok(payload) => return StageLine::Error(payload),
            Err(e) => debug!("malformed error payload: {} in {:?}", e, line),
        }
    }

    StageLine::Output {
        level: infer_level(line),
        message: line.to_string(),
    }
}

/// Severity of a plain output line, from its conventional prefix.
pub fn infer_level(line: &str) -> OutputLevel {
    if line.starts_with("[ERROR]") {
        OutputLevel::Error
    } else if line.starts_with("[WARN]") {
        OutputLevel::Warning
    } else if line.starts_with("[SUCCESS]") {
        OutputLevel::Success
    } else {
        // [INFO] and unprefixed lines alike
        OutputLevel::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        let line = r#"[WEBSOCKET_PROGRESS] {"stage":"scraping","current":3,"total":5,"percent":60.0,"message":"downloading 2025-01-03"}"#;
        match parse_stdout_line(line) {
            StageLine::Progress(p) => {
                assert_eq!(p.stage.as_deref(), Some("scraping"));
                assert_eq!(p.current, Some(3));
                assert_eq!(p.total, Some(5));
                assert_eq!(p.percent, Some(60.0));
            }
            other => panic!("expected progress, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_line() {
        let line = r#"[WEBSOCKET_STATUS] {"stage":"processing","status":"completed","message":"done"}"#;
        match parse_stdout_line(line) {
            StageLine::Status(s) => {
                assert_eq!(s.status, "completed");
                assert_eq!(s.message.as_deref(), Some("done"));
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_line() {
        let line = r#"[WEBSOCKET_ERROR] {"code":"ERR_1003","message":"login rejected","recoverable":false,"hint":"check credentials"}"#;
        match parse_stdout_line(line) {
            StageLine::Error(e) => {
                assert_eq!(e.code.as_deref(), Some("ERR_1003"));
                assert_eq!(e.recoverable, Some(false));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payload_falls_back_to_output() {
        let line = "[WEBSOCKET_PROGRESS] {not json";
        match parse_stdout_line(line) {
            StageLine::Output { level, message } => {
                assert_eq!(level, OutputLevel::Info);
                assert_eq!(message, line);
            }
            other => panic!("expected output, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_payload_falls_back_to_output() {
        match parse_stdout_line("[WEBSOCKET_STATUS]") {
            StageLine::Output { .. } => {}
            other => panic!("expected output, got {:?}", other),
        }
    }

    #[test]
    fn test_level_inference() {
        assert_eq!(infer_level("[ERROR] boom"), OutputLevel::Error);
        assert_eq!(infer_level("[WARN] careful"), OutputLevel::Warning);
        assert_eq!(infer_level("[SUCCESS] done"), OutputLevel::Success);
        assert_eq!(infer_level("[INFO] fine"), OutputLevel::Info);
        assert_eq!(infer_level("plain text"), OutputLevel::Info);
    }

    #[test]
    fn test_progress_payload_with_missing_fields() {
        let line = r#"[WEBSOCKET_PROGRESS] {"message":"warming up"}"#;
        match parse_stdout_line(line) {
            StageLine::Progress(p) => {
                assert_eq!(p.current, None);
                assert_eq!(p.total, None);
                assert_eq!(p.message.as_deref(), Some("warming up"));
            }
            other => panic!("expected progress, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_whitespace_is_stripped() {
        let line = "[SUCCESS] saved report\r\n";
        match parse_stdout_line(line) {
            StageLine::Output { message, level } => {
                assert_eq!(message, "[SUCCESS] saved report");
                assert_eq!(level, OutputLevel::Success);
            }
            other => panic!("expected output, got {:?}", other),
        }
    }
}
