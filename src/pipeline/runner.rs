//! Supervision of a single external stage process.
//!
//! The runner launches the stage binary with its working directory pinned to
//! the executable root, merges stdout and stderr by arrival order, translates
//! protocol marker lines into typed events, and turns the exit code into a
//! terminal outcome. Cancellation and the per-stage deadline both follow the
//! same soft-terminate, grace window, hard-kill sequence.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufRead, BufReader, AsyncBufReadExt, Lines};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{ErrorCode, ErrorPayload, OutputLevel, RunStatus, StageId};
use crate::pipeline::protocol::{parse_stdout_line, StageLine};
use crate::pipeline::stage::{StageSpec, EXIT_INPUT_NOT_FOUND};

/// Typed event stream from a running stage.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Progress {
        current: Option<u64>,
        total: Option<u64>,
        percent: Option<f64>,
        message: Option<String>,
    },
    Status {
        status: Option<RunStatus>,
        raw: String,
        message: Option<String>,
    },
    Error(ErrorPayload),
    Output {
        level: OutputLevel,
        message: String,
    },
}

/// How a stage run ended.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Completed,
    Failed(ErrorPayload),
    Cancelled,
    TimedOut(ErrorPayload),
}

/// Runs one stage process to completion.
pub struct StageRunner {
    spec: StageSpec,
    working_dir: PathBuf,
    grace: Duration,
}

impl StageRunner {
    pub fn new(spec: StageSpec, working_dir: PathBuf, grace: Duration) -> Self {
        Self {
            spec,
            working_dir,
            grace,
        }
    }

    /// Launch the stage and pump its output until it exits, is cancelled,
    /// or hits the deadline. Error events are always sent before the
    /// corresponding outcome is returned.
    pub async fn run(
        self,
        cancel: CancellationToken,
        events: mpsc::Sender<RunnerEvent>,
    ) -> StageOutcome {
        let stage = self.spec.id;

        let mut cmd = Command::new(&self.spec.executable);
        cmd.args(&self.spec.args)
            .current_dir(&self.working_dir)
            .env("ISX_STAGE", stage.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let payload = ErrorPayload::from_code(
                    ErrorCode::StageExit,
                    format!(
                        "failed to launch {}: {}",
                        self.spec.executable.display(),
                        e
                    ),
                    Some(stage),
                );
                let _ = events.send(RunnerEvent::Error(payload.clone())).await;
                return StageOutcome::Failed(payload);
            }
        };

        let mut out_lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut err_lines = child.stderr.take().map(|s| BufReader::new(s).lines());

        let deadline = tokio::time::sleep(self.spec.deadline);
        tokio::pin!(deadline);

        // What the stage reported about itself through the protocol.
        let mut saw_terminal = false;
        let mut reported_failure = false;
        let mut last_error: Option<ErrorPayload> = None;

        loop {
            let out_open = out_lines.is_some();
            let err_open = err_lines.is_some();
            if !out_open && !err_open {
                break;
            }

            tokio::select! {
                line = next_line(&mut out_lines), if out_open => match line {
                    Some(line) => {
                        handle_stdout_line(
                            stage,
                            &line,
                            &events,
                            &mut saw_terminal,
                            &mut reported_failure,
                            &mut last_error,
                        )
                        .await;
                    }
                    None => out_lines = None,
                },
                line = next_line(&mut err_lines), if err_open => match line {
                    Some(line) => {
                        let _ = events
                            .send(RunnerEvent::Output {
                                level: OutputLevel::Warning,
                                message: line,
                            })
                            .await;
                    }
                    None => err_lines = None,
                },
                _ = cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return StageOutcome::Cancelled;
                }
                _ = &mut deadline => {
                    self.terminate(&mut child).await;
                    let payload = self.timeout_payload();
                    let _ = events.send(RunnerEvent::Error(payload.clone())).await;
                    return StageOutcome::TimedOut(payload);
                }
            }
        }

        // Streams are drained; collect the exit status.
        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                self.terminate(&mut child).await;
                return StageOutcome::Cancelled;
            }
            _ = &mut deadline => {
                self.terminate(&mut child).await;
                let payload = self.timeout_payload();
                let _ = events.send(RunnerEvent::Error(payload.clone())).await;
                return StageOutcome::TimedOut(payload);
            }
        };

        match status {
            Ok(status) if status.success() => {
                if reported_failure {
                    let payload = last_error.unwrap_or_else(|| {
                        ErrorPayload::from_code(
                            ErrorCode::StageExit,
                            format!("{} reported failure before exiting", stage),
                            Some(stage),
                        )
                    });
                    return StageOutcome::Failed(payload);
                }
                if !saw_terminal {
                    debug!("{} exited 0 without a terminal status, synthesizing", stage);
                    let _ = events
                        .send(RunnerEvent::Status {
                            status: Some(RunStatus::Completed),
                            raw: "completed".to_string(),
                            message: None,
                        })
                        .await;
                }
                StageOutcome::Completed
            }
            Ok(status) => {
                // The stage's own structured error beats a synthesized one.
                if let Some(payload) = last_error {
                    return StageOutcome::Failed(payload);
                }
                let code = status.code();
                let (err_code, detail) = match code {
                    Some(EXIT_INPUT_NOT_FOUND) => (
                        ErrorCode::FileAccess,
                        format!("{} could not find its input files (exit code 2)", stage),
                    ),
                    Some(c) => (
                        ErrorCode::StageExit,
                        format!("{} exited with code {}", stage, c),
                    ),
                    None => (
                        ErrorCode::StageExit,
                        format!("{} was terminated by a signal", stage),
                    ),
                };
                let mut payload = ErrorPayload::from_code(err_code, detail, Some(stage));
                if let Some(c) = code {
                    payload.metadata = Some(json!({ "exit_code": c }));
                }
                let _ = events.send(RunnerEvent::Error(payload.clone())).await;
                StageOutcome::Failed(payload)
            }
            Err(e) => {
                let payload = ErrorPayload::from_code(
                    ErrorCode::StageExit,
                    format!("failed to collect {} exit status: {}", stage, e),
                    Some(stage),
                );
                let _ = events.send(RunnerEvent::Error(payload.clone())).await;
                StageOutcome::Failed(payload)
            }
        }
    }

    fn timeout_payload(&self) -> ErrorPayload {
        ErrorPayload::from_code(
            ErrorCode::StageTimeout,
            format!(
                "{} exceeded its {}s deadline",
                self.spec.id,
                self.spec.deadline.as_secs()
            ),
            Some(self.spec.id),
        )
    }

    /// Soft-terminate, wait out the grace window, then kill.
    async fn terminate(&self, child: &mut Child) {
        soft_terminate(child);
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    "{} did not exit within {}s grace window, killing",
                    self.spec.id,
                    self.grace.as_secs()
                );
                let _ = child.kill().await;
            }
        }
    }
}

async fn handle_stdout_line(
    stage: StageId,
    line: &str,
    events: &mpsc::Sender<RunnerEvent>,
    saw_terminal: &mut bool,
    reported_failure: &mut bool,
    last_error: &mut Option<ErrorPayload>,
) {
    match parse_stdout_line(line) {
        StageLine::Progress(p) => {
            let _ = events
                .send(RunnerEvent::Progress {
                    current: p.current,
                    total: p.total,
                    percent: p.percent,
                    message: p.message,
                })
                .await;
        }
        StageLine::Status(s) => {
            let status = RunStatus::from_str(&s.status);
            if let Some(status) = status {
                if status.is_terminal() {
                    *saw_terminal = true;
                }
                if status == RunStatus::Failed {
                    *reported_failure = true;
                }
            }
            let _ = events
                .send(RunnerEvent::Status {
                    status,
                    raw: s.status,
                    message: s.message,
                })
                .await;
        }
        StageLine::Error(e) => {
            let payload = error_line_payload(stage, e);
            if !payload.recoverable {
                *reported_failure = true;
            }
            *last_error = Some(payload.clone());
            let _ = events.send(RunnerEvent::Error(payload)).await;
        }
        StageLine::Output { level, message } => {
            let _ = events.send(RunnerEvent::Output { level, message }).await;
        }
    }
}

/// Build an error payload from a stage's `[WEBSOCKET_ERROR]` line, filling
/// gaps from the taxonomy when the code is known.
fn error_line_payload(stage: StageId, line: crate::pipeline::protocol::ErrorLine) -> ErrorPayload {
    let known = line.code.as_deref().and_then(ErrorCode::from_str);
    match known {
        Some(code) => {
            let mut payload = ErrorPayload::from_code(
                code,
                line.detail.unwrap_or_else(|| line.message.clone()),
                Some(stage),
            );
            payload.title = line.message;
            if let Some(recoverable) = line.recoverable {
                payload.recoverable = recoverable;
            }
            if let Some(hint) = line.hint {
                payload.hint = Some(hint);
            }
            payload
        }
        None => ErrorPayload {
            error_code: line.code.unwrap_or_else(|| "ERR_3003".to_string()),
            title: line.message.clone(),
            detail: line.detail.unwrap_or(line.message),
            stage: Some(stage),
            recoverable: line.recoverable.unwrap_or(false),
            hint: line.hint,
            metadata: None,
        },
    }
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                debug!("stage output read error: {}", e);
                None
            }
        },
        None => None,
    }
}

#[cfg(unix)]
fn soft_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SIGTERM first so the stage can flush and clean up.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn soft_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh_spec(stage: StageId, script: &str, deadline: Duration) -> StageSpec {
        StageSpec {
            id: stage,
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            deadline,
        }
    }

    async fn run_script(
        script: &str,
        deadline: Duration,
        grace: Duration,
    ) -> (Vec<RunnerEvent>, StageOutcome) {
        let spec = sh_spec(StageId::Scraping, script, deadline);
        let runner = StageRunner::new(spec, std::env::temp_dir(), grace);
        let (tx, mut rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(runner.run(cancel, tx));
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let outcome = handle.await.expect("runner task panicked");
        (events, outcome)
    }

    fn error_events(events: &[RunnerEvent]) -> Vec<&ErrorPayload> {
        events
            .iter()
            .filter_map(|e| match e {
                RunnerEvent::Error(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_clean_exit_synthesizes_completed() {
        let (events, outcome) =
            run_script("echo hello", Duration::from_secs(10), Duration::from_secs(1)).await;

        assert!(matches!(outcome, StageOutcome::Completed));
        assert!(error_events(&events).is_empty());
        // Output for "hello" plus the synthesized terminal status.
        assert!(events.iter().any(|e| matches!(
            e,
            RunnerEvent::Output { message, .. } if message == "hello"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            RunnerEvent::Status { status: Some(RunStatus::Completed), .. }
        )));
    }

    #[tokio::test]
    async fn test_progress_markers_are_preserved() {
        let script = r#"
            echo '[WEBSOCKET_PROGRESS] {"stage":"scraping","current":1,"total":5,"percent":20.0,"message":"day 1"}'
            echo '[WEBSOCKET_PROGRESS] {"stage":"scraping","current":5,"total":5,"percent":100.0,"message":"day 5"}'
        "#;
        let (events, outcome) =
            run_script(script, Duration::from_secs(10), Duration::from_secs(1)).await;

        assert!(matches!(outcome, StageOutcome::Completed));
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RunnerEvent::Progress { current, total, .. } => Some((*current, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(Some(1), Some(5)), (Some(5), Some(5))]);
    }

    #[tokio::test]
    async fn test_stderr_becomes_warning_output() {
        let (events, _) = run_script(
            "echo oops >&2",
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await;

        assert!(events.iter().any(|e| matches!(
            e,
            RunnerEvent::Output { level: OutputLevel::Warning, message } if message == "oops"
        )));
    }

    #[tokio::test]
    async fn test_nonzero_exit_synthesizes_stage_exit_error() {
        let (events, outcome) =
            run_script("exit 3", Duration::from_secs(10), Duration::from_secs(1)).await;

        let errors = error_events(&events);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_code, "ERR_3003");
        assert_eq!(
            errors[0].metadata.as_ref().unwrap()["exit_code"],
            serde_json::json!(3)
        );
        match outcome {
            StageOutcome::Failed(p) => assert_eq!(p.error_code, "ERR_3003"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exit_two_maps_to_input_not_found() {
        let (events, outcome) =
            run_script("exit 2", Duration::from_secs(10), Duration::from_secs(1)).await;

        assert_eq!(error_events(&events)[0].error_code, "ERR_9003");
        assert!(matches!(outcome, StageOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_stage_error_marker_wins_over_synthesized() {
        let script = r#"
            echo '[WEBSOCKET_ERROR] {"code":"ERR_1003","message":"login rejected","recoverable":false}'
            exit 1
        "#;
        let (events, outcome) =
            run_script(script, Duration::from_secs(10), Duration::from_secs(1)).await;

        let errors = error_events(&events);
        assert_eq!(errors.len(), 1, "no extra synthesized error expected");
        assert_eq!(errors[0].error_code, "ERR_1003");
        match outcome {
            StageOutcome::Failed(p) => {
                assert_eq!(p.error_code, "ERR_1003");
                assert!(!p.recoverable);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_status_from_stage_is_not_duplicated() {
        let script = r#"
            echo '[WEBSOCKET_STATUS] {"stage":"scraping","status":"completed","message":"all done"}'
        "#;
        let (events, outcome) =
            run_script(script, Duration::from_secs(10), Duration::from_secs(1)).await;

        assert!(matches!(outcome, StageOutcome::Completed));
        let terminal_statuses = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    RunnerEvent::Status { status: Some(s), .. } if s.is_terminal()
                )
            })
            .count();
        assert_eq!(terminal_statuses, 1);
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_reports() {
        let start = Instant::now();
        let (events, outcome) = run_script(
            "sleep 30",
            Duration::from_millis(300),
            Duration::from_secs(2),
        )
        .await;

        assert!(matches!(outcome, StageOutcome::TimedOut(_)));
        assert_eq!(error_events(&events)[0].error_code, "ERR_3002");
        // Deadline plus at most the grace window, with slack for CI.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_promptly() {
        let spec = sh_spec(StageId::Scraping, "sleep 30", Duration::from_secs(60));
        let runner = StageRunner::new(spec, std::env::temp_dir(), Duration::from_secs(2));
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let cancel2 = cancel.clone();
        let handle = tokio::spawn(runner.run(cancel, tx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = Instant::now();
        cancel2.cancel();
        while rx.recv().await.is_some() {}
        let outcome = handle.await.unwrap();

        assert!(matches!(outcome, StageOutcome::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_cleanly() {
        let spec = StageSpec {
            id: StageId::Processing,
            executable: PathBuf::from("/nonexistent/isx-process"),
            args: vec![],
            deadline: Duration::from_secs(5),
        };
        let runner = StageRunner::new(spec, std::env::temp_dir(), Duration::from_secs(1));
        let (tx, mut rx) = mpsc::channel(16);

        let handle = tokio::spawn(runner.run(CancellationToken::new(), tx));
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let outcome = handle.await.unwrap();

        match outcome {
            StageOutcome::Failed(p) => assert_eq!(p.error_code, "ERR_3003"),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(error_events(&events).len(), 1);
    }
}
