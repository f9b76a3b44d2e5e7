//! Pipeline orchestration: stage sequencing, lifecycle supervision and
//! event re-emission.
//!
//! The manager owns the single run slot. A run is reserved with [`PipelineManager::begin`]
//! (which validates the request and rejects a second concurrent run) and
//! driven by [`PipelineRun::run`], which sequences the stages, pumps runner
//! events into the hub, and settles the pipeline into a terminal status on
//! every path. State is mutated only here; everyone else gets snapshots.

pub mod protocol;
pub mod runner;
pub mod stage;
pub mod state;

pub use runner::{RunnerEvent, StageOutcome, StageRunner};
pub use stage::{skip_reason, StageSpec};
pub use state::{
    new_pipeline_id, PipelineRequest, PipelineState, PipelineStatus, RunMode, StageState,
    StageStatus,
};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Settings, TERMINATION_GRACE};
use crate::events::{
    DataAction, DataKind, ErrorCode, ErrorPayload, Event, EventKind, OutputLevel,
    PipelineCompletePayload, PipelineProgressPayload, RunStatus, StageId,
};
use crate::hub::EventHub;
use crate::metrics::MetricsStore;
use crate::progress::ProgressCalculator;

/// Cadence of the progress beacon while a stage is active.
const PROGRESS_BEACON_INTERVAL: Duration = Duration::from_millis(500);

/// Terminal pipeline states retained for status queries.
const RETAINED_RUNS: usize = 16;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("another pipeline is already running")]
    Busy,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Busy => ErrorCode::PipelineBusy,
            Self::InvalidRequest(_) => ErrorCode::InvalidDate,
        }
    }
}

struct ActiveRun {
    id: String,
    state: Arc<RwLock<PipelineState>>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Owner of the run slot and the retained run history.
pub struct PipelineManager {
    settings: Settings,
    hub: Arc<EventHub>,
    metrics: MetricsStore,
    current: Mutex<Option<ActiveRun>>,
    recent: Mutex<VecDeque<PipelineState>>,
}

impl PipelineManager {
    pub fn new(settings: Settings, hub: Arc<EventHub>) -> Arc<Self> {
        let metrics = MetricsStore::new(settings.metrics_dir());
        Arc::new(Self {
            settings,
            hub,
            metrics,
            current: Mutex::new(None),
            recent: Mutex::new(VecDeque::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Validate a request and reserve the run slot.
    ///
    /// Fails with [`PipelineError::Busy`] while another run holds the slot.
    pub async fn begin(
        self: &Arc<Self>,
        request: PipelineRequest,
    ) -> Result<PipelineRun, PipelineError> {
        request.validate().map_err(PipelineError::InvalidRequest)?;

        let mut current = self.current.lock().await;
        if current.is_some() {
            return Err(PipelineError::Busy);
        }

        let id = new_pipeline_id();
        let request_id = request.request_id.clone();
        let state = Arc::new(RwLock::new(PipelineState::new(id.clone(), request)));
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        *current = Some(ActiveRun {
            id: id.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
            done: done_rx,
        });
        info!("pipeline {} accepted", id);

        Ok(PipelineRun {
            manager: Arc::clone(self),
            id,
            request_id,
            state,
            cancel,
            done: done_tx,
            settled: false,
        })
    }

    /// Run a pipeline to its terminal status and return the final state.
    pub async fn execute(
        self: &Arc<Self>,
        request: PipelineRequest,
    ) -> Result<PipelineState, PipelineError> {
        let run = self.begin(request).await?;
        Ok(run.run().await)
    }

    /// Request cancellation of the given run. Idempotent; a stale or
    /// unknown id is a no-op.
    pub async fn cancel(&self, id: &str) -> bool {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(run) if run.id == id => {
                run.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Snapshot of a run, active or recently finished.
    pub async fn get(&self, id: &str) -> Option<PipelineState> {
        if let Some(run) = self.current.lock().await.as_ref() {
            if run.id == id {
                return Some(run.state.read().await.clone());
            }
        }
        self.recent
            .lock()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Snapshots of active runs: zero or one entry.
    pub async fn active(&self) -> Vec<PipelineState> {
        match self.current.lock().await.as_ref() {
            Some(run) => vec![run.state.read().await.clone()],
            None => Vec::new(),
        }
    }

    /// Cancel any active run and wait for it to settle.
    pub async fn shutdown(&self) {
        let (cancel, mut done) = {
            let current = self.current.lock().await;
            match current.as_ref() {
                Some(run) => (run.cancel.clone(), run.done.clone()),
                None => return,
            }
        };
        cancel.cancel();
        let wait = TERMINATION_GRACE + Duration::from_secs(1);
        if tokio::time::timeout(wait, done.wait_for(|finished| *finished))
            .await
            .is_err()
        {
            warn!("active pipeline did not stop within {:?}", wait);
        }
    }

    async fn retire(&self, state: PipelineState) {
        {
            let mut current = self.current.lock().await;
            if current.as_ref().is_some_and(|run| run.id == state.id) {
                *current = None;
            }
        }
        let mut recent = self.recent.lock().await;
        recent.push_back(state);
        while recent.len() > RETAINED_RUNS {
            recent.pop_front();
        }
    }
}

struct StageRunResult {
    outcome: StageOutcome,
    /// Whether a terminal stage status was already forwarded to the hub.
    terminal_emitted: bool,
}

/// A reserved pipeline run, ready to execute.
pub struct PipelineRun {
    manager: Arc<PipelineManager>,
    id: String,
    request_id: Option<String>,
    state: Arc<RwLock<PipelineState>>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
    settled: bool,
}

impl Drop for PipelineRun {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Reserved but never executed; free the run slot.
        let _ = self.done.send(true);
        let manager = Arc::clone(&self.manager);
        let id = self.id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut current = manager.current.lock().await;
                if current.as_ref().is_some_and(|run| run.id == id) {
                    *current = None;
                }
            });
        }
    }
}

impl PipelineRun {
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn emit(&self, event: Event) {
        self.manager
            .hub
            .publish(&event.with_request_id(self.request_id.clone()))
            .await;
    }

    /// Execute all requested stages in order and settle into a terminal
    /// status. Returns the final state snapshot.
    pub async fn run(self) -> PipelineState {
        let (mode, stages) = {
            let mut state = self.state.write().await;
            state.mark_running();
            (state.request.mode, state.request.stages.clone())
        };

        self.emit(Event::pipeline_reset(&self.id)).await;
        self.emit(Event::pipeline_status(
            &self.id,
            RunStatus::Running,
            None,
            None,
        ))
        .await;

        let mut failure: Option<ErrorPayload> = None;
        let mut cancelled = false;

        for stage_id in stages {
            if cancelled {
                // Remaining stages stay pending; the run is over.
                continue;
            }
            if let Some(error) = &failure {
                let reason = format!("{} failed earlier", error.stage.map(|s| s.as_str()).unwrap_or("a stage"));
                if let Some(stage) = self.state.write().await.stage_mut(stage_id) {
                    stage.skip(&reason, false);
                }
                self.emit(Event::pipeline_status(
                    &self.id,
                    RunStatus::Skipped,
                    Some(stage_id),
                    Some(reason),
                ))
                .await;
                continue;
            }
            if self.cancel.is_cancelled() {
                cancelled = true;
                continue;
            }

            // Fast path: outputs already present.
            if mode == RunMode::Incremental {
                if let Some(reason) = skip_reason(stage_id, &self.manager.settings) {
                    if let Some(stage) = self.state.write().await.stage_mut(stage_id) {
                        stage.skip(&reason, true);
                    }
                    self.emit(Event::pipeline_status(
                        &self.id,
                        RunStatus::Completed,
                        Some(stage_id),
                        Some(reason.clone()),
                    ))
                    .await;
                    self.emit(Event::output(
                        OutputLevel::Info,
                        format!("{}: skipped, {}", stage_id.display_name(), reason),
                        Some(stage_id),
                    ))
                    .await;
                    continue;
                }
            }

            if let Some(stage) = self.state.write().await.stage_mut(stage_id) {
                stage.activate();
            }
            self.emit(Event::pipeline_status(
                &self.id,
                RunStatus::Active,
                Some(stage_id),
                None,
            ))
            .await;

            let result = self.run_stage(stage_id).await;
            match result.outcome {
                StageOutcome::Completed => {
                    if let Some(stage) = self.state.write().await.stage_mut(stage_id) {
                        stage.complete();
                    }
                    if !result.terminal_emitted {
                        self.emit(Event::pipeline_status(
                            &self.id,
                            RunStatus::Completed,
                            Some(stage_id),
                            None,
                        ))
                        .await;
                    }
                }
                StageOutcome::Failed(error) => {
                    if let Some(stage) = self.state.write().await.stage_mut(stage_id) {
                        stage.fail(error.clone());
                    }
                    if !result.terminal_emitted {
                        self.emit(Event::pipeline_status(
                            &self.id,
                            RunStatus::Failed,
                            Some(stage_id),
                            Some(error.title.clone()),
                        ))
                        .await;
                    }
                    if stage_id == StageId::Scraping
                        && error.recoverable
                        && mode == RunMode::BestEffort
                    {
                        self.emit(Event::output(
                            OutputLevel::Warning,
                            "scraping failed with a recoverable error, continuing with partial data",
                            Some(stage_id),
                        ))
                        .await;
                    } else {
                        failure = Some(error);
                    }
                }
                StageOutcome::TimedOut(error) => {
                    if let Some(stage) = self.state.write().await.stage_mut(stage_id) {
                        stage.fail(error.clone());
                    }
                    self.emit(Event::pipeline_status(
                        &self.id,
                        RunStatus::Failed,
                        Some(stage_id),
                        Some(error.title.clone()),
                    ))
                    .await;
                    failure = Some(error);
                }
                StageOutcome::Cancelled => {
                    let error = ErrorPayload::from_code(
                        ErrorCode::Cancelled,
                        format!("{} cancelled on request", stage_id.display_name()),
                        Some(stage_id),
                    );
                    if let Some(stage) = self.state.write().await.stage_mut(stage_id) {
                        stage.fail(error);
                    }
                    self.emit(Event::pipeline_status(
                        &self.id,
                        RunStatus::Cancelled,
                        Some(stage_id),
                        None,
                    ))
                    .await;
                    cancelled = true;
                }
            }
        }

        self.settle(cancelled, failure).await
    }

    /// Publish the terminal status, completion summary and refresh signal,
    /// then free the run slot.
    async fn settle(mut self, cancelled: bool, failure: Option<ErrorPayload>) -> PipelineState {
        self.settled = true;
        let status = if cancelled {
            PipelineStatus::Cancelled
        } else if failure.is_some() {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Completed
        };

        let details = failure.as_ref().map(|e| e.title.clone());
        {
            let mut state = self.state.write().await;
            state.finish(status, failure);
        }

        self.emit(Event::pipeline_status(
            &self.id,
            status.into(),
            None,
            details,
        ))
        .await;

        let final_state = self.state.read().await.clone();
        self.emit(Event::new(EventKind::PipelineComplete(
            PipelineCompletePayload {
                pipeline_id: self.id.clone(),
                status: status.into(),
                duration_ms: final_state.duration_ms(),
                stages: final_state.stage_summaries(),
            },
        )))
        .await;

        if status == PipelineStatus::Completed {
            self.emit(Event::data_update(
                DataKind::All,
                DataAction::Refresh,
                json!({}),
            ))
            .await;
        }

        info!("pipeline {} finished: {}", self.id, status.as_str());
        self.manager.retire(final_state.clone()).await;
        let _ = self.done.send(true);
        final_state
    }

    /// Drive one stage: spawn the runner and the progress beacon, pump
    /// runner events into state updates and hub events, join the outcome.
    async fn run_stage(&self, stage_id: StageId) -> StageRunResult {
        let request = { self.state.read().await.request.clone() };
        let spec = StageSpec::build(stage_id, &self.manager.settings, &request);
        let runner = StageRunner::new(
            spec,
            self.manager.settings.executable_root(),
            TERMINATION_GRACE,
        );

        let calc = Arc::new(StdMutex::new(ProgressCalculator::new(
            stage_id,
            &self.manager.metrics,
        )));

        let (tx, mut rx) = mpsc::channel::<RunnerEvent>(256);
        let runner_task = tokio::spawn(runner.run(self.cancel.child_token(), tx));

        let beacon_cancel = CancellationToken::new();
        let beacon = tokio::spawn(beacon_task(
            self.manager.hub.clone(),
            self.state.clone(),
            calc.clone(),
            self.id.clone(),
            self.request_id.clone(),
            stage_id,
            beacon_cancel.clone(),
        ));

        let mut terminal_emitted = false;
        while let Some(event) = rx.recv().await {
            match event {
                RunnerEvent::Progress {
                    current,
                    total,
                    percent,
                    message,
                } => {
                    let (merged_percent, merged_current, merged_total, eta) = {
                        let mut calc = calc.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(total) = total {
                            calc.set_total(total);
                        }
                        if let Some(current) = current {
                            calc.update(current);
                        }
                        let p = percent.unwrap_or_else(|| calc.percent());
                        (p, calc.current(), calc.total(), calc.eta().to_string())
                    };

                    let progress = {
                        let mut state = self.state.write().await;
                        if let Some(stage) = state.stage_mut(stage_id) {
                            stage.set_progress(merged_percent);
                            stage.message = message.clone().or(stage.message.take());
                            stage.progress
                        } else {
                            merged_percent
                        }
                    };

                    self.emit(Event::new(EventKind::PipelineProgress(
                        PipelineProgressPayload {
                            pipeline_id: self.id.clone(),
                            stage: stage_id,
                            progress,
                            message,
                            current: Some(merged_current),
                            total: merged_total,
                            eta: Some(eta),
                        },
                    )))
                    .await;
                }
                RunnerEvent::Status {
                    status,
                    raw,
                    message,
                } => {
                    if let Some(message) = &message {
                        if let Some(stage) = self.state.write().await.stage_mut(stage_id) {
                            stage.message = Some(message.clone());
                        }
                    }
                    match status {
                        Some(status) => {
                            if status.is_terminal() {
                                terminal_emitted = true;
                            }
                            self.emit(Event::pipeline_status(
                                &self.id,
                                status,
                                Some(stage_id),
                                message,
                            ))
                            .await;
                        }
                        None => {
                            // Unknown status strings are surfaced as output.
                            self.emit(Event::output(
                                OutputLevel::Info,
                                message.unwrap_or(raw),
                                Some(stage_id),
                            ))
                            .await;
                        }
                    }
                }
                RunnerEvent::Error(payload) => {
                    if let Some(stage) = self.state.write().await.stage_mut(stage_id) {
                        stage.error = Some(payload.clone());
                    }
                    self.emit(Event::error(payload)).await;
                }
                RunnerEvent::Output { level, message } => {
                    self.emit(Event::output(level, message, Some(stage_id))).await;
                }
            }
        }

        let outcome = match runner_task.await {
            Ok(outcome) => outcome,
            Err(e) => StageOutcome::Failed(ErrorPayload::from_code(
                ErrorCode::StageExit,
                format!("{} supervisor task failed: {}", stage_id, e),
                Some(stage_id),
            )),
        };

        beacon_cancel.cancel();
        let _ = beacon.await;

        if matches!(outcome, StageOutcome::Completed) {
            let calc = calc.lock().unwrap_or_else(|e| e.into_inner());
            calc.complete(&self.manager.metrics);
        }

        StageRunResult {
            outcome,
            terminal_emitted,
        }
    }
}

/// Publishes a progress snapshot on a fixed cadence so subscribers see
/// motion even when the stage is silent.
async fn beacon_task(
    hub: Arc<EventHub>,
    state: Arc<RwLock<PipelineState>>,
    calc: Arc<StdMutex<ProgressCalculator>>,
    pipeline_id: String,
    request_id: Option<String>,
    stage_id: StageId,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(PROGRESS_BEACON_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let (progress, message) = {
                    let state = state.read().await;
                    match state.stage(stage_id) {
                        Some(stage) => (stage.progress, stage.message.clone()),
                        None => break,
                    }
                };
                let (current, total, eta) = {
                    let calc = calc.lock().unwrap_or_else(|e| e.into_inner());
                    (calc.current(), calc.total(), calc.eta().to_string())
                };
                let event = Event::new(EventKind::PipelineProgress(PipelineProgressPayload {
                    pipeline_id: pipeline_id.clone(),
                    stage: stage_id,
                    progress,
                    message,
                    current: Some(current),
                    total,
                    eta: Some(eta),
                }))
                .with_request_id(request_id.clone());
                hub.publish(&event).await;
            }
        }
    }
}
