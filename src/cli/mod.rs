//! CLI commands: run the dashboard server or drive a pipeline from the
//! terminal.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Settings;
use crate::events::{Event, EventKind, OutputLevel, RunStatus, StageId};
use crate::hub::{EventHub, Subscription};
use crate::pipeline::{PipelineManager, PipelineRequest, PipelineStatus, RunMode};
use crate::server;

#[derive(Parser)]
#[command(name = "isx")]
#[command(about = "Iraq Stock Exchange daily-report pipeline")]
#[command(version)]
pub struct Cli {
    /// Data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dashboard server and file watcher
    Serve {
        /// Bind address (host:port)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the pipeline once, streaming progress to the terminal
    Run {
        /// Run mode: initial, incremental or best_effort
        #[arg(long, default_value = "initial")]
        mode: String,
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// End date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
        /// Show the scraper's browser window
        #[arg(long)]
        headed: bool,
        /// Run a single stage instead of the full pipeline
        #[arg(long)]
        stage: Option<String>,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref(), cli.data_dir.clone())?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                settings.bind = bind;
            }
            server::serve(&settings).await
        }
        Commands::Run {
            mode,
            from,
            to,
            headed,
            stage,
        } => {
            let request = build_request(mode, from, to, headed, stage)?;
            run_pipeline(settings, request).await
        }
    }
}

fn build_request(
    mode: String,
    from: Option<String>,
    to: Option<String>,
    headed: bool,
    stage: Option<String>,
) -> anyhow::Result<PipelineRequest> {
    if let Some(raw) = stage {
        let stage = StageId::from_str(&raw)
            .with_context(|| format!("unknown stage '{}'", raw))?;
        return Ok(PipelineRequest::single(stage));
    }

    let mode = RunMode::from_str(&mode).with_context(|| format!("unknown mode '{}'", mode))?;
    Ok(PipelineRequest {
        mode,
        from,
        to,
        headless: !headed,
        stages: StageId::ALL.to_vec(),
        request_id: None,
    })
}

/// Execute a pipeline locally, rendering hub events as terminal output.
async fn run_pipeline(settings: Settings, request: PipelineRequest) -> anyhow::Result<()> {
    let hub = Arc::new(EventHub::new(settings.hub_buffer));
    let manager = PipelineManager::new(settings, hub.clone());

    let subscription = hub.subscribe().await;
    let display = tokio::spawn(render_events(subscription));

    let state = manager.execute(request).await?;

    hub.close().await;
    let _ = display.await;

    println!();
    for stage in &state.stages {
        let mark = match stage.status.as_str() {
            "completed" => style("ok").green(),
            "skipped" | "pending" => style("--").dim(),
            _ => style("failed").red(),
        };
        println!(
            "  {:<18} {} ({}ms)",
            stage.name,
            mark,
            stage.duration_ms()
        );
    }

    match state.status {
        PipelineStatus::Completed => {
            println!("{}", style("Pipeline completed").green().bold());
            Ok(())
        }
        status => anyhow::bail!("pipeline {}", status.as_str()),
    }
}

/// Drain the event stream into a progress bar and styled log lines.
async fn render_events(mut subscription: Subscription) {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .expect("valid progress template")
            .progress_chars("##-"),
    );

    while let Some(frame) = subscription.rx.recv().await {
        let event: Event = match serde_json::from_str(&frame) {
            Ok(event) => event,
            Err(_) => continue,
        };
        match event.kind {
            EventKind::PipelineProgress(p) => {
                bar.set_position(p.progress as u64);
                if let Some(message) = p.message {
                    bar.set_message(message);
                }
            }
            EventKind::PipelineStatus(s) => match (s.stage, s.status) {
                (Some(stage), RunStatus::Active) => {
                    bar.set_position(0);
                    bar.set_message(stage.display_name().to_string());
                    bar.println(format!("{} {}", style("==>").bold(), stage.display_name()));
                }
                (Some(stage), status) if status.is_terminal() => {
                    bar.println(format!("    {} {}", stage.display_name(), status.as_str()));
                }
                _ => {}
            },
            EventKind::Output(o) => {
                let line = match o.level {
                    OutputLevel::Error => style(o.message).red().to_string(),
                    OutputLevel::Warning => style(o.message).yellow().to_string(),
                    OutputLevel::Success => style(o.message).green().to_string(),
                    OutputLevel::Info => o.message,
                };
                bar.println(line);
            }
            EventKind::Error(e) => {
                bar.println(format!(
                    "{} {} ({}): {}",
                    style("error:").red().bold(),
                    e.title,
                    e.error_code,
                    e.detail
                ));
                if let Some(hint) = e.hint {
                    bar.println(format!("  {} {}", style("hint:").dim(), hint));
                }
            }
            _ => {}
        }
    }
    bar.finish_and_clear();
}
