mod config;
mod dataset;
mod http;
mod merchant;
mod models;
mod orchestrator;
mod payload;
mod processor;
mod runner;
#[cfg(test)]
mod test_support;

use clap::Parser;
use config::{ApiEndpoints, RunOptions, Settings};
use eyre::WrapErr;
use models::UpdateMode;
use orchestrator::{MAX_WORKERS, MIN_WORKERS, RunReport, RunRequest};
use payload::PayloadTemplate;
use runner::{RunListener, RunState, Runner};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "update";
const LOG_FILE_SUFFIX: &str = "log";

/// Bulk-update merchant product records from an xlsx or CSV sheet.
#[derive(Debug, Parser)]
#[command(name = "merchant-bulk-update", version)]
struct Cli {
    /// Source table. Results go to `<stem>_result.<ext>` next to it.
    input: PathBuf,

    /// Rows processed concurrently.
    #[arg(short, long, default_value_t = 5, value_parser = parse_workers)]
    workers: usize,

    #[arg(short, long, value_enum, default_value_t = UpdateMode::Marketplace)]
    mode: UpdateMode,

    /// Directory holding account.json and config.json.
    #[arg(long, env = "BULK_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Seconds between status polling rounds.
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Stop polling after this many rounds.
    #[arg(long)]
    max_poll_rounds: Option<u32>,

    /// Only poll rows already marked updating.
    #[arg(long)]
    skip_submit: bool,
}

fn parse_workers(raw: &str) -> Result<usize, String> {
    let workers: usize = raw.parse().map_err(|_| format!("`{raw}` is not a number"))?;
    if (MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
        Ok(workers)
    } else {
        Err(format!("must be between {MIN_WORKERS} and {MAX_WORKERS}"))
    }
}

/// Forwards the single terminal notification to `main`.
struct ChannelListener {
    tx: mpsc::UnboundedSender<String>,
}

impl RunListener for ChannelListener {
    fn on_completed(&self, report: &RunReport) {
        let _ = self.tx.send(format!(
            "completed: {} success, {} failed, {} still updating ({})",
            report.summary.success,
            report.summary.failed,
            report.summary.updating,
            report.output.display()
        ));
    }

    fn on_failed(&self, message: &str) {
        let _ = self.tx.send(format!("failed: {message}"));
    }

    fn on_stopped(&self, report: Option<&RunReport>) {
        let _ = self.tx.send(match report {
            Some(report) => format!("stopped: partial results in {}", report.output.display()),
            None => "stopped".to_string(),
        });
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();
    match run().await {
        Ok(code) => code,
        Err(err) => {
            error!(target = "bulk.cli", "bulk update aborted: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> eyre::Result<ExitCode> {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.as_deref();
    let settings = Settings::load(config_dir).wrap_err("loading account settings")?;
    let template = PayloadTemplate::load(config_dir).wrap_err("loading payload template")?;

    let mut options = RunOptions::from_env();
    if let Some(secs) = cli.poll_interval {
        options.poll_interval = Duration::from_secs(secs);
    }
    if cli.max_poll_rounds.is_some() {
        options.max_poll_rounds = cli.max_poll_rounds;
    }
    options.skip_submit = cli.skip_submit;

    let runner = Runner::new(settings, template, ApiEndpoints::from_env(), options);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = runner.start(
        RunRequest {
            input: cli.input,
            workers: cli.workers,
            mode: cli.mode,
        },
        Arc::new(ChannelListener { tx }),
    );

    let message = tokio::select! {
        message = rx.recv() => message,
        _ = tokio::signal::ctrl_c() => {
            warn!(target = "bulk.cli", "interrupt received, finishing in-flight rows");
            handle.request_stop();
            rx.recv().await
        }
    };
    let state = handle.wait().await;
    if let Some(message) = message {
        info!(target = "bulk.cli", "{message}");
    }
    Ok(match state {
        RunState::Completed { .. } => ExitCode::SUCCESS,
        RunState::Stopped { .. } => ExitCode::from(130),
        RunState::Failed { .. } | RunState::Running => ExitCode::FAILURE,
    })
}

/// Console output plus `logs/update.log` (or `$BULK_LOG_DIR/update.log`).
/// The returned guard flushes the file writer when dropped.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_dir = std::env::var("BULK_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("logs"));
    let (file_layer, guard, file_error) = match log_appender(&log_dir) {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard), None)
        }
        Err(err) => (None, None, Some(err)),
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init();
    if let Some(err) = file_error {
        warn!(target = "bulk.cli", dir = %log_dir.display(), error = %err, "file logging disabled");
    }
    guard
}

fn log_appender(dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .build(dir)
}
