use crate::config::{ConfigError, RunOptions, WarehouseSettings};
use crate::dataset::{DataError, Dataset, result_path};
use crate::merchant::{MerchantError, ProductApi};
use crate::models::{RowStatus, RowUpdate, StatusSummary, UpdateMode};
use crate::payload::PayloadBuilder;
use crate::processor::{self, RowJob, RowOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 50;

/// Run-fatal errors. Anything row-scoped is recorded in the row instead.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("authentication failed: {0}")]
    Authentication(#[from] MerchantError),
    #[error("worker task aborted: {0}")]
    Worker(String),
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub input: PathBuf,
    pub workers: usize,
    pub mode: UpdateMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub output: PathBuf,
    pub summary: StatusSummary,
    pub poll_rounds: u32,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Submit,
    Poll,
}

/// State every worker task shares. Cheap to clone.
#[derive(Clone)]
struct Shared {
    api: Arc<dyn ProductApi>,
    builder: Arc<PayloadBuilder>,
    dataset: Arc<Mutex<Dataset>>,
    cancel: CancellationToken,
}

impl Shared {
    /// Applies a worker's outcome under the dataset lock. Nothing is
    /// committed once a stop has been requested.
    async fn commit(&self, job: &RowJob, outcome: RowOutcome, phase: Phase) {
        let RowOutcome::Resolved(update) = outcome else {
            return;
        };
        let mut data = self.dataset.lock().await;
        if self.cancel.is_cancelled() {
            debug!(target = "bulk.run", row = job.index + 1, identifier = %job.identifier, "stop requested, result discarded");
            return;
        }
        data.apply(job.index, &update);
        drop(data);
        log_outcome(phase, job, &update);
    }
}

fn log_outcome(phase: Phase, job: &RowJob, update: &RowUpdate) {
    let row = job.index + 1;
    let identifier = job.identifier.as_str();
    let error = update.error_message.as_deref().unwrap_or("");
    match (phase, update.status) {
        (Phase::Submit, RowStatus::Failed) => {
            warn!(target = "bulk.submit", row, identifier, error, "update failed")
        }
        (Phase::Submit, _) => info!(
            target = "bulk.submit",
            row,
            identifier,
            record_id = update.record_id.as_deref().unwrap_or(""),
            "update sent"
        ),
        (Phase::Poll, RowStatus::Success) => {
            info!(target = "bulk.poll", row, identifier, "update succeeded")
        }
        (Phase::Poll, RowStatus::Failed) => {
            warn!(target = "bulk.poll", row, identifier, error, "update rejected")
        }
        (Phase::Poll, _) => debug!(target = "bulk.poll", row, identifier, "still updating"),
    }
}

/// Drives one bulk run: a bounded submit phase followed by polling rounds
/// until every row is terminal, the round budget runs out, or a stop is
/// requested.
pub struct BulkUpdater {
    shared: Shared,
    run_id: Uuid,
    mode: UpdateMode,
    workers: usize,
    options: RunOptions,
    output: PathBuf,
}

impl BulkUpdater {
    /// Loads the source table (resuming from an earlier result file when
    /// present). Structural problems with the input fail here, before any
    /// remote call.
    pub fn new(
        api: Arc<dyn ProductApi>,
        builder: Arc<PayloadBuilder>,
        request: &RunRequest,
        options: RunOptions,
        warehouse: &WarehouseSettings,
        cancel: CancellationToken,
    ) -> Result<Self, UpdateError> {
        let output = result_path(&request.input);
        let dataset = Dataset::open(&request.input, &output, request.mode, warehouse)?;
        let workers = request.workers.clamp(MIN_WORKERS, MAX_WORKERS);
        let run_id = Uuid::new_v4();
        info!(
            target = "bulk.run",
            %run_id,
            input = %request.input.display(),
            rows = dataset.len(),
            workers,
            mode = request.mode.as_str(),
            "run prepared"
        );
        Ok(Self {
            shared: Shared {
                api,
                builder,
                dataset: Arc::new(Mutex::new(dataset)),
                cancel,
            },
            run_id,
            mode: request.mode,
            workers,
            options,
            output,
        })
    }

    pub async fn run(&self) -> Result<RunReport, UpdateError> {
        let started_at = Utc::now();
        self.shared.api.authenticate().await?;

        if self.options.skip_submit {
            info!(target = "bulk.run", run_id = %self.run_id, "submit phase skipped");
        } else {
            self.submit_phase().await?;
        }
        let poll_rounds = self.poll_phase().await?;
        // The result file exists after every run, even when nothing was dispatched.
        self.persist().await?;

        let summary = self.shared.dataset.lock().await.summary();
        let cancelled = self.shared.cancel.is_cancelled();
        info!(
            target = "bulk.run",
            run_id = %self.run_id,
            success = summary.success,
            failed = summary.failed,
            updating = summary.updating,
            unset = summary.unset,
            poll_rounds,
            cancelled,
            "run finished"
        );
        Ok(RunReport {
            run_id: self.run_id,
            output: self.output.clone(),
            summary,
            poll_rounds,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn submit_phase(&self) -> Result<(), UpdateError> {
        let jobs = self.jobs(|_, _| true).await;
        info!(target = "bulk.submit", rows = jobs.len(), workers = self.workers, "submit phase started");

        self.dispatch(jobs, Phase::Submit).await?;
        let summary = self.shared.dataset.lock().await.summary();
        info!(
            target = "bulk.submit",
            updating = summary.updating,
            failed = summary.failed,
            "submit phase finished"
        );
        Ok(())
    }

    /// Returns the number of rounds run. Never sleeps after the last round.
    async fn poll_phase(&self) -> Result<u32, UpdateError> {
        let mut round = 0u32;
        loop {
            if self.shared.cancel.is_cancelled() {
                warn!(target = "bulk.poll", round, "stop requested, polling halted");
                break;
            }
            let jobs = self
                .jobs(|data, idx| data.status(idx) == RowStatus::Updating)
                .await;
            if jobs.is_empty() {
                info!(target = "bulk.poll", round, "no rows left updating");
                break;
            }
            if let Some(max) = self.options.max_poll_rounds
                && round >= max
            {
                warn!(target = "bulk.poll", round, pending = jobs.len(), "poll round budget exhausted");
                break;
            }

            round += 1;
            info!(target = "bulk.poll", round, pending = jobs.len(), "poll round started");
            self.dispatch(jobs, Phase::Poll).await?;

            let remaining = self.shared.dataset.lock().await.updating_rows().len();
            if remaining == 0 {
                info!(target = "bulk.poll", round, "all rows reached a terminal status");
                break;
            }
            if self
                .options
                .max_poll_rounds
                .is_some_and(|max| round >= max)
            {
                warn!(target = "bulk.poll", round, remaining, "poll round budget exhausted");
                break;
            }
            info!(
                target = "bulk.poll",
                round,
                remaining,
                wait_secs = self.options.poll_interval.as_secs_f64(),
                "waiting before next round"
            );
            tokio::select! {
                _ = self.shared.cancel.cancelled() => {
                    warn!(target = "bulk.poll", round, "stop requested during wait");
                    break;
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
        Ok(round)
    }

    /// Runs one phase over `jobs` with at most `workers` rows in flight,
    /// then persists a snapshot. The snapshot is written even when a worker
    /// task aborted.
    async fn dispatch(&self, jobs: Vec<RowJob>, phase: Phase) -> Result<(), UpdateError> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for job in jobs {
            let shared = self.shared.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                if shared.cancel.is_cancelled() {
                    return;
                }
                let api = shared.api.as_ref();
                let outcome = match phase {
                    Phase::Submit => {
                        processor::submit_row(api, &shared.builder, &job, &shared.cancel).await
                    }
                    Phase::Poll => processor::check_row(api, &job, &shared.cancel).await,
                };
                shared.commit(&job, outcome, phase).await;
            });
        }

        let joined = drain(&mut tasks).await;
        self.persist().await?;
        joined
    }

    /// Copies the selected rows out of the dataset so workers run unlocked.
    async fn jobs(&self, select: impl Fn(&Dataset, usize) -> bool) -> Vec<RowJob> {
        let guard = self.shared.dataset.lock().await;
        let data: &Dataset = &guard;
        (0..data.len())
            .filter(|&idx| select(data, idx))
            .map(|idx| RowJob::from_dataset(data, idx, self.mode))
            .collect()
    }

    async fn persist(&self) -> Result<(), UpdateError> {
        let data = self.shared.dataset.lock().await;
        data.save(&self.output)?;
        Ok(())
    }
}

/// Waits for every task. A panicked task is reported after the others finish.
async fn drain(tasks: &mut JoinSet<()>) -> Result<(), UpdateError> {
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(target = "bulk.run", error = %err, "worker task aborted");
            failure.get_or_insert_with(|| err.to_string());
        }
    }
    match failure {
        Some(message) => Err(UpdateError::Worker(message)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeApi, builder};
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    fn write_source(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("batch.csv");
        fs::write(&path, body).unwrap();
        path
    }

    fn options(poll_interval: Duration) -> RunOptions {
        RunOptions {
            poll_interval,
            ..RunOptions::default()
        }
    }

    fn updater(
        api: Arc<FakeApi>,
        input: &Path,
        workers: usize,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> BulkUpdater {
        let request = RunRequest {
            input: input.to_path_buf(),
            workers,
            mode: UpdateMode::Marketplace,
        };
        BulkUpdater::new(
            api,
            Arc::new(builder()),
            &request,
            options,
            &WarehouseSettings::default(),
            cancel,
        )
        .unwrap()
    }

    fn reload(input: &Path) -> Dataset {
        Dataset::load(
            &result_path(input),
            UpdateMode::Marketplace,
            &WarehouseSettings::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn submits_polls_and_persists_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_source(dir.path(), "sku_id,taobao_id\nA1,6001\nA2,6002\nA3,6003\n");
        let api = Arc::new(
            FakeApi::default()
                .with_product("A1")
                .with_product("A2")
                .with_submit_response(
                    "A2",
                    json!({"status": 0, "errorMessageList": ["duplicate"]}),
                )
                .with_statuses("r-A1", vec![json!({"status": "success"})]),
        );

        // A long interval proves no wait happens after the final round.
        let run = updater(
            api.clone(),
            &input,
            2,
            options(Duration::from_secs(3600)),
            CancellationToken::new(),
        );
        let report = tokio::time::timeout(Duration::from_secs(10), run.run())
            .await
            .expect("run must not sleep after the last round")
            .unwrap();

        assert_eq!(report.poll_rounds, 1);
        assert!(!report.cancelled);
        let data = reload(&input);
        assert_eq!(data.status(0), RowStatus::Success);
        assert_eq!(data.value(0, "record_id"), "r-A1");
        assert_eq!(data.status(1), RowStatus::Failed);
        assert_eq!(data.value(1, "error_message"), "duplicate");
        assert_eq!(data.status(2), RowStatus::Failed);
        assert_eq!(data.value(2, "error_message"), "empty search result");
        assert_eq!(api.count("submit:"), 2);
        assert_eq!(api.count("status:"), 1);
    }

    #[tokio::test]
    async fn rerun_leaves_terminal_rows_alone() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_source(dir.path(), "sku_id,taobao_id\nA1,6001\nA2,6002\n");
        let first = Arc::new(
            FakeApi::default()
                .with_product("A1")
                .with_statuses("r-A1", vec![json!({"status": "success"})]),
        );
        updater(first, &input, 2, options(Duration::ZERO), CancellationToken::new())
            .run()
            .await
            .unwrap();

        let second = Arc::new(FakeApi::default().with_product("A1").with_product("A2"));
        let report = updater(
            second.clone(),
            &input,
            2,
            options(Duration::ZERO),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();

        assert!(second.calls().is_empty());
        assert_eq!(report.summary.success, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.poll_rounds, 0);
    }

    #[tokio::test]
    async fn resumes_polling_for_rows_left_updating() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_source(dir.path(), "sku_id,taobao_id\nA1,6001\n");
        fs::write(
            result_path(&input),
            "sku_id,taobao_id,status,record_id,error_message\nA1,6001,updating,r-A1,\n",
        )
        .unwrap();
        let api = Arc::new(
            FakeApi::default().with_statuses("r-A1", vec![json!({"status": "success"})]),
        );
        updater(api.clone(), &input, 1, options(Duration::ZERO), CancellationToken::new())
            .run()
            .await
            .unwrap();
        assert_eq!(api.calls(), vec!["status:r-A1"]);
        assert_eq!(reload(&input).status(0), RowStatus::Success);
    }

    #[tokio::test]
    async fn missing_identifier_fails_without_remote_calls() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_source(dir.path(), "sku_id,taobao_id\n,6001\n");
        let api = Arc::new(FakeApi::default());
        let report = updater(api.clone(), &input, 1, options(Duration::ZERO), CancellationToken::new())
            .run()
            .await
            .unwrap();
        assert!(api.calls().is_empty());
        assert_eq!(report.summary.failed, 1);
        assert_eq!(reload(&input).value(0, "error_message"), "missing identifier");
    }

    #[tokio::test]
    async fn polls_until_terminal_without_trailing_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_source(dir.path(), "sku_id,taobao_id\nA1,6001\n");
        let api = Arc::new(FakeApi::default().with_product("A1").with_statuses(
            "r-A1",
            vec![
                json!({"status": "updating"}),
                json!({"status": "PENDING_REVIEW"}),
                json!({"status": "fail", "rows": [{"errorMessage": "price too low"}, {"errorMessage": "no image"}]}),
            ],
        ));
        let interval = Duration::from_millis(200);
        let started = tokio::time::Instant::now();
        let report = updater(api.clone(), &input, 1, options(interval), CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert_eq!(report.poll_rounds, 3);
        assert_eq!(api.count("status:"), 3);
        assert!(started.elapsed() < interval * 3);
        let data = reload(&input);
        assert_eq!(data.status(0), RowStatus::Failed);
        assert_eq!(data.value(0, "error_message"), "price too low | no image");
    }

    #[tokio::test]
    async fn round_budget_leaves_rows_updating() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_source(dir.path(), "sku_id,taobao_id\nA1,6001\n");
        let api = Arc::new(
            FakeApi::default()
                .with_product("A1")
                .with_statuses("r-A1", vec![json!({"status": "updating"})]),
        );
        let options = RunOptions {
            max_poll_rounds: Some(2),
            ..options(Duration::ZERO)
        };
        let report = updater(api.clone(), &input, 1, options, CancellationToken::new())
            .run()
            .await
            .unwrap();
        assert_eq!(report.poll_rounds, 2);
        assert_eq!(report.summary.updating, 1);
        assert_eq!(reload(&input).value(0, "record_id"), "r-A1");
    }

    #[tokio::test]
    async fn skip_submit_only_polls() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_source(dir.path(), "sku_id,taobao_id\nA1,6001\n");
        let api = Arc::new(FakeApi::default().with_product("A1"));
        let options = RunOptions {
            skip_submit: true,
            ..options(Duration::ZERO)
        };
        let report = updater(api.clone(), &input, 1, options, CancellationToken::new())
            .run()
            .await
            .unwrap();
        assert!(api.calls().is_empty());
        assert_eq!(report.summary.unset, 1);
        assert_eq!(report.output, result_path(&input));
        let saved = reload(&input);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved.status(0), RowStatus::Unset);
    }

    #[tokio::test]
    async fn stop_during_submit_keeps_finished_rows_and_leaves_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = String::from("sku_id,taobao_id\n");
        let mut api = FakeApi::default();
        for n in 1..=10 {
            body.push_str(&format!("S{n},600{n}\n"));
            api = api.with_product(&format!("S{n}"));
        }
        let input = write_source(dir.path(), &body);
        let cancel = CancellationToken::new();
        let api = Arc::new(api.cancel_on_submit(5, cancel.clone()));

        let report = updater(api.clone(), &input, 1, options(Duration::ZERO), cancel)
            .run()
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(api.count("submit:"), 5);
        assert_eq!(api.count("status:"), 0);
        let data = reload(&input);
        for idx in 0..4 {
            assert_eq!(data.status(idx), RowStatus::Updating, "row {}", idx + 1);
        }
        for idx in 4..10 {
            assert_eq!(data.status(idx), RowStatus::Unset, "row {}", idx + 1);
            assert_eq!(data.value(idx, "record_id"), "");
        }
    }

    #[tokio::test]
    async fn failed_login_aborts_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_source(dir.path(), "sku_id,taobao_id\nA1,6001\n");
        let api = Arc::new(FakeApi::default().with_product("A1").with_failing_login());
        let err = updater(api.clone(), &input, 1, options(Duration::ZERO), CancellationToken::new())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Authentication(_)));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_mode_column_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_source(dir.path(), "sku_id,other\nA1,x\n");
        let request = RunRequest {
            input,
            workers: 5,
            mode: UpdateMode::Marketplace,
        };
        let err = BulkUpdater::new(
            Arc::new(FakeApi::default()),
            Arc::new(builder()),
            &request,
            RunOptions::default(),
            &WarehouseSettings::default(),
            CancellationToken::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, UpdateError::Data(DataError::MissingColumn(_))));
    }
}
