use crate::{
    config::{ApiEndpoints, RunOptions, Settings},
    merchant::{MerchantClient, ProductApi},
    orchestrator::{BulkUpdater, RunReport, RunRequest},
    payload::{PayloadBuilder, PayloadTemplate},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Receives exactly one terminal notification per run.
pub trait RunListener: Send + Sync {
    fn on_completed(&self, report: &RunReport);
    fn on_failed(&self, message: &str);
    fn on_stopped(&self, report: Option<&RunReport>);
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed { report: RunReport },
    Stopped { report: Option<RunReport> },
    Failed { error: String },
}

/// Everything a run needs that does not change between runs.
#[derive(Clone)]
pub struct Runner {
    settings: Arc<Settings>,
    template: PayloadTemplate,
    endpoints: ApiEndpoints,
    options: RunOptions,
}

impl Runner {
    pub fn new(
        settings: Settings,
        template: PayloadTemplate,
        endpoints: ApiEndpoints,
        options: RunOptions,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            template,
            endpoints,
            options,
        }
    }

    /// Starts a run against the configured merchant backend.
    pub fn start(&self, request: RunRequest, listener: Arc<dyn RunListener>) -> RunHandle {
        let api = Arc::new(MerchantClient::new(
            self.endpoints.clone(),
            self.settings.credentials.clone(),
            &self.options,
        ));
        self.start_with_api(request, api, listener)
    }

    pub fn start_with_api(
        &self,
        request: RunRequest,
        api: Arc<dyn ProductApi>,
        listener: Arc<dyn RunListener>,
    ) -> RunHandle {
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(RunState::Running));
        let builder = Arc::new(PayloadBuilder::new(
            self.template.clone(),
            self.settings.marketplace_label.clone(),
        ));
        let settings = self.settings.clone();
        let options = self.options.clone();
        let task_cancel = cancel.clone();
        let task_state = state.clone();

        let task = tokio::spawn(async move {
            let outcome = match BulkUpdater::new(
                api,
                builder,
                &request,
                options,
                &settings.warehouse,
                task_cancel.clone(),
            ) {
                Ok(updater) => updater.run().await,
                Err(err) => Err(err),
            };

            let next = match outcome {
                Ok(report) if report.cancelled => {
                    warn!(target = "bulk.runner", run_id = %report.run_id, "run stopped");
                    listener.on_stopped(Some(&report));
                    RunState::Stopped {
                        report: Some(report),
                    }
                }
                Ok(report) => {
                    info!(target = "bulk.runner", run_id = %report.run_id, "run completed");
                    listener.on_completed(&report);
                    RunState::Completed { report }
                }
                Err(err) if task_cancel.is_cancelled() => {
                    warn!(target = "bulk.runner", error = %err, "run stopped with error");
                    listener.on_stopped(None);
                    RunState::Stopped { report: None }
                }
                Err(err) => {
                    error!(target = "bulk.runner", error = %err, "run failed");
                    listener.on_failed(&err.to_string());
                    RunState::Failed {
                        error: err.to_string(),
                    }
                }
            };
            *task_state.lock().await = next;
        });

        RunHandle {
            cancel,
            state,
            task,
        }
    }
}

pub struct RunHandle {
    cancel: CancellationToken,
    state: Arc<Mutex<RunState>>,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Signals the run to stop without waiting for it.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Signals the run to stop, then waits until in-flight rows have
    /// drained and the final snapshot is written.
    pub async fn stop(self) -> RunState {
        self.cancel.cancel();
        self.wait().await
    }

    pub async fn wait(self) -> RunState {
        if let Err(err) = self.task.await {
            error!(target = "bulk.runner", error = %err, "run task aborted");
            return RunState::Failed {
                error: err.to_string(),
            };
        }
        self.state.lock().await.clone()
    }
}
