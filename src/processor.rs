use crate::dataset::Dataset;
use crate::merchant::models::{ERROR_SEPARATOR, StatusEntry};
use crate::merchant::{MerchantError, ProductApi};
use crate::models::{
    MARKETPLACE_PRODUCT_COLUMN, MARKETPLACE_SKU_COLUMN, RECORD_ID_COLUMN, RowStatus, RowUpdate,
    UpdateMode, WAREHOUSE_COLUMN,
};
use crate::payload::{Linkage, PayloadBuilder, PayloadError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Row-scoped failures. Their `Display` text becomes the row's error message.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("missing identifier")]
    MissingIdentifier,
    #[error("missing {0}")]
    MissingValue(&'static str),
    #[error("missing record id")]
    MissingRecordId,
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Api(#[from] MerchantError),
    #[error("{0}")]
    Rejected(String),
    #[error("update accepted without a record id")]
    AcceptedWithoutRecordId,
    #[error("empty status response")]
    EmptyStatus,
    #[error("stopped before submit")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    /// Nothing to do for this row in the current phase.
    Skipped,
    /// Failed while a stop was in progress; left as it was.
    Unresolved,
    Resolved(RowUpdate),
}

/// Everything a worker needs from its row, copied out before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowJob {
    pub index: usize,
    pub identifier: String,
    pub status: RowStatus,
    pub record_id: String,
    mode: UpdateMode,
    primary: String,
    secondary: String,
}

impl RowJob {
    pub fn from_dataset(data: &Dataset, index: usize, mode: UpdateMode) -> Self {
        let (primary, secondary) = match mode {
            UpdateMode::Marketplace => (
                data.value(index, MARKETPLACE_PRODUCT_COLUMN),
                data.value(index, MARKETPLACE_SKU_COLUMN),
            ),
            UpdateMode::Warehouse => (data.value(index, WAREHOUSE_COLUMN), ""),
        };
        Self {
            index,
            identifier: data.identifier(index).to_string(),
            status: data.status(index),
            record_id: data.value(index, RECORD_ID_COLUMN).trim().to_string(),
            mode,
            primary: primary.to_string(),
            secondary: secondary.to_string(),
        }
    }

    fn linkage(&self) -> Result<Linkage, RowError> {
        match self.mode {
            UpdateMode::Marketplace if self.primary.is_empty() => {
                Err(RowError::MissingValue(MARKETPLACE_PRODUCT_COLUMN))
            }
            UpdateMode::Marketplace => Ok(Linkage::Marketplace {
                product_id: self.primary.clone(),
                sku_id: (!self.secondary.is_empty()).then(|| self.secondary.clone()),
            }),
            UpdateMode::Warehouse if self.primary.is_empty() => {
                Err(RowError::MissingValue(WAREHOUSE_COLUMN))
            }
            UpdateMode::Warehouse => Ok(Linkage::Warehouse {
                warehouse_id: self.primary.clone(),
            }),
        }
    }
}

/// Submit phase for one row: search, build, submit.
pub async fn submit_row(
    api: &dyn ProductApi,
    builder: &PayloadBuilder,
    job: &RowJob,
    cancel: &CancellationToken,
) -> RowOutcome {
    if job.status.is_terminal() || job.status == RowStatus::Updating {
        return RowOutcome::Skipped;
    }
    match try_submit(api, builder, job, cancel).await {
        Ok(record_id) => RowOutcome::Resolved(RowUpdate::updating(record_id)),
        Err(_) if cancel.is_cancelled() => RowOutcome::Unresolved,
        Err(err) => RowOutcome::Resolved(RowUpdate::failed(err.to_string())),
    }
}

async fn try_submit(
    api: &dyn ProductApi,
    builder: &PayloadBuilder,
    job: &RowJob,
    cancel: &CancellationToken,
) -> Result<String, RowError> {
    if job.identifier.is_empty() {
        return Err(RowError::MissingIdentifier);
    }
    let linkage = job.linkage()?;
    let search = api.search(&job.identifier).await?;
    let payload = builder.build(&search, &linkage)?;
    if cancel.is_cancelled() {
        return Err(RowError::Stopped);
    }
    let response = api.submit(&payload).await?;
    if !response.is_accepted() {
        return Err(RowError::Rejected(response.error_text()));
    }
    response.record_id().ok_or(RowError::AcceptedWithoutRecordId)
}

/// Poll phase for one row: fetch and map the backend status.
pub async fn check_row(
    api: &dyn ProductApi,
    job: &RowJob,
    cancel: &CancellationToken,
) -> RowOutcome {
    if job.status != RowStatus::Updating {
        return RowOutcome::Skipped;
    }
    match try_check(api, job).await {
        Ok(update) => RowOutcome::Resolved(update),
        Err(_) if cancel.is_cancelled() => RowOutcome::Unresolved,
        Err(err) => RowOutcome::Resolved(RowUpdate::failed(err.to_string())),
    }
}

async fn try_check(api: &dyn ProductApi, job: &RowJob) -> Result<RowUpdate, RowError> {
    if job.record_id.is_empty() {
        return Err(RowError::MissingRecordId);
    }
    let response = api.fetch_status(&job.record_id).await?;
    let entry = response.first_entry().ok_or(RowError::EmptyStatus)?;
    Ok(map_backend_status(entry))
}

/// Unrecognized backend states count as still updating.
pub fn map_backend_status(entry: &StatusEntry) -> RowUpdate {
    let raw = entry.status.as_deref().unwrap_or("").trim().to_lowercase();
    match raw.as_str() {
        "success" => RowUpdate::success(),
        "fail" | "failed" => {
            let messages = entry.error_messages();
            if messages.is_empty() {
                RowUpdate::failed("update failed")
            } else {
                RowUpdate::failed(messages.join(ERROR_SEPARATOR))
            }
        }
        _ => RowUpdate::still_updating(),
    }
}
