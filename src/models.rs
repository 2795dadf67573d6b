use clap::ValueEnum;
use serde::Serialize;

pub const STATUS_COLUMN: &str = "status";
pub const RECORD_ID_COLUMN: &str = "record_id";
pub const ERROR_COLUMN: &str = "error_message";
pub const TRACKED_COLUMNS: [&str; 3] = [STATUS_COLUMN, RECORD_ID_COLUMN, ERROR_COLUMN];

/// Accepted spellings of the identifier column, in lookup order.
pub const IDENTIFIER_COLUMNS: [&str; 2] = ["sku id", "sku_id"];
pub const MARKETPLACE_PRODUCT_COLUMN: &str = "taobao_id";
pub const MARKETPLACE_SKU_COLUMN: &str = "taobao_sku_id";
pub const WAREHOUSE_COLUMN: &str = "warehouse";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    #[default]
    Unset,
    Updating,
    Success,
    Failed,
}

impl RowStatus {
    /// Unknown or blank values load as `Unset` so the row is processed.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "updating" => RowStatus::Updating,
            "success" => RowStatus::Success,
            "failed" | "fail" => RowStatus::Failed,
            _ => RowStatus::Unset,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Unset => "",
            RowStatus::Updating => "updating",
            RowStatus::Success => "success",
            RowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RowStatus::Success | RowStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UpdateMode {
    /// Link each product to an external marketplace listing.
    #[value(alias = "taobao")]
    Marketplace,
    /// Assign each product to a warehouse.
    Warehouse,
}

impl UpdateMode {
    /// Mode-specific columns that must exist alongside the identifier.
    pub fn required_columns(&self) -> &'static [&'static str] {
        match self {
            UpdateMode::Marketplace => &[MARKETPLACE_PRODUCT_COLUMN],
            UpdateMode::Warehouse => &[WAREHOUSE_COLUMN],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateMode::Marketplace => "marketplace",
            UpdateMode::Warehouse => "warehouse",
        }
    }
}

/// What a worker writes back into its own row's tracked columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    pub status: RowStatus,
    pub record_id: Option<String>,
    pub error_message: Option<String>,
}

impl RowUpdate {
    pub fn updating(record_id: impl Into<String>) -> Self {
        Self {
            status: RowStatus::Updating,
            record_id: Some(record_id.into()),
            error_message: None,
        }
    }

    pub fn success() -> Self {
        Self {
            status: RowStatus::Success,
            record_id: None,
            error_message: None,
        }
    }

    pub fn still_updating() -> Self {
        Self {
            status: RowStatus::Updating,
            record_id: None,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RowStatus::Failed,
            record_id: None,
            error_message: Some(message.into()),
        }
    }
}

/// Counts reported at the end of each phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub unset: usize,
    pub updating: usize,
    pub success: usize,
    pub failed: usize,
}

impl StatusSummary {
    pub fn record(&mut self, status: RowStatus) {
        match status {
            RowStatus::Unset => self.unset += 1,
            RowStatus::Updating => self.updating += 1,
            RowStatus::Success => self.success += 1,
            RowStatus::Failed => self.failed += 1,
        }
    }
}
