pub mod auth;
pub mod client;
pub mod models;

pub use auth::TokenProvider;
pub use client::MerchantClient;
pub use models::{SearchResponse, StatusResponse, SubmitResponse};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MerchantError {
    #[error("login failed with HTTP {status}: {body}")]
    Authentication { status: u16, body: String },
    #[error("login request failed: {0}")]
    LoginTransport(String),
    #[error("{method} {url} failed after {attempts} attempts: {detail}")]
    Request {
        method: String,
        url: String,
        status: Option<u16>,
        attempts: u32,
        detail: String,
    },
    #[error("invalid response from {url}: {detail}")]
    Decode { url: String, detail: String },
}

/// The three remote product operations a bulk run depends on.
#[async_trait]
pub trait ProductApi: Send + Sync {
    /// Acquires credentials up front so bad logins fail before any dispatch.
    async fn authenticate(&self) -> Result<(), MerchantError>;

    async fn search(&self, identifier: &str) -> Result<SearchResponse, MerchantError>;

    async fn submit(&self, payload: &Value) -> Result<SubmitResponse, MerchantError>;

    async fn fetch_status(&self, record_id: &str) -> Result<StatusResponse, MerchantError>;
}
