use crate::config::{ApiEndpoints, Credentials, RetryPolicy, RunOptions};
use crate::http::build_client;
use crate::merchant::{
    MerchantError, ProductApi, SearchResponse, StatusResponse, SubmitResponse, TokenProvider,
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Why a single attempt failed. Every variant is retried.
#[derive(Debug, Error)]
enum AttemptFailure {
    #[error("{0}")]
    Auth(MerchantError),
    #[error("unauthorized, token refreshed")]
    Unauthorized,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response is not json: {0}")]
    Body(String),
}

impl AttemptFailure {
    fn status(&self) -> Option<u16> {
        match self {
            AttemptFailure::Unauthorized => Some(StatusCode::UNAUTHORIZED.as_u16()),
            AttemptFailure::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub struct MerchantClient {
    http: Client,
    endpoints: ApiEndpoints,
    tokens: TokenProvider,
    retry: RetryPolicy,
}

impl MerchantClient {
    pub fn new(endpoints: ApiEndpoints, credentials: Credentials, options: &RunOptions) -> Self {
        let http = build_client();
        let tokens = TokenProvider::new(
            http.clone(),
            endpoints.login_url(),
            credentials,
            options.token_ttl,
        );
        Self {
            http,
            endpoints,
            tokens,
            retry: options.retry,
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<T, MerchantError> {
        let mut attempt = 0;
        let value = loop {
            attempt += 1;
            match self.attempt(method.clone(), url, body).await {
                Ok(value) => break value,
                Err(failure) if attempt >= self.retry.max_attempts => {
                    return Err(MerchantError::Request {
                        method: method.to_string(),
                        url: url.to_string(),
                        status: failure.status(),
                        attempts: attempt,
                        detail: failure.to_string(),
                    });
                }
                Err(failure) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        target = "bulk.api",
                        method = %method,
                        url,
                        attempt,
                        error = %failure,
                        "request attempt failed, retrying in {delay:?}"
                    );
                    sleep(delay).await;
                }
            }
        };
        serde_json::from_value(value).map_err(|err| MerchantError::Decode {
            url: url.to_string(),
            detail: err.to_string(),
        })
    }

    async fn attempt(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, AttemptFailure> {
        let token = self.tokens.get().await.map_err(AttemptFailure::Auth)?;
        let mut request = self.http.request(method, url).bearer_auth(&token);
        if let Some(payload) = body {
            request = request.json(payload);
        }
        let response = request
            .send()
            .await
            .map_err(|err| AttemptFailure::Transport(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.tokens
                .refresh_rejected(&token)
                .await
                .map_err(AttemptFailure::Auth)?;
            return Err(AttemptFailure::Unauthorized);
        }

        let text = response
            .text()
            .await
            .map_err(|err| AttemptFailure::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(AttemptFailure::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        debug!(target = "bulk.api", url, status = status.as_u16(), "response received");
        serde_json::from_str(&text).map_err(|err| AttemptFailure::Body(err.to_string()))
    }
}

#[async_trait]
impl ProductApi for MerchantClient {
    async fn authenticate(&self) -> Result<(), MerchantError> {
        self.tokens.refresh().await.map(|_| ())
    }

    async fn search(&self, identifier: &str) -> Result<SearchResponse, MerchantError> {
        let body = json!({
            "bu_code": self.endpoints.bu_code,
            "store_sku_ids": [identifier],
        });
        self.request(Method::POST, &self.endpoints.search_url(), Some(&body))
            .await
    }

    async fn submit(&self, payload: &Value) -> Result<SubmitResponse, MerchantError> {
        self.request(Method::POST, &self.endpoints.edit_url(), Some(payload))
            .await
    }

    async fn fetch_status(&self, record_id: &str) -> Result<StatusResponse, MerchantError> {
        self.request(Method::GET, &self.endpoints.status_url(record_id), None)
            .await
    }
}
