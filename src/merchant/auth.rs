use crate::config::Credentials;
use crate::merchant::MerchantError;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    user_code: &'a str,
    user_pwd: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
}

#[derive(Debug, Clone)]
struct Token {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Token {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Owns the bearer token. Every read and refresh goes through one mutex so
/// a refresh is never observed half-way by a concurrent request.
pub struct TokenProvider {
    http: Client,
    login_url: String,
    credentials: Credentials,
    ttl: Duration,
    state: Mutex<Option<Token>>,
}

impl TokenProvider {
    pub fn new(http: Client, login_url: String, credentials: Credentials, ttl: Duration) -> Self {
        Self {
            http,
            login_url,
            credentials,
            ttl,
            state: Mutex::new(None),
        }
    }

    /// Returns the cached token, logging in first when it is absent or expired.
    pub async fn get(&self) -> Result<String, MerchantError> {
        let mut guard = self.state.lock().await;
        if let Some(token) = guard.as_ref()
            && !token.is_expired()
        {
            return Ok(token.value.clone());
        }
        let token = self.login().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    pub async fn refresh(&self) -> Result<String, MerchantError> {
        let mut guard = self.state.lock().await;
        let token = self.login().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    /// Refreshes after the server rejected `rejected`, unless another caller
    /// already replaced it with a fresh token.
    pub async fn refresh_rejected(&self, rejected: &str) -> Result<(), MerchantError> {
        let mut guard = self.state.lock().await;
        if let Some(current) = guard.as_ref()
            && current.value != rejected
            && !current.is_expired()
        {
            return Ok(());
        }
        *guard = Some(self.login().await?);
        Ok(())
    }

    async fn login(&self) -> Result<Token, MerchantError> {
        let body = LoginRequest {
            user_code: &self.credentials.account,
            user_pwd: &self.credentials.password,
        };
        let response = self
            .http
            .post(&self.login_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| MerchantError::LoginTransport(err.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(MerchantError::Authentication {
                status: status.as_u16(),
                body,
            });
        }

        let payload: LoginResponse = response
            .json()
            .await
            .map_err(|err| MerchantError::LoginTransport(err.to_string()))?;
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(20));
        info!(target = "bulk.auth", account = %self.credentials.account, "token refreshed");
        Ok(Token {
            value: payload.access_token,
            expires_at: Utc::now() + ttl,
        })
    }
}
