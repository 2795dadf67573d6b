use reqwest::{
    Client,
    header::{ACCEPT, HeaderMap, HeaderValue},
};
use std::time::Duration;

/// Shared client for every merchant call. Timeouts come from
/// `HTTP_TIMEOUT_SECS` and `HTTP_CONNECT_TIMEOUT_SECS`.
pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(60);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10);
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}
