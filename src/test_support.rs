//! In-process `ProductApi` used by the processor, orchestrator and runner tests.

use crate::merchant::{MerchantError, ProductApi, SearchResponse, StatusResponse, SubmitResponse};
use crate::payload::{PayloadBuilder, PayloadTemplate};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn builder() -> PayloadBuilder {
    PayloadBuilder::new(
        PayloadTemplate::from_value(json!({
            "product": {
                "sku_id": "",
                "sku_name": "",
                "additional": {
                    "hktv": {"store_sku_id": "", "warehouse_id": "", "external_platform": null}
                }
            }
        }))
        .unwrap(),
        "TMALL",
    )
}

#[derive(Default)]
pub struct FakeApi {
    products: HashMap<String, Value>,
    submit_responses: HashMap<String, Value>,
    statuses: Mutex<HashMap<String, VecDeque<Value>>>,
    failing_search: HashSet<String>,
    failing_login: bool,
    cancel_on_submit: Option<(usize, CancellationToken)>,
    search_delay: Option<Duration>,
    submits: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn with_product(mut self, identifier: &str) -> Self {
        self.products.insert(
            identifier.to_string(),
            json!({
                "sku_id": identifier,
                "sku_name": format!("item {identifier}"),
                "additional": {"hktv": {"store_sku_id": identifier}}
            }),
        );
        self
    }

    pub fn with_submit_response(mut self, identifier: &str, response: Value) -> Self {
        self.submit_responses
            .insert(identifier.to_string(), response);
        self
    }

    /// Each poll pops the next entry; the last one repeats.
    pub fn with_statuses(self, record_id: &str, entries: Vec<Value>) -> Self {
        self.statuses
            .lock()
            .unwrap()
            .insert(record_id.to_string(), entries.into());
        self
    }

    pub fn with_failing_search(mut self, identifier: &str) -> Self {
        self.failing_search.insert(identifier.to_string());
        self
    }

    pub fn with_failing_login(mut self) -> Self {
        self.failing_login = true;
        self
    }

    /// Cancels `token` while the `nth` submit (1-based) is in flight.
    pub fn cancel_on_submit(mut self, nth: usize, token: CancellationToken) -> Self {
        self.cancel_on_submit = Some((nth, token));
        self
    }

    pub fn with_search_delay(mut self, delay: Duration) -> Self {
        self.search_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn request_error(method: &str, url: &str) -> MerchantError {
    MerchantError::Request {
        method: method.to_string(),
        url: url.to_string(),
        status: Some(502),
        attempts: 3,
        detail: "HTTP 502".to_string(),
    }
}

#[async_trait]
impl ProductApi for FakeApi {
    async fn authenticate(&self) -> Result<(), MerchantError> {
        if self.failing_login {
            return Err(MerchantError::Authentication {
                status: 401,
                body: "bad credentials".to_string(),
            });
        }
        Ok(())
    }

    async fn search(&self, identifier: &str) -> Result<SearchResponse, MerchantError> {
        self.record(format!("search:{identifier}"));
        if let Some(delay) = self.search_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_search.contains(identifier) {
            return Err(request_error("POST", "/search"));
        }
        let data = self.products.get(identifier).cloned().into_iter().collect();
        Ok(serde_json::from_value(json!({ "data": Value::Array(data) })).unwrap())
    }

    async fn submit(&self, payload: &Value) -> Result<SubmitResponse, MerchantError> {
        let identifier = payload["product"]["sku_id"].as_str().unwrap_or_default().to_string();
        self.record(format!("submit:{identifier}"));
        let nth = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, token)) = &self.cancel_on_submit
            && *at == nth
        {
            token.cancel();
        }
        let response = self
            .submit_responses
            .get(&identifier)
            .cloned()
            .unwrap_or_else(|| json!({"status": 1, "data": {"recordId": format!("r-{identifier}")}}));
        Ok(serde_json::from_value(response).unwrap())
    }

    async fn fetch_status(&self, record_id: &str) -> Result<StatusResponse, MerchantError> {
        self.record(format!("status:{record_id}"));
        let mut statuses = self.statuses.lock().unwrap();
        let entry = match statuses.get_mut(record_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        let data: Vec<Value> = entry.into_iter().collect();
        Ok(serde_json::from_value(json!({ "data": data })).unwrap())
    }
}
