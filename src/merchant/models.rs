use serde::Deserialize;
use serde_json::Value;

pub const ERROR_SEPARATOR: &str = " | ";

/// Response of `POST /product/storeSkuIdProduct`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub data: Option<Vec<Value>>,
}

impl SearchResponse {
    pub fn first_record(&self) -> Option<&Value> {
        self.data.as_ref().and_then(|records| records.first())
    }
}

/// Response of `POST /product/single/edit`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(default)]
    pub status: Value,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error_message_list: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SubmitResponse {
    /// The backend signals acceptance with `status: 1`.
    pub fn is_accepted(&self) -> bool {
        match &self.status {
            Value::Number(n) => n.as_i64() == Some(1),
            Value::String(s) => s.trim() == "1",
            Value::Bool(b) => *b,
            _ => false,
        }
    }

    pub fn record_id(&self) -> Option<String> {
        let raw = self.data.as_ref()?.get("recordId")?;
        let id = match raw {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!id.is_empty()).then_some(id)
    }

    /// Server-provided rejection text: the error list when present, else `message`.
    pub fn error_text(&self) -> String {
        let from_list = self
            .error_message_list
            .as_ref()
            .map(collect_messages)
            .filter(|messages| !messages.is_empty())
            .map(|messages| messages.join(ERROR_SEPARATOR));
        from_list
            .or_else(|| {
                self.message
                    .as_ref()
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
            })
            .unwrap_or_else(|| "update rejected".to_string())
    }
}

fn collect_messages(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().flat_map(collect_messages).collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Value::Object(map) => ["errorMessage", "message"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(|m| vec![m.to_string()])
            .unwrap_or_else(|| vec![value.to_string()]),
        Value::Null | Value::String(_) => Vec::new(),
        other => vec![other.to_string()],
    }
}

/// Response of `GET /product/checkSaveProductRecordsStatus`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub data: Option<Vec<StatusEntry>>,
}

impl StatusResponse {
    pub fn first_entry(&self) -> Option<&StatusEntry> {
        self.data.as_ref().and_then(|entries| entries.first())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusEntry {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub rows: Option<Vec<StatusRow>>,
}

impl StatusEntry {
    pub fn error_messages(&self) -> Vec<String> {
        self.rows
            .iter()
            .flatten()
            .filter_map(|row| row.error_message.as_deref())
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRow {
    #[serde(default)]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submit_acceptance_and_record_id() {
        let resp: SubmitResponse =
            serde_json::from_value(json!({"status": 1, "data": {"recordId": 9912}})).unwrap();
        assert!(resp.is_accepted());
        assert_eq!(resp.record_id().as_deref(), Some("9912"));
    }

    #[test]
    fn submit_error_text_prefers_list() {
        let resp: SubmitResponse = serde_json::from_value(json!({
            "status": -1,
            "errorMessageList": ["duplicate", {"errorMessage": "bad price"}],
            "message": "ignored"
        }))
        .unwrap();
        assert!(!resp.is_accepted());
        assert_eq!(resp.error_text(), "duplicate | bad price");

        let resp: SubmitResponse =
            serde_json::from_value(json!({"status": 0, "message": "locked"})).unwrap();
        assert_eq!(resp.error_text(), "locked");
    }

    #[test]
    fn status_entry_collects_row_messages() {
        let resp: StatusResponse = serde_json::from_value(json!({
            "data": [{"status": "FAIL", "rows": [{"errorMessage": "a"}, {"errorMessage": null}, {"errorMessage": "b"}]}]
        }))
        .unwrap();
        let entry = resp.first_entry().unwrap();
        assert_eq!(entry.error_messages(), vec!["a", "b"]);
    }
}
