use crate::config::{ConfigError, TEMPLATE_FILE, locate, read_json};
use crate::merchant::SearchResponse;
use serde_json::{Map, Value, json};
use std::path::Path;
use thiserror::Error;
use tracing::info;

const PRODUCT_KEY: &str = "product";
const ADDITIONAL_KEY: &str = "additional";
const LINK_TARGET_KEY: &str = "hktv";
const CATEGORY_CODE_KEY: &str = "primary_category_code";
const CATEGORY_KEY: &str = "primary_category";
const WAREHOUSE_KEY: &str = "warehouse_id";
const MARKETPLACE_KEY: &str = "external_platform";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("empty search result")]
    EmptySearchResult,
    #[error("search record is not an object")]
    MalformedRecord,
    #[error("payload template has no `product` object")]
    MissingProduct,
}

/// Mode-specific linkage overlaid on every payload. Exactly one is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Linkage {
    Warehouse {
        warehouse_id: String,
    },
    Marketplace {
        product_id: String,
        sku_id: Option<String>,
    },
}

/// The externally configured request shape. Loaded once, never mutated;
/// every build starts from a deep copy.
#[derive(Debug, Clone)]
pub struct PayloadTemplate {
    document: Value,
}

impl PayloadTemplate {
    pub fn load(config_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let path = locate(TEMPLATE_FILE, config_dir)?;
        let document: Value = read_json(&path)?;
        let template =
            Self::from_value(document).map_err(|_| ConfigError::TemplateShape { path: path.clone() })?;
        info!(target = "bulk.config", path = %path.display(), "payload template loaded");
        Ok(template)
    }

    /// Rejects documents without a `product` object, since the linkage block
    /// could not be applied to them.
    pub fn from_value(document: Value) -> Result<Self, PayloadError> {
        if !document.get(PRODUCT_KEY).is_some_and(Value::is_object) {
            return Err(PayloadError::MissingProduct);
        }
        Ok(Self { document })
    }

    #[cfg(test)]
    pub fn document(&self) -> &Value {
        &self.document
    }
}

pub struct PayloadBuilder {
    template: PayloadTemplate,
    marketplace_label: String,
}

impl PayloadBuilder {
    pub fn new(template: PayloadTemplate, marketplace_label: impl Into<String>) -> Self {
        Self {
            template,
            marketplace_label: marketplace_label.into(),
        }
    }

    /// Merges the first search record into a copy of the template, then
    /// applies the linkage block.
    pub fn build(&self, search: &SearchResponse, linkage: &Linkage) -> Result<Value, PayloadError> {
        let record = search
            .first_record()
            .ok_or(PayloadError::EmptySearchResult)?
            .as_object()
            .ok_or(PayloadError::MalformedRecord)?;

        let mut payload = self.template.document.clone();
        let product = payload
            .get_mut(PRODUCT_KEY)
            .and_then(Value::as_object_mut)
            .ok_or(PayloadError::MissingProduct)?;

        let keys: Vec<String> = product.keys().cloned().collect();
        for key in keys {
            if key == ADDITIONAL_KEY {
                if let Some(target) = link_target_mut(product) {
                    overlay_link_target(target, record);
                }
            } else if let Some(value) = record.get(&key) {
                product.insert(key, value.clone());
            }
        }

        let mut additional = take_object(product, ADDITIONAL_KEY);
        let mut target = take_object(&mut additional, LINK_TARGET_KEY);
        match linkage {
            Linkage::Warehouse { warehouse_id } => {
                target.insert(WAREHOUSE_KEY.to_string(), json!(warehouse_id));
                target.remove(MARKETPLACE_KEY);
            }
            Linkage::Marketplace { product_id, sku_id } => {
                target.remove(WAREHOUSE_KEY);
                target.insert(
                    MARKETPLACE_KEY.to_string(),
                    json!({
                        "source": [self.marketplace_label],
                        "product_id": product_id,
                        "sku_id": sku_id,
                    }),
                );
            }
        }
        additional.insert(LINK_TARGET_KEY.to_string(), Value::Object(target));
        product.insert(ADDITIONAL_KEY.to_string(), Value::Object(additional));
        Ok(payload)
    }
}

fn link_target_mut(product: &mut Map<String, Value>) -> Option<&mut Map<String, Value>> {
    product
        .get_mut(ADDITIONAL_KEY)?
        .as_object_mut()?
        .get_mut(LINK_TARGET_KEY)?
        .as_object_mut()
}

fn take_object(map: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match map.remove(key) {
        Some(Value::Object(inner)) => inner,
        _ => Map::new(),
    }
}

/// Only keys present in both the template and the source are copied. The
/// category code is derived from the source's nested category object.
fn overlay_link_target(target: &mut Map<String, Value>, record: &Map<String, Value>) {
    let Some(source) = record
        .get(ADDITIONAL_KEY)
        .and_then(|a| a.get(LINK_TARGET_KEY))
        .and_then(Value::as_object)
    else {
        return;
    };

    let keys: Vec<String> = target.keys().cloned().collect();
    for key in keys {
        if key == CATEGORY_CODE_KEY {
            let code = source
                .get(CATEGORY_KEY)
                .and_then(|c| c.get("category_code"))
                .filter(|c| !c.is_null() && c.as_str() != Some(""));
            if let Some(code) = code {
                target.insert(key, code.clone());
            }
        } else if let Some(value) = source.get(&key) {
            target.insert(key, value.clone());
        }
    }
}
