use once_cell::sync::Lazy;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info};
use urlencoding::encode;

pub static USER_API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("MERCHANT_USER_API_ROOT")
        .unwrap_or_else(|_| "https://merchant-user-api.shoalter.com".to_string())
});

pub static PRODUCT_API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("MERCHANT_PRODUCT_API_ROOT")
        .unwrap_or_else(|_| "https://merchant-product-api.shoalter.com".to_string())
});

pub static BU_CODE: Lazy<String> =
    Lazy::new(|| env::var("MERCHANT_BU_CODE").unwrap_or_else(|_| "HKTV".to_string()));

pub const CREDENTIALS_FILE: &str = "account.json";
pub const TEMPLATE_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to locate {file}; tried: {tried}")]
    NotFound { file: &'static str, tried: String },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload template in {} must contain a `product` object", path.display())]
    TemplateShape { path: PathBuf },
}

/// Remote endpoint roots. Defaults come from the process environment.
#[derive(Debug, Clone)]
pub struct ApiEndpoints {
    pub user_root: String,
    pub product_root: String,
    pub bu_code: String,
}

impl ApiEndpoints {
    pub fn from_env() -> Self {
        Self::new(USER_API_ROOT.as_str(), PRODUCT_API_ROOT.as_str())
    }

    pub fn new(user_root: &str, product_root: &str) -> Self {
        Self {
            user_root: user_root.trim_end_matches('/').to_string(),
            product_root: product_root.trim_end_matches('/').to_string(),
            bu_code: BU_CODE.clone(),
        }
    }

    pub fn login_url(&self) -> String {
        format!("{}/user/login/webLogin", self.user_root)
    }

    pub fn search_url(&self) -> String {
        format!("{}/product/storeSkuIdProduct", self.product_root)
    }

    pub fn edit_url(&self) -> String {
        format!("{}/product/single/edit", self.product_root)
    }

    pub fn status_url(&self, record_id: &str) -> String {
        format!(
            "{}/product/checkSaveProductRecordsStatus?recordIds={}",
            self.product_root,
            encode(record_id)
        )
    }
}

#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub account: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarehouseSettings {
    #[serde(default)]
    pub store_front: String,
    #[serde(default)]
    pub replace_dict: HashMap<String, String>,
}

/// Contents of the credentials document plus the label constants used to
/// normalize marketplace and warehouse values.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(rename = "settings")]
    pub credentials: Credentials,
    #[serde(rename = "tmall_label")]
    pub marketplace_label: String,
    #[serde(rename = "toonies", default)]
    pub warehouse: WarehouseSettings,
}

impl Settings {
    pub fn load(config_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let path = locate(CREDENTIALS_FILE, config_dir)?;
        let mut settings: Settings = read_json(&path)?;
        settings.apply_env_overrides();
        info!(target = "bulk.config", path = %path.display(), "settings loaded");
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(account) = env_non_empty("ACCOUNT") {
            self.credentials.account = account;
        }
        if let Some(password) = env_non_empty("PASSWORD") {
            self.credentials.password = password;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff: f64,
}

impl RetryPolicy {
    /// Delay slept after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.initial_delay.mul_f64(self.backoff.max(1.0).powi(exponent))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff: 1.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub retry: RetryPolicy,
    pub token_ttl: Duration,
    pub poll_interval: Duration,
    /// `None` polls until no row is left updating.
    pub max_poll_rounds: Option<u32>,
    pub skip_submit: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            token_ttl: Duration::from_secs(20 * 60),
            poll_interval: Duration::from_secs(30),
            max_poll_rounds: None,
            skip_submit: false,
        }
    }
}

impl RunOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: env_parse::<u32>("API_MAX_ATTEMPTS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.retry.max_attempts),
            initial_delay: env_parse::<f64>("API_INITIAL_DELAY_SECS")
                .filter(|v| *v >= 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.retry.initial_delay),
            backoff: env_parse::<f64>("API_BACKOFF")
                .filter(|v| *v >= 1.0)
                .unwrap_or(defaults.retry.backoff),
        };
        Self {
            retry,
            token_ttl: env_parse::<u64>("TOKEN_TTL_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.token_ttl),
            poll_interval: env_parse::<u64>("POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            max_poll_rounds: env_parse::<u32>("POLL_MAX_ROUNDS"),
            skip_submit: false,
        }
    }
}

/// Finds a configuration document, either in the explicit directory or in
/// `./config`, `.` and the executable's directory, in that order.
pub fn locate(file: &'static str, config_dir: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let candidates = match config_dir {
        Some(dir) => vec![dir.join(file)],
        None => {
            let mut paths = vec![Path::new("config").join(file), PathBuf::from(file)];
            if let Ok(exe) = env::current_exe()
                && let Some(dir) = exe.parent()
            {
                paths.push(dir.join("config").join(file));
                paths.push(dir.join(file));
            }
            paths
        }
    };

    if let Some(found) = candidates.iter().find(|path| path.is_file()) {
        return Ok(found.clone());
    }

    let tried = candidates
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    error!(target = "bulk.config", file, tried = %tried, "configuration document not found");
    Err(ConfigError::NotFound { file, tried })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_document_shape() {
        let raw = serde_json::json!({
            "settings": {"account": "ops@example.com", "password": "secret"},
            "tmall_label": "TMALL",
            "toonies": {"store_front": "H0001_S_", "replace_dict": {"WH-A": "98"}}
        });
        let settings: Settings = serde_json::from_value(raw).expect("settings");
        assert_eq!(settings.credentials.account, "ops@example.com");
        assert_eq!(settings.marketplace_label, "TMALL");
        assert_eq!(settings.warehouse.store_front, "H0001_S_");
        assert_eq!(settings.warehouse.replace_dict["WH-A"], "98");
        assert!(!format!("{settings:?}").contains("secret"));
    }

    #[test]
    fn locate_reports_every_path_tried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = locate(CREDENTIALS_FILE, Some(dir.path())).expect_err("missing");
        match err {
            ConfigError::NotFound { file, tried } => {
                assert_eq!(file, CREDENTIALS_FILE);
                assert!(tried.contains("account.json"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn load_from_explicit_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CREDENTIALS_FILE),
            r#"{"settings":{"account":"a","password":"b"},"tmall_label":"TMALL"}"#,
        )
        .expect("write");
        let settings = Settings::load(Some(dir.path())).expect("load");
        assert_eq!(settings.marketplace_label, "TMALL");
        assert!(settings.warehouse.replace_dict.is_empty());
    }

    #[test]
    fn backoff_grows_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff: 2.0,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn status_url_encodes_record_id() {
        let endpoints = ApiEndpoints::new("http://user/", "http://product");
        assert_eq!(
            endpoints.status_url("a b"),
            "http://product/product/checkSaveProductRecordsStatus?recordIds=a%20b"
        );
        assert_eq!(endpoints.login_url(), "http://user/user/login/webLogin");
    }
}
