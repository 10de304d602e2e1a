use std::collections::HashMap;
use std::time::Duration;

use crate::analytics::client::DEFAULT_API_BASE;
use crate::analytics::FetchPolicy;
use crate::error::{Error, Result};
use crate::storage::{repository, Database};
use crate::sync::windows::DEFAULT_REPORTING_LAG_DAYS;

/// Env var that takes precedence over the stored `access_token`.
pub const ACCESS_TOKEN_ENV: &str = "GSCSYNC_ACCESS_TOKEN";

/// Keys understood in `app_config`.
pub const KNOWN_KEYS: &[&str] = &[
    "reporting_lag_days",
    "fetch_timeout_secs",
    "fetch_max_retries",
    "retry_backoff_secs",
    "max_concurrent_campaigns",
    "api_base_url",
    "access_token",
];

/// Typed view over `app_config`, with defaults for anything unset.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub reporting_lag_days: i64,
    pub fetch: FetchPolicy,
    pub max_concurrent_campaigns: usize,
    pub api_base_url: String,
    pub access_token: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            reporting_lag_days: DEFAULT_REPORTING_LAG_DAYS,
            fetch: FetchPolicy::default(),
            max_concurrent_campaigns: 4,
            api_base_url: DEFAULT_API_BASE.to_string(),
            access_token: None,
        }
    }
}

impl SyncSettings {
    pub async fn load(db: &Database) -> Result<Self> {
        let pairs = db.reader().call(|conn| repository::list_config(conn)).await?;
        let mut settings = Self::from_pairs(pairs.into_iter().collect())?;
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            if !token.trim().is_empty() {
                settings.access_token = Some(token);
            }
        }
        Ok(settings)
    }

    pub fn from_pairs(pairs: HashMap<String, String>) -> Result<Self> {
        let mut s = Self::default();
        if let Some(v) = pairs.get("reporting_lag_days") {
            s.reporting_lag_days = i64::from(parse_num::<u32>(v, "reporting_lag_days")?);
        }
        if let Some(v) = pairs.get("fetch_timeout_secs") {
            s.fetch.timeout = Duration::from_secs(parse_num(v, "fetch_timeout_secs")?);
        }
        if let Some(v) = pairs.get("fetch_max_retries") {
            s.fetch.max_retries = parse_num(v, "fetch_max_retries")?;
        }
        if let Some(v) = pairs.get("retry_backoff_secs") {
            s.fetch.backoff = Duration::from_secs(parse_num(v, "retry_backoff_secs")?);
        }
        if let Some(v) = pairs.get("max_concurrent_campaigns") {
            s.max_concurrent_campaigns = parse_num::<usize>(v, "max_concurrent_campaigns")?.max(1);
        }
        if let Some(v) = pairs.get("api_base_url") {
            s.api_base_url = v.clone();
        }
        if let Some(v) = pairs.get("access_token") {
            s.access_token = Some(v.clone());
        }
        Ok(s)
    }

    pub fn require_access_token(&self) -> Result<&str> {
        self.access_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no access token. Run: gscsync config set access_token <TOKEN> (or set {ACCESS_TOKEN_ENV})"
                ))
            })
    }
}

fn parse_num<T: std::str::FromStr>(v: &str, key: &str) -> Result<T> {
    v.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a non-negative number, got '{v}'")))
}
