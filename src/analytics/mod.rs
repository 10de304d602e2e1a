pub mod client;
pub mod retry;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::date_util::parse_date_key;
use crate::error::{Error, Result};
use crate::sync::windows::DateWindow;

pub use client::SearchConsoleClient;
pub use retry::{fetch_rows, FetchPolicy};

/// A Search Console grouping dimension. Order in a request is significant:
/// row `keys` come back in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Date,
    Query,
    Page,
}

/// One raw row as returned by `searchAnalytics.query`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalyticsRow {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub clicks: f64,
    #[serde(default)]
    pub impressions: f64,
    #[serde(default)]
    pub ctr: f64,
    #[serde(default)]
    pub position: f64,
}

/// A fetch for one site over one half-open window.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsRequest {
    pub site_url: String,
    pub window: DateWindow,
    pub dimensions: Vec<Dimension>,
    pub wait_for_all_data: bool,
}

impl AnalyticsRequest {
    pub fn new(site_url: &str, window: DateWindow, dimensions: &[Dimension]) -> Self {
        Self {
            site_url: site_url.to_string(),
            window,
            dimensions: dimensions.to_vec(),
            wait_for_all_data: true,
        }
    }

    pub fn describe(&self) -> String {
        let dims: Vec<&str> = self
            .dimensions
            .iter()
            .map(|d| match d {
                Dimension::Date => "date",
                Dimension::Query => "query",
                Dimension::Page => "page",
            })
            .collect();
        format!("{} {} [{}]", self.site_url, self.window, dims.join(","))
    }
}

/// A raw row with its keys resolved against the requested dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceRow {
    pub date: Option<NaiveDate>,
    pub query: Option<String>,
    pub page: Option<String>,
    pub clicks: u64,
    pub impressions: u64,
    pub position: f64,
}

impl PerformanceRow {
    /// Resolve `row.keys` positionally against `dimensions`. Queries are
    /// normalized so they compare equal to tracked keywords.
    pub fn from_raw(row: &AnalyticsRow, dimensions: &[Dimension]) -> Result<Self> {
        if row.keys.len() != dimensions.len() {
            return Err(Error::fetch(
                crate::error::FetchErrorKind::Decode,
                format!(
                    "row has {} keys but {} dimensions were requested",
                    row.keys.len(),
                    dimensions.len()
                ),
            ));
        }
        let mut out = PerformanceRow {
            date: None,
            query: None,
            page: None,
            clicks: count(row.clicks),
            impressions: count(row.impressions),
            position: row.position,
        };
        for (dim, key) in dimensions.iter().zip(&row.keys) {
            match dim {
                Dimension::Date => out.date = Some(parse_date_key(key)?),
                Dimension::Query => out.query = Some(crate::campaign::normalize_keyword(key)),
                Dimension::Page => out.page = Some(key.clone()),
            }
        }
        Ok(out)
    }
}

fn count(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 {
        v.round() as u64
    } else {
        0
    }
}

/// The external search-analytics collaborator.
///
/// `Ok(None)` means the source has no data for the window; callers treat it
/// like an empty row set.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    async fn get_analytics(&self, request: &AnalyticsRequest) -> Result<Option<Vec<AnalyticsRow>>>;
}
