use chrono::NaiveDate;
use serde::Serialize;

use crate::aggregate::{AggregatedRecord, Weighted};
use crate::date_util::Month;

/// One keyword on one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordDailyStat {
    pub site_url: String,
    pub keyword: String,
    pub date: NaiveDate,
    pub avg_rank: Option<f64>,
    pub search_volume: u64,
    pub clicks: u64,
    pub ctr: f64,
    pub top_page: Option<String>,
}

impl KeywordDailyStat {
    /// A day counts as synced once either rank or page is known.
    pub fn is_populated(&self) -> bool {
        self.avg_rank.is_some() || self.top_page.is_some()
    }
}

impl Weighted for KeywordDailyStat {
    fn impressions(&self) -> u64 {
        self.search_volume
    }
    fn clicks(&self) -> u64 {
        self.clicks
    }
    fn position(&self) -> f64 {
        self.avg_rank.unwrap_or(0.0)
    }
    fn page(&self) -> Option<&str> {
        self.top_page.as_deref()
    }
}

/// One keyword over one calendar month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordMonthlyStat {
    pub site_url: String,
    pub keyword: String,
    pub month: Month,
    pub avg_rank: Option<f64>,
    pub search_volume: u64,
    pub clicks: u64,
    pub ctr: f64,
    pub top_page: Option<String>,
}

impl Weighted for KeywordMonthlyStat {
    fn impressions(&self) -> u64 {
        self.search_volume
    }
    fn clicks(&self) -> u64 {
        self.clicks
    }
    fn position(&self) -> f64 {
        self.avg_rank.unwrap_or(0.0)
    }
    fn page(&self) -> Option<&str> {
        self.top_page.as_deref()
    }
}

/// Per-(site, keyword) baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordAnalyticsRecord {
    pub site_url: String,
    pub keyword: String,
    pub initial_position: Option<f64>,
    pub initial_impressions: Option<u64>,
    pub initial_position_at: Option<String>,
}

/// Site-wide totals for a day or a month.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TrafficStat {
    pub clicks: u64,
    pub impressions: u64,
    pub ctr: f64,
    pub position: f64,
}

impl From<&AggregatedRecord> for TrafficStat {
    fn from(rec: &AggregatedRecord) -> Self {
        Self {
            clicks: rec.clicks,
            impressions: rec.impressions,
            ctr: rec.ctr,
            position: rec.position,
        }
    }
}

impl Weighted for TrafficStat {
    fn impressions(&self) -> u64 {
        self.impressions
    }
    fn clicks(&self) -> u64 {
        self.clicks
    }
    fn position(&self) -> f64 {
        self.position
    }
}

/// Field-wise update for a keyword stat row. `None` leaves the stored value
/// alone; on first insert numeric fields default to zero.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricUpdate {
    pub avg_rank: Option<f64>,
    pub search_volume: Option<u64>,
    pub clicks: Option<u64>,
    pub ctr: Option<f64>,
    pub top_page: Option<String>,
}

impl MetricUpdate {
    /// Rank, volume, clicks and ctr; the stored page is left as is.
    pub fn metrics_only(rec: &AggregatedRecord) -> Self {
        Self {
            avg_rank: Some(rec.position),
            search_volume: Some(rec.impressions),
            clicks: Some(rec.clicks),
            ctr: Some(rec.ctr),
            top_page: None,
        }
    }

    pub fn page_only(page: Option<String>) -> Self {
        Self {
            top_page: page,
            ..Self::default()
        }
    }

    /// Overlay `other` on `self`, field by field.
    pub fn merge(mut self, other: MetricUpdate) -> Self {
        self.avg_rank = other.avg_rank.or(self.avg_rank);
        self.search_volume = other.search_volume.or(self.search_volume);
        self.clicks = other.clicks.or(self.clicks);
        self.ctr = other.ctr.or(self.ctr);
        self.top_page = other.top_page.or(self.top_page);
        self
    }
}

/// Status of a recorded flow run.
#[derive(Debug, Clone)]
pub struct SyncRun {
    pub id: i64,
    pub campaign_id: String,
    pub flow: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub windows_fetched: u32,
    pub windows_skipped: u32,
    pub windows_failed: u32,
    pub records_written: u64,
    pub error_message: Option<String>,
}
