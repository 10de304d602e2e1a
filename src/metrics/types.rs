use serde::Serialize;

/// One tracked keyword over one month, ready for display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeywordMonthMetrics {
    pub keyword: String,
    /// `None` when the month has no stored row, `0.0` when it had no impressions.
    pub avg_rank: Option<f64>,
    pub search_volume: u64,
    pub clicks: u64,
    /// Percentage, one decimal.
    pub ctr_pct: f64,
    pub top_page: Option<String>,
    pub initial_position: Option<f64>,
    /// `initial - current`; positive means the keyword moved up.
    pub position_change: Option<f64>,
}

/// Impression-weighted totals across a set of rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Totals {
    pub impressions: u64,
    pub clicks: u64,
    pub ctr_pct: f64,
    pub avg_position: f64,
}

/// Keyword report for a campaign and month.
#[derive(Debug, Clone, Serialize)]
pub struct KeywordReport {
    pub campaign_id: String,
    pub site_url: String,
    pub month: String,
    pub keywords: Vec<KeywordMonthMetrics>,
    pub totals: Totals,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficPeriod {
    /// `YYYY-MM` for months, `YYYY-MM-DD` for days.
    pub period_key: String,
    pub clicks: u64,
    pub impressions: u64,
    pub ctr_pct: f64,
    pub position: f64,
}

/// Site traffic: stored monthly history plus the current month to date.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficReport {
    pub site_url: String,
    pub months: Vec<TrafficPeriod>,
    pub current_month: Vec<TrafficPeriod>,
    pub month_to_date: Totals,
}
