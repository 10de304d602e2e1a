pub mod completeness;
pub mod syncer;
pub mod windows;

use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::sync::windows::DateWindow;

/// The four independent flows run for every campaign, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    DailyIncremental,
    HistoricalBackfill,
    InitialPosition,
    TrafficSync,
}

impl Flow {
    pub const ALL: [Flow; 4] = [
        Flow::DailyIncremental,
        Flow::HistoricalBackfill,
        Flow::InitialPosition,
        Flow::TrafficSync,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Flow::DailyIncremental => "daily_incremental",
            Flow::HistoricalBackfill => "historical_backfill",
            Flow::InitialPosition => "initial_position",
            Flow::TrafficSync => "traffic_sync",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "daily" | "daily_incremental" => Ok(Flow::DailyIncremental),
            "backfill" | "historical_backfill" => Ok(Flow::HistoricalBackfill),
            "initial" | "initial_position" => Ok(Flow::InitialPosition),
            "traffic" | "traffic_sync" => Ok(Flow::TrafficSync),
            other => Err(Error::Input(format!("unknown flow: {other}"))),
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options controlling a sync operation.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Flows to run; always executed in [`Flow::ALL`] order.
    pub flows: Vec<Flow>,
    /// Pin "today" (tests, replays). Defaults to the local date.
    pub today: Option<NaiveDate>,
    /// Observed between backfill months.
    pub cancel: CancellationToken,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            flows: Flow::ALL.to_vec(),
            today: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl SyncOptions {
    pub fn today(&self) -> NaiveDate {
        self.today
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    pub fn runs(&self, flow: Flow) -> bool {
        self.flows.contains(&flow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Success => "completed",
            SyncStatus::PartialFailure => "partial_failure",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one flow for one campaign.
#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    pub flow: Flow,
    pub status: SyncStatus,
    pub windows_fetched: u32,
    pub windows_skipped: u32,
    pub windows_failed: u32,
    pub records_written: u64,
    pub error: Option<String>,
}

impl FlowReport {
    pub fn new(flow: Flow) -> Self {
        Self {
            flow,
            status: SyncStatus::Success,
            windows_fetched: 0,
            windows_skipped: 0,
            windows_failed: 0,
            records_written: 0,
            error: None,
        }
    }

    /// Derive the status from the window counts.
    pub fn finish(mut self) -> Self {
        if self.status == SyncStatus::Cancelled {
            return self;
        }
        self.status = if self.windows_failed == 0 {
            SyncStatus::Success
        } else if self.windows_fetched > 0 || self.windows_skipped > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        };
        if self.windows_failed > 0 && self.error.is_none() {
            self.error = Some(format!("{} windows failed", self.windows_failed));
        }
        self
    }

    pub fn failed(flow: Flow, error: &Error) -> Self {
        Self {
            status: SyncStatus::Failed,
            error: Some(error.to_string()),
            ..Self::new(flow)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == SyncStatus::Success
    }
}

/// Outcome of all requested flows for one campaign.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub campaign_id: String,
    pub flows: Vec<FlowReport>,
    /// Set when the campaign could not be synced at all.
    pub error: Option<String>,
}

impl CampaignReport {
    pub fn aborted(campaign_id: &str, error: &Error) -> Self {
        Self {
            campaign_id: campaign_id.to_string(),
            flows: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.flows.iter().all(FlowReport::succeeded)
    }

    pub fn flow(&self, flow: Flow) -> Option<&FlowReport> {
        self.flows.iter().find(|r| r.flow == flow)
    }
}

/// Progress callbacks for long syncs. All methods default to no-ops.
pub trait SyncProgress: Send + Sync {
    fn on_campaign_start(&self, _campaign_id: &str, _index: usize, _total: usize) {}
    fn on_window(&self, _campaign_id: &str, _flow: Flow, _window: &DateWindow, _skipped: bool) {}
    fn on_flow_complete(&self, _campaign_id: &str, _report: &FlowReport) {}
    fn on_campaign_complete(&self, _report: &CampaignReport) {}
}

pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
