pub mod aggregate;
pub mod analytics;
pub mod campaign;
pub mod config;
pub mod date_util;
pub mod diagnose;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod sync;

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub use analytics::{AnalyticsSource, SearchConsoleClient};
pub use campaign::Campaign;
pub use config::SyncSettings;
pub use date_util::Month;
pub use error::{Error, Result};
pub use metrics::{KeywordReport, TrafficReport};
pub use storage::models::SyncRun;
pub use storage::Database;
pub use sync::{
    CampaignReport, Flow, FlowReport, NoopProgress, SyncOptions, SyncProgress, SyncStatus,
};

use storage::repository;
use sync::syncer;

/// Main entry point for the search-performance warehouse.
pub struct GscSync {
    db: Database,
    source: Option<Arc<dyn AnalyticsSource>>,
}

impl GscSync {
    pub fn new(db: Database) -> Self {
        Self { db, source: None }
    }

    /// Use `source` instead of a Search Console client built from settings.
    pub fn with_source(mut self, source: Arc<dyn AnalyticsSource>) -> Self {
        self.source = Some(source);
        self
    }

    fn source_for(&self, settings: &SyncSettings) -> Result<Arc<dyn AnalyticsSource>> {
        if let Some(source) = &self.source {
            return Ok(Arc::clone(source));
        }
        let client =
            SearchConsoleClient::with_base_url(&settings.api_base_url, settings.require_access_token()?)?;
        Ok(Arc::new(client))
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub async fn settings(&self) -> Result<SyncSettings> {
        SyncSettings::load(&self.db).await
    }

    // ── Sync commands ──────────────────────────────────────────────

    /// Sync one campaign. Never fails: lookup and configuration problems come
    /// back as an aborted report.
    pub async fn sync_campaign(
        &self,
        campaign_id: &str,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> CampaignReport {
        let prepared = async {
            let campaign = self.campaign_get(campaign_id).await?;
            let settings = self.settings().await?;
            let source = self.source_for(&settings)?;
            Ok::<_, Error>((campaign, settings, source))
        }
        .await;
        let (campaign, settings, source) = match prepared {
            Ok(v) => v,
            Err(e) => {
                log::error!("Cannot sync {campaign_id}: {e}");
                return CampaignReport::aborted(campaign_id, &e);
            }
        };

        progress.on_campaign_start(campaign_id, 0, 1);
        let report = syncer::sync_campaign(
            &self.db,
            source.as_ref(),
            &campaign,
            &settings,
            options,
            progress,
        )
        .await;
        progress.on_campaign_complete(&report);
        report
    }

    /// Sync every enabled campaign, at most `max_concurrent_campaigns` at a
    /// time. Reports come back in campaign order. Only problems shared by every
    /// campaign (settings, access token, campaign list) are returned as errors.
    pub async fn sync_all(
        &self,
        options: &SyncOptions,
        progress: Arc<dyn SyncProgress>,
    ) -> Result<Vec<CampaignReport>> {
        let settings = self.settings().await?;
        let shared_source = self.source_for(&settings)?;
        let campaigns = self.campaign_list().await?;
        let total = campaigns.len();
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_campaigns));
        log::info!(
            "Syncing {total} campaigns ({} at a time)",
            settings.max_concurrent_campaigns
        );

        let ids: Vec<String> = campaigns.iter().map(|c| c.campaign_id.clone()).collect();
        let mut tasks = JoinSet::new();
        for (i, campaign) in campaigns.into_iter().enumerate() {
            let db = self.db.clone();
            let source = Arc::clone(&shared_source);
            let settings = settings.clone();
            let options = options.clone();
            let progress = Arc::clone(&progress);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                progress.on_campaign_start(&campaign.campaign_id, i, total);
                let report = syncer::sync_campaign(
                    &db,
                    source.as_ref(),
                    &campaign,
                    &settings,
                    &options,
                    progress.as_ref(),
                )
                .await;
                progress.on_campaign_complete(&report);
                (i, report)
            });
        }

        let mut reports: Vec<Option<CampaignReport>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, report)) => reports[i] = Some(report),
                Err(e) => log::error!("Campaign sync task failed: {e}"),
            }
        }
        Ok(reports
            .into_iter()
            .zip(ids)
            .map(|(report, id)| {
                report.unwrap_or_else(|| {
                    CampaignReport::aborted(&id, &Error::Other("sync task did not complete".into()))
                })
            })
            .collect())
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<SyncRun>> {
        let runs = self
            .db
            .reader()
            .call(move |conn| repository::list_recent_sync_runs(conn, limit))
            .await?;
        Ok(runs)
    }

    // ── Campaign commands ──────────────────────────────────────────

    pub async fn campaign_add(&self, campaign: Campaign) -> Result<()> {
        if campaign.campaign_id.trim().is_empty() || campaign.site_url.trim().is_empty() {
            return Err(Error::Input("campaign id and site URL are required".into()));
        }
        self.db
            .writer()
            .call(move |conn| repository::add_campaign(conn, &campaign))
            .await?;
        Ok(())
    }

    pub async fn campaign_get(&self, campaign_id: &str) -> Result<Campaign> {
        let found = self
            .db
            .reader()
            .call({
                let campaign_id = campaign_id.to_string();
                move |conn| repository::get_campaign(conn, &campaign_id)
            })
            .await?;
        found.ok_or_else(|| Error::NotFound(format!("campaign {campaign_id}")))
    }

    pub async fn campaign_list(&self) -> Result<Vec<Campaign>> {
        let campaigns = self
            .db
            .reader()
            .call(|conn| repository::list_campaigns(conn))
            .await?;
        Ok(campaigns)
    }

    // ── Metrics ────────────────────────────────────────────────────

    pub async fn keyword_report(&self, campaign_id: &str, month: Month) -> Result<KeywordReport> {
        let campaign = self.campaign_get(campaign_id).await?;
        metrics::compute_keyword_report(&self.db, &campaign, month).await
    }

    pub async fn traffic_report(&self, campaign_id: &str, today: NaiveDate) -> Result<TrafficReport> {
        let campaign = self.campaign_get(campaign_id).await?;
        metrics::compute_traffic_report(&self.db, &campaign.site_url, today).await
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Store a setting. Known numeric keys are validated first.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        if config::KNOWN_KEYS.contains(&key) {
            SyncSettings::from_pairs([(key.to_string(), value.to_string())].into_iter().collect())?;
        } else {
            log::warn!("Unknown config key '{key}'");
        }
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}
