use std::collections::HashSet;

use chrono::NaiveDate;
use indexmap::IndexMap;
use rusqlite::Connection;

use crate::aggregate::{
    aggregate, best_pages, by_date, by_date_query, by_month, by_query, zero_fill, AggregatedRecord,
};
use crate::analytics::{fetch_rows, AnalyticsRequest, AnalyticsSource, Dimension, FetchPolicy, PerformanceRow};
use crate::campaign::Campaign;
use crate::config::SyncSettings;
use crate::date_util::Month;
use crate::error::{Error, Result};
use crate::storage::models::{KeywordDailyStat, MetricUpdate, TrafficStat};
use crate::storage::repository::{self, BatchOutcome};
use crate::storage::Database;
use crate::sync::completeness::{CompletenessChecker, Scope};
use crate::sync::windows::{DateWindow, RangeFetchCoordinator, INITIAL_POSITION_DAYS};
use crate::sync::{CampaignReport, Flow, FlowReport, SyncOptions, SyncProgress, SyncStatus};

const KEYWORD_DIMS: &[Dimension] = &[Dimension::Query];
const KEYWORD_PAGE_DIMS: &[Dimension] = &[Dimension::Query, Dimension::Page];
const DAILY_KEYWORD_DIMS: &[Dimension] = &[Dimension::Date, Dimension::Query];
const DAILY_KEYWORD_PAGE_DIMS: &[Dimension] = &[Dimension::Date, Dimension::Query, Dimension::Page];
const SITE_DIMS: &[Dimension] = &[Dimension::Date];

/// Everything a flow needs for one campaign.
struct FlowContext<'a> {
    db: &'a Database,
    source: &'a dyn AnalyticsSource,
    policy: &'a FetchPolicy,
    campaign: &'a Campaign,
    keywords: Vec<String>,
    tracked: HashSet<String>,
    coordinator: RangeFetchCoordinator,
    options: &'a SyncOptions,
    progress: &'a dyn SyncProgress,
}

impl<'a> FlowContext<'a> {
    fn checker(&self) -> CompletenessChecker<'a> {
        CompletenessChecker::new(
            self.db,
            &self.campaign.campaign_id,
            &self.campaign.site_url,
            &self.keywords,
        )
    }

    async fn fetch(&self, window: DateWindow, dims: &[Dimension]) -> Result<Vec<PerformanceRow>> {
        let request = AnalyticsRequest::new(&self.campaign.site_url, window, dims);
        log::debug!("Fetching {}", request.describe());
        fetch_rows(self.source, &request, self.policy).await
    }

    fn is_tracked(&self, query: &str) -> bool {
        self.tracked.contains(query)
    }

    fn tracked_query(&self, r: &PerformanceRow) -> Option<String> {
        by_query(r).filter(|q| self.is_tracked(q))
    }

    fn tracked_date_query(&self, r: &PerformanceRow) -> Option<(NaiveDate, String)> {
        by_date_query(r).filter(|(_, q)| self.is_tracked(q))
    }

    fn report_window(&self, flow: Flow, window: &DateWindow, skipped: bool) {
        self.progress
            .on_window(&self.campaign.campaign_id, flow, window, skipped);
    }
}

/// Run the requested flows for one campaign, in [`Flow::ALL`] order.
///
/// A flow that fails is logged and recorded and the next flow still runs.
/// Configuration errors abort the whole campaign.
pub async fn sync_campaign(
    db: &Database,
    source: &dyn AnalyticsSource,
    campaign: &Campaign,
    settings: &SyncSettings,
    options: &SyncOptions,
    progress: &dyn SyncProgress,
) -> CampaignReport {
    if let Err(e) = campaign
        .require_start_date()
        .and_then(|_| campaign.require_linked_account().map(|_| ()))
    {
        log::error!("Skipping campaign {}: {e}", campaign.campaign_id);
        return CampaignReport::aborted(&campaign.campaign_id, &e);
    }

    let keywords = campaign.keywords();
    if keywords.is_empty() {
        log::warn!("Campaign {} tracks no keywords", campaign.campaign_id);
    }
    let ctx = FlowContext {
        db,
        source,
        policy: &settings.fetch,
        campaign,
        tracked: keywords.iter().cloned().collect(),
        keywords,
        coordinator: RangeFetchCoordinator::new(options.today(), settings.reporting_lag_days),
        options,
        progress,
    };

    let mut report = CampaignReport {
        campaign_id: campaign.campaign_id.clone(),
        flows: Vec::new(),
        error: None,
    };

    for flow in Flow::ALL.into_iter().filter(|f| options.runs(*f)) {
        match run_flow(&ctx, flow).await {
            Ok(flow_report) => {
                progress.on_flow_complete(&campaign.campaign_id, &flow_report);
                report.flows.push(flow_report);
            }
            Err(e) => {
                log::error!("Aborting campaign {}: {e}", campaign.campaign_id);
                report.flows.push(FlowReport::failed(flow, &e));
                report.error = Some(e.to_string());
                break;
            }
        }
    }

    report
}

/// Run one flow and record it in `sync_runs`. Only configuration errors are
/// returned; anything else becomes a failed report.
async fn run_flow(ctx: &FlowContext<'_>, flow: Flow) -> Result<FlowReport> {
    let campaign_id = ctx.campaign.campaign_id.clone();
    let run_id = ctx
        .db
        .writer()
        .call({
            let campaign_id = campaign_id.clone();
            move |conn| repository::insert_sync_run(conn, &campaign_id, flow.as_str())
        })
        .await;
    let run_id = match run_id {
        Ok(id) => Some(id),
        Err(e) => {
            log::warn!("Could not record {flow} run for {campaign_id}: {e}");
            None
        }
    };

    log::info!("{campaign_id}: starting {flow}");
    let result = match flow {
        Flow::DailyIncremental => sync_daily_incremental(ctx).await,
        Flow::HistoricalBackfill => sync_historical_backfill(ctx).await,
        Flow::InitialPosition => sync_initial_position(ctx).await,
        Flow::TrafficSync => sync_traffic(ctx).await,
    };

    let report = match &result {
        Ok(report) => report.clone(),
        Err(e) => {
            log::error!("{campaign_id}: {flow} failed: {e}");
            FlowReport::failed(flow, e)
        }
    };
    log::info!(
        "{campaign_id}: {flow} {} ({} fetched, {} skipped, {} failed, {} records)",
        report.status.as_str(),
        report.windows_fetched,
        report.windows_skipped,
        report.windows_failed,
        report.records_written
    );

    if let Some(run_id) = run_id {
        let finished = ctx
            .db
            .writer()
            .call({
                let report = report.clone();
                move |conn| {
                    repository::finish_sync_run(
                        conn,
                        run_id,
                        report.status.as_str(),
                        report.windows_fetched,
                        report.windows_skipped,
                        report.windows_failed,
                        report.records_written,
                        report.error.as_deref(),
                    )
                }
            })
            .await;
        if let Err(e) = finished {
            log::warn!("Could not finish {flow} run for {campaign_id}: {e}");
        }
    }

    match result {
        Err(e) if e.is_config() => Err(e),
        _ => Ok(report),
    }
}

/// Count a window's outcome on `report`. Configuration errors propagate.
fn tally(report: &mut FlowReport, flow: Flow, window: &DateWindow, outcome: Result<BatchOutcome>) -> Result<bool> {
    match outcome {
        Ok(batch) if batch.failed == 0 => {
            report.windows_fetched += 1;
            report.records_written += batch.written;
            Ok(true)
        }
        Ok(batch) => {
            log::warn!("{flow} {window}: {} records failed to write", batch.failed);
            report.windows_failed += 1;
            report.records_written += batch.written;
            Ok(false)
        }
        Err(e) if e.is_config() => Err(e),
        Err(e) => {
            log::warn!("{flow} {window} failed: {e}");
            report.windows_failed += 1;
            report.error = Some(e.to_string());
            Ok(false)
        }
    }
}

/// Join per-key metrics with per-key best pages into field updates.
fn merge_updates<'a, K: std::hash::Hash + Eq>(
    metrics: &'a IndexMap<K, AggregatedRecord>,
    pages: &'a IndexMap<K, AggregatedRecord>,
) -> Vec<(&'a K, MetricUpdate)> {
    metrics
        .iter()
        .map(|(key, rec)| {
            let page = pages.get(key).and_then(|p| p.best_page.clone());
            (key, MetricUpdate::metrics_only(rec).merge(MetricUpdate::page_only(page)))
        })
        .collect()
}

// ── Daily incremental ──────────────────────────────────────────────

async fn sync_daily_incremental(ctx: &FlowContext<'_>) -> Result<FlowReport> {
    let flow = Flow::DailyIncremental;
    let mut report = FlowReport::new(flow);
    let day = ctx.coordinator.boundary();
    let window = ctx.coordinator.daily_target_window();
    let checker = ctx.checker();

    if checker.is_complete(&Scope::SiteDaily(day)).await?
        && checker.is_complete(&Scope::KeywordDay(day)).await?
    {
        log::info!("{}: {day} already synced", ctx.campaign.campaign_id);
        report.windows_skipped += 1;
        ctx.report_window(flow, &window, true);
        return Ok(report.finish());
    }

    let outcome = fetch_and_write_day(ctx, window).await;
    if tally(&mut report, flow, &window, outcome)? {
        checker.record_complete(&Scope::KeywordDay(day)).await?;
    }
    ctx.report_window(flow, &window, false);
    Ok(report.finish())
}

async fn fetch_and_write_day(ctx: &FlowContext<'_>, window: DateWindow) -> Result<BatchOutcome> {
    let day = window.start;
    let query_rows = ctx.fetch(window, KEYWORD_DIMS).await?;
    let page_rows = ctx.fetch(window, KEYWORD_PAGE_DIMS).await?;
    let site_rows = ctx.fetch(window, SITE_DIMS).await?;

    let mut metrics = aggregate(&query_rows, |r: &PerformanceRow| ctx.tracked_query(r));
    zero_fill(&mut metrics, ctx.keywords.iter().cloned());
    let pages = best_pages(&page_rows, |r: &PerformanceRow| ctx.tracked_query(r));
    let updates: Vec<(String, NaiveDate, MetricUpdate)> = merge_updates(&metrics, &pages)
        .into_iter()
        .map(|(kw, update)| (kw.clone(), day, update))
        .collect();

    let site = aggregate(&site_rows, by_date);
    let traffic = site.get(&day).map(TrafficStat::from).unwrap_or_default();

    let site_url = ctx.campaign.site_url.clone();
    let keywords = ctx.keywords.clone();
    let outcome = ctx
        .db
        .writer()
        .call(move |conn| {
            let mut outcome = repository::upsert_daily_batch(conn, &site_url, &updates)?;
            outcome += repository::upsert_traffic_daily_batch(conn, &site_url, &[(day, traffic)])?;
            outcome += rollup_month(conn, &site_url, &keywords, Month::of(day))?;
            Ok::<_, rusqlite::Error>(outcome)
        })
        .await?;
    Ok(outcome)
}

// ── Historical backfill ────────────────────────────────────────────

async fn sync_historical_backfill(ctx: &FlowContext<'_>) -> Result<FlowReport> {
    let flow = Flow::HistoricalBackfill;
    let mut report = FlowReport::new(flow);
    let windows = ctx.coordinator.monthly_backfill_windows(ctx.campaign)?;
    let checker = ctx.checker();

    for window in windows {
        if ctx.options.cancel.is_cancelled() {
            log::info!("{}: backfill cancelled before {window}", ctx.campaign.campaign_id);
            report.status = SyncStatus::Cancelled;
            report.error = Some(Error::Cancelled.to_string());
            break;
        }

        let scope = Scope::Month(window);
        if checker.is_complete(&scope).await? {
            log::debug!("{}: {window} already complete", ctx.campaign.campaign_id);
            report.windows_skipped += 1;
            ctx.report_window(flow, &window, true);
            continue;
        }

        let outcome = backfill_month(ctx, window).await;
        if tally(&mut report, flow, &window, outcome)? {
            checker.record_complete(&scope).await?;
        }
        ctx.report_window(flow, &window, false);
    }

    Ok(report.finish())
}

async fn backfill_month(ctx: &FlowContext<'_>, window: DateWindow) -> Result<BatchOutcome> {
    let rows = ctx.fetch(window, DAILY_KEYWORD_DIMS).await?;
    let page_rows = ctx.fetch(window, DAILY_KEYWORD_PAGE_DIMS).await?;

    let updates = daily_updates(ctx, window, &rows, &page_rows);
    let site_url = ctx.campaign.site_url.clone();
    let keywords = ctx.keywords.clone();
    let month = window.month();
    let outcome = ctx
        .db
        .writer()
        .call(move |conn| {
            let mut outcome = repository::upsert_daily_batch(conn, &site_url, &updates)?;
            outcome += rollup_month(conn, &site_url, &keywords, month)?;
            Ok::<_, rusqlite::Error>(outcome)
        })
        .await?;
    Ok(outcome)
}

/// One update per tracked (keyword, day) in `window`, stubbed where the
/// source returned nothing.
fn daily_updates(
    ctx: &FlowContext<'_>,
    window: DateWindow,
    rows: &[PerformanceRow],
    page_rows: &[PerformanceRow],
) -> Vec<(String, NaiveDate, MetricUpdate)> {
    let mut metrics = aggregate(rows, |r: &PerformanceRow| {
        ctx.tracked_date_query(r).filter(|(d, _)| window.contains(*d))
    });
    zero_fill(
        &mut metrics,
        window
            .days()
            .flat_map(|day| ctx.keywords.iter().map(move |kw| (day, kw.clone()))),
    );
    let pages = best_pages(page_rows, |r: &PerformanceRow| ctx.tracked_date_query(r));
    merge_updates(&metrics, &pages)
        .into_iter()
        .map(|((day, kw), update)| (kw.clone(), *day, update))
        .collect()
}

/// Recompute monthly keyword stats from the stored daily rows of `month`.
fn rollup_month(
    conn: &mut Connection,
    site_url: &str,
    keywords: &[String],
    month: Month,
) -> std::result::Result<BatchOutcome, rusqlite::Error> {
    let window = DateWindow::new(month.first_day(), month.succ().first_day());
    let daily = repository::list_daily_stats(conn, site_url, &window)?;
    let tracked: HashSet<&str> = keywords.iter().map(|k| k.as_str()).collect();
    let key = |s: &KeywordDailyStat| {
        tracked.contains(s.keyword.as_str()).then(|| s.keyword.clone())
    };

    let mut metrics = aggregate(&daily, key);
    zero_fill(&mut metrics, keywords.iter().cloned());
    let pages = best_pages(&daily, key);

    let updates: Vec<(String, MetricUpdate)> = merge_updates(&metrics, &pages)
        .into_iter()
        .map(|(keyword, update)| (keyword.clone(), update))
        .collect();
    repository::upsert_monthly_batch(conn, site_url, month, &updates)
}

// ── Initial position ───────────────────────────────────────────────

async fn sync_initial_position(ctx: &FlowContext<'_>) -> Result<FlowReport> {
    let flow = Flow::InitialPosition;
    let mut report = FlowReport::new(flow);
    let checker = ctx.checker();
    let window = ctx.coordinator.initial_position_window(ctx.campaign)?;

    if checker.is_complete(&Scope::InitialPosition).await? {
        report.windows_skipped += 1;
        ctx.report_window(flow, &window, true);
        return Ok(report.finish());
    }
    if window.num_days() < INITIAL_POSITION_DAYS {
        log::info!(
            "{}: pre-start window {window} not yet reportable",
            ctx.campaign.campaign_id
        );
        return Ok(report.finish());
    }

    let outcome = initial_position(ctx, window).await;
    if tally(&mut report, flow, &window, outcome)? {
        checker.record_complete(&Scope::InitialPosition).await?;
    }
    ctx.report_window(flow, &window, false);
    Ok(report.finish())
}

async fn initial_position(ctx: &FlowContext<'_>, window: DateWindow) -> Result<BatchOutcome> {
    let rows = ctx.fetch(window, DAILY_KEYWORD_DIMS).await?;
    let page_rows = ctx.fetch(window, DAILY_KEYWORD_PAGE_DIMS).await?;

    // The baseline spans the whole window, not a single day.
    let mut baseline = aggregate(&rows, |r: &PerformanceRow| ctx.tracked_query(r));
    zero_fill(&mut baseline, ctx.keywords.iter().cloned());
    let baseline: Vec<(String, f64, u64)> = baseline
        .into_iter()
        .map(|(kw, rec)| (kw, rec.position, rec.impressions))
        .collect();

    let updates = daily_updates(ctx, window, &rows, &page_rows);
    let site_url = ctx.campaign.site_url.clone();
    let keywords = ctx.keywords.clone();
    let outcome = ctx
        .db
        .writer()
        .call(move |conn| {
            let mut outcome = repository::upsert_daily_batch(conn, &site_url, &updates)?;
            outcome += repository::upsert_initial_position_batch(conn, &site_url, &baseline)?;
            // The audit rows change the pre-start months' totals.
            let mut month = Month::of(window.start);
            while month <= Month::of(window.last_day()) {
                outcome += rollup_month(conn, &site_url, &keywords, month)?;
                month = month.succ();
            }
            Ok::<_, rusqlite::Error>(outcome)
        })
        .await?;
    Ok(outcome)
}

// ── Site traffic ───────────────────────────────────────────────────

async fn sync_traffic(ctx: &FlowContext<'_>) -> Result<FlowReport> {
    let flow = Flow::TrafficSync;
    let mut report = FlowReport::new(flow);
    let windows = ctx.coordinator.traffic_windows();

    if !windows.history.is_empty() && !windows.months.is_empty() {
        let outcome = traffic_history(ctx, windows.history, windows.months.clone()).await;
        tally(&mut report, flow, &windows.history, outcome)?;
        ctx.report_window(flow, &windows.history, false);
    }

    if let Some(current) = windows.current_month {
        let outcome = traffic_current_month(ctx, current).await;
        tally(&mut report, flow, &current, outcome)?;
        ctx.report_window(flow, &current, false);
    }

    Ok(report.finish())
}

async fn traffic_history(ctx: &FlowContext<'_>, window: DateWindow, months: Vec<Month>) -> Result<BatchOutcome> {
    let rows = ctx.fetch(window, SITE_DIMS).await?;
    let per_month = aggregate(&rows, by_month);
    let stats: Vec<(Month, TrafficStat)> = months
        .into_iter()
        .map(|m| (m, per_month.get(&m).map(TrafficStat::from).unwrap_or_default()))
        .collect();

    let site_url = ctx.campaign.site_url.clone();
    let outcome = ctx
        .db
        .writer()
        .call(move |conn| repository::upsert_traffic_monthly_batch(conn, &site_url, &stats))
        .await?;
    Ok(outcome)
}

async fn traffic_current_month(ctx: &FlowContext<'_>, window: DateWindow) -> Result<BatchOutcome> {
    let rows = ctx.fetch(window, SITE_DIMS).await?;
    let per_day: Vec<(NaiveDate, TrafficStat)> = aggregate(&rows, by_date)
        .iter()
        .filter(|(day, _)| window.contains(**day))
        .map(|(day, rec)| (*day, TrafficStat::from(rec)))
        .collect();

    let site_url = ctx.campaign.site_url.clone();
    let outcome = ctx
        .db
        .writer()
        .call(move |conn| repository::upsert_traffic_daily_batch(conn, &site_url, &per_day))
        .await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::fake::{row, FakeSource};
    use crate::error::FetchErrorKind;
    use crate::sync::NoopProgress;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const SITE: &str = "sc-domain:example.com";

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn campaign(start: NaiveDate, keywords: &str) -> Campaign {
        Campaign {
            campaign_id: "c1".into(),
            site_url: SITE.into(),
            keywords_raw: keywords.into(),
            start_date: Some(start),
            linked_account: Some("acct".into()),
        }
    }

    fn settings() -> SyncSettings {
        let mut s = SyncSettings::default();
        s.fetch = FetchPolicy {
            timeout: Duration::from_secs(5),
            max_retries: 0,
            backoff: Duration::from_millis(1),
        };
        s
    }

    fn options(today: NaiveDate, flows: &[Flow]) -> SyncOptions {
        SyncOptions {
            flows: flows.to_vec(),
            today: Some(today),
            ..Default::default()
        }
    }

    async fn run(db: &Database, source: &FakeSource, c: &Campaign, opts: &SyncOptions) -> CampaignReport {
        sync_campaign(db, source, c, &settings(), opts, &NoopProgress).await
    }

    async fn add_reject_trigger(db: &Database, table: &'static str, condition: &'static str) {
        db.writer()
            .call(move |conn| {
                conn.execute_batch(&format!(
                    "CREATE TRIGGER reject_{table} BEFORE INSERT ON {table}
                     WHEN {condition}
                     BEGIN SELECT RAISE(ABORT, 'rejected'); END;"
                ))
            })
            .await
            .unwrap();
    }

    async fn backfill_checkpoints(db: &Database) -> i64 {
        db.reader()
            .call(|conn| repository::count_checkpoints(conn, "c1", "historical_backfill"))
            .await
            .unwrap()
    }

    /// Cancels the sync once `after` backfill windows have been reported.
    struct CancelAfter {
        seen: AtomicUsize,
        after: usize,
        cancel: CancellationToken,
    }

    impl SyncProgress for CancelAfter {
        fn on_window(&self, _campaign_id: &str, flow: Flow, _window: &DateWindow, _skipped: bool) {
            if flow == Flow::HistoricalBackfill && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.cancel.cancel();
            }
        }
    }

    async fn daily_stat(db: &Database, keyword: &'static str, day: NaiveDate) -> Option<crate::storage::models::KeywordDailyStat> {
        db.reader()
            .call(move |conn| repository::get_daily_stat(conn, SITE, keyword, day))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_daily_incremental_worked_example() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        // today - 3 days = 2025-03-04
        let today = d(2025, 3, 7);
        let day = DateWindow::single_day(d(2025, 3, 4));
        source.respond(day, KEYWORD_DIMS, vec![row(&["X"], 6.0, 150.0, 12.0)]);
        source.respond(
            day,
            KEYWORD_PAGE_DIMS,
            vec![row(&["x", "A"], 5.0, 100.0, 8.0), row(&["x", "B"], 1.0, 50.0, 20.0)],
        );
        source.respond(day, SITE_DIMS, vec![row(&["2025-03-04"], 40.0, 900.0, 9.5)]);

        let c = campaign(d(2025, 1, 1), "x\ny");
        let report = run(&db, &source, &c, &options(today, &[Flow::DailyIncremental])).await;
        assert!(report.succeeded(), "{report:?}");

        let x = daily_stat(&db, "x", d(2025, 3, 4)).await.unwrap();
        assert_eq!(x.search_volume, 150);
        assert_eq!(x.clicks, 6);
        assert!((x.avg_rank.unwrap() - 12.0).abs() < 1e-9);
        assert!((x.ctr - 0.04).abs() < 1e-12);
        assert_eq!(x.top_page.as_deref(), Some("A"));

        // Tracked keyword with no data gets a zero stub.
        let y = daily_stat(&db, "y", d(2025, 3, 4)).await.unwrap();
        assert_eq!(y.search_volume, 0);
        assert_eq!(y.avg_rank, Some(0.0));

        let (traffic, monthly) = db
            .reader()
            .call(|conn| {
                let day = DateWindow::single_day(NaiveDate::from_ymd_opt(2025, 3, 4).unwrap());
                let t = repository::list_traffic_daily(conn, SITE, &day)?;
                let m = repository::list_monthly_stats(conn, SITE, Month { year: 2025, month: 3 })?;
                Ok::<_, rusqlite::Error>((t, m))
            })
            .await
            .unwrap();
        assert_eq!(traffic.len(), 1);
        assert_eq!(traffic[0].1.impressions, 900);
        assert_eq!(monthly.len(), 2);
        assert_eq!(monthly[0].keyword, "x");
        assert_eq!(monthly[0].search_volume, 150);
        assert_eq!(monthly[0].top_page.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_daily_incremental_is_idempotent_and_skips_when_complete() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let today = d(2025, 3, 7);
        let day = DateWindow::single_day(d(2025, 3, 4));
        source.respond(day, KEYWORD_DIMS, vec![row(&["x"], 1.0, 10.0, 3.0)]);
        source.respond(day, SITE_DIMS, vec![row(&["2025-03-04"], 1.0, 10.0, 3.0)]);

        let c = campaign(d(2025, 1, 1), "x");
        let opts = options(today, &[Flow::DailyIncremental]);
        run(&db, &source, &c, &opts).await;
        let first = daily_stat(&db, "x", d(2025, 3, 4)).await.unwrap();
        let calls = source.call_count();
        assert_eq!(calls, 3);

        let report = run(&db, &source, &c, &opts).await;
        assert_eq!(source.call_count(), calls, "complete day must not be fetched again");
        assert_eq!(report.flow(Flow::DailyIncremental).unwrap().windows_skipped, 1);
        assert_eq!(daily_stat(&db, "x", d(2025, 3, 4)).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_backfill_writes_every_keyword_day_and_rolls_up() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        // Boundary 2025-02-03: windows [01-30, 02-01) and [02-01, 02-04).
        let today = d(2025, 2, 6);
        let jan = DateWindow::new(d(2025, 1, 30), d(2025, 2, 1));
        source.respond(
            jan,
            DAILY_KEYWORD_DIMS,
            vec![
                row(&["2025-01-30", "x"], 0.0, 0.0, 40.0),
                row(&["2025-01-31", "x"], 2.0, 100.0, 5.0),
                row(&["2025-01-31", "untracked"], 9.0, 900.0, 1.0),
            ],
        );
        source.respond(
            jan,
            DAILY_KEYWORD_PAGE_DIMS,
            vec![row(&["2025-01-31", "x", "https://example.com/x"], 2.0, 100.0, 5.0)],
        );

        let c = campaign(d(2025, 1, 30), "x");
        let report = run(&db, &source, &c, &options(today, &[Flow::HistoricalBackfill])).await;
        let backfill = report.flow(Flow::HistoricalBackfill).unwrap();
        assert_eq!(backfill.windows_fetched, 2);
        assert_eq!(backfill.status, SyncStatus::Success);

        let window = DateWindow::new(d(2025, 1, 30), d(2025, 2, 4));
        let stats = db
            .reader()
            .call(move |conn| repository::list_daily_stats(conn, SITE, &window))
            .await
            .unwrap();
        // Five days, one keyword, untracked queries dropped.
        assert_eq!(stats.len(), 5);
        assert!(stats.iter().all(|s| s.keyword == "x" && s.is_populated()));

        let jan_stats = db
            .reader()
            .call(|conn| repository::list_monthly_stats(conn, SITE, Month { year: 2025, month: 1 }))
            .await
            .unwrap();
        assert_eq!(jan_stats.len(), 1);
        assert!((jan_stats[0].avg_rank.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(jan_stats[0].top_page.as_deref(), Some("https://example.com/x"));
    }

    #[tokio::test]
    async fn test_backfill_resumes_after_completed_months() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let today = d(2025, 4, 10);
        let c = campaign(d(2025, 1, 1), "x");

        let checker = CompletenessChecker::new(&db, "c1", SITE, &c.keywords());
        let jan = DateWindow::new(d(2025, 1, 1), d(2025, 2, 1));
        let feb = DateWindow::new(d(2025, 2, 1), d(2025, 3, 1));
        checker.record_complete(&Scope::Month(jan)).await.unwrap();
        checker.record_complete(&Scope::Month(feb)).await.unwrap();

        let report = run(&db, &source, &c, &options(today, &[Flow::HistoricalBackfill])).await;
        let backfill = report.flow(Flow::HistoricalBackfill).unwrap();
        assert_eq!(backfill.windows_skipped, 2);
        assert_eq!(backfill.windows_fetched, 2);
        assert_eq!(source.calls_for(&jan), 0);
        assert_eq!(source.calls_for(&feb), 0);
        assert_eq!(source.calls_for(&DateWindow::new(d(2025, 3, 1), d(2025, 4, 1))), 2);

        // A second run finds every month complete and fetches nothing.
        let calls = source.call_count();
        let report = run(&db, &source, &c, &options(today, &[Flow::HistoricalBackfill])).await;
        assert_eq!(source.call_count(), calls);
        assert_eq!(report.flow(Flow::HistoricalBackfill).unwrap().windows_skipped, 4);
    }

    #[tokio::test]
    async fn test_failed_month_does_not_abort_later_months() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let today = d(2025, 3, 10);
        let jan = DateWindow::new(d(2025, 1, 1), d(2025, 2, 1));
        source.fail(jan, DAILY_KEYWORD_DIMS, FetchErrorKind::Auth);

        let c = campaign(d(2025, 1, 1), "x");
        let report = run(&db, &source, &c, &options(today, &[Flow::HistoricalBackfill])).await;
        let backfill = report.flow(Flow::HistoricalBackfill).unwrap();
        assert_eq!(backfill.windows_failed, 1);
        assert_eq!(backfill.windows_fetched, 2);
        assert_eq!(backfill.status, SyncStatus::PartialFailure);
        assert!(!report.succeeded());

        let checkpoints = db
            .reader()
            .call(|conn| repository::count_checkpoints(conn, "c1", "historical_backfill"))
            .await
            .unwrap();
        assert_eq!(checkpoints, 2);
    }

    #[tokio::test]
    async fn test_backfill_observes_cancellation() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let opts = options(d(2025, 3, 10), &[Flow::HistoricalBackfill]);
        opts.cancel.cancel();

        let report = run(&db, &source, &campaign(d(2025, 1, 1), "x"), &opts).await;
        assert_eq!(report.flow(Flow::HistoricalBackfill).unwrap().status, SyncStatus::Cancelled);
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test]
    async fn test_initial_position_uses_only_pre_start_window() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let start = d(2025, 2, 10);
        let pre = DateWindow::new(d(2025, 2, 3), start);
        source.respond(
            pre,
            DAILY_KEYWORD_DIMS,
            vec![
                row(&["2025-02-03", "x"], 0.0, 30.0, 10.0),
                row(&["2025-02-09", "x"], 0.0, 10.0, 2.0),
            ],
        );
        // Post-start data must never reach the baseline.
        source.respond(
            DateWindow::new(start, d(2025, 2, 17)),
            DAILY_KEYWORD_DIMS,
            vec![row(&["2025-02-10", "x"], 0.0, 1000.0, 1.0)],
        );

        let c = campaign(start, "x\ny");
        let report = run(&db, &source, &c, &options(d(2025, 3, 1), &[Flow::InitialPosition])).await;
        assert!(report.succeeded(), "{report:?}");
        assert_eq!(source.call_count(), 2);
        assert!(source.calls.lock().unwrap().iter().all(|r| r.window == pre));

        let records = db
            .reader()
            .call(|conn| repository::list_keyword_records(conn, SITE))
            .await
            .unwrap();
        let x = records.iter().find(|r| r.keyword == "x").unwrap();
        assert!((x.initial_position.unwrap() - 8.0).abs() < 1e-9);
        assert_eq!(x.initial_impressions, Some(40));
        let y = records.iter().find(|r| r.keyword == "y").unwrap();
        assert_eq!(y.initial_position, Some(0.0));

        // Audit rows exist for every pre-start day and roll into February.
        assert!(daily_stat(&db, "x", d(2025, 2, 5)).await.is_some());
        let feb = db
            .reader()
            .call(|conn| repository::list_monthly_stats(conn, SITE, Month { year: 2025, month: 2 }))
            .await
            .unwrap();
        let x_feb = feb.iter().find(|s| s.keyword == "x").unwrap();
        assert_eq!(x_feb.search_volume, 40);
        assert!((x_feb.avg_rank.unwrap() - 8.0).abs() < 1e-9);

        let report = run(&db, &source, &c, &options(d(2025, 3, 1), &[Flow::InitialPosition])).await;
        assert_eq!(report.flow(Flow::InitialPosition).unwrap().windows_skipped, 1);
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_start_date_aborts_campaign() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let mut c = campaign(d(2025, 1, 1), "x");
        c.start_date = None;

        let report = run(&db, &source, &c, &options(d(2025, 3, 1), &Flow::ALL)).await;
        assert!(!report.succeeded());
        assert!(report.flows.is_empty());
        assert!(report.error.unwrap().contains("start date"));
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_flow_does_not_stop_other_flows() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let today = d(2025, 3, 7);
        let day = DateWindow::single_day(d(2025, 3, 4));
        source.fail(day, KEYWORD_DIMS, FetchErrorKind::Quota);

        let c = campaign(d(2025, 3, 1), "x");
        let report = run(&db, &source, &c, &options(today, &Flow::ALL)).await;
        assert_eq!(report.flows.len(), 4);
        assert_eq!(report.flow(Flow::DailyIncremental).unwrap().status, SyncStatus::Failed);
        assert_eq!(report.flow(Flow::HistoricalBackfill).unwrap().status, SyncStatus::Success);

        let runs = db
            .reader()
            .call(|conn| repository::list_recent_sync_runs(conn, 10))
            .await
            .unwrap();
        assert_eq!(runs.len(), 4);
        assert!(runs.iter().any(|r| r.flow == "daily_incremental" && r.status == "failed"));
    }

    #[tokio::test]
    async fn test_traffic_sync_excludes_current_month_from_monthly() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let today = d(2025, 3, 20);
        let coordinator = RangeFetchCoordinator::new(today, 3);
        let windows = coordinator.traffic_windows();
        source.respond(
            windows.history,
            SITE_DIMS,
            vec![
                row(&["2025-02-01"], 5.0, 100.0, 4.0),
                row(&["2025-02-02"], 5.0, 300.0, 8.0),
            ],
        );
        let current = windows.current_month.unwrap();
        source.respond(current, SITE_DIMS, vec![row(&["2025-03-02"], 1.0, 20.0, 3.0)]);

        let c = campaign(d(2025, 1, 1), "x");
        let report = run(&db, &source, &c, &options(today, &[Flow::TrafficSync])).await;
        assert!(report.succeeded(), "{report:?}");

        let (monthly, daily) = db
            .reader()
            .call(move |conn| {
                let monthly = repository::list_traffic_monthly(conn, SITE)?;
                let daily = repository::list_traffic_daily(conn, SITE, &current)?;
                Ok::<_, rusqlite::Error>((monthly, daily))
            })
            .await
            .unwrap();
        assert_eq!(monthly.len(), 12);
        assert!(monthly.iter().all(|(m, _)| *m < Month { year: 2025, month: 3 }));
        let feb = monthly.iter().find(|(m, _)| *m == Month { year: 2025, month: 2 }).unwrap();
        assert_eq!(feb.1.impressions, 400);
        assert!((feb.1.position - 7.0).abs() < 1e-9);
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].0, d(2025, 3, 2));
    }

    #[tokio::test]
    async fn test_interrupted_backfill_resumes_at_next_month() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let c = campaign(d(2025, 1, 1), "x");
        let today = d(2025, 5, 10);
        let jan = DateWindow::new(d(2025, 1, 1), d(2025, 2, 1));
        let feb = DateWindow::new(d(2025, 2, 1), d(2025, 3, 1));
        let mar = DateWindow::new(d(2025, 3, 1), d(2025, 4, 1));

        let opts = options(today, &[Flow::HistoricalBackfill]);
        let progress = CancelAfter {
            seen: AtomicUsize::new(0),
            after: 2,
            cancel: opts.cancel.clone(),
        };
        let report = sync_campaign(&db, &source, &c, &settings(), &opts, &progress).await;
        let backfill = report.flow(Flow::HistoricalBackfill).unwrap();
        assert_eq!(backfill.status, SyncStatus::Cancelled);
        assert_eq!(backfill.windows_fetched, 2);
        assert_eq!(source.calls_for(&mar), 0);
        assert_eq!(backfill_checkpoints(&db).await, 2);

        let report = run(&db, &source, &c, &options(today, &[Flow::HistoricalBackfill])).await;
        let backfill = report.flow(Flow::HistoricalBackfill).unwrap();
        assert_eq!(backfill.status, SyncStatus::Success);
        assert_eq!(backfill.windows_skipped, 2);
        assert_eq!(backfill.windows_fetched, 3);
        assert_eq!(source.calls_for(&jan), 2);
        assert_eq!(source.calls_for(&feb), 2);
        assert_eq!(source.calls_for(&mar), 2);
    }

    #[tokio::test]
    async fn test_month_with_rejected_record_is_refetched() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let c = campaign(d(2025, 1, 1), "x");
        let opts = options(d(2025, 3, 10), &[Flow::HistoricalBackfill]);
        let feb = DateWindow::new(d(2025, 2, 1), d(2025, 3, 1));
        add_reject_trigger(&db, "keyword_daily_stats", "NEW.date_key = '2025-02-14'").await;

        let report = run(&db, &source, &c, &opts).await;
        let backfill = report.flow(Flow::HistoricalBackfill).unwrap();
        assert_eq!(backfill.windows_failed, 1);
        assert_eq!(backfill.windows_fetched, 2);
        assert_eq!(backfill_checkpoints(&db).await, 2);
        // The other February days were still written.
        assert!(daily_stat(&db, "x", d(2025, 2, 13)).await.is_some());
        assert!(daily_stat(&db, "x", d(2025, 2, 14)).await.is_none());

        run(&db, &source, &c, &opts).await;
        assert_eq!(source.calls_for(&feb), 4);

        db.writer()
            .call(|conn| conn.execute_batch("DROP TRIGGER reject_keyword_daily_stats;"))
            .await
            .unwrap();
        let report = run(&db, &source, &c, &opts).await;
        assert!(report.succeeded(), "{report:?}");
        assert_eq!(source.calls_for(&feb), 6);
        assert_eq!(backfill_checkpoints(&db).await, 3);
    }

    #[tokio::test]
    async fn test_traffic_month_write_failure_keeps_other_months() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::default();
        let today = d(2025, 3, 20);
        add_reject_trigger(&db, "traffic_monthly", "NEW.month = 12").await;

        let c = campaign(d(2025, 1, 1), "x");
        let report = run(&db, &source, &c, &options(today, &[Flow::TrafficSync])).await;
        let traffic = report.flow(Flow::TrafficSync).unwrap();
        assert_eq!(traffic.status, SyncStatus::PartialFailure);
        assert_eq!(traffic.windows_failed, 1);
        assert_eq!(traffic.records_written, 11);

        let monthly = db
            .reader()
            .call(|conn| repository::list_traffic_monthly(conn, SITE))
            .await
            .unwrap();
        assert_eq!(monthly.len(), 11);
        assert!(monthly.iter().all(|(m, _)| m.month != 12));
    }
}
