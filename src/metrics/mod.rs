pub mod types;

pub use types::*;

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};

use crate::aggregate::{aggregate_all, display_pct, Weighted};
use crate::campaign::Campaign;
use crate::date_util::{date_key, round1, Month};
use crate::error::Result;
use crate::storage::models::{KeywordMonthlyStat, TrafficStat};
use crate::storage::{repository, Database};
use crate::sync::windows::DateWindow;

/// Per-keyword metrics for one month, in the campaign's keyword order.
/// Keywords with no stored month row are still listed, with no rank.
pub async fn compute_keyword_report(
    db: &Database,
    campaign: &Campaign,
    month: Month,
) -> Result<KeywordReport> {
    let site_url = campaign.site_url.clone();
    let (stats, records) = db
        .reader()
        .call(move |conn| {
            let stats = repository::list_monthly_stats(conn, &site_url, month)?;
            let records = repository::list_keyword_records(conn, &site_url)?;
            Ok::<_, rusqlite::Error>((stats, records))
        })
        .await?;

    let by_keyword: HashMap<&str, &KeywordMonthlyStat> =
        stats.iter().map(|s| (s.keyword.as_str(), s)).collect();
    let initial: HashMap<&str, f64> = records
        .iter()
        .filter_map(|r| Some((r.keyword.as_str(), r.initial_position?)))
        .collect();

    let keywords = campaign
        .keywords()
        .into_iter()
        .map(|keyword| {
            let stat = by_keyword.get(keyword.as_str());
            let initial_position = initial.get(keyword.as_str()).copied();
            let avg_rank = stat.and_then(|s| s.avg_rank);
            KeywordMonthMetrics {
                avg_rank: avg_rank.map(round1),
                search_volume: stat.map_or(0, |s| s.search_volume),
                clicks: stat.map_or(0, |s| s.clicks),
                ctr_pct: stat.map_or(0.0, |s| display_pct(s.ctr)),
                top_page: stat.and_then(|s| s.top_page.clone()),
                initial_position: initial_position.map(round1),
                position_change: position_change(initial_position, avg_rank),
                keyword,
            }
        })
        .collect();

    let tracked: Vec<&KeywordMonthlyStat> = campaign
        .keywords()
        .iter()
        .filter_map(|k| by_keyword.get(k.as_str()).copied())
        .collect();

    Ok(KeywordReport {
        campaign_id: campaign.campaign_id.clone(),
        site_url: campaign.site_url.clone(),
        month: month.key(),
        keywords,
        totals: totals(tracked),
    })
}

/// Rank 0 means "no impressions", not "position zero", so it has no change.
fn position_change(initial: Option<f64>, current: Option<f64>) -> Option<f64> {
    match (initial, current) {
        (Some(i), Some(c)) if i > 0.0 && c > 0.0 => Some(round1(i - c)),
        _ => None,
    }
}

fn totals<'a, R, I>(rows: I) -> Totals
where
    R: Weighted + 'a,
    I: IntoIterator<Item = &'a R>,
{
    let rec = aggregate_all(rows);
    Totals {
        impressions: rec.impressions,
        clicks: rec.clicks,
        ctr_pct: display_pct(rec.ctr),
        avg_position: round1(rec.position),
    }
}

/// Stored monthly traffic plus the daily rows of the month containing `today`.
pub async fn compute_traffic_report(
    db: &Database,
    site_url: &str,
    today: NaiveDate,
) -> Result<TrafficReport> {
    let current = Month::of(today);
    let window = DateWindow::new(current.first_day(), today + Duration::days(1));
    let site = site_url.to_string();
    let (monthly, daily) = db
        .reader()
        .call(move |conn| {
            let monthly = repository::list_traffic_monthly(conn, &site)?;
            let daily = repository::list_traffic_daily(conn, &site, &window)?;
            Ok::<_, rusqlite::Error>((monthly, daily))
        })
        .await?;

    let days: Vec<TrafficStat> = daily.iter().map(|(_, s)| *s).collect();
    Ok(TrafficReport {
        site_url: site_url.to_string(),
        months: monthly
            .iter()
            .filter(|(m, _)| *m < current)
            .map(|(m, s)| period(m.key(), s))
            .collect(),
        current_month: daily.iter().map(|(d, s)| period(date_key(*d), s)).collect(),
        month_to_date: totals(&days),
    })
}

fn period(period_key: String, s: &TrafficStat) -> TrafficPeriod {
    TrafficPeriod {
        period_key,
        clicks: s.clicks,
        impressions: s.impressions,
        ctr_pct: display_pct(s.ctr),
        position: round1(s.position),
    }
}
