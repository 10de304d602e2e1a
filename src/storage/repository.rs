use std::collections::HashMap;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use crate::campaign::Campaign;
use crate::date_util::{date_key, Month};
use crate::storage::models::{
    KeywordAnalyticsRecord, KeywordDailyStat, KeywordMonthlyStat, MetricUpdate, SyncRun,
    TrafficStat,
};
use crate::sync::windows::DateWindow;

// ── Campaigns ──────────────────────────────────────────────────────

pub fn add_campaign(conn: &Connection, campaign: &Campaign) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO campaigns (
            campaign_id, site_url, keywords, start_date, linked_account, sync_enabled, added_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 1, datetime('now'))
        ON CONFLICT(campaign_id) DO UPDATE SET
            site_url=excluded.site_url, keywords=excluded.keywords,
            start_date=excluded.start_date, linked_account=excluded.linked_account",
        params![
            campaign.campaign_id,
            campaign.site_url,
            campaign.keywords_raw,
            campaign.start_date.map(date_key),
            campaign.linked_account,
        ],
    )?;
    Ok(())
}

fn campaign_from_row(row: &rusqlite::Row<'_>) -> Result<Campaign, rusqlite::Error> {
    let start: Option<String> = row.get(3)?;
    Ok(Campaign {
        campaign_id: row.get(0)?,
        site_url: row.get(1)?,
        keywords_raw: row.get(2)?,
        start_date: start.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        linked_account: row.get(4)?,
    })
}

pub fn get_campaign(conn: &Connection, campaign_id: &str) -> Result<Option<Campaign>, rusqlite::Error> {
    conn.query_row(
        "SELECT campaign_id, site_url, keywords, start_date, linked_account
         FROM campaigns WHERE campaign_id = ?1",
        params![campaign_id],
        campaign_from_row,
    )
    .optional()
}

pub fn list_campaigns(conn: &Connection) -> Result<Vec<Campaign>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT campaign_id, site_url, keywords, start_date, linked_account
         FROM campaigns WHERE sync_enabled = 1 ORDER BY added_at, campaign_id",
    )?;
    let rows = stmt.query_map([], campaign_from_row)?;
    rows.collect()
}

// ── Keyword records ────────────────────────────────────────────────

/// Create the per-(site, keyword) record on first reference.
pub fn ensure_keyword_record(conn: &Connection, site_url: &str, keyword: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO keyword_analytics (site_url, keyword, created_at, updated_at)
         VALUES (?1, ?2, datetime('now'), datetime('now'))",
        params![site_url, keyword],
    )?;
    Ok(())
}

/// Replace the baseline with a full recomputation. Never blended with a
/// previous value.
pub fn upsert_initial_position(
    conn: &Connection,
    site_url: &str,
    keyword: &str,
    position: f64,
    impressions: u64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO keyword_analytics (
            site_url, keyword, initial_position, initial_impressions, initial_position_at,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, datetime('now'), datetime('now'), datetime('now'))
        ON CONFLICT(site_url, keyword) DO UPDATE SET
            initial_position=excluded.initial_position,
            initial_impressions=excluded.initial_impressions,
            initial_position_at=excluded.initial_position_at,
            updated_at=excluded.updated_at",
        params![site_url, keyword, position, impressions as i64],
    )?;
    Ok(())
}

pub fn list_keyword_records(
    conn: &Connection,
    site_url: &str,
) -> Result<Vec<KeywordAnalyticsRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT site_url, keyword, initial_position, initial_impressions, initial_position_at
         FROM keyword_analytics WHERE site_url = ?1 ORDER BY keyword",
    )?;
    let rows = stmt.query_map(params![site_url], |row| {
        Ok(KeywordAnalyticsRecord {
            site_url: row.get(0)?,
            keyword: row.get(1)?,
            initial_position: row.get(2)?,
            initial_impressions: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
            initial_position_at: row.get(4)?,
        })
    })?;
    rows.collect()
}

/// Keywords of `site_url` that already have a baseline.
pub fn keywords_with_initial_position(
    conn: &Connection,
    site_url: &str,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT keyword FROM keyword_analytics
         WHERE site_url = ?1 AND initial_position IS NOT NULL",
    )?;
    let rows = stmt.query_map(params![site_url], |row| row.get(0))?;
    rows.collect()
}

// ── Keyword daily / monthly stats ──────────────────────────────────

pub fn upsert_daily(
    conn: &Connection,
    site_url: &str,
    keyword: &str,
    date: NaiveDate,
    update: &MetricUpdate,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO keyword_daily_stats (
            site_url, keyword, date_key, avg_rank, search_volume, clicks, ctr, top_page, updated_at
        ) VALUES (?1, ?2, ?3, ?4, COALESCE(?5, 0), COALESCE(?6, 0), COALESCE(?7, 0), ?8, datetime('now'))
        ON CONFLICT(site_url, keyword, date_key) DO UPDATE SET
            avg_rank = COALESCE(?4, keyword_daily_stats.avg_rank),
            search_volume = COALESCE(?5, keyword_daily_stats.search_volume),
            clicks = COALESCE(?6, keyword_daily_stats.clicks),
            ctr = COALESCE(?7, keyword_daily_stats.ctr),
            top_page = COALESCE(?8, keyword_daily_stats.top_page),
            updated_at = excluded.updated_at",
        params![
            site_url,
            keyword,
            date_key(date),
            update.avg_rank,
            update.search_volume.map(|v| v as i64),
            update.clicks.map(|v| v as i64),
            update.ctr,
            update.top_page,
        ],
    )?;
    Ok(())
}

pub fn upsert_monthly(
    conn: &Connection,
    site_url: &str,
    keyword: &str,
    month: Month,
    update: &MetricUpdate,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO keyword_monthly_stats (
            site_url, keyword, year, month, avg_rank, search_volume, clicks, ctr, top_page, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, 0), COALESCE(?7, 0), COALESCE(?8, 0), ?9, datetime('now'))
        ON CONFLICT(site_url, keyword, year, month) DO UPDATE SET
            avg_rank = COALESCE(?5, keyword_monthly_stats.avg_rank),
            search_volume = COALESCE(?6, keyword_monthly_stats.search_volume),
            clicks = COALESCE(?7, keyword_monthly_stats.clicks),
            ctr = COALESCE(?8, keyword_monthly_stats.ctr),
            top_page = COALESCE(?9, keyword_monthly_stats.top_page),
            updated_at = excluded.updated_at",
        params![
            site_url,
            keyword,
            month.year,
            month.month,
            update.avg_rank,
            update.search_volume.map(|v| v as i64),
            update.clicks.map(|v| v as i64),
            update.ctr,
            update.top_page,
        ],
    )?;
    Ok(())
}

/// Result of a batched write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub written: u64,
    pub failed: u64,
}

impl std::ops::AddAssign for BatchOutcome {
    fn add_assign(&mut self, other: Self) {
        self.written += other.written;
        self.failed += other.failed;
    }
}

/// Write each item in its own savepoint inside one transaction. A failing
/// item is rolled back and counted; the others still commit.
fn write_each<T>(
    conn: &mut Connection,
    items: &[T],
    mut write: impl FnMut(&Connection, &T) -> Result<(), rusqlite::Error>,
    describe: impl Fn(&T) -> String,
) -> Result<BatchOutcome, rusqlite::Error> {
    let mut outcome = BatchOutcome::default();
    let mut tx = conn.transaction()?;
    for item in items {
        let sp = tx.savepoint()?;
        match write(&sp, item) {
            Ok(()) => {
                sp.commit()?;
                outcome.written += 1;
            }
            Err(e) => {
                log::warn!("Failed to write {}: {e}", describe(item));
                outcome.failed += 1;
            }
        }
    }
    tx.commit()?;
    Ok(outcome)
}

/// Write a window's keyword-day updates, one savepoint per keyword-day.
pub fn upsert_daily_batch(
    conn: &mut Connection,
    site_url: &str,
    updates: &[(String, NaiveDate, MetricUpdate)],
) -> Result<BatchOutcome, rusqlite::Error> {
    write_each(
        conn,
        updates,
        |c, (keyword, date, update)| {
            ensure_keyword_record(c, site_url, keyword)?;
            upsert_daily(c, site_url, keyword, *date, update)
        },
        |(keyword, date, _)| format!("{site_url} '{keyword}' {date}"),
    )
}

pub fn upsert_monthly_batch(
    conn: &mut Connection,
    site_url: &str,
    month: Month,
    updates: &[(String, MetricUpdate)],
) -> Result<BatchOutcome, rusqlite::Error> {
    write_each(
        conn,
        updates,
        |c, (keyword, update)| upsert_monthly(c, site_url, keyword, month, update),
        |(keyword, _)| format!("{site_url} '{keyword}' {}", month.key()),
    )
}

/// Baselines as `(keyword, position, impressions)`.
pub fn upsert_initial_position_batch(
    conn: &mut Connection,
    site_url: &str,
    baselines: &[(String, f64, u64)],
) -> Result<BatchOutcome, rusqlite::Error> {
    write_each(
        conn,
        baselines,
        |c, (keyword, position, impressions)| {
            upsert_initial_position(c, site_url, keyword, *position, *impressions)
        },
        |(keyword, _, _)| format!("{site_url} '{keyword}' initial position"),
    )
}

pub fn upsert_traffic_daily_batch(
    conn: &mut Connection,
    site_url: &str,
    days: &[(NaiveDate, TrafficStat)],
) -> Result<BatchOutcome, rusqlite::Error> {
    write_each(
        conn,
        days,
        |c, (date, stat)| upsert_traffic_daily(c, site_url, *date, stat),
        |(date, _)| format!("{site_url} traffic {date}"),
    )
}

pub fn upsert_traffic_monthly_batch(
    conn: &mut Connection,
    site_url: &str,
    months: &[(Month, TrafficStat)],
) -> Result<BatchOutcome, rusqlite::Error> {
    write_each(
        conn,
        months,
        |c, (month, stat)| upsert_traffic_monthly(c, site_url, *month, stat),
        |(month, _)| format!("{site_url} traffic {}", month.key()),
    )
}

pub fn list_daily_stats(
    conn: &Connection,
    site_url: &str,
    window: &DateWindow,
) -> Result<Vec<KeywordDailyStat>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT site_url, keyword, date_key, avg_rank, search_volume, clicks, ctr, top_page
         FROM keyword_daily_stats
         WHERE site_url = ?1 AND date_key >= ?2 AND date_key < ?3
         ORDER BY keyword, date_key",
    )?;
    let rows = stmt.query_map(
        params![site_url, date_key(window.start), date_key(window.end)],
        |row| {
            let date: String = row.get(2)?;
            Ok(KeywordDailyStat {
                site_url: row.get(0)?,
                keyword: row.get(1)?,
                date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
                })?,
                avg_rank: row.get(3)?,
                search_volume: row.get::<_, i64>(4)? as u64,
                clicks: row.get::<_, i64>(5)? as u64,
                ctr: row.get(6)?,
                top_page: row.get(7)?,
            })
        },
    )?;
    rows.collect()
}

pub fn get_daily_stat(
    conn: &Connection,
    site_url: &str,
    keyword: &str,
    date: NaiveDate,
) -> Result<Option<KeywordDailyStat>, rusqlite::Error> {
    let window = DateWindow::single_day(date);
    Ok(list_daily_stats(conn, site_url, &window)?
        .into_iter()
        .find(|s| s.keyword == keyword))
}

/// Per keyword, how many days in `window` have rank or page populated.
pub fn count_populated_days(
    conn: &Connection,
    site_url: &str,
    window: &DateWindow,
) -> Result<HashMap<String, u32>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT keyword, COUNT(*) FROM keyword_daily_stats
         WHERE site_url = ?1 AND date_key >= ?2 AND date_key < ?3
           AND (avg_rank IS NOT NULL OR top_page IS NOT NULL)
         GROUP BY keyword",
    )?;
    let rows = stmt.query_map(
        params![site_url, date_key(window.start), date_key(window.end)],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u32)),
    )?;
    rows.collect()
}

pub fn list_monthly_stats(
    conn: &Connection,
    site_url: &str,
    month: Month,
) -> Result<Vec<KeywordMonthlyStat>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT site_url, keyword, year, month, avg_rank, search_volume, clicks, ctr, top_page
         FROM keyword_monthly_stats
         WHERE site_url = ?1 AND year = ?2 AND month = ?3
         ORDER BY keyword",
    )?;
    let rows = stmt.query_map(params![site_url, month.year, month.month], |row| {
        Ok(KeywordMonthlyStat {
            site_url: row.get(0)?,
            keyword: row.get(1)?,
            month: Month {
                year: row.get(2)?,
                month: row.get(3)?,
            },
            avg_rank: row.get(4)?,
            search_volume: row.get::<_, i64>(5)? as u64,
            clicks: row.get::<_, i64>(6)? as u64,
            ctr: row.get(7)?,
            top_page: row.get(8)?,
        })
    })?;
    rows.collect()
}

// ── Site traffic ───────────────────────────────────────────────────

pub fn upsert_traffic_daily(
    conn: &Connection,
    site_url: &str,
    date: NaiveDate,
    stat: &TrafficStat,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO traffic_daily (site_url, date_key, clicks, impressions, ctr, position, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
         ON CONFLICT(site_url, date_key) DO UPDATE SET
            clicks=excluded.clicks, impressions=excluded.impressions,
            ctr=excluded.ctr, position=excluded.position, updated_at=excluded.updated_at",
        params![
            site_url,
            date_key(date),
            stat.clicks as i64,
            stat.impressions as i64,
            stat.ctr,
            stat.position,
        ],
    )?;
    Ok(())
}

pub fn upsert_traffic_monthly(
    conn: &Connection,
    site_url: &str,
    month: Month,
    stat: &TrafficStat,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO traffic_monthly (site_url, year, month, clicks, impressions, ctr, position, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
         ON CONFLICT(site_url, year, month) DO UPDATE SET
            clicks=excluded.clicks, impressions=excluded.impressions,
            ctr=excluded.ctr, position=excluded.position, updated_at=excluded.updated_at",
        params![
            site_url,
            month.year,
            month.month,
            stat.clicks as i64,
            stat.impressions as i64,
            stat.ctr,
            stat.position,
        ],
    )?;
    Ok(())
}

fn traffic_from_row(row: &rusqlite::Row<'_>, offset: usize) -> Result<TrafficStat, rusqlite::Error> {
    Ok(TrafficStat {
        clicks: row.get::<_, i64>(offset)? as u64,
        impressions: row.get::<_, i64>(offset + 1)? as u64,
        ctr: row.get(offset + 2)?,
        position: row.get(offset + 3)?,
    })
}

pub fn traffic_daily_exists(conn: &Connection, site_url: &str, date: NaiveDate) -> Result<bool, rusqlite::Error> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM traffic_daily WHERE site_url = ?1 AND date_key = ?2",
            params![site_url, date_key(date)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn list_traffic_daily(
    conn: &Connection,
    site_url: &str,
    window: &DateWindow,
) -> Result<Vec<(NaiveDate, TrafficStat)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT date_key, clicks, impressions, ctr, position FROM traffic_daily
         WHERE site_url = ?1 AND date_key >= ?2 AND date_key < ?3 ORDER BY date_key",
    )?;
    let rows = stmt.query_map(
        params![site_url, date_key(window.start), date_key(window.end)],
        |row| {
            let date: String = row.get(0)?;
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })?;
            Ok((date, traffic_from_row(row, 1)?))
        },
    )?;
    rows.collect()
}

pub fn list_traffic_monthly(
    conn: &Connection,
    site_url: &str,
) -> Result<Vec<(Month, TrafficStat)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT year, month, clicks, impressions, ctr, position FROM traffic_monthly
         WHERE site_url = ?1 ORDER BY year, month",
    )?;
    let rows = stmt.query_map(params![site_url], |row| {
        let month = Month {
            year: row.get(0)?,
            month: row.get(1)?,
        };
        Ok((month, traffic_from_row(row, 2)?))
    })?;
    rows.collect()
}

// ── Checkpoints ────────────────────────────────────────────────────

/// Keyword set the scope was completed for, if it was.
pub fn get_checkpoint(
    conn: &Connection,
    campaign_id: &str,
    flow: &str,
    scope_key: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT keyword_set FROM sync_checkpoints
         WHERE campaign_id = ?1 AND flow = ?2 AND scope_key = ?3",
        params![campaign_id, flow, scope_key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_checkpoint(
    conn: &Connection,
    campaign_id: &str,
    flow: &str,
    scope_key: &str,
    keyword_set: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_checkpoints (campaign_id, flow, scope_key, keyword_set, completed_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(campaign_id, flow, scope_key) DO UPDATE SET
            keyword_set=excluded.keyword_set, completed_at=excluded.completed_at",
        params![campaign_id, flow, scope_key, keyword_set],
    )?;
    Ok(())
}

pub fn count_checkpoints(conn: &Connection, campaign_id: &str, flow: &str) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM sync_checkpoints WHERE campaign_id = ?1 AND flow = ?2",
        params![campaign_id, flow],
        |row| row.get(0),
    )
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Sync runs ──────────────────────────────────────────────────────

pub fn insert_sync_run(conn: &Connection, campaign_id: &str, flow: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (campaign_id, flow, status, started_at)
         VALUES (?1, ?2, 'running', datetime('now'))",
        params![campaign_id, flow],
    )?;
    Ok(conn.last_insert_rowid())
}

#[allow(clippy::too_many_arguments)]
pub fn finish_sync_run(
    conn: &Connection,
    run_id: i64,
    status: &str,
    windows_fetched: u32,
    windows_skipped: u32,
    windows_failed: u32,
    records_written: u64,
    error_message: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET
            status = ?2, completed_at = datetime('now'),
            windows_fetched = ?3, windows_skipped = ?4, windows_failed = ?5,
            records_written = ?6, error_message = ?7
         WHERE id = ?1",
        params![
            run_id,
            status,
            windows_fetched,
            windows_skipped,
            windows_failed,
            records_written as i64,
            error_message,
        ],
    )?;
    Ok(())
}

pub fn list_recent_sync_runs(conn: &Connection, limit: u32) -> Result<Vec<SyncRun>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, campaign_id, flow, status, started_at, completed_at,
                windows_fetched, windows_skipped, windows_failed, records_written, error_message
         FROM sync_runs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(SyncRun {
            id: row.get(0)?,
            campaign_id: row.get(1)?,
            flow: row.get(2)?,
            status: row.get(3)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            windows_fetched: row.get(6)?,
            windows_skipped: row.get(7)?,
            windows_failed: row.get(8)?,
            records_written: row.get::<_, i64>(9)? as u64,
            error_message: row.get(10)?,
        })
    })?;
    rows.collect()
}
