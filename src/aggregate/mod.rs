//! Impression-weighted reduction of search-performance rows.
//!
//! Every rollup level (page→day, day→month, page→range) goes through
//! [`aggregate`]: rows are partitioned by a caller-supplied key and each
//! partition collapses to one [`AggregatedRecord`]:
//!
//! - `impressions = Σ impressions`, `clicks = Σ clicks`
//! - `position = Σ(position × impressions) / Σ impressions`, or `0` when no
//!   impressions
//! - `ctr = Σ clicks / Σ impressions`, or `0`
//! - `best_page` = page of the row with the most impressions; the first row
//!   seen keeps the title on a tie
//!
//! Position and ctr are kept at full precision. Only display percentages go
//! through [`display_pct`].

use std::hash::Hash;

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::Serialize;

use crate::analytics::PerformanceRow;
use crate::date_util::{round1, Month};

/// Anything that can be folded into an [`AggregatedRecord`].
pub trait Weighted {
    fn impressions(&self) -> u64;
    fn clicks(&self) -> u64;
    fn position(&self) -> f64;
    fn page(&self) -> Option<&str> {
        None
    }
}

/// One logical record per grouping key.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AggregatedRecord {
    pub impressions: u64,
    pub clicks: u64,
    pub position: f64,
    pub ctr: f64,
    pub best_page: Option<String>,
    /// Number of input rows folded in; zero for a zero-filled stub.
    pub rows: usize,
}

#[derive(Default)]
struct Accumulator {
    impressions: u64,
    clicks: u64,
    weighted_position: f64,
    best: Option<(u64, String)>,
    rows: usize,
}

impl Accumulator {
    fn push<R: Weighted + ?Sized>(&mut self, row: &R) {
        let impressions = row.impressions();
        self.impressions += impressions;
        self.clicks += row.clicks();
        self.weighted_position += row.position() * impressions as f64;
        self.rows += 1;

        if let Some(page) = row.page() {
            match &self.best {
                Some((best_impressions, _)) if impressions <= *best_impressions => {}
                _ => self.best = Some((impressions, page.to_string())),
            }
        }
    }

    fn finish(self) -> AggregatedRecord {
        let (position, ctr) = if self.impressions > 0 {
            let total = self.impressions as f64;
            (self.weighted_position / total, self.clicks as f64 / total)
        } else {
            (0.0, 0.0)
        };
        AggregatedRecord {
            impressions: self.impressions,
            clicks: self.clicks,
            position,
            ctr,
            best_page: self.best.map(|(_, page)| page),
            rows: self.rows,
        }
    }
}

/// Partition `rows` by `key_fn` and reduce each partition. Rows for which
/// `key_fn` returns `None` are left out. Keys come back in first-seen order;
/// keys with no rows are absent (see [`zero_fill`]).
pub fn aggregate<'a, R, K, I, F>(rows: I, mut key_fn: F) -> IndexMap<K, AggregatedRecord>
where
    R: Weighted + 'a,
    K: Hash + Eq,
    I: IntoIterator<Item = &'a R>,
    F: FnMut(&R) -> Option<K>,
{
    let mut groups: IndexMap<K, Accumulator> = IndexMap::new();
    for row in rows {
        if let Some(key) = key_fn(row) {
            groups.entry(key).or_default().push(row);
        }
    }
    groups.into_iter().map(|(k, acc)| (k, acc.finish())).collect()
}

/// Reduce a whole row set to one record.
pub fn aggregate_all<'a, R, I>(rows: I) -> AggregatedRecord
where
    R: Weighted + 'a,
    I: IntoIterator<Item = &'a R>,
{
    let mut acc = Accumulator::default();
    for row in rows {
        acc.push(row);
    }
    acc.finish()
}

/// Add a zero stub for every requested key that has no aggregate yet.
pub fn zero_fill<K, I>(groups: &mut IndexMap<K, AggregatedRecord>, keys: I)
where
    K: Hash + Eq,
    I: IntoIterator<Item = K>,
{
    for key in keys {
        groups.entry(key).or_default();
    }
}

/// Best page per group across a range: sum each page first, then pick the
/// page with the largest total. Rows without a key or page are ignored.
pub fn best_pages<'a, R, K, I, F>(rows: I, mut key_fn: F) -> IndexMap<K, AggregatedRecord>
where
    R: Weighted + 'a,
    K: Hash + Eq + Clone,
    I: IntoIterator<Item = &'a R>,
    F: FnMut(&R) -> Option<K>,
{
    let per_page = aggregate(rows, |r: &R| Some((key_fn(r)?, r.page()?.to_string())));
    let per_page: Vec<PageTotal<K>> = per_page
        .into_iter()
        .map(|((key, page), record)| PageTotal { key, page, record })
        .collect();
    aggregate(&per_page, |p: &PageTotal<K>| Some(p.key.clone()))
}

struct PageTotal<K> {
    key: K,
    page: String,
    record: AggregatedRecord,
}

impl<K> Weighted for PageTotal<K> {
    fn impressions(&self) -> u64 {
        self.record.impressions
    }
    fn clicks(&self) -> u64 {
        self.record.clicks
    }
    fn position(&self) -> f64 {
        self.record.position
    }
    fn page(&self) -> Option<&str> {
        Some(&self.page)
    }
}

impl Weighted for AggregatedRecord {
    fn impressions(&self) -> u64 {
        self.impressions
    }
    fn clicks(&self) -> u64 {
        self.clicks
    }
    fn position(&self) -> f64 {
        self.position
    }
    fn page(&self) -> Option<&str> {
        self.best_page.as_deref()
    }
}

impl Weighted for PerformanceRow {
    fn impressions(&self) -> u64 {
        self.impressions
    }
    fn clicks(&self) -> u64 {
        self.clicks
    }
    fn position(&self) -> f64 {
        self.position
    }
    fn page(&self) -> Option<&str> {
        self.page.as_deref()
    }
}

// ── Grouping keys ─────────────────────────────────────────────────

pub fn by_query(r: &PerformanceRow) -> Option<String> {
    r.query.clone()
}

pub fn by_date(r: &PerformanceRow) -> Option<NaiveDate> {
    r.date
}

pub fn by_date_query(r: &PerformanceRow) -> Option<(NaiveDate, String)> {
    Some((r.date?, r.query.clone()?))
}

pub fn by_month(r: &PerformanceRow) -> Option<Month> {
    r.date.map(Month::of)
}

pub fn by_month_query(r: &PerformanceRow) -> Option<(Month, String)> {
    Some((Month::of(r.date?), r.query.clone()?))
}

/// A ratio as a display percentage with one decimal.
pub fn display_pct(ratio: f64) -> f64 {
    round1(ratio * 100.0)
}
