//! Offline check of the aggregation over an exported `searchAnalytics.query`
//! response: no network, no database.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::aggregate::{aggregate, best_pages, by_month_query, zero_fill};
use crate::analytics::{AnalyticsRow, Dimension, PerformanceRow};
use crate::campaign::parse_keywords;
use crate::date_util::Month;
use crate::error::{Error, Result};

const DEFAULT_DIMENSIONS: &[Dimension] = &[Dimension::Date, Dimension::Query, Dimension::Page];

/// Either the full response body with its dimension list, or a bare row array
/// in `date, query, page` order.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RowsFile {
    Export {
        #[serde(default)]
        dimensions: Option<Vec<Dimension>>,
        #[serde(default)]
        rows: Vec<AnalyticsRow>,
    },
    Bare(Vec<AnalyticsRow>),
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryDiagnostic {
    pub month: String,
    pub query: String,
    pub best_page: Option<String>,
    pub impressions: u64,
    pub clicks: u64,
    pub position: f64,
}

pub fn parse_rows(json: &str) -> Result<Vec<PerformanceRow>> {
    let file: RowsFile = serde_json::from_str(json)?;
    let (dimensions, rows) = match file {
        RowsFile::Export { dimensions, rows } => {
            (dimensions.unwrap_or_else(|| DEFAULT_DIMENSIONS.to_vec()), rows)
        }
        RowsFile::Bare(rows) => (DEFAULT_DIMENSIONS.to_vec(), rows),
    };
    for needed in [Dimension::Date, Dimension::Query] {
        if !dimensions.contains(&needed) {
            return Err(Error::Input(format!(
                "rows must include the {needed:?} dimension, got {dimensions:?}"
            )));
        }
    }
    rows.iter()
        .enumerate()
        .map(|(i, r)| {
            PerformanceRow::from_raw(r, &dimensions)
                .map_err(|e| Error::Input(format!("row {i}: {e}")))
        })
        .collect()
}

pub fn parse_months(list: &str) -> Result<Vec<Month>> {
    let mut months: Vec<Month> = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Month::parse)
        .collect::<Result<_>>()?;
    if months.is_empty() {
        return Err(Error::Input("no months given".into()));
    }
    months.sort();
    months.dedup();
    Ok(months)
}

/// Per (month, keyword): totals, weighted position and best page. Every
/// requested pair is reported, zeroed when the export has no rows for it.
pub fn diagnose(rows: &[PerformanceRow], keywords: &[String], months: &[Month]) -> Vec<QueryDiagnostic> {
    let tracked: HashSet<&str> = keywords.iter().map(|k| k.as_str()).collect();
    let wanted: HashSet<Month> = months.iter().copied().collect();
    let key = |r: &PerformanceRow| {
        by_month_query(r).filter(|(m, q)| wanted.contains(m) && tracked.contains(q.as_str()))
    };

    let mut groups = aggregate(rows, key);
    zero_fill(
        &mut groups,
        months
            .iter()
            .flat_map(|m| keywords.iter().map(move |k| (*m, k.clone()))),
    );
    let pages = best_pages(rows, key);

    let mut out: Vec<QueryDiagnostic> = groups
        .into_iter()
        .map(|((month, query), rec)| QueryDiagnostic {
            best_page: pages.get(&(month, query.clone())).and_then(|p| p.best_page.clone()),
            month: month.key(),
            query,
            impressions: rec.impressions,
            clicks: rec.clicks,
            position: rec.position,
        })
        .collect();
    let order = |q: &str| keywords.iter().position(|k| k == q).unwrap_or(usize::MAX);
    out.sort_by(|a, b| a.month.cmp(&b.month).then(order(&a.query).cmp(&order(&b.query))));
    out
}

/// Load all three inputs from disk and run [`diagnose`].
pub fn diagnose_files(rows_path: &Path, keywords_path: &Path, months: &str) -> Result<Vec<QueryDiagnostic>> {
    let rows_json = read(rows_path)?;
    let rows = parse_rows(&rows_json)?;
    let keywords = parse_keywords(&read(keywords_path)?);
    if keywords.is_empty() {
        return Err(Error::Input(format!("{} lists no keywords", keywords_path.display())));
    }
    let months = parse_months(months)?;
    Ok(diagnose(&rows, &keywords, &months))
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::Input(format!("{}: {e}", path.display())))
}
