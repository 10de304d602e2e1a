use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{Error, Result};

/// A tracked site and its keyword list. Read-only to the sync engine.
#[derive(Debug, Clone, Serialize)]
pub struct Campaign {
    pub campaign_id: String,
    pub site_url: String,
    /// Newline-delimited, as entered.
    pub keywords_raw: String,
    pub start_date: Option<NaiveDate>,
    pub linked_account: Option<String>,
}

impl Campaign {
    /// Normalized tracked keywords, first occurrence order.
    pub fn keywords(&self) -> Vec<String> {
        parse_keywords(&self.keywords_raw)
    }

    /// Everything a sync needs before it can compute a single window.
    pub fn require_start_date(&self) -> Result<NaiveDate> {
        self.start_date.ok_or_else(|| {
            Error::Config(format!("campaign {} has no start date", self.campaign_id))
        })
    }

    pub fn require_linked_account(&self) -> Result<&str> {
        match self.linked_account.as_deref() {
            Some(a) if !a.trim().is_empty() => Ok(a),
            _ => Err(Error::Config(format!(
                "campaign {} has no linked Search Console account",
                self.campaign_id
            ))),
        }
    }
}

/// Keywords compare case-insensitively with surrounding whitespace ignored.
pub fn normalize_keyword(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn parse_keywords(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in raw.lines() {
        let kw = normalize_keyword(line);
        if !kw.is_empty() && !out.contains(&kw) {
            out.push(kw);
        }
    }
    out
}

/// Stable text form of a keyword set, used to tie checkpoints to the set
/// they were recorded for.
pub fn keyword_set_fingerprint(keywords: &[String]) -> String {
    let mut sorted: Vec<&str> = keywords.iter().map(|k| k.as_str()).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join("\n")
}
