use chrono::NaiveDate;

use crate::campaign::keyword_set_fingerprint;
use crate::date_util::date_key;
use crate::error::Result;
use crate::storage::{repository, Database};
use crate::sync::windows::DateWindow;
use crate::sync::Flow;

/// Something a flow may already have synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// A backfill month window: every tracked keyword has a populated daily
    /// row for every day in the window.
    Month(DateWindow),
    /// Every tracked keyword has a baseline position.
    InitialPosition,
    /// A site-wide traffic row exists for the date.
    SiteDaily(NaiveDate),
    /// Every tracked keyword has a populated daily row for the date.
    KeywordDay(NaiveDate),
}

impl Scope {
    pub fn flow(&self) -> Flow {
        match self {
            Scope::Month(_) => Flow::HistoricalBackfill,
            Scope::InitialPosition => Flow::InitialPosition,
            Scope::SiteDaily(_) | Scope::KeywordDay(_) => Flow::DailyIncremental,
        }
    }

    pub fn key(&self) -> String {
        match self {
            Scope::Month(w) => format!("month:{}..{}", date_key(w.start), date_key(w.end)),
            Scope::InitialPosition => "initial".to_string(),
            Scope::SiteDaily(d) => format!("site:{}", date_key(*d)),
            Scope::KeywordDay(d) => format!("keywords:{}", date_key(*d)),
        }
    }

    /// Site-wide scopes don't depend on which keywords are tracked.
    fn is_keyword_scoped(&self) -> bool {
        !matches!(self, Scope::SiteDaily(_))
    }
}

/// Decides from persisted state whether a scope still needs a fetch.
///
/// A checkpoint recorded for the same keyword set short-circuits the check.
/// Otherwise the stored rows are scanned; a passing scan is checkpointed so
/// later runs stay cheap.
pub struct CompletenessChecker<'a> {
    db: &'a Database,
    campaign_id: String,
    site_url: String,
    keywords: Vec<String>,
}

impl<'a> CompletenessChecker<'a> {
    pub fn new(db: &'a Database, campaign_id: &str, site_url: &str, keywords: &[String]) -> Self {
        Self {
            db,
            campaign_id: campaign_id.to_string(),
            site_url: site_url.to_string(),
            keywords: keywords.to_vec(),
        }
    }

    fn fingerprint(&self, scope: &Scope) -> String {
        if scope.is_keyword_scoped() {
            keyword_set_fingerprint(&self.keywords)
        } else {
            String::new()
        }
    }

    pub async fn is_complete(&self, scope: &Scope) -> Result<bool> {
        let flow = scope.flow().as_str();
        let scope_key = scope.key();
        let fingerprint = self.fingerprint(scope);

        let recorded: Option<String> = self
            .db
            .reader()
            .call({
                let campaign_id = self.campaign_id.clone();
                let scope_key = scope_key.clone();
                move |conn| repository::get_checkpoint(conn, &campaign_id, flow, &scope_key)
            })
            .await?;
        if recorded.as_deref() == Some(fingerprint.as_str()) {
            log::debug!("{}: {scope_key} complete (checkpoint)", self.campaign_id);
            return Ok(true);
        }

        let complete = self.scan(scope).await?;
        if complete {
            self.record_complete(scope).await?;
        }
        Ok(complete)
    }

    /// Mark a scope complete for the current keyword set.
    pub async fn record_complete(&self, scope: &Scope) -> Result<()> {
        let flow = scope.flow().as_str();
        let fingerprint = self.fingerprint(scope);
        self.db
            .writer()
            .call({
                let campaign_id = self.campaign_id.clone();
                let scope_key = scope.key();
                move |conn| repository::set_checkpoint(conn, &campaign_id, flow, &scope_key, &fingerprint)
            })
            .await?;
        Ok(())
    }

    async fn scan(&self, scope: &Scope) -> Result<bool> {
        let site_url = self.site_url.clone();
        let keywords = self.keywords.clone();
        let scope = scope.clone();

        let complete = self
            .db
            .reader()
            .call(move |conn| {
                let complete = match &scope {
                    Scope::Month(window) => all_days_populated(conn, &site_url, &keywords, window)?,
                    Scope::KeywordDay(date) => {
                        all_days_populated(conn, &site_url, &keywords, &DateWindow::single_day(*date))?
                    }
                    Scope::InitialPosition => {
                        let have = repository::keywords_with_initial_position(conn, &site_url)?;
                        keywords.iter().all(|k| have.contains(k))
                    }
                    Scope::SiteDaily(date) => repository::traffic_daily_exists(conn, &site_url, *date)?,
                };
                Ok::<bool, rusqlite::Error>(complete)
            })
            .await?;
        Ok(complete)
    }
}

fn all_days_populated(
    conn: &rusqlite::Connection,
    site_url: &str,
    keywords: &[String],
    window: &DateWindow,
) -> std::result::Result<bool, rusqlite::Error> {
    let needed = window.num_days() as u32;
    let counts = repository::count_populated_days(conn, site_url, window)?;
    Ok(keywords
        .iter()
        .all(|k| counts.get(k).copied().unwrap_or(0) >= needed))
}
