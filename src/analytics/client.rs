use async_trait::async_trait;
use chrono::Duration;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{AnalyticsRequest, AnalyticsRow, AnalyticsSource, Dimension};
use crate::date_util::date_key;
use crate::error::{Error, FetchErrorKind, Result};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/webmasters/v3/";

/// Largest page the API hands out per request.
pub const ROW_LIMIT: usize = 25_000;

/// Search Console `searchAnalytics.query` over HTTPS with a bearer token.
pub struct SearchConsoleClient {
    http: reqwest::Client,
    base_url: Url,
    access_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    start_date: String,
    end_date: String,
    dimensions: &'a [Dimension],
    row_limit: usize,
    start_row: usize,
    data_state: &'static str,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    rows: Option<Vec<AnalyticsRow>>,
}

impl SearchConsoleClient {
    pub fn new(access_token: &str) -> Result<Self> {
        Self::with_base_url(DEFAULT_API_BASE, access_token)
    }

    pub fn with_base_url(base_url: &str, access_token: &str) -> Result<Self> {
        if access_token.trim().is_empty() {
            return Err(Error::Config("Search Console access token is empty".into()));
        }
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid api_base_url '{base_url}': {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            access_token: access_token.trim().to_string(),
        })
    }

    /// `{base}/sites/{site}/searchAnalytics/query` with the site URL
    /// percent-encoded as a single path segment.
    fn query_url(&self, site_url: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("api_base_url cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["sites", site_url, "searchAnalytics", "query"]);
        Ok(url)
    }

    async fn fetch_page(&self, url: &Url, body: &QueryBody<'_>) -> Result<Vec<AnalyticsRow>> {
        let response = self
            .http
            .post(url.clone())
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::fetch(classify_status(status), format!("HTTP {status}: {text}")));
        }

        let parsed: QueryResponse = response.json().await?;
        Ok(parsed.rows.unwrap_or_default())
    }
}

fn classify_status(status: StatusCode) -> FetchErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchErrorKind::Auth,
        StatusCode::TOO_MANY_REQUESTS => FetchErrorKind::Quota,
        s if s.is_server_error() => FetchErrorKind::Server,
        _ => FetchErrorKind::Transport,
    }
}

#[async_trait]
impl AnalyticsSource for SearchConsoleClient {
    async fn get_analytics(&self, request: &AnalyticsRequest) -> Result<Option<Vec<AnalyticsRow>>> {
        if request.window.is_empty() {
            return Ok(None);
        }
        let url = self.query_url(&request.site_url)?;
        // The API's end date is inclusive.
        let end_inclusive = request.window.end - Duration::days(1);
        let mut all_rows: Vec<AnalyticsRow> = Vec::new();
        let mut start_row = 0;

        loop {
            let body = QueryBody {
                start_date: date_key(request.window.start),
                end_date: date_key(end_inclusive),
                dimensions: &request.dimensions,
                row_limit: ROW_LIMIT,
                start_row,
                data_state: if request.wait_for_all_data { "final" } else { "all" },
            };
            let page = self.fetch_page(&url, &body).await?;
            let page_len = page.len();
            all_rows.extend(page);
            if page_len < ROW_LIMIT {
                break;
            }
            start_row += page_len;
            log::debug!("{}: fetched {start_row} rows, requesting next page", request.describe());
        }

        if all_rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(all_rows))
        }
    }
}
