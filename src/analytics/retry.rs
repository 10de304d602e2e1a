use std::time::Duration;

use super::{AnalyticsRequest, AnalyticsSource, PerformanceRow};
use crate::error::{Error, FetchErrorKind, Result};

/// Timeout and retry bounds for a single analytics fetch.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    /// First backoff; doubles on each further retry.
    pub backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

impl FetchPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Fetch one window with a bounded timeout per attempt and bounded retries on
/// retryable failures, then resolve rows against the requested dimensions.
///
/// An absent response is logged and returned as an empty set.
pub async fn fetch_rows(
    source: &dyn AnalyticsSource,
    request: &AnalyticsRequest,
    policy: &FetchPolicy,
) -> Result<Vec<PerformanceRow>> {
    let mut attempt: u32 = 0;
    let raw = loop {
        let outcome = match tokio::time::timeout(policy.timeout, source.get_analytics(request)).await {
            Ok(res) => res,
            Err(_) => Err(Error::fetch(
                FetchErrorKind::Timeout,
                format!("no response within {}s", policy.timeout.as_secs()),
            )),
        };
        match outcome {
            Ok(rows) => break rows,
            Err(Error::Fetch { kind, message }) if kind.is_retryable() && attempt < policy.max_retries => {
                let wait = policy.backoff_for(attempt);
                log::warn!(
                    "{} failed ({kind}: {message}). Waiting {}s before retry {}/{}",
                    request.describe(),
                    wait.as_secs(),
                    attempt + 1,
                    policy.max_retries
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    };

    match raw {
        None => {
            log::info!("{}: no data returned", request.describe());
            Ok(Vec::new())
        }
        Some(rows) => rows
            .iter()
            .map(|r| PerformanceRow::from_raw(r, &request.dimensions))
            .collect(),
    }
}
