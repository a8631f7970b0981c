//! Collector Interface
//!
//! The coordinator never talks to a data source directly. It hands a
//! [`Task`] to a [`Collector`] and gets back one [`RunResult`] per attempt.
//!
//! [`PagedCollector`] is the stock implementation: it walks pages
//! `1..=page_budget` through a [`PageSource`], at most `workers` requests in
//! flight, sleeping the strategy's delay before every request beyond the
//! first wave. [`HttpPageSource`] fetches JSON listing pages over HTTP.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::anomaly::{CollectedItem, RunResult};
use crate::error::CollectorError;
use crate::strategy::Task;

/// Executes one collection run for a task
#[async_trait]
pub trait Collector: Send + Sync {
    /// Fetch up to `task.page_budget()` pages.
    ///
    /// `Err` means the run produced nothing usable; partial failures are
    /// reported inside [`RunResult::errors`].
    async fn fetch(&self, task: &Task) -> Result<RunResult, CollectorError>;
}

/// One page of listings from a source
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<Vec<CollectedItem>, CollectorError>;

    fn name(&self) -> &str {
        "source"
    }
}

/// Paged fan-out over a [`PageSource`]
pub struct PagedCollector<S> {
    source: S,
}

impl<S: PageSource> PagedCollector<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

#[async_trait]
impl<S: PageSource> Collector for PagedCollector<S> {
    async fn fetch(&self, task: &Task) -> Result<RunResult, CollectorError> {
        let started = Instant::now();
        let workers = task.workers().max(1);
        let delay = task.delay();
        let source = &self.source;

        debug!(
            "Collecting {} pages from {} ({} workers, {:?} delay)",
            task.page_budget(),
            source.name(),
            workers,
            delay
        );

        let mut pages: Vec<(u32, Result<Vec<CollectedItem>, CollectorError>)> =
            stream::iter(1..=task.page_budget())
                .map(|page| async move {
                    // First wave starts immediately
                    if page as usize > workers && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    (page, source.fetch_page(page).await)
                })
                .buffer_unordered(workers)
                .collect()
                .await;
        pages.sort_by_key(|(page, _)| *page);

        let result = assemble(pages, started.elapsed())?;
        debug!(
            "Run {}: {}/{} pages, {} items, {} errors",
            task.cycle_id(),
            result.pages_succeeded,
            result.pages_attempted,
            result.items.len(),
            result.errors.len()
        );
        Ok(result)
    }
}

/// Fold page outcomes into one run result.
///
/// Fails only when no page succeeded; a transient error wins over a
/// permanent one so the run stays retryable.
fn assemble(
    pages: Vec<(u32, Result<Vec<CollectedItem>, CollectorError>)>,
    duration: Duration,
) -> Result<RunResult, CollectorError> {
    let mut result = RunResult {
        pages_attempted: pages.len() as u32,
        duration,
        ..RunResult::default()
    };

    for (page, outcome) in pages {
        match outcome {
            Ok(items) => {
                result.pages_succeeded += 1;
                result.items.extend(items);
            }
            Err(e) => {
                warn!("Page {} failed: {}", page, e);
                result.errors.push(e);
            }
        }
    }

    if result.pages_succeeded == 0 {
        if let Some(first) = result
            .errors
            .iter()
            .find(|e| e.is_retryable())
            .or_else(|| result.errors.first())
        {
            return Err(first.clone());
        }
    }

    Ok(result)
}

/// JSON listing pages over HTTP: `GET <base_url>?page=N` returning an
/// array of flat objects
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPageSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("scrapebot-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CollectorError::Permanent(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn page_url(&self, page: u32) -> String {
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        format!("{}{}page={}", self.base_url, separator, page)
    }
}

/// Map a request failure onto the collector taxonomy
fn request_error(e: reqwest::Error) -> CollectorError {
    if e.is_timeout() || e.is_connect() {
        CollectorError::Transient(e.to_string())
    } else if e.is_decode() {
        CollectorError::Permanent(format!("Malformed page: {}", e))
    } else {
        CollectorError::classify(&e.to_string())
    }
}

fn status_error(status: reqwest::StatusCode, url: &str) -> CollectorError {
    let message = format!("HTTP {} from {}", status.as_u16(), url);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        CollectorError::Transient(message)
    } else {
        CollectorError::Permanent(message)
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, page: u32) -> Result<Vec<CollectedItem>, CollectorError> {
        let url = self.page_url(page);
        let response = self.client.get(&url).send().await.map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &url));
        }

        response
            .json::<Vec<CollectedItem>>()
            .await
            .map_err(request_error)
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}
