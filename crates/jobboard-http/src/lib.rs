//! HTTP fetch utilities: retrying board fetcher plus the bounded detail-page fetcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{Html, Node};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "jobboard-http";

pub const DEFAULT_DETAIL_CONCURRENCY: usize = 3;
pub const DEFAULT_DETAIL_TIMEOUT: Duration = Duration::from_secs(20);
pub const DETAIL_TEXT_MAX_CHARS: usize = 20_000;
/// Upper bound on detail limiter permits.
pub const MAX_DETAIL_CONCURRENCY: usize = 64;
/// Raw detail bodies are cut off at `max_chars * 4 * DETAIL_BODY_HEADROOM` bytes.
pub const DETAIL_BODY_HEADROOM: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("detail limiter closed")]
    LimiterClosed(#[from] tokio::sync::AcquireError),
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Thin reqwest wrapper with retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str, query: &[(&str, &str)]) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, query, None).instrument(span).await
    }

    /// Like `fetch_bytes`, but stops reading the body after `max_bytes`.
    pub async fn fetch_bytes_capped(&self, url: &str, max_bytes: usize) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, max_bytes);
        self.fetch_with_retries(url, &[], Some(max_bytes)).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, &str)],
        max_bytes: Option<usize>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = read_body(resp, max_bytes).await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(FetchError::NotFound { url: final_url });
                    }
                    if classify_status(status) == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        debug!(%status, attempt, "retrying after transient status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(url, query).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.fetch_bytes(url, &[]).await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }

    /// Lossy UTF-8 text of at most `max_bytes` of the body.
    pub async fn fetch_text_capped(&self, url: &str, max_bytes: usize) -> Result<String, FetchError> {
        let resp = self.fetch_bytes_capped(url, max_bytes).await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }
}

async fn read_body(mut resp: reqwest::Response, max_bytes: Option<usize>) -> Result<Vec<u8>, FetchError> {
    let Some(limit) = max_bytes else {
        return Ok(resp.bytes().await?.to_vec());
    };
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = limit - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            debug!(limit, "body truncated at byte limit");
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Process-wide cap on concurrent detail-page fetches. Clones share permits.
/// Capacity is clamped to `1..=MAX_DETAIL_CONCURRENCY`.
#[derive(Debug, Clone)]
pub struct DetailLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl DetailLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_DETAIL_CONCURRENCY);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>, FetchError> {
        Ok(self.permits.acquire().await?)
    }
}

impl Default for DetailLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_DETAIL_CONCURRENCY)
    }
}

/// Source of supplementary description text for a posting URL.
#[async_trait]
pub trait DetailSource: Send + Sync {
    /// `Ok(None)` means no detail is available without it being an error.
    async fn fetch_detail_text(&self, url: &str) -> Result<Option<String>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct DetailFetchConfig {
    pub enabled: bool,
    pub timeout: Duration,
    pub max_chars: usize,
    pub user_agent: Option<String>,
}

impl Default for DetailFetchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: DEFAULT_DETAIL_TIMEOUT,
            max_chars: DETAIL_TEXT_MAX_CHARS,
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct DetailFetcher {
    http: HttpFetcher,
    limiter: DetailLimiter,
    enabled: bool,
    max_chars: usize,
}

impl DetailFetcher {
    pub fn new(config: DetailFetchConfig, limiter: DetailLimiter) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
            backoff: BackoffPolicy::none(),
        })?;
        Ok(Self {
            http,
            limiter,
            enabled: config.enabled,
            max_chars: config.max_chars,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limiter(&self) -> &DetailLimiter {
        &self.limiter
    }
}

#[async_trait]
impl DetailSource for DetailFetcher {
    async fn fetch_detail_text(&self, url: &str) -> Result<Option<String>, FetchError> {
        if !self.enabled || url.trim().is_empty() {
            return Ok(None);
        }
        let html = {
            let _permit = self.limiter.acquire().await?;
            let max_bytes = self.max_chars.saturating_mul(4).saturating_mul(DETAIL_BODY_HEADROOM);
            self.http.fetch_text_capped(url, max_bytes).await?
        };
        let text = truncate_chars(&html_to_text(&html), self.max_chars);
        Ok(Some(text))
    }
}

/// A detail source that never has anything; used when detail fetching is off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDetail;

#[async_trait]
impl DetailSource for NoDetail {
    async fn fetch_detail_text(&self, _url: &str) -> Result<Option<String>, FetchError> {
        Ok(None)
    }
}

const INVISIBLE_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// Visible text of an HTML document with whitespace collapsed to single spaces.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut pieces: Vec<&str> = Vec::new();
    for node in document.tree.nodes() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| INVISIBLE_ELEMENTS.contains(&el.name()))
        });
        if !hidden {
            pieces.push(&**text);
        }
    }
    pieces
        .iter()
        .flat_map(|piece| piece.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{extract::State, http::StatusCode as AxumStatus, routing::get, Router};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        hits: AtomicUsize,
    }

    async fn slow_page(State(gauge): State<Arc<Gauge>>) -> axum::response::Html<&'static str> {
        gauge.hits.fetch_add(1, Ordering::SeqCst);
        let now = gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
        axum::response::Html("<html><head><title>t</title></head><body><h1>Role</h1><script>var x = 1;</script><p>Build   things</p></body></html>")
    }

    async fn spawn_server(gauge: Arc<Gauge>) -> String {
        let app = Router::new()
            .route("/job", get(slow_page))
            .route("/missing", get(|| async { AxumStatus::NOT_FOUND }))
            .route("/broken", get(|| async { AxumStatus::INTERNAL_SERVER_ERROR }))
            .route("/moved", get(|| async { axum::response::Redirect::temporary("/job") }))
            .route(
                "/stalled",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    axum::response::Html("<p>too late</p>")
                }),
            )
            .route("/huge", get(|| async { axum::response::Html(format!("<p>{}</p>", "a".repeat(64 * 1024))) }))
            .with_state(gauge);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn enabled_config() -> DetailFetchConfig {
        DetailFetchConfig {
            enabled: true,
            timeout: Duration::from_secs(5),
            ..DetailFetchConfig::default()
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[test]
    fn html_to_text_drops_markup_and_scripts() {
        let html = "<html><head><style>p{}</style></head><body><div>Hello <b>world</b></div>\n<script>alert(1)</script><p>  second\tline </p></body></html>";
        assert_eq!(html_to_text(html), "Hello world second line");
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        let long = "ü".repeat(DETAIL_TEXT_MAX_CHARS + 50);
        assert_eq!(truncate_chars(&long, DETAIL_TEXT_MAX_CHARS).chars().count(), DETAIL_TEXT_MAX_CHARS);
    }

    #[tokio::test]
    async fn disabled_detail_fetcher_makes_no_request() {
        let gauge = Arc::new(Gauge::default());
        let base = spawn_server(gauge.clone()).await;
        let fetcher = DetailFetcher::new(DetailFetchConfig::default(), DetailLimiter::default()).unwrap();

        let out = fetcher.fetch_detail_text(&format!("{base}/job")).await.unwrap();
        assert!(out.is_none());
        assert_eq!(gauge.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_url_short_circuits() {
        let fetcher = DetailFetcher::new(enabled_config(), DetailLimiter::default()).unwrap();
        assert!(fetcher.fetch_detail_text("").await.unwrap().is_none());
        assert!(fetcher.fetch_detail_text("   ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn detail_text_is_plain_and_redirects_are_followed() {
        let gauge = Arc::new(Gauge::default());
        let base = spawn_server(gauge.clone()).await;
        let fetcher = DetailFetcher::new(enabled_config(), DetailLimiter::default()).unwrap();

        let text = fetcher.fetch_detail_text(&format!("{base}/moved")).await.unwrap();
        assert_eq!(text.as_deref(), Some("Role Build things"));
    }

    #[tokio::test]
    async fn detail_errors_surface_as_fetch_errors() {
        let base = spawn_server(Arc::new(Gauge::default())).await;
        let fetcher = DetailFetcher::new(enabled_config(), DetailLimiter::default()).unwrap();

        let missing = fetcher.fetch_detail_text(&format!("{base}/missing")).await;
        assert!(matches!(missing, Err(FetchError::NotFound { .. })));
        let broken = fetcher.fetch_detail_text(&format!("{base}/broken")).await;
        assert!(matches!(broken, Err(FetchError::HttpStatus { status: 500, .. })));
    }

    #[tokio::test]
    async fn detail_timeout_is_a_fetch_error() {
        let base = spawn_server(Arc::new(Gauge::default())).await;
        let fetcher = DetailFetcher::new(
            DetailFetchConfig {
                timeout: Duration::from_millis(200),
                ..enabled_config()
            },
            DetailLimiter::default(),
        )
        .unwrap();

        let out = fetcher.fetch_detail_text(&format!("{base}/stalled")).await;
        assert!(matches!(out, Err(FetchError::Request(ref e)) if e.is_timeout()), "{out:?}");
    }

    #[tokio::test]
    async fn capped_fetch_stops_reading_at_the_byte_limit() {
        let base = spawn_server(Arc::new(Gauge::default())).await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

        let capped = http.fetch_text_capped(&format!("{base}/huge"), 1000).await.unwrap();
        assert_eq!(capped.len(), 1000);
        assert!(capped.starts_with("<p>aaa"));

        let full = http.fetch_text(&format!("{base}/huge")).await.unwrap();
        assert_eq!(full.len(), 64 * 1024 + 7);
    }

    #[tokio::test]
    async fn detail_body_cap_scales_with_max_chars() {
        let base = spawn_server(Arc::new(Gauge::default())).await;
        let fetcher = DetailFetcher::new(
            DetailFetchConfig {
                max_chars: 100,
                ..enabled_config()
            },
            DetailLimiter::default(),
        )
        .unwrap();

        let text = fetcher.fetch_detail_text(&format!("{base}/huge")).await.unwrap().unwrap();
        assert_eq!(text.chars().count(), 100);
        assert!(text.chars().all(|c| c == 'a'));
    }

    #[test]
    fn limiter_capacity_is_clamped() {
        assert_eq!(DetailLimiter::new(0).capacity(), 1);
        let huge = DetailLimiter::new(usize::MAX);
        assert_eq!(huge.capacity(), MAX_DETAIL_CONCURRENCY);
        assert_eq!(huge.available(), MAX_DETAIL_CONCURRENCY);
    }

    #[tokio::test]
    async fn limiter_bounds_concurrent_detail_fetches() {
        let gauge = Arc::new(Gauge::default());
        let base = spawn_server(gauge.clone()).await;
        let limiter = DetailLimiter::new(2);
        let fetcher = Arc::new(DetailFetcher::new(enabled_config(), limiter.clone()).unwrap());

        let url = format!("{base}/job");
        let tasks = (0..8)
            .map(|_| {
                let fetcher = fetcher.clone();
                let url = url.clone();
                tokio::spawn(async move { fetcher.fetch_detail_text(&url).await })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            assert!(task.await.unwrap().unwrap().is_some());
        }

        assert_eq!(gauge.hits.load(Ordering::SeqCst), 8);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn fetch_json_reports_not_found_and_decode_errors() {
        let base = spawn_server(Arc::new(Gauge::default())).await;
        let http = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy::none(),
            ..HttpClientConfig::default()
        })
        .unwrap();

        let missing = http.fetch_json::<serde_json::Value>(&format!("{base}/missing"), &[]).await;
        assert!(missing.unwrap_err().is_not_found());
        let not_json = http.fetch_json::<serde_json::Value>(&format!("{base}/job"), &[]).await;
        assert!(matches!(not_json, Err(FetchError::Decode { .. })));
    }
}
