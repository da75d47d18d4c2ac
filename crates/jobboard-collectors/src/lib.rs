//! Per-source job collectors: fetch a public board, resolve detail pages, normalize.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use jobboard_core::{extract_skills, NormalizedJob, PostedAt, SourceKind};
use jobboard_http::{DetailSource, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "jobboard-collectors";

/// Inline Greenhouse content shorter than this (after trimming) triggers a detail fetch.
pub const GREENHOUSE_DETAIL_THRESHOLD: usize = 200;

pub const GREENHOUSE_API_BASE: &str = "https://boards-api.greenhouse.io";
pub const LEVER_API_BASE: &str = "https://api.lever.co";
pub const ASHBY_API_BASE: &str = "https://api.ashbyhq.com";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("{kind} board not found for '{org}'")]
    SourceNotFound { kind: SourceKind, org: String },
    #[error("{kind} fetch failed for '{org}': {source}")]
    Fetch {
        kind: SourceKind,
        org: String,
        #[source]
        source: FetchError,
    },
    #[error("{kind} payload for '{org}' has an unexpected shape: {source}")]
    Decode {
        kind: SourceKind,
        org: String,
        #[source]
        source: FetchError,
    },
}

impl CollectorError {
    fn from_fetch(kind: SourceKind, org: &str, err: FetchError) -> Self {
        let org = org.to_string();
        match err {
            FetchError::NotFound { .. } => Self::SourceNotFound { kind, org },
            FetchError::Decode { .. } => Self::Decode { kind, org, source: err },
            other => Self::Fetch { kind, org, source: other },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SourceNotFound { .. })
    }
}

#[async_trait]
pub trait JobCollector: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// One record per upstream job, upstream order preserved.
    async fn fetch(&self, org: &str) -> Result<Vec<NormalizedJob>, CollectorError>;
}

/// API base URL per source; overridable so tests can target a local server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEndpoints {
    pub greenhouse: String,
    pub lever: String,
    pub ashby: String,
}

impl Default for SourceEndpoints {
    fn default() -> Self {
        Self {
            greenhouse: GREENHOUSE_API_BASE.to_string(),
            lever: LEVER_API_BASE.to_string(),
            ashby: ASHBY_API_BASE.to_string(),
        }
    }
}

impl SourceEndpoints {
    pub fn base_for(&self, kind: SourceKind) -> &str {
        match kind {
            SourceKind::Greenhouse => &self.greenhouse,
            SourceKind::Lever => &self.lever,
            SourceKind::Ashby => &self.ashby,
        }
    }
}

pub fn collector_for(
    kind: SourceKind,
    http: HttpFetcher,
    detail: Arc<dyn DetailSource>,
    endpoints: &SourceEndpoints,
) -> Arc<dyn JobCollector> {
    let base_url = endpoints.base_for(kind).trim_end_matches('/').to_string();
    match kind {
        SourceKind::Greenhouse => Arc::new(GreenhouseCollector::new(http, detail, base_url)),
        SourceKind::Lever => Arc::new(LeverCollector::new(http, base_url)),
        SourceKind::Ashby => Arc::new(AshbyCollector::new(http, detail, base_url)),
    }
}

/// Fetch every scheduled detail page concurrently; results line up with `targets`.
/// A failed fetch only costs that job its detail text.
pub async fn resolve_details(
    detail: &dyn DetailSource,
    kind: SourceKind,
    org: &str,
    targets: &[Option<String>],
) -> Vec<Option<String>> {
    let scheduled = targets.iter().filter(|t| t.is_some()).count();
    if scheduled == 0 {
        return vec![None; targets.len()];
    }
    debug!(source = %kind, org, scheduled, "resolving detail pages");

    join_all(targets.iter().map(|target| async move {
        let url = target.as_deref()?;
        match detail.fetch_detail_text(url).await {
            Ok(text) => text,
            Err(err) => {
                warn!(source = %kind, org, url, error = %err, "detail fetch failed");
                None
            }
        }
    }))
    .await
}

/// Case-insensitive "remote" substring test.
pub fn remote_from_location(location: Option<&str>) -> bool {
    location.is_some_and(|l| l.to_lowercase().contains("remote"))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(ToString::to_string)
}

fn with_skills(mut job: NormalizedJob) -> NormalizedJob {
    job.skills = extract_skills([
        Some(job.title.as_str()),
        job.description_text.as_deref(),
        job.location.as_deref(),
    ]);
    job
}

fn pick_description(inline: String, wanted_detail: bool, detail: Option<&String>) -> String {
    match detail {
        Some(text) if wanted_detail && !text.trim().is_empty() => text.clone(),
        _ => inline,
    }
}

// ---- Greenhouse ----------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GreenhouseBoard {
    #[serde(default)]
    pub jobs: Vec<GreenhouseJob>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GreenhouseJob {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub absolute_url: Option<String>,
    #[serde(default)]
    pub location: Option<GreenhouseLocation>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub updated_at: Option<PostedAt>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GreenhouseLocation {
    #[serde(default)]
    pub name: Option<String>,
}

impl GreenhouseJob {
    fn inline_content(&self) -> String {
        self.content.as_deref().unwrap_or_default().trim().to_string()
    }

    fn wants_detail(&self) -> bool {
        self.inline_content().chars().count() < GREENHOUSE_DETAIL_THRESHOLD
    }
}

#[derive(Clone)]
pub struct GreenhouseCollector {
    http: HttpFetcher,
    detail: Arc<dyn DetailSource>,
    base_url: String,
}

impl GreenhouseCollector {
    pub fn new(http: HttpFetcher, detail: Arc<dyn DetailSource>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            detail,
            base_url: base_url.into(),
        }
    }

    pub fn detail_targets(board: &GreenhouseBoard) -> Vec<Option<String>> {
        board
            .jobs
            .iter()
            .map(|job| {
                if job.wants_detail() {
                    job.absolute_url.clone()
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn normalize(org: &str, board: &GreenhouseBoard, details: &[Option<String>]) -> Vec<NormalizedJob> {
        board
            .jobs
            .iter()
            .enumerate()
            .map(|(idx, job)| {
                let location = job.location.as_ref().and_then(|l| l.name.clone());
                let description = pick_description(
                    job.inline_content(),
                    job.wants_detail(),
                    details.get(idx).and_then(Option::as_ref),
                );
                let mut out = NormalizedJob::new(job.title.clone(), org);
                out.remote_flag = Some(remote_from_location(location.as_deref()));
                out.location = location;
                out.description_text = Some(description);
                out.apply_url = job.absolute_url.clone();
                out.canonical_url = job.absolute_url.clone();
                out.posted_at = job.updated_at.clone();
                with_skills(out)
            })
            .collect()
    }
}

#[async_trait]
impl JobCollector for GreenhouseCollector {
    fn kind(&self) -> SourceKind {
        SourceKind::Greenhouse
    }

    async fn fetch(&self, org: &str) -> Result<Vec<NormalizedJob>, CollectorError> {
        let url = format!("{}/v1/boards/{org}/jobs", self.base_url);
        let board: GreenhouseBoard = self
            .http
            .fetch_json(&url, &[("content", "true")])
            .await
            .map_err(|e| CollectorError::from_fetch(self.kind(), org, e))?;

        let targets = Self::detail_targets(&board);
        let details = resolve_details(self.detail.as_ref(), self.kind(), org, &targets).await;
        let jobs = Self::normalize(org, &board, &details);
        info!(source = %self.kind(), org, jobs = jobs.len(), "collected board");
        Ok(jobs)
    }
}

// ---- Lever ---------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverPosting {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub categories: Option<LeverCategories>,
    #[serde(default)]
    pub description_plain: Option<String>,
    #[serde(default)]
    pub apply_url: Option<String>,
    #[serde(default)]
    pub hosted_url: Option<String>,
    #[serde(default)]
    pub workplace_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<PostedAt>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeverCategories {
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Clone)]
pub struct LeverCollector {
    http: HttpFetcher,
    base_url: String,
}

impl LeverCollector {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn normalize(org: &str, postings: &[LeverPosting]) -> Vec<NormalizedJob> {
        postings
            .iter()
            .map(|posting| {
                let title = non_blank(posting.text.as_deref())
                    .or_else(|| posting.title.clone())
                    .unwrap_or_default();
                let location = posting.categories.as_ref().and_then(|c| c.location.clone());
                let remote = match location.as_deref() {
                    Some(loc) => remote_from_location(Some(loc)),
                    None => posting
                        .workplace_type
                        .as_deref()
                        .is_some_and(|w| w.eq_ignore_ascii_case("remote")),
                };
                let apply_url = non_blank(posting.apply_url.as_deref()).or_else(|| posting.hosted_url.clone());
                let canonical_url = non_blank(posting.hosted_url.as_deref()).or_else(|| apply_url.clone());

                let mut out = NormalizedJob::new(title, org);
                out.location = location;
                out.remote_flag = Some(remote);
                out.description_text = Some(posting.description_plain.clone().unwrap_or_default());
                out.apply_url = apply_url;
                out.canonical_url = canonical_url;
                out.posted_at = posting.created_at.clone();
                with_skills(out)
            })
            .collect()
    }
}

#[async_trait]
impl JobCollector for LeverCollector {
    fn kind(&self) -> SourceKind {
        SourceKind::Lever
    }

    async fn fetch(&self, org: &str) -> Result<Vec<NormalizedJob>, CollectorError> {
        let url = format!("{}/v0/postings/{org}", self.base_url);
        let postings: Vec<LeverPosting> = self
            .http
            .fetch_json(&url, &[("mode", "json")])
            .await
            .map_err(|e| CollectorError::from_fetch(self.kind(), org, e))?;

        let jobs = Self::normalize(org, &postings);
        info!(source = %self.kind(), org, jobs = jobs.len(), "collected board");
        Ok(jobs)
    }
}

// ---- Ashby ---------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AshbyBoard {
    #[serde(default)]
    pub jobs: Vec<AshbyJob>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AshbyJob {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub is_remote: Option<bool>,
    #[serde(default)]
    pub description_plain: Option<String>,
    #[serde(default)]
    pub job_url: Option<String>,
    #[serde(default)]
    pub apply_url: Option<String>,
    #[serde(default)]
    pub published_at: Option<PostedAt>,
    #[serde(default)]
    pub compensation: Option<AshbyCompensation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AshbyCompensation {
    #[serde(default)]
    pub summary_components: Vec<AshbyCompensationComponent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AshbyCompensationComponent {
    #[serde(default)]
    pub compensation_type: Option<String>,
    #[serde(default)]
    pub currency_code: Option<String>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
}

impl AshbyJob {
    fn inline_description(&self) -> String {
        self.description_plain
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    fn wants_detail(&self) -> bool {
        self.inline_description().is_empty()
    }

    fn detail_url(&self) -> Option<String> {
        non_blank(self.job_url.as_deref()).or_else(|| self.apply_url.clone())
    }

    fn salary(&self) -> Option<&AshbyCompensationComponent> {
        self.compensation.as_ref()?.summary_components.iter().find(|c| {
            c.compensation_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("salary"))
        })
    }
}

#[derive(Clone)]
pub struct AshbyCollector {
    http: HttpFetcher,
    detail: Arc<dyn DetailSource>,
    base_url: String,
}

impl AshbyCollector {
    pub fn new(http: HttpFetcher, detail: Arc<dyn DetailSource>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            detail,
            base_url: base_url.into(),
        }
    }

    pub fn detail_targets(board: &AshbyBoard) -> Vec<Option<String>> {
        board
            .jobs
            .iter()
            .map(|job| if job.wants_detail() { job.detail_url() } else { None })
            .collect()
    }

    pub fn normalize(org: &str, board: &AshbyBoard, details: &[Option<String>]) -> Vec<NormalizedJob> {
        board
            .jobs
            .iter()
            .enumerate()
            .map(|(idx, job)| {
                let description = pick_description(
                    job.inline_description(),
                    job.wants_detail(),
                    details.get(idx).and_then(Option::as_ref),
                );
                let apply_url = non_blank(job.apply_url.as_deref()).or_else(|| job.job_url.clone());

                let mut out = NormalizedJob::new(job.title.clone(), org);
                out.location = job.location.clone();
                out.remote_flag = Some(job.is_remote.unwrap_or(false));
                out.description_text = Some(description);
                out.canonical_url = apply_url.clone();
                out.apply_url = apply_url;
                out.posted_at = job.published_at.clone();
                if let Some(salary) = job.salary() {
                    out.salary_min = salary.min_value.map(|v| v.round() as i64);
                    out.salary_max = salary.max_value.map(|v| v.round() as i64);
                    out.currency = salary.currency_code.clone();
                }
                with_skills(out)
            })
            .collect()
    }
}

#[async_trait]
impl JobCollector for AshbyCollector {
    fn kind(&self) -> SourceKind {
        SourceKind::Ashby
    }

    async fn fetch(&self, org: &str) -> Result<Vec<NormalizedJob>, CollectorError> {
        let url = format!("{}/posting-api/job-board/{org}", self.base_url);
        let board: AshbyBoard = self
            .http
            .fetch_json(&url, &[("includeCompensation", "true")])
            .await
            .map_err(|e| CollectorError::from_fetch(self.kind(), org, e))?;

        let targets = Self::detail_targets(&board);
        let details = resolve_details(self.detail.as_ref(), self.kind(), org, &targets).await;
        let jobs = Self::normalize(org, &board, &details);
        info!(source = %self.kind(), org, jobs = jobs.len(), "collected board");
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use jobboard_http::{BackoffPolicy, HttpClientConfig, NoDetail};
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Scripted detail pages keyed by URL; unknown URLs fail.
    #[derive(Default)]
    struct ScriptedDetail {
        pages: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedDetail {
        fn with(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(u, t)| (u.to_string(), t.to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DetailSource for ScriptedDetail {
        async fn fetch_detail_text(&self, url: &str) -> Result<Option<String>, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            match self.pages.get(url) {
                Some(text) => Ok(Some(text.clone())),
                None => Err(FetchError::HttpStatus {
                    status: 500,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn gh_job(title: &str, url: &str, content: &str) -> GreenhouseJob {
        GreenhouseJob {
            title: title.into(),
            absolute_url: Some(url.into()),
            location: Some(GreenhouseLocation {
                name: Some("Remote - US".into()),
            }),
            content: Some(content.into()),
            updated_at: Some(PostedAt::Text("2024-01-01T00:00:00Z".into())),
        }
    }

    #[test]
    fn greenhouse_threshold_is_two_hundred_trimmed_chars() {
        let board = GreenhouseBoard {
            jobs: vec![
                gh_job("A", "https://x/a", &"a".repeat(199)),
                gh_job("B", "https://x/b", &"b".repeat(200)),
                gh_job("C", "https://x/c", &format!("   {}   ", "c".repeat(199))),
            ],
        };
        assert_eq!(
            GreenhouseCollector::detail_targets(&board),
            vec![Some("https://x/a".to_string()), None, Some("https://x/c".to_string())]
        );
    }

    #[test]
    fn greenhouse_substitutes_detail_only_when_fetch_was_scheduled() {
        let board = GreenhouseBoard {
            jobs: vec![
                gh_job("Short", "https://x/a", "tiny"),
                gh_job("Long", "https://x/b", &"b".repeat(250)),
            ],
        };
        let details = vec![Some("Full Python posting".to_string()), Some("ignored".to_string())];
        let jobs = GreenhouseCollector::normalize("acme", &board, &details);

        assert_eq!(jobs[0].description_text.as_deref(), Some("Full Python posting"));
        assert_eq!(jobs[0].skills, vec!["python"]);
        assert_eq!(jobs[1].description_text.as_deref(), Some("b".repeat(250).as_str()));
    }

    #[test]
    fn greenhouse_fields_map_onto_the_record() {
        let board: GreenhouseBoard = serde_json::from_value(json!({
            "jobs": [{
                "title": "Engineer",
                "absolute_url": "https://acme.co/1",
                "location": {"name": "Remote"},
                "content": "",
                "updated_at": "2024-01-01"
            }]
        }))
        .unwrap();
        let jobs = GreenhouseCollector::normalize("acme", &board, &[None]);
        let job = &jobs[0];
        assert_eq!(job.company, "acme");
        assert_eq!(job.location.as_deref(), Some("Remote"));
        assert_eq!(job.remote_flag, Some(true));
        assert_eq!(job.description_text.as_deref(), Some(""));
        assert_eq!(job.apply_url.as_deref(), Some("https://acme.co/1"));
        assert_eq!(job.canonical_url.as_deref(), Some("https://acme.co/1"));
        assert_eq!(job.posted_at, Some(PostedAt::Text("2024-01-01".into())));
        assert!(job.skills.is_empty());
    }

    #[test]
    fn ashby_fetches_detail_for_empty_inline_description_only() {
        let board: AshbyBoard = serde_json::from_value(json!({
            "jobs": [
                {"title": "A", "jobUrl": "https://jobs.ashby/a", "applyUrl": "https://apply/a", "descriptionPlain": "  "},
                {"title": "B", "applyUrl": "https://apply/b"},
                {"title": "C", "jobUrl": "https://jobs.ashby/c", "descriptionPlain": "short but trusted"}
            ]
        }))
        .unwrap();
        assert_eq!(
            AshbyCollector::detail_targets(&board),
            vec![
                Some("https://jobs.ashby/a".to_string()),
                Some("https://apply/b".to_string()),
                None
            ]
        );

        let jobs = AshbyCollector::normalize("acme", &board, &[Some("Docker all day".into()), None, None]);
        assert_eq!(jobs[0].description_text.as_deref(), Some("Docker all day"));
        assert_eq!(jobs[0].skills, vec!["docker"]);
        assert_eq!(jobs[0].canonical_url.as_deref(), Some("https://apply/a"));
        assert_eq!(jobs[1].description_text.as_deref(), Some(""));
        assert_eq!(jobs[2].description_text.as_deref(), Some("short but trusted"));
        assert_eq!(jobs[2].apply_url.as_deref(), Some("https://jobs.ashby/c"));
    }

    #[test]
    fn ashby_reads_salary_component() {
        let board: AshbyBoard = serde_json::from_value(json!({
            "jobs": [{
                "title": "Engineer",
                "isRemote": true,
                "applyUrl": "https://apply/1",
                "descriptionPlain": "Rust",
                "publishedAt": "2024-02-01T12:00:00.000+00:00",
                "compensation": {"summaryComponents": [
                    {"compensationType": "EquityPercentage", "minValue": 0.1, "maxValue": 0.5},
                    {"compensationType": "Salary", "currencyCode": "USD", "minValue": 120000.4, "maxValue": 150000.6}
                ]}
            }]
        }))
        .unwrap();
        let job = &AshbyCollector::normalize("acme", &board, &[None])[0];
        assert_eq!(job.remote_flag, Some(true));
        assert_eq!(job.salary_min, Some(120_000));
        assert_eq!(job.salary_max, Some(150_001));
        assert_eq!(job.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn lever_fallbacks() {
        let postings: Vec<LeverPosting> = serde_json::from_value(json!([
            {
                "text": "Data Engineer",
                "categories": {"location": "NYC"},
                "descriptionPlain": "Airflow and Spark",
                "hostedUrl": "https://jobs.lever.co/acme/1",
                "applyUrl": "https://jobs.lever.co/acme/1/apply",
                "createdAt": 1704067200000i64
            },
            {
                "title": "Fallback Title",
                "workplaceType": "remote",
                "applyUrl": "https://jobs.lever.co/acme/2/apply"
            }
        ]))
        .unwrap();
        let jobs = LeverCollector::normalize("acme", &postings);

        assert_eq!(jobs[0].title, "Data Engineer");
        assert_eq!(jobs[0].remote_flag, Some(false));
        assert_eq!(jobs[0].skills, vec!["airflow", "spark"]);
        assert_eq!(jobs[0].canonical_url.as_deref(), Some("https://jobs.lever.co/acme/1"));
        assert_eq!(jobs[0].apply_url.as_deref(), Some("https://jobs.lever.co/acme/1/apply"));
        assert_eq!(jobs[0].posted_at, Some(PostedAt::Epoch(1_704_067_200_000)));

        assert_eq!(jobs[1].title, "Fallback Title");
        assert_eq!(jobs[1].remote_flag, Some(true));
        assert_eq!(jobs[1].description_text.as_deref(), Some(""));
        assert_eq!(jobs[1].canonical_url.as_deref(), Some("https://jobs.lever.co/acme/2/apply"));
    }

    #[tokio::test]
    async fn failed_detail_fetch_only_affects_its_own_job() {
        let detail = ScriptedDetail::with(&[("https://x/a", "A detail"), ("https://x/c", "C detail")]);
        let targets = vec![
            Some("https://x/a".to_string()),
            Some("https://x/broken".to_string()),
            None,
            Some("https://x/c".to_string()),
        ];
        let out = resolve_details(&detail, SourceKind::Greenhouse, "acme", &targets).await;
        assert_eq!(
            out,
            vec![Some("A detail".to_string()), None, None, Some("C detail".to_string())]
        );
        assert_eq!(detail.calls().len(), 3);
    }

    async fn spawn_boards() -> String {
        let app = Router::new()
            .route(
                "/v1/boards/{token}/jobs",
                get(|Path(token): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                    match token.as_str() {
                        "acme" => {}
                        "down" => return Err(StatusCode::INTERNAL_SERVER_ERROR),
                        _ => return Err(StatusCode::NOT_FOUND),
                    }
                    if q.get("content").map(String::as_str) != Some("true") {
                        return Err(StatusCode::BAD_REQUEST);
                    }
                    Ok(Json(json!({"jobs": [
                        {"title": "Engineer", "absolute_url": "https://acme.co/1", "content": "", "location": {"name": "Remote"}},
                        {"title": "Analyst", "absolute_url": "https://acme.co/2", "content": "x".repeat(210)}
                    ]})))
                }),
            )
            .route(
                "/v0/postings/{org}",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("mode").map(String::as_str) != Some("json") {
                        return Err(StatusCode::BAD_REQUEST);
                    }
                    Ok(Json(json!([{"text": "Ops", "hostedUrl": "https://lever/1"}])))
                }),
            )
            .route(
                "/posting-api/job-board/{name}",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("includeCompensation").map(String::as_str) != Some("true") {
                        return Err(StatusCode::BAD_REQUEST);
                    }
                    Ok(Json(json!({"unexpected": true, "jobs": "nope"})))
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy::none(),
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    fn endpoints(base: &str) -> SourceEndpoints {
        SourceEndpoints {
            greenhouse: base.to_string(),
            lever: base.to_string(),
            ashby: format!("{base}/"),
        }
    }

    #[tokio::test]
    async fn greenhouse_collects_with_content_query_and_detail() {
        let base = spawn_boards().await;
        let detail = Arc::new(ScriptedDetail::with(&[("https://acme.co/1", "Kubernetes operators")]));
        let collector = collector_for(SourceKind::Greenhouse, http(), detail.clone(), &endpoints(&base));

        let jobs = collector.fetch("acme").await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].title, "Engineer");
        assert_eq!(jobs[0].skills, vec!["kubernetes"]);
        assert_eq!(jobs[1].title, "Analyst");
        assert_eq!(detail.calls(), vec!["https://acme.co/1".to_string()]);
    }

    #[tokio::test]
    async fn missing_board_is_source_not_found() {
        let base = spawn_boards().await;
        let collector = collector_for(SourceKind::Greenhouse, http(), Arc::new(NoDetail), &endpoints(&base));
        let err = collector.fetch("nope").await.unwrap_err();
        assert!(err.is_not_found(), "{err}");
        assert_eq!(err.to_string(), "Greenhouse board not found for 'nope'");
    }

    #[tokio::test]
    async fn upstream_server_error_is_a_fetch_error() {
        let base = spawn_boards().await;
        let collector = collector_for(SourceKind::Greenhouse, http(), Arc::new(NoDetail), &endpoints(&base));
        let err = collector.fetch("down").await.unwrap_err();
        assert!(
            matches!(
                err,
                CollectorError::Fetch {
                    source: FetchError::HttpStatus { status: 500, .. },
                    ..
                }
            ),
            "{err}"
        );
    }

    #[tokio::test]
    async fn lever_sends_mode_json() {
        let base = spawn_boards().await;
        let collector = collector_for(SourceKind::Lever, http(), Arc::new(NoDetail), &endpoints(&base));
        let jobs = collector.fetch("acme").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].canonical_url.as_deref(), Some("https://lever/1"));
    }

    #[tokio::test]
    async fn unexpected_payload_is_a_decode_error() {
        let base = spawn_boards().await;
        let collector = collector_for(SourceKind::Ashby, http(), Arc::new(NoDetail), &endpoints(&base));
        let err = collector.fetch("acme").await.unwrap_err();
        assert!(matches!(err, CollectorError::Decode { kind: SourceKind::Ashby, .. }), "{err}");
    }
}
