//! Thin axum JSON API over the job store: search, trends, manual upserts and status.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jobboard_core::{JobEntity, NormalizedJob, SourceKind, ValidationError};
use jobboard_ingest::IngestConfig;
use jobboard_store::{
    CompanyCount, JobQuery, JobStore, JobsPage, RemoteRatio, SkillCount, StoreError, StoreStatus,
    DEFAULT_PAGE_LIMIT, DEFAULT_SEARCH_DAYS, DEFAULT_TREND_DAYS, DEFAULT_TREND_TOP_K,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobboard-web";

pub const DEFAULT_WEB_PORT: u16 = 8000;

const SEARCH_DAYS: RangeInclusive<u32> = 1..=365;
const PAGE_LIMIT: RangeInclusive<u32> = 1..=500;
const TREND_DAYS: RangeInclusive<u32> = 7..=365;
const SKILLS_TOP_K: RangeInclusive<u32> = 1..=50;
const COMPANIES_TOP_K: RangeInclusive<u32> = 1..=100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub orgs: BTreeMap<SourceKind, Vec<String>>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, orgs: BTreeMap<SourceKind, Vec<String>>) -> Self {
        Self { store, orgs }
    }

    pub fn from_config(config: &IngestConfig, store: Arc<dyn JobStore>) -> Self {
        Self::new(store, config.orgs.clone())
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("{name} must be between {min} and {max}")]
    OutOfRange { name: &'static str, min: u32, max: u32 },
    #[error("{0}")]
    BadQuery(String),
    #[error("{0}")]
    BadBody(String),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(v) => ApiError::Validation(v),
            other => ApiError::Store(other),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadQuery(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadBody(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Validation(e) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", e.to_string()),
            ApiError::OutOfRange { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_PARAMETER", self.to_string()),
            ApiError::BadQuery(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_PARAMETER", msg.clone()),
            ApiError::BadBody(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_BODY", msg.clone()),
            ApiError::Store(e) => {
                error!("store error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORE_ERROR",
                    "A storage error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));
        (status, body).into_response()
    }
}

fn in_range(name: &'static str, value: Option<u32>, default: u32, range: RangeInclusive<u32>) -> Result<u32, ApiError> {
    let value = value.unwrap_or(default);
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ApiError::OutOfRange {
            name,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsParams {
    pub q: Option<String>,
    pub days: Option<u32>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub skill: Option<String>,
    pub location: Option<String>,
    pub remote: Option<bool>,
}

impl JobsParams {
    fn into_query(self) -> Result<JobQuery, ApiError> {
        Ok(JobQuery {
            days: Some(in_range("days", self.days, DEFAULT_SEARCH_DAYS, SEARCH_DAYS)?),
            limit: in_range("limit", self.limit, DEFAULT_PAGE_LIMIT, PAGE_LIMIT)?,
            offset: self.offset.unwrap_or(0),
            q: self.q,
            skill: self.skill,
            location: self.location,
            remote: self.remote,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TrendParams {
    pub days: Option<u32>,
    pub top_k: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct AdminStatus {
    pub sources: BTreeMap<SourceKind, Vec<String>>,
    pub counts: StoreStatus,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(jobs_list_handler).post(upsert_job_handler))
        .route("/jobs/page", get(jobs_page_handler))
        .route("/trends/skills", get(trends_skills_handler))
        .route("/trends/remote_ratio", get(trends_remote_ratio_handler))
        .route("/trends/company_activity", get(trends_company_activity_handler))
        .route("/admin/status", get(admin_status_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("JOBBOARD_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT)
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn upsert_job_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NormalizedJob>, JsonRejection>,
) -> Result<Json<JobEntity>, ApiError> {
    let Json(record) = payload?;
    let entity = state.store.upsert(&record).await?;
    Ok(Json(entity))
}

async fn jobs_list_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<JobsParams>, QueryRejection>,
) -> Result<Json<Vec<JobEntity>>, ApiError> {
    let Query(params) = params?;
    let page = state.store.search(&params.into_query()?).await?;
    Ok(Json(page.items))
}

async fn jobs_page_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<JobsParams>, QueryRejection>,
) -> Result<Json<JobsPage>, ApiError> {
    let Query(params) = params?;
    Ok(Json(state.store.search(&params.into_query()?).await?))
}

async fn trends_skills_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<TrendParams>, QueryRejection>,
) -> Result<Json<Vec<SkillCount>>, ApiError> {
    let Query(params) = params?;
    let days = in_range("days", params.days, DEFAULT_TREND_DAYS, TREND_DAYS)?;
    let top_k = in_range("top_k", params.top_k, DEFAULT_TREND_TOP_K, SKILLS_TOP_K)?;
    Ok(Json(state.store.top_skills(days, top_k).await?))
}

async fn trends_remote_ratio_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<TrendParams>, QueryRejection>,
) -> Result<Json<RemoteRatio>, ApiError> {
    let Query(params) = params?;
    let days = in_range("days", params.days, DEFAULT_TREND_DAYS, TREND_DAYS)?;
    Ok(Json(state.store.remote_ratio(days).await?))
}

async fn trends_company_activity_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<TrendParams>, QueryRejection>,
) -> Result<Json<Vec<CompanyCount>>, ApiError> {
    let Query(params) = params?;
    let days = in_range("days", params.days, DEFAULT_TREND_DAYS, TREND_DAYS)?;
    let top_k = in_range("top_k", params.top_k, DEFAULT_TREND_TOP_K, COMPANIES_TOP_K)?;
    Ok(Json(state.store.company_activity(days, top_k).await?))
}

async fn admin_status_handler(State(state): State<Arc<AppState>>) -> Result<Json<AdminStatus>, ApiError> {
    let counts = state.store.status().await?;
    Ok(Json(AdminStatus {
        sources: state.orgs.clone(),
        counts,
    }))
}
