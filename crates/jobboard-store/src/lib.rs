//! Job persistence: fuzzy-identity upsert, search/filter queries and trend aggregation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jobboard_core::{Clock, JobEntity, NormalizedJob, SystemClock, ValidationError};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobboard-store";

pub const DEFAULT_SEARCH_DAYS: u32 = 30;
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const DEFAULT_TREND_DAYS: u32 = 90;
pub const DEFAULT_TREND_TOP_K: u32 = 15;
pub const STATUS_RECENT_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid job record: {0}")]
    Validation(#[from] ValidationError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Search filters; `None` disables a filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQuery {
    pub q: Option<String>,
    pub days: Option<u32>,
    pub skill: Option<String>,
    pub location: Option<String>,
    pub remote: Option<bool>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            q: None,
            days: Some(DEFAULT_SEARCH_DAYS),
            skill: None,
            location: None,
            remote: None,
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl JobQuery {
    fn keyword(&self) -> Option<String> {
        non_blank_lower(self.q.as_deref())
    }

    fn skill_tag(&self) -> Option<String> {
        non_blank_lower(self.skill.as_deref())
    }

    fn location_needle(&self) -> Option<String> {
        non_blank_lower(self.location.as_deref())
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.days
            .filter(|d| *d > 0)
            .map(|d| now - Duration::days(i64::from(d)))
    }
}

fn non_blank_lower(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_lowercase)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsPage {
    pub total: u64,
    pub count: usize,
    pub next_offset: Option<u32>,
    pub items: Vec<JobEntity>,
}

impl JobsPage {
    fn assemble(total: u64, query: &JobQuery, items: Vec<JobEntity>) -> Self {
        let end = u64::from(query.offset) + u64::from(query.limit);
        let next_offset = if end < total { u32::try_from(end).ok() } else { None };
        Self {
            total,
            count: items.len(),
            next_offset,
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillCount {
    pub skill: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRatio {
    pub total: u64,
    pub remote: u64,
    pub onsite: u64,
    pub remote_pct: f64,
}

impl RemoteRatio {
    fn from_counts(total: u64, remote: u64) -> Self {
        let remote_pct = if total == 0 {
            0.0
        } else {
            remote as f64 / total as f64 * 100.0
        };
        Self {
            total,
            remote,
            onsite: total.saturating_sub(remote),
            remote_pct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyCount {
    pub company: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub total: u64,
    pub last_7d: u64,
}

/// Persistence seam shared by the ingestion pipeline and the query API.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or update by natural identity; one record per transaction.
    async fn upsert(&self, record: &NormalizedJob) -> Result<JobEntity, StoreError>;

    async fn search(&self, query: &JobQuery) -> Result<JobsPage, StoreError>;

    async fn top_skills(&self, days: u32, top_k: u32) -> Result<Vec<SkillCount>, StoreError>;

    async fn remote_ratio(&self, days: u32) -> Result<RemoteRatio, StoreError>;

    async fn company_activity(&self, days: u32, top_k: u32) -> Result<Vec<CompanyCount>, StoreError>;

    async fn status(&self) -> Result<StoreStatus, StoreError>;
}

/// In-process store; the lock is held across lookup and write.
#[derive(Debug)]
pub struct MemoryJobStore {
    clock: Arc<dyn Clock>,
    rows: Mutex<Vec<JobEntity>>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: Mutex::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<JobEntity> {
        self.rows.lock().await.clone()
    }

    fn since(&self, days: u32) -> DateTime<Utc> {
        self.clock.now() - Duration::days(i64::from(days))
    }
}

fn matches_query(job: &JobEntity, query: &JobQuery, cutoff: Option<DateTime<Utc>>) -> bool {
    if cutoff.is_some_and(|c| job.scraped_at < c) {
        return false;
    }
    if let Some(needle) = query.keyword() {
        let hit = job.title.to_lowercase().contains(&needle)
            || job.company.to_lowercase().contains(&needle)
            || job
                .description_text
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle));
        if !hit {
            return false;
        }
    }
    if let Some(tag) = query.skill_tag() {
        if !job.skills.iter().any(|s| s.trim().to_lowercase() == tag) {
            return false;
        }
    }
    if let Some(needle) = query.location_needle() {
        if !job
            .location
            .as_deref()
            .is_some_and(|l| l.to_lowercase().contains(&needle))
        {
            return false;
        }
    }
    if let Some(remote) = query.remote {
        if job.remote_flag != remote {
            return false;
        }
    }
    true
}

fn ranked<K: Ord>(counts: HashMap<K, u64>, top_k: u32) -> Vec<(K, u64)> {
    let mut rows = counts.into_iter().collect::<Vec<_>>();
    rows.sort_by(|(ka, ca), (kb, cb)| cb.cmp(ca).then_with(|| ka.cmp(kb)));
    rows.truncate(top_k as usize);
    rows
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(&self, record: &NormalizedJob) -> Result<JobEntity, StoreError> {
        record.validate()?;
        let now = self.clock.now();
        let mut rows = self.rows.lock().await;

        if let Some(key) = record.dedup_key() {
            if let Some(existing) = rows.iter_mut().find(|row| row.matches(&key)) {
                existing.merge_from(record, now);
                return Ok(existing.clone());
            }
        }

        let entity = JobEntity::create(record, now)?;
        rows.push(entity.clone());
        Ok(entity)
    }

    async fn search(&self, query: &JobQuery) -> Result<JobsPage, StoreError> {
        let cutoff = query.cutoff(self.clock.now());
        let rows = self.rows.lock().await;
        let mut hits = rows
            .iter()
            .filter(|job| matches_query(job, query, cutoff))
            .cloned()
            .collect::<Vec<_>>();
        drop(rows);

        hits.sort_by(|a, b| {
            b.posted_at
                .cmp(&a.posted_at)
                .then_with(|| b.scraped_at.cmp(&a.scraped_at))
        });
        let total = hits.len() as u64;
        let items = hits
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect();
        Ok(JobsPage::assemble(total, query, items))
    }

    async fn top_skills(&self, days: u32, top_k: u32) -> Result<Vec<SkillCount>, StoreError> {
        let since = self.since(days);
        let mut counts = HashMap::<String, u64>::new();
        for job in self.rows.lock().await.iter().filter(|j| j.scraped_at >= since) {
            for skill in &job.skills {
                let skill = skill.trim().to_lowercase();
                if !skill.is_empty() {
                    *counts.entry(skill).or_default() += 1;
                }
            }
        }
        Ok(ranked(counts, top_k)
            .into_iter()
            .map(|(skill, count)| SkillCount { skill, count })
            .collect())
    }

    async fn remote_ratio(&self, days: u32) -> Result<RemoteRatio, StoreError> {
        let since = self.since(days);
        let rows = self.rows.lock().await;
        let recent = rows.iter().filter(|j| j.scraped_at >= since);
        let (total, remote) = recent.fold((0u64, 0u64), |(t, r), j| (t + 1, r + u64::from(j.remote_flag)));
        Ok(RemoteRatio::from_counts(total, remote))
    }

    async fn company_activity(&self, days: u32, top_k: u32) -> Result<Vec<CompanyCount>, StoreError> {
        let since = self.since(days);
        let mut counts = HashMap::<String, u64>::new();
        for job in self.rows.lock().await.iter().filter(|j| j.scraped_at >= since) {
            *counts.entry(job.company.clone()).or_default() += 1;
        }
        Ok(ranked(counts, top_k)
            .into_iter()
            .map(|(company, count)| CompanyCount { company, count })
            .collect())
    }

    async fn status(&self) -> Result<StoreStatus, StoreError> {
        let since = self.clock.now() - Duration::days(STATUS_RECENT_DAYS);
        let rows = self.rows.lock().await;
        Ok(StoreStatus {
            total: rows.len() as u64,
            last_7d: rows.iter().filter(|j| j.scraped_at >= since).count() as u64,
        })
    }
}

const JOB_COLUMNS: &str = "id, title, company, location, remote_flag, skills, salary_min, salary_max, \
     currency, description_text, apply_url, canonical_url, posted_at, scraped_at, last_seen_at";

const UPSERT_SQL: &str = r#"
    INSERT INTO jobs (id, title, company, location, remote_flag, skills, salary_min, salary_max,
                      currency, description_text, apply_url, canonical_url, posted_at,
                      scraped_at, last_seen_at)
    VALUES ($1, $2, $3, $4, COALESCE($5, FALSE), $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
    ON CONFLICT (lower(title), lower(company), lower(canonical_url)) WHERE canonical_url <> ''
    DO UPDATE SET
        last_seen_at = $14,
        salary_min   = COALESCE($7, jobs.salary_min),
        salary_max   = COALESCE($8, jobs.salary_max),
        currency     = COALESCE($9, jobs.currency),
        skills       = CASE WHEN cardinality($6::text[]) > 0 THEN $6::text[] ELSE jobs.skills END,
        location     = COALESCE($4, jobs.location),
        remote_flag  = COALESCE($5, jobs.remote_flag)
    RETURNING id, title, company, location, remote_flag, skills, salary_min, salary_max,
              currency, description_text, apply_url, canonical_url, posted_at, scraped_at, last_seen_at
"#;

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgJobStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        info!("connecting to postgres");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    fn since(&self, days: u32) -> DateTime<Utc> {
        self.clock.now() - Duration::days(i64::from(days))
    }
}

fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &JobQuery, cutoff: Option<DateTime<Utc>>) {
    qb.push(" WHERE TRUE");
    if let Some(cutoff) = cutoff {
        qb.push(" AND scraped_at >= ").push_bind(cutoff);
    }
    if let Some(needle) = query.keyword() {
        let pattern = like_pattern(&needle);
        qb.push(" AND (lower(title) LIKE ")
            .push_bind(pattern.clone())
            .push(" OR lower(company) LIKE ")
            .push_bind(pattern.clone())
            .push(" OR lower(COALESCE(description_text, '')) LIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(tag) = query.skill_tag() {
        qb.push(" AND ")
            .push_bind(tag)
            .push(" = ANY(SELECT lower(btrim(s)) FROM unnest(skills) AS s)");
    }
    if let Some(needle) = query.location_needle() {
        qb.push(" AND lower(location) LIKE ").push_bind(like_pattern(&needle));
    }
    if let Some(remote) = query.remote {
        qb.push(" AND remote_flag = ").push_bind(remote);
    }
}

fn row_to_entity(row: &PgRow) -> Result<JobEntity, sqlx::Error> {
    Ok(JobEntity {
        id: row.try_get::<Uuid, _>("id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        remote_flag: row.try_get("remote_flag")?,
        skills: row.try_get("skills")?,
        salary_min: row.try_get("salary_min")?,
        salary_max: row.try_get("salary_max")?,
        currency: row.try_get("currency")?,
        description_text: row.try_get("description_text")?,
        apply_url: row.try_get("apply_url")?,
        canonical_url: row.try_get("canonical_url")?,
        posted_at: row.try_get("posted_at")?,
        scraped_at: row.try_get("scraped_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn upsert(&self, record: &NormalizedJob) -> Result<JobEntity, StoreError> {
        record.validate()?;
        let posted_at = record.posted_at_utc()?;
        let now = self.clock.now();

        let row = sqlx::query(UPSERT_SQL)
            .bind(Uuid::new_v4())
            .bind(&record.title)
            .bind(&record.company)
            .bind(&record.location)
            .bind(record.remote_flag)
            .bind(&record.skills)
            .bind(record.salary_min)
            .bind(record.salary_max)
            .bind(&record.currency)
            .bind(&record.description_text)
            .bind(&record.apply_url)
            .bind(record.canonical_url())
            .bind(posted_at)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(row_to_entity(&row)?)
    }

    async fn search(&self, query: &JobQuery) -> Result<JobsPage, StoreError> {
        let cutoff = query.cutoff(self.clock.now());

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM jobs");
        push_filters(&mut count_qb, query, cutoff);
        let total: i64 = count_qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut page_qb = QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM jobs"));
        push_filters(&mut page_qb, query, cutoff);
        page_qb
            .push(" ORDER BY posted_at DESC NULLS LAST, scraped_at DESC LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(query.offset));
        let rows = page_qb.build().fetch_all(&self.pool).await?;
        let items = rows.iter().map(row_to_entity).collect::<Result<Vec<_>, _>>()?;

        Ok(JobsPage::assemble(count(total), query, items))
    }

    async fn top_skills(&self, days: u32, top_k: u32) -> Result<Vec<SkillCount>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT lower(btrim(s)) AS skill, COUNT(*) AS cnt
              FROM jobs, unnest(skills) AS s
             WHERE scraped_at >= $1
               AND btrim(s) <> ''
             GROUP BY 1
             ORDER BY cnt DESC, skill ASC
             LIMIT $2
            "#,
        )
        .bind(self.since(days))
        .bind(i64::from(top_k))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, StoreError>(SkillCount {
                    skill: row.try_get("skill")?,
                    count: count(row.try_get("cnt")?),
                })
            })
            .collect()
    }

    async fn remote_ratio(&self, days: u32) -> Result<RemoteRatio, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE remote_flag) AS remote
              FROM jobs
             WHERE scraped_at >= $1
            "#,
        )
        .bind(self.since(days))
        .fetch_one(&self.pool)
        .await?;
        Ok(RemoteRatio::from_counts(
            count(row.try_get("total")?),
            count(row.try_get("remote")?),
        ))
    }

    async fn company_activity(&self, days: u32, top_k: u32) -> Result<Vec<CompanyCount>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT company, COUNT(*) AS cnt
              FROM jobs
             WHERE scraped_at >= $1
             GROUP BY company
             ORDER BY cnt DESC, company ASC
             LIMIT $2
            "#,
        )
        .bind(self.since(days))
        .bind(i64::from(top_k))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, StoreError>(CompanyCount {
                    company: row.try_get("company")?,
                    count: count(row.try_get("cnt")?),
                })
            })
            .collect()
    }

    async fn status(&self) -> Result<StoreStatus, StoreError> {
        let since = self.clock.now() - Duration::days(STATUS_RECENT_DAYS);
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE scraped_at >= $1) AS recent
              FROM jobs
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStatus {
            total: count(row.try_get("total")?),
            last_7d: count(row.try_get("recent")?),
        })
    }
}
