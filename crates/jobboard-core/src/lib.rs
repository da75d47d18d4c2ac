//! Core domain model for the job board: normalized records, persisted entities,
//! skill extraction and record validation.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobboard-core";

pub const MAX_TITLE_CHARS: usize = 256;
pub const MAX_COMPANY_CHARS: usize = 256;
pub const MAX_LOCATION_CHARS: usize = 256;
pub const MAX_URL_CHARS: usize = 512;
pub const MAX_CURRENCY_CHARS: usize = 8;

/// Upstream applicant-tracking system a board is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Greenhouse,
    Lever,
    Ashby,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Greenhouse, SourceKind::Lever, SourceKind::Ashby];

    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Greenhouse => "Greenhouse",
            SourceKind::Lever => "Lever",
            SourceKind::Ashby => "Ashby",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            SourceKind::Greenhouse => "greenhouse",
            SourceKind::Lever => "lever",
            SourceKind::Ashby => "ashby",
        }
    }

    /// Environment variable holding this source's comma-separated org list.
    pub fn orgs_env_key(&self) -> &'static str {
        match self {
            SourceKind::Greenhouse => "GH_ORGS",
            SourceKind::Lever => "LEVER_ORGS",
            SourceKind::Ashby => "ASHBY_ORGS",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source kind {0:?}")]
pub struct UnknownSourceKind(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "greenhouse" | "gh" => Ok(SourceKind::Greenhouse),
            "lever" => Ok(SourceKind::Lever),
            "ashby" => Ok(SourceKind::Ashby),
            other => Err(UnknownSourceKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must not be blank")]
    Blank { field: &'static str },
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} must not be negative")]
    Negative { field: &'static str },
    #[error("salary_min {min} exceeds salary_max {max}")]
    SalaryRange { min: i64, max: i64 },
    #[error("unrecognised posted_at timestamp {0:?}")]
    Timestamp(String),
}

/// Raw upstream timestamp, kept as delivered until persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PostedAt {
    Epoch(i64),
    Text(String),
}

/// Epoch values at or above this magnitude are milliseconds, below it seconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

impl PostedAt {
    pub fn resolve(&self) -> Result<DateTime<Utc>, ValidationError> {
        match self {
            PostedAt::Epoch(n) => resolve_epoch(*n).ok_or_else(|| ValidationError::Timestamp(n.to_string())),
            PostedAt::Text(text) => resolve_text_timestamp(text),
        }
    }
}

fn resolve_epoch(n: i64) -> Option<DateTime<Utc>> {
    if n.abs() >= EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}

fn resolve_text_timestamp(text: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        if let Some(ts) = trimmed.parse::<i64>().ok().and_then(resolve_epoch) {
            return Ok(ts);
        }
    }
    Err(ValidationError::Timestamp(text.to_string()))
}

/// Common record shape every source collector emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedJob {
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub remote_flag: Option<bool>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub description_text: Option<String>,
    #[serde(default)]
    pub apply_url: Option<String>,
    #[serde(default)]
    pub canonical_url: Option<String>,
    #[serde(default)]
    pub posted_at: Option<PostedAt>,
    #[serde(default)]
    pub salary_min: Option<i64>,
    #[serde(default)]
    pub salary_max: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Case-insensitive natural identity of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub title: String,
    pub company: String,
    pub canonical_url: String,
}

impl NormalizedJob {
    pub fn new(title: impl Into<String>, company: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            company: company.into(),
            location: None,
            remote_flag: None,
            skills: Vec::new(),
            description_text: None,
            apply_url: None,
            canonical_url: None,
            posted_at: None,
            salary_min: None,
            salary_max: None,
            currency: None,
        }
    }

    /// Canonical URL if present and non-blank.
    pub fn canonical_url(&self) -> Option<&str> {
        self.canonical_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
    }

    /// `None` when the record has no canonical URL and must never be matched.
    pub fn dedup_key(&self) -> Option<DedupKey> {
        self.canonical_url().map(|url| DedupKey {
            title: self.title.to_lowercase(),
            company: self.company.to_lowercase(),
            canonical_url: url.to_lowercase(),
        })
    }

    pub fn posted_at_utc(&self) -> Result<Option<DateTime<Utc>>, ValidationError> {
        self.posted_at.as_ref().map(PostedAt::resolve).transpose()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("title", &self.title, MAX_TITLE_CHARS)?;
        require_text("company", &self.company, MAX_COMPANY_CHARS)?;
        check_len("location", self.location.as_deref(), MAX_LOCATION_CHARS)?;
        check_len("apply_url", self.apply_url.as_deref(), MAX_URL_CHARS)?;
        check_len("canonical_url", self.canonical_url.as_deref(), MAX_URL_CHARS)?;
        check_len("currency", self.currency.as_deref(), MAX_CURRENCY_CHARS)?;

        if matches!(self.salary_min, Some(v) if v < 0) {
            return Err(ValidationError::Negative { field: "salary_min" });
        }
        if matches!(self.salary_max, Some(v) if v < 0) {
            return Err(ValidationError::Negative { field: "salary_max" });
        }
        if let (Some(min), Some(max)) = (self.salary_min, self.salary_max) {
            if min > max {
                return Err(ValidationError::SalaryRange { min, max });
            }
        }

        self.posted_at_utc()?;
        Ok(())
    }
}

fn require_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Blank { field });
    }
    check_len(field, Some(value), max)
}

fn check_len(field: &'static str, value: Option<&str>, max: usize) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.chars().count() > max => Err(ValidationError::TooLong { field, max }),
        _ => Ok(()),
    }
}

/// Persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntity {
    pub id: Uuid,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub remote_flag: bool,
    pub skills: Vec<String>,
    pub description_text: Option<String>,
    pub apply_url: Option<String>,
    pub canonical_url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub currency: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl JobEntity {
    /// Build a fresh entity from a validated record.
    pub fn create(record: &NormalizedJob, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        record.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            title: record.title.clone(),
            company: record.company.clone(),
            location: record.location.clone(),
            remote_flag: record.remote_flag.unwrap_or(false),
            skills: record.skills.clone(),
            description_text: record.description_text.clone(),
            apply_url: record.apply_url.clone(),
            canonical_url: record.canonical_url().map(ToString::to_string),
            posted_at: record.posted_at_utc()?,
            salary_min: record.salary_min,
            salary_max: record.salary_max,
            currency: record.currency.clone(),
            scraped_at: now,
            last_seen_at: now,
        })
    }

    pub fn matches(&self, key: &DedupKey) -> bool {
        let Some(url) = self.canonical_url.as_deref() else {
            return false;
        };
        self.title.to_lowercase() == key.title
            && self.company.to_lowercase() == key.company
            && url.to_lowercase() == key.canonical_url
    }

    /// Apply the mutable subset of `record`; absent incoming values leave the
    /// stored value alone and an empty skill list counts as absent.
    pub fn merge_from(&mut self, record: &NormalizedJob, now: DateTime<Utc>) {
        self.last_seen_at = now;
        if let Some(v) = record.salary_min {
            self.salary_min = Some(v);
        }
        if let Some(v) = record.salary_max {
            self.salary_max = Some(v);
        }
        if let Some(v) = &record.currency {
            self.currency = Some(v.clone());
        }
        if !record.skills.is_empty() {
            self.skills = record.skills.clone();
        }
        if let Some(v) = &record.location {
            self.location = Some(v.clone());
        }
        if let Some(v) = record.remote_flag {
            self.remote_flag = v;
        }
    }
}

const SKILL_TABLE: &[(&str, &str)] = &[
    (r"\breact(\.js)?\b", "react"),
    (r"\bnode(\.js)?\b", "node"),
    (r"\btypescript\b", "typescript"),
    (r"\bjavascript\b", "javascript"),
    (r"\bpython\b", "python"),
    (r"\bjava\b", "java"),
    (r"\bpostgres(ql)?\b", "postgres"),
    (r"\bmysql\b", "mysql"),
    (r"\bmongo(db)?\b", "mongodb"),
    (r"\baws\b", "aws"),
    (r"\bgcp\b", "gcp"),
    (r"\bazure\b", "azure"),
    (r"\bdocker\b", "docker"),
    (r"\bkubernetes\b", "kubernetes"),
    (r"\bpandas\b", "pandas"),
    (r"\bnumpy\b", "numpy"),
    (r"\bpytorch\b", "pytorch"),
    (r"\btensorflow\b", "tensorflow"),
    (r"\bspark\b", "spark"),
    (r"\bairflow\b", "airflow"),
    (r"\bsql\b", "sql"),
];

static SKILL_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    SKILL_TABLE
        .iter()
        .map(|(pattern, tag)| (Regex::new(pattern).expect("static skill pattern"), *tag))
        .collect()
});

/// Lowercase, sorted, deduplicated skill tags found in any of the fragments.
pub fn extract_skills<'a, I>(fragments: I) -> Vec<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let blob = fragments
        .into_iter()
        .map(|f| f.unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut found = SKILL_PATTERNS
        .iter()
        .filter(|(re, _)| re.is_match(&blob))
        .map(|(_, tag)| tag.to_string())
        .collect::<Vec<_>>();
    found.sort();
    found.dedup();
    found
}

/// Time source for persistence timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
