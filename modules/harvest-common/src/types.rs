use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

// --- Subquery ---

/// One contiguous time window of a logical search, as carried on the job
/// queue. The narrowing engine never mutates a `Subquery`; each iteration
/// produces a new one with a lower `until`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subquery {
    pub query_alias: String,
    #[serde(rename = "query")]
    pub search_terms: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(with = "flexible_timestamp")]
    pub since: DateTime<Utc>,
    #[serde(with = "flexible_timestamp")]
    pub until: DateTime<Utc>,
    #[serde(rename = "seconds_of_tolerance")]
    pub tolerance_seconds: i64,
}

impl Subquery {
    /// Decode a queue message body. Rejects non-positive tolerances, which
    /// would let the window stop shrinking, and tolerances too large to
    /// express as a duration.
    pub fn from_json(body: &str) -> Result<Self, HarvestError> {
        let job: Subquery = serde_json::from_str(body)?;
        if job.tolerance_seconds <= 0 {
            return Err(HarvestError::InvalidJob(format!(
                "seconds_of_tolerance must be positive, got {}",
                job.tolerance_seconds
            )));
        }
        if Duration::try_seconds(job.tolerance_seconds).is_none() {
            return Err(HarvestError::InvalidJob(format!(
                "seconds_of_tolerance out of range: {}",
                job.tolerance_seconds
            )));
        }
        if job.query_alias.is_empty() {
            return Err(HarvestError::InvalidJob("query_alias is empty".into()));
        }
        Ok(job)
    }

    pub fn to_json(&self) -> Result<String, HarvestError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The window still has range left to scan.
    pub fn is_open(&self) -> bool {
        self.since <= self.until
    }

    /// Saturates at `Duration::MAX` for values a duration cannot hold.
    pub fn tolerance(&self) -> Duration {
        Duration::try_seconds(self.tolerance_seconds).unwrap_or(Duration::MAX)
    }

    pub fn with_until(&self, until: DateTime<Utc>) -> Self {
        Self {
            until,
            ..self.clone()
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.since <= ts && ts <= self.until
    }
}

// --- Items and records ---

/// A post as extracted from a result page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub published_at: DateTime<Utc>,
}

/// A recorded observation of an item within a job's window. Unique per
/// `(query_alias, item_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub query_alias: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub item_id: String,
    pub published_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    pub source_url: String,
}

/// One window request, empty or not. Append-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub query_alias: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub source_url: String,
    pub worker_ip: String,
    pub empty: bool,
}

/// Forensic record of an unrecoverable fault.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub job_snapshot: Option<serde_json::Value>,
    pub error_detail: String,
    pub module: String,
    pub worker_ip: String,
}

/// Last committed state of a subquery in job tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub current_until: Option<DateTime<Utc>>,
    pub complete: bool,
}

/// Lifecycle of a logical query across its subqueries. Only the
/// harvesting → harvested edge is driven here; the partitioner upstream owns
/// the earlier phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Harvesting,
    Harvested,
}

impl QueryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryPhase::Harvesting => "PHASE2",
            QueryPhase::Harvested => "PHASE3",
        }
    }
}

impl std::fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Timestamp serde ---

/// Accepts RFC 3339 or `YYYY-MM-DD HH:MM:SS` (read as UTC); writes RFC 3339.
pub mod flexible_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp: {raw}")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|ndt| ndt.and_utc())
    }
}
