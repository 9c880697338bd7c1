//! Geocoding job records and their lifecycle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::coords::CoordinateNormalizer;
use crate::errors::{AppError, AppResult};
use crate::store::KvStore;

const JOB_ID_PREFIX: &str = "geo_";
const JOB_ID_LENGTH: usize = 20;
const JOB_KEY_PREFIX: &str = "job:";
const ACTIVE_KEY_PREFIX: &str = "job-active:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    ReverseAddress,
    ReversePostcode,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ReverseAddress => "reverse-address",
            JobKind::ReversePostcode => "reverse-postcode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Forward-only: a job never returns to an earlier state and a terminal
    /// job never changes again.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        self.is_active() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeJob {
    pub job_id: String,
    pub kind: JobKind,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub lat: f64,
    pub lng: f64,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cached: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GeocodeJob {
    pub fn queued(kind: JobKind, params: BTreeMap<String, String>, lat: f64, lng: f64) -> Self {
        let now = Utc::now();
        Self {
            job_id: generate_job_id(),
            kind,
            params,
            lat,
            lng,
            status: JobStatus::Queued,
            result: None,
            error: None,
            cached: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// A job that was answered from the result cache without touching the broker.
    pub fn from_cache(
        kind: JobKind,
        params: BTreeMap<String, String>,
        lat: f64,
        lng: f64,
        result: String,
    ) -> Self {
        Self {
            status: JobStatus::Completed,
            result: Some(result),
            cached: true,
            ..Self::queued(kind, params, lat, lng)
        }
    }

    pub fn completed_result(&self) -> Option<&str> {
        match self.status {
            JobStatus::Completed => self.result.as_deref(),
            _ => None,
        }
    }
}

pub fn generate_job_id() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(JOB_ID_LENGTH)
        .map(char::from)
        .collect();
    format!("{JOB_ID_PREFIX}{suffix}")
}

/// Body of a broker message; the consumer loads everything else from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub job_id: String,
    pub kind: JobKind,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub lat: f64,
    pub lng: f64,
}

impl From<&GeocodeJob> for JobMessage {
    fn from(job: &GeocodeJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            kind: job.kind,
            params: job.params.clone(),
            lat: job.lat,
            lng: job.lng,
        }
    }
}

/// Job records plus the per-coordinate "active job" index used for dedupe.
///
/// Records live for the retention window after their last write. Index
/// entries expire after `active_ttl` so a job whose consumer vanished cannot
/// pin its coordinate forever.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn KvStore>,
    normalizer: CoordinateNormalizer,
    retention: Duration,
    active_ttl: Duration,
}

impl JobStore {
    pub fn new(
        store: Arc<dyn KvStore>,
        normalizer: CoordinateNormalizer,
        retention: Duration,
        active_ttl: Duration,
    ) -> Self {
        Self {
            store,
            normalizer,
            retention,
            active_ttl,
        }
    }

    pub fn normalizer(&self) -> &CoordinateNormalizer {
        &self.normalizer
    }

    pub fn dedupe_key(&self, kind: JobKind, lat: f64, lng: f64) -> AppResult<String> {
        let normalized = self.normalizer.normalize(lat, lng)?;
        Ok(Self::dedupe_key_from(kind, &normalized))
    }

    pub fn dedupe_key_from(kind: JobKind, normalized: &str) -> String {
        format!("{}:{normalized}", kind.as_str())
    }

    pub fn get(&self, job_id: &str) -> AppResult<Option<GeocodeJob>> {
        let Some(raw) = self.store.get(&job_key(job_id))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn require(&self, job_id: &str) -> AppResult<GeocodeJob> {
        self.get(job_id)?
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))
    }

    pub fn insert(&self, job: &GeocodeJob) -> AppResult<()> {
        let encoded = serde_json::to_string(job)?;
        self.store
            .set(&job_key(&job.job_id), &encoded, Some(self.retention))?;
        trace!(
            target: "job_store",
            job_id = %job.job_id,
            status = %job.status,
            "job record written"
        );
        Ok(())
    }

    pub fn remove(&self, job_id: &str) -> AppResult<bool> {
        self.store.delete(&job_key(job_id))
    }

    /// Registers `job_id` as the active job for `dedupe_key` unless another
    /// live registration exists.
    pub fn claim_active(&self, dedupe_key: &str, job_id: &str) -> AppResult<bool> {
        self.store
            .set_if_absent(&active_key(dedupe_key), job_id, Some(self.active_ttl))
    }

    pub fn release_active(&self, dedupe_key: &str, job_id: &str) -> AppResult<bool> {
        self.store.delete_if_eq(&active_key(dedupe_key), job_id)
    }

    /// Returns the live active job for `dedupe_key`, clearing index entries
    /// that point at a missing or already finished record.
    pub fn active_job(&self, dedupe_key: &str) -> AppResult<Option<GeocodeJob>> {
        let Some(job_id) = self.store.get(&active_key(dedupe_key))? else {
            return Ok(None);
        };
        match self.get(&job_id)? {
            Some(job) if job.status.is_active() => Ok(Some(job)),
            stale => {
                debug!(
                    target: "job_store",
                    job_id = %job_id,
                    found = stale.is_some(),
                    "clearing stale active-job entry"
                );
                self.release_active(dedupe_key, &job_id)?;
                Ok(None)
            }
        }
    }

    pub fn mark_processing(&self, job_id: &str) -> AppResult<GeocodeJob> {
        self.transition(job_id, JobStatus::Processing, |_| {})
    }

    pub fn complete(&self, job_id: &str, result: String) -> AppResult<GeocodeJob> {
        self.transition(job_id, JobStatus::Completed, move |job| {
            job.result = Some(result);
            job.error = None;
        })
    }

    pub fn fail(&self, job_id: &str, error: String) -> AppResult<GeocodeJob> {
        self.transition(job_id, JobStatus::Failed, move |job| {
            job.error = Some(error);
            job.result = None;
        })
    }

    fn transition<F>(&self, job_id: &str, next: JobStatus, apply: F) -> AppResult<GeocodeJob>
    where
        F: FnOnce(&mut GeocodeJob),
    {
        let mut job = self.require(job_id)?;
        if !job.status.can_advance_to(next) {
            warn!(
                target: "job_store",
                job_id,
                from = %job.status,
                to = %next,
                "rejected backwards job transition"
            );
            return Err(AppError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: next,
            });
        }
        job.status = next;
        job.updated_at = Utc::now();
        apply(&mut job);
        self.insert(&job)?;

        if next.is_terminal() {
            let dedupe_key = self.dedupe_key(job.kind, job.lat, job.lng)?;
            self.release_active(&dedupe_key, job_id)?;
        }
        Ok(job)
    }
}

fn job_key(job_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{job_id}")
}

fn active_key(dedupe_key: &str) -> String {
    format!("{ACTIVE_KEY_PREFIX}{dedupe_key}")
}
