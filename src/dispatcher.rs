use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::cache::ResultCache;
use crate::errors::{AppError, AppResult};
use crate::jobs::{GeocodeJob, JobKind, JobMessage, JobStore};

const CLAIM_ATTEMPTS: usize = 3;

/// Turns geocoding requests into broker jobs, reusing cached results and
/// in-flight jobs for the same normalized coordinate.
#[derive(Clone)]
pub struct JobDispatcher {
    jobs: JobStore,
    cache: ResultCache,
    broker: Arc<dyn Broker>,
    publish_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(
        jobs: JobStore,
        cache: ResultCache,
        broker: Arc<dyn Broker>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            cache,
            broker,
            publish_timeout,
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Longest a single publish may hold a caller.
    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    pub async fn dispatch(
        &self,
        kind: JobKind,
        params: BTreeMap<String, String>,
        lat: f64,
        lng: f64,
    ) -> AppResult<GeocodeJob> {
        let normalized = self.jobs.normalizer().normalize(lat, lng)?;
        let dedupe_key = JobStore::dedupe_key_from(kind, &normalized);
        let cache_key = ResultCache::geocode_key(kind, &normalized);

        if let Some(result) = self.cache.get(&cache_key) {
            let job = GeocodeJob::from_cache(kind, params, lat, lng, result);
            // the job record only serves status polling; the caller already has the result
            if let Err(err) = self.jobs.insert(&job) {
                warn!(target: "dispatcher", ?err, job_id = %job.job_id, "failed to record cached job");
            }
            debug!(target: "dispatcher", dedupe_key = %dedupe_key, job_id = %job.job_id, "served job from cache");
            return Ok(job);
        }

        for _ in 0..CLAIM_ATTEMPTS {
            if let Some(existing) = self.jobs.active_job(&dedupe_key)? {
                debug!(
                    target: "dispatcher",
                    dedupe_key = %dedupe_key,
                    job_id = %existing.job_id,
                    status = %existing.status,
                    "reusing in-flight job"
                );
                return Ok(existing);
            }

            let job = GeocodeJob::queued(kind, params.clone(), lat, lng);
            self.jobs.insert(&job)?;
            if !self.jobs.claim_active(&dedupe_key, &job.job_id)? {
                // another request registered first; pick its job up on the next pass
                self.jobs.remove(&job.job_id)?;
                continue;
            }
            return self.publish(job).await;
        }

        Err(AppError::DispatchFailed(format!(
            "could not register a job for {dedupe_key}"
        )))
    }

    async fn publish(&self, job: GeocodeJob) -> AppResult<GeocodeJob> {
        let message = JobMessage::from(&job);
        let outcome = match timeout(self.publish_timeout, self.broker.publish(&message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::DispatchFailed(format!(
                "publish timed out after {}ms",
                self.publish_timeout.as_millis()
            ))),
        };
        match outcome {
            Ok(()) => {
                info!(
                    target: "dispatcher",
                    job_id = %job.job_id,
                    kind = job.kind.as_str(),
                    broker = self.broker.name(),
                    "geocoding job queued"
                );
                Ok(job)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    target: "dispatcher",
                    job_id = %job.job_id,
                    broker = self.broker.name(),
                    error = %reason,
                    "publishing geocoding job failed"
                );
                if let Err(mark_err) = self.jobs.fail(&job.job_id, reason.clone()) {
                    warn!(target: "dispatcher", ?mark_err, job_id = %job.job_id, "failed to mark job as failed");
                }
                Err(AppError::DispatchFailed(reason))
            }
        }
    }
}
