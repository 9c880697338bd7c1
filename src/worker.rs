use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::broker::JobReceiver;
use crate::cache::ResultCache;
use crate::errors::{AppError, AppResult};
use crate::jobs::{GeocodeJob, JobMessage, JobStore};
use crate::resolver::AddressResolver;

const BASE_BACKOFF_MS: u64 = 250;
const MAX_IN_FLIGHT_JOBS: usize = 16;
const NO_ADDRESS_ERROR: &str = "No address found for coordinates";

/// Spaces provider calls at least `1 / qps` apart across every clone of
/// the worker.
struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            interval: Self::interval_for(qps),
            next_slot: Mutex::new(None),
        }
    }

    fn interval_for(qps: u32) -> Duration {
        let safe_qps = u64::from(qps.max(1));
        Duration::from_millis(1_000_u64.div_ceil(safe_qps).max(1))
    }

    fn qps(&self) -> u32 {
        let interval_ms = self.interval.as_millis().max(1) as f64;
        ((1_000_f64 / interval_ms).round() as u32).max(1)
    }

    async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        sleep_until(slot).await;
    }
}

/// Consumes broker messages, resolves them through the provider and writes
/// the outcome back to the job store and result cache.
#[derive(Clone)]
pub struct JobWorker {
    jobs: JobStore,
    cache: ResultCache,
    resolver: Arc<dyn AddressResolver>,
    cache_ttl: Duration,
    max_attempts: u32,
    base_backoff_ms: u64,
    jitter_rng: Arc<Mutex<StdRng>>,
    rate_limiter: Arc<RateLimiter>,
}

impl JobWorker {
    pub fn new(
        jobs: JobStore,
        cache: ResultCache,
        resolver: Arc<dyn AddressResolver>,
        cache_ttl: Duration,
        max_attempts: u32,
        rate_limit_qps: u32,
    ) -> Self {
        Self {
            jobs,
            cache,
            resolver,
            cache_ttl,
            max_attempts: max_attempts.max(1),
            base_backoff_ms: BASE_BACKOFF_MS,
            jitter_rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            rate_limiter: Arc::new(RateLimiter::new(rate_limit_qps)),
        }
    }

    pub fn rate_limit_qps(&self) -> u32 {
        self.rate_limiter.qps()
    }

    #[cfg(test)]
    fn with_backoff(mut self, base_backoff_ms: u64, rng: StdRng) -> Self {
        self.base_backoff_ms = base_backoff_ms.max(1);
        self.jitter_rng = Arc::new(Mutex::new(rng));
        self
    }

    /// Runs until every sender of `receiver` is dropped. At most
    /// `MAX_IN_FLIGHT_JOBS` messages are processed at once.
    pub fn spawn(self, mut receiver: JobReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                target: "worker",
                resolver = self.resolver.name(),
                qps = self.rate_limit_qps(),
                "geocoding worker started"
            );
            let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT_JOBS));
            while let Some(message) = receiver.recv().await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let worker = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = worker.process(&message).await {
                        warn!(target: "worker", ?err, job_id = %message.job_id, "job processing failed");
                    }
                    drop(permit);
                });
            }
            info!(target: "worker", "job channel closed; worker stopping");
        })
    }

    /// Returns `Ok(None)` when the message was skipped: the job expired or
    /// another consumer already picked it up.
    pub async fn process(&self, message: &JobMessage) -> AppResult<Option<GeocodeJob>> {
        match self.jobs.mark_processing(&message.job_id) {
            Ok(_) => {}
            Err(AppError::JobNotFound(_)) => {
                warn!(target: "worker", job_id = %message.job_id, "job record expired before processing");
                return Ok(None);
            }
            Err(AppError::InvalidTransition { from, .. }) => {
                debug!(target: "worker", job_id = %message.job_id, status = %from, "skipping redelivered job");
                return Ok(None);
            }
            Err(err) => return Err(err),
        }

        let normalized = self
            .jobs
            .normalizer()
            .normalize(message.lat, message.lng)?;
        let cache_key = ResultCache::geocode_key(message.kind, &normalized);

        let job = match self.resolve(message, &cache_key).await {
            Ok(Some(address)) => self.jobs.complete(&message.job_id, address)?,
            Ok(None) => self
                .jobs
                .fail(&message.job_id, NO_ADDRESS_ERROR.to_string())?,
            Err(err) => self.jobs.fail(&message.job_id, err.to_string())?,
        };
        info!(
            target: "worker",
            job_id = %job.job_id,
            status = %job.status,
            "geocoding job finished"
        );
        Ok(Some(job))
    }

    async fn resolve(&self, message: &JobMessage, cache_key: &str) -> AppResult<Option<String>> {
        if let Some(address) = self.cache.get(cache_key) {
            debug!(target: "worker", job_id = %message.job_id, "answered job from cache");
            return Ok(Some(address));
        }
        let resolved = self.lookup_with_retry(message).await?;
        if let Some(address) = &resolved {
            self.cache.set(cache_key, address, self.cache_ttl);
        }
        Ok(resolved)
    }

    async fn lookup_with_retry(&self, message: &JobMessage) -> AppResult<Option<String>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_limiter.wait().await;
            match self
                .resolver
                .resolve(message.kind, message.lat, message.lng)
                .await
            {
                Ok(resolved) => return Ok(resolved),
                Err(err) if attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        target: "worker",
                        ?err,
                        attempt,
                        job_id = %message.job_id,
                        "reverse lookup failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(self.base_backoff_ms * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..self.base_backoff_ms))
        };
        base + jitter
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::broker::{Broker, BrokerProbe, InProcessBroker};
    use crate::coords::CoordinateNormalizer;
    use crate::dispatcher::JobDispatcher;
    use crate::jobs::{JobKind, JobStatus};
    use crate::orchestrator::tests::ScriptedResolver;
    use crate::orchestrator::{OrchestratorSettings, ResolutionOrchestrator, ResolutionSource};
    use crate::store::{KvStore, MemoryStore};

    struct Harness {
        jobs: JobStore,
        cache: ResultCache,
        worker: JobWorker,
    }

    fn harness(resolver: Arc<ScriptedResolver>, max_attempts: u32) -> Harness {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let jobs = JobStore::new(
            store.clone(),
            CoordinateNormalizer::default(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        let cache = ResultCache::new(store);
        let worker = JobWorker::new(
            jobs.clone(),
            cache.clone(),
            resolver,
            Duration::from_secs(60),
            max_attempts,
            1_000,
        )
        .with_backoff(5, StdRng::seed_from_u64(7));
        Harness { jobs, cache, worker }
    }

    fn enqueue(jobs: &JobStore, lat: f64, lng: f64) -> JobMessage {
        let job = GeocodeJob::queued(JobKind::ReverseAddress, BTreeMap::new(), lat, lng);
        jobs.insert(&job).unwrap();
        JobMessage::from(&job)
    }

    #[tokio::test]
    async fn completes_job_and_fills_cache() {
        let resolver = Arc::new(ScriptedResolver::answering("94103"));
        let h = harness(resolver.clone(), 3);
        let message = enqueue(&h.jobs, 37.7749, -122.4194);

        let job = h.worker.process(&message).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.as_deref(), Some("94103"));
        assert_eq!(
            h.cache
                .get("geocode:reverse-address:37.77490:-122.41940")
                .as_deref(),
            Some("94103")
        );
        assert_eq!(resolver.call_count(), 1);
    }

    #[tokio::test]
    async fn retries_provider_errors_before_succeeding() {
        let resolver = Arc::new(ScriptedResolver::new(
            vec![Err(AppError::Provider("503".into()))],
            Some("10001"),
        ));
        let h = harness(resolver.clone(), 3);
        let message = enqueue(&h.jobs, 40.7128, -74.006);

        let job = h.worker.process(&message).await.unwrap().unwrap();
        assert_eq!(job.completed_result(), Some("10001"));
        assert_eq!(resolver.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_job() {
        let resolver = Arc::new(ScriptedResolver::new(
            vec![
                Err(AppError::Provider("timeout".into())),
                Err(AppError::Provider("timeout".into())),
            ],
            Some("never"),
        ));
        let h = harness(resolver.clone(), 2);
        let message = enqueue(&h.jobs, 1.0, 2.0);

        let job = h.worker.process(&message).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("timeout"));
        assert_eq!(resolver.call_count(), 2);
    }

    #[tokio::test]
    async fn empty_answer_fails_without_retry() {
        let resolver = Arc::new(ScriptedResolver::new(vec![Ok(None)], Some("never")));
        let h = harness(resolver.clone(), 3);
        let message = enqueue(&h.jobs, 0.0, -160.0);

        let job = h.worker.process(&message).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(NO_ADDRESS_ERROR));
        assert_eq!(resolver.call_count(), 1);
    }

    #[tokio::test]
    async fn skips_redelivered_and_expired_jobs() {
        let resolver = Arc::new(ScriptedResolver::answering("10001"));
        let h = harness(resolver.clone(), 3);
        let message = enqueue(&h.jobs, 40.7128, -74.006);

        h.worker.process(&message).await.unwrap();
        assert!(h.worker.process(&message).await.unwrap().is_none());
        assert_eq!(
            h.jobs.require(&message.job_id).unwrap().status,
            JobStatus::Completed
        );

        let expired = JobMessage {
            job_id: "geo_expired".into(),
            ..message
        };
        assert!(h.worker.process(&expired).await.unwrap().is_none());
        assert_eq!(resolver.call_count(), 1);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let resolver = Arc::new(ScriptedResolver::answering("x"));
        let h = harness(resolver, 3);
        let worker = h.worker.with_backoff(100, StdRng::seed_from_u64(1));
        let first = worker.backoff_delay(1);
        let third = worker.backoff_delay(3);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn in_process_queue_answers_within_grace_period() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let jobs = JobStore::new(
            store.clone(),
            CoordinateNormalizer::default(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        let cache = ResultCache::new(store);
        let (broker, receiver) = InProcessBroker::channel();
        let broker = Arc::new(broker);

        let queue_resolver = Arc::new(ScriptedResolver::answering("94103"));
        let handle = JobWorker::new(
            jobs.clone(),
            cache.clone(),
            queue_resolver.clone(),
            Duration::from_secs(60),
            2,
            1_000,
        )
        .spawn(receiver);

        let direct_resolver = Arc::new(ScriptedResolver::answering("direct"));
        let orchestrator = ResolutionOrchestrator::new(
            cache.clone(),
            BrokerProbe::new(broker.clone(), Duration::from_millis(100)),
            JobDispatcher::new(jobs, cache, broker, Duration::from_millis(100)),
            direct_resolver.clone(),
            OrchestratorSettings {
                grace_period: Duration::from_millis(300),
                cache_ttl: Duration::from_secs(60),
            },
        );

        let resolution = orchestrator.resolve(37.7749, -122.4194, true).await.unwrap();
        assert_eq!(resolution.address, "94103");
        assert_eq!(resolution.source, ResolutionSource::Queue);
        assert_eq!(queue_resolver.call_count(), 1);
        assert_eq!(direct_resolver.call_count(), 0);

        drop(orchestrator);
        handle.await.unwrap();
    }

    #[test]
    fn rate_limit_interval_follows_qps() {
        assert_eq!(RateLimiter::interval_for(0), Duration::from_secs(1));
        assert_eq!(RateLimiter::interval_for(1), Duration::from_secs(1));
        assert_eq!(RateLimiter::interval_for(3), Duration::from_millis(334));
        assert_eq!(RateLimiter::new(4).qps(), 4);
    }

    #[tokio::test]
    async fn queued_jobs_respect_provider_rate_limit() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let jobs = JobStore::new(
            store.clone(),
            CoordinateNormalizer::default(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        let resolver = Arc::new(ScriptedResolver::answering("somewhere"));
        let worker = JobWorker::new(
            jobs.clone(),
            ResultCache::new(store),
            resolver.clone(),
            Duration::from_secs(60),
            1,
            10,
        );
        assert_eq!(worker.rate_limit_qps(), 10);
        let (broker, receiver) = InProcessBroker::channel();
        let handle = worker.spawn(receiver);

        let started = Instant::now();
        let mut job_ids = Vec::new();
        for i in 0..4_u32 {
            let message = enqueue(&jobs, 10.0 + f64::from(i), 20.0);
            broker.publish(&message).await.unwrap();
            job_ids.push(message.job_id);
        }

        let all_done = || {
            job_ids
                .iter()
                .all(|id| jobs.require(id).unwrap().status == JobStatus::Completed)
        };
        while !all_done() {
            assert!(started.elapsed() < Duration::from_secs(5), "jobs never finished");
            sleep(Duration::from_millis(10)).await;
        }

        // four calls at 10 qps need three full intervals between them
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(resolver.call_count(), 4);

        drop(broker);
        handle.await.unwrap();
    }
}
