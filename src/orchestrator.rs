//! Cache, then queue with a bounded wait, then the direct provider.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::broker::BrokerProbe;
use crate::cache::ResultCache;
use crate::dispatcher::JobDispatcher;
use crate::errors::{AppError, AppResult};
use crate::jobs::JobKind;
use crate::resolver::AddressResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    Cache,
    Queue,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    pub cached: bool,
    pub source: ResolutionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub grace_period: Duration,
    pub cache_ttl: Duration,
}

#[derive(Clone)]
pub struct ResolutionOrchestrator {
    cache: ResultCache,
    probe: BrokerProbe,
    dispatcher: JobDispatcher,
    resolver: Arc<dyn AddressResolver>,
    settings: OrchestratorSettings,
}

impl ResolutionOrchestrator {
    pub fn new(
        cache: ResultCache,
        probe: BrokerProbe,
        dispatcher: JobDispatcher,
        resolver: Arc<dyn AddressResolver>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            cache,
            probe,
            dispatcher,
            resolver,
            settings,
        }
    }

    pub fn probe(&self) -> &BrokerProbe {
        &self.probe
    }

    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    /// Upper bound on time spent on the queue path before the direct
    /// provider is called: probe, publish, then the grace wait.
    pub fn queue_budget(&self) -> Duration {
        self.probe.timeout() + self.dispatcher.publish_timeout() + self.settings.grace_period
    }

    pub async fn resolve(&self, lat: f64, lng: f64, use_queue: bool) -> AppResult<Resolution> {
        self.resolve_kind(JobKind::ReverseAddress, lat, lng, use_queue)
            .await
    }

    pub async fn resolve_kind(
        &self,
        kind: JobKind,
        lat: f64,
        lng: f64,
        use_queue: bool,
    ) -> AppResult<Resolution> {
        let normalized = self.dispatcher.jobs().normalizer().normalize(lat, lng)?;
        let cache_key = ResultCache::geocode_key(kind, &normalized);

        if let Some(address) = self.cache.get(&cache_key) {
            debug!(target: "orchestrator", lat, lng, "resolved from cache");
            return Ok(Resolution {
                address,
                lat,
                lng,
                cached: true,
                source: ResolutionSource::Cache,
                job_id: None,
            });
        }

        if use_queue {
            if let Some(resolution) = self.resolve_via_queue(kind, lat, lng).await {
                if !resolution.cached {
                    self.cache
                        .set(&cache_key, &resolution.address, self.settings.cache_ttl);
                }
                return Ok(resolution);
            }
        }

        info!(target: "orchestrator", lat, lng, "using direct reverse geocoding");
        let address = self
            .resolver
            .resolve(kind, lat, lng)
            .await?
            .ok_or(AppError::AddressNotResolved { lat, lng })?;
        self.cache
            .set(&cache_key, &address, self.settings.cache_ttl);
        Ok(Resolution {
            address,
            lat,
            lng,
            cached: false,
            source: ResolutionSource::Direct,
            job_id: None,
        })
    }

    /// Returns `None` whenever the queue path cannot answer promptly; the
    /// caller then resolves directly.
    async fn resolve_via_queue(&self, kind: JobKind, lat: f64, lng: f64) -> Option<Resolution> {
        if !self.probe.is_available().await {
            info!(target: "orchestrator", lat, lng, "broker unavailable; falling back to direct geocoding");
            return None;
        }

        let job = match self
            .dispatcher
            .dispatch(kind, BTreeMap::new(), lat, lng)
            .await
        {
            Ok(job) => job,
            Err(err) if err.is_queue_failure() => {
                warn!(target: "orchestrator", ?err, lat, lng, "broker rejected job; falling back to direct geocoding");
                return None;
            }
            Err(err) => {
                warn!(target: "orchestrator", ?err, lat, lng, "job dispatch failed; falling back to direct geocoding");
                return None;
            }
        };

        let queued = |address: &str, cached: bool| Resolution {
            address: address.to_string(),
            lat,
            lng,
            cached,
            source: if cached {
                ResolutionSource::Cache
            } else {
                ResolutionSource::Queue
            },
            job_id: Some(job.job_id.clone()),
        };

        if let Some(address) = job.completed_result() {
            return Some(queued(address, job.cached));
        }
        if job.status.is_terminal() {
            warn!(target: "orchestrator", job_id = %job.job_id, "job already failed; falling back to direct geocoding");
            return None;
        }

        sleep(self.settings.grace_period).await;

        match self.dispatcher.jobs().get(&job.job_id) {
            Ok(Some(current)) => match current.completed_result() {
                Some(address) => Some(queued(address, false)),
                None => {
                    warn!(
                        target: "orchestrator",
                        job_id = %job.job_id,
                        status = %current.status,
                        grace_ms = self.settings.grace_period.as_millis() as u64,
                        lat,
                        lng,
                        "worker did not finish within grace period; falling back to direct geocoding"
                    );
                    None
                }
            },
            Ok(None) => {
                warn!(target: "orchestrator", job_id = %job.job_id, "job record disappeared; falling back to direct geocoding");
                None
            }
            Err(err) => {
                warn!(target: "orchestrator", ?err, job_id = %job.job_id, "job status lookup failed; falling back to direct geocoding");
                None
            }
        }
    }
}
