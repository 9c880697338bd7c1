pub mod api;
pub mod broker;
pub mod cache;
pub mod config;
pub mod coords;
pub mod dispatcher;
pub mod errors;
pub mod jobs;
pub mod orchestrator;
pub mod resolver;
pub mod store;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::broker::{Broker, BrokerProbe, DisabledBroker, InProcessBroker, JobReceiver, RabbitMqBroker};
use crate::cache::ResultCache;
use crate::config::{AppConfig, BrokerBackend, StoreBackend};
use crate::coords::CoordinateNormalizer;
use crate::dispatcher::JobDispatcher;
use crate::jobs::JobStore;
use crate::orchestrator::{OrchestratorSettings, ResolutionOrchestrator};
use crate::resolver::{AddressResolver, NominatimResolver};
use crate::store::{KvStore, MemoryStore, SqliteStore};

pub use api::router;
pub use errors::{AppError, AppResult};
pub use worker::JobWorker;

/// Everything a request handler needs, wired once at startup.
pub struct AppState {
    config: AppConfig,
    store: Arc<dyn KvStore>,
    cache: ResultCache,
    jobs: JobStore,
    resolver: Arc<dyn AddressResolver>,
    orchestrator: ResolutionOrchestrator,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn KvStore>,
        broker: Arc<dyn Broker>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        let cache =
            ResultCache::new(store.clone()).with_incident_ttl(config.incident_cache_ttl());
        let jobs = JobStore::new(
            store.clone(),
            CoordinateNormalizer::new(config.coordinate_precision),
            Duration::from_secs(config.job_retention_secs),
            Duration::from_secs(config.job_active_ttl_secs),
        );
        let probe = BrokerProbe::new(broker.clone(), config.probe_timeout());
        let dispatcher =
            JobDispatcher::new(jobs.clone(), cache.clone(), broker, config.publish_timeout());
        let orchestrator = ResolutionOrchestrator::new(
            cache.clone(),
            probe,
            dispatcher,
            resolver.clone(),
            OrchestratorSettings {
                grace_period: config.grace_period(),
                cache_ttl: config.geocode_cache_ttl(),
            },
        );
        Self {
            config,
            store,
            cache,
            jobs,
            resolver,
            orchestrator,
        }
    }

    /// Builds the configured store, broker and resolver. The receiver is
    /// returned only for the in-process broker and should be handed to
    /// [`AppState::worker`].
    pub fn from_config(config: AppConfig) -> AppResult<(Self, Option<JobReceiver>)> {
        let store: Arc<dyn KvStore> = match config.store_backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sqlite => Arc::new(SqliteStore::open(config.database_path())?),
        };
        let (broker, receiver): (Arc<dyn Broker>, Option<JobReceiver>) =
            match config.broker_backend {
                BrokerBackend::Memory => {
                    let (broker, receiver) = InProcessBroker::channel();
                    (Arc::new(broker), Some(receiver))
                }
                BrokerBackend::Rabbitmq => (Arc::new(RabbitMqBroker::new(&config)?), None),
                BrokerBackend::None => (Arc::new(DisabledBroker), None),
            };
        let resolver = Arc::new(NominatimResolver::new(&config)?);
        info!(
            broker = broker.name(),
            resolver = resolver.name(),
            store = ?config.store_backend,
            "geocoding pipeline configured"
        );
        Ok((Self::new(config, store, broker, resolver), receiver))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.store)
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn orchestrator(&self) -> &ResolutionOrchestrator {
        &self.orchestrator
    }

    pub fn worker(&self) -> JobWorker {
        JobWorker::new(
            self.jobs.clone(),
            self.cache.clone(),
            self.resolver.clone(),
            self.config.geocode_cache_ttl(),
            self.config.worker_max_attempts,
            self.config.geocoder_rate_limit_qps,
        )
    }
}

/// Periodically drops expired cache entries and job records.
pub fn spawn_janitor(store: Arc<dyn KvStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired() {
                Ok(0) => {}
                Ok(removed) => debug!(target: "kv_store", removed, "purged expired entries"),
                Err(err) => warn!(target: "kv_store", ?err, "failed to purge expired entries"),
            }
        }
    })
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,geocode_relay=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
