use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_GEOCODER_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_BROKER_URL: &str = "http://localhost:15672";
const DEFAULT_GEOCODE_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_INCIDENT_CACHE_TTL_SECS: u64 = 900;
// Nominatim's public usage policy allows one request per second.
const DEFAULT_GEOCODER_RATE_LIMIT_QPS: u32 = 1;
pub const DEFAULT_COORDINATE_PRECISION: u32 = 5;
pub const MAX_COORDINATE_PRECISION: u32 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    Memory,
    Rabbitmq,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub geocoder_base_url: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_timeout_ms: u64,
    pub geocoder_user_agent: String,
    pub broker_backend: BrokerBackend,
    pub broker_url: String,
    pub broker_username: String,
    pub broker_password: SecretString,
    pub broker_vhost: String,
    pub broker_queue: String,
    pub broker_probe_timeout_ms: u64,
    pub broker_publish_timeout_ms: u64,
    pub queue_grace_period_ms: u64,
    pub geocode_cache_ttl_secs: u64,
    pub incident_cache_ttl_secs: u64,
    pub job_retention_secs: u64,
    pub job_active_ttl_secs: u64,
    pub coordinate_precision: u32,
    pub store_backend: StoreBackend,
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub janitor_interval_secs: u64,
    pub worker_max_attempts: u32,
    pub geocoder_rate_limit_qps: u32,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAppConfig {
    pub geocoder_base_url: String,
    pub geocoder_timeout_ms: u64,
    pub broker_backend: BrokerBackend,
    pub broker_url: String,
    pub broker_queue: String,
    pub broker_probe_timeout_ms: u64,
    pub broker_publish_timeout_ms: u64,
    pub queue_grace_period_ms: u64,
    pub geocode_cache_ttl_secs: u64,
    pub incident_cache_ttl_secs: u64,
    pub job_retention_secs: u64,
    pub coordinate_precision: u32,
    pub geocoder_rate_limit_qps: u32,
    pub store_backend: StoreBackend,
    pub has_geocoder_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            geocoder_base_url: env::var("GEOCODER_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GEOCODER_BASE_URL.to_string()),
            geocoder_api_key: parse_secret("GEOCODER_API_KEY"),
            geocoder_timeout_ms: parse_u64("GEOCODER_TIMEOUT_MS", 10_000).max(1),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .unwrap_or_else(|_| format!("geocode-relay/{}", env!("CARGO_PKG_VERSION"))),
            broker_backend: parse_broker_backend(),
            broker_url: env::var("BROKER_URL").unwrap_or_else(|_| DEFAULT_BROKER_URL.to_string()),
            broker_username: env::var("BROKER_USERNAME").unwrap_or_else(|_| "guest".to_string()),
            broker_password: parse_secret("BROKER_PASSWORD")
                .unwrap_or_else(|| SecretString::from("guest".to_string())),
            broker_vhost: env::var("BROKER_VHOST").unwrap_or_else(|_| "/".to_string()),
            broker_queue: env::var("BROKER_QUEUE").unwrap_or_else(|_| "geocoding".to_string()),
            broker_probe_timeout_ms: parse_u64("BROKER_PROBE_TIMEOUT_MS", 1_000),
            broker_publish_timeout_ms: parse_u64("BROKER_PUBLISH_TIMEOUT_MS", 1_000).max(1),
            queue_grace_period_ms: parse_u64("QUEUE_GRACE_PERIOD_MS", 1_000),
            geocode_cache_ttl_secs: parse_u64(
                "GEOCODE_CACHE_TTL_SECS",
                DEFAULT_GEOCODE_CACHE_TTL_SECS,
            ),
            incident_cache_ttl_secs: parse_u64(
                "INCIDENT_CACHE_TTL_SECS",
                DEFAULT_INCIDENT_CACHE_TTL_SECS,
            ),
            job_retention_secs: parse_u64("JOB_RETENTION_SECS", 3_600).max(1),
            job_active_ttl_secs: parse_u64("JOB_ACTIVE_TTL_SECS", 300).max(1),
            coordinate_precision: parse_u32("COORDINATE_PRECISION", DEFAULT_COORDINATE_PRECISION)
                .min(MAX_COORDINATE_PRECISION),
            store_backend: parse_store_backend(),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "geocode-relay.db".to_string()),
            janitor_interval_secs: parse_u64("JANITOR_INTERVAL_SECS", 60).max(1),
            worker_max_attempts: parse_u32("WORKER_MAX_ATTEMPTS", 3).max(1),
            geocoder_rate_limit_qps: parse_u32(
                "GEOCODER_RATE_LIMIT_QPS",
                DEFAULT_GEOCODER_RATE_LIMIT_QPS,
            )
            .max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_base_url: self.geocoder_base_url.clone(),
            geocoder_timeout_ms: self.geocoder_timeout_ms,
            broker_backend: self.broker_backend,
            broker_url: self.broker_url.clone(),
            broker_queue: self.broker_queue.clone(),
            broker_probe_timeout_ms: self.broker_probe_timeout_ms,
            broker_publish_timeout_ms: self.broker_publish_timeout_ms,
            queue_grace_period_ms: self.queue_grace_period_ms,
            geocode_cache_ttl_secs: self.geocode_cache_ttl_secs,
            incident_cache_ttl_secs: self.incident_cache_ttl_secs,
            job_retention_secs: self.job_retention_secs,
            coordinate_precision: self.coordinate_precision,
            geocoder_rate_limit_qps: self.geocoder_rate_limit_qps,
            store_backend: self.store_backend,
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
        }
    }

    pub fn geocoder_timeout(&self) -> Duration {
        Duration::from_millis(self.geocoder_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_probe_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_publish_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.queue_grace_period_ms)
    }

    pub fn geocode_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.geocode_cache_ttl_secs)
    }

    pub fn incident_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.incident_cache_ttl_secs)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file_name)
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_broker_backend() -> BrokerBackend {
    match env::var("BROKER_BACKEND")
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        Ok("rabbitmq") | Ok("amqp") => BrokerBackend::Rabbitmq,
        Ok("none") | Ok("disabled") => BrokerBackend::None,
        Ok("memory") | Err(_) => BrokerBackend::Memory,
        Ok(other) => {
            warn!(backend = other, "unknown BROKER_BACKEND; using in-process broker");
            BrokerBackend::Memory
        }
    }
}

fn parse_store_backend() -> StoreBackend {
    match env::var("STORE_BACKEND")
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        Ok("sqlite") => StoreBackend::Sqlite,
        Ok("memory") | Err(_) => StoreBackend::Memory,
        Ok(other) => {
            warn!(backend = other, "unknown STORE_BACKEND; using in-memory store");
            StoreBackend::Memory
        }
    }
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".into(),
        geocoder_base_url: "http://127.0.0.1:9".into(),
        geocoder_api_key: None,
        geocoder_timeout_ms: 1_000,
        geocoder_user_agent: "geocode-relay-tests".into(),
        broker_backend: BrokerBackend::Memory,
        broker_url: "http://127.0.0.1:9".into(),
        broker_username: "guest".into(),
        broker_password: SecretString::from("guest".to_string()),
        broker_vhost: "/".into(),
        broker_queue: "geocoding".into(),
        broker_probe_timeout_ms: 100,
        broker_publish_timeout_ms: 100,
        queue_grace_period_ms: 100,
        geocode_cache_ttl_secs: 60,
        incident_cache_ttl_secs: 900,
        job_retention_secs: 60,
        job_active_ttl_secs: 30,
        coordinate_precision: DEFAULT_COORDINATE_PRECISION,
        store_backend: StoreBackend::Memory,
        data_dir: PathBuf::from("./data"),
        database_file_name: "test.db".into(),
        janitor_interval_secs: 60,
        worker_max_attempts: 2,
        geocoder_rate_limit_qps: 1_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GEOCODER_API_KEY", "secret");
        env::set_var("BROKER_PASSWORD", "hunter2");
        env::set_var("BROKER_BACKEND", "rabbitmq");
        env::set_var("STORE_BACKEND", "sqlite");
        env::set_var("COORDINATE_PRECISION", "12");
        env::set_var("QUEUE_GRACE_PERIOD_MS", "not-a-number");
        env::set_var("GEOCODER_RATE_LIMIT_QPS", "0");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert!(public.has_geocoder_api_key);
        assert_eq!(public.broker_backend, BrokerBackend::Rabbitmq);
        assert_eq!(public.store_backend, StoreBackend::Sqlite);
        assert_eq!(public.coordinate_precision, MAX_COORDINATE_PRECISION);
        assert_eq!(public.queue_grace_period_ms, 1_000);
        assert_eq!(public.incident_cache_ttl_secs, DEFAULT_INCIDENT_CACHE_TTL_SECS);
        assert_eq!(public.broker_publish_timeout_ms, 1_000);
        assert_eq!(public.geocoder_rate_limit_qps, 1);
        assert_eq!(config.publish_timeout(), Duration::from_millis(1_000));

        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
        assert!(!serialized.contains("hunter2"));
    }
}
