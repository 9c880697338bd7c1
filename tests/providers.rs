use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{delay_and_then, json_encoded, status_code};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;

use geocode_relay::broker::{Broker, BrokerProbe, RabbitMqBroker};
use geocode_relay::config::{AppConfig, BrokerBackend, StoreBackend};
use geocode_relay::jobs::{JobKind, JobMessage};
use geocode_relay::orchestrator::ResolutionSource;
use geocode_relay::resolver::{AddressResolver, NominatimResolver};
use geocode_relay::store::MemoryStore;
use geocode_relay::{AppError, AppState};

fn resolver(server: &Server, api_key: Option<&str>) -> NominatimResolver {
    NominatimResolver::with_settings(
        &server.url_str("/"),
        api_key.map(|key| SecretString::from(key.to_string())),
        Duration::from_secs(2),
        "geocode-relay-tests",
    )
    .expect("resolver")
}

fn broker_config(server: &Server, vhost: &str) -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".into(),
        geocoder_base_url: "http://127.0.0.1:9".into(),
        geocoder_api_key: None,
        geocoder_timeout_ms: 1_000,
        geocoder_user_agent: "geocode-relay-tests".into(),
        broker_backend: BrokerBackend::Rabbitmq,
        broker_url: server.url_str("/"),
        broker_username: "relay".into(),
        broker_password: SecretString::from("s3cret".to_string()),
        broker_vhost: vhost.into(),
        broker_queue: "geocoding".into(),
        broker_probe_timeout_ms: 500,
        broker_publish_timeout_ms: 100,
        queue_grace_period_ms: 100,
        geocode_cache_ttl_secs: 60,
        incident_cache_ttl_secs: 900,
        job_retention_secs: 60,
        job_active_ttl_secs: 30,
        coordinate_precision: 5,
        store_backend: StoreBackend::Memory,
        data_dir: PathBuf::from("./data"),
        database_file_name: "test.db".into(),
        janitor_interval_secs: 60,
        worker_max_attempts: 1,
        geocoder_rate_limit_qps: 1_000,
    }
}

fn message() -> JobMessage {
    JobMessage {
        job_id: "geo_provider_test".into(),
        kind: JobKind::ReverseAddress,
        params: BTreeMap::new(),
        lat: 40.7128,
        lng: -74.006,
    }
}

#[tokio::test]
async fn nominatim_prefers_postcode_and_sends_key() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/reverse"),
            request::query(url_decoded(contains(("format", "jsonv2")))),
            request::query(url_decoded(contains(("lat", "40.7128")))),
            request::query(url_decoded(contains(("lon", "-74.006")))),
            request::query(url_decoded(contains(("key", "test-key")))),
        ])
        .respond_with(json_encoded(json!({
            "display_name": "New York, NY, USA",
            "address": { "postcode": "10001", "city": "New York" }
        }))),
    );

    let resolved = resolver(&server, Some("test-key"))
        .resolve(JobKind::ReverseAddress, 40.7128, -74.006)
        .await
        .unwrap();
    assert_eq!(resolved.as_deref(), Some("10001"));
}

#[tokio::test]
async fn nominatim_falls_back_to_display_name_for_addresses_only() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/reverse"))
            .times(2)
            .respond_with(json_encoded(json!({
                "display_name": "  Pacific Ocean  ",
                "address": {}
            }))),
    );
    let resolver = resolver(&server, None);

    let address = resolver
        .resolve(JobKind::ReverseAddress, 0.0, -160.0)
        .await
        .unwrap();
    assert_eq!(address.as_deref(), Some("Pacific Ocean"));

    let postcode = resolver
        .resolve(JobKind::ReversePostcode, 0.0, -160.0)
        .await
        .unwrap();
    assert!(postcode.is_none());
}

#[tokio::test]
async fn nominatim_error_body_means_no_address() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/reverse"))
            .respond_with(json_encoded(json!({ "error": "Unable to geocode" }))),
    );

    let resolved = resolver(&server, None)
        .resolve(JobKind::ReverseAddress, 1.0, 2.0)
        .await
        .unwrap();
    assert!(resolved.is_none());
}

#[tokio::test]
async fn nominatim_server_error_is_provider_failure() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/reverse"))
            .respond_with(status_code(503)),
    );

    let err = resolver(&server, None)
        .resolve(JobKind::ReverseAddress, 1.0, 2.0)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Provider(_)));
}

#[tokio::test]
async fn rabbitmq_probe_reads_aliveness_status() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/api/aliveness-test/relay"))
            .respond_with(json_encoded(json!({ "status": "ok" }))),
    );
    let broker = RabbitMqBroker::new(&broker_config(&server, "relay")).unwrap();
    let probe = BrokerProbe::new(Arc::new(broker), Duration::from_millis(500));
    assert!(probe.is_available().await);
}

#[tokio::test]
async fn rabbitmq_probe_encodes_default_vhost() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/api/aliveness-test/%2F"))
            .respond_with(json_encoded(json!({ "status": "ok" }))),
    );
    let broker = RabbitMqBroker::new(&broker_config(&server, "/")).unwrap();
    assert!(broker.check().await.is_ok());
}

#[tokio::test]
async fn rabbitmq_probe_treats_bad_answers_as_unavailable() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/api/aliveness-test/relay"))
            .times(3)
            .respond_with(httptest::cycle![
                json_encoded(json!({ "status": "failed", "reason": "queue down" })),
                status_code(401),
                status_code(200).body("not json"),
            ]),
    );
    let broker = RabbitMqBroker::new(&broker_config(&server, "relay")).unwrap();
    let probe = BrokerProbe::new(Arc::new(broker), Duration::from_millis(500));
    for _ in 0..3 {
        assert!(!probe.is_available().await);
    }
}

#[tokio::test]
async fn rabbitmq_publish_requires_routing() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path(
            "POST",
            "/api/exchanges/relay/amq.default/publish",
        ))
        .times(2)
        .respond_with(httptest::cycle![
            json_encoded(json!({ "routed": true })),
            json_encoded(json!({ "routed": false })),
        ]),
    );
    let broker = RabbitMqBroker::new(&broker_config(&server, "relay")).unwrap();

    broker.publish(&message()).await.unwrap();
    let err = broker.publish(&message()).await.unwrap_err();
    assert!(matches!(err, AppError::DispatchFailed(_)));
    assert!(err.is_queue_failure());
}

#[tokio::test]
async fn rabbitmq_publish_rejection_is_dispatch_failure() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path(
            "POST",
            "/api/exchanges/relay/amq.default/publish",
        ))
        .respond_with(status_code(401)),
    );
    let broker = RabbitMqBroker::new(&broker_config(&server, "relay")).unwrap();
    assert!(matches!(
        broker.publish(&message()).await,
        Err(AppError::DispatchFailed(_))
    ));
}

#[tokio::test]
async fn stalled_rabbitmq_publish_falls_back_within_budget() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/api/aliveness-test/relay"))
            .respond_with(json_encoded(json!({ "status": "ok" }))),
    );
    server.expect(
        Expectation::matching(request::method_path(
            "POST",
            "/api/exchanges/relay/amq.default/publish",
        ))
        .respond_with(delay_and_then(
            Duration::from_secs(3),
            json_encoded(json!({ "routed": true })),
        )),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/reverse")).respond_with(
            json_encoded(json!({
                "display_name": "New York, NY, USA",
                "address": { "postcode": "10001" }
            })),
        ),
    );

    let config = AppConfig {
        broker_probe_timeout_ms: 100,
        broker_publish_timeout_ms: 100,
        queue_grace_period_ms: 100,
        ..broker_config(&server, "relay")
    };
    let broker = Arc::new(RabbitMqBroker::new(&config).unwrap());
    let state = AppState::new(
        config,
        Arc::new(MemoryStore::new()),
        broker,
        Arc::new(resolver(&server, None)),
    );
    let orchestrator = state.orchestrator();

    let started = Instant::now();
    let resolution = orchestrator.resolve(40.7128, -74.006, true).await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(resolution.address, "10001");
    assert_eq!(resolution.source, ResolutionSource::Direct);
    assert!(
        elapsed < orchestrator.queue_budget() + Duration::from_millis(500),
        "took {elapsed:?}"
    );

    let dedupe = state
        .jobs()
        .dedupe_key(JobKind::ReverseAddress, 40.7128, -74.006)
        .unwrap();
    assert!(state.jobs().active_job(&dedupe).unwrap().is_none());
}
