//! Message broker adapters and the bounded availability probe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::jobs::JobMessage;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Succeeds when the broker is reachable and healthy right now.
    async fn check(&self) -> AppResult<()>;

    async fn publish(&self, message: &JobMessage) -> AppResult<()>;

    fn name(&self) -> &'static str;
}

/// Answers "is the broker up?" without ever erroring or waiting longer than
/// the configured timeout.
#[derive(Clone)]
pub struct BrokerProbe {
    broker: Arc<dyn Broker>,
    timeout: Duration,
}

impl BrokerProbe {
    pub fn new(broker: Arc<dyn Broker>, timeout: Duration) -> Self {
        Self { broker, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }

    pub async fn is_available(&self) -> bool {
        match timeout(self.timeout, self.broker.check()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!(target: "broker", broker = self.broker.name(), ?err, "broker probe failed");
                false
            }
            Err(_) => {
                warn!(
                    target: "broker",
                    broker = self.broker.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "broker probe timed out"
                );
                false
            }
        }
    }
}

/// RabbitMQ reached through its management HTTP API.
pub struct RabbitMqBroker {
    http: Client,
    base_url: Url,
    username: String,
    password: SecretString,
    vhost: String,
    queue: String,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    properties: PublishProperties,
    routing_key: &'a str,
    payload: String,
    payload_encoding: &'static str,
}

#[derive(Serialize)]
struct PublishProperties {
    delivery_mode: u8,
    content_type: &'static str,
}

#[derive(Deserialize)]
struct PublishResponse {
    routed: bool,
}

#[derive(Deserialize)]
struct AlivenessResponse {
    status: String,
}

impl RabbitMqBroker {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let base_url = Url::parse(&config.broker_url)
            .map_err(|err| AppError::Config(format!("invalid BROKER_URL: {err}")))?;
        let http = Client::builder()
            .user_agent(config.geocoder_user_agent.as_str())
            .timeout(config.probe_timeout().max(config.publish_timeout()))
            .build()?;
        Ok(Self {
            http,
            base_url,
            username: config.broker_username.clone(),
            password: config.broker_password.clone(),
            vhost: config.broker_vhost.clone(),
            queue: config.broker_queue.clone(),
        })
    }

    fn api_url(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| AppError::Config("BROKER_URL cannot be a base URL".into()))?;
            path.pop_if_empty().push("api");
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn check(&self) -> AppResult<()> {
        let url = self.api_url(&["aliveness-test", &self.vhost])?;
        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await?
            .error_for_status()?;
        let body: AlivenessResponse = response.json().await?;
        if body.status == "ok" {
            Ok(())
        } else {
            Err(AppError::BrokerUnavailable)
        }
    }

    async fn publish(&self, message: &JobMessage) -> AppResult<()> {
        let url = self.api_url(&["exchanges", &self.vhost, "amq.default", "publish"])?;
        let body = PublishRequest {
            properties: PublishProperties {
                delivery_mode: 2,
                content_type: "application/json",
            },
            routing_key: &self.queue,
            payload: serde_json::to_string(message)?,
            payload_encoding: "string",
        };
        let response = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .json(&body)
            .send()
            .await
            .map_err(|err| AppError::DispatchFailed(err.to_string()))?
            .error_for_status()
            .map_err(|err| AppError::DispatchFailed(err.to_string()))?;
        let parsed: PublishResponse = response
            .json()
            .await
            .map_err(|err| AppError::DispatchFailed(err.to_string()))?;
        if !parsed.routed {
            return Err(AppError::DispatchFailed(format!(
                "message for job {} was not routed to queue {}",
                message.job_id, self.queue
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rabbitmq"
    }
}

/// Broker backed by a tokio channel; the receiving half feeds [`crate::worker::JobWorker`].
#[derive(Clone)]
pub struct InProcessBroker {
    sender: mpsc::UnboundedSender<JobMessage>,
}

pub type JobReceiver = mpsc::UnboundedReceiver<JobMessage>;

impl InProcessBroker {
    pub fn channel() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn check(&self) -> AppResult<()> {
        if self.sender.is_closed() {
            Err(AppError::BrokerUnavailable)
        } else {
            Ok(())
        }
    }

    async fn publish(&self, message: &JobMessage) -> AppResult<()> {
        self.sender
            .send(message.clone())
            .map_err(|_| AppError::BrokerUnavailable)
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}

/// Used when no broker is configured; every resolution goes direct.
#[derive(Clone, Copy, Default)]
pub struct DisabledBroker;

#[async_trait]
impl Broker for DisabledBroker {
    async fn check(&self) -> AppResult<()> {
        Err(AppError::BrokerUnavailable)
    }

    async fn publish(&self, _message: &JobMessage) -> AppResult<()> {
        Err(AppError::BrokerUnavailable)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
