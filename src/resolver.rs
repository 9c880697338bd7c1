use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::jobs::JobKind;

/// Synchronous reverse geocoding against the upstream provider.
///
/// `Ok(None)` means the provider answered but had nothing for the point;
/// `Err` means the provider itself failed.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, kind: JobKind, lat: f64, lng: f64) -> AppResult<Option<String>>;

    fn name(&self) -> &'static str;
}

/// Client for Nominatim-compatible `/reverse` endpoints.
pub struct NominatimResolver {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    address: Option<ReverseAddress>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReverseAddress {
    #[serde(default)]
    postcode: Option<String>,
}

impl NominatimResolver {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Self::with_settings(
            &config.geocoder_base_url,
            config.geocoder_api_key.clone(),
            config.geocoder_timeout(),
            &config.geocoder_user_agent,
        )
    }

    pub fn with_settings(
        base_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
        user_agent: &str,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl AddressResolver for NominatimResolver {
    async fn resolve(&self, kind: JobKind, lat: f64, lng: f64) -> AppResult<Option<String>> {
        let mut query = vec![
            ("format", "jsonv2".to_string()),
            ("lat", lat.to_string()),
            ("lon", lng.to_string()),
            ("addressdetails", "1".to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("key", key.expose_secret().to_string()));
        }

        let response = self
            .http
            .get(format!("{}/reverse", self.base_url))
            .query(&query)
            .send()
            .await?
            .error_for_status()
            .map_err(|err| AppError::Provider(err.to_string()))?;

        let parsed: ReverseResponse = response.json().await?;
        if let Some(reason) = parsed.error {
            debug!(target: "resolver", lat, lng, reason = %reason, "provider found no address");
            return Ok(None);
        }

        let postcode = parsed
            .address
            .and_then(|address| address.postcode)
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty());
        let resolved = match kind {
            JobKind::ReversePostcode => postcode,
            JobKind::ReverseAddress => postcode.or_else(|| {
                parsed
                    .display_name
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
            }),
        };
        trace!(target: "resolver", lat, lng, ?resolved, "reverse lookup finished");
        Ok(resolved)
    }

    fn name(&self) -> &'static str {
        "nominatim"
    }
}
