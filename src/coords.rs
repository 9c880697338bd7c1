//! Coordinate validation and quantization into cache keys.

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_COORDINATE_PRECISION, MAX_COORDINATE_PRECISION};
use crate::errors::{AppError, AppResult};

const LAT_LIMIT: f64 = 90.0;
const LNG_LIMIT: f64 = 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> AppResult<Self> {
        validate(lat, lng)?;
        Ok(Self { lat, lng })
    }

    /// Parses raw query-string values. Missing and non-numeric inputs are
    /// reported separately so the HTTP layer can echo a precise message.
    pub fn parse(lat: Option<&str>, lng: Option<&str>) -> AppResult<Self> {
        let (Some(lat), Some(lng)) = (non_blank(lat), non_blank(lng)) else {
            return Err(AppError::InvalidCoordinate(
                "Latitude and longitude parameters are required".into(),
            ));
        };
        let parsed = lat
            .parse::<f64>()
            .ok()
            .zip(lng.parse::<f64>().ok())
            .filter(|(lat, lng)| lat.is_finite() && lng.is_finite());
        let Some((lat, lng)) = parsed else {
            return Err(AppError::InvalidCoordinate(
                "Invalid latitude or longitude format".into(),
            ));
        };
        Self::new(lat, lng)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn validate(lat: f64, lng: f64) -> AppResult<()> {
    if !lat.is_finite() || !lng.is_finite() {
        return Err(AppError::InvalidCoordinate(
            "Invalid latitude or longitude format".into(),
        ));
    }
    if !(-LAT_LIMIT..=LAT_LIMIT).contains(&lat) {
        return Err(AppError::InvalidCoordinate(
            "Latitude must be between -90 and 90".into(),
        ));
    }
    if !(-LNG_LIMIT..=LNG_LIMIT).contains(&lng) {
        return Err(AppError::InvalidCoordinate(
            "Longitude must be between -180 and 180".into(),
        ));
    }
    Ok(())
}

/// Collapses coordinates onto a grid of `precision` decimal places.
#[derive(Debug, Clone, Copy)]
pub struct CoordinateNormalizer {
    precision: u32,
    scale: f64,
}

impl Default for CoordinateNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_COORDINATE_PRECISION)
    }
}

impl CoordinateNormalizer {
    pub fn new(precision: u32) -> Self {
        let precision = precision.min(MAX_COORDINATE_PRECISION);
        Self {
            precision,
            scale: 10_f64.powi(precision as i32),
        }
    }

    pub fn normalize(&self, lat: f64, lng: f64) -> AppResult<String> {
        validate(lat, lng)?;
        let lat_steps = self.quantize(lat);
        let lng_steps = self.quantize(lng);
        Ok(format!(
            "{}:{}",
            self.render(lat_steps),
            self.render(lng_steps)
        ))
    }

    fn quantize(&self, value: f64) -> i64 {
        // i64 conversion folds -0.0 into 0
        (value * self.scale).round() as i64
    }

    fn render(&self, steps: i64) -> String {
        let precision = self.precision as usize;
        format!("{:.precision$}", steps as f64 / self.scale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

pub const INCIDENT_KEY_PREFIX: &str = "incidents:";

/// Cache key for one page of the public incident list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IncidentListKey {
    pub bbox: Option<BoundingBox>,
    pub limit: u32,
}

impl IncidentListKey {
    pub fn new(bbox: Option<BoundingBox>, limit: u32) -> Self {
        Self { bbox, limit }
    }

    pub fn cache_key(&self) -> String {
        match self.bbox {
            Some(bbox) => format!(
                "{INCIDENT_KEY_PREFIX}{}:{}:{}:{}:{}",
                bbox.min_lat, bbox.max_lat, bbox.min_lng, bbox.max_lng, self.limit
            ),
            None => format!("{INCIDENT_KEY_PREFIX}all:{}", self.limit),
        }
    }
}
