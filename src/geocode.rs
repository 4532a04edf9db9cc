use crate::config::{GeocoderConfig, Provider};
use crate::types::GeoPoint;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use ureq::{Agent, AgentBuilder};

const OPENCAGE_ENDPOINT: &str = "https://api.opencagedata.com/geocode/v1/json";
const NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";

/// Resolves a place name to coordinates. `None` means the place was not found.
pub trait Geocoder {
    fn resolve(&self, place: &str, context: &str) -> Option<GeoPoint>;
}

pub fn query_string(place: &str, context: &str) -> String {
    if context.trim().is_empty() {
        place.to_string()
    } else {
        format!("{place}, {context}")
    }
}

pub fn from_config(config: &GeocoderConfig) -> Result<Box<dyn Geocoder + Send + Sync>> {
    let agent = AgentBuilder::new()
        .user_agent(&config.user_agent)
        .timeout(Duration::from_secs(config.timeout_secs))
        .build();

    Ok(match config.provider {
        Provider::OpenCage => {
            let api_key = config
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    anyhow!(
                        "OpenCage needs an API key: set geocoder.api_key or {}",
                        crate::config::API_KEY_ENV
                    )
                })?;
            Box::new(OpenCageGeocoder {
                agent,
                endpoint: config.endpoint.clone().unwrap_or_else(|| OPENCAGE_ENDPOINT.to_string()),
                api_key,
            })
        }
        Provider::Nominatim => Box::new(NominatimGeocoder {
            agent,
            endpoint: config.endpoint.clone().unwrap_or_else(|| NOMINATIM_ENDPOINT.to_string()),
        }),
    })
}

pub struct OpenCageGeocoder {
    agent: Agent,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct OpenCageResponse {
    results: Vec<OpenCageResult>,
}

#[derive(Deserialize)]
struct OpenCageResult {
    geometry: OpenCageGeometry,
}

#[derive(Deserialize)]
struct OpenCageGeometry {
    lat: f64,
    lng: f64,
}

impl OpenCageGeocoder {
    fn lookup(&self, query: &str) -> Result<Option<GeoPoint>> {
        let response: OpenCageResponse = self
            .agent
            .get(&self.endpoint)
            .query("q", query)
            .query("key", &self.api_key)
            .query("limit", "1")
            .query("no_annotations", "1")
            .call()?
            .into_json()
            .context("Failed to decode OpenCage response")?;

        Ok(response
            .results
            .first()
            .map(|r| GeoPoint::new(r.geometry.lng, r.geometry.lat)))
    }
}

impl Geocoder for OpenCageGeocoder {
    fn resolve(&self, place: &str, context: &str) -> Option<GeoPoint> {
        let query = query_string(place, context);
        debug!("Geocoding {:?} with OpenCage", query);
        self.lookup(&query).unwrap_or_else(|e| {
            warn!("Geocoding {:?} failed: {:#}", query, e);
            None
        })
    }
}

pub struct NominatimGeocoder {
    agent: Agent,
    endpoint: String,
}

// Nominatim returns coordinates as strings
#[derive(Deserialize)]
struct NominatimResult {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    fn lookup(&self, query: &str) -> Result<Option<GeoPoint>> {
        let response: Vec<NominatimResult> = self
            .agent
            .get(&self.endpoint)
            .query("q", query)
            .query("format", "json")
            .query("limit", "1")
            .call()?
            .into_json()
            .context("Failed to decode Nominatim response")?;

        first_point(&response)
    }
}

fn first_point(results: &[NominatimResult]) -> Result<Option<GeoPoint>> {
    match results.first() {
        Some(x) => {
            let lat: f64 = x.lat.parse().context("Invalid latitude")?;
            let lon: f64 = x.lon.parse().context("Invalid longitude")?;
            Ok(Some(GeoPoint::new(lon, lat)))
        }
        None => Ok(None),
    }
}

impl Geocoder for NominatimGeocoder {
    fn resolve(&self, place: &str, context: &str) -> Option<GeoPoint> {
        let query = query_string(place, context);
        debug!("Geocoding {:?} with Nominatim", query);
        self.lookup(&query).unwrap_or_else(|e| {
            warn!("Geocoding {:?} failed: {:#}", query, e);
            None
        })
    }
}
