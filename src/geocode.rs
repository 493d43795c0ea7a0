//! Address geocoding and device geolocation, both bounded by a timeout.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{EngineError, Result};
use crate::geo::Coordinates;
use crate::listing::LocationFilter;

/// Resolves free text to a point.
pub trait Geocoder: Send + Sync {
    fn resolve_address(&self, text: &str) -> impl Future<Output = Result<Coordinates>> + Send;
}

/// Reports where the user is.
pub trait Geolocator: Send + Sync {
    fn current_position(&self) -> impl Future<Output = Result<Coordinates>> + Send;
}

/// Nominatim-style geocoder: `GET {base}?q=..&format=json&limit=1`.
#[derive(Debug, Clone)]
pub struct HttpGeocoder {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

#[derive(Deserialize)]
struct GeocodeHit {
    lat: String,
    lon: String,
}

impl HttpGeocoder {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| EngineError::Config(format!("geocoder url {endpoint}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(Self { client, endpoint, timeout })
    }

    fn query_url(&self, text: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("q", text)
            .append_pair("format", "json")
            .append_pair("limit", "1");
        url
    }
}

fn parse_hit(text: &str, hits: Vec<GeocodeHit>) -> Result<Coordinates> {
    let hit = hits
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::GeocodeNotFound(text.to_string()))?;
    let lat = hit.lat.parse::<f64>();
    let lng = hit.lon.parse::<f64>();
    match (lat, lng) {
        (Ok(lat), Ok(lng)) => Coordinates::new(lat, lng),
        _ => Err(EngineError::GeocodeFailed(format!(
            "unparseable position {},{}",
            hit.lat, hit.lon
        ))),
    }
}

impl Geocoder for HttpGeocoder {
    fn resolve_address(&self, text: &str) -> impl Future<Output = Result<Coordinates>> + Send {
        let request = self.client.get(self.query_url(text));
        let timeout = self.timeout;
        let text = text.to_string();
        async move {
            let response = request.send().await.and_then(|r| r.error_for_status());
            let response = match response {
                Ok(r) => r,
                Err(e) if e.is_timeout() => return Err(EngineError::GeocodeTimeout(timeout)),
                Err(e) => return Err(EngineError::GeocodeFailed(e.to_string())),
            };
            let hits: Vec<GeocodeHit> = response
                .json()
                .await
                .map_err(|e| EngineError::GeocodeFailed(e.to_string()))?;
            parse_hit(&text, hits)
        }
    }
}

/// Geolocator backed by a fixed answer: a configured position, or a denial.
#[derive(Debug, Clone, Copy)]
pub struct FixedGeolocator {
    position: Option<Coordinates>,
}

impl FixedGeolocator {
    pub fn at(position: Coordinates) -> Self {
        Self { position: Some(position) }
    }

    pub fn denied() -> Self {
        Self { position: None }
    }
}

impl Geolocator for FixedGeolocator {
    fn current_position(&self) -> impl Future<Output = Result<Coordinates>> + Send {
        let position = self.position.ok_or(EngineError::GeolocationDenied);
        async move { position }
    }
}

/// Ask for the user's position, giving up after `timeout`.
pub async fn locate_with_timeout<G: Geolocator>(geolocator: &G, timeout: Duration) -> Result<Coordinates> {
    match tokio::time::timeout(timeout, geolocator.current_position()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(?timeout, "geolocation timed out");
            Err(EngineError::GeolocationTimeout(timeout))
        }
    }
}

/// Geocode an address into a radius filter centered on it.
pub async fn resolve_location<G: Geocoder>(
    geocoder: &G,
    text: &str,
    radius_km: f64,
    timeout: Duration,
) -> Result<LocationFilter> {
    let center = match tokio::time::timeout(timeout, geocoder.resolve_address(text)).await {
        Ok(result) => result?,
        Err(_) => return Err(EngineError::GeocodeTimeout(timeout)),
    };
    debug!(address = text, lat = center.lat, lng = center.lng, "address resolved");
    Ok(LocationFilter { lat: center.lat, lng: center.lng, radius_km })
}
