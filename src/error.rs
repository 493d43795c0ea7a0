//! Error taxonomy shared by the search, clustering and map layers.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Malformed listing data never produces one of these; records with bad
/// coordinates are skipped. Errors are reserved for caller mistakes and for
/// failures of external collaborators (backend, geocoder, geolocation).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Latitude or longitude outside the valid range, or not finite.
    #[error("invalid coordinate: lat={lat}, lng={lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },

    /// Zoom level outside `0..=max_zoom`.
    #[error("invalid zoom level: {0}")]
    InvalidZoom(i32),

    /// Search parameters the pipeline cannot evaluate (zero page, inverted range).
    #[error("invalid search parameters: {0}")]
    InvalidParams(String),

    /// Backend listing-store failure. Recoverable: the session keeps its last results.
    #[error("search failed: {0}")]
    SearchFailed(String),

    /// Geocoder returned no match for the address.
    #[error("address not found: {0}")]
    GeocodeNotFound(String),

    /// Geocoder did not answer in time.
    #[error("geocoding timed out after {0:?}")]
    GeocodeTimeout(Duration),

    /// Geocoder unreachable or returned garbage.
    #[error("geocoding failed: {0}")]
    GeocodeFailed(String),

    /// The user refused access to their position.
    #[error("geolocation permission denied")]
    GeolocationDenied,

    /// Position lookup did not finish in time.
    #[error("geolocation timed out after {0:?}")]
    GeolocationTimeout(Duration),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// True for errors caused by the caller rather than by a collaborator.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidCoordinate { .. } | Self::InvalidZoom(_) | Self::InvalidParams(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
