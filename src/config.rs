//! Engine configuration: JSON file with defaults for every field.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;
use crate::error::{EngineError, Result};
use crate::map::DrillPolicy;
use crate::session::DEFAULT_DEBOUNCE;

/// Remote endpoint plus request timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub debounce_ms: u64,
    pub page_size: usize,
    pub clustering: ClusterConfig,
    pub drill_zoom: u8,
    pub drill_zoom_step: u8,
    /// Remote listing store. Absent means the local catalog is searched.
    pub backend: Option<EndpointConfig>,
    pub geocoder: Option<EndpointConfig>,
    pub geolocation_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let drill = DrillPolicy::default();
        Self {
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            page_size: crate::listing::DEFAULT_PAGE_SIZE,
            clustering: ClusterConfig::default(),
            drill_zoom: drill.drill_zoom,
            drill_zoom_step: drill.step,
            backend: None,
            geocoder: None,
            geolocation_timeout_ms: 5000,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults when no file is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(EngineError::Config("pageSize must be positive".into()));
        }
        let c = &self.clustering;
        if c.fine_radius_min_zoom > c.individual_threshold
            || u16::from(c.individual_threshold) > u16::from(c.max_zoom) + 1
        {
            return Err(EngineError::Config(format!(
                "zoom thresholds out of order: fine {} / individual {} / max {}",
                c.fine_radius_min_zoom, c.individual_threshold, c.max_zoom
            )));
        }
        if !(c.fine_radius_deg > 0.0 && c.coarse_radius_deg >= c.fine_radius_deg) {
            return Err(EngineError::Config(format!(
                "cluster radii must satisfy 0 < fine ({}) <= coarse ({})",
                c.fine_radius_deg, c.coarse_radius_deg
            )));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn geolocation_timeout(&self) -> Duration {
        Duration::from_millis(self.geolocation_timeout_ms)
    }

    pub fn drill_policy(&self) -> DrillPolicy {
        DrillPolicy { drill_zoom: self.drill_zoom, step: self.drill_zoom_step }
    }
}
