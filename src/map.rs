//! Map session: single owner of the viewport and the marker table.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cluster::{cluster, ClusterConfig};
use crate::error::Result;
use crate::geo::Coordinates;
use crate::listing::Listing;
use crate::reconcile::{ClickOutcome, MapSurface, MarkerKey, MarkerReconciler, ReconcileStats};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub center: Coordinates,
    pub zoom: u8,
}

/// How cluster clicks behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrillPolicy {
    /// Below this zoom a cluster click zooms in; at or above it lists members.
    pub drill_zoom: u8,
    /// Zoom levels added per drill-down click.
    pub step: u8,
}

impl Default for DrillPolicy {
    fn default() -> Self {
        Self { drill_zoom: 13, step: 2 }
    }
}

pub struct MapSession {
    viewport: Viewport,
    config: ClusterConfig,
    drill: DrillPolicy,
    reconciler: MarkerReconciler,
    listings: Vec<Listing>,
}

impl MapSession {
    pub fn new(viewport: Viewport, config: ClusterConfig, drill: DrillPolicy) -> Result<Self> {
        viewport.center.validate()?;
        config.check_zoom(viewport.zoom)?;
        Ok(Self {
            viewport,
            config,
            drill,
            reconciler: MarkerReconciler::new(),
            listings: Vec::new(),
        })
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn reconciler(&self) -> &MarkerReconciler {
        &self.reconciler
    }

    /// Listings the markers were last derived from.
    #[cfg(test)]
    pub fn listings(&self) -> &[Listing] {
        &self.listings
    }

    /// Replace the rendered result set.
    pub fn show_results<M: MapSurface>(
        &mut self,
        listings: &[Listing],
        surface: &mut M,
    ) -> Result<ReconcileStats> {
        self.listings = listings.to_vec();
        self.render(surface)
    }

    /// The user panned or zoomed.
    pub fn on_viewport_change<M: MapSurface>(
        &mut self,
        viewport: Viewport,
        surface: &mut M,
    ) -> Result<ReconcileStats> {
        viewport.center.validate()?;
        self.config.check_zoom(viewport.zoom)?;
        let zoom_changed = viewport.zoom != self.viewport.zoom;
        self.viewport = viewport;
        if !zoom_changed {
            // Grouping depends on zoom only.
            return Ok(ReconcileStats { unchanged: self.reconciler.len(), ..Default::default() });
        }
        self.render(surface)
    }

    /// Move the map to a point without changing zoom (geolocation, address search).
    pub fn recenter<M: MapSurface>(&mut self, center: Coordinates, surface: &mut M) -> Result<()> {
        center.validate()?;
        self.viewport.center = center;
        surface.pan_to(center);
        Ok(())
    }

    /// Resolve a marker click. Cluster drill-downs move the viewport and re-render.
    pub fn click<M: MapSurface>(&mut self, key: &MarkerKey, surface: &mut M) -> Result<ClickOutcome> {
        let outcome = self.reconciler.click(key, self.viewport.zoom, self.drill.drill_zoom);
        match &outcome {
            ClickOutcome::ZoomIn { center } => {
                let zoom = self
                    .viewport
                    .zoom
                    .saturating_add(self.drill.step)
                    .min(self.config.max_zoom);
                info!(%key, zoom, "drilling into cluster");
                surface.pan_to(*center);
                surface.set_zoom(zoom);
                self.viewport = Viewport { center: *center, zoom };
                self.render(surface)?;
            }
            ClickOutcome::ShowListing(_) => {
                self.reconciler.select(key, surface);
            }
            ClickOutcome::ShowMembers(members) => {
                debug!(%key, members = members.len(), "cluster members requested");
                self.reconciler.select(key, surface);
            }
            ClickOutcome::Stale => debug!(%key, "click on a marker that is gone"),
        }
        Ok(outcome)
    }

    /// Highlight whichever marker currently shows the listing.
    pub fn select_listing<M: MapSurface>(&mut self, id: &str, surface: &mut M) -> bool {
        match self.reconciler.marker_for_listing(id).cloned() {
            Some(key) => self.reconciler.select(&key, surface),
            None => false,
        }
    }

    fn render<M: MapSurface>(&mut self, surface: &mut M) -> Result<ReconcileStats> {
        let entries = cluster(&self.listings, self.viewport.zoom, &self.config)?;
        Ok(self.reconciler.reconcile(entries, surface))
    }
}
