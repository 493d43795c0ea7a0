//! Keeps the markers on a map surface in sync with the latest clustering
//! output, issuing only the create/update/remove calls that changed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::cluster::MarkerKind;
use crate::error::EngineError;
use crate::geo::Coordinates;
use crate::listing::{Category, Listing, ListingId};

/// Stable identity of a marker across reconciliations.
///
/// Clusters have no identity of their own; their key is derived from the
/// anchor position and member count, so a regrouped cluster is a new marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MarkerKey {
    Listing(ListingId),
    Cluster { lat_e6: i64, lng_e6: i64, count: usize },
}

impl MarkerKey {
    pub fn for_entry(entry: &MarkerKind) -> Self {
        match entry {
            MarkerKind::Individual(listing) => MarkerKey::Listing(listing.id.clone()),
            MarkerKind::Cluster(cluster) => MarkerKey::Cluster {
                lat_e6: (cluster.centroid.lat * 1e6).round() as i64,
                lng_e6: (cluster.centroid.lng * 1e6).round() as i64,
                count: cluster.members.len(),
            },
        }
    }
}

impl fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerKey::Listing(id) => write!(f, "listing:{id}"),
            MarkerKey::Cluster { lat_e6, lng_e6, count } => {
                write!(f, "cluster:{lat_e6}:{lng_e6}:{count}")
            }
        }
    }
}

impl FromStr for MarkerKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || EngineError::InvalidParams(format!("not a marker key: {s}"));
        if let Some(id) = s.strip_prefix("listing:") {
            return Ok(MarkerKey::Listing(id.to_string()));
        }
        let rest = s.strip_prefix("cluster:").ok_or_else(bad)?;
        let mut parts = rest.split(':');
        let (Some(lat), Some(lng), Some(count), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        Ok(MarkerKey::Cluster {
            lat_e6: lat.parse().map_err(|_| bad())?,
            lng_e6: lng.parse().map_err(|_| bad())?,
            count: count.parse().map_err(|_| bad())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerIcon {
    Listing(Category),
    /// Member count and mean rating in tenths of a star.
    Cluster { count: usize, rating_tenths: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerVisual {
    pub icon: MarkerIcon,
    pub selected: bool,
}

impl MarkerVisual {
    fn for_entry(entry: &MarkerKind, selected: bool) -> Self {
        let icon = match entry {
            MarkerKind::Individual(listing) => MarkerIcon::Listing(listing.category),
            MarkerKind::Cluster(cluster) => MarkerIcon::Cluster {
                count: cluster.members.len(),
                rating_tenths: (cluster.aggregate_rating.max(0.0) * 10.0).round() as u32,
            },
        };
        Self { icon, selected }
    }
}

/// The map widget the reconciler draws on.
pub trait MapSurface {
    fn place_marker(&mut self, key: &MarkerKey, position: Coordinates, visual: &MarkerVisual);
    fn update_marker(&mut self, key: &MarkerKey, position: Coordinates, visual: &MarkerVisual);
    fn remove_marker(&mut self, key: &MarkerKey);
    fn pan_to(&mut self, position: Coordinates);
    fn set_zoom(&mut self, zoom: u8);
}

/// A marker the reconciler has put on the surface.
#[derive(Debug, Clone)]
pub struct MarkerHandle {
    pub key: MarkerKey,
    pub entry: MarkerKind,
    pub position: Coordinates,
    pub visual: MarkerVisual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

/// What a marker click resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClickOutcome {
    ShowListing(Listing),
    /// Cluster clicked below the drill zoom: zoom in around its anchor.
    ZoomIn { center: Coordinates },
    /// Cluster clicked at or above the drill zoom: list its members.
    ShowMembers(Vec<Listing>),
    /// The clicked marker is no longer on the map.
    Stale,
}

/// Owner of the marker table. At most one marker per listing id, and at most
/// one selected marker.
#[derive(Debug, Default)]
pub struct MarkerReconciler {
    handles: HashMap<MarkerKey, MarkerHandle>,
    owners: HashMap<ListingId, MarkerKey>,
    selected: Option<MarkerKey>,
}

impl MarkerReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[cfg(test)]
    pub fn handle(&self, key: &MarkerKey) -> Option<&MarkerHandle> {
        self.handles.get(key)
    }

    /// Handles sorted by key.
    pub fn handles(&self) -> Vec<&MarkerHandle> {
        let mut handles: Vec<&MarkerHandle> = self.handles.values().collect();
        handles.sort_by(|a, b| a.key.cmp(&b.key));
        handles
    }

    pub fn selected(&self) -> Option<&MarkerKey> {
        self.selected.as_ref()
    }

    /// The marker currently showing a listing, individual or cluster.
    pub fn marker_for_listing(&self, id: &str) -> Option<&MarkerKey> {
        self.owners.get(id)
    }

    /// Diff `entries` against the markers on the surface and apply the changes.
    pub fn reconcile<M: MapSurface>(&mut self, entries: Vec<MarkerKind>, surface: &mut M) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let mut next: Vec<(MarkerKey, MarkerKind)> = Vec::with_capacity(entries.len());
        let mut keys: HashSet<MarkerKey> = HashSet::new();
        let mut claimed: HashSet<String> = HashSet::new();
        for entry in entries {
            let key = MarkerKey::for_entry(&entry);
            let ids = entry.member_ids();
            if keys.contains(&key) || ids.iter().any(|id| claimed.contains(*id)) {
                warn!(%key, "entry overlaps an earlier one, skipped");
                continue;
            }
            claimed.extend(ids.into_iter().map(str::to_string));
            keys.insert(key.clone());
            next.push((key, entry));
        }

        // Removals first so a listing never shows under two markers.
        let stale: Vec<MarkerKey> =
            self.handles.keys().filter(|k| !keys.contains(*k)).cloned().collect();
        for key in stale {
            surface.remove_marker(&key);
            self.handles.remove(&key);
            stats.removed += 1;
        }
        if self.selected.as_ref().is_some_and(|k| !keys.contains(k)) {
            self.selected = None;
        }

        self.owners.clear();
        for (key, entry) in next {
            for id in entry.member_ids() {
                self.owners.insert(id.to_string(), key.clone());
            }
            let position = entry.position();
            let visual = MarkerVisual::for_entry(&entry, self.selected.as_ref() == Some(&key));
            match self.handles.get_mut(&key) {
                Some(handle) => {
                    if handle.position != position || handle.visual != visual {
                        surface.update_marker(&key, position, &visual);
                        handle.position = position;
                        handle.visual = visual;
                        stats.updated += 1;
                    } else {
                        stats.unchanged += 1;
                    }
                    handle.entry = entry;
                }
                None => {
                    surface.place_marker(&key, position, &visual);
                    self.handles
                        .insert(key.clone(), MarkerHandle { key, entry, position, visual });
                    stats.created += 1;
                }
            }
        }
        debug!(
            created = stats.created,
            updated = stats.updated,
            removed = stats.removed,
            unchanged = stats.unchanged,
            "markers reconciled"
        );
        stats
    }

    /// Highlight one marker, clearing the previous highlight first.
    pub fn select<M: MapSurface>(&mut self, key: &MarkerKey, surface: &mut M) -> bool {
        if !self.handles.contains_key(key) {
            return false;
        }
        if self.selected.as_ref() == Some(key) {
            return true;
        }
        self.clear_selection(surface);
        self.set_selected(key, true, surface);
        self.selected = Some(key.clone());
        true
    }

    pub fn clear_selection<M: MapSurface>(&mut self, surface: &mut M) {
        if let Some(previous) = self.selected.take() {
            self.set_selected(&previous, false, surface);
        }
    }

    fn set_selected<M: MapSurface>(&mut self, key: &MarkerKey, selected: bool, surface: &mut M) {
        if let Some(handle) = self.handles.get_mut(key) {
            handle.visual.selected = selected;
            surface.update_marker(key, handle.position, &handle.visual);
        }
    }

    /// Resolve a click to the listing or cluster behind the marker.
    pub fn click(&self, key: &MarkerKey, zoom: u8, drill_zoom: u8) -> ClickOutcome {
        match self.handles.get(key).map(|h| &h.entry) {
            None => ClickOutcome::Stale,
            Some(MarkerKind::Individual(listing)) => ClickOutcome::ShowListing(listing.clone()),
            Some(MarkerKind::Cluster(cluster)) if zoom < drill_zoom => {
                ClickOutcome::ZoomIn { center: cluster.centroid }
            }
            Some(MarkerKind::Cluster(cluster)) => ClickOutcome::ShowMembers(cluster.members.clone()),
        }
    }
}

/// One call made against a [`MapSurface`].
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceOp {
    Place(MarkerKey),
    Update(MarkerKey, bool),
    Remove(MarkerKey),
    PanTo(Coordinates),
    SetZoom(u8),
}

/// Surface that records every call; drained by the caller.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSurface {
    pub ops: Vec<SurfaceOp>,
}

#[cfg(test)]
impl RecordingSurface {
    pub fn drain(&mut self) -> Vec<SurfaceOp> {
        std::mem::take(&mut self.ops)
    }
}

#[cfg(test)]
impl MapSurface for RecordingSurface {
    fn place_marker(&mut self, key: &MarkerKey, _position: Coordinates, _visual: &MarkerVisual) {
        self.ops.push(SurfaceOp::Place(key.clone()));
    }

    fn update_marker(&mut self, key: &MarkerKey, _position: Coordinates, visual: &MarkerVisual) {
        self.ops.push(SurfaceOp::Update(key.clone(), visual.selected));
    }

    fn remove_marker(&mut self, key: &MarkerKey) {
        self.ops.push(SurfaceOp::Remove(key.clone()));
    }

    fn pan_to(&mut self, position: Coordinates) {
        self.ops.push(SurfaceOp::PanTo(position));
    }

    fn set_zoom(&mut self, zoom: u8) {
        self.ops.push(SurfaceOp::SetZoom(zoom));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{cluster, ClusterConfig};
    use crate::listing::fixtures::listing;

    fn listings() -> Vec<Listing> {
        vec![
            listing("1", 35.0, 135.0),
            listing("2", 35.0001, 135.0001),
            listing("3", 36.0, 136.0),
        ]
    }

    fn entries(zoom: u8) -> Vec<MarkerKind> {
        cluster(&listings(), zoom, &ClusterConfig::default()).unwrap()
    }

    fn key(id: &str) -> MarkerKey {
        MarkerKey::Listing(id.to_string())
    }

    #[test]
    fn first_pass_places_every_entry() {
        let mut reconciler = MarkerReconciler::new();
        let mut surface = RecordingSurface::default();
        let stats = reconciler.reconcile(entries(16), &mut surface);
        assert_eq!(stats.created, 3);
        assert_eq!(surface.ops.len(), 3);
        assert!(surface.ops.iter().all(|op| matches!(op, SurfaceOp::Place(_))));
    }

    #[test]
    fn reconciling_the_same_set_twice_is_a_no_op() {
        let mut reconciler = MarkerReconciler::new();
        let mut surface = RecordingSurface::default();
        reconciler.reconcile(entries(10), &mut surface);
        surface.drain();
        let stats = reconciler.reconcile(entries(10), &mut surface);
        assert!(surface.ops.is_empty());
        assert_eq!(stats, ReconcileStats { unchanged: 2, ..ReconcileStats::default() });
    }

    #[test]
    fn zooming_in_splits_the_cluster_with_minimal_churn() {
        let mut reconciler = MarkerReconciler::new();
        let mut surface = RecordingSurface::default();
        reconciler.reconcile(entries(10), &mut surface);
        let cluster_key = reconciler.marker_for_listing("1").cloned().unwrap();
        assert_eq!(reconciler.marker_for_listing("2"), Some(&cluster_key));
        surface.drain();

        let stats = reconciler.reconcile(entries(16), &mut surface);
        assert_eq!(stats, ReconcileStats { created: 2, removed: 1, unchanged: 1, updated: 0 });
        assert_eq!(surface.ops[0], SurfaceOp::Remove(cluster_key));
        assert_eq!(reconciler.marker_for_listing("1"), Some(&key("1")));
        assert_eq!(reconciler.len(), 3);
    }

    #[test]
    fn no_listing_is_owned_by_two_markers() {
        let mut reconciler = MarkerReconciler::new();
        let mut surface = RecordingSurface::default();
        for zoom in [16, 10, 14, 3, 16] {
            reconciler.reconcile(entries(zoom), &mut surface);
            let mut seen = HashSet::new();
            for handle in reconciler.handles() {
                for id in handle.entry.member_ids() {
                    assert!(seen.insert(id.to_string()), "{id} shown twice at zoom {zoom}");
                }
            }
        }
    }

    #[test]
    fn overlapping_entries_are_skipped() {
        let mut reconciler = MarkerReconciler::new();
        let mut surface = RecordingSurface::default();
        let mut doubled = entries(10);
        doubled.push(MarkerKind::Individual(listing("2", 35.0001, 135.0001)));
        let stats = reconciler.reconcile(doubled, &mut surface);
        assert_eq!(stats.created, 2);
    }

    #[test]
    fn selection_moves_and_clears_the_previous_marker_first() {
        let mut reconciler = MarkerReconciler::new();
        let mut surface = RecordingSurface::default();
        reconciler.reconcile(entries(16), &mut surface);
        surface.drain();

        assert!(reconciler.select(&key("1"), &mut surface));
        assert!(reconciler.select(&key("3"), &mut surface));
        assert_eq!(
            surface.drain(),
            [
                SurfaceOp::Update(key("1"), true),
                SurfaceOp::Update(key("1"), false),
                SurfaceOp::Update(key("3"), true),
            ]
        );
        assert_eq!(reconciler.selected(), Some(&key("3")));
        assert!(!reconciler.select(&key("missing"), &mut surface));

        // Selection survives an unchanged reconcile without surface calls.
        reconciler.reconcile(entries(16), &mut surface);
        assert!(surface.ops.is_empty());
        assert!(reconciler.handle(&key("3")).unwrap().visual.selected);
    }

    #[test]
    fn selection_is_dropped_when_its_marker_disappears() {
        let mut reconciler = MarkerReconciler::new();
        let mut surface = RecordingSurface::default();
        reconciler.reconcile(entries(16), &mut surface);
        reconciler.select(&key("1"), &mut surface);
        reconciler.reconcile(entries(10), &mut surface);
        assert!(reconciler.selected().is_none());
    }

    #[test]
    fn clicks_route_by_marker_kind() {
        let mut reconciler = MarkerReconciler::new();
        let mut surface = RecordingSurface::default();
        reconciler.reconcile(entries(10), &mut surface);
        let cluster_key = reconciler.marker_for_listing("1").cloned().unwrap();

        match reconciler.click(&key("3"), 10, 13) {
            ClickOutcome::ShowListing(l) => assert_eq!(l.id, "3"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            reconciler.click(&cluster_key, 10, 13),
            ClickOutcome::ZoomIn { center: Coordinates { lat: 35.0, lng: 135.0 } }
        );
        match reconciler.click(&cluster_key, 13, 13) {
            ClickOutcome::ShowMembers(members) => assert_eq!(members.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reconciler.click(&key("gone"), 10, 13), ClickOutcome::Stale);
    }

    #[test]
    fn marker_keys_parse_back_from_their_display_form() {
        let entries = entries(10);
        for entry in &entries {
            let key = MarkerKey::for_entry(entry);
            assert_eq!(key.to_string().parse::<MarkerKey>().unwrap(), key);
        }
        assert_eq!(
            MarkerKey::for_entry(&entries[0]).to_string(),
            "cluster:35000000:135000000:2"
        );
        assert!("cluster:1:2".parse::<MarkerKey>().is_err());
        assert!("pin:1".parse::<MarkerKey>().is_err());
    }
}
