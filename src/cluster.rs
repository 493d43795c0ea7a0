//! Zoom-dependent proximity clustering of geo-located listings.
//!
//! Grouping uses planar degree distance against a per-cluster anchor (the
//! first member's coordinates). A degree of longitude shrinks with latitude,
//! so clusters get narrower east-west the further they are from the equator.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::geo::Coordinates;
use crate::listing::Listing;

/// Zoom thresholds and grouping radii.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// At or above this zoom every listing gets its own marker.
    pub individual_threshold: u8,
    /// Radius used from `fine_radius_min_zoom` up to the threshold.
    pub fine_radius_deg: f64,
    pub fine_radius_min_zoom: u8,
    /// Radius used below `fine_radius_min_zoom`.
    pub coarse_radius_deg: f64,
    pub max_zoom: u8,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            individual_threshold: 15,
            fine_radius_deg: 0.01,
            fine_radius_min_zoom: 12,
            coarse_radius_deg: 0.02,
            max_zoom: 22,
        }
    }
}

impl ClusterConfig {
    pub fn radius_for(&self, zoom: u8) -> f64 {
        if zoom >= self.fine_radius_min_zoom {
            self.fine_radius_deg
        } else {
            self.coarse_radius_deg
        }
    }

    pub fn check_zoom(&self, zoom: u8) -> Result<()> {
        if zoom > self.max_zoom {
            return Err(EngineError::InvalidZoom(i32::from(zoom)));
        }
        Ok(())
    }
}

/// A group of nearby listings rendered as one marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterData {
    pub centroid: Coordinates,
    pub members: Vec<Listing>,
    pub aggregate_rating: f64,
}

impl ClusterData {
    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|l| l.id.as_str())
    }
}

/// One entry on the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MarkerKind {
    Individual(Listing),
    Cluster(ClusterData),
}

impl MarkerKind {
    pub fn position(&self) -> Coordinates {
        match self {
            MarkerKind::Individual(listing) => listing
                .valid_coordinates()
                .unwrap_or(Coordinates { lat: 0.0, lng: 0.0 }),
            MarkerKind::Cluster(cluster) => cluster.centroid,
        }
    }

    /// Ids of every listing this entry stands for.
    pub fn member_ids(&self) -> Vec<&str> {
        match self {
            MarkerKind::Individual(listing) => vec![listing.id.as_str()],
            MarkerKind::Cluster(cluster) => cluster.member_ids().collect(),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Skipped {
    unlocated: usize,
    duplicates: usize,
}

/// Listings that can go on the map, first occurrence of each id only.
fn locate(listings: &[Listing]) -> (Vec<(Coordinates, &Listing)>, Skipped) {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut skipped = Skipped::default();
    let mut located = Vec::with_capacity(listings.len());
    for listing in listings {
        match listing.valid_coordinates() {
            None => skipped.unlocated += 1,
            Some(_) if !seen.insert(listing.id.as_str()) => skipped.duplicates += 1,
            Some(coords) => located.push((coords, listing)),
        }
    }
    (located, skipped)
}

/// Partition geo-located listings into individual markers and clusters.
///
/// Listings without valid coordinates are skipped, as are repeated ids.
/// Each call rebuilds from scratch; nothing carries over between calls.
pub fn cluster(listings: &[Listing], zoom: u8, config: &ClusterConfig) -> Result<Vec<MarkerKind>> {
    config.check_zoom(zoom)?;
    let (located, skipped) = locate(listings);
    if skipped.unlocated > 0 {
        debug!(unlocated = skipped.unlocated, "listings without usable coordinates left off the map");
    }
    if skipped.duplicates > 0 {
        warn!(duplicates = skipped.duplicates, "repeated listing ids left off the map");
    }

    if zoom >= config.individual_threshold {
        return Ok(located
            .into_iter()
            .map(|(_, l)| MarkerKind::Individual(l.clone()))
            .collect());
    }

    let radius = config.radius_for(zoom);
    let mut groups: Vec<(Coordinates, Vec<&Listing>)> = Vec::new();
    for (coords, listing) in located {
        match groups
            .iter_mut()
            .find(|(anchor, _)| anchor.degree_distance(&coords) <= radius)
        {
            Some((_, members)) => members.push(listing),
            None => groups.push((coords, vec![listing])),
        }
    }

    Ok(groups
        .into_iter()
        .map(|(centroid, members)| {
            if members.len() == 1 {
                return MarkerKind::Individual(members[0].clone());
            }
            let aggregate_rating =
                members.iter().map(|l| l.rating.average).sum::<f64>() / members.len() as f64;
            MarkerKind::Cluster(ClusterData {
                centroid,
                members: members.into_iter().cloned().collect(),
                aggregate_rating,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::fixtures::listing;

    fn pair() -> Vec<Listing> {
        vec![listing("1", 35.0, 135.0), listing("2", 35.0001, 135.0001)]
    }

    fn covered_ids(entries: &[MarkerKind]) -> Vec<String> {
        let mut ids: Vec<String> =
            entries.iter().flat_map(|e| e.member_ids()).map(str::to_string).collect();
        ids.sort();
        ids
    }

    #[test]
    fn nearby_pair_merges_at_low_zoom() {
        let entries = cluster(&pair(), 10, &ClusterConfig::default()).unwrap();
        assert_eq!(entries.len(), 1);
        let MarkerKind::Cluster(c) = &entries[0] else { panic!("expected a cluster") };
        assert_eq!(c.members.len(), 2);
        assert_eq!(c.centroid, Coordinates { lat: 35.0, lng: 135.0 });
    }

    #[test]
    fn nearby_pair_splits_at_high_zoom() {
        let entries = cluster(&pair(), 16, &ClusterConfig::default()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| matches!(e, MarkerKind::Individual(_))));
    }

    #[test]
    fn radius_steps_down_with_zoom() {
        let config = ClusterConfig::default();
        assert_eq!(config.radius_for(5), 0.02);
        assert_eq!(config.radius_for(11), 0.02);
        assert_eq!(config.radius_for(12), 0.01);
        // 0.015 degrees apart: grouped coarsely, separate at fine radius.
        let listings = vec![listing("a", 35.0, 135.0), listing("b", 35.015, 135.0)];
        assert_eq!(cluster(&listings, 11, &config).unwrap().len(), 1);
        assert_eq!(cluster(&listings, 13, &config).unwrap().len(), 2);
    }

    #[test]
    fn anchor_is_the_first_member_and_does_not_drift() {
        // b joins a; c is within radius of b but not of the anchor.
        let listings = vec![
            listing("a", 35.0, 135.0),
            listing("b", 35.015, 135.0),
            listing("c", 35.03, 135.0),
        ];
        let entries = cluster(&listings, 10, &ClusterConfig::default()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].member_ids(), ["a", "b"]);
        assert_eq!(entries[1].member_ids(), ["c"]);
        assert_eq!(entries[0].position(), Coordinates { lat: 35.0, lng: 135.0 });
    }

    #[test]
    fn aggregate_rating_is_the_member_mean() {
        let mut listings = pair();
        listings[0].rating.average = 3.0;
        listings[1].rating.average = 5.0;
        listings[1].rating.count = 100;
        let entries = cluster(&listings, 8, &ClusterConfig::default()).unwrap();
        let MarkerKind::Cluster(c) = &entries[0] else { panic!("expected a cluster") };
        assert_eq!(c.aggregate_rating, 4.0);
    }

    #[test]
    fn every_located_listing_is_covered_exactly_once_at_every_zoom() {
        let mut listings: Vec<Listing> = (0..40)
            .map(|i| {
                let f = i as f64;
                listing(&format!("{i:02}"), 35.0 + (f * 0.0071) % 0.09, 135.0 + (f * 0.013) % 0.11)
            })
            .collect();
        listings[3].coordinates = None;
        listings[7].coordinates = Some(Coordinates { lat: 120.0, lng: 0.0 });
        let expected: Vec<String> = listings
            .iter()
            .filter(|l| l.valid_coordinates().is_some())
            .map(|l| l.id.clone())
            .collect();
        let config = ClusterConfig::default();
        for zoom in 0..=config.max_zoom {
            let entries = cluster(&listings, zoom, &config).unwrap();
            assert_eq!(covered_ids(&entries), expected, "zoom {zoom}");
            if zoom >= config.individual_threshold {
                assert_eq!(entries.len(), expected.len());
            }
        }
    }

    #[test]
    fn repeated_ids_are_rendered_once() {
        let listings = vec![listing("1", 35.0, 135.0), listing("1", 35.0, 135.0)];
        let entries = cluster(&listings, 16, &ClusterConfig::default()).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn unlocated_and_repeated_listings_are_counted_apart() {
        let mut unlocated = listing("u", 0.0, 0.0);
        unlocated.coordinates = None;
        let listings = vec![
            listing("1", 35.0, 135.0),
            listing("1", 35.5, 135.5),
            unlocated,
            listing("bad", 95.0, 135.0),
        ];
        let (located, skipped) = locate(&listings);
        assert_eq!(located.len(), 1);
        assert_eq!(skipped, Skipped { unlocated: 2, duplicates: 1 });
    }

    #[test]
    fn zoom_above_maximum_is_a_caller_error() {
        let err = cluster(&pair(), 23, &ClusterConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidZoom(23)));
    }

    #[test]
    fn empty_input_is_an_empty_map() {
        assert!(cluster(&[], 3, &ClusterConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn entries_serialize_with_a_kind_tag() {
        let entries = cluster(&pair(), 10, &ClusterConfig::default()).unwrap();
        let json = serde_json::to_value(&entries).unwrap();
        assert_eq!(json[0]["kind"], "cluster");
        assert_eq!(json[0]["members"].as_array().unwrap().len(), 2);
    }
}
