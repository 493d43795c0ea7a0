//! Listing filter/sort pipeline: predicates, stable ordering, pagination.
//!
//! Everything here is a pure transform over a snapshot of listings.

use std::cmp::Ordering;

use crate::error::Result;
use crate::geo::{arc_degrees, distance_km, Coordinates};
use crate::listing::{Listing, ResultPage, SearchParams, SortBy};

/// Filter `listings` by `params` and order the survivors by `params.sort_by`.
pub fn apply(listings: &[Listing], params: &SearchParams) -> Result<Vec<Listing>> {
    params.validate()?;
    let mut survivors: Vec<Listing> = listings
        .iter()
        .filter(|listing| matches(listing, params))
        .cloned()
        .collect();
    let center = params.location.map(|loc| loc.center());
    sort_listings(&mut survivors, params.sort_by, center.as_ref());
    Ok(survivors)
}

/// True when the listing passes every predicate in `params`.
pub fn matches(listing: &Listing, params: &SearchParams) -> bool {
    matches_keyword(listing, &params.keyword)
        && (params.categories.is_empty() || params.categories.contains(&listing.category))
        && params
            .price_range
            .map_or(true, |r| listing.price.amount >= r.min && listing.price.amount <= r.max)
        && params.rating_min.map_or(true, |min| listing.rating.average >= min)
        && params.location.map_or(true, |loc| {
            within_radius(listing, &loc.center(), loc.radius_km)
        })
        && params.date_range.map_or(true, |range| match listing.schedule {
            Some(s) => s.start <= range.end && s.end >= range.start,
            None => true,
        })
        && (!params.available_only || listing.is_available())
}

fn matches_keyword(listing: &Listing, keyword: &str) -> bool {
    let needle = keyword.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    [&listing.title, &listing.description, &listing.provider_name]
        .iter()
        .any(|field| field.to_lowercase().contains(&needle))
}

fn within_radius(listing: &Listing, center: &Coordinates, radius_km: f64) -> bool {
    match listing.coordinates {
        // A latitude gap wider than the radius rules the point out without trig.
        Some(coords) if (coords.lat - center.lat).abs() > arc_degrees(radius_km) + 1e-9 => false,
        Some(coords) => distance_km(center, &coords).is_ok_and(|d| d <= radius_km),
        None => false,
    }
}

/// Stable in-place sort. Equal keys keep their input order.
///
/// `Distance` needs a center; without one the order is left untouched.
pub fn sort_listings(listings: &mut Vec<Listing>, sort_by: SortBy, center: Option<&Coordinates>) {
    match sort_by {
        SortBy::Relevance => {}
        SortBy::Distance => {
            let Some(center) = center else { return };
            let mut keyed: Vec<(Option<f64>, Listing)> = listings
                .drain(..)
                .map(|l| (distance_to(&l, center), l))
                .collect();
            keyed.sort_by(|(a, _), (b, _)| missing_last(*a, *b));
            listings.extend(keyed.into_iter().map(|(_, l)| l));
        }
        SortBy::Rating => listings.sort_by(|a, b| b.rating.average.total_cmp(&a.rating.average)),
        SortBy::PriceLow => listings.sort_by(|a, b| a.price.amount.total_cmp(&b.price.amount)),
        SortBy::PriceHigh => listings.sort_by(|a, b| b.price.amount.total_cmp(&a.price.amount)),
        SortBy::Newest => listings.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        SortBy::Popularity => listings.sort_by_key(|l| std::cmp::Reverse(l.popularity())),
    }
}

fn distance_to(listing: &Listing, center: &Coordinates) -> Option<f64> {
    listing
        .coordinates
        .and_then(|coords| distance_km(center, &coords).ok())
}

fn missing_last(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Cut one 1-based page out of an ordered result list.
pub fn paginate(ordered: Vec<Listing>, page: usize, page_size: usize) -> ResultPage {
    let total = ordered.len();
    let start = page.saturating_sub(1).saturating_mul(page_size);
    let listings: Vec<Listing> = ordered.into_iter().skip(start).take(page_size).collect();
    ResultPage {
        listings,
        total,
        page,
        page_size,
        has_more: page.saturating_mul(page_size) < total,
    }
}

/// A listing paired with its distance from the search center.
#[derive(Debug, Clone)]
pub struct DistanceAnnotated<'a> {
    pub listing: &'a Listing,
    pub distance_km: Option<f64>,
}

/// Attach distances for the list view. Listings without coordinates get `None`.
pub fn annotate_distances<'a>(
    listings: &'a [Listing],
    center: Option<&Coordinates>,
) -> Vec<DistanceAnnotated<'a>> {
    listings
        .iter()
        .map(|listing| DistanceAnnotated {
            listing,
            distance_km: center.and_then(|c| distance_to(listing, c)),
        })
        .collect()
}
