//! Listing records and the search parameter / result page shapes.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::geo::Coordinates;

pub type ListingId = String;

/// Closed set of listing categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Work,
    Help,
    Volunteer,
    Seminar,
    Event,
    Meeting,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Work,
        Category::Help,
        Category::Volunteer,
        Category::Seminar,
        Category::Event,
        Category::Meeting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Work => "work",
            Category::Help => "help",
            Category::Volunteer => "volunteer",
            Category::Seminar => "seminar",
            Category::Event => "event",
            Category::Meeting => "meeting",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::InvalidParams(format!("unknown category: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
    /// Billing unit, e.g. "hour" or "session".
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rating {
    pub average: f64,
    pub count: u32,
}

/// Date window during which an activity takes place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// A geo-taggable catalog item. Treated as an immutable snapshot per result page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub provider_name: String,
    pub category: Category,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    pub price: Price,
    #[serde(default)]
    pub rating: Rating,
    /// `None` means unlimited.
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub booked_count: u32,
    /// Favourites and other non-booking engagement.
    #[serde(default)]
    pub engagement: u32,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    pub created_at: DateTime<Utc>,
}

impl Listing {
    pub fn is_available(&self) -> bool {
        self.capacity.map_or(true, |cap| self.booked_count < cap)
    }

    /// Coordinates, if present and inside the valid range.
    pub fn valid_coordinates(&self) -> Option<Coordinates> {
        self.coordinates.filter(Coordinates::is_valid)
    }

    pub fn popularity(&self) -> u64 {
        u64::from(self.booked_count) + u64::from(self.engagement)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Search center plus radius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationFilter {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: f64,
}

impl LocationFilter {
    pub fn center(&self) -> Coordinates {
        Coordinates { lat: self.lat, lng: self.lng }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Relevance,
    Distance,
    Rating,
    PriceLow,
    PriceHigh,
    Newest,
    Popularity,
}

impl SortBy {
    pub const ALL: [SortBy; 7] = [
        SortBy::Relevance,
        SortBy::Distance,
        SortBy::Rating,
        SortBy::PriceLow,
        SortBy::PriceHigh,
        SortBy::Newest,
        SortBy::Popularity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortBy::Relevance => "relevance",
            SortBy::Distance => "distance",
            SortBy::Rating => "rating",
            SortBy::PriceLow => "price_low",
            SortBy::PriceHigh => "price_high",
            SortBy::Newest => "newest",
            SortBy::Popularity => "popularity",
        }
    }
}

impl FromStr for SortBy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SortBy::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| EngineError::InvalidParams(format!("unknown sort key: {s}")))
    }
}

pub const DEFAULT_PAGE_SIZE: usize = 10;

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Everything a search is built from. A request carries an immutable copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub categories: BTreeSet<Category>,
    #[serde(default)]
    pub price_range: Option<PriceRange>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub rating_min: Option<f64>,
    #[serde(default)]
    pub location: Option<LocationFilter>,
    #[serde(default)]
    pub available_only: bool,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            keyword: String::new(),
            categories: BTreeSet::new(),
            price_range: None,
            date_range: None,
            rating_min: None,
            location: None,
            available_only: false,
            sort_by: SortBy::Relevance,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SearchParams {
    /// Number of filter fields that differ from their defaults.
    pub fn active_filter_count(&self) -> usize {
        [
            !self.keyword.trim().is_empty(),
            !self.categories.is_empty(),
            self.location.is_some(),
            self.price_range.is_some(),
            self.date_range.is_some(),
            self.rating_min.is_some_and(|r| r > 0.0),
            self.available_only,
        ]
        .into_iter()
        .filter(|active| *active)
        .count()
    }

    /// True when both describe the same query, ignoring the page number.
    pub fn same_query(&self, other: &SearchParams) -> bool {
        let mut a = self.clone();
        a.page = other.page;
        a == *other
    }

    /// Reject parameters the pipeline cannot evaluate.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.page == 0 {
            return Err(EngineError::InvalidParams("page is 1-based".into()));
        }
        if self.page_size == 0 {
            return Err(EngineError::InvalidParams("pageSize must be positive".into()));
        }
        if let Some(range) = &self.price_range {
            if range.min.is_nan() || range.max.is_nan() || range.min > range.max {
                return Err(EngineError::InvalidParams(format!(
                    "price range {}..{} is empty",
                    range.min, range.max
                )));
            }
        }
        if let Some(range) = &self.date_range {
            if range.start > range.end {
                return Err(EngineError::InvalidParams(format!(
                    "date range {}..{} is empty",
                    range.start, range.end
                )));
            }
        }
        if let Some(location) = &self.location {
            location.center().validate()?;
            if location.radius_km.is_nan() || location.radius_km < 0.0 {
                return Err(EngineError::InvalidParams(format!(
                    "radius {} km is not a distance",
                    location.radius_km
                )));
            }
        }
        Ok(())
    }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPage {
    pub listings: Vec<Listing>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
}


#[cfg(test)]
mod tests {
    use super::fixtures::listing;
    use super::*;

    #[test]
    fn availability_respects_capacity() {
        let mut l = listing("1", 35.0, 135.0);
        assert!(l.is_available());
        l.capacity = Some(2);
        l.booked_count = 1;
        assert!(l.is_available());
        l.booked_count = 2;
        assert!(!l.is_available());
    }

    #[test]
    fn out_of_range_coordinates_are_not_valid() {
        let mut l = listing("1", 135.0, 35.0);
        assert!(l.valid_coordinates().is_none());
        l.coordinates = None;
        assert!(l.valid_coordinates().is_none());
    }

    #[test]
    fn active_filter_count_tracks_non_default_fields() {
        let mut params = SearchParams::default();
        assert_eq!(params.active_filter_count(), 0);
        params.keyword = "  ".into();
        params.sort_by = SortBy::Newest;
        params.page = 4;
        assert_eq!(params.active_filter_count(), 0);
        params.keyword = "cat".into();
        params.categories.insert(Category::Event);
        params.rating_min = Some(0.0);
        assert_eq!(params.active_filter_count(), 2);
        params.rating_min = Some(3.5);
        params.available_only = true;
        params.location = Some(LocationFilter { lat: 35.0, lng: 135.0, radius_km: 5.0 });
        assert_eq!(params.active_filter_count(), 5);
    }

    #[test]
    fn same_query_ignores_page() {
        let a = SearchParams::default();
        let mut b = a.clone();
        b.page = 3;
        assert!(a.same_query(&b));
        b.keyword = "x".into();
        assert!(!a.same_query(&b));
    }

    #[test]
    fn validate_rejects_unusable_params() {
        let mut params = SearchParams { page: 0, ..SearchParams::default() };
        assert!(params.validate().is_err());
        params.page = 1;
        params.price_range = Some(PriceRange { min: 10.0, max: 5.0 });
        assert!(params.validate().is_err());
        params.price_range = None;
        params.location = Some(LocationFilter { lat: 95.0, lng: 0.0, radius_km: 1.0 });
        assert!(matches!(params.validate(), Err(EngineError::InvalidCoordinate { .. })));
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let params: SearchParams =
            serde_json::from_str(r#"{"keyword":"yoga","categories":["event"],"sortBy":"price_low"}"#)
                .unwrap();
        assert_eq!(params.page, 1);
        assert_eq!(params.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(params.sort_by, SortBy::PriceLow);
        assert!(params.categories.contains(&Category::Event));
    }

    #[test]
    fn parse_category_and_sort() {
        assert_eq!("Seminar".parse::<Category>().unwrap(), Category::Seminar);
        assert!("cooking".parse::<Category>().is_err());
        assert_eq!("price_high".parse::<SortBy>().unwrap(), SortBy::PriceHigh);
    }
}
