//! Line-oriented console that drives a search session and a map session.
//!
//! Keyword input is debounced like a search box; every other command acts
//! immediately. Map calls are printed as they would reach a map widget.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::filter::annotate_distances;
use crate::geo::Coordinates;
use crate::geocode::{locate_with_timeout, resolve_location, FixedGeolocator, HttpGeocoder};
use crate::listing::{Category, DateRange, LocationFilter, PriceRange, SortBy};
use crate::map::{MapSession, Viewport};
use crate::reconcile::{ClickOutcome, MapSurface, MarkerIcon, MarkerKey, MarkerVisual};
use crate::session::{FetchMode, SearchSession, SessionEvent, SessionUpdate};
use crate::store::ListingStore;

/// One parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Type(String),
    Search,
    Category(Category),
    ClearCategories,
    Sort(SortBy),
    Price(Option<PriceRange>),
    Rating(Option<f64>),
    Dates(Option<DateRange>),
    Near(Option<LocationFilter>),
    Here(f64),
    Address { radius_km: f64, text: String },
    Available(bool),
    Clear,
    More,
    Retry,
    Status,
    Zoom(u8),
    Pan(Coordinates),
    Click(MarkerKey),
    Select(String),
    List,
    Markers,
    Help,
    Quit,
}

fn bad(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidParams(msg.into())
}

fn number<T: std::str::FromStr>(word: Option<&str>, what: &str) -> Result<T> {
    word.and_then(|w| w.parse().ok())
        .ok_or_else(|| bad(format!("expected {what}")))
}

fn on_off(word: Option<&str>) -> Result<bool> {
    match word {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        _ => Err(bad("expected on|off")),
    }
}

pub fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    let mut words = rest.split_whitespace();
    let off = rest.trim() == "off";
    let command = match head {
        "type" => Command::Type(rest.to_string()),
        "search" => Command::Search,
        "cat" if off => Command::ClearCategories,
        "cat" => Command::Category(rest.parse()?),
        "sort" => Command::Sort(rest.parse()?),
        "price" if off => Command::Price(None),
        "price" => Command::Price(Some(PriceRange {
            min: number(words.next(), "min price")?,
            max: number(words.next(), "max price")?,
        })),
        "rating" if off => Command::Rating(None),
        "rating" => Command::Rating(Some(number(words.next(), "minimum rating")?)),
        "dates" if off => Command::Dates(None),
        "dates" => Command::Dates(Some(DateRange {
            start: number(words.next(), "start date (YYYY-MM-DD)")?,
            end: number(words.next(), "end date (YYYY-MM-DD)")?,
        })),
        "near" if off => Command::Near(None),
        "near" => Command::Near(Some(LocationFilter {
            lat: number(words.next(), "latitude")?,
            lng: number(words.next(), "longitude")?,
            radius_km: number(words.next(), "radius km")?,
        })),
        "here" => Command::Here(number(words.next(), "radius km")?),
        "address" => {
            let radius_km = number(words.next(), "radius km")?;
            let text = words.collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                return Err(bad("expected an address"));
            }
            Command::Address { radius_km, text }
        }
        "available" => Command::Available(on_off(words.next())?),
        "clear" => Command::Clear,
        "more" => Command::More,
        "retry" => Command::Retry,
        "status" => Command::Status,
        "zoom" => Command::Zoom(number(words.next(), "zoom level")?),
        "pan" => Command::Pan(Coordinates {
            lat: number(words.next(), "latitude")?,
            lng: number(words.next(), "longitude")?,
        }),
        "click" => Command::Click(rest.trim().parse()?),
        "select" if !rest.trim().is_empty() => Command::Select(rest.trim().to_string()),
        "list" => Command::List,
        "markers" => Command::Markers,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(bad(format!("unknown command: {other}"))),
    };
    Ok(command)
}

const HELP: &str = "\
type <text>             keyword (debounced)
search                  search now
cat <category>|off      toggle a category, or clear them all
sort <key>              relevance|distance|rating|price_low|price_high|newest|popularity
price <min> <max>|off   price band
rating <min>|off        rating floor
dates <start> <end>|off schedule window, YYYY-MM-DD
near <lat> <lng> <km>|off
here <km>               search around the current position
address <km> <text>     search around an address
available on|off        only listings with free capacity
clear                   reset filters (keeps keyword)
more                    load the next page
retry                   repeat a failed search
status                  search state and last error
zoom <z> | pan <lat> <lng>
click <marker-key>      e.g. listing:42 or cluster:35000000:135000000:3
select <listing-id>
list | markers | help | quit";

/// Map surface that prints every call.
#[derive(Debug, Default)]
pub struct ConsoleSurface;

fn describe(visual: &MarkerVisual) -> String {
    let icon = match &visual.icon {
        MarkerIcon::Listing(category) => category.to_string(),
        MarkerIcon::Cluster { count, rating_tenths } => {
            format!("{count} listings, ★{:.1}", f64::from(*rating_tenths) / 10.0)
        }
    };
    if visual.selected {
        format!("{icon}, selected")
    } else {
        icon
    }
}

impl MapSurface for ConsoleSurface {
    fn place_marker(&mut self, key: &MarkerKey, position: Coordinates, visual: &MarkerVisual) {
        println!("  + {key} @{:.5},{:.5} [{}]", position.lat, position.lng, describe(visual));
    }

    fn update_marker(&mut self, key: &MarkerKey, position: Coordinates, visual: &MarkerVisual) {
        println!("  ~ {key} @{:.5},{:.5} [{}]", position.lat, position.lng, describe(visual));
    }

    fn remove_marker(&mut self, key: &MarkerKey) {
        println!("  - {key}");
    }

    fn pan_to(&mut self, position: Coordinates) {
        println!("  > pan {:.5},{:.5}", position.lat, position.lng);
    }

    fn set_zoom(&mut self, zoom: u8) {
        println!("  > zoom {zoom}");
    }
}

/// External collaborators the console may call.
pub struct Collaborators {
    pub geocoder: Option<HttpGeocoder>,
    pub geolocator: FixedGeolocator,
}

enum Input {
    Line(Option<String>),
    Event(Option<SessionEvent>),
}

/// Run the console until `quit` or end of input.
pub async fn run<S: ListingStore>(
    store: Arc<S>,
    config: &EngineConfig,
    start: Viewport,
    collaborators: Collaborators,
) -> Result<()> {
    let mut session = SearchSession::new(store, config.debounce(), config.page_size);
    let mut map = MapSession::new(start, config.clustering, config.drill_policy())?;
    let mut surface = ConsoleSurface;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("type `help` for commands");
    session.submit();
    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            event = session.next_event() => Input::Event(event),
        };
        match input {
            Input::Line(None) => break,
            Input::Line(Some(line)) if line.trim().is_empty() => {}
            Input::Line(Some(line)) => match parse_command(&line) {
                Ok(Command::Quit) => break,
                Ok(command) => {
                    if let Err(err) =
                        execute(command, &mut session, &mut map, &mut surface, &collaborators, config)
                            .await
                    {
                        println!("! {err}");
                    }
                }
                Err(err) => println!("? {err}"),
            },
            Input::Event(None) => break,
            Input::Event(Some(event)) => {
                let update = session.handle(event);
                report(&update, &session, &mut map, &mut surface)?;
            }
        }
    }
    Ok(())
}

fn report<S: ListingStore>(
    update: &SessionUpdate,
    session: &SearchSession<S>,
    map: &mut MapSession,
    surface: &mut ConsoleSurface,
) -> Result<()> {
    match update {
        SessionUpdate::Applied { request, mode } => {
            debug!(request, ?mode, "rendering results");
            if session.is_empty_result() {
                println!("no results");
            } else {
                println!(
                    "{}{} of {} listings ({} filters active{})",
                    if *mode == FetchMode::Append { "more: " } else { "" },
                    session.listings().len(),
                    session.total(),
                    session.active_filter_count(),
                    if session.has_more() { ", `more` for next page" } else { "" }
                );
            }
            map.show_results(session.listings(), surface)?;
        }
        SessionUpdate::Failed { request, message } => {
            warn!(request, error = %message, "search failed");
            println!("! {message} (`retry` to try again)");
        }
        SessionUpdate::SearchIssued(request) => debug!(request, "debounced search issued"),
        SessionUpdate::Discarded { request } => debug!(request, "superseded response dropped"),
        SessionUpdate::Ignored => {}
    }
    Ok(())
}

async fn execute<S: ListingStore>(
    command: Command,
    session: &mut SearchSession<S>,
    map: &mut MapSession,
    surface: &mut ConsoleSurface,
    collaborators: &Collaborators,
    config: &EngineConfig,
) -> Result<()> {
    match command {
        Command::Type(text) => session.set_keyword(text),
        Command::Search => {
            session.submit();
        }
        Command::Category(category) => {
            session.toggle_category(category);
        }
        Command::Sort(sort_by) => {
            session.set_sort(sort_by);
        }
        Command::Price(range) => {
            session.set_price_range(range);
        }
        Command::Rating(min) => {
            session.set_rating_min(min);
        }
        Command::Dates(range) => {
            session.set_date_range(range);
        }
        Command::ClearCategories => {
            session.set_categories(BTreeSet::new());
        }
        Command::Near(location) => {
            if let Some(location) = &location {
                map.recenter(location.center(), surface)?;
            }
            session.set_location(location);
        }
        Command::Here(radius_km) => {
            let here =
                locate_with_timeout(&collaborators.geolocator, config.geolocation_timeout()).await?;
            map.recenter(here, surface)?;
            session.set_location(Some(LocationFilter { lat: here.lat, lng: here.lng, radius_km }));
        }
        Command::Address { radius_km, text } => {
            let geocoder = collaborators
                .geocoder
                .as_ref()
                .ok_or_else(|| EngineError::Config("no geocoder configured".into()))?;
            let timeout = config
                .geocoder
                .as_ref()
                .map_or(Duration::from_secs(5), |g| g.timeout());
            let location = resolve_location(geocoder, &text, radius_km, timeout).await?;
            map.recenter(location.center(), surface)?;
            session.set_location(Some(location));
        }
        Command::Available(on) => {
            session.set_available_only(on);
        }
        Command::Clear => {
            session.clear_filters();
        }
        Command::More => {
            if session.load_more().is_none() {
                println!("nothing more to load");
            }
        }
        Command::Retry => {
            if session.retry().is_none() {
                println!("nothing to retry");
            }
        }
        Command::Status => {
            println!(
                "{:?}: {} of {} listings, {} filters active",
                session.status(),
                session.listings().len(),
                session.total(),
                session.active_filter_count()
            );
            if let Some(error) = session.error() {
                println!("last error: {error}");
            }
        }
        Command::Zoom(zoom) => {
            let viewport = Viewport { zoom, ..map.viewport() };
            map.on_viewport_change(viewport, surface)?;
        }
        Command::Pan(center) => {
            let viewport = Viewport { center, ..map.viewport() };
            map.on_viewport_change(viewport, surface)?;
        }
        Command::Click(key) => match map.click(&key, surface)? {
            ClickOutcome::ShowListing(listing) => {
                println!("{} | {} | {} {}/{}", listing.id, listing.title, listing.price.amount, listing.price.currency, listing.price.unit);
            }
            ClickOutcome::ShowMembers(members) => {
                for listing in members {
                    println!("  {} | {}", listing.id, listing.title);
                }
            }
            ClickOutcome::ZoomIn { .. } => {}
            ClickOutcome::Stale => println!("that marker is gone"),
        },
        Command::Select(id) => {
            if !map.select_listing(&id, surface) {
                println!("{id} is not on the map");
            }
        }
        Command::List => {
            let center = session.params().location.map(|l| l.center());
            for entry in annotate_distances(session.listings(), center.as_ref()) {
                let distance = entry
                    .distance_km
                    .map(|d| format!("{d:.1} km"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<10} {:<32} {:>8} ★{:.1} {}",
                    entry.listing.id,
                    entry.listing.title,
                    entry.listing.price.amount,
                    entry.listing.rating.average,
                    distance
                );
            }
        }
        Command::Markers => {
            let reconciler = map.reconciler();
            if reconciler.is_empty() {
                println!("no markers");
            }
            for handle in reconciler.handles() {
                let mark = if reconciler.selected() == Some(&handle.key) { '*' } else { ' ' };
                println!(
                    "{mark} {} @{:.5},{:.5} [{}]",
                    handle.key,
                    handle.position.lat,
                    handle.position.lng,
                    describe(&handle.visual)
                );
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_commands() {
        assert_eq!(parse_command("type cat cafe").unwrap(), Command::Type("cat cafe".into()));
        assert_eq!(parse_command("cat event").unwrap(), Command::Category(Category::Event));
        assert_eq!(parse_command("sort price_low").unwrap(), Command::Sort(SortBy::PriceLow));
        assert_eq!(
            parse_command("price 100 2000").unwrap(),
            Command::Price(Some(PriceRange { min: 100.0, max: 2000.0 }))
        );
        assert_eq!(parse_command("price off").unwrap(), Command::Price(None));
        assert_eq!(parse_command("rating 4.5").unwrap(), Command::Rating(Some(4.5)));
        assert_eq!(
            parse_command("near 35.0 135.0 5").unwrap(),
            Command::Near(Some(LocationFilter { lat: 35.0, lng: 135.0, radius_km: 5.0 }))
        );
        assert_eq!(
            parse_command("address 3 Kyoto Station").unwrap(),
            Command::Address { radius_km: 3.0, text: "Kyoto Station".into() }
        );
        assert_eq!(parse_command("available on").unwrap(), Command::Available(true));
        assert_eq!(parse_command("cat off").unwrap(), Command::ClearCategories);
        assert_eq!(
            parse_command("dates 2026-11-01 2026-11-30").unwrap(),
            Command::Dates(Some(DateRange {
                start: chrono::NaiveDate::from_ymd_opt(2026, 11, 1).unwrap(),
                end: chrono::NaiveDate::from_ymd_opt(2026, 11, 30).unwrap(),
            }))
        );
        assert_eq!(parse_command("dates off").unwrap(), Command::Dates(None));
        assert_eq!(parse_command("status").unwrap(), Command::Status);
    }

    #[test]
    fn parses_map_commands() {
        assert_eq!(parse_command("zoom 12").unwrap(), Command::Zoom(12));
        assert_eq!(
            parse_command("pan 34.7 135.5").unwrap(),
            Command::Pan(Coordinates { lat: 34.7, lng: 135.5 })
        );
        assert_eq!(
            parse_command("click listing:42").unwrap(),
            Command::Click(MarkerKey::Listing("42".into()))
        );
        assert_eq!(parse_command("select 42").unwrap(), Command::Select("42".into()));
        assert_eq!(parse_command("markers").unwrap(), Command::Markers);
        assert_eq!(parse_command("  quit ").unwrap(), Command::Quit);
    }

    #[test]
    fn rejects_malformed_commands() {
        for line in [
            "zoom high",
            "near 35 135",
            "price 10",
            "cat cooking",
            "address 3",
            "dance",
            "select",
            "available maybe",
            "dates 2026-11-01",
            "dates soon later",
        ] {
            assert!(parse_command(line).is_err(), "{line}");
        }
    }

    #[test]
    fn describes_marker_visuals() {
        let visual = MarkerVisual {
            icon: MarkerIcon::Cluster { count: 3, rating_tenths: 42 },
            selected: true,
        };
        assert_eq!(describe(&visual), "3 listings, ★4.2, selected");
    }
}
