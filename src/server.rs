//! HTTP API (axum): query and clustering endpoints over an in-memory catalog.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::cluster::{cluster, ClusterConfig, MarkerKind};
use crate::error::{EngineError, Result};
use crate::filter::annotate_distances;
use crate::listing::{
    Category, DateRange, Listing, LocationFilter, PriceRange, ResultPage, SearchParams, SortBy,
};
use crate::store::InMemoryStore;

pub struct AppState {
    pub store: InMemoryStore,
    pub clustering: ClusterConfig,
    pub page_size: usize,
}

/// Shared app state: catalog plus clustering settings.
pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/health", get(health))
        .route("/search", get(search_get).post(search_post))
        .route("/cluster", post(cluster_post))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            e if e.is_caller_error() => StatusCode::BAD_REQUEST,
            EngineError::GeocodeNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::SearchFailed(_) | EngineError::GeocodeFailed(_) => StatusCode::BAD_GATEWAY,
            EngineError::GeocodeTimeout(_) | EngineError::GeolocationTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Flat query string for GET /search.
#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    /// Comma-separated category names.
    pub category: Option<String>,
    pub sort: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub radius_km: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub rating_min: Option<f64>,
    /// `YYYY-MM-DD`; either end may be left open.
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub available_only: bool,
}

impl SearchQuery {
    pub fn into_params(self, default_page_size: usize) -> Result<SearchParams> {
        let categories = match self.category.as_deref() {
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse::<Category>)
                .collect::<Result<BTreeSet<Category>>>()?,
            None => BTreeSet::new(),
        };
        let location = match (self.lat, self.lng, self.radius_km) {
            (Some(lat), Some(lng), Some(radius_km)) => Some(LocationFilter { lat, lng, radius_km }),
            (None, None, None) => None,
            _ => {
                return Err(EngineError::InvalidParams(
                    "lat, lng and radius_km go together".into(),
                ))
            }
        };
        let price_range = match (self.min_price, self.max_price) {
            (None, None) => None,
            (min, max) => Some(PriceRange {
                min: min.unwrap_or(0.0),
                max: max.unwrap_or(f64::MAX),
            }),
        };
        let date_range = match (self.date_from, self.date_to) {
            (None, None) => None,
            (start, end) => Some(DateRange {
                start: start.unwrap_or(NaiveDate::MIN),
                end: end.unwrap_or(NaiveDate::MAX),
            }),
        };
        Ok(SearchParams {
            keyword: self.q,
            categories,
            price_range,
            date_range,
            rating_min: self.rating_min,
            location,
            available_only: self.available_only,
            sort_by: self.sort.as_deref().map(str::parse::<SortBy>).transpose()?.unwrap_or_default(),
            page: self.page.unwrap_or(1),
            page_size: self.page_size.unwrap_or(default_page_size),
        })
    }
}

/// Result page plus derived values the list view needs.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(flatten)]
    pub page: ResultPage,
    pub active_filter_count: usize,
    /// Distance from the search center, parallel to `listings`.
    pub distances_km: Vec<Option<f64>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub listings: Vec<Listing>,
    pub zoom: u8,
}

/// Query the catalog and annotate distances from the search center.
pub fn run_search(store: &InMemoryStore, params: &SearchParams) -> Result<SearchResponse> {
    let page = store.query(params)?;
    let center = params.location.map(|l| l.center());
    let distances_km = annotate_distances(&page.listings, center.as_ref())
        .into_iter()
        .map(|a| a.distance_km)
        .collect();
    Ok(SearchResponse { page, active_filter_count: params.active_filter_count(), distances_km })
}

/// GET /search?q=..&category=..&sort=..&lat=..&lng=..&radius_km=..
pub async fn search_get(
    State(state): State<SharedState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>> {
    let params = query.into_params(state.page_size)?;
    Ok(Json(run_search(&state.store, &params)?))
}

/// POST /search with a JSON `SearchParams` body.
pub async fn search_post(
    State(state): State<SharedState>,
    Json(params): Json<SearchParams>,
) -> Result<Json<SearchResponse>> {
    Ok(Json(run_search(&state.store, &params)?))
}

/// POST /cluster: `{listings, zoom}` to map entries.
pub async fn cluster_post(
    State(state): State<SharedState>,
    Json(request): Json<ClusterRequest>,
) -> Result<Json<Vec<MarkerKind>>> {
    Ok(Json(cluster(&request.listings, request.zoom, &state.clustering)?))
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub listings: usize,
}

pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_string(), listings: state.store.listings().len() })
}

/// GET / -> static HTML search form.
pub async fn index_page() -> Html<&'static str> {
    const HTML: &str = r#"
<!DOCTYPE html>
<html lang="ja">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Listing search</title>
  <style>
    body { font-family: system-ui, sans-serif; max-width: 640px; margin: 2rem auto; padding: 0 1rem; }
    input[type="search"] { width: 100%; padding: 0.5rem; font-size: 1rem; box-sizing: border-box; }
    #results div { padding: 0.5rem 0; border-bottom: 1px solid #eee; }
    .meta { font-size: 0.875rem; color: #666; }
    .none { color: #666; }
  </style>
</head>
<body>
  <h1>Listings</h1>
  <input type="search" id="q" placeholder="キーワード" autofocus>
  <select id="sort">
    <option value="relevance">関連度</option>
    <option value="rating">評価</option>
    <option value="price_low">価格の安い順</option>
    <option value="price_high">価格の高い順</option>
    <option value="newest">新着</option>
    <option value="popularity">人気</option>
  </select>
  <div id="results"></div>
  <script>
    const q = document.getElementById('q');
    const sort = document.getElementById('sort');
    const results = document.getElementById('results');
    let timer = null;
    let latest = 0;
    async function run() {
      const id = ++latest;
      const url = '/search?q=' + encodeURIComponent(q.value.trim()) + '&sort=' + sort.value;
      try {
        const r = await fetch(url);
        const body = await r.json();
        if (id !== latest) return;
        if (!r.ok) { results.innerHTML = '<p class="none">エラー: ' + body.error + '</p>'; return; }
        results.innerHTML = body.listings.length === 0
          ? '<p class="none">該当なし</p>'
          : body.listings.map(l =>
              '<div>' + l.title + '<div class="meta">' + l.category + ' / ' +
              l.price.amount + ' ' + l.price.currency + ' / ★' + l.rating.average.toFixed(1) +
              '</div></div>').join('');
      } catch (err) {
        if (id === latest) results.innerHTML = '<p class="none">エラー: ' + err + '</p>';
      }
    }
    q.addEventListener('input', () => { clearTimeout(timer); timer = setTimeout(run, 300); });
    sort.addEventListener('change', run);
    run();
  </script>
</body>
</html>
"#;
    Html(HTML)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::fixtures::listing;
    use crate::listing::Schedule;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt; // for oneshot

    fn app() -> Router {
        let mut near = listing("near", 35.0, 135.0);
        near.title = "Cat sitting".into();
        let mut far = listing("far", 43.0, 141.3);
        far.title = "Cat cafe".into();
        far.category = Category::Event;
        far.schedule = Some(Schedule {
            start: NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 12, 5).unwrap(),
        });
        let listings = vec![near, far, listing("other", 35.0001, 135.0001)];
        router(Arc::new(AppState {
            store: InMemoryStore::new(listings),
            clustering: ClusterConfig::default(),
            page_size: 10,
        }))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn get_search_filters_and_annotates_distance() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/search?q=cat&lat=35.0&lng=135.0&radius_km=50")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: SearchResponse = body_json(response).await;
        assert_eq!(body.page.total, 1);
        assert_eq!(body.page.listings[0].id, "near");
        assert_eq!(body.distances_km, [Some(0.0)]);
        assert_eq!(body.active_filter_count, 2);
    }

    #[tokio::test]
    async fn get_search_filters_by_date_window() {
        let total = |uri: &'static str| async move {
            let response = app()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            body_json::<SearchResponse>(response).await.page.total
        };
        assert_eq!(total("/search?date_from=2026-11-01&date_to=2026-11-30").await, 2);
        assert_eq!(total("/search?date_from=2026-12-04").await, 3);
        assert_eq!(total("/search?date_to=2026-11-30").await, 2);
    }

    #[tokio::test]
    async fn post_search_accepts_search_params() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/search")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"categories":["event"],"pageSize":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: SearchResponse = body_json(response).await;
        assert_eq!(body.page.listings.len(), 1);
        assert_eq!(body.page.listings[0].id, "far");
        assert!(!body.page.has_more);
    }

    #[tokio::test]
    async fn bad_query_is_a_400() {
        for uri in [
            "/search?category=cooking",
            "/search?lat=35.0",
            "/search?page=0",
            "/search?sort=cheapest",
            "/search?date_from=2026-12-10&date_to=2026-12-01",
        ] {
            let response = app()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            let body: ErrorBody = body_json(response).await;
            assert!(!body.error.is_empty());
        }
    }

    #[tokio::test]
    async fn cluster_endpoint_groups_by_zoom() {
        let listings = vec![listing("1", 35.0, 135.0), listing("2", 35.0001, 135.0001)];
        let request = |zoom: u8| {
            let body = serde_json::to_string(&ClusterRequest { listings: listings.clone(), zoom }).unwrap();
            Request::builder()
                .method("POST")
                .uri("/cluster")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        };
        let entries: Vec<MarkerKind> = body_json(app().oneshot(request(10)).await.unwrap()).await;
        assert_eq!(entries.len(), 1);
        assert!(matches!(&entries[0], MarkerKind::Cluster(c) if c.members.len() == 2));

        let entries: Vec<MarkerKind> = body_json(app().oneshot(request(16)).await.unwrap()).await;
        assert_eq!(entries.len(), 2);

        let response = app().oneshot(request(40)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_catalog_size() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.listings, 3);
    }
}
