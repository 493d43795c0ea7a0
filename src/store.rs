//! Backend listing-store: the trait the search session talks to, an in-memory
//! catalog loaded from JSON, and an HTTP client for a remote backend.

use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};
use url::Url;

use crate::error::{EngineError, Result};
use crate::filter;
use crate::listing::{Listing, ResultPage, SearchParams};

/// Anything that can answer a search with one page of listings.
pub trait ListingStore: Send + Sync + 'static {
    fn search(&self, params: &SearchParams) -> impl Future<Output = Result<ResultPage>> + Send;
}

/// Catalog held in memory. Runs the full filter/sort pipeline per query.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    listings: Vec<Listing>,
}

impl InMemoryStore {
    pub fn new(listings: Vec<Listing>) -> Self {
        Self { listings }
    }

    pub fn listings(&self) -> &[Listing] {
        &self.listings
    }

    /// Run the pipeline and cut the requested page.
    pub fn query(&self, params: &SearchParams) -> Result<ResultPage> {
        let ordered = filter::apply(&self.listings, params)?;
        Ok(filter::paginate(ordered, params.page, params.page_size))
    }

    /// Load a catalog: a JSON array of listings.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let listings: Vec<Listing> = serde_json::from_str(&json)?;
        debug!(count = listings.len(), path = %path.display(), "catalog loaded");
        Ok(Self::new(listings))
    }

    /// Save the catalog as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.listings)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl ListingStore for InMemoryStore {
    fn search(&self, params: &SearchParams) -> impl Future<Output = Result<ResultPage>> + Send {
        let page = self.query(params);
        async move { page }
    }
}

/// Remote backend exposing `POST {base}/search` with a `SearchParams` body.
#[derive(Debug, Clone)]
pub struct HttpListingStore {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpListingStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| EngineError::Config(format!("backend url {base_url}: {e}")))?;
        let endpoint = base
            .join("search")
            .map_err(|e| EngineError::Config(format!("backend url {base_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl ListingStore for HttpListingStore {
    fn search(&self, params: &SearchParams) -> impl Future<Output = Result<ResultPage>> + Send {
        let request = self.client.post(self.endpoint.clone()).json(params);
        async move {
            let response = request
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| EngineError::SearchFailed(e.to_string()))?;
            response
                .json::<ResultPage>()
                .await
                .map_err(|e| EngineError::SearchFailed(format!("bad response body: {e}")))
        }
    }
}

/// Page through `store` with default parameters until it reports no more
/// results. Listings repeated across pages are kept once.
pub async fn fetch_all<S: ListingStore>(store: &S, page_size: usize) -> Result<Vec<Listing>> {
    let mut params = SearchParams { page_size, ..SearchParams::default() };
    let mut seen = HashSet::new();
    let mut listings = Vec::new();
    loop {
        let page = store.search(&params).await?;
        let received = page.listings.len();
        listings.extend(page.listings.into_iter().filter(|l| seen.insert(l.id.clone())));
        info!(page = params.page, received, total = page.total, "page fetched");
        if !page.has_more || received == 0 {
            break;
        }
        params.page += 1;
    }
    Ok(listings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::fixtures::listing;

    #[tokio::test]
    async fn in_memory_store_pages_through_the_catalog() {
        let store = InMemoryStore::new(
            (0..25).map(|i| listing(&format!("l{i}"), 35.0, 135.0)).collect(),
        );
        let params = SearchParams { page_size: 10, ..SearchParams::default() };
        let page = store.search(&params).await.unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.listings.len(), 10);
        assert!(page.has_more);

        let params = SearchParams { page: 3, ..params };
        let page = store.search(&params).await.unwrap();
        assert_eq!(page.listings.len(), 5);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn invalid_params_are_rejected() {
        let store = InMemoryStore::default();
        let params = SearchParams { page_size: 0, ..SearchParams::default() };
        assert!(matches!(store.search(&params).await, Err(EngineError::InvalidParams(_))));
    }

    #[test]
    fn catalog_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let store = InMemoryStore::new(vec![listing("1", 35.0, 135.0), listing("2", 36.0, 136.0)]);
        store.save(&path).unwrap();
        let loaded = InMemoryStore::load(&path).unwrap();
        assert_eq!(loaded.listings(), store.listings());
    }

    #[tokio::test]
    async fn fetch_all_walks_every_page() {
        let store = InMemoryStore::new(
            (0..23).map(|i| listing(&format!("l{i}"), 35.0, 135.0)).collect(),
        );
        let all = fetch_all(&store, 10).await.unwrap();
        assert_eq!(all.len(), 23);
        assert_eq!(all[22].id, "l22");
        assert!(fetch_all(&InMemoryStore::default(), 10).await.unwrap().is_empty());
    }

    #[test]
    fn demo_catalog_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/catalog.json");
        let store = InMemoryStore::load(&path).unwrap();
        assert_eq!(store.listings().len(), 10);
        assert_eq!(store.listings().iter().filter(|l| l.coordinates.is_none()).count(), 1);
    }

    #[test]
    fn missing_catalog_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = InMemoryStore::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn http_store_targets_the_search_endpoint() {
        let store = HttpListingStore::new("http://backend.local/api/", Duration::from_secs(2)).unwrap();
        assert_eq!(store.endpoint().as_str(), "http://backend.local/api/search");
        assert!(HttpListingStore::new("not a url", Duration::from_secs(2)).is_err());
    }
}
