//! Search session: owns the search parameters, debounces keyword input,
//! issues fetches against a [`ListingStore`] and merges result pages.
//!
//! Every fetch runs on its own tokio task and reports back through the
//! session's event channel. A completion is applied only if it belongs to the
//! most recently issued request and was built from the current parameters;
//! anything else is discarded on arrival, whatever order the network
//! delivered it in.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::listing::{
    Category, DateRange, Listing, LocationFilter, PriceRange, ResultPage, SearchParams, SortBy,
};
use crate::store::ListingStore;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Monotonically increasing identity of an issued request.
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    Idle,
    Debouncing,
    Searching,
    Success,
    Error,
}

/// Whether a completed page replaces the result list or extends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Replace,
    Append,
}

/// Messages delivered to the session by its timer and fetch tasks.
#[derive(Debug)]
pub enum SessionEvent {
    DebounceElapsed {
        generation: u64,
    },
    Completed {
        request: RequestId,
        mode: FetchMode,
        params: SearchParams,
        result: Result<ResultPage>,
    },
}

/// Outcome of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The debounce window closed and a search went out.
    SearchIssued(RequestId),
    /// A page was merged into the result list.
    Applied { request: RequestId, mode: FetchMode },
    /// The latest request failed; previous results are kept.
    Failed { request: RequestId, message: String },
    /// A completion arrived for a superseded request.
    Discarded { request: RequestId },
    /// A cancelled timer fired late.
    Ignored,
}

/// Cancellable delayed trigger. Only the most recent schedule may fire.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, generation: 0, pending: None }
    }

    /// Restart the quiet period. Any earlier timer is aborted.
    pub fn schedule(&mut self, events: &mpsc::UnboundedSender<SessionEvent>) -> u64 {
        self.cancel();
        let generation = self.generation;
        let delay = self.delay;
        let events = events.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::DebounceElapsed { generation });
        }));
        generation
    }

    pub fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    /// Consume a timer event. False if it was superseded or cancelled.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.pending.is_some() && generation == self.generation {
            self.pending = None;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug)]
struct InFlight {
    id: RequestId,
    mode: FetchMode,
    handle: JoinHandle<()>,
}

/// Single owner of search state. All mutation goes through its methods.
pub struct SearchSession<S> {
    store: Arc<S>,
    params: SearchParams,
    status: SearchStatus,
    listings: Vec<Listing>,
    total: usize,
    has_more: bool,
    loaded_page: usize,
    /// Query that produced `listings`; pages are only appended under it.
    loaded_params: Option<SearchParams>,
    error: Option<String>,
    last_issued: RequestId,
    in_flight: Option<InFlight>,
    failed_mode: Option<FetchMode>,
    debouncer: Debouncer,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl<S: ListingStore> SearchSession<S> {
    pub fn new(store: Arc<S>, debounce: Duration, page_size: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store,
            params: SearchParams { page_size, ..SearchParams::default() },
            status: SearchStatus::Idle,
            listings: Vec::new(),
            total: 0,
            has_more: false,
            loaded_page: 0,
            loaded_params: None,
            error: None,
            last_issued: 0,
            in_flight: None,
            failed_mode: None,
            debouncer: Debouncer::new(debounce),
            events_tx,
            events_rx,
        }
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn status(&self) -> SearchStatus {
        self.status
    }

    /// Accumulated listings across every loaded page.
    pub fn listings(&self) -> &[Listing] {
        &self.listings
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// A successful search that matched nothing.
    pub fn is_empty_result(&self) -> bool {
        self.status == SearchStatus::Success && self.listings.is_empty()
    }

    pub fn active_filter_count(&self) -> usize {
        self.params.active_filter_count()
    }

    /// True while a timer or fetch is outstanding.
    pub fn is_busy(&self) -> bool {
        self.debouncer.is_pending() || self.in_flight.is_some()
    }

    /// Record a keystroke. The search runs once input has been quiet for the
    /// debounce period; earlier keystrokes never produce a request.
    pub fn set_keyword(&mut self, keyword: impl Into<String>) {
        let keyword = keyword.into();
        if keyword == self.params.keyword && !self.debouncer.is_pending() {
            return;
        }
        self.params.keyword = keyword;
        self.params.page = 1;
        // Outstanding pages were built from the old keyword.
        self.abandon_in_flight();
        self.debouncer.schedule(&self.events_tx);
        self.status = SearchStatus::Debouncing;
        debug!(keyword = %self.params.keyword, "keyword changed, debouncing");
    }

    /// Search now with the current parameters, skipping any pending debounce.
    pub fn submit(&mut self) -> RequestId {
        self.debouncer.cancel();
        self.params.page = 1;
        self.issue(FetchMode::Replace)
    }

    pub fn set_categories(&mut self, categories: BTreeSet<Category>) -> Option<RequestId> {
        self.update(|p| p.categories = categories)
    }

    pub fn toggle_category(&mut self, category: Category) -> Option<RequestId> {
        self.update(|p| {
            if !p.categories.remove(&category) {
                p.categories.insert(category);
            }
        })
    }

    pub fn set_price_range(&mut self, range: Option<PriceRange>) -> Option<RequestId> {
        self.update(|p| p.price_range = range)
    }

    pub fn set_date_range(&mut self, range: Option<DateRange>) -> Option<RequestId> {
        self.update(|p| p.date_range = range)
    }

    pub fn set_rating_min(&mut self, rating_min: Option<f64>) -> Option<RequestId> {
        self.update(|p| p.rating_min = rating_min)
    }

    pub fn set_location(&mut self, location: Option<LocationFilter>) -> Option<RequestId> {
        self.update(|p| p.location = location)
    }

    pub fn set_available_only(&mut self, available_only: bool) -> Option<RequestId> {
        self.update(|p| p.available_only = available_only)
    }

    pub fn set_sort(&mut self, sort_by: SortBy) -> Option<RequestId> {
        self.update(|p| p.sort_by = sort_by)
    }

    /// Reset every filter except the keyword and search immediately.
    pub fn clear_filters(&mut self) -> RequestId {
        self.params = SearchParams {
            keyword: std::mem::take(&mut self.params.keyword),
            page_size: self.params.page_size,
            ..SearchParams::default()
        };
        self.submit()
    }

    /// Fetch the next page under the current parameters and append it.
    ///
    /// Returns `None` when there is nothing more to load, another request
    /// (or a pending keystroke) is outstanding, or the shown listings came
    /// from a different query than the current one.
    pub fn load_more(&mut self) -> Option<RequestId> {
        let same_query = self
            .loaded_params
            .as_ref()
            .is_some_and(|loaded| loaded.same_query(&self.params));
        if !self.has_more || !same_query || self.is_busy() {
            debug!(has_more = self.has_more, same_query, busy = self.is_busy(), "load more ignored");
            return None;
        }
        self.params.page = self.loaded_page + 1;
        Some(self.issue(FetchMode::Append))
    }

    /// Re-issue the request that last failed.
    pub fn retry(&mut self) -> Option<RequestId> {
        if self.status != SearchStatus::Error || self.is_busy() {
            return None;
        }
        let mode = self.failed_mode.unwrap_or(FetchMode::Replace);
        self.params.page = match mode {
            FetchMode::Replace => 1,
            FetchMode::Append => self.loaded_page + 1,
        };
        Some(self.issue(mode))
    }

    /// Wait for the next timer or fetch event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    /// Process events until no timer or fetch is outstanding.
    #[cfg(test)]
    pub async fn settle(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while self.is_busy() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            updates.push(self.handle(event));
        }
        updates
    }

    /// Apply one event to the session state.
    pub fn handle(&mut self, event: SessionEvent) -> SessionUpdate {
        match event {
            SessionEvent::DebounceElapsed { generation } => {
                if self.debouncer.fire(generation) {
                    SessionUpdate::SearchIssued(self.issue(FetchMode::Replace))
                } else {
                    SessionUpdate::Ignored
                }
            }
            SessionEvent::Completed { request, mode, params, result } => {
                self.complete(request, mode, &params, result)
            }
        }
    }

    fn update(&mut self, change: impl FnOnce(&mut SearchParams)) -> Option<RequestId> {
        let before = self.params.clone();
        change(&mut self.params);
        if self.params.same_query(&before) && !self.debouncer.is_pending() {
            return None;
        }
        Some(self.submit())
    }

    fn issue(&mut self, mode: FetchMode) -> RequestId {
        self.abandon_in_flight();
        self.last_issued += 1;
        let id = self.last_issued;
        let params = self.params.clone();
        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        info!(
            request = id,
            ?mode,
            keyword = %params.keyword,
            page = params.page,
            filters = params.active_filter_count(),
            "search issued"
        );
        let handle = tokio::spawn(async move {
            let mut completion = Completion { events, request: id, mode, params: Some(params.clone()) };
            let result = store.search(&params).await;
            completion.send(result);
        });
        self.in_flight = Some(InFlight { id, mode, handle });
        self.status = SearchStatus::Searching;
        id
    }

    fn abandon_in_flight(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            debug!(request = in_flight.id, mode = ?in_flight.mode, "abandoning in-flight request");
            in_flight.handle.abort();
        }
    }

    fn complete(
        &mut self,
        request: RequestId,
        mode: FetchMode,
        params: &SearchParams,
        result: Result<ResultPage>,
    ) -> SessionUpdate {
        let current = self.in_flight.as_ref().map(|f| f.id);
        if current != Some(request) || !params.same_query(&self.params) {
            debug!(request, latest = self.last_issued, "stale response discarded");
            return SessionUpdate::Discarded { request };
        }
        self.in_flight = None;
        match result {
            Ok(page) => {
                self.merge(page, mode, params);
                self.error = None;
                self.failed_mode = None;
                self.status = SearchStatus::Success;
                info!(request, total = self.total, shown = self.listings.len(), "search applied");
                SessionUpdate::Applied { request, mode }
            }
            Err(err) => {
                let message = err.to_string();
                warn!(request, error = %message, "search failed, keeping previous results");
                self.error = Some(message.clone());
                self.failed_mode = Some(mode);
                self.status = SearchStatus::Error;
                if mode == FetchMode::Append {
                    self.params.page = self.loaded_page.max(1);
                }
                SessionUpdate::Failed { request, message }
            }
        }
    }

    fn merge(&mut self, page: ResultPage, mode: FetchMode, params: &SearchParams) {
        match mode {
            FetchMode::Replace => self.listings = page.listings,
            FetchMode::Append => {
                let mut seen: HashSet<String> = self.listings.iter().map(|l| l.id.clone()).collect();
                let before = self.listings.len();
                self.listings
                    .extend(page.listings.into_iter().filter(|l| seen.insert(l.id.clone())));
                debug!(appended = self.listings.len() - before, "page appended");
            }
        }
        self.total = page.total;
        self.has_more = page.has_more;
        self.loaded_page = page.page;
        self.loaded_params = Some(params.clone());
    }
}

/// Reports a fetch task's outcome. If the task ends without a result
/// (panic or abort) the drop sends a failure instead.
struct Completion {
    events: mpsc::UnboundedSender<SessionEvent>,
    request: RequestId,
    mode: FetchMode,
    params: Option<SearchParams>,
}

impl Completion {
    fn send(&mut self, result: Result<ResultPage>) {
        if let Some(params) = self.params.take() {
            let _ = self.events.send(SessionEvent::Completed {
                request: self.request,
                mode: self.mode,
                params,
                result,
            });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.send(Err(EngineError::SearchFailed("search ended without a result".into())));
    }
}

impl<S> Drop for SearchSession<S> {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.abort();
        }
    }
}
