//! Incremental accumulation of sequentially fetched pages.
//!
//! An [`InfiniteCache`] keeps, per query key, the ordered list of pages
//! fetched so far and the flattened item sequence derived from them, for
//! infinite / "load more" consumption. Pages land in request order:
//! `fetch_next` calls for one key are serialized behind a per-key lock,
//! so a fast response to a later request can never overtake an earlier
//! one.
//!
//! The accumulator does not deduplicate items by identity across pages;
//! a well-behaved server does not repeat items between pages, and a
//! misbehaving one will be visible rather than silently corrected.
//!
//! Each distinct key owns its own accumulation. When the non-paging part
//! of a query's identity changes (a new search term, say), that is a new
//! key; reusing a key for new identity requires an explicit [`reset`].
//!
//! [`reset`]: InfiniteCache::reset

use crate::cache::CacheConfig;
use crate::events::{ChangeEmitter, ChangeEvent, ChangeKind};
use crate::fetch::{FetchError, FetchParams, HasMorePolicy, PageCursor, PageFetcherFn};
use crate::invalidate::PrefixInvalidate;
use crate::key::QueryKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Mutex as FetchLock;
use tracing::{debug, info, warn};

/// Options for one incremental collection.
#[derive(Debug, Clone, Default)]
pub struct FetchNextOptions {
  /// Overrides the cache-wide default page size.
  pub page_size: Option<u32>,
  /// Server-side filter expression passed through to the fetcher.
  pub filter: Option<String>,
  /// Server-side sort expression passed through to the fetcher.
  pub sort: Option<String>,
  /// How "more pages exist" is read off each fetched page.
  pub has_more: HasMorePolicy,
}

/// One fetched page as accumulated, in fetch order.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatedPage<T> {
  /// Items of this page, in server order.
  pub items: Vec<T>,
  /// Cursor this page was fetched at.
  pub cursor: PageCursor,
  /// Whether more pages existed after this one, per the descriptor's
  /// [`HasMorePolicy`].
  pub has_more: bool,
}

/// Consumer-visible projection of one accumulated collection.
#[derive(Debug, Clone)]
pub struct AccumulatedSnapshot<T> {
  /// Concatenation of all accumulated pages' items, in fetch order.
  pub flat_items: Vec<T>,
  /// Whether another `fetch_next` is expected to yield more items.
  pub has_more: bool,
  /// Number of pages accumulated so far.
  pub pages: usize,
  /// Where the next fetch will start.
  pub next_cursor: Option<PageCursor>,
  /// Error from the last failed `fetch_next`, if any.
  pub error: Option<FetchError>,
  /// True while a `fetch_next` for this key is running.
  pub is_fetching: bool,
  /// True when the collection was invalidated and the items are servable
  /// but suspect. The next `fetch_next` restarts from page 1.
  pub is_stale: bool,
}

/// Per-key accumulated state.
struct Accumulated<T> {
  pages: Vec<AccumulatedPage<T>>,
  flat_items: Vec<T>,
  has_more: bool,
  next_cursor: Option<PageCursor>,
  error: Option<FetchError>,
  fetching: bool,
  /// Set by invalidation. Stale pages stay servable; the next
  /// `fetch_next` discards them and restarts from page 1.
  stale: bool,
  updated_at: Option<Instant>,
  /// Bumped on every reset. A fetch that started before a reset must not
  /// append into the collection that replaced it.
  epoch: u64,
  /// Last descriptor seen for this key, retained so invalidation can
  /// re-fetch the first page without a consumer call.
  fetcher: Option<PageFetcherFn<T>>,
  opts: FetchNextOptions,
}

impl<T> Accumulated<T> {
  fn empty() -> Self {
    Self {
      pages: Vec::new(),
      flat_items: Vec::new(),
      // Optimistic before the first fetch: assume the collection has
      // something to load.
      has_more: true,
      next_cursor: None,
      error: None,
      fetching: false,
      stale: false,
      updated_at: None,
      epoch: 0,
      fetcher: None,
      opts: FetchNextOptions::default(),
    }
  }

  /// Clear accumulated pages while keeping epoch history and descriptor.
  fn clear(&mut self) {
    self.epoch += 1;
    self.pages.clear();
    self.flat_items.clear();
    self.has_more = true;
    self.next_cursor = None;
    self.error = None;
    self.stale = false;
    self.updated_at = None;
  }

  /// Cursor the next fetch should use: the recorded continuation, page 1
  /// for an empty collection, or the next page number as a fallback.
  fn cursor_for_next(&self) -> PageCursor {
    match &self.next_cursor {
      Some(cursor) => cursor.clone(),
      None if self.pages.is_empty() => PageCursor::Page(1),
      None => PageCursor::Page(self.pages.len() as u64 + 1),
    }
  }
}

impl<T: Clone> Accumulated<T> {
  fn snapshot(&self) -> AccumulatedSnapshot<T> {
    AccumulatedSnapshot {
      flat_items: self.flat_items.clone(),
      has_more: self.has_more,
      pages: self.pages.len(),
      next_cursor: self.next_cursor.clone(),
      error: self.error.clone(),
      is_fetching: self.fetching,
      is_stale: self.stale,
    }
  }
}

/// Keyed store of incrementally accumulated collections.
///
/// Like [`crate::cache::QueryCache`], it is explicitly constructed,
/// cheaply cloneable (clones share state), and reports changes through a
/// [`ChangeEmitter`].
pub struct InfiniteCache<T> {
  states: Arc<Mutex<HashMap<QueryKey, Accumulated<T>>>>,
  /// Per-key serialization point for `fetch_next`.
  locks: Arc<Mutex<HashMap<QueryKey, Arc<FetchLock<()>>>>>,
  emitter: ChangeEmitter,
  config: CacheConfig,
}

impl<T> Clone for InfiniteCache<T> {
  fn clone(&self) -> Self {
    Self {
      states: Arc::clone(&self.states),
      locks: Arc::clone(&self.locks),
      emitter: self.emitter.clone(),
      config: self.config.clone(),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> InfiniteCache<T> {
  pub fn new(config: CacheConfig) -> Self {
    Self::with_emitter(config, ChangeEmitter::new())
  }

  /// Create a store sharing an existing notification surface.
  pub fn with_emitter(config: CacheConfig, emitter: ChangeEmitter) -> Self {
    Self {
      states: Arc::new(Mutex::new(HashMap::new())),
      locks: Arc::new(Mutex::new(HashMap::new())),
      emitter,
      config,
    }
  }

  pub fn emitter(&self) -> &ChangeEmitter {
    &self.emitter
  }

  /// Fetch the next page for `key` and append it.
  ///
  /// Calls for the same key are serialized: a second `fetch_next` issued
  /// while one is pending waits for it and then fetches the page after
  /// it, so pages append in request order regardless of network latency.
  /// Distinct keys fetch concurrently with no ordering between them.
  ///
  /// On failure the accumulated pages and `has_more` are left exactly as
  /// they were, so the caller can retry.
  pub async fn fetch_next(
    &self,
    key: &QueryKey,
    fetcher: PageFetcherFn<T>,
    opts: FetchNextOptions,
  ) -> Result<AccumulatedPage<T>, FetchError> {
    if key.is_empty() {
      return Err(FetchError::invalid("query key must have at least one segment"));
    }

    let fetch_lock = self.fetch_lock(key);
    let _serialized = fetch_lock.lock().await;

    let page_size = opts.page_size.unwrap_or(self.config.default_page_size);
    let (params, epoch, pages_fetched) = {
      let mut states = self.lock_states();
      let state = states.entry(key.clone()).or_insert_with(Accumulated::empty);
      if state.stale {
        // Deferred invalidation: drop the stale pages and start over.
        debug!(key = %key, "discarding stale collection before fetch");
        state.clear();
      }
      state.fetching = true;
      state.fetcher = Some(fetcher.clone());
      state.opts = opts.clone();
      let cursor = state.cursor_for_next();
      let mut params = FetchParams::at(cursor, page_size);
      params.filter = opts.filter.clone();
      params.sort = opts.sort.clone();
      (params, state.epoch, state.pages.len() as u64)
    };
    let cursor = params.cursor.clone().unwrap_or(PageCursor::Page(1));
    debug!(key = %key, cursor = %cursor, "fetching next page");

    let result = fetcher(params).await;

    let outcome = {
      let mut states = self.lock_states();
      let state = states.entry(key.clone()).or_insert_with(Accumulated::empty);
      state.fetching = false;
      if state.epoch != epoch {
        debug!(key = %key, "discarding page fetched before reset");
        return Err(
          FetchError::new("collection was reset while the fetch was in flight")
            .with_code("superseded"),
        );
      }
      match result {
        Ok(page) => {
          let (has_more, next_cursor) =
            opts.has_more.resolve(&page, pages_fetched + 1, page_size);
          state.flat_items.extend(page.items.iter().cloned());
          let appended = AccumulatedPage {
            items: page.items,
            cursor,
            has_more,
          };
          state.pages.push(appended.clone());
          state.has_more = has_more;
          state.next_cursor = next_cursor;
          state.error = None;
          state.updated_at = Some(Instant::now());
          debug!(
            key = %key,
            pages = state.pages.len(),
            items = state.flat_items.len(),
            has_more,
            "appended page"
          );
          Ok(appended)
        }
        Err(err) => {
          // Accumulated pages and has_more stay as they were; a retry
          // picks up at the same cursor.
          debug!(key = %key, error = %err, "fetch_next failed");
          state.error = Some(err.clone());
          Err(err)
        }
      }
    };

    self.emitter.emit(ChangeEvent {
      key: key.clone(),
      kind: if outcome.is_ok() {
        ChangeKind::Updated
      } else {
        ChangeKind::Errored
      },
    });
    outcome
  }

  /// Drop all accumulated pages for `key`. The next `fetch_next` starts
  /// from page 1 and reproduces what a fresh accumulator would produce.
  /// A fetch in flight at reset time is discarded when it completes.
  pub fn reset(&self, key: &QueryKey) {
    let existed = {
      let mut states = self.lock_states();
      match states.get_mut(key) {
        Some(state) => {
          state.clear();
          true
        }
        None => false,
      }
    };
    if existed {
      debug!(key = %key, "reset accumulated collection");
      self.emitter.emit(ChangeEvent {
        key: key.clone(),
        kind: ChangeKind::Invalidated,
      });
    }
  }

  /// Current snapshot for `key`; an empty, never-fetched snapshot when
  /// the key is unknown.
  pub fn snapshot(&self, key: &QueryKey) -> AccumulatedSnapshot<T> {
    self
      .lock_states()
      .get(key)
      .map(Accumulated::snapshot)
      .unwrap_or_else(|| Accumulated::<T>::empty().snapshot())
  }

  /// Sweep unwatched collections past `gc_after`, mirroring the keyed
  /// cache's policy.
  pub fn gc(&self) -> usize {
    let mut removed = Vec::new();
    {
      let mut states = self.lock_states();
      states.retain(|key, state| {
        if state.fetching || self.emitter.is_watched(key) {
          return true;
        }
        let expired = state
          .updated_at
          .map(|at| at.elapsed() > self.config.gc_after)
          .unwrap_or(true);
        if expired {
          removed.push(key.clone());
        }
        !expired
      });
      let mut locks = self.lock_locks();
      locks.retain(|key, _| !removed.contains(key));
    }
    if !removed.is_empty() {
      info!(count = removed.len(), "gc sweep removed collections");
    }
    let count = removed.len();
    for key in removed {
      self.emitter.emit(ChangeEvent {
        key,
        kind: ChangeKind::Removed,
      });
    }
    count
  }

  fn fetch_lock(&self, key: &QueryKey) -> Arc<FetchLock<()>> {
    let mut locks = self.lock_locks();
    locks
      .entry(key.clone())
      .or_insert_with(|| Arc::new(FetchLock::new(())))
      .clone()
  }

  fn lock_states(&self) -> MutexGuard<'_, HashMap<QueryKey, Accumulated<T>>> {
    match self.states.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn lock_locks(&self) -> MutexGuard<'_, HashMap<QueryKey, Arc<FetchLock<()>>>> {
    match self.locks.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> PrefixInvalidate for InfiniteCache<T> {
  /// Invalidation marks every matching collection stale. Watched keys are
  /// reset and re-fetch their first page immediately; unwatched keys keep
  /// their pages servable and defer the reset to the next `fetch_next`.
  /// Paginated state is never patched in place; partial patching after a
  /// mutation invites index and cursor drift.
  fn invalidate_prefix(&self, prefix: &QueryKey) {
    let mut matched = Vec::new();
    let mut refetch = Vec::new();
    {
      let mut states = self.lock_states();
      for (key, state) in states.iter_mut() {
        if !key.starts_with(prefix) {
          continue;
        }
        matched.push(key.clone());
        let watched_fetcher = self
          .emitter
          .is_watched(key)
          .then(|| state.fetcher.clone())
          .flatten();
        match watched_fetcher {
          Some(fetcher) => {
            state.clear();
            refetch.push((key.clone(), fetcher, state.opts.clone()));
          }
          None => state.stale = true,
        }
      }
    }
    info!(
      prefix = %prefix,
      matched = matched.len(),
      refetched = refetch.len(),
      "invalidated accumulated collections"
    );
    for key in matched {
      self.emitter.emit(ChangeEvent {
        key,
        kind: ChangeKind::Invalidated,
      });
    }
    for (key, fetcher, opts) in refetch {
      let cache = self.clone();
      tokio::spawn(async move {
        if let Err(err) = cache.fetch_next(&key, fetcher, opts).await {
          warn!(key = %key, error = %err, "re-fetch after invalidation failed");
        }
      });
    }
  }
}
