//! Per-key cache entry state machine.

use crate::fetch::{FetchError, FetchParams, FetcherFn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fetch lifecycle of one cached key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Entry exists but nothing has been fetched or written yet.
  Idle,
  /// First fetch in flight, no data to show.
  Loading,
  /// Last completed fetch (or write) succeeded.
  Success,
  /// Last completed fetch failed. Prior data, if any, is retained.
  Error,
}

/// Internal per-key state. Consumers only ever see [`EntrySnapshot`].
pub(crate) struct CacheEntry<T> {
  pub status: QueryStatus,
  pub data: Option<Arc<T>>,
  pub error: Option<FetchError>,
  pub updated_at: Option<Instant>,
  /// Bumped when a completed fetch is applied, and at dispatch of a forced
  /// re-fetch. A dispatch captures the current value; a completion whose
  /// captured value no longer matches is discarded.
  pub version: u64,
  pub in_flight: bool,
  /// Explicit stale mark from invalidation, independent of age.
  pub stale: bool,
  /// Last fetcher seen for this key, retained so invalidation can
  /// re-fetch without a consumer read.
  pub fetcher: Option<FetcherFn<T>>,
  /// Last fetch params seen for this key, retained for the same reason.
  pub params: Option<FetchParams>,
}

impl<T> CacheEntry<T> {
  pub fn empty() -> Self {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      updated_at: None,
      version: 0,
      in_flight: false,
      stale: false,
      fetcher: None,
      params: None,
    }
  }

  /// Stale when explicitly invalidated, never completed, or older than
  /// `stale_after`.
  pub fn is_stale(&self, stale_after: Duration) -> bool {
    if self.stale {
      return true;
    }
    match self.updated_at {
      Some(at) => at.elapsed() > stale_after,
      None => true,
    }
  }

  pub fn snapshot(&self) -> EntrySnapshot<T> {
    EntrySnapshot {
      status: self.status,
      data: self.data.clone(),
      error: self.error.clone(),
      is_fetching: self.in_flight,
      updated_at: self.updated_at,
    }
  }
}

/// Consumer-visible projection of a cache entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot<T> {
  pub status: QueryStatus,
  /// Best currently-available data: fresh, stale, or `None` before the
  /// first completion.
  pub data: Option<Arc<T>>,
  /// Error from the last failed fetch, if the entry is in error state.
  pub error: Option<FetchError>,
  /// True while a fetch for this key is in flight.
  pub is_fetching: bool,
  pub updated_at: Option<Instant>,
}

impl<T> EntrySnapshot<T> {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_deref()
  }
}
