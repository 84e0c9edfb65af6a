//! Keyed cache orchestration: read-through dispatch, request
//! de-duplication, staleness, invalidation, and garbage collection.

use super::entry::{CacheEntry, EntrySnapshot, QueryStatus};
use crate::events::{ChangeEmitter, ChangeEvent, ChangeKind};
use crate::fetch::{FetchError, FetchParams, FetcherFn};
use crate::invalidate::PrefixInvalidate;
use crate::key::QueryKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Cache policy knobs.
///
/// Deserializable so embedding applications can load it from their config
/// file alongside everything else.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Age after which a read schedules a background re-fetch.
  pub stale_after: Duration,
  /// Age past which an unwatched entry is eligible for a GC sweep.
  pub gc_after: Duration,
  /// Page size used when a read supplies no explicit fetch params.
  pub default_page_size: u32,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_after: Duration::from_secs(60),
      gc_after: Duration::from_secs(300),
      default_page_size: 25,
    }
  }
}

/// Per-read options.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
  /// Overrides the cache-wide `stale_after` for this key.
  pub stale_after: Option<Duration>,
  /// Fetch parameters passed through to the fetcher.
  pub params: Option<FetchParams>,
}

/// Keyed cache for one cached data type.
///
/// Explicitly constructed and passed by reference or clone (clones share
/// state); there is no ambient global store. Reads are synchronous
/// snapshots with fetch completion delivered through the shared
/// [`ChangeEmitter`].
pub struct QueryCache<T> {
  entries: Arc<Mutex<HashMap<QueryKey, CacheEntry<T>>>>,
  emitter: ChangeEmitter,
  config: CacheConfig,
}

impl<T> Clone for QueryCache<T> {
  fn clone(&self) -> Self {
    Self {
      entries: Arc::clone(&self.entries),
      emitter: self.emitter.clone(),
      config: self.config.clone(),
    }
  }
}

impl<T: Send + Sync + 'static> QueryCache<T> {
  pub fn new(config: CacheConfig) -> Self {
    Self::with_emitter(config, ChangeEmitter::new())
  }

  /// Create a cache sharing an existing notification surface, so several
  /// caches can be observed through one emitter.
  pub fn with_emitter(config: CacheConfig, emitter: ChangeEmitter) -> Self {
    Self {
      entries: Arc::new(Mutex::new(HashMap::new())),
      emitter,
      config,
    }
  }

  pub fn emitter(&self) -> &ChangeEmitter {
    &self.emitter
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// Synchronous read: returns the best currently-available snapshot and,
  /// when the entry is missing or stale and no fetch is in flight,
  /// schedules a background fetch as a side effect.
  ///
  /// A second read for the same key while a fetch is in flight attaches
  /// to that fetch instead of dispatching another one.
  pub fn read(
    &self,
    key: &QueryKey,
    fetcher: FetcherFn<T>,
    opts: ReadOptions,
  ) -> Result<EntrySnapshot<T>, FetchError> {
    if key.is_empty() {
      return Err(FetchError::invalid("query key must have at least one segment"));
    }

    let mut entries = self.lock();
    let entry = entries.entry(key.clone()).or_insert_with(|| {
      debug!(key = %key, "cache miss, creating entry");
      CacheEntry::empty()
    });
    // Retain the latest descriptor so invalidation can re-fetch later.
    entry.fetcher = Some(fetcher);
    if let Some(params) = opts.params {
      entry.params = Some(params);
    }

    let stale_after = opts.stale_after.unwrap_or(self.config.stale_after);
    if entry.in_flight {
      debug!(key = %key, "fetch in flight, attaching");
    } else if entry.data.is_none() || entry.is_stale(stale_after) {
      self.dispatch_locked(entry, key, false);
    } else {
      debug!(key = %key, "cache hit");
    }

    Ok(entry.snapshot())
  }

  /// Pull side of the store binding: current snapshot, no side effects.
  pub fn snapshot(&self, key: &QueryKey) -> Option<EntrySnapshot<T>> {
    self.lock().get(key).map(CacheEntry::snapshot)
  }

  /// Apply `updater` to the cached value without a network round trip,
  /// for optimistic updates. The caller reconciles with the eventual
  /// server response.
  pub fn write<F>(&self, key: &QueryKey, updater: F)
  where
    F: FnOnce(Option<&T>) -> T,
  {
    {
      let mut entries = self.lock();
      let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::empty);
      let next = updater(entry.data.as_deref());
      entry.data = Some(Arc::new(next));
      entry.status = QueryStatus::Success;
      entry.error = None;
      entry.stale = false;
      entry.updated_at = Some(std::time::Instant::now());
    }
    debug!(key = %key, "direct cache write");
    self.emitter.emit(ChangeEvent {
      key: key.clone(),
      kind: ChangeKind::Updated,
    });
  }

  /// Mark every entry whose key starts with `prefix` stale. Watched keys
  /// are re-fetched immediately; a forced re-fetch supersedes whatever is
  /// in flight via the version bump. Non-blocking.
  pub fn invalidate(&self, prefix: &QueryKey) {
    let mut marked = Vec::new();
    let mut refetched = 0usize;
    {
      let mut entries = self.lock();
      for (key, entry) in entries.iter_mut() {
        if !key.starts_with(prefix) {
          continue;
        }
        entry.stale = true;
        marked.push(key.clone());
        if self.emitter.is_watched(key) && entry.fetcher.is_some() {
          self.dispatch_locked(entry, key, true);
          refetched += 1;
        }
      }
    }
    info!(prefix = %prefix, marked = marked.len(), refetched, "invalidated cache entries");
    for key in marked {
      self.emitter.emit(ChangeEvent {
        key,
        kind: ChangeKind::Invalidated,
      });
    }
  }

  /// Sweep entries that no live subscription watches and that are past
  /// `gc_after`. Explicit policy: sweeps run when the embedder decides,
  /// never on an internal timer. Returns the number of entries removed.
  pub fn gc(&self) -> usize {
    let mut removed = Vec::new();
    {
      let mut entries = self.lock();
      entries.retain(|key, entry| {
        if entry.in_flight || self.emitter.is_watched(key) {
          return true;
        }
        let expired = entry
          .updated_at
          .map(|at| at.elapsed() > self.config.gc_after)
          .unwrap_or(true);
        if expired {
          removed.push(key.clone());
        }
        !expired
      });
    }
    if !removed.is_empty() {
      info!(count = removed.len(), "gc sweep removed entries");
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

  /// Number of live entries, mainly for tests and diagnostics.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Start a fetch for `entry` while the map lock is held. The fetcher
  /// closure only constructs the future here; it is polled on a spawned
  /// task after the lock is released.
  fn dispatch_locked(&self, entry: &mut CacheEntry<T>, key: &QueryKey, force: bool) {
    let Some(fetcher) = entry.fetcher.clone() else {
      return;
    };
    let params = entry
      .params
      .clone()
      .unwrap_or_else(|| FetchParams::first_page(self.config.default_page_size));
    if force {
      // Supersede any in-flight completion for this key.
      entry.version += 1;
    }
    let captured = entry.version;
    entry.in_flight = true;
    if entry.data.is_none() {
      entry.status = QueryStatus::Loading;
    }
    debug!(key = %key, version = captured, force, "dispatching fetch");

    let future = fetcher(params);
    let cache = self.clone();
    let key = key.clone();
    tokio::spawn(async move {
      let result = future.await;
      cache.complete(&key, captured, result);
    });
  }

  /// Apply a fetch completion, unless the entry moved on without it.
  fn complete(&self, key: &QueryKey, captured: u64, result: Result<T, FetchError>) {
    let kind;
    {
      let mut entries = self.lock();
      let Some(entry) = entries.get_mut(key) else {
        debug!(key = %key, "completion for evicted entry, discarding");
        return;
      };
      if entry.version != captured {
        debug!(
          key = %key,
          captured,
          current = entry.version,
          "discarding superseded fetch result"
        );
        return;
      }
      entry.in_flight = false;
      entry.version += 1;
      match result {
        Ok(data) => {
          entry.status = QueryStatus::Success;
          entry.data = Some(Arc::new(data));
          entry.error = None;
          entry.stale = false;
          entry.updated_at = Some(std::time::Instant::now());
          kind = ChangeKind::Updated;
        }
        Err(err) => {
          // Prior data is retained so consumers can show stale content
          // alongside the error.
          debug!(key = %key, error = %err, "fetch failed");
          entry.status = QueryStatus::Error;
          entry.error = Some(err);
          kind = ChangeKind::Errored;
        }
      }
    }
    self.emitter.emit(ChangeEvent {
      key: key.clone(),
      kind,
    });
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry<T>>> {
    // Entries are left consistent at every unlock, so recover from poison.
    match self.entries.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

impl<T: Send + Sync + 'static> PrefixInvalidate for QueryCache<T> {
  fn invalidate_prefix(&self, prefix: &QueryKey) {
    self.invalidate(prefix);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fetch::fetcher;
  use crate::query_key;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::time::sleep;

  /// Route `debug!`/`warn!` output to the test harness; enable it with
  /// `RUST_LOG=refetch=debug cargo test`.
  fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  }

  fn counted_fetcher(
    calls: Arc<AtomicUsize>,
    delay: Duration,
    value: &'static str,
  ) -> FetcherFn<String> {
    fetcher(move |_params| {
      let calls = calls.clone();
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        sleep(delay).await;
        Ok(value.to_string())
      }
    })
  }

  #[tokio::test]
  async fn test_read_miss_fetches_then_succeeds() {
    let cache: QueryCache<String> = QueryCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["feed"];

    let snap = cache
      .read(
        &key,
        counted_fetcher(calls.clone(), Duration::from_millis(5), "hello"),
        ReadOptions::default(),
      )
      .unwrap();
    assert!(snap.is_loading());
    assert!(snap.is_fetching);
    assert!(snap.data.is_none());

    sleep(Duration::from_millis(30)).await;
    let snap = cache.snapshot(&key).unwrap();
    assert!(snap.is_success());
    assert_eq!(snap.data().map(String::as_str), Some("hello"));
    assert!(!snap.is_fetching);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_concurrent_reads_dedupe_to_one_fetch() {
    init_test_logging();
    let cache: QueryCache<String> = QueryCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["feed"];
    let f = counted_fetcher(calls.clone(), Duration::from_millis(30), "hello");

    cache.read(&key, f.clone(), ReadOptions::default()).unwrap();
    let second = cache.read(&key, f, ReadOptions::default()).unwrap();
    assert!(second.is_fetching);

    sleep(Duration::from_millis(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.snapshot(&key).unwrap().is_success());
  }

  #[tokio::test]
  async fn test_fresh_hit_does_not_refetch() {
    let cache: QueryCache<String> = QueryCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["feed"];
    let f = counted_fetcher(calls.clone(), Duration::from_millis(1), "hello");

    cache.read(&key, f.clone(), ReadOptions::default()).unwrap();
    sleep(Duration::from_millis(20)).await;

    let snap = cache.read(&key, f, ReadOptions::default()).unwrap();
    assert!(snap.is_success());
    assert!(!snap.is_fetching);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_read_serves_old_data_while_refetching() {
    let cache: QueryCache<String> = QueryCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["feed"];
    let f = counted_fetcher(calls.clone(), Duration::from_millis(20), "hello");

    cache.read(&key, f.clone(), ReadOptions::default()).unwrap();
    sleep(Duration::from_millis(40)).await;

    let opts = ReadOptions {
      stale_after: Some(Duration::ZERO),
      ..Default::default()
    };
    let snap = cache.read(&key, f, opts).unwrap();
    // Stale data is still served while the background fetch runs
    assert_eq!(snap.data().map(String::as_str), Some("hello"));
    assert!(snap.is_fetching);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_failed_fetch_retains_previous_data() {
    let cache: QueryCache<String> = QueryCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["feed"];

    let calls_clone = calls.clone();
    let flaky = fetcher(move |_params| {
      let n = calls_clone.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          Ok("hello".to_string())
        } else {
          Err(FetchError::new("server exploded").with_code("http_500"))
        }
      }
    });

    cache.read(&key, flaky.clone(), ReadOptions::default()).unwrap();
    sleep(Duration::from_millis(20)).await;

    let opts = ReadOptions {
      stale_after: Some(Duration::ZERO),
      ..Default::default()
    };
    cache.read(&key, flaky, opts).unwrap();
    sleep(Duration::from_millis(20)).await;

    let snap = cache.snapshot(&key).unwrap();
    assert!(snap.is_error());
    assert_eq!(snap.error.as_ref().unwrap().code.as_deref(), Some("http_500"));
    // Stale-but-valid content stays available next to the error
    assert_eq!(snap.data().map(String::as_str), Some("hello"));
  }

  #[tokio::test]
  async fn test_superseded_completion_is_discarded() {
    init_test_logging();
    let cache: QueryCache<String> = QueryCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["feed"];

    // First dispatch is slow and returns "old"; the forced re-fetch from
    // invalidation is fast and returns "new".
    let calls_clone = calls.clone();
    let f = fetcher(move |_params| {
      let n = calls_clone.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          sleep(Duration::from_millis(60)).await;
          Ok("old".to_string())
        } else {
          Ok("new".to_string())
        }
      }
    });

    let _watch = cache.emitter().watch_key(key.clone(), |_| {});
    cache.read(&key, f, ReadOptions::default()).unwrap();
    sleep(Duration::from_millis(10)).await;

    cache.invalidate(&query_key!["feed"]);
    sleep(Duration::from_millis(100)).await;

    // The slow "old" completion arrived last but was superseded
    let snap = cache.snapshot(&key).unwrap();
    assert_eq!(snap.data().map(String::as_str), Some("new"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_invalidate_prefix_refetches_watched_and_ignores_others() {
    let cache: QueryCache<String> = QueryCache::new(CacheConfig::default());
    let feed_calls = Arc::new(AtomicUsize::new(0));
    let other_calls = Arc::new(AtomicUsize::new(0));
    let feed_key = query_key!["feed", "me"];
    let other_key = query_key!["notifications"];

    let _watch = cache.emitter().watch_key(feed_key.clone(), |_| {});
    cache
      .read(
        &feed_key,
        counted_fetcher(feed_calls.clone(), Duration::ZERO, "feed"),
        ReadOptions::default(),
      )
      .unwrap();
    cache
      .read(
        &other_key,
        counted_fetcher(other_calls.clone(), Duration::ZERO, "other"),
        ReadOptions::default(),
      )
      .unwrap();
    sleep(Duration::from_millis(20)).await;

    cache.invalidate(&query_key!["feed"]);
    sleep(Duration::from_millis(20)).await;

    assert_eq!(feed_calls.load(Ordering::SeqCst), 2);
    assert_eq!(other_calls.load(Ordering::SeqCst), 1);
    assert!(!cache.snapshot(&other_key).unwrap().is_fetching);
  }

  #[tokio::test]
  async fn test_invalidation_emits_and_notifies_subscriber() {
    let cache: QueryCache<String> = QueryCache::new(CacheConfig::default());
    let key = query_key!["feed", "me"];
    let invalidated = Arc::new(AtomicUsize::new(0));
    let invalidated_clone = invalidated.clone();
    let _sub = cache.emitter().watch_prefix(query_key!["feed"], move |event| {
      if event.kind == ChangeKind::Invalidated {
        invalidated_clone.fetch_add(1, Ordering::SeqCst);
      }
    });

    cache.write(&key, |_| "hello".to_string());
    cache.invalidate(&query_key!["feed"]);
    assert_eq!(invalidated.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_write_applies_optimistic_update() {
    let cache: QueryCache<Vec<u32>> = QueryCache::new(CacheConfig::default());
    let key = query_key!["feed"];

    cache.write(&key, |_| vec![1, 2]);
    cache.write(&key, |old| {
      let mut next = old.cloned().unwrap_or_default();
      next.push(3);
      next
    });

    let snap = cache.snapshot(&key).unwrap();
    assert!(snap.is_success());
    assert_eq!(snap.data(), Some(&vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_empty_key_fails_fast() {
    let cache: QueryCache<String> = QueryCache::new(CacheConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let err = cache
      .read(
        &QueryKey::new(),
        counted_fetcher(calls.clone(), Duration::ZERO, "x"),
        ReadOptions::default(),
      )
      .unwrap_err();
    assert_eq!(err.code.as_deref(), Some("invalid_input"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_gc_removes_unwatched_and_keeps_watched() {
    let config = CacheConfig {
      gc_after: Duration::ZERO,
      ..Default::default()
    };
    let cache: QueryCache<String> = QueryCache::new(config);
    let watched = query_key!["feed", "me"];
    let unwatched = query_key!["notifications"];

    cache.write(&watched, |_| "a".to_string());
    cache.write(&unwatched, |_| "b".to_string());
    let _sub = cache.emitter().watch_key(watched.clone(), |_| {});
    sleep(Duration::from_millis(5)).await;

    let removed = cache.gc();
    assert_eq!(removed, 1);
    assert!(cache.snapshot(&watched).is_some());
    assert!(cache.snapshot(&unwatched).is_none());
  }
}
