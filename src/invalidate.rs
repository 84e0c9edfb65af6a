//! Mutation-driven invalidation routing.
//!
//! After a create/update/delete succeeds, the caches that may now hold
//! stale reads are told about it by key prefix. The router fans a set of
//! prefixes out to every registered cache; each cache decides what
//! invalidation means for it (mark stale and re-fetch for the keyed
//! cache, full reset and first-page re-fetch for accumulated
//! collections).

use crate::key::QueryKey;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

/// Anything that can invalidate its entries by key prefix.
pub trait PrefixInvalidate: Send + Sync {
  fn invalidate_prefix(&self, prefix: &QueryKey);
}

/// Routes mutation-completion notifications to registered caches.
///
/// Caches are held weakly: a dropped cache simply stops receiving
/// invalidations, and its slot is pruned on the next routing pass.
/// Routing is best-effort and independent per cache and per prefix; a
/// cache whose re-fetch fails never rolls back the others.
#[derive(Default)]
pub struct InvalidationRouter {
  caches: Mutex<Vec<Weak<dyn PrefixInvalidate>>>,
}

impl InvalidationRouter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a cache to receive invalidations.
  pub fn register<C: PrefixInvalidate + 'static>(&self, cache: &Arc<C>) {
    let weak = Arc::downgrade(cache);
    let weak: Weak<dyn PrefixInvalidate> = weak;
    self.lock().push(weak);
  }

  /// Fan `prefixes` out to every live registered cache.
  pub fn on_mutation_success(&self, prefixes: &[QueryKey]) {
    let live: Vec<Arc<dyn PrefixInvalidate>> = {
      let mut caches = self.lock();
      caches.retain(|weak| weak.strong_count() > 0);
      caches.iter().filter_map(Weak::upgrade).collect()
    };
    info!(
      prefixes = prefixes.len(),
      caches = live.len(),
      "routing mutation invalidation"
    );
    for cache in &live {
      for prefix in prefixes {
        cache.invalidate_prefix(prefix);
      }
    }
  }

  /// Number of live registered caches, for tests and diagnostics.
  pub fn cache_count(&self) -> usize {
    let mut caches = self.lock();
    caches.retain(|weak| weak.strong_count() > 0);
    caches.len()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Weak<dyn PrefixInvalidate>>> {
    match self.caches.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

/// Declared relationship "this mutation invalidates these key prefixes".
///
/// Nothing is persisted; the edges are evaluated at mutation-completion
/// time, and only on success.
#[derive(Debug, Clone, Default)]
pub struct MutationEdges {
  prefixes: Vec<QueryKey>,
}

impl MutationEdges {
  pub fn new() -> Self {
    Self::default()
  }

  /// Declare one more invalidated prefix, builder style.
  pub fn invalidates(mut self, prefix: QueryKey) -> Self {
    self.prefixes.push(prefix);
    self
  }

  pub fn prefixes(&self) -> &[QueryKey] {
    &self.prefixes
  }
}

/// Run a mutation and route its declared edges on success.
///
/// The mutation result is returned either way; a failed mutation routes
/// nothing.
pub async fn run_mutation<T, E, Fut>(
  router: &InvalidationRouter,
  edges: &MutationEdges,
  mutation: Fut,
) -> Result<T, E>
where
  Fut: Future<Output = Result<T, E>>,
{
  let result = mutation.await;
  match &result {
    Ok(_) => router.on_mutation_success(edges.prefixes()),
    Err(_) => debug!("mutation failed, skipping invalidation"),
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;

  /// Test double that records every prefix it is asked to invalidate.
  #[derive(Default)]
  struct RecordingCache {
    seen: Mutex<Vec<QueryKey>>,
  }

  impl RecordingCache {
    fn seen(&self) -> Vec<QueryKey> {
      self.seen.lock().unwrap().clone()
    }
  }

  impl PrefixInvalidate for RecordingCache {
    fn invalidate_prefix(&self, prefix: &QueryKey) {
      self.seen.lock().unwrap().push(prefix.clone());
    }
  }

  #[test]
  fn test_router_fans_out_to_all_registered_caches() {
    let router = InvalidationRouter::new();
    let a = Arc::new(RecordingCache::default());
    let b = Arc::new(RecordingCache::default());
    router.register(&a);
    router.register(&b);

    router.on_mutation_success(&[query_key!["feed"], query_key!["messages", 7]]);

    assert_eq!(a.seen(), vec![query_key!["feed"], query_key!["messages", 7]]);
    assert_eq!(b.seen(), a.seen());
  }

  #[test]
  fn test_dropped_cache_is_pruned() {
    let router = InvalidationRouter::new();
    let a = Arc::new(RecordingCache::default());
    let b = Arc::new(RecordingCache::default());
    router.register(&a);
    router.register(&b);
    assert_eq!(router.cache_count(), 2);

    drop(b);
    router.on_mutation_success(&[query_key!["feed"]]);
    assert_eq!(router.cache_count(), 1);
    assert_eq!(a.seen(), vec![query_key!["feed"]]);
  }

  #[tokio::test]
  async fn test_run_mutation_routes_only_on_success() {
    let router = InvalidationRouter::new();
    let cache = Arc::new(RecordingCache::default());
    router.register(&cache);
    let edges = MutationEdges::new().invalidates(query_key!["feed"]);

    let failed: Result<(), &str> =
      run_mutation(&router, &edges, async { Err("rejected") }).await;
    assert!(failed.is_err());
    assert!(cache.seen().is_empty());

    let ok: Result<u32, &str> = run_mutation(&router, &edges, async { Ok(11) }).await;
    assert_eq!(ok.unwrap(), 11);
    assert_eq!(cache.seen(), vec![query_key!["feed"]]);
  }

  #[tokio::test]
  async fn test_partial_refetch_failure_is_independent() {
    use crate::cache::{CacheConfig, QueryCache, ReadOptions};
    use crate::events::ChangeEmitter;
    use crate::fetch::{fetcher, FetchError, FetchedPage, PageFetcherFn};
    use crate::infinite::{FetchNextOptions, InfiniteCache};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    let emitter = ChangeEmitter::new();
    let keyed: Arc<QueryCache<String>> =
      Arc::new(QueryCache::with_emitter(CacheConfig::default(), emitter.clone()));
    let infinite: Arc<InfiniteCache<u64>> =
      Arc::new(InfiniteCache::with_emitter(CacheConfig::default(), emitter.clone()));
    let router = InvalidationRouter::new();
    router.register(&keyed);
    router.register(&infinite);

    let summary_key = query_key!["feed", "summary"];
    let items_key = query_key!["feed", "items"];
    let _watch_summary = emitter.watch_key(summary_key.clone(), |_| {});
    let _watch_items = emitter.watch_key(items_key.clone(), |_| {});

    let summary_calls = Arc::new(AtomicUsize::new(0));
    let summary_calls_clone = summary_calls.clone();
    keyed
      .read(
        &summary_key,
        fetcher(move |_p| {
          summary_calls_clone.fetch_add(1, Ordering::SeqCst);
          async { Ok("summary".to_string()) }
        }),
        ReadOptions::default(),
      )
      .unwrap();

    // First page loads; the re-fetch after invalidation will fail.
    let item_calls = Arc::new(AtomicUsize::new(0));
    let item_calls_clone = item_calls.clone();
    let items_fetcher: PageFetcherFn<u64> = fetcher(move |_p| {
      let n = item_calls_clone.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          Ok(FetchedPage::new(vec![1, 2]).with_has_more(false))
        } else {
          Err(FetchError::new("backend down").with_code("http_502"))
        }
      }
    });
    infinite
      .fetch_next(&items_key, items_fetcher, FetchNextOptions::default())
      .await
      .unwrap();
    sleep(Duration::from_millis(20)).await;

    let edges = MutationEdges::new().invalidates(query_key!["feed"]);
    let mutated: Result<(), FetchError> = run_mutation(&router, &edges, async { Ok(()) }).await;
    assert!(mutated.is_ok());
    sleep(Duration::from_millis(40)).await;

    // The keyed cache re-fetched fine despite the accumulator's failure
    assert_eq!(summary_calls.load(Ordering::SeqCst), 2);
    let summary = keyed.snapshot(&summary_key).unwrap();
    assert!(summary.is_success());

    assert_eq!(item_calls.load(Ordering::SeqCst), 2);
    let items = infinite.snapshot(&items_key);
    assert!(items.error.is_some());
    assert!(items.flat_items.is_empty());
  }
}
