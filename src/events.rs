//! Change notification for cache consumers.
//!
//! This is the push half of the external-store binding: consumers
//! subscribe with a key predicate, and when a matching key changes they
//! re-read the cache (the pull half, `snapshot`). The cache never pushes
//! data through the subscription, only the fact that a key changed.

use crate::key::QueryKey;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

/// What changed about a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  /// New data was applied (fetch completion or direct write).
  Updated,
  /// A fetch failed; the entry's error is populated.
  Errored,
  /// The entry was marked stale by invalidation.
  Invalidated,
  /// The entry was removed by a garbage-collection sweep.
  Removed,
}

/// Notification that a cached key changed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
  pub key: QueryKey,
  pub kind: ChangeKind,
}

type Predicate = Box<dyn Fn(&QueryKey) -> bool + Send + Sync>;
type Callback = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Subscriber {
  id: u64,
  predicate: Predicate,
  callback: Callback,
}

#[derive(Default)]
struct EmitterInner {
  next_id: AtomicU64,
  subscribers: Mutex<Vec<Arc<Subscriber>>>,
}

impl EmitterInner {
  // The subscriber list stays consistent even if a lock holder panicked.
  fn live_subscribers(&self) -> Vec<Arc<Subscriber>> {
    match self.subscribers.lock() {
      Ok(guard) => guard.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }
}

/// Synchronous fan-out of cache change events.
///
/// Cheap to clone; clones share the subscriber list, which is how several
/// caches share one notification surface.
#[derive(Clone, Default)]
pub struct ChangeEmitter {
  inner: Arc<EmitterInner>,
}

impl ChangeEmitter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a subscriber. The predicate decides which keys are relevant;
  /// the callback runs synchronously for every matching change event.
  ///
  /// The returned handle unsubscribes on drop.
  pub fn subscribe<P, C>(&self, predicate: P, callback: C) -> Subscription
  where
    P: Fn(&QueryKey) -> bool + Send + Sync + 'static,
    C: Fn(&ChangeEvent) + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let subscriber = Arc::new(Subscriber {
      id,
      predicate: Box::new(predicate),
      callback: Box::new(callback),
    });
    match self.inner.subscribers.lock() {
      Ok(mut guard) => guard.push(subscriber),
      Err(poisoned) => poisoned.into_inner().push(subscriber),
    }
    Subscription {
      id,
      emitter: Arc::downgrade(&self.inner),
    }
  }

  /// Subscribe to exactly one key.
  pub fn watch_key<C>(&self, key: QueryKey, callback: C) -> Subscription
  where
    C: Fn(&ChangeEvent) + Send + Sync + 'static,
  {
    self.subscribe(move |k| *k == key, callback)
  }

  /// Subscribe to every key under a prefix.
  pub fn watch_prefix<C>(&self, prefix: QueryKey, callback: C) -> Subscription
  where
    C: Fn(&ChangeEvent) + Send + Sync + 'static,
  {
    self.subscribe(move |k| k.starts_with(&prefix), callback)
  }

  /// True when any live subscription's predicate matches `key`. Backs
  /// "re-fetch only if subscribed" and garbage collection.
  pub fn is_watched(&self, key: &QueryKey) -> bool {
    self
      .inner
      .live_subscribers()
      .iter()
      .any(|s| (s.predicate)(key))
  }

  /// Deliver `event` to every matching subscriber.
  ///
  /// Subscriber callbacks are observability-class consumers: a panic in
  /// one is logged and swallowed so a notification failure can never
  /// reach the read path or starve other subscribers.
  pub fn emit(&self, event: ChangeEvent) {
    for subscriber in self.inner.live_subscribers() {
      if !(subscriber.predicate)(&event.key) {
        continue;
      }
      let delivery = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(&event)));
      if delivery.is_err() {
        warn!(key = %event.key, "change subscriber panicked; skipping");
      }
    }
  }
}

/// Active subscription handle; unsubscribes when dropped.
pub struct Subscription {
  id: u64,
  emitter: Weak<EmitterInner>,
}

impl Subscription {
  /// Explicitly unsubscribe. Equivalent to dropping the handle.
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.emitter.upgrade() {
      let mut guard = match inner.subscribers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
      };
      guard.retain(|s| s.id != self.id);
    }
  }
}
