//! Keyed query cache for paginated remote collections.
//!
//! `refetch` is the data-access layer between UI surfaces and a paginated
//! remote API: it turns fetch requests keyed by logical identity ("which
//! collection, with which filters") into cached, de-duplicated reads,
//! monotonically growing page accumulations for "load more" lists, page
//! window labels for discrete pagination controls, and prefix-based
//! invalidation after mutations.
//!
//! The crate defines no transport of its own. The embedding application
//! supplies a fetcher per logical key (see [`fetch`]) and consumes change
//! notifications (see [`events`]) to re-read snapshots and re-render.
//!
//! # Example
//!
//! ```ignore
//! let cache: QueryCache<Vec<Message>> = QueryCache::new(CacheConfig::default());
//! let key = query_key!["messages", ticket_id];
//!
//! let _sub = cache.emitter().watch_key(key.clone(), |event| {
//!     // a matching key changed; pull a fresh snapshot and re-render
//! });
//!
//! let snapshot = cache.read(&key, messages_fetcher, ReadOptions::default())?;
//! match snapshot.status {
//!     QueryStatus::Success => render(snapshot.data().unwrap()),
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Error => render_error(snapshot.error.as_ref().unwrap()),
//!     QueryStatus::Idle => {}
//! }
//! ```

pub mod cache;
pub mod events;
pub mod fetch;
pub mod infinite;
pub mod invalidate;
pub mod key;
pub mod window;

pub use cache::{CacheConfig, EntrySnapshot, QueryCache, QueryStatus, ReadOptions};
pub use events::{ChangeEmitter, ChangeEvent, ChangeKind, Subscription};
pub use fetch::{
  fetcher, FetchError, FetchParams, FetchedPage, FetcherFn, HasMorePolicy, PageCursor,
  PageFetcherFn,
};
pub use infinite::{AccumulatedPage, AccumulatedSnapshot, FetchNextOptions, InfiniteCache};
pub use invalidate::{run_mutation, InvalidationRouter, MutationEdges, PrefixInvalidate};
pub use key::{QueryKey, Segment};
pub use window::{page_window, PageItem};
