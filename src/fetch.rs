//! The fetch-descriptor boundary.
//!
//! The cache knows nothing about transports. The embedding application
//! supplies a fetcher per logical key: an async function from
//! [`FetchParams`] to a result. Everything network-shaped (HTTP, GraphQL,
//! auth, endpoints) lives behind that closure.
//!
//! # Example
//!
//! ```ignore
//! let api = api_client.clone();
//! let messages = fetcher(move |params: FetchParams| {
//!     let api = api.clone();
//!     async move { api.list_messages(params).await }
//! });
//! ```

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Position of one page within a remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageCursor {
  /// Discrete page number, 1-based.
  Page(u64),
  /// Opaque continuation token issued by the server.
  Token(String),
}

impl fmt::Display for PageCursor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PageCursor::Page(n) => write!(f, "page {}", n),
      PageCursor::Token(t) => write!(f, "token {}", t),
    }
  }
}

/// Parameters handed to a fetcher for one fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchParams {
  /// Where to fetch. `None` means the first page / the whole resource.
  pub cursor: Option<PageCursor>,
  /// Requested page size.
  pub page_size: u32,
  /// Server-side filter expression, if any.
  pub filter: Option<String>,
  /// Server-side sort expression, if any.
  pub sort: Option<String>,
}

impl FetchParams {
  /// Params for the first page with no filter or sort.
  pub fn first_page(page_size: u32) -> Self {
    Self {
      cursor: None,
      page_size,
      filter: None,
      sort: None,
    }
  }

  /// Params at a specific cursor.
  pub fn at(cursor: PageCursor, page_size: u32) -> Self {
    Self {
      cursor: Some(cursor),
      page_size,
      filter: None,
      sort: None,
    }
  }

  pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
    self.filter = Some(filter.into());
    self
  }

  pub fn with_sort(mut self, sort: impl Into<String>) -> Self {
    self.sort = Some(sort.into());
    self
  }
}

/// One fetch result window, as returned by the server.
///
/// Servers signal "more pages exist" in one of two ways: an explicit
/// `has_more` flag (possibly with a continuation cursor), or a
/// `total_count` the client compares against pages fetched so far. Both
/// are carried raw here; [`HasMorePolicy`] decides which to trust.
#[derive(Debug, Clone)]
pub struct FetchedPage<T> {
  /// Items in server order.
  pub items: Vec<T>,
  /// Continuation cursor for the next page, if the server issued one.
  pub next_cursor: Option<PageCursor>,
  /// Explicit "more pages exist" flag, if the server returned one.
  pub has_more: Option<bool>,
  /// Total item count across all pages, if the server returned one.
  pub total_count: Option<u64>,
}

impl<T> FetchedPage<T> {
  pub fn new(items: Vec<T>) -> Self {
    Self {
      items,
      next_cursor: None,
      has_more: None,
      total_count: None,
    }
  }

  pub fn with_next(mut self, cursor: PageCursor) -> Self {
    self.next_cursor = Some(cursor);
    self
  }

  pub fn with_has_more(mut self, has_more: bool) -> Self {
    self.has_more = Some(has_more);
    self
  }

  pub fn with_total(mut self, total_count: u64) -> Self {
    self.total_count = Some(total_count);
    self
  }
}

/// Error surfaced by a fetcher or raised by input validation.
///
/// Carries a human-readable message, an optional machine code, and an
/// optional structured detail payload.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct FetchError {
  pub message: String,
  pub code: Option<String>,
  pub detail: Option<serde_json::Value>,
}

impl FetchError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      code: None,
      detail: None,
    }
  }

  /// Validation failure raised synchronously, before any dispatch.
  pub fn invalid(message: impl Into<String>) -> Self {
    Self::new(message).with_code("invalid_input")
  }

  pub fn with_code(mut self, code: impl Into<String>) -> Self {
    self.code = Some(code.into());
    self
  }

  pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
    self.detail = Some(detail);
    self
  }
}

/// Boxed async fetch function, cheaply cloneable and shared across
/// dispatches. `T` is whatever the query caches: a single entity, a list,
/// or (for incremental collections) a [`FetchedPage`] of items.
pub type FetcherFn<T> =
  Arc<dyn Fn(FetchParams) -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

/// Page-shaped fetcher used by incremental accumulation.
pub type PageFetcherFn<T> = FetcherFn<FetchedPage<T>>;

/// Wrap a closure returning a future into a [`FetcherFn`].
pub fn fetcher<T, F, Fut>(f: F) -> FetcherFn<T>
where
  F: Fn(FetchParams) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
  Arc::new(move |params| Box::pin(f(params)))
}

/// How "more pages exist" is read off a fetched page.
///
/// The two strategies are not interchangeable within one key's lifetime;
/// a descriptor picks one and sticks with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HasMorePolicy {
  /// Trust the page's explicit `has_more` flag; when the flag is absent,
  /// the presence of a continuation cursor stands in for it.
  #[default]
  Flag,
  /// Infer from `pages_fetched < total_pages`, where `total_pages` is
  /// derived from the server's `total_count` and the page size.
  PageCount,
}

impl HasMorePolicy {
  /// Decide whether more pages exist after `page`, and where the next
  /// fetch should start. `pages_fetched` counts fetched pages including
  /// this one.
  pub fn resolve<T>(
    &self,
    page: &FetchedPage<T>,
    pages_fetched: u64,
    page_size: u32,
  ) -> (bool, Option<PageCursor>) {
    match self {
      HasMorePolicy::Flag => {
        let has_more = page.has_more.unwrap_or(page.next_cursor.is_some());
        let next = if has_more {
          page
            .next_cursor
            .clone()
            .or(Some(PageCursor::Page(pages_fetched + 1)))
        } else {
          None
        };
        (has_more, next)
      }
      HasMorePolicy::PageCount => match page.total_count {
        Some(total) => {
          let total_pages = total.div_ceil(page_size.max(1) as u64);
          let has_more = pages_fetched < total_pages;
          let next = has_more.then_some(PageCursor::Page(pages_fetched + 1));
          (has_more, next)
        }
        // Misconfigured descriptor: no total count to compare against.
        // Fall back to the flag rules rather than inventing pages.
        None => HasMorePolicy::Flag.resolve(page, pages_fetched, page_size),
      },
    }
  }
}
