//! Logical query identity.
//!
//! A [`QueryKey`] is an ordered tuple of primitive segments naming one
//! logical query ("which collection, with which filters"). Two keys are
//! equal iff their segments are element-wise equal, and keys form a prefix
//! relation used by invalidation: `["messages", 42]` starts with the
//! prefix `["messages"]`, so invalidating `["messages"]` reaches it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One segment of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
  /// String segment (collection name, search term, filter expression).
  Str(String),
  /// Integer segment (entity id, page number).
  Int(i64),
}

impl From<&str> for Segment {
  fn from(s: &str) -> Self {
    Segment::Str(s.to_string())
  }
}

impl From<String> for Segment {
  fn from(s: String) -> Self {
    Segment::Str(s)
  }
}

impl From<i64> for Segment {
  fn from(n: i64) -> Self {
    Segment::Int(n)
  }
}

impl From<i32> for Segment {
  fn from(n: i32) -> Self {
    Segment::Int(n as i64)
  }
}

impl From<u32> for Segment {
  fn from(n: u32) -> Self {
    Segment::Int(n as i64)
  }
}

/// Fallible on purpose: ids above `i64::MAX` would wrap into negative
/// segments and collide with unrelated keys.
impl TryFrom<u64> for Segment {
  type Error = std::num::TryFromIntError;

  fn try_from(n: u64) -> Result<Self, Self::Error> {
    i64::try_from(n).map(Segment::Int)
  }
}

impl fmt::Display for Segment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Segment::Str(s) => write!(f, "{:?}", s),
      Segment::Int(n) => write!(f, "{}", n),
    }
  }
}

/// Ordered tuple identifying a logical query.
///
/// Build one with [`QueryKey::from_segments`], the [`query_key!`] macro,
/// or incrementally with [`QueryKey::push`]:
///
/// ```ignore
/// let key = query_key!["team-search", term, page];
/// assert!(key.starts_with(&query_key!["team-search"]));
/// ```
///
/// [`query_key!`]: crate::query_key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct QueryKey(Vec<Segment>);

impl QueryKey {
  /// Create an empty key. An empty key is not a valid read target; it only
  /// exists as a builder starting point.
  pub fn new() -> Self {
    Self(Vec::new())
  }

  /// Create a key from an explicit segment list.
  pub fn from_segments(segments: Vec<Segment>) -> Self {
    Self(segments)
  }

  /// Append a segment, builder style.
  pub fn push(mut self, segment: impl Into<Segment>) -> Self {
    self.0.push(segment.into());
    self
  }

  /// The segments of this key, in order.
  pub fn segments(&self) -> &[Segment] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Prefix relation: true when this key's segments start with all of
  /// `prefix`'s segments. Every key starts with the empty prefix.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, seg) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}", seg)?;
    }
    write!(f, "]")
  }
}

/// Build a [`QueryKey`] from a comma-separated list of segment values.
///
/// ```ignore
/// let key = query_key!["messages", ticket_id];
/// ```
#[macro_export]
macro_rules! query_key {
  ($($seg:expr),* $(,)?) => {
    $crate::key::QueryKey::from_segments(vec![$($crate::key::Segment::from($seg)),*])
  };
}
