//! Pagination window calculator.
//!
//! Pure computation of which page labels a discrete pagination control
//! should render: the first and last page are always shown, a window of
//! pages around the current one, and ellipsis markers for the gaps.

use serde::Serialize;

/// One element of a rendered pagination row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageItem {
  /// A concrete page number.
  Page(u64),
  /// A gap between page numbers.
  Ellipsis,
}

/// Below this many total pages the full range is shown, no ellipsis.
const FULL_RANGE_MAX: u64 = 10;

/// Pages shown on each side of the current page in the windowed form.
const DELTA: u64 = 4;

/// Compute the ordered page labels for pagination controls.
///
/// - `total == 0` yields an empty row.
/// - `total <= 10` yields `1..=total` in full.
/// - Otherwise: `1`, a leading ellipsis when `current > DELTA + 2`, the run
///   `max(2, current - DELTA) ..= min(total - 1, current + DELTA)`, a
///   trailing ellipsis when `current + DELTA < total - 1`, then `total`.
///
/// `current` is expected to be in `1..=total`; callers clamp before
/// calling, this function does not validate.
pub fn page_window(current: u64, total: u64) -> Vec<PageItem> {
  if total == 0 {
    return Vec::new();
  }
  if total <= FULL_RANGE_MAX {
    return (1..=total).map(PageItem::Page).collect();
  }

  let mut out = Vec::new();
  out.push(PageItem::Page(1));
  if current > DELTA + 2 {
    out.push(PageItem::Ellipsis);
  }

  let lo = current.saturating_sub(DELTA).max(2);
  let hi = (current + DELTA).min(total - 1);
  for page in lo..=hi {
    out.push(PageItem::Page(page));
  }

  if current + DELTA < total - 1 {
    out.push(PageItem::Ellipsis);
  }
  out.push(PageItem::Page(total));
  out
}
