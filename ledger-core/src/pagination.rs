//! Descending-ID cursor pagination
//!
//! Rows are keyed by UUIDv7, so "newest first" is "descending ID". The cursor
//! is the ID of the last row returned, encoded as simple hex; callers treat it
//! as opaque.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default page size
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Hard cap on page size
pub const MAX_PAGE_SIZE: usize = 500;

/// Page request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Cursor from a previous page
    pub cursor: Option<String>,
    /// Requested size (0 = default)
    pub limit: usize,
}

impl Page {
    /// First page of `limit` rows
    pub fn first(limit: usize) -> Self {
        Self { cursor: None, limit }
    }

    /// Page following `cursor`
    pub fn after(cursor: impl Into<String>, limit: usize) -> Self {
        Self { cursor: Some(cursor.into()), limit }
    }

    fn effective_limit(&self) -> usize {
        match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult<T> {
    /// Rows, newest first
    pub items: Vec<T>,
    /// Cursor for the next page, if more rows exist
    pub next_cursor: Option<String>,
}

/// Encode an ID as a cursor
pub fn encode_cursor(id: Uuid) -> String {
    id.simple().to_string()
}

/// Decode a cursor back into an ID
pub fn decode_cursor(cursor: &str) -> Result<Uuid> {
    Uuid::try_parse(cursor).map_err(|e| Error::InvalidCursor(format!("{}: {}", cursor, e)))
}

/// Slice `rows` into a page. `rows` may be in any order; `id` extracts the
/// sort key.
pub fn paginate<T, F>(mut rows: Vec<T>, page: &Page, id: F) -> Result<PageResult<T>>
where
    F: Fn(&T) -> Uuid,
{
    rows.sort_by_key(|row| std::cmp::Reverse(id(row)));

    if let Some(cursor) = &page.cursor {
        let after = decode_cursor(cursor)?;
        rows.retain(|row| id(row) < after);
    }

    let limit = page.effective_limit();
    let has_more = rows.len() > limit;
    rows.truncate(limit);

    let next_cursor = if has_more {
        rows.last().map(|row| encode_cursor(id(row)))
    } else {
        None
    };

    Ok(PageResult { items: rows, next_cursor })
}
