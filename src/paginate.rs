//! Offset pagination over an executed view.
//!
//! Slicing happens after the executor's sort, so item order within and
//! across pages follows the pipeline. Writes landing between two page
//! requests can shift items across page boundaries.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::executor::ViewCursor;

pub const DEFAULT_PAGE: usize = 1;
pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: usize,
    page_size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Zero values fall back to the defaults; oversized pages are capped.
    pub fn new(page: usize, page_size: usize) -> Self {
        let page = if page == 0 { DEFAULT_PAGE } else { page };
        let page_size = match page_size {
            0 => DEFAULT_PAGE_SIZE,
            size => size.min(MAX_PAGE_SIZE),
        };
        Self { page, page_size }
    }

    /// Parses raw query-string values. Anything that is not a positive
    /// integer is replaced by its default instead of being rejected.
    pub fn from_raw(page: Option<&str>, page_size: Option<&str>) -> Self {
        Self::new(parse_positive(page), parse_positive(page_size))
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

fn parse_positive(raw: Option<&str>) -> usize {
    raw.and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|value| *value > 0)
        .and_then(|value| usize::try_from(value).ok())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_items: usize,
    pub total_pages: usize,
    pub has_prev_page: bool,
    pub has_next_page: bool,
    pub prev_page: Option<usize>,
    pub next_page: Option<usize>,
}

/// Counts the full result, then decodes only the requested slice.
pub fn paginate<T: DeserializeOwned>(cursor: ViewCursor, request: PageRequest) -> CoreResult<Page<T>> {
    let total_items = cursor.len();
    let total_pages = total_items.div_ceil(request.page_size);
    let items = cursor
        .skip(request.offset())
        .take(request.page_size)
        .map(|doc| serde_json::from_value(doc).map_err(Into::into))
        .collect::<CoreResult<Vec<T>>>()?;

    let has_prev_page = request.page > 1;
    let has_next_page = request.page < total_pages;
    Ok(Page {
        items,
        page: request.page,
        page_size: request.page_size,
        total_items,
        total_pages,
        has_prev_page,
        has_next_page,
        prev_page: has_prev_page.then(|| request.page - 1),
        next_page: has_next_page.then(|| request.page + 1),
    })
}
