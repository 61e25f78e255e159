//! Paging and filtering inputs shared by every repository `list`/`count`.

use serde::{Deserialize, Serialize};

/// Default page size when the caller does not pass one.
pub const DEFAULT_LIMIT: usize = 50;

/// Hard ceiling on page size.
pub const MAX_LIMIT: usize = 1000;

/// Offset/limit paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Pagination {
    /// Build a page, clamping `limit` into `1..=MAX_LIMIT`.
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_LIMIT),
        }
    }

    /// Everything up to `MAX_LIMIT` rows.
    pub fn all() -> Self {
        Self::new(0, MAX_LIMIT)
    }

    /// Apply this page to an already ordered sequence.
    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(0, DEFAULT_LIMIT)
    }
}

/// Filter for list/count queries.
///
/// `name_contains` is a case-insensitive substring match. `include_inactive`
/// controls whether soft-deleted / deactivated rows are returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub name_contains: Option<String>,
    pub include_inactive: bool,
}

impl ListFilter {
    pub fn active() -> Self {
        Self::default()
    }

    pub fn with_inactive() -> Self {
        Self {
            include_inactive: true,
            ..Self::default()
        }
    }

    pub fn name_contains(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into());
        self
    }

    /// Whether a row with this name and active flag passes the filter.
    pub fn matches(&self, name: &str, is_active: bool) -> bool {
        if !self.include_inactive && !is_active {
            return false;
        }
        match &self.name_contains {
            Some(needle) => name.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped() {
        assert_eq!(Pagination::new(0, 0).limit, 1);
        assert_eq!(Pagination::new(0, 5000).limit, MAX_LIMIT);
        assert_eq!(Pagination::default().limit, DEFAULT_LIMIT);
    }

    #[test]
    fn apply_skips_and_takes() {
        let page = Pagination::new(2, 2);
        assert_eq!(page.apply(1..=10), vec![3, 4]);
    }

    #[test]
    fn filter_hides_inactive_by_default() {
        let f = ListFilter::active();
        assert!(f.matches("admin", true));
        assert!(!f.matches("admin", false));
        assert!(ListFilter::with_inactive().matches("admin", false));
    }

    #[test]
    fn filter_name_is_case_insensitive() {
        let f = ListFilter::active().name_contains("ADM");
        assert!(f.matches("site_admin", true));
        assert!(!f.matches("viewer", true));
    }
}
