//! List-query translation
//!
//! A parsed query string (map of key → values, already flattened) is
//! translated into column predicates, JSON-path predicates and pagination
//! before reaching SQL. Ordering is by content hash, a pseudo-random but
//! stable total order: pagination over an unchanged cache is consistent,
//! and per-provider placement does not move under unrelated updates.

use std::collections::BTreeMap;

/// Default page size when the query carries no `limit`
pub const DEFAULT_LIMIT: i64 = 10;

/// Translated list filter
#[derive(Debug, Clone, PartialEq)]
pub struct ListFilter {
    /// `lifecycleStatus` values; one value is equality, several membership
    pub lifecycle_status: Vec<String>,
    /// Equality on the `organization` column
    pub organization: Option<String>,
    /// JSON-path predicates on the payload: (`$.key`, values)
    pub json_filters: Vec<(String, Vec<String>)>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            lifecycle_status: Vec::new(),
            organization: None,
            json_filters: Vec::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl ListFilter {
    /// Translate a flattened query map
    ///
    /// `lifecycleStatus` and `relatedParty[.id]` map onto their columns;
    /// `limit`/`offset` onto pagination; every other key becomes a
    /// JSON-path predicate at `$.{key}`.
    pub fn from_query(query: &BTreeMap<String, Vec<String>>) -> Self {
        let mut filter = ListFilter::default();

        for (key, values) in query {
            if values.is_empty() {
                continue;
            }
            match key.as_str() {
                "limit" => {
                    if let Ok(n) = values[0].parse::<i64>() {
                        if n > 0 {
                            filter.limit = n;
                        }
                    }
                }
                "offset" => {
                    if let Ok(n) = values[0].parse::<i64>() {
                        if n >= 0 {
                            filter.offset = n;
                        }
                    }
                }
                "lifecycleStatus" => {
                    filter.lifecycle_status = values.clone();
                }
                "relatedParty" | "relatedParty.id" => {
                    filter.organization = Some(values[0].clone());
                }
                other => {
                    filter
                        .json_filters
                        .push((format!("$.{other}"), values.clone()));
                }
            }
        }
        filter
    }

    /// Same translation without pagination, for callers that page manually
    pub fn without_paging(mut self) -> Self {
        self.limit = DEFAULT_LIMIT;
        self.offset = 0;
        self
    }

    /// Replace pagination
    pub fn with_paging(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}
