//! Derived views over the cached collection.
//!
//! The cache does not define a query language. Callers supply a
//! [`LocalQuery`] that filters, orders and paginates records.

use std::cmp::Ordering;

use serde::Serialize;
use serde_json::Value;

/// A black-box filter + sort + paginate query.
pub trait LocalQuery {
    /// Whether `record` belongs in the result.
    fn matches(&self, record: &Value) -> bool;

    /// Ordering of matched records. Defaults to collection order.
    fn compare(&self, _a: &Value, _b: &Value) -> Ordering {
        Ordering::Equal
    }

    /// Number of matched records to skip.
    fn skip(&self) -> usize {
        0
    }

    /// Maximum number of records to return.
    fn limit(&self) -> Option<usize> {
        None
    }
}

/// Every record, in collection order.
#[derive(Debug, Clone, Copy, Default)]
pub struct All;

impl LocalQuery for All {
    fn matches(&self, _record: &Value) -> bool {
        true
    }
}

/// Records whose fields equal every given value.
#[derive(Debug, Clone, Default)]
pub struct FieldEquals {
    pub fields: Vec<(String, Value)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FieldEquals {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            fields: vec![(field.into(), value.into())],
            ..Default::default()
        }
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    pub fn paginate(mut self, skip: usize, limit: usize) -> Self {
        self.skip = skip;
        self.limit = Some(limit);
        self
    }
}

impl LocalQuery for FieldEquals {
    fn matches(&self, record: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, value)| record.get(field) == Some(value))
    }

    fn skip(&self) -> usize {
        self.skip
    }

    fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/// One page of a local query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    /// Matched records before pagination.
    pub total: usize,
    pub skip: usize,
    pub limit: Option<usize>,
    pub data: Vec<Value>,
}

/// Run `query` over records given in collection order.
pub(crate) fn run<'a, Q>(query: &Q, records: impl Iterator<Item = &'a Value>) -> Page
where
    Q: LocalQuery + ?Sized,
{
    let mut matched: Vec<&Value> = records.filter(|r| query.matches(r)).collect();
    // Stable sort keeps collection order among equal records.
    matched.sort_by(|a, b| query.compare(a, b));

    let total = matched.len();
    let skip = query.skip();
    let limit = query.limit();
    let data = matched
        .into_iter()
        .skip(skip)
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect();

    Page {
        total,
        skip,
        limit,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ByNameDesc;

    impl LocalQuery for ByNameDesc {
        fn matches(&self, _record: &Value) -> bool {
            true
        }

        fn compare(&self, a: &Value, b: &Value) -> Ordering {
            b["name"].as_str().cmp(&a["name"].as_str())
        }

        fn limit(&self) -> Option<usize> {
            Some(2)
        }
    }

    fn records() -> Vec<Value> {
        vec![
            json!({"id": 1, "name": "a", "team": "x"}),
            json!({"id": 2, "name": "c", "team": "y"}),
            json!({"id": 3, "name": "b", "team": "x"}),
        ]
    }

    #[test]
    fn test_all_keeps_order() {
        let records = records();
        let page = run(&All, records.iter());
        assert_eq!(page.total, 3);
        assert_eq!(page.data, records);
    }

    #[test]
    fn test_field_equals_paginates() {
        let records = records();
        let page = run(&FieldEquals::new("team", "x").paginate(1, 10), records.iter());
        assert_eq!(page.total, 2);
        assert_eq!(page.data, vec![json!({"id": 3, "name": "b", "team": "x"})]);
    }

    #[test]
    fn test_custom_sort_and_limit() {
        let records = records();
        let page = run(&ByNameDesc, records.iter());
        assert_eq!(page.total, 3);
        let ids: Vec<_> = page.data.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(3)]);
    }
}
