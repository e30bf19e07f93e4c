//! Typed search-index rows derived from resource payloads.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A family-specific index value.
///
/// Rows are deduplicated by full value equality within a `(record, param)`
/// pair; `Ord` exists so row sets can live in ordered collections and compare
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexValue {
    Token {
        system: Option<String>,
        code: String,
    },
    String(String),
    Reference {
        target_type: Option<String>,
        target_id: String,
    },
    Quantity {
        value: Decimal,
        system: Option<String>,
        code: Option<String>,
    },
    /// Date values index as an interval; point values use `start == end`.
    Date {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Number(Decimal),
    Uri(String),
    /// Component values of a composite parameter, in component order.
    Composite(Vec<IndexValue>),
}

/// One secondary-index row: the extraction rule that produced it plus the
/// typed value. The enclosing record supplies `(type, logical_id, version)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexRow {
    pub param_url: String,
    pub value: IndexValue,
}

impl IndexRow {
    pub fn new(param_url: impl Into<String>, value: IndexValue) -> Self {
        Self {
            param_url: param_url.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn duplicate_rows_collapse_in_a_set() {
        let mut rows = BTreeSet::new();
        let row = IndexRow::new(
            "http://hl7.org/fhir/SearchParameter/Observation-code",
            IndexValue::Token {
                system: Some("http://loinc.org".into()),
                code: "8867-4".into(),
            },
        );
        rows.insert(row.clone());
        rows.insert(row);
        assert_eq!(rows.len(), 1);
    }
}
