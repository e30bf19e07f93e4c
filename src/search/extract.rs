//! Index-row extraction from JSON payloads.
//!
//! The full clinical path language lives in the parsing layer outside this
//! crate; the engine only needs a `SearchIndexer` seam plus a baseline
//! implementation that understands dotted paths with array flattening. That
//! covers the structural shapes the typed index families are built from.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use super::{IndexRow, IndexValue, SearchParamInfo, SearchParamKind};
use crate::Result;

/// Produces the typed index rows for one resource payload under a given set
/// of extraction rules.
pub trait SearchIndexer: Send + Sync {
    fn extract(
        &self,
        resource_type: &str,
        raw: &[u8],
        params: &[SearchParamInfo],
    ) -> Result<BTreeSet<IndexRow>>;
}

/// Baseline indexer: dotted-path traversal over the payload JSON.
///
/// Expressions look like `Observation.code.coding`; a leading segment equal
/// to the resource type (or `Resource`) is skipped. Arrays flatten at every
/// step. Non-JSON payloads produce no rows.
#[derive(Debug, Default, Clone)]
pub struct JsonIndexer;

impl JsonIndexer {
    pub fn new() -> Self {
        Self
    }

    fn walk<'a>(value: &'a JsonValue, segments: &[&str], out: &mut Vec<&'a JsonValue>) {
        if let JsonValue::Array(items) = value {
            for item in items {
                Self::walk(item, segments, out);
            }
            return;
        }

        match segments.split_first() {
            None => out.push(value),
            Some((head, rest)) => {
                if let Some(next) = value.get(head) {
                    Self::walk(next, rest, out);
                }
            }
        }
    }

    fn leaves<'a>(
        resource_type: &str,
        payload: &'a JsonValue,
        expression: &str,
    ) -> Vec<&'a JsonValue> {
        let mut segments: Vec<&str> = expression.split('.').collect();
        if let Some(first) = segments.first() {
            if *first == resource_type || *first == "Resource" {
                segments.remove(0);
            }
        }

        let mut out = Vec::new();
        Self::walk(payload, &segments, &mut out);
        out
    }

    fn values_for(kind: SearchParamKind, leaf: &JsonValue) -> Vec<IndexValue> {
        match kind {
            SearchParamKind::Token => token_values(leaf),
            SearchParamKind::String => string_values(leaf),
            SearchParamKind::Reference => reference_values(leaf),
            SearchParamKind::Quantity => quantity_values(leaf),
            SearchParamKind::Date => date_values(leaf),
            SearchParamKind::Number => number_values(leaf),
            SearchParamKind::Uri => uri_values(leaf),
            // Composite extraction needs component expressions the path
            // language here cannot express; the conformance layer supplies a
            // dedicated indexer for those parameters.
            SearchParamKind::Composite => Vec::new(),
        }
    }
}

impl SearchIndexer for JsonIndexer {
    fn extract(
        &self,
        resource_type: &str,
        raw: &[u8],
        params: &[SearchParamInfo],
    ) -> Result<BTreeSet<IndexRow>> {
        let Ok(payload) = serde_json::from_slice::<JsonValue>(raw) else {
            return Ok(BTreeSet::new());
        };

        let mut rows = BTreeSet::new();
        for param in params {
            let Some(expression) = param.expression.as_deref() else {
                continue;
            };

            for leaf in Self::leaves(resource_type, &payload, expression) {
                for value in Self::values_for(param.kind, leaf) {
                    rows.insert(IndexRow::new(param.url.clone(), value));
                }
            }
        }

        Ok(rows)
    }
}

fn token_values(leaf: &JsonValue) -> Vec<IndexValue> {
    match leaf {
        JsonValue::String(s) => vec![IndexValue::Token {
            system: None,
            code: s.clone(),
        }],
        JsonValue::Bool(b) => vec![IndexValue::Token {
            system: None,
            code: b.to_string(),
        }],
        JsonValue::Object(obj) => {
            // CodeableConcept: descend into coding[].
            if let Some(JsonValue::Array(codings)) = obj.get("coding") {
                return codings.iter().flat_map(token_values).collect();
            }
            let code = obj.get("code").and_then(|v| v.as_str());
            match code {
                Some(code) => vec![IndexValue::Token {
                    system: obj
                        .get("system")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    code: code.to_string(),
                }],
                None => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

fn string_values(leaf: &JsonValue) -> Vec<IndexValue> {
    match leaf {
        JsonValue::String(s) => vec![IndexValue::String(s.clone())],
        JsonValue::Object(obj) => obj
            .get("text")
            .and_then(|v| v.as_str())
            .map(|s| vec![IndexValue::String(s.to_string())])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn reference_values(leaf: &JsonValue) -> Vec<IndexValue> {
    let literal = match leaf {
        JsonValue::String(s) => Some(s.as_str()),
        JsonValue::Object(obj) => obj.get("reference").and_then(|v| v.as_str()),
        _ => None,
    };

    let Some(literal) = literal else {
        return Vec::new();
    };

    match literal.split_once('/') {
        Some((target_type, target_id)) if !target_id.contains('/') => {
            vec![IndexValue::Reference {
                target_type: Some(target_type.to_string()),
                target_id: target_id.to_string(),
            }]
        }
        _ => vec![IndexValue::Reference {
            target_type: None,
            target_id: literal.to_string(),
        }],
    }
}

fn quantity_values(leaf: &JsonValue) -> Vec<IndexValue> {
    let JsonValue::Object(obj) = leaf else {
        return Vec::new();
    };
    let Some(value) = obj.get("value").and_then(decimal_of) else {
        return Vec::new();
    };

    vec![IndexValue::Quantity {
        value,
        system: obj
            .get("system")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        code: obj
            .get("code")
            .or_else(|| obj.get("unit"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
    }]
}

fn date_values(leaf: &JsonValue) -> Vec<IndexValue> {
    match leaf {
        JsonValue::String(s) => date_range(s)
            .map(|(start, end)| vec![IndexValue::Date { start, end }])
            .unwrap_or_default(),
        // Period: {start, end}, either bound optional.
        JsonValue::Object(obj) => {
            let start = obj
                .get("start")
                .and_then(|v| v.as_str())
                .and_then(date_range)
                .map(|(s, _)| s);
            let end = obj
                .get("end")
                .and_then(|v| v.as_str())
                .and_then(date_range)
                .map(|(_, e)| e);
            match (start, end) {
                (None, None) => Vec::new(),
                (s, e) => vec![IndexValue::Date {
                    start: s.unwrap_or(DateTime::<Utc>::MIN_UTC),
                    end: e.unwrap_or(DateTime::<Utc>::MAX_UTC),
                }],
            }
        }
        _ => Vec::new(),
    }
}

fn number_values(leaf: &JsonValue) -> Vec<IndexValue> {
    decimal_of(leaf).map(IndexValue::Number).into_iter().collect()
}

fn uri_values(leaf: &JsonValue) -> Vec<IndexValue> {
    match leaf {
        JsonValue::String(s) => vec![IndexValue::Uri(s.clone())],
        _ => Vec::new(),
    }
}

fn decimal_of(value: &JsonValue) -> Option<Decimal> {
    match value {
        JsonValue::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        JsonValue::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

/// Expand an instant or calendar date to the interval it denotes.
fn date_range(raw: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        let instant = instant.with_timezone(&Utc);
        return Some((instant, instant));
    }

    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let start = date.and_hms_opt(0, 0, 0)?.and_utc();
    let end = date.and_hms_micro_opt(23, 59, 59, 999_999)?.and_utc();
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchParamStatus;

    fn param(code: &str, kind: SearchParamKind, expression: &str) -> SearchParamInfo {
        SearchParamInfo {
            url: format!("http://hl7.org/fhir/SearchParameter/Observation-{code}"),
            code: code.to_string(),
            kind,
            expression: Some(expression.to_string()),
            base: vec!["Observation".to_string()],
            status: SearchParamStatus::Searchable,
        }
    }

    #[test]
    fn extracts_tokens_from_codeable_concepts() {
        let raw = br#"{
            "resourceType": "Observation",
            "code": {"coding": [
                {"system": "http://loinc.org", "code": "8867-4"},
                {"system": "http://loinc.org", "code": "8867-4"}
            ]}
        }"#;

        let rows = JsonIndexer::new()
            .extract(
                "Observation",
                raw,
                &[param("code", SearchParamKind::Token, "Observation.code")],
            )
            .unwrap();

        assert_eq!(rows.len(), 1, "duplicate codings collapse");
        let row = rows.iter().next().unwrap();
        assert!(matches!(&row.value, IndexValue::Token { code, .. } if code == "8867-4"));
    }

    #[test]
    fn extracts_references_and_splits_target() {
        let raw = br#"{"resourceType": "Observation", "subject": {"reference": "Patient/p1"}}"#;
        let rows = JsonIndexer::new()
            .extract(
                "Observation",
                raw,
                &[param(
                    "subject",
                    SearchParamKind::Reference,
                    "Observation.subject",
                )],
            )
            .unwrap();

        let row = rows.iter().next().expect("one row");
        assert_eq!(
            row.value,
            IndexValue::Reference {
                target_type: Some("Patient".into()),
                target_id: "p1".into()
            }
        );
    }

    #[test]
    fn extracts_quantities_with_decimal_values() {
        let raw = br#"{
            "resourceType": "Observation",
            "valueQuantity": {"value": 72.5, "system": "http://unitsofmeasure.org", "code": "/min"}
        }"#;
        let rows = JsonIndexer::new()
            .extract(
                "Observation",
                raw,
                &[param(
                    "value-quantity",
                    SearchParamKind::Quantity,
                    "Observation.valueQuantity",
                )],
            )
            .unwrap();

        let row = rows.iter().next().expect("one row");
        match &row.value {
            IndexValue::Quantity { value, code, .. } => {
                assert_eq!(*value, Decimal::from_str("72.5").unwrap());
                assert_eq!(code.as_deref(), Some("/min"));
            }
            other => panic!("expected quantity, got {other:?}"),
        }
    }

    #[test]
    fn calendar_dates_expand_to_day_ranges() {
        let raw = br#"{"resourceType": "Observation", "effectiveDateTime": "2024-03-01"}"#;
        let rows = JsonIndexer::new()
            .extract(
                "Observation",
                raw,
                &[param(
                    "date",
                    SearchParamKind::Date,
                    "Observation.effectiveDateTime",
                )],
            )
            .unwrap();

        let row = rows.iter().next().expect("one row");
        match &row.value {
            IndexValue::Date { start, end } => {
                assert!(start < end);
                assert_eq!(start.date_naive().to_string(), "2024-03-01");
                assert_eq!(end.date_naive().to_string(), "2024-03-01");
            }
            other => panic!("expected date, got {other:?}"),
        }
    }

    #[test]
    fn arrays_flatten_at_every_step() {
        let raw = br#"{
            "resourceType": "Patient",
            "name": [{"given": ["Ada", "Grace"]}, {"given": ["Lin"]}]
        }"#;
        let mut p = param("given", SearchParamKind::String, "Patient.name.given");
        p.base = vec!["Patient".to_string()];

        let rows = JsonIndexer::new().extract("Patient", raw, &[p]).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn non_json_payloads_yield_no_rows() {
        let rows = JsonIndexer::new()
            .extract(
                "Observation",
                b"<Observation/>",
                &[param("code", SearchParamKind::Token, "Observation.code")],
            )
            .unwrap();
        assert!(rows.is_empty());
    }
}
