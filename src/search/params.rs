//! Search-parameter definitions, lifecycle states, and the support oracle.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;

/// Lifecycle state of an extraction rule. Only `Searchable` rules are honored
/// by the query layer; `Supported` rules can be materialized but are not yet
/// proven complete across persisted resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParamStatus {
    Supported,
    Searchable,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParamKind {
    Token,
    String,
    Reference,
    Quantity,
    Date,
    Number,
    Uri,
    Composite,
}

impl SearchParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchParamKind::Token => "token",
            SearchParamKind::String => "string",
            SearchParamKind::Reference => "reference",
            SearchParamKind::Quantity => "quantity",
            SearchParamKind::Date => "date",
            SearchParamKind::Number => "number",
            SearchParamKind::Uri => "uri",
            SearchParamKind::Composite => "composite",
        }
    }
}

/// A named extraction rule over resource payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParamInfo {
    /// Canonical URL; the stable identity of the rule.
    pub url: String,
    pub code: String,
    pub kind: SearchParamKind,
    /// Path expression evaluated against the payload. `None` for parameters
    /// the extraction layer computes specially.
    pub expression: Option<String>,
    /// Resource types the rule applies to.
    pub base: Vec<String>,
    pub status: SearchParamStatus,
}

impl SearchParamInfo {
    pub fn applies_to(&self, resource_type: &str) -> bool {
        self.base.iter().any(|b| b == resource_type || b == "Resource")
    }

    /// Materializable means extraction can run for it, whether or not the
    /// query layer honors it yet.
    pub fn is_materializable(&self) -> bool {
        !matches!(self.status, SearchParamStatus::Disabled)
    }
}

/// Deterministic fingerprint of the materializable rule set for one type.
///
/// A record whose persisted hash differs from the current value has stale
/// index rows and is reindex-eligible.
pub fn param_set_hash<'a>(params: impl IntoIterator<Item = &'a SearchParamInfo>) -> String {
    let mut lines: Vec<String> = params
        .into_iter()
        .filter(|p| p.is_materializable())
        .map(|p| {
            format!(
                "{}|{}|{}",
                p.url,
                p.kind.as_str(),
                p.expression.as_deref().unwrap_or("")
            )
        })
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Read-only oracle over the search-parameter lifecycle, plus the single
/// mutation the reindex coordinator is allowed: promotion to `Searchable`.
#[async_trait]
pub trait SupportResolver: Send + Sync {
    async fn searchable_parameters(&self, resource_type: &str) -> Result<Vec<SearchParamInfo>>;

    async fn supported_but_not_searchable(
        &self,
        resource_type: &str,
    ) -> Result<Vec<SearchParamInfo>>;

    /// Resource types that have at least one `Supported` (pending) rule.
    async fn types_with_pending_parameters(&self) -> Result<Vec<String>>;

    /// Deterministic hash over the currently-materializable rules for `type`.
    async fn hash(&self, resource_type: &str) -> Result<String>;

    /// Mark the given URLs `Searchable` and persist the change.
    async fn promote(&self, urls: &[String]) -> Result<()>;
}

/// In-memory parameter registry.
///
/// Backs tests and embedded deployments; the conformance layer hydrates it
/// from whatever definition source it owns.
#[derive(Default)]
pub struct SearchParamRegistry {
    params: RwLock<HashMap<String, SearchParamInfo>>,
}

impl SearchParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, param: SearchParamInfo) {
        let mut params = self.params.write().unwrap();
        params.insert(param.url.clone(), param);
    }

    pub fn set_status(&self, url: &str, status: SearchParamStatus) {
        let mut params = self.params.write().unwrap();
        if let Some(param) = params.get_mut(url) {
            param.status = status;
        }
    }

    fn for_type(&self, resource_type: &str) -> Vec<SearchParamInfo> {
        let params = self.params.read().unwrap();
        let mut matching: Vec<SearchParamInfo> = params
            .values()
            .filter(|p| p.applies_to(resource_type))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.url.cmp(&b.url));
        matching
    }
}

#[async_trait]
impl SupportResolver for SearchParamRegistry {
    async fn searchable_parameters(&self, resource_type: &str) -> Result<Vec<SearchParamInfo>> {
        Ok(self
            .for_type(resource_type)
            .into_iter()
            .filter(|p| p.status == SearchParamStatus::Searchable)
            .collect())
    }

    async fn supported_but_not_searchable(
        &self,
        resource_type: &str,
    ) -> Result<Vec<SearchParamInfo>> {
        Ok(self
            .for_type(resource_type)
            .into_iter()
            .filter(|p| p.status == SearchParamStatus::Supported)
            .collect())
    }

    async fn types_with_pending_parameters(&self) -> Result<Vec<String>> {
        let params = self.params.read().unwrap();
        let mut types: Vec<String> = params
            .values()
            .filter(|p| p.status == SearchParamStatus::Supported)
            .flat_map(|p| p.base.iter().cloned())
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    async fn hash(&self, resource_type: &str) -> Result<String> {
        Ok(param_set_hash(self.for_type(resource_type).iter()))
    }

    async fn promote(&self, urls: &[String]) -> Result<()> {
        let mut params = self.params.write().unwrap();
        for url in urls {
            if let Some(param) = params.get_mut(url) {
                if param.status == SearchParamStatus::Supported {
                    param.status = SearchParamStatus::Searchable;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(url: &str, status: SearchParamStatus) -> SearchParamInfo {
        SearchParamInfo {
            url: url.to_string(),
            code: "code".to_string(),
            kind: SearchParamKind::Token,
            expression: Some("Observation.code".to_string()),
            base: vec!["Observation".to_string()],
            status,
        }
    }

    #[test]
    fn hash_is_order_independent() {
        let a = param("http://example.org/a", SearchParamStatus::Searchable);
        let b = param("http://example.org/b", SearchParamStatus::Supported);
        assert_eq!(param_set_hash([&a, &b]), param_set_hash([&b, &a]));
    }

    #[test]
    fn hash_ignores_disabled_rules() {
        let a = param("http://example.org/a", SearchParamStatus::Searchable);
        let d = param("http://example.org/d", SearchParamStatus::Disabled);
        assert_eq!(param_set_hash([&a, &d]), param_set_hash([&a]));
    }

    #[test]
    fn hash_changes_when_a_rule_is_added() {
        let a = param("http://example.org/a", SearchParamStatus::Searchable);
        let b = param("http://example.org/b", SearchParamStatus::Supported);
        assert_ne!(param_set_hash([&a]), param_set_hash([&a, &b]));
    }

    #[tokio::test]
    async fn promote_moves_supported_to_searchable() {
        let registry = SearchParamRegistry::new();
        registry.register(param("http://example.org/a", SearchParamStatus::Supported));

        registry
            .promote(&["http://example.org/a".to_string()])
            .await
            .unwrap();

        let searchable = registry.searchable_parameters("Observation").await.unwrap();
        assert_eq!(searchable.len(), 1);
        assert!(registry
            .supported_but_not_searchable("Observation")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn promotion_does_not_change_the_hash() {
        // The hash covers materializable rules; promotion only flips the
        // lifecycle state.
        let registry = SearchParamRegistry::new();
        registry.register(param("http://example.org/a", SearchParamStatus::Supported));
        let before = registry.hash("Observation").await.unwrap();

        registry
            .promote(&["http://example.org/a".to_string()])
            .await
            .unwrap();

        assert_eq!(registry.hash("Observation").await.unwrap(), before);
    }
}
