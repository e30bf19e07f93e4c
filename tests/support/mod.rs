#![allow(unused)]
//! Shared helpers for integration tests: an in-memory engine wired the way
//! the service layer wires the real one.

use std::sync::Arc;

use flint::db::{
    IndexWriter, JobStore, MemoryJobStore, MemoryResourceStore, ResourceStore, StoreBackend,
    UpsertOptions, UpsertOutcome,
};
use flint::models::{Record, RequestMethod};
use flint::reindex::{AdaptiveThrottle, ReindexContext, ThrottleOracle};
use flint::search::{
    JsonIndexer, SearchIndexer, SearchParamInfo, SearchParamKind, SearchParamRegistry,
    SearchParamStatus, SupportResolver,
};
use flint::Result;

pub struct TestEnv {
    pub store: Arc<MemoryResourceStore>,
    pub jobs: Arc<MemoryJobStore>,
    pub registry: Arc<SearchParamRegistry>,
    pub indexer: Arc<JsonIndexer>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryResourceStore::new()),
            jobs: Arc::new(MemoryJobStore::new()),
            registry: Arc::new(SearchParamRegistry::new()),
            indexer: Arc::new(JsonIndexer::new()),
        }
    }

    /// Upsert the way the write path does it: extract index rows under the
    /// current materializable rule set and stamp the current hash.
    pub async fn write(
        &self,
        resource_type: &str,
        id: &str,
        payload: Vec<u8>,
        options: UpsertOptions,
    ) -> Result<UpsertOutcome> {
        let mut params = self.registry.searchable_parameters(resource_type).await?;
        params.extend(
            self.registry
                .supported_but_not_searchable(resource_type)
                .await?,
        );
        let rows = self.indexer.extract(resource_type, &payload, &params)?;
        let hash = self.registry.hash(resource_type).await?;

        let record = Record::new(resource_type, id, payload, RequestMethod::Put)
            .with_index(hash, rows);
        self.store.upsert(record, options).await
    }

    pub fn ctx(&self, throttle: Arc<dyn ThrottleOracle>) -> ReindexContext {
        ReindexContext {
            store: self.store.clone() as Arc<dyn StoreBackend>,
            jobs: self.jobs.clone() as Arc<dyn JobStore>,
            resolver: self.registry.clone() as Arc<dyn SupportResolver>,
            indexer: self.indexer.clone() as Arc<dyn SearchIndexer>,
            throttle,
        }
    }

    pub fn default_ctx(&self) -> ReindexContext {
        self.ctx(Arc::new(AdaptiveThrottle::new(100)))
    }
}

pub fn observation_payload(id: &str, code: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "resourceType": "Observation",
        "id": id,
        "status": "final",
        "code": {
            "coding": [{"system": "http://loinc.org", "code": code}]
        },
        "subject": {"reference": format!("Patient/{id}-subject")},
        "effectiveDateTime": "2024-01-15T08:30:00Z"
    }))
    .unwrap()
}

pub fn patient_payload(id: &str, family: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "resourceType": "Patient",
        "id": id,
        "name": [{"family": family, "given": ["Alex"]}]
    }))
    .unwrap()
}

pub fn code_param(status: SearchParamStatus) -> SearchParamInfo {
    SearchParamInfo {
        url: "http://hl7.org/fhir/SearchParameter/Observation-code".to_string(),
        code: "code".to_string(),
        kind: SearchParamKind::Token,
        expression: Some("Observation.code".to_string()),
        base: vec!["Observation".to_string()],
        status,
    }
}

pub fn subject_param(status: SearchParamStatus) -> SearchParamInfo {
    SearchParamInfo {
        url: "http://hl7.org/fhir/SearchParameter/Observation-subject".to_string(),
        code: "subject".to_string(),
        kind: SearchParamKind::Reference,
        expression: Some("Observation.subject".to_string()),
        base: vec!["Observation".to_string()],
        status,
    }
}

pub fn date_param(status: SearchParamStatus) -> SearchParamInfo {
    SearchParamInfo {
        url: "http://hl7.org/fhir/SearchParameter/Observation-date".to_string(),
        code: "date".to_string(),
        kind: SearchParamKind::Date,
        expression: Some("Observation.effectiveDateTime".to_string()),
        base: vec!["Observation".to_string()],
        status,
    }
}
