//! In-memory `ResourceStore`/`IndexWriter` implementation.
//!
//! Backs deterministic tests and embedded deployments. Concurrency follows
//! the same contract as the PostgreSQL backend: every write is a conditional
//! replace keyed on a storage-level row version, and the upsert path retries
//! on conflict instead of holding a per-record lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::traits::{
    patch_meta_on_read, stamp_time, IndexWriter, ResourceStore, UpsertKind, UpsertOptions,
    UpsertOutcome,
};
use crate::models::{embed_meta, Record, RequestMethod, ResourceKey};
use crate::{Error, Result};

#[derive(Debug)]
struct Entity {
    versions: BTreeMap<i32, Record>,
    current: i32,
    /// Storage-level row version; bumped on every mutation of the entity.
    row_version: u64,
}

impl Entity {
    fn current_record(&self) -> &Record {
        // The current pointer always names an existing version.
        &self.versions[&self.current]
    }
}

#[derive(Default)]
pub struct MemoryResourceStore {
    entities: RwLock<HashMap<(String, String), Entity>>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entity_key(resource_type: &str, id: &str) -> (String, String) {
        (resource_type.to_string(), id.to_string())
    }

    /// Current row and its storage-level row version, if the entity exists.
    fn snapshot(&self, resource_type: &str, id: &str) -> Option<(Record, u64)> {
        let entities = self.entities.read().unwrap();
        entities
            .get(&Self::entity_key(resource_type, id))
            .map(|e| (e.current_record().clone(), e.row_version))
    }

    /// Blind insert of version 1. Fails on any existing entity.
    fn try_insert(&self, record: Record) -> bool {
        let mut entities = self.entities.write().unwrap();
        let key = Self::entity_key(&record.resource_type, &record.id);
        if entities.contains_key(&key) {
            return false;
        }
        let mut versions = BTreeMap::new();
        versions.insert(record.version_id, record);
        entities.insert(
            key,
            Entity {
                versions,
                current: 1,
                row_version: 1,
            },
        );
        true
    }

    /// Conditional replace of the current row, keyed on the row version.
    fn try_replace(&self, record: Record, expected_row_version: u64, keep_history: bool) -> bool {
        let mut entities = self.entities.write().unwrap();
        let key = Self::entity_key(&record.resource_type, &record.id);
        let Some(entity) = entities.get_mut(&key) else {
            return false;
        };
        if entity.row_version != expected_row_version {
            return false;
        }

        let old_current = entity.current;
        if keep_history {
            // Index rows exist only for the current version.
            if let Some(old) = entity.versions.get_mut(&old_current) {
                old.index_rows.clear();
            }
        } else {
            entity.versions.remove(&old_current);
        }

        entity.current = record.version_id;
        entity.versions.insert(record.version_id, record);
        entity.row_version += 1;
        true
    }

    /// Assign store-owned fields for the version being written.
    fn prepare(&self, mut record: Record, version_id: i32) -> Record {
        record.version_id = version_id;
        record.last_updated = stamp_time(Utc::now());
        record.meta_embedded = false;

        if record.deleted {
            // Tombstones carry no index rows and no payload meta.
            record.index_rows.clear();
            record.search_param_hash = None;
        } else if let Some(patched) = embed_meta(&record.raw, version_id, record.last_updated) {
            record.raw = patched;
            record.meta_embedded = true;
        }

        record
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn upsert(&self, incoming: Record, options: UpsertOptions) -> Result<UpsertOutcome> {
        if incoming.resource_type.is_empty() || incoming.id.is_empty() {
            return Err(Error::RequestNotValid(
                "Resource type and id are required".to_string(),
            ));
        }

        // First attempt: blind insert when the caller has no expectation and
        // creation is allowed. A uniqueness collision falls through to the
        // optimistic loop.
        if options.if_match.is_none() && options.allow_create && !incoming.deleted {
            let prepared = self.prepare(incoming.clone(), 1);
            if self.try_insert(prepared.clone()) {
                return Ok(UpsertOutcome {
                    kind: UpsertKind::Created,
                    key: prepared.key(),
                    last_updated: Some(prepared.last_updated),
                });
            }
        }

        loop {
            match self.snapshot(&incoming.resource_type, &incoming.id) {
                None => {
                    if options.if_match.is_some() {
                        // The caller expects a version that no longer exists.
                        return Err(Error::ResourceNotFound {
                            resource_type: incoming.resource_type.clone(),
                            id: incoming.id.clone(),
                        });
                    }
                    if !options.allow_create {
                        return Err(Error::MethodNotAllowed(
                            "Resource creation is not allowed for this call".to_string(),
                        ));
                    }
                    let prepared = self.prepare(incoming.clone(), 1);
                    if self.try_insert(prepared.clone()) {
                        return Ok(UpsertOutcome {
                            kind: UpsertKind::Created,
                            key: prepared.key(),
                            last_updated: Some(prepared.last_updated),
                        });
                    }
                }
                Some((current, row_version)) => {
                    if let Some(expected) = options.if_match {
                        if expected != current.version_id {
                            return Err(Error::VersionConflict {
                                expected,
                                actual: current.version_id,
                            });
                        }
                    }

                    if current.deleted && incoming.deleted {
                        // Deleting the deleted: nothing to write.
                        return Ok(UpsertOutcome {
                            kind: UpsertKind::Updated,
                            key: ResourceKey::new(
                                incoming.resource_type.clone(),
                                incoming.id.clone(),
                            ),
                            last_updated: None,
                        });
                    }

                    let prepared = self.prepare(incoming.clone(), current.version_id + 1);
                    if self.try_replace(prepared.clone(), row_version, options.keep_history) {
                        return Ok(UpsertOutcome {
                            kind: UpsertKind::Updated,
                            key: prepared.key(),
                            last_updated: Some(prepared.last_updated),
                        });
                    }
                }
            }

            // Lost the race; re-read and try again.
            tokio::task::yield_now().await;
        }
    }

    async fn get(&self, key: &ResourceKey) -> Result<Record> {
        let entities = self.entities.read().unwrap();
        let entity = entities
            .get(&Self::entity_key(&key.resource_type, &key.id))
            .ok_or_else(|| Error::ResourceNotFound {
                resource_type: key.resource_type.clone(),
                id: key.id.clone(),
            })?;

        match key.version_id {
            Some(version_id) => {
                let record =
                    entity
                        .versions
                        .get(&version_id)
                        .ok_or_else(|| Error::VersionNotFound {
                            resource_type: key.resource_type.clone(),
                            id: key.id.clone(),
                            version_id,
                        })?;
                Ok(patch_meta_on_read(record.clone()))
            }
            None => {
                let current = entity.current_record();
                if current.deleted {
                    return Err(Error::ResourceDeleted {
                        resource_type: key.resource_type.clone(),
                        id: key.id.clone(),
                        version_id: Some(current.version_id),
                    });
                }
                Ok(patch_meta_on_read(current.clone()))
            }
        }
    }

    async fn delete(&self, key: &ResourceKey, hard: bool) -> Result<Option<i32>> {
        if key.version_id.is_some() {
            return Err(Error::MethodNotAllowed(
                "Deleting a specific version is not allowed".to_string(),
            ));
        }

        if hard {
            let mut entities = self.entities.write().unwrap();
            entities.remove(&Self::entity_key(&key.resource_type, &key.id));
            return Ok(None);
        }

        loop {
            let Some((current, row_version)) = self.snapshot(&key.resource_type, &key.id) else {
                return Ok(None);
            };
            if current.deleted {
                return Ok(None);
            }

            let mut tombstone = Record::new(
                key.resource_type.clone(),
                key.id.clone(),
                Vec::new(),
                RequestMethod::Delete,
            );
            tombstone.deleted = true;
            let tombstone = self.prepare(tombstone, current.version_id + 1);
            let new_version = tombstone.version_id;
            if self.try_replace(tombstone, row_version, true) {
                return Ok(Some(new_version));
            }

            tokio::task::yield_now().await;
        }
    }

    async fn history(&self, resource_type: &str, id: &str) -> Result<Vec<Record>> {
        let entities = self.entities.read().unwrap();
        Ok(entities
            .get(&Self::entity_key(resource_type, id))
            .map(|e| {
                e.versions
                    .values()
                    .rev()
                    .cloned()
                    .map(patch_meta_on_read)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_types(&self) -> Result<Vec<String>> {
        let entities = self.entities.read().unwrap();
        let mut types: Vec<String> = entities.keys().map(|(t, _)| t.clone()).collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    async fn count_current(&self, resource_type: &str) -> Result<i64> {
        let entities = self.entities.read().unwrap();
        Ok(entities
            .iter()
            .filter(|((t, _), e)| t == resource_type && !e.current_record().deleted)
            .count() as i64)
    }

    async fn page_current(
        &self,
        resource_type: &str,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let entities = self.entities.read().unwrap();
        let mut page: Vec<Record> = entities
            .iter()
            .filter(|((t, id), e)| {
                t == resource_type
                    && !e.current_record().deleted
                    && after_id.map_or(true, |after| id.as_str() > after)
            })
            .map(|(_, e)| e.current_record().clone())
            .collect();
        page.sort_by(|a, b| a.id.cmp(&b.id));
        page.truncate(limit);
        Ok(page.into_iter().map(patch_meta_on_read).collect())
    }
}

impl MemoryResourceStore {
    /// Shared precondition check for the index write path. Must run under the
    /// write lock that also applies the mutation.
    fn check_index_target(
        entities: &HashMap<(String, String), Entity>,
        record: &Record,
        if_match: i32,
    ) -> Result<()> {
        let entity = entities
            .get(&Self::entity_key(&record.resource_type, &record.id))
            .ok_or_else(|| Error::ResourceNotFound {
                resource_type: record.resource_type.clone(),
                id: record.id.clone(),
            })?;

        let current = entity.current_record();
        if current.deleted {
            return Err(Error::ResourceNotFound {
                resource_type: record.resource_type.clone(),
                id: record.id.clone(),
            });
        }
        if current.version_id != if_match {
            return Err(Error::VersionConflict {
                expected: if_match,
                actual: current.version_id,
            });
        }
        Ok(())
    }

    fn apply_index_update(entities: &mut HashMap<(String, String), Entity>, record: &Record) {
        let entity = entities
            .get_mut(&Self::entity_key(&record.resource_type, &record.id))
            .expect("target checked under the same lock");
        let current = entity.current;
        let stored = entity.versions.get_mut(&current).expect("current exists");
        stored.search_param_hash = record.search_param_hash.clone();
        stored.index_rows = record.index_rows.clone();
        entity.row_version += 1;
    }
}

#[async_trait]
impl IndexWriter for MemoryResourceStore {
    async fn update_index(&self, record: &Record, if_match: i32) -> Result<()> {
        let mut entities = self.entities.write().unwrap();
        Self::check_index_target(&entities, record, if_match)?;
        Self::apply_index_update(&mut entities, record);
        Ok(())
    }

    async fn update_indices_batch(&self, records: &[Record]) -> Result<()> {
        let mut entities = self.entities.write().unwrap();
        // Atomic batch precondition: validate everything before touching
        // anything.
        for record in records {
            Self::check_index_target(&entities, record, record.version_id)?;
        }
        for record in records {
            Self::apply_index_update(&mut entities, record);
        }
        Ok(())
    }
}
