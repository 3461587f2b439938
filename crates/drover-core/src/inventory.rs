//! Inventory construction: record and object indexes.
//!
//! Builds the in-memory view every later phase works from. Read-only
//! against the backends; the only outputs are the indexes and the
//! record/object classifications.

use crate::cancel::CancellationToken;
use crate::config::MigrationConfig;
use crate::error::Result;
use crate::metadata::MetadataRepository;
use crate::model::{ObjectClass, ObjectKey, ObjectMeta, Record, RecordClass};
use crate::naming;
use crate::recovery::ErrorRecoveryManager;
use crate::storage::StorageLocationClient;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Indexed view of all records and discovered objects.
#[derive(Debug, Default)]
pub struct Inventory {
    /// Records by identifier.
    pub records: HashMap<String, Record>,
    /// Record ids by normalized filename.
    pub records_by_filename: HashMap<String, Vec<String>>,
    /// Discovered objects by (location, path).
    pub objects: HashMap<ObjectKey, ObjectMeta>,
    /// Object keys by normalized filename.
    pub objects_by_filename: HashMap<String, Vec<ObjectKey>>,
    /// Object keys by extension family.
    pub objects_by_family: HashMap<String, Vec<ObjectKey>>,
    /// Classification of every record.
    pub record_classes: HashMap<String, RecordClass>,
    /// Live record ids referencing each object.
    pub live_refs: HashMap<ObjectKey, Vec<String>>,
}

impl Inventory {
    /// Classification of a discovered object.
    pub fn object_class(&self, key: &ObjectKey) -> ObjectClass {
        if self.live_refs.get(key).is_some_and(|refs| !refs.is_empty()) {
            ObjectClass::Referenced
        } else {
            ObjectClass::Orphaned
        }
    }

    /// Broken records, ordered by id for stable batching.
    pub fn broken_records(&self) -> Vec<&Record> {
        let mut broken: Vec<&Record> = self
            .record_classes
            .iter()
            .filter(|(_, class)| **class == RecordClass::Broken)
            .filter_map(|(id, _)| self.records.get(id))
            .collect();
        broken.sort_by(|a, b| a.id.cmp(&b.id));
        broken
    }

    /// Objects referenced by more than one live record, ordered by key.
    pub fn duplicate_groups(&self) -> Vec<(ObjectKey, Vec<String>)> {
        let mut groups: Vec<(ObjectKey, Vec<String>)> = self
            .live_refs
            .iter()
            .filter(|(_, refs)| refs.len() > 1)
            .map(|(key, refs)| {
                let mut ids = refs.clone();
                ids.sort();
                (key.clone(), ids)
            })
            .collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        groups
    }

    /// Discovered objects with no live reference, ordered by key.
    pub fn orphaned_objects(&self) -> Vec<&ObjectMeta> {
        let mut orphans: Vec<&ObjectMeta> = self
            .objects
            .values()
            .filter(|meta| self.object_class(&meta.key()) == ObjectClass::Orphaned)
            .collect();
        orphans.sort_by(|a, b| a.key().cmp(&b.key()));
        orphans
    }

    /// Live, resolvable records, ordered by id.
    pub fn linked_records(&self) -> Vec<&Record> {
        let mut linked: Vec<&Record> = self
            .record_classes
            .iter()
            .filter(|(_, class)| **class != RecordClass::Broken)
            .filter_map(|(id, _)| self.records.get(id))
            .filter(|record| record.live)
            .collect();
        linked.sort_by(|a, b| a.id.cmp(&b.id));
        linked
    }

    /// Repoint a record at a new object, updating classes and references.
    ///
    /// Called by link repair and consolidation so later phases see the
    /// post-mutation world without rebuilding.
    pub fn relink(&mut self, record_id: &str, new_key: ObjectKey, canonical_location: &str) {
        let Some(record) = self.records.get_mut(record_id) else {
            return;
        };
        let old_key = record.object_key();
        record.location = new_key.location.clone();
        record.path = new_key.path.clone();

        if let Some(refs) = self.live_refs.get_mut(&old_key) {
            refs.retain(|id| id != record_id);
        }
        if record.live {
            self.live_refs
                .entry(new_key.clone())
                .or_default()
                .push(record_id.to_string());
        }

        let class = if self.objects.contains_key(&new_key) {
            if new_key.location == canonical_location {
                RecordClass::LinkedCorrect
            } else {
                RecordClass::LinkedWrongLocation
            }
        } else {
            RecordClass::Broken
        };
        self.record_classes.insert(record_id.to_string(), class);
    }

    /// Record that an object moved, rekeying the object index.
    pub fn object_moved(&mut self, from: &ObjectKey, to: ObjectKey) {
        if let Some(mut meta) = self.objects.remove(from) {
            meta.location = to.location.clone();
            meta.path = to.path.clone();
            self.objects.insert(to.clone(), meta);
        }
        if let Some(refs) = self.live_refs.remove(from) {
            self.live_refs.entry(to).or_default().extend(refs);
        }
    }

    /// Drop an object from every index (moved out of migration scope).
    pub fn remove_object(&mut self, key: &ObjectKey) {
        if let Some(meta) = self.objects.remove(key) {
            let normalized = meta.normalized_filename();
            if let Some(keys) = self.objects_by_filename.get_mut(&normalized) {
                keys.retain(|k| k != key);
            }
            if let Some(ext) = naming::extension(meta.filename()) {
                let family = naming::extension_family(&ext);
                if let Some(keys) = self.objects_by_family.get_mut(&family) {
                    keys.retain(|k| k != key);
                }
            }
        }
        self.live_refs.remove(key);
    }

    /// Drop a record from every index (verified duplicate cleanup).
    pub fn remove_record(&mut self, record_id: &str) {
        if let Some(record) = self.records.remove(record_id) {
            let key = record.object_key();
            if let Some(refs) = self.live_refs.get_mut(&key) {
                refs.retain(|id| id != record_id);
            }
            let normalized = record.normalized_filename();
            if let Some(ids) = self.records_by_filename.get_mut(&normalized) {
                ids.retain(|id| id != record_id);
            }
        }
        self.record_classes.remove(record_id);
    }
}

/// Builds the inventory from the repository and the configured locations.
pub struct InventoryBuilder {
    storage: Arc<dyn StorageLocationClient>,
    repo: Arc<dyn MetadataRepository>,
    recovery: Arc<ErrorRecoveryManager>,
    config: MigrationConfig,
}

impl InventoryBuilder {
    pub fn new(
        storage: Arc<dyn StorageLocationClient>,
        repo: Arc<dyn MetadataRepository>,
        recovery: Arc<ErrorRecoveryManager>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            storage,
            repo,
            recovery,
            config,
        }
    }

    /// Build the full inventory.
    ///
    /// Objects are discovered by listing every configured location;
    /// records come from the repository. Listing is retried like any
    /// other object operation.
    pub async fn build(&self, cancel: &CancellationToken) -> Result<Inventory> {
        let mut inventory = Inventory::default();

        for location in &self.config.locations {
            cancel.check()?;
            let storage = self.storage.clone();
            let objects = self
                .recovery
                .execute_with_retry("list", || {
                    let storage = storage.clone();
                    let location = location.clone();
                    async move { storage.list(&location, "").await }
                })
                .await?;
            debug!(location = %location, count = objects.len(), "indexed location");

            for meta in objects {
                let key = meta.key();
                let normalized = meta.normalized_filename();
                inventory
                    .objects_by_filename
                    .entry(normalized.clone())
                    .or_default()
                    .push(key.clone());
                if let Some(ext) = naming::extension(meta.filename()) {
                    inventory
                        .objects_by_family
                        .entry(naming::extension_family(&ext))
                        .or_default()
                        .push(key.clone());
                }
                inventory.objects.insert(key, meta);
            }
        }

        let records = self.repo.all_records().await?;
        for batch in records.chunks(self.config.batch_size.max(1)) {
            cancel.check()?;
            for record in batch {
                let key = record.object_key();
                let class = if inventory.objects.contains_key(&key) {
                    if record.location == self.config.canonical_location {
                        RecordClass::LinkedCorrect
                    } else {
                        RecordClass::LinkedWrongLocation
                    }
                } else {
                    RecordClass::Broken
                };
                inventory
                    .record_classes
                    .insert(record.id.clone(), class);

                if record.live {
                    inventory
                        .live_refs
                        .entry(key)
                        .or_default()
                        .push(record.id.clone());
                }

                inventory
                    .records_by_filename
                    .entry(record.normalized_filename())
                    .or_default()
                    .push(record.id.clone());
                inventory.records.insert(record.id.clone(), record.clone());
            }
        }

        // Stable reference order keeps duplicate-group iteration
        // deterministic across rebuilds.
        for refs in inventory.live_refs.values_mut() {
            refs.sort();
        }

        info!(
            records = inventory.records.len(),
            objects = inventory.objects.len(),
            broken = inventory
                .record_classes
                .values()
                .filter(|c| **c == RecordClass::Broken)
                .count(),
            "inventory built"
        );
        Ok(inventory)
    }
}
