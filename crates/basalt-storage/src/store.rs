//! The versioned resource store.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use basalt_core::id::{is_valid_id, new_resource_id};
use basalt_core::time::{format_instant, now_utc};

use crate::error::{StorageError, StorageResult};
use crate::indexer::MetadataIndexer;
use crate::types::{
    DeleteOutcome, HistoryEntry, HistoryMethod, HistoryPage, HistoryParams, MetadataEntry,
    ParamKind, RowStatus, SummaryMode, VersionedResource,
};

pub type StorageKey = String; // Format: "ResourceType/id"

pub(crate) fn make_storage_key(resource_type: &str, id: &str) -> StorageKey {
    format!("{resource_type}/{id}")
}

/// Version chains and the metadata index, guarded together so a mutation
/// commits its new version row and the regenerated index in one critical
/// section with no partially visible state.
#[derive(Debug, Default)]
struct StoreInner {
    /// Version rows per resource, ascending by version id.
    chains: HashMap<StorageKey, Vec<VersionedResource>>,
    /// Metadata rows for the current valid version only.
    index: HashMap<StorageKey, Vec<MetadataEntry>>,
}

/// Versioned CRUD over resource instances.
///
/// Every mutation appends a new immutable version row; the `(type, id,
/// version)` contiguity constraint is checked at commit time inside the
/// write lock, so two racing writers produce one winner and one
/// `VersionConflict` instead of silent loss.
pub struct ResourceStore {
    inner: RwLock<StoreInner>,
    indexer: Arc<dyn MetadataIndexer>,
    base_url: String,
}

impl ResourceStore {
    pub fn new(indexer: Arc<dyn MetadataIndexer>, base_url: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            indexer,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ==================== CRUD ====================

    /// Creates a new resource at version 1, or at `current + 1` when a
    /// client-assigned id points at a deleted chain. A valid current row
    /// under the same id is a conflict.
    pub async fn create(
        &self,
        resource_type: &str,
        body: Value,
        explicit_id: Option<&str>,
    ) -> StorageResult<VersionedResource> {
        check_body_type(resource_type, &body)?;

        let mut inner = self.inner.write().await;
        let (id, version) = match explicit_id {
            Some(id) => {
                if !is_valid_id(id) {
                    return Err(StorageError::invalid_resource(format!(
                        "invalid resource id '{id}'"
                    )));
                }
                let key = make_storage_key(resource_type, id);
                match inner.chains.get(&key).and_then(|c| c.last()) {
                    Some(current) if !current.is_deleted() => {
                        return Err(StorageError::already_exists(resource_type, id));
                    }
                    Some(current) => (id.to_string(), current.version_id + 1),
                    None => (id.to_string(), 1),
                }
            }
            None => (new_resource_id(), 1),
        };

        let row = self.make_row(resource_type, &id, version, RowStatus::Valid, body)?;
        self.commit_row(&mut inner, row.clone())?;
        debug!(resource_type, id = %row.id, version, "created resource");
        Ok(row)
    }

    /// Reads the current version. `Gone` if the current row is a
    /// tombstone, `NotFound` if no chain exists.
    pub async fn read(&self, resource_type: &str, id: &str) -> StorageResult<VersionedResource> {
        let inner = self.inner.read().await;
        let key = make_storage_key(resource_type, id);
        match inner.chains.get(&key).and_then(|c| c.last()) {
            Some(current) if current.is_deleted() => Err(StorageError::gone(resource_type, id)),
            Some(current) => Ok(current.clone()),
            None => Err(StorageError::not_found(resource_type, id)),
        }
    }

    /// Reads the current version with `_summary` filtering applied to a
    /// copy of the body. The stored row is never mutated.
    pub async fn read_summary(
        &self,
        resource_type: &str,
        id: &str,
        mode: SummaryMode,
    ) -> StorageResult<VersionedResource> {
        let mut row = self.read(resource_type, id).await?;
        row.content = apply_summary(&row.content, mode);
        Ok(row)
    }

    /// Reads an exact version. The OK/Gone/NotFound rule applies to the
    /// requested version's own status, not the current one.
    pub async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version: u32,
    ) -> StorageResult<VersionedResource> {
        let inner = self.inner.read().await;
        let key = make_storage_key(resource_type, id);
        let row = inner
            .chains
            .get(&key)
            .and_then(|c| c.iter().find(|r| r.version_id == version));
        match row {
            Some(row) if row.is_deleted() => Err(StorageError::gone(resource_type, id)),
            Some(row) => Ok(row.clone()),
            None => Err(StorageError::not_found(resource_type, id)),
        }
    }

    /// Updates a resource, behaving as create at version 1 when no chain
    /// exists (upsert). Returns the new row and whether it was created.
    /// `if_match` is the expected current version; a mismatch is a
    /// `VersionConflict` with no write.
    pub async fn update(
        &self,
        resource_type: &str,
        id: &str,
        body: Value,
        if_match: Option<u32>,
    ) -> StorageResult<(VersionedResource, bool)> {
        check_body_type(resource_type, &body)?;
        if !is_valid_id(id) {
            return Err(StorageError::invalid_resource(format!(
                "invalid resource id '{id}'"
            )));
        }

        let mut inner = self.inner.write().await;
        let key = make_storage_key(resource_type, id);
        let current = inner.chains.get(&key).and_then(|c| c.last()).cloned();

        if let Some(expected) = if_match {
            let found = current.as_ref().map(|c| c.version_id).unwrap_or(0);
            if found != expected {
                return Err(StorageError::version_conflict(
                    resource_type,
                    id,
                    expected,
                    found,
                ));
            }
        }

        let (version, created) = match &current {
            Some(current) => (current.version_id + 1, false),
            None => (1, true),
        };

        let row = self.make_row(resource_type, id, version, RowStatus::Valid, body)?;
        self.commit_row(&mut inner, row.clone())?;
        debug!(resource_type, id, version, created, "updated resource");
        Ok((row, created))
    }

    /// Applies an RFC 6902 JSON Patch to the current version and inserts
    /// the result as a new version. A patch-apply failure is a
    /// `MalformedPatch` with no write.
    pub async fn patch(
        &self,
        resource_type: &str,
        id: &str,
        patch_doc: &Value,
    ) -> StorageResult<VersionedResource> {
        let mut inner = self.inner.write().await;
        let key = make_storage_key(resource_type, id);
        let current = match inner.chains.get(&key).and_then(|c| c.last()) {
            Some(current) if current.is_deleted() => {
                return Err(StorageError::gone(resource_type, id));
            }
            Some(current) => current.clone(),
            None => return Err(StorageError::not_found(resource_type, id)),
        };

        let patch: json_patch::Patch = serde_json::from_value(patch_doc.clone())
            .map_err(|e| StorageError::malformed_patch(e.to_string()))?;
        let mut body = current.content.clone();
        json_patch::patch(&mut body, &patch)
            .map_err(|e| StorageError::malformed_patch(e.to_string()))?;

        let row = self.make_row(
            resource_type,
            id,
            current.version_id + 1,
            RowStatus::Valid,
            body,
        )?;
        self.commit_row(&mut inner, row.clone())?;
        debug!(resource_type, id, version = row.version_id, "patched resource");
        Ok(row)
    }

    /// The delete state machine. Only the valid-current branch writes: one
    /// tombstone row, metadata index dropped, nothing else.
    pub async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<DeleteOutcome> {
        let mut inner = self.inner.write().await;
        self.delete_locked(&mut inner, resource_type, id)
    }

    /// Applies the delete transition to each id in one critical section.
    /// Ids that are NotFound or already Gone are silently skipped; the
    /// returned rows are the tombstones that were written.
    pub async fn delete_multiple(
        &self,
        resource_type: &str,
        ids: &[String],
    ) -> StorageResult<Vec<VersionedResource>> {
        let mut inner = self.inner.write().await;
        let mut tombstones = Vec::new();
        for id in ids {
            if let DeleteOutcome::Deleted(row) = self.delete_locked(&mut inner, resource_type, id)?
            {
                tombstones.push(row);
            }
        }
        debug!(
            resource_type,
            requested = ids.len(),
            deleted = tombstones.len(),
            "multi-delete"
        );
        Ok(tombstones)
    }

    fn delete_locked(
        &self,
        inner: &mut StoreInner,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<DeleteOutcome> {
        let key = make_storage_key(resource_type, id);
        let current = match inner.chains.get(&key).and_then(|c| c.last()) {
            None => return Ok(DeleteOutcome::NotFound),
            Some(current) if current.is_deleted() => return Ok(DeleteOutcome::AlreadyGone),
            Some(current) => current.clone(),
        };

        let row = self.make_row(
            resource_type,
            id,
            current.version_id + 1,
            RowStatus::Deleted,
            json!({}),
        )?;
        self.commit_row(inner, row.clone())?;
        Ok(DeleteOutcome::Deleted(row))
    }

    /// Removes the entire version chain for an id. The only physical
    /// deletion the store performs.
    pub async fn purge(&self, resource_type: &str, id: &str) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let key = make_storage_key(resource_type, id);
        if inner.chains.remove(&key).is_none() {
            return Err(StorageError::not_found(resource_type, id));
        }
        inner.index.remove(&key);
        warn!(resource_type, id, "purged resource version chain");
        Ok(())
    }

    // ==================== History ====================

    /// Version history: global (no type), per-type, or per-id.
    ///
    /// Rows are ordered by `(resource_type desc, id desc, version desc)`,
    /// grouping by resource rather than by time; recency order across
    /// types is not guaranteed.
    pub async fn history(
        &self,
        resource_type: Option<&str>,
        id: Option<&str>,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage> {
        let inner = self.inner.read().await;

        let mut rows: Vec<&VersionedResource> = inner
            .chains
            .iter()
            .filter(|(_, chain)| {
                let head = match chain.first() {
                    Some(head) => head,
                    None => return false,
                };
                if let Some(rt) = resource_type
                    && head.resource_type != rt
                {
                    return false;
                }
                if let Some(target) = id
                    && head.id != target
                {
                    return false;
                }
                true
            })
            .flat_map(|(_, chain)| chain.iter())
            .filter(|row| match params.since {
                Some(since) => row.last_updated > since,
                None => true,
            })
            .collect();

        rows.sort_by(|a, b| {
            b.resource_type
                .cmp(&a.resource_type)
                .then_with(|| b.id.cmp(&a.id))
                .then_with(|| b.version_id.cmp(&a.version_id))
        });

        let total = rows.len();
        let count = params.count.unwrap_or(total.max(1));
        let page = params.page.unwrap_or(1).max(1);
        let offset = (page - 1) * count;

        let entries = rows
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|row| HistoryEntry {
                resource: row.clone(),
                method: history_method(row),
            })
            .collect();

        Ok(HistoryPage { entries, total })
    }

    // ==================== Search support ====================

    /// Current valid rows of a type together with their metadata entries.
    /// The snapshot is a clone; concurrent searches never share state.
    pub async fn current_of_type(
        &self,
        resource_type: &str,
    ) -> Vec<(VersionedResource, Vec<MetadataEntry>)> {
        let inner = self.inner.read().await;
        let prefix = format!("{resource_type}/");
        inner
            .chains
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, chain)| {
                let current = chain.last()?;
                if current.is_deleted() {
                    return None;
                }
                let entries = inner.index.get(key).cloned().unwrap_or_default();
                Some((current.clone(), entries))
            })
            .collect()
    }

    /// Reference-kind metadata rows for one current resource.
    pub async fn reference_entries(&self, resource_type: &str, id: &str) -> Vec<MetadataEntry> {
        let inner = self.inner.read().await;
        let key = make_storage_key(resource_type, id);
        inner
            .index
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.kind == ParamKind::Reference)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn exists(&self, resource_type: &str, id: &str) -> bool {
        let inner = self.inner.read().await;
        let key = make_storage_key(resource_type, id);
        inner
            .chains
            .get(&key)
            .and_then(|c| c.last())
            .is_some_and(|row| !row.is_deleted())
    }

    pub async fn count_by_type(&self, resource_type: &str) -> usize {
        let inner = self.inner.read().await;
        let prefix = format!("{resource_type}/");
        inner
            .chains
            .iter()
            .filter(|(key, chain)| {
                key.starts_with(&prefix) && chain.last().is_some_and(|row| !row.is_deleted())
            })
            .count()
    }

    /// Stored version ids for an id, in insertion order. Test support.
    pub async fn versions(&self, resource_type: &str, id: &str) -> Vec<u32> {
        let inner = self.inner.read().await;
        let key = make_storage_key(resource_type, id);
        inner
            .chains
            .get(&key)
            .map(|c| c.iter().map(|r| r.version_id).collect())
            .unwrap_or_default()
    }

    // ==================== Internals ====================

    fn make_row(
        &self,
        resource_type: &str,
        id: &str,
        version: u32,
        status: RowStatus,
        mut body: Value,
    ) -> StorageResult<VersionedResource> {
        let now = now_utc();
        if status == RowStatus::Valid {
            inject_identity(&mut body, resource_type, id, version, &format_instant(&now))?;
        }
        Ok(VersionedResource {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            version_id: version,
            status,
            last_updated: now,
            content: body,
        })
    }

    /// Appends a version row and regenerates the metadata index for its
    /// key. The contiguity constraint `(type, id, version)` is checked
    /// here, under the write lock.
    fn commit_row(&self, inner: &mut StoreInner, row: VersionedResource) -> StorageResult<()> {
        let key = make_storage_key(&row.resource_type, &row.id);
        let chain = inner.chains.entry(key.clone()).or_default();
        let expected = chain.last().map(|r| r.version_id + 1).unwrap_or(1);
        if row.version_id != expected {
            return Err(StorageError::version_conflict(
                row.resource_type.clone(),
                row.id.clone(),
                row.version_id,
                expected.saturating_sub(1),
            ));
        }

        let index_rows = if row.status == RowStatus::Valid {
            Some(
                self.indexer
                    .generate(&row.resource_type, &row.content, &self.base_url),
            )
        } else {
            None
        };

        chain.push(row);
        match index_rows {
            Some(rows) => {
                inner.index.insert(key, rows);
            }
            None => {
                inner.index.remove(&key);
            }
        }
        Ok(())
    }
}

fn history_method(row: &VersionedResource) -> HistoryMethod {
    if row.is_deleted() {
        HistoryMethod::Delete
    } else if row.version_id == 1 {
        HistoryMethod::Create
    } else {
        HistoryMethod::Update
    }
}

fn check_body_type(resource_type: &str, body: &Value) -> StorageResult<()> {
    if !body.is_object() {
        return Err(StorageError::invalid_resource(
            "resource body must be a JSON object",
        ));
    }
    if let Some(declared) = body.get("resourceType").and_then(Value::as_str)
        && declared != resource_type
    {
        return Err(StorageError::invalid_resource(format!(
            "body resourceType '{declared}' does not match '{resource_type}'"
        )));
    }
    Ok(())
}

/// Writes id, meta.versionId and meta.lastUpdated into the body.
fn inject_identity(
    body: &mut Value,
    resource_type: &str,
    id: &str,
    version: u32,
    instant: &str,
) -> StorageResult<()> {
    let obj = body
        .as_object_mut()
        .ok_or_else(|| StorageError::invalid_resource("resource body must be a JSON object"))?;
    obj.insert(
        "resourceType".to_string(),
        Value::String(resource_type.to_string()),
    );
    obj.insert("id".to_string(), Value::String(id.to_string()));
    let meta = obj
        .entry("meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert("versionId".to_string(), Value::String(version.to_string()));
        meta.insert(
            "lastUpdated".to_string(),
            Value::String(instant.to_string()),
        );
    }
    Ok(())
}

/// `_summary` filtering over a copy of the body.
pub fn apply_summary(body: &Value, mode: SummaryMode) -> Value {
    match mode {
        SummaryMode::Full => body.clone(),
        SummaryMode::True => {
            let mut out = Map::new();
            for field in ["resourceType", "id", "meta"] {
                if let Some(v) = body.get(field) {
                    out.insert(field.to_string(), v.clone());
                }
            }
            let mut value = Value::Object(out);
            mark_subsetted(&mut value);
            value
        }
        SummaryMode::Text => {
            let mut out = Map::new();
            for field in ["resourceType", "id", "meta", "text"] {
                if let Some(v) = body.get(field) {
                    out.insert(field.to_string(), v.clone());
                }
            }
            Value::Object(out)
        }
        SummaryMode::Data => {
            let mut value = body.clone();
            if let Some(obj) = value.as_object_mut() {
                obj.remove("text");
            }
            mark_subsetted(&mut value);
            value
        }
    }
}

fn mark_subsetted(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let meta = obj
        .entry("meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(meta) = meta.as_object_mut() {
        let tags = meta.entry("tag").or_insert_with(|| Value::Array(Vec::new()));
        if let Some(tags) = tags.as_array_mut() {
            tags.push(json!({
                "system": "http://terminology.hl7.org/CodeSystem/v3-ObservationValue",
                "code": "SUBSETTED"
            }));
        }
    }
}
