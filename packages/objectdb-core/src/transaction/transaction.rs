use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::database::Snapshot;
use crate::error::{DbError, Result};
use crate::key::{evaluate_key_path, inject_key, Key, KeyRange};
use crate::object_store::{record_size, StoreData, StoreParameters, MAX_GENERATED_KEY};

use super::staging_buffer::StagingBuffer;
use super::state::{TransactionMode, TransactionState};

/// Working copy of the store set inside a version-change transaction.
#[derive(Debug, Clone)]
struct SchemaDraft {
    /// Version the database moves to on commit
    version: u64,
    /// Store set as seen by the upgrade
    stores: BTreeMap<String, Arc<StoreData>>,
}

/// Transaction context holding buffered effects across object stores.
///
/// Effects are isolated from the committed snapshot until commit. The
/// state machine only moves forward; terminal states reject every further
/// `request_commit` or `abort`.
#[derive(Debug)]
pub struct Transaction {
    /// Transaction identifier, unique per engine
    id: u64,
    /// Declared access mode
    mode: TransactionMode,
    /// Store names the transaction may touch
    scope: BTreeSet<String>,
    /// Lifecycle state
    state: TransactionState,
    /// Map of store name to staged effects
    staging: BTreeMap<String, StagingBuffer>,
    /// Store set for version-change transactions
    schema: Option<SchemaDraft>,
    /// Error that aborted the transaction
    error: Option<DbError>,
}

impl Transaction {
    /// Creates an active transaction against `base`.
    pub fn new(
        id: u64,
        mode: TransactionMode,
        scope: BTreeSet<String>,
        base: &Snapshot,
    ) -> Self {
        let schema = (mode == TransactionMode::VersionChange).then(|| SchemaDraft {
            version: base.version,
            stores: base.stores.clone(),
        });
        Self {
            id,
            mode,
            scope,
            state: TransactionState::Active,
            staging: BTreeMap::new(),
            schema,
            error: None,
        }
    }

    /// Returns the transaction identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the declared mode.
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Returns the declared scope.
    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns the error that aborted the transaction, if any.
    pub fn error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    /// Store names visible to this transaction.
    pub fn store_names(&self) -> Vec<String> {
        match &self.schema {
            Some(draft) => draft.stores.keys().cloned().collect(),
            None => self.scope.iter().cloned().collect(),
        }
    }

    /// Sets the version a version-change transaction commits.
    pub fn set_target_version(&mut self, version: u64) -> Result<()> {
        let draft = self.schema.as_mut().ok_or_else(|| {
            DbError::InvalidState(format!(
                "transaction {} is not a version change",
                self.id
            ))
        })?;
        draft.version = version;
        Ok(())
    }

    /// Version this transaction commits, for version changes.
    pub fn target_version(&self) -> Option<u64> {
        self.schema.as_ref().map(|d| d.version)
    }

    /// Fails with `TransactionInactive` unless the transaction is active.
    pub fn ensure_can_issue(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(DbError::TransactionInactive { txn: self.id });
        }
        Ok(())
    }

    /// Marks an active transaction inactive. Returns `true` on transition.
    pub fn deactivate(&mut self) -> bool {
        if self.state == TransactionState::Active {
            self.state = TransactionState::Inactive;
            return true;
        }
        false
    }

    /// Re-activates an inactive transaction while a completion is
    /// dispatched. Returns `true` on transition.
    pub fn reactivate(&mut self) -> bool {
        if self.state == TransactionState::Inactive {
            self.state = TransactionState::Active;
            return true;
        }
        false
    }

    /// Explicit commit: `active → committing`.
    pub fn request_commit(&mut self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(DbError::InvalidState(format!(
                "cannot commit transaction {} while {}",
                self.id, self.state
            )));
        }
        self.state = TransactionState::Committing;
        Ok(())
    }

    /// Implicit commit once the queue has drained: `inactive → committing`.
    pub fn begin_commit(&mut self) -> bool {
        if self.state == TransactionState::Inactive {
            self.state = TransactionState::Committing;
            return true;
        }
        false
    }

    /// Explicit abort, accepted while `active` or `inactive`.
    pub fn abort(&mut self, error: DbError) -> Result<()> {
        match self.state {
            TransactionState::Active | TransactionState::Inactive => {
                self.discard(error);
                Ok(())
            }
            state => Err(DbError::InvalidState(format!(
                "cannot abort transaction {} while {}",
                self.id, state
            ))),
        }
    }

    /// Aborts from any non-terminal state (merge failure, teardown).
    /// Returns `true` on transition.
    pub fn fail(&mut self, error: DbError) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.discard(error);
        true
    }

    fn discard(&mut self, error: DbError) {
        self.state = TransactionState::Aborted;
        self.staging.clear();
        self.schema = None;
        self.error = Some(error);
    }

    /// `committing → committed`.
    pub fn mark_committed(&mut self) -> Result<()> {
        if self.state != TransactionState::Committing {
            return Err(DbError::InvalidState(format!(
                "transaction {} cannot complete commit while {}",
                self.id, self.state
            )));
        }
        self.state = TransactionState::Committed;
        self.staging.clear();
        self.schema = None;
        Ok(())
    }

    /// Returns `true` if any record or schema effect is buffered.
    pub fn has_staged_changes(&self) -> bool {
        self.schema.is_some() || self.staging.values().any(|s| !s.is_empty())
    }

    /// Returns the number of stores with staged effects.
    pub fn staged_store_count(&self) -> usize {
        self.staging.values().filter(|s| !s.is_empty()).count()
    }

    fn resolve<'a>(
        schema: &'a Option<SchemaDraft>,
        scope: &BTreeSet<String>,
        base: &'a Snapshot,
        name: &str,
    ) -> Result<&'a StoreData> {
        match schema {
            Some(draft) => draft
                .stores
                .get(name)
                .map(|s| s.as_ref())
                .ok_or_else(|| DbError::NotFound {
                    store: name.to_string(),
                }),
            None => {
                if !scope.contains(name) {
                    return Err(DbError::InvalidAccess(format!(
                        "object store '{}' is outside the transaction scope",
                        name
                    )));
                }
                base.store(name).map(|s| s.as_ref())
            }
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(DbError::TransactionInactive { txn: self.id });
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_live()?;
        if !self.mode.can_write() {
            return Err(DbError::ReadOnly { txn: self.id });
        }
        Ok(())
    }

    fn staged(&self, store: &str) -> Option<&StagingBuffer> {
        self.staging.get(store)
    }

    /// Reads one record through the overlay.
    pub fn get(&self, base: &Snapshot, store: &str, key: &Key) -> Result<Option<Arc<Value>>> {
        self.ensure_live()?;
        let data = Self::resolve(&self.schema, &self.scope, base, store)?;
        Ok(match self.staged(store) {
            Some(staging) => staging.lookup(data, key),
            None => data.get(key).cloned(),
        })
    }

    fn visible_range(
        &self,
        base: &Snapshot,
        store: &str,
        range: &KeyRange,
    ) -> Result<BTreeMap<Key, Arc<Value>>> {
        self.ensure_live()?;
        let data = Self::resolve(&self.schema, &self.scope, base, store)?;
        Ok(match self.staged(store) {
            Some(staging) => staging.merged_range(data, range),
            None => StagingBuffer::new(store.to_string()).merged_range(data, range),
        })
    }

    /// Reads the values within `range`, at most `count` of them.
    pub fn get_all(
        &self,
        base: &Snapshot,
        store: &str,
        range: &KeyRange,
        count: Option<usize>,
    ) -> Result<Vec<Arc<Value>>> {
        let merged = self.visible_range(base, store, range)?;
        let limit = count.unwrap_or(usize::MAX);
        Ok(merged.into_values().take(limit).collect())
    }

    /// Reads the keys within `range`, at most `count` of them.
    pub fn get_all_keys(
        &self,
        base: &Snapshot,
        store: &str,
        range: &KeyRange,
        count: Option<usize>,
    ) -> Result<Vec<Key>> {
        let merged = self.visible_range(base, store, range)?;
        let limit = count.unwrap_or(usize::MAX);
        Ok(merged.into_keys().take(limit).collect())
    }

    /// Counts the records within `range`.
    pub fn count(&self, base: &Snapshot, store: &str, range: &KeyRange) -> Result<u64> {
        Ok(self.visible_range(base, store, range)?.len() as u64)
    }

    /// Buffers an insert (`no_overwrite`) or upsert and returns the key.
    pub fn put(
        &mut self,
        base: &Snapshot,
        store: &str,
        mut value: Value,
        key: Option<Key>,
        no_overwrite: bool,
    ) -> Result<Key> {
        self.ensure_writable()?;
        let data = Self::resolve(&self.schema, &self.scope, base, store)?;
        let staging = self
            .staging
            .entry(store.to_string())
            .or_insert_with(|| StagingBuffer::new(store.to_string()));
        let params = &data.params;

        let key = match (&params.key_path, key) {
            (Some(path), Some(_)) => {
                return Err(DbError::Data(format!(
                    "object store '{}' uses in-line keys at '{}'; an explicit key is not allowed",
                    store, path
                )))
            }
            (Some(path), None) => match evaluate_key_path(&value, path)? {
                Some(key) => key,
                None if params.auto_increment => {
                    let key = generate_key(store, data, staging)?;
                    inject_key(&mut value, path, &key)?;
                    key
                }
                None => {
                    return Err(DbError::Data(format!(
                        "value has no key at path '{}'",
                        path
                    )))
                }
            },
            (None, Some(key)) => key,
            (None, None) if params.auto_increment => generate_key(store, data, staging)?,
            (None, None) => {
                return Err(DbError::Data(format!(
                    "object store '{}' has no key path or generator; a key is required",
                    store
                )))
            }
        };

        if params.auto_increment {
            if let Key::Number(n) = &key {
                let n = *n;
                let current = staging.current_key_generator(data);
                if n >= current as f64 {
                    let next = (n.floor() + 1.0).min(MAX_GENERATED_KEY as f64 + 1.0);
                    staging.key_generator = Some(next as u64);
                }
            }
        }

        if no_overwrite && staging.lookup(data, &key).is_some() {
            return Err(DbError::Constraint(format!(
                "key {} already exists in object store '{}'",
                key, store
            )));
        }

        let size = record_size(&key, &value)?;
        staging.stage_put(key.clone(), Arc::new(value), size);
        Ok(key)
    }

    /// Buffers tombstones for every visible key within `range`.
    pub fn delete(&mut self, base: &Snapshot, store: &str, range: &KeyRange) -> Result<()> {
        self.ensure_writable()?;
        let keys = self.get_all_keys(base, store, range, None)?;
        let staging = self
            .staging
            .entry(store.to_string())
            .or_insert_with(|| StagingBuffer::new(store.to_string()));
        for key in keys {
            staging.stage_delete(key);
        }
        Ok(())
    }

    /// Buffers removal of every record in `store`.
    pub fn clear(&mut self, base: &Snapshot, store: &str) -> Result<()> {
        self.ensure_writable()?;
        Self::resolve(&self.schema, &self.scope, base, store)?;
        self.staging
            .entry(store.to_string())
            .or_insert_with(|| StagingBuffer::new(store.to_string()))
            .stage_clear();
        Ok(())
    }

    /// Adds an object store (version change only).
    pub fn create_store(
        &mut self,
        _base: &Snapshot,
        name: &str,
        params: StoreParameters,
    ) -> Result<()> {
        self.ensure_live()?;
        let id = self.id;
        let draft = self.schema.as_mut().ok_or_else(|| {
            DbError::InvalidState(format!(
                "object stores can only be created in a version change (transaction {})",
                id
            ))
        })?;
        if draft.stores.contains_key(name) {
            return Err(DbError::Constraint(format!(
                "object store '{}' already exists",
                name
            )));
        }
        if params.auto_increment && params.key_path.as_deref() == Some("") {
            return Err(DbError::InvalidAccess(
                "a key generator cannot be combined with an empty key path".to_string(),
            ));
        }
        draft.stores.insert(
            name.to_string(),
            Arc::new(StoreData::new(name.to_string(), params)),
        );
        self.staging.remove(name);
        Ok(())
    }

    /// Removes an object store (version change only).
    pub fn delete_store(&mut self, _base: &Snapshot, name: &str) -> Result<()> {
        self.ensure_live()?;
        let id = self.id;
        let draft = self.schema.as_mut().ok_or_else(|| {
            DbError::InvalidState(format!(
                "object stores can only be deleted in a version change (transaction {})",
                id
            ))
        })?;
        if draft.stores.remove(name).is_none() {
            return Err(DbError::NotFound {
                store: name.to_string(),
            });
        }
        self.staging.remove(name);
        Ok(())
    }

    /// Merges buffered effects over `base` into a new snapshot.
    ///
    /// Returns `None` when the transaction changed nothing. Stores are
    /// processed in name order.
    pub fn build_commit(&self, base: &Snapshot) -> Result<Option<Snapshot>> {
        if self.state != TransactionState::Committing {
            return Err(DbError::InvalidState(format!(
                "transaction {} is {}, not committing",
                self.id, self.state
            )));
        }

        let (version, mut stores, mut changed) = match &self.schema {
            Some(draft) => (draft.version, draft.stores.clone(), true),
            None => (base.version, base.stores.clone(), false),
        };

        for (name, staging) in &self.staging {
            if staging.is_empty() {
                continue;
            }
            let current = stores.get(name).ok_or_else(|| {
                DbError::DataCorruption(format!(
                    "Staged object store '{}' not found during commit",
                    name
                ))
            })?;
            let mut next = StoreData::clone(current);
            staging.apply_to(&mut next);
            stores.insert(name.clone(), Arc::new(next));
            changed = true;
        }

        if !changed {
            return Ok(None);
        }
        Ok(Some(Snapshot { version, stores }))
    }
}

fn generate_key(store: &str, data: &StoreData, staging: &mut StagingBuffer) -> Result<Key> {
    let current = staging.current_key_generator(data);
    if current > MAX_GENERATED_KEY {
        return Err(DbError::Constraint(format!(
            "key generator of object store '{}' is exhausted",
            store
        )));
    }
    staging.key_generator = Some(current + 1);
    Ok(Key::Number(current as f64))
}
