//! Authoritative in-process record store with association maintenance.

use super::index::AssociationIndex;
use super::schema::{AssociationKind, ReferenceChange, SchemaRegistry};
use crate::error::{Result, SyncError};
use crate::types::{Attributes, CollectionDelta, Record, RecordId, RecordKey, ScopeKey};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Collection changes on one owner caused by a mutation of a member.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectionMove {
    /// Owner as it was when the move committed (attribute-less if not stored).
    pub owner: Record,
    pub deltas: Vec<CollectionDelta>,
}

/// Outcome of one committed mutation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Committed {
    pub before: Option<Attributes>,
    pub after: Option<Attributes>,
    pub moves: Vec<CollectionMove>,
}

impl Committed {
    /// The record as observers should judge it: the new state, or the last
    /// state for a destroy.
    pub fn record(&self, key: &RecordKey) -> Record {
        let attributes = self
            .after
            .as_ref()
            .or(self.before.as_ref())
            .cloned()
            .unwrap_or_default();
        Record::new(key.clone(), attributes)
    }
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<RecordKey, Attributes>,
    index: AssociationIndex,
    next_ids: HashMap<String, u64>,
}

impl StoreInner {
    fn owner_record(&self, owner: &RecordKey) -> Record {
        match self.records.get(owner) {
            Some(attrs) => Record::new(owner.clone(), attrs.clone()),
            None => Record::tombstone(owner.clone()),
        }
    }

    fn bump_next_id(&mut self, key: &RecordKey) {
        let next = self.next_ids.entry(key.record_type.clone()).or_insert(1);
        if key.id.0 >= *next && !key.id.is_provisional() {
            *next = key.id.0 + 1;
        }
    }
}

/// The server-held record store.
///
/// Records and the association index live under one lock: a reassignment
/// moves the member out of the old owner's collection and into the new one
/// in a single critical section.
pub struct RecordStore {
    schema: Arc<SchemaRegistry>,
    inner: RwLock<StoreInner>,
}

impl RecordStore {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// Reserve the next id for a type.
    pub fn allocate_key(&self, record_type: &str) -> Result<RecordKey> {
        self.schema.type_def(record_type)?;
        let mut inner = self.inner.write();
        let next = inner.next_ids.entry(record_type.to_string()).or_insert(1);
        let key = RecordKey {
            record_type: record_type.to_string(),
            id: RecordId(*next),
        };
        *next += 1;
        Ok(key)
    }

    /// Insert a new record and link it into its owners' collections.
    pub fn create(&self, key: &RecordKey, attributes: Attributes) -> Result<Committed> {
        self.schema.type_def(&key.record_type)?;
        let changes = self
            .schema
            .reference_changes(&key.record_type, None, Some(&attributes))?;

        let mut inner = self.inner.write();
        if inner.records.contains_key(key) {
            return Err(SyncError::RecordExists(key.clone()));
        }
        inner.records.insert(key.clone(), attributes.clone());
        inner.bump_next_id(key);
        let moves = self.relink(&mut inner, key, changes);

        Ok(Committed {
            before: None,
            after: Some(attributes),
            moves,
        })
    }

    /// Merge `patch` into a record. A changed `belongs_to` key or type moves
    /// the record between owner collections.
    pub fn update(&self, key: &RecordKey, patch: Attributes) -> Result<Committed> {
        let mut inner = self.inner.write();
        let before = inner
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::RecordNotFound(key.clone()))?;
        let mut after = before.clone();
        after.extend(patch);

        let changes = self
            .schema
            .reference_changes(&key.record_type, Some(&before), Some(&after))?;
        inner.records.insert(key.clone(), after.clone());
        let moves = self.relink(&mut inner, key, changes);

        Ok(Committed {
            before: Some(before),
            after: Some(after),
            moves,
        })
    }

    /// Remove a record, unlinking it from its owners. Dependents are the
    /// caller's responsibility (see [`RecordStore::dependents`]).
    pub fn destroy(&self, key: &RecordKey) -> Result<Committed> {
        let mut inner = self.inner.write();
        let before = inner
            .records
            .remove(key)
            .ok_or_else(|| SyncError::RecordNotFound(key.clone()))?;
        // A malformed stored reference must not keep a destroyed record linked.
        let changes = self
            .schema
            .reference_changes(&key.record_type, Some(&before), None)
            .unwrap_or_default();
        let mut moves = self.relink(&mut inner, key, changes);

        let stray = inner.index.remove_everywhere(key);
        for (owner, name) in stray {
            moves.push(CollectionMove {
                owner: inner.owner_record(&owner),
                deltas: vec![CollectionDelta {
                    name,
                    added: Vec::new(),
                    removed: vec![key.clone()],
                }],
            });
        }
        inner.index.remove_owner(key);

        Ok(Committed {
            before: Some(before),
            after: None,
            moves,
        })
    }

    fn relink(
        &self,
        inner: &mut StoreInner,
        key: &RecordKey,
        changes: Vec<ReferenceChange>,
    ) -> Vec<CollectionMove> {
        let mut by_owner: BTreeMap<RecordKey, Vec<CollectionDelta>> = BTreeMap::new();

        for change in changes {
            if let Some(from) = &change.from {
                for coll in self.schema.inverse_collections(
                    &from.record_type,
                    &key.record_type,
                    &change.association,
                ) {
                    if inner.index.remove(from, &coll.name, key) {
                        by_owner.entry(from.clone()).or_default().push(CollectionDelta {
                            name: coll.name.clone(),
                            added: Vec::new(),
                            removed: vec![key.clone()],
                        });
                    }
                }
            }
            if let Some(to) = &change.to {
                for coll in self.schema.inverse_collections(
                    &to.record_type,
                    &key.record_type,
                    &change.association,
                ) {
                    let displaced = if coll.kind == AssociationKind::HasOne {
                        let current = inner.index.members(to, &coll.name).to_vec();
                        current.into_iter().filter(|m| m != key).collect()
                    } else {
                        Vec::new()
                    };
                    for old in &displaced {
                        inner.index.remove(to, &coll.name, old);
                    }
                    if inner.index.insert(to, &coll.name, key) || !displaced.is_empty() {
                        by_owner.entry(to.clone()).or_default().push(CollectionDelta {
                            name: coll.name.clone(),
                            added: vec![key.clone()],
                            removed: displaced,
                        });
                    }
                }
            }
        }

        by_owner
            .into_iter()
            .map(|(owner, deltas)| CollectionMove {
                owner: inner.owner_record(&owner),
                deltas,
            })
            .collect()
    }

    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.inner
            .read()
            .records
            .get(key)
            .map(|attrs| Record::new(key.clone(), attrs.clone()))
    }

    pub fn exists(&self, key: &RecordKey) -> bool {
        self.inner.read().records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members of a collection on `owner`, including `has_many :through`.
    pub fn collection(&self, owner: &RecordKey, name: &str) -> Result<Vec<RecordKey>> {
        let assoc = self.schema.association(&owner.record_type, name)?;
        let inner = self.inner.read();
        match &assoc.through {
            Some(through) => {
                let joins = inner.index.members(owner, &through.via);
                self.schema
                    .through_members(assoc, joins, |k| inner.records.get(k))
            }
            None => Ok(inner.index.members(owner, name).to_vec()),
        }
    }

    /// Every collection declared on the owner's type, resolved.
    pub fn collections_of(&self, owner: &RecordKey) -> Result<BTreeMap<String, Vec<RecordKey>>> {
        let def = self.schema.type_def(&owner.record_type)?;
        let mut out = BTreeMap::new();
        for assoc in def.associations.iter().filter(|a| a.is_collection()) {
            out.insert(assoc.name.clone(), self.collection(owner, &assoc.name)?);
        }
        Ok(out)
    }

    /// Members that must be destroyed together with `owner`.
    pub fn dependents(&self, owner: &RecordKey) -> Result<Vec<RecordKey>> {
        let def = self.schema.type_def(&owner.record_type)?;
        let inner = self.inner.read();
        let mut out = Vec::new();
        for assoc in def
            .associations
            .iter()
            .filter(|a| a.dependent_destroy && a.through.is_none())
        {
            out.extend(inner.index.members(owner, &assoc.name).iter().cloned());
        }
        Ok(out)
    }

    /// Whether a record currently falls inside a scope.
    pub fn scope_contains(&self, scope: &ScopeKey, key: &RecordKey) -> bool {
        let Some(owner) = scope.owner_key() else {
            return scope.record_type == key.record_type;
        };
        if *key == owner {
            return true;
        }
        let Ok(assoc) = self.schema.association(&owner.record_type, &scope.name) else {
            return false;
        };
        let inner = self.inner.read();
        match &assoc.through {
            Some(through) => {
                let joins = inner.index.members(&owner, &through.via);
                joins.contains(key)
                    || self
                        .schema
                        .through_members(assoc, joins, |k| inner.records.get(k))
                        .map(|members| members.contains(key))
                        .unwrap_or(false)
            }
            None => inner.index.contains(&owner, &scope.name, key),
        }
    }

    /// Records inside a scope, for full snapshots.
    pub fn keys_in_scope(&self, scope: &ScopeKey) -> Result<Vec<RecordKey>> {
        let Some(owner) = scope.owner_key() else {
            let inner = self.inner.read();
            let mut keys: Vec<_> = inner
                .records
                .keys()
                .filter(|k| k.record_type == scope.record_type)
                .cloned()
                .collect();
            keys.sort();
            return Ok(keys);
        };
        let assoc = self.schema.association(&owner.record_type, &scope.name)?;
        let mut keys = Vec::new();
        if self.exists(&owner) {
            keys.push(owner.clone());
        }
        if let Some(through) = &assoc.through {
            keys.extend(self.collection(&owner, &through.via)?);
        }
        keys.extend(self.collection(&owner, &scope.name)?);
        Ok(keys)
    }
}
