//! Association index: owner record -> collection name -> ordered members.
//!
//! The index is not locked on its own. Both the authoritative store and the
//! client mirror keep it behind the same lock as their records so a
//! reassignment is visible all at once.

use crate::types::{CollectionDelta, RecordKey};
use std::collections::{BTreeMap, HashMap};

/// Ordered collection views keyed by owner.
#[derive(Clone, Debug, Default)]
pub struct AssociationIndex {
    views: HashMap<RecordKey, BTreeMap<String, Vec<RecordKey>>>,
}

impl AssociationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `member` unless present. Returns true if inserted.
    pub fn insert(&mut self, owner: &RecordKey, name: &str, member: &RecordKey) -> bool {
        let members = self
            .views
            .entry(owner.clone())
            .or_default()
            .entry(name.to_string())
            .or_default();
        if members.contains(member) {
            return false;
        }
        members.push(member.clone());
        true
    }

    /// Remove `member`. Returns true if it was present.
    pub fn remove(&mut self, owner: &RecordKey, name: &str, member: &RecordKey) -> bool {
        let Some(members) = self.views.get_mut(owner).and_then(|v| v.get_mut(name)) else {
            return false;
        };
        let before = members.len();
        members.retain(|m| m != member);
        before != members.len()
    }

    pub fn members(&self, owner: &RecordKey, name: &str) -> &[RecordKey] {
        self.views
            .get(owner)
            .and_then(|v| v.get(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, owner: &RecordKey, name: &str, member: &RecordKey) -> bool {
        self.members(owner, name).contains(member)
    }

    /// Replace one collection wholesale.
    pub fn set(&mut self, owner: &RecordKey, name: &str, members: Vec<RecordKey>) {
        self.views
            .entry(owner.clone())
            .or_default()
            .insert(name.to_string(), members);
    }

    /// All collections of an owner.
    pub fn collections_of(&self, owner: &RecordKey) -> Option<&BTreeMap<String, Vec<RecordKey>>> {
        self.views.get(owner)
    }

    /// Apply a membership delta; set semantics make replays harmless.
    pub fn apply_delta(&mut self, owner: &RecordKey, delta: &CollectionDelta) {
        for member in &delta.removed {
            self.remove(owner, &delta.name, member);
        }
        for member in &delta.added {
            self.insert(owner, &delta.name, member);
        }
    }

    /// Drop an owner and all its collections.
    pub fn remove_owner(&mut self, owner: &RecordKey) -> Option<BTreeMap<String, Vec<RecordKey>>> {
        self.views.remove(owner)
    }

    /// Remove `member` from every collection that lists it. Returns the
    /// (owner, collection) pairs it was removed from.
    pub fn remove_everywhere(&mut self, member: &RecordKey) -> Vec<(RecordKey, String)> {
        let mut removed = Vec::new();
        for (owner, collections) in self.views.iter_mut() {
            for (name, members) in collections.iter_mut() {
                let before = members.len();
                members.retain(|m| m != member);
                if members.len() != before {
                    removed.push((owner.clone(), name.clone()));
                }
            }
        }
        removed.sort();
        removed
    }

    /// Every (owner, collection) listing `member`.
    pub fn owners_of(&self, member: &RecordKey) -> Vec<(RecordKey, String)> {
        let mut found: Vec<_> = self
            .views
            .iter()
            .flat_map(|(owner, collections)| {
                collections
                    .iter()
                    .filter(|(_, members)| members.contains(member))
                    .map(move |(name, _)| (owner.clone(), name.clone()))
            })
            .collect();
        found.sort();
        found
    }
}
