//! Record type catalog and association metadata.

use crate::error::{Result, SyncError};
use crate::types::{Attributes, RecordId, RecordKey};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Shape of an association.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssociationKind {
    BelongsTo,
    HasMany,
    HasOne,
}

/// What an association points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssociationTarget {
    /// Target type fixed by the schema.
    Fixed(String),
    /// Target type read per instance from the `foreign_type` attribute.
    Polymorphic,
}

/// `has_many :through` routing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Through {
    /// Collection on the owner holding the join records.
    pub via: String,
    /// `belongs_to` on the join type that yields the member.
    pub source: String,
    /// Only members of this type, for polymorphic sources.
    pub source_type: Option<String>,
}

/// One declared association on a record type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssociationDef {
    pub name: String,
    pub kind: AssociationKind,
    pub target: AssociationTarget,
    /// `belongs_to` only: attribute holding the target id.
    pub foreign_key: Option<String>,
    /// Polymorphic `belongs_to` only: attribute holding the target type.
    pub foreign_type: Option<String>,
    /// `has_many`/`has_one`: the `belongs_to` on the target pointing back.
    pub inverse: Option<String>,
    pub through: Option<Through>,
    /// Destroy members when the owner is destroyed.
    pub dependent_destroy: bool,
}

impl AssociationDef {
    pub fn belongs_to(name: impl Into<String>, target_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            foreign_key: Some(format!("{}_id", name)),
            foreign_type: None,
            name,
            kind: AssociationKind::BelongsTo,
            target: AssociationTarget::Fixed(target_type.into()),
            inverse: None,
            through: None,
            dependent_destroy: false,
        }
    }

    /// `belongs_to :name, polymorphic: true` backed by `name_id` and `name_type`.
    pub fn belongs_to_polymorphic(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            foreign_key: Some(format!("{}_id", name)),
            foreign_type: Some(format!("{}_type", name)),
            name,
            kind: AssociationKind::BelongsTo,
            target: AssociationTarget::Polymorphic,
            inverse: None,
            through: None,
            dependent_destroy: false,
        }
    }

    pub fn has_many(name: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::HasMany,
            target: AssociationTarget::Fixed(target_type.into()),
            foreign_key: None,
            foreign_type: None,
            inverse: None,
            through: None,
            dependent_destroy: false,
        }
    }

    pub fn has_one(name: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            kind: AssociationKind::HasOne,
            ..Self::has_many(name, target_type)
        }
    }

    /// `has_many :name, through: via, source: source`.
    pub fn has_many_through(
        name: impl Into<String>,
        via: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::HasMany,
            target: AssociationTarget::Polymorphic,
            foreign_key: None,
            foreign_type: None,
            inverse: None,
            through: Some(Through {
                via: via.into(),
                source: source.into(),
                source_type: None,
            }),
            dependent_destroy: false,
        }
    }

    /// Name the `belongs_to` on the member type (`as:` for polymorphic owners).
    pub fn inverse_of(mut self, belongs_to: impl Into<String>) -> Self {
        self.inverse = Some(belongs_to.into());
        self
    }

    pub fn source_type(mut self, record_type: impl Into<String>) -> Self {
        let record_type = record_type.into();
        if let Some(through) = self.through.as_mut() {
            through.source_type = Some(record_type.clone());
        }
        self.target = AssociationTarget::Fixed(record_type);
        self
    }

    pub fn dependent_destroy(mut self) -> Self {
        self.dependent_destroy = true;
        self
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, AssociationKind::HasMany | AssociationKind::HasOne)
    }

    pub fn is_polymorphic(&self) -> bool {
        self.target == AssociationTarget::Polymorphic && self.kind == AssociationKind::BelongsTo
    }

    /// Whether `attrs` writes this `belongs_to`'s key or type attribute.
    pub fn touches(&self, attrs: &Attributes) -> bool {
        self.foreign_key
            .iter()
            .chain(self.foreign_type.iter())
            .any(|attribute| attrs.contains_key(attribute))
    }

    fn fixed_target(&self) -> Option<&str> {
        match &self.target {
            AssociationTarget::Fixed(t) => Some(t),
            AssociationTarget::Polymorphic => None,
        }
    }
}

/// Per-type capability object used for diffing and validating attributes.
pub trait TypeCapability: Send + Sync {
    /// Attributes whose value differs between `before` and `after`.
    /// Attributes removed in `after` appear as `null`.
    fn diff(&self, before: &Attributes, after: &Attributes) -> Attributes {
        attribute_diff(before, after)
    }

    /// Type-specific validation run before a session write is committed.
    fn validate(&self, _attributes: &Attributes) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Plain JSON attributes with value-equality diffing.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonAttributes;

impl TypeCapability for JsonAttributes {}

/// Attribute-level diff by JSON value equality.
pub fn attribute_diff(before: &Attributes, after: &Attributes) -> Attributes {
    let mut diff = Attributes::new();
    for (name, value) in after {
        if before.get(name) != Some(value) {
            diff.insert(name.clone(), value.clone());
        }
    }
    for name in before.keys() {
        if !after.contains_key(name) {
            diff.insert(name.clone(), serde_json::Value::Null);
        }
    }
    diff
}

/// Declaration of one record type.
#[derive(Clone)]
pub struct TypeDef {
    pub name: String,
    /// Public attribute whitelist. `None` accepts any attribute.
    pub attributes: Option<BTreeSet<String>>,
    pub associations: Vec<AssociationDef>,
    pub capability: Arc<dyn TypeCapability>,
}

impl fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDef")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .field("associations", &self.associations)
            .finish()
    }
}

impl TypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: None,
            associations: Vec::new(),
            capability: Arc::new(JsonAttributes),
        }
    }

    pub fn attributes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn association(mut self, association: AssociationDef) -> Self {
        self.associations.push(association);
        self
    }

    pub fn capability(mut self, capability: Arc<dyn TypeCapability>) -> Self {
        self.capability = capability;
        self
    }

    pub fn belongs_to(&self) -> impl Iterator<Item = &AssociationDef> {
        self.associations
            .iter()
            .filter(|a| a.kind == AssociationKind::BelongsTo)
    }

    /// Whether `attribute` may be written: declared, or backing a `belongs_to`.
    pub fn accepts_attribute(&self, attribute: &str) -> bool {
        match &self.attributes {
            None => true,
            Some(declared) => {
                declared.contains(attribute)
                    || self.belongs_to().any(|a| {
                        a.foreign_key.as_deref() == Some(attribute)
                            || a.foreign_type.as_deref() == Some(attribute)
                    })
            }
        }
    }
}

/// Catalog of record types, shared by the server store and the client mirror.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    types: HashMap<String, TypeDef>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a type.
    pub fn register(&mut self, def: TypeDef) -> &mut Self {
        self.types.insert(def.name.clone(), def);
        self
    }

    pub fn with(mut self, def: TypeDef) -> Self {
        self.register(def);
        self
    }

    pub fn contains(&self, record_type: &str) -> bool {
        self.types.contains_key(record_type)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn type_def(&self, record_type: &str) -> Result<&TypeDef> {
        self.types
            .get(record_type)
            .ok_or_else(|| SyncError::UnknownType(record_type.to_string()))
    }

    pub fn association(&self, record_type: &str, name: &str) -> Result<&AssociationDef> {
        self.type_def(record_type)?
            .associations
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| SyncError::UnknownAssociation {
                record_type: record_type.to_string(),
                association: name.to_string(),
            })
    }

    pub fn capability(&self, record_type: &str) -> Result<Arc<dyn TypeCapability>> {
        Ok(Arc::clone(&self.type_def(record_type)?.capability))
    }

    /// Verify that every association refers to declared types and inverses.
    pub fn check(&self) -> Result<()> {
        for def in self.types.values() {
            for assoc in &def.associations {
                let broken = |why: String| {
                    SyncError::InvalidOperation(format!("{}.{}: {}", def.name, assoc.name, why))
                };
                if let Some(target) = assoc.fixed_target() {
                    if !self.contains(target) {
                        return Err(broken(format!("unknown target type {}", target)));
                    }
                }
                if let Some(through) = &assoc.through {
                    let via = self
                        .association(&def.name, &through.via)
                        .map_err(|_| broken(format!("unknown via collection {}", through.via)))?;
                    let join_type = via
                        .fixed_target()
                        .ok_or_else(|| broken("via collection must have a fixed type".into()))?;
                    self.association(join_type, &through.source)
                        .map_err(|_| broken(format!("unknown source {}", through.source)))?;
                    continue;
                }
                if assoc.is_collection() {
                    let inverse = assoc
                        .inverse
                        .as_deref()
                        .ok_or_else(|| broken("collection without inverse".into()))?;
                    let member_type = assoc.fixed_target().unwrap_or_default();
                    let back = self
                        .association(member_type, inverse)
                        .map_err(|_| broken(format!("unknown inverse {}", inverse)))?;
                    if back.kind != AssociationKind::BelongsTo {
                        return Err(broken(format!("inverse {} is not a belongs_to", inverse)));
                    }
                }
            }
        }
        Ok(())
    }

    /// Reject attributes a type does not publish, then run its capability check.
    pub fn validate(&self, record_type: &str, attributes: &Attributes) -> Result<()> {
        let def = self.type_def(record_type)?;
        if let Some(bad) = attributes.keys().find(|a| !def.accepts_attribute(a)) {
            return Err(SyncError::Validation(format!(
                "{} has no attribute {}",
                record_type, bad
            )));
        }
        def.capability
            .validate(attributes)
            .map_err(SyncError::Validation)
    }

    /// Resolve the record a `belongs_to` points at, reading the polymorphic
    /// type attribute when needed. `Ok(None)` for a null reference.
    pub fn resolve_reference(
        &self,
        assoc: &AssociationDef,
        attributes: &Attributes,
    ) -> Result<Option<RecordKey>> {
        let Some(fk) = assoc.foreign_key.as_deref() else {
            return Ok(None);
        };
        let id = match attributes.get(fk) {
            None | Some(serde_json::Value::Null) => return Ok(None),
            Some(value) => value.as_u64().ok_or_else(|| {
                SyncError::MalformedEvent(format!("{} is not a record id: {}", fk, value))
            })?,
        };
        let target_type = match &assoc.target {
            AssociationTarget::Fixed(t) => t.clone(),
            AssociationTarget::Polymorphic => {
                let ft = assoc.foreign_type.as_deref().unwrap_or_default();
                match attributes.get(ft) {
                    None | Some(serde_json::Value::Null) => return Ok(None),
                    Some(serde_json::Value::String(t)) => t.clone(),
                    Some(other) => {
                        return Err(SyncError::MalformedEvent(format!(
                            "{} is not a type name: {}",
                            ft, other
                        )))
                    }
                }
            }
        };
        if !self.contains(&target_type) {
            return Err(SyncError::MalformedEvent(format!(
                "{} references unregistered type {}",
                assoc.name, target_type
            )));
        }
        Ok(Some(RecordKey {
            record_type: target_type,
            id: RecordId(id),
        }))
    }

    /// Owner-side collections that list a `member_type` record through its
    /// `belongs_to` named `via`, on records of `owner_type`.
    pub fn inverse_collections<'a>(
        &'a self,
        owner_type: &str,
        member_type: &'a str,
        via: &'a str,
    ) -> impl Iterator<Item = &'a AssociationDef> + 'a {
        self.types
            .get(owner_type)
            .into_iter()
            .flat_map(|def| def.associations.iter())
            .filter(move |a| {
                a.is_collection()
                    && a.through.is_none()
                    && a.fixed_target() == Some(member_type)
                    && a.inverse.as_deref() == Some(via)
            })
    }

    /// For every `belongs_to` on `record_type`, the (before, after) targets when
    /// they differ between two attribute sets.
    pub fn reference_changes(
        &self,
        record_type: &str,
        before: Option<&Attributes>,
        after: Option<&Attributes>,
    ) -> Result<Vec<ReferenceChange>> {
        let def = self.type_def(record_type)?;
        let mut changes = Vec::new();
        for assoc in def.belongs_to() {
            let old = match before {
                Some(attrs) => self.resolve_reference(assoc, attrs)?,
                None => None,
            };
            let new = match after {
                Some(attrs) => self.resolve_reference(assoc, attrs)?,
                None => None,
            };
            if old != new {
                changes.push(ReferenceChange {
                    association: assoc.name.clone(),
                    from: old,
                    to: new,
                });
            }
        }
        Ok(changes)
    }

    /// Members of a `has_many :through` collection given the owner's join
    /// records and a way to read their attributes. Order follows the join
    /// collection, duplicates removed.
    pub fn through_members<'a, F>(
        &self,
        assoc: &AssociationDef,
        join_records: &[RecordKey],
        attributes_of: F,
    ) -> Result<Vec<RecordKey>>
    where
        F: Fn(&RecordKey) -> Option<&'a Attributes>,
    {
        let Some(through) = &assoc.through else {
            return Ok(Vec::new());
        };
        let mut members = Vec::new();
        for join in join_records {
            let Some(attrs) = attributes_of(join) else {
                continue;
            };
            let source = self.association(&join.record_type, &through.source)?;
            if let Some(member) = self.resolve_reference(source, attrs)? {
                let wanted = through
                    .source_type
                    .as_deref()
                    .map_or(true, |t| t == member.record_type);
                if wanted && !members.contains(&member) {
                    members.push(member);
                }
            }
        }
        Ok(members)
    }
}

/// A `belongs_to` whose resolved target changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceChange {
    pub association: String,
    pub from: Option<RecordKey>,
    pub to: Option<RecordKey>,
}
