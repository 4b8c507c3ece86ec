//! Core types shared by the server engine and the client mirror.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Attribute name to value. Ordered so diffs and snapshots are deterministic.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Ids at or above this value are client-assigned placeholders for records the
/// server has not confirmed yet.
const PROVISIONAL_BASE: u64 = 1 << 63;

/// Identifier of a record within its type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Placeholder id for an optimistic create.
    pub fn provisional(n: u64) -> Self {
        RecordId(PROVISIONAL_BASE | n)
    }

    pub fn is_provisional(self) -> bool {
        self.0 & PROVISIONAL_BASE != 0
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_provisional() {
            write!(f, "RecordId(~{})", self.0 & !PROVISIONAL_BASE)
        } else {
            write!(f, "RecordId({})", self.0)
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(type, id)` pair that uniquely identifies a record.
///
/// Serialized as `"Type#id"` so it can be used as a JSON object key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey {
    pub record_type: String,
    pub id: RecordId,
}

impl RecordKey {
    pub fn new(record_type: impl Into<String>, id: u64) -> Self {
        Self {
            record_type: record_type.into(),
            id: RecordId(id),
        }
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:?}", self.record_type, self.id)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.record_type, self.id)
    }
}

impl FromStr for RecordKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (record_type, id) = s
            .rsplit_once('#')
            .ok_or_else(|| format!("record key {:?} is missing '#'", s))?;
        if record_type.is_empty() {
            return Err(format!("record key {:?} has an empty type", s));
        }
        let id = id
            .parse::<u64>()
            .map_err(|e| format!("record key {:?}: {}", s, e))?;
        Ok(RecordKey::new(record_type, id))
    }
}

impl TryFrom<String> for RecordKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.to_string()
    }
}

/// Per-record change sequence number. The first event for a record is `Seq(1)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

/// Identifier of a connected (or recently disconnected) session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-assigned token linking a speculative write to its outcome.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new(value: impl Into<String>) -> Self {
        CorrelationId(value.into())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of mutation carried by a change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Destroy,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Create => f.write_str("create"),
            ChangeOp::Update => f.write_str("update"),
            ChangeOp::Destroy => f.write_str("destroy"),
        }
    }
}

/// Membership change of one derived collection on an owner record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDelta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<RecordKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<RecordKey>,
}

/// A single observed mutation of one record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: RecordKey,
    pub op: ChangeOp,
    /// Changed attributes only; the full attribute set for creates; empty for destroys.
    pub diff: Attributes,
    /// Collection view changes on this record (owner side of an association).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<CollectionDelta>,
    pub sequence: Sequence,
    #[serde(default)]
    pub origin: Option<SessionId>,
    #[serde(default)]
    pub correlation: Option<CorrelationId>,
}

impl ChangeEvent {
    /// True if the event carries nothing a subscriber could observe.
    pub fn is_empty(&self) -> bool {
        self.diff.is_empty() && self.collections.is_empty()
    }
}

/// A record with its attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub attributes: Attributes,
}

impl Record {
    pub fn new(key: RecordKey, attributes: Attributes) -> Self {
        Self { key, attributes }
    }

    /// Attribute-less placeholder, used where only the key is known.
    pub fn tombstone(key: RecordKey) -> Self {
        Self {
            key,
            attributes: Attributes::new(),
        }
    }

    pub fn get(&self, attribute: &str) -> Option<&serde_json::Value> {
        self.attributes.get(attribute)
    }
}

/// Addressable subscription channel.
///
/// `owner == None` addresses records of `record_type` (`"Picture.all"`);
/// otherwise it addresses the collection `name` on the owner record
/// (`"Employee#1.pictures"`).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub record_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<RecordId>,
}

impl ScopeKey {
    /// Every record of a type.
    pub fn all(record_type: impl Into<String>) -> Self {
        Self::named(record_type, "all")
    }

    /// A named collection of a type.
    pub fn named(record_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            name: name.into(),
            owner: None,
        }
    }

    /// An association collection of one owner record.
    pub fn relation(owner: &RecordKey, name: impl Into<String>) -> Self {
        Self {
            record_type: owner.record_type.clone(),
            name: name.into(),
            owner: Some(owner.id),
        }
    }

    pub fn owner_key(&self) -> Option<RecordKey> {
        self.owner.map(|id| RecordKey {
            record_type: self.record_type.clone(),
            id,
        })
    }
}

impl fmt::Debug for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({})", self)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(id) => write!(f, "{}#{}.{}", self.record_type, id, self.name),
            None => write!(f, "{}.{}", self.record_type, self.name),
        }
    }
}

/// Who is on the other end of a session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Authenticated user id, if any.
    pub user: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user: Some(id.into()),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}
