//! Policy rule records and their configuration surface.

use crate::error::{Result, SyncError};
use crate::types::{Attributes, ChangeOp, Identity, Record};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Outcome of a policy evaluation. Denial is a value, not an error.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Deny,
    AllowFull,
    AllowPartial(BTreeSet<String>),
}

impl Decision {
    pub fn partial<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Decision::AllowPartial(attributes.into_iter().map(Into::into).collect())
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Decision::Deny)
    }

    /// Combine with a later rule. The result is never wider than `self`.
    pub fn narrow(&self, later: &Decision) -> Decision {
        match (self, later) {
            (Decision::Deny, _) | (_, Decision::Deny) => Decision::Deny,
            (Decision::AllowFull, other) => other.clone(),
            (partial @ Decision::AllowPartial(_), Decision::AllowFull) => partial.clone(),
            (Decision::AllowPartial(a), Decision::AllowPartial(b)) => {
                Decision::AllowPartial(a.intersection(b).cloned().collect())
            }
        }
    }

    pub fn allows(&self, attribute: &str) -> bool {
        match self {
            Decision::Deny => false,
            Decision::AllowFull => true,
            Decision::AllowPartial(set) => set.contains(attribute),
        }
    }

    /// The subset of `attributes` this decision lets through.
    pub fn filter(&self, attributes: &Attributes) -> Attributes {
        match self {
            Decision::Deny => Attributes::new(),
            Decision::AllowFull => attributes.clone(),
            Decision::AllowPartial(set) => attributes
                .iter()
                .filter(|(name, _)| set.contains(*name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }
}

/// What a session is attempting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Open a session.
    Connect,
    /// Observe a record through a broadcast or snapshot.
    Read,
    Create,
    Update,
    Destroy,
    /// Remote query of a scope (count, id list, traversal).
    Query,
}

impl Operation {
    pub fn is_write(self) -> bool {
        matches!(self, Operation::Create | Operation::Update | Operation::Destroy)
    }
}

impl From<ChangeOp> for Operation {
    fn from(op: ChangeOp) -> Self {
        match op {
            ChangeOp::Create => Operation::Create,
            ChangeOp::Update => Operation::Update,
            ChangeOp::Destroy => Operation::Destroy,
        }
    }
}

/// Rule classes in precedence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleClass {
    Connection,
    Broadcast,
    Change,
    Scope,
}

/// Inputs a predicate may look at.
#[derive(Clone, Copy, Debug)]
pub struct PolicyContext<'a> {
    pub identity: Option<&'a Identity>,
    pub record_type: Option<&'a str>,
    pub record: Option<&'a Record>,
    pub operation: Operation,
    pub scope: Option<&'a str>,
}

/// Closed set of rule conditions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    #[default]
    Always,
    Authenticated,
    HasRole { role: String },
    RecordType { types: Vec<String> },
    Operation { ops: Vec<Operation> },
    /// The record's `attribute` equals the session's user id.
    OwnedBy { attribute: String },
    AttributeEquals {
        attribute: String,
        value: serde_json::Value,
    },
    Scope { names: Vec<String> },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn record_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::RecordType {
            types: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn operations(ops: impl IntoIterator<Item = Operation>) -> Self {
        Predicate::Operation {
            ops: ops.into_iter().collect(),
        }
    }

    pub fn matches(&self, ctx: &PolicyContext<'_>) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Authenticated => ctx.identity.map_or(false, Identity::is_authenticated),
            Predicate::HasRole { role } => ctx.identity.map_or(false, |i| i.roles.contains(role)),
            Predicate::RecordType { types } => {
                let record_type = ctx.record_type.or(ctx.record.map(|r| r.key.record_type.as_str()));
                record_type.map_or(false, |t| types.iter().any(|x| x == t))
            }
            Predicate::Operation { ops } => ops.contains(&ctx.operation),
            Predicate::OwnedBy { attribute } => {
                let (Some(identity), Some(record)) = (ctx.identity, ctx.record) else {
                    return false;
                };
                let Some(user) = identity.user.as_deref() else {
                    return false;
                };
                match record.get(attribute) {
                    Some(serde_json::Value::String(s)) => s == user,
                    Some(serde_json::Value::Number(n)) => n.to_string() == user,
                    _ => false,
                }
            }
            Predicate::AttributeEquals { attribute, value } => {
                ctx.record.and_then(|r| r.get(attribute)) == Some(value)
            }
            Predicate::Scope { names } => ctx.scope.map_or(false, |s| names.iter().any(|n| n == s)),
            Predicate::All { of } => of.iter().all(|p| p.matches(ctx)),
            Predicate::Any { of } => of.iter().any(|p| p.matches(ctx)),
            Predicate::Not { predicate } => !predicate.matches(ctx),
        }
    }
}

/// One explicit rule: when `predicate` holds, `effect` applies to `class`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub class: RuleClass,
    #[serde(default)]
    pub predicate: Predicate,
    pub effect: Decision,
}

impl Rule {
    pub fn new(class: RuleClass, predicate: Predicate, effect: Decision) -> Self {
        Self {
            class,
            predicate,
            effect,
        }
    }
}

/// Ordered rule set, loaded once per epoch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub rules: Vec<Rule>,
}

impl PolicyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::Deserialization(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// SHA-256 of the canonical JSON form.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn always_allow_connection(self) -> Self {
        self.rule(Rule::new(RuleClass::Connection, Predicate::Always, Decision::AllowFull))
    }

    pub fn allow_connection_when(self, predicate: Predicate) -> Self {
        self.rule(Rule::new(RuleClass::Connection, predicate, Decision::AllowFull))
    }

    /// Broadcast every attribute of every record.
    pub fn regulate_all_broadcasts_send_all(self) -> Self {
        self.rule(Rule::new(RuleClass::Broadcast, Predicate::Always, Decision::AllowFull))
    }

    pub fn regulate_broadcast(self, predicate: Predicate, effect: Decision) -> Self {
        self.rule(Rule::new(RuleClass::Broadcast, predicate, effect))
    }

    /// Allow session writes of the given kinds to every type.
    pub fn allow_change(self, ops: impl IntoIterator<Item = ChangeOp>) -> Self {
        let ops = ops.into_iter().map(Operation::from);
        self.rule(Rule::new(
            RuleClass::Change,
            Predicate::operations(ops),
            Decision::AllowFull,
        ))
    }

    /// Allow session writes of the given kinds to specific types.
    pub fn allow_change_to<I, S>(self, types: I, ops: impl IntoIterator<Item = ChangeOp>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ops = ops.into_iter().map(Operation::from);
        self.rule(Rule::new(
            RuleClass::Change,
            Predicate::All {
                of: vec![Predicate::record_types(types), Predicate::operations(ops)],
            },
            Decision::AllowFull,
        ))
    }

    pub fn regulate_change(self, predicate: Predicate, effect: Decision) -> Self {
        self.rule(Rule::new(RuleClass::Change, predicate, effect))
    }

    /// Expose scopes of `record_type` to remote queries. An empty `names`
    /// exposes every scope of the type.
    pub fn regulate_scope<S: Into<String>>(
        self,
        record_type: impl Into<String>,
        names: impl IntoIterator<Item = S>,
        effect: Decision,
    ) -> Self {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let type_match = Predicate::record_types([record_type.into()]);
        let predicate = if names.is_empty() {
            type_match
        } else {
            Predicate::All {
                of: vec![type_match, Predicate::Scope { names }],
            }
        };
        self.rule(Rule::new(RuleClass::Scope, predicate, effect))
    }
}
