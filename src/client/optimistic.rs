//! Optimistic local writes awaiting confirmation.

use crate::protocol::RejectReason;
use crate::types::{Attributes, ChangeOp, CorrelationId, RecordId, RecordKey};
use std::time::Instant;

/// A mutation issued by the local user.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalWrite {
    pub record_type: String,
    /// `None` for a create whose id the server assigns.
    pub record_id: Option<RecordId>,
    pub op: ChangeOp,
    pub attrs: Attributes,
    /// Generated when absent.
    pub correlation: Option<CorrelationId>,
}

impl LocalWrite {
    pub fn create(record_type: impl Into<String>, attrs: Attributes) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: None,
            op: ChangeOp::Create,
            attrs,
            correlation: None,
        }
    }

    pub fn update(key: &RecordKey, attrs: Attributes) -> Self {
        Self {
            record_type: key.record_type.clone(),
            record_id: Some(key.id),
            op: ChangeOp::Update,
            attrs,
            correlation: None,
        }
    }

    pub fn destroy(key: &RecordKey) -> Self {
        Self {
            record_type: key.record_type.clone(),
            record_id: Some(key.id),
            op: ChangeOp::Destroy,
            attrs: Attributes::new(),
            correlation: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationId) -> Self {
        self.correlation = Some(correlation);
        self
    }
}

/// A speculative write applied locally but not yet reconciled.
#[derive(Clone, Debug)]
pub(crate) struct PendingWrite {
    pub correlation: CorrelationId,
    pub key: RecordKey,
    pub op: ChangeOp,
    pub attrs: Attributes,
    pub issued: Instant,
}

impl PendingWrite {
    /// Layer this write over `base`.
    pub fn apply_to(&self, base: Option<Attributes>) -> Option<Attributes> {
        match self.op {
            ChangeOp::Create => Some(self.attrs.clone()),
            ChangeOp::Update => base.map(|mut attributes| {
                attributes.extend(self.attrs.clone());
                attributes
            }),
            ChangeOp::Destroy => None,
        }
    }
}

/// A speculative write that was rolled back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub correlation: CorrelationId,
    pub key: RecordKey,
    pub reason: RejectReason,
}

/// Displayed state: the confirmed base with every pending write on the
/// record layered on in issue order.
pub(crate) fn derive<'a>(
    base: Option<Attributes>,
    writes: impl Iterator<Item = &'a PendingWrite>,
) -> Option<Attributes> {
    writes.fold(base, |state, write| write.apply_to(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: serde_json::Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    fn pending(op: ChangeOp, a: serde_json::Value) -> PendingWrite {
        PendingWrite {
            correlation: CorrelationId::new("c"),
            key: RecordKey::new("Picture", 1),
            op,
            attrs: attrs(a),
            issued: Instant::now(),
        }
    }

    #[test]
    fn test_derive_layers_in_order() {
        let writes = vec![
            pending(ChangeOp::Update, json!({"name": "b"})),
            pending(ChangeOp::Update, json!({"size": 2})),
        ];
        let shown = derive(Some(attrs(json!({"name": "a", "size": 1}))), writes.iter());
        assert_eq!(shown, Some(attrs(json!({"name": "b", "size": 2}))));
    }

    #[test]
    fn test_update_over_missing_stays_missing() {
        let writes = vec![pending(ChangeOp::Update, json!({"name": "b"}))];
        assert_eq!(derive(None, writes.iter()), None);

        let writes = vec![
            pending(ChangeOp::Destroy, json!({})),
            pending(ChangeOp::Create, json!({"name": "c"})),
        ];
        assert_eq!(
            derive(Some(Attributes::new()), writes.iter()),
            Some(attrs(json!({"name": "c"})))
        );
    }
}
