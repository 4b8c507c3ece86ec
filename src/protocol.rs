//! Wire messages exchanged between the engine and client sessions.
//!
//! Transport is out of scope; messages are serde types with a JSON codec,
//! tagged by `op`.

use crate::error::{Result, SyncError};
use crate::types::{
    Attributes, ChangeEvent, ChangeOp, CollectionDelta, CorrelationId, RecordId, RecordKey,
    ScopeKey, Sequence,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Messages sent by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Write(WriteRequest),
}

/// Request delivery of future deltas for a scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub scope: ScopeKey,
    pub session_token: String,
    /// Last sequence the client applied per record, asking for only the gap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from_seq: Option<BTreeMap<RecordKey, Sequence>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub scope: ScopeKey,
    pub session_token: String,
}

/// A session-originated mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub record_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    pub change_op: ChangeOp,
    #[serde(default)]
    pub attrs: Attributes,
    pub correlation_id: CorrelationId,
}

impl WriteRequest {
    pub fn key(&self) -> Option<RecordKey> {
        self.record_id.map(|id| RecordKey {
            record_type: self.record_type.clone(),
            id,
        })
    }
}

/// Messages sent by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    Change(DeltaMessage),
    Reject(RejectMessage),
    Snapshot(RecordSnapshot),
}

/// One change as seen by one session (attributes already filtered).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaMessage {
    pub record_type: String,
    pub record_id: RecordId,
    pub change_op: ChangeOp,
    #[serde(default)]
    pub attrs: Attributes,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<CollectionDelta>,
    pub sequence: Sequence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl DeltaMessage {
    pub fn from_event(event: &ChangeEvent, attrs: Attributes, collections: Vec<CollectionDelta>) -> Self {
        Self {
            record_type: event.key.record_type.clone(),
            record_id: event.key.id,
            change_op: event.op,
            attrs,
            collections,
            sequence: event.sequence,
            correlation_id: event.correlation.clone(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            record_type: self.record_type.clone(),
            id: self.record_id,
        }
    }

    /// Validate and convert into a change event.
    pub fn into_event(self) -> Result<ChangeEvent> {
        if self.record_type.is_empty() {
            return Err(SyncError::MalformedEvent("empty record type".into()));
        }
        if self.sequence == Sequence(0) {
            return Err(SyncError::MalformedEvent(format!(
                "{} carries sequence 0",
                self.key()
            )));
        }
        if self.change_op == ChangeOp::Destroy && !self.attrs.is_empty() {
            return Err(SyncError::MalformedEvent(format!(
                "destroy of {} carries attributes",
                self.key()
            )));
        }
        Ok(ChangeEvent {
            key: self.key(),
            op: self.change_op,
            diff: self.attrs,
            collections: self.collections,
            sequence: self.sequence,
            origin: None,
            correlation: self.correlation_id,
        })
    }
}

/// Why a write was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    PolicyDenied,
    Validation,
    NotFound,
    /// No answer within the acknowledgment window (client-side only).
    Timeout,
    /// Session went away before the write was reconciled (client-side only).
    Disconnected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectMessage {
    pub correlation_id: CorrelationId,
    pub reason_kind: RejectReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Full current state of one record as visible to one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSnapshot {
    pub record_type: String,
    pub record_id: RecordId,
    /// False when the record is gone or not visible.
    pub exists: bool,
    #[serde(default)]
    pub attrs: Attributes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub collections: BTreeMap<String, Vec<RecordKey>>,
    pub sequence: Sequence,
}

impl RecordSnapshot {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            record_type: self.record_type.clone(),
            id: self.record_id,
        }
    }

    pub fn missing(key: &RecordKey, sequence: Sequence) -> Self {
        Self {
            record_type: key.record_type.clone(),
            record_id: key.id,
            exists: false,
            attrs: Attributes::new(),
            collections: BTreeMap::new(),
            sequence,
        }
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::MalformedEvent(e.to_string()))
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::MalformedEvent(e.to_string()))
    }
}
