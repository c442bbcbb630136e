//! Event and operation kinds, and realtime events.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{RecordId, identity_of};

/// Kind of a realtime event pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Patched,
    Removed,
}

impl EventKind {
    /// All event kinds.
    pub const ALL: [EventKind; 4] = [
        EventKind::Created,
        EventKind::Updated,
        EventKind::Patched,
        EventKind::Removed,
    ];

    /// Wire name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Patched => "patched",
            EventKind::Removed => "removed",
        }
    }

    /// The local operation whose server echo carries this kind.
    pub fn operation(self) -> OperationKind {
        match self {
            EventKind::Created => OperationKind::Create,
            EventKind::Updated => OperationKind::Update,
            EventKind::Patched => OperationKind::Patch,
            EventKind::Removed => OperationKind::Remove,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(EventKind::Created),
            "updated" => Ok(EventKind::Updated),
            "patched" => Ok(EventKind::Patched),
            "removed" => Ok(EventKind::Removed),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

/// Kind of a local write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Patch,
    Remove,
}

impl OperationKind {
    /// All operation kinds.
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Create,
        OperationKind::Update,
        OperationKind::Patch,
        OperationKind::Remove,
    ];

    /// The realtime event kind this operation produces.
    pub fn event(self) -> EventKind {
        match self {
            OperationKind::Create => EventKind::Created,
            OperationKind::Update => EventKind::Updated,
            OperationKind::Patch => EventKind::Patched,
            OperationKind::Remove => EventKind::Removed,
        }
    }

    /// Name of the pending indicator watched for this operation.
    pub fn indicator_name(self) -> &'static str {
        match self {
            OperationKind::Create => "isCreatePending",
            OperationKind::Update => "isUpdatePending",
            OperationKind::Patch => "isPatchPending",
            OperationKind::Remove => "isRemovePending",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            OperationKind::Create => 0,
            OperationKind::Update => 1,
            OperationKind::Patch => 2,
            OperationKind::Remove => 3,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Patch => "patch",
            OperationKind::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// A realtime notification: an event kind plus a record or a bare identity.
///
/// `removed` events are commonly delivered as a bare identity; the other
/// kinds carry the full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub kind: EventKind,
    pub payload: Value,
}

impl RealtimeEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// Identity the event refers to.
    pub fn identity(&self, id_field: &str) -> Option<RecordId> {
        match &self.payload {
            Value::Object(_) => identity_of(&self.payload, id_field),
            other => RecordId::from_value(other),
        }
    }
}

/// What happened to a realtime event handed to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Applied as an authoritative external mutation.
    Applied,
    /// Recognized as the echo of a local mutation and skipped.
    Skipped,
}
