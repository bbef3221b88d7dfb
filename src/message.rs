//! Wire messages exchanged with the Studio plugin. Every WebSocket text
//! frame carries exactly one JSON object with a `type` discriminator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable 128-bit identity for an instance, as lowercase hex without dashes.
/// Assigned by the plugin and persisted on the Roblox side via the
/// `AzulSyncGUID` attribute.
pub type Guid = String;

/// Guid of the synthetic DataModel root.
pub const ROOT_GUID: &str = "root";

#[inline]
pub fn is_script_class(class_name: &str) -> bool {
    matches!(class_name, "Script" | "LocalScript" | "ModuleScript")
}

/// One instance as described by the plugin. `path` includes the instance's
/// own name; `parent_guid` is preferred over path-based parent resolution
/// when both are present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceData {
    pub guid: Guid,
    pub class_name: String,
    pub name: String,
    pub path: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_guid: Option<Guid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, serde_json::Value>>,
}

impl InstanceData {
    pub fn is_script(&self) -> bool {
        is_script_class(&self.class_name)
    }
}

/// Messages the plugin sends to the daemon.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IncomingMessage {
    FullSnapshot { data: Vec<InstanceData> },
    InstanceUpdated { data: InstanceData },
    InstanceDeleted { guid: Guid },
    ScriptSourceChanged { guid: Guid, source: String },
}

/// Messages the daemon sends to the plugin.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutgoingMessage {
    #[serde(rename_all = "camelCase")]
    RequestSnapshot {
        #[serde(skip_serializing_if = "Option::is_none")]
        include_properties: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        scripts_and_descendants_only: Option<bool>,
    },
    BuildSnapshot {
        data: Vec<InstanceData>,
    },
    #[serde(rename_all = "camelCase")]
    ScriptSourceChanged {
        guid: Guid,
        source: String,
    },
    #[serde(rename_all = "camelCase")]
    ApplyPatch {
        #[serde(skip_serializing_if = "Vec::is_empty")]
        updated: Vec<InstanceData>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        removed: Vec<Guid>,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not a JSON object; the connection should be closed.
    #[error("malformed message frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The `type` discriminator was missing or not a string.
    #[error("message frame has no \"type\" discriminator")]
    MissingType,

    /// A well-formed frame of a type we don't understand. Logged and
    /// skipped; the session survives.
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    /// Known type, but the payload did not match its schema.
    #[error("invalid {kind:?} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

const KNOWN_INCOMING_TYPES: &[&str] = &[
    "fullSnapshot",
    "instanceUpdated",
    "instanceDeleted",
    "scriptSourceChanged",
];

/// Decodes one frame. The `type` field is inspected before deserializing so
/// that unknown types surface as [`ProtocolError::UnknownType`] (skippable)
/// rather than as a hard parse failure.
pub fn decode_incoming(frame: &str) -> Result<IncomingMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(frame).map_err(ProtocolError::Malformed)?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?;

    if !KNOWN_INCOMING_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_owned()));
    }

    let kind = kind.to_owned();
    serde_json::from_value(value)
        .map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

pub fn encode_outgoing(message: &OutgoingMessage) -> String {
    serde_json::to_string(message).expect("outgoing messages always serialize")
}

impl ProtocolError {
    /// Whether the session can keep the connection after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::UnknownType(_))
    }
}
