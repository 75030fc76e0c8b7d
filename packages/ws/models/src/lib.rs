//! Wire models shared by every `switchboard` process.
//!
//! * [`Event`] - the self-describing `{"event": ..., "data": ...}` envelope used for
//!   structured dispatch
//! * [`DistributedPayload`] - the struct carried over the cluster backbone
//! * [`Channel`] - the fixed set of backbone channels that partition broadcast intent

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, EnumIter, EnumString};

/// Arbitrary application-defined value attached to a client.
///
/// A stored [`Value::Null`] is a present value; absence is expressed with `Option`.
pub type MetadataValue = Value;

/// A structured message with a named identifier and an arbitrary JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, used as the dispatch key.
    #[serde(rename = "event")]
    pub identifier: String,
    /// Event payload. Defaults to `null` when the sender omits it.
    #[serde(default)]
    pub data: Value,
}

impl Event {
    #[must_use]
    pub fn new(identifier: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            identifier: identifier.into(),
            data: data.into(),
        }
    }

    /// Builds an event from any serializable payload.
    ///
    /// # Errors
    ///
    /// * If `data` fails to serialize to a JSON value
    pub fn from_serializable<T: Serialize + ?Sized>(
        identifier: impl Into<String>,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            identifier: identifier.into(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Encodes the event to its wire form.
    ///
    /// # Errors
    ///
    /// * If the event fails to serialize
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an event from its wire form.
    ///
    /// # Errors
    ///
    /// * If `bytes` is not a JSON object with a string `event` field
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Returns the decoded event if `bytes` is a JSON object that decodes into the
    /// event shape, `None` if the frame should be treated as a raw message.
    #[must_use]
    pub fn classify(bytes: &[u8]) -> Option<Self> {
        if !is_json_object(bytes) {
            return None;
        }

        Self::from_slice(bytes).ok()
    }
}

/// Cheap syntactic check that `bytes` is delimited like a JSON object.
#[must_use]
pub fn is_json_object(bytes: &[u8]) -> bool {
    let trimmed = bytes.trim_ascii();
    trimmed.len() >= 2 && trimmed[0] == b'{' && trimmed[trimmed.len() - 1] == b'}'
}

/// Backbone channels. Each variant carries one broadcast intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumString, EnumIter)]
pub enum Channel {
    /// Free-form log lines shared between processes.
    #[strum(serialize = "switchboard")]
    Default,
    #[strum(serialize = "switchboard:client")]
    Client,
    #[strum(serialize = "switchboard:client:event")]
    ClientEvent,
    #[strum(serialize = "switchboard:room")]
    Room,
    #[strum(serialize = "switchboard:room:event")]
    RoomEvent,
    /// All clients. A target id, when present, names the client to skip.
    #[strum(serialize = "switchboard:all")]
    All,
    /// All clients, event form. A target id, when present, names the client to skip.
    #[strum(serialize = "switchboard:all:event")]
    AllEvent,
    #[strum(serialize = "switchboard:metadata")]
    Metadata,
    #[strum(serialize = "switchboard:metadata:event")]
    MetadataEvent,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Payload carried over the backbone.
///
/// Exactly one of `message`/`event` is expected to be populated per publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedPayload {
    /// Room id or client id, depending on the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Raw message bytes, base64 encoded on the wire.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub message: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_value: Option<MetadataValue>,
}

impl DistributedPayload {
    #[must_use]
    pub fn message(id: Option<String>, message: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn event(id: Option<String>, event: Event) -> Self {
        Self {
            id,
            event: Some(event),
            ..Default::default()
        }
    }

    /// Sets the metadata predicate used by the metadata channels.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: MetadataValue) -> Self {
        self.meta_key = Some(key.into());
        self.meta_value = Some(value);
        self
    }

    /// # Errors
    ///
    /// * If the payload fails to serialize
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// # Errors
    ///
    /// * If `json` is not a valid payload
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize as _, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
