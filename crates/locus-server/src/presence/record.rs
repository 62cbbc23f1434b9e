//! Presence records and the wire messages built from them.
//!
//! Inbound frames are parsed into [`ClientMessage`]; the stored state is a
//! [`PresenceRecord`]. The two are deliberately separate types: only the
//! fields listed on the record are ever authoritative, and identity fields
//! always come from the authenticated connection, never from the frame.

use std::sync::Arc;

use locus_core::UserId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::PresenceError;

/// Keys a client may not set through free-form fields.
const RESERVED_KEYS: [&str; 6] = [
    "userId",
    "username",
    "timestamp",
    "isSelf",
    "isDisconnected",
    "disconnectedAt",
];

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

/// Latest known state of one user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Owner.
    pub user_id: UserId,
    /// Owner's display name.
    pub username: String,
    /// Latitude in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    /// Longitude in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    /// Reported accuracy radius in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Whether non-admin users may see this record.
    #[serde(default)]
    pub show_location_to_everyone: bool,
    /// Last write, epoch milliseconds.
    pub timestamp: i64,
    /// Set while the owner is disconnected and the record awaits purge.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_disconnected: bool,
    /// When the owner disconnected, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<i64>,
    /// Free-form fields of generic state updates.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PresenceRecord {
    /// An empty record for a user that has not reported anything yet.
    pub fn new(user_id: UserId, username: String, timestamp: i64) -> Self {
        Self {
            user_id,
            username,
            lat: None,
            lng: None,
            accuracy: None,
            show_location_to_everyone: false,
            timestamp,
            is_disconnected: false,
            disconnected_at: None,
            extra: Map::new(),
        }
    }

    /// Whether both coordinates are known.
    pub fn has_location(&self) -> bool {
        self.lat.is_some() && self.lng.is_some()
    }

    /// Serialize once for every kind of recipient.
    pub fn encode(&self) -> Result<EncodedFrames, serde_json::Error> {
        Ok(EncodedFrames {
            for_others: Arc::new(serde_json::to_string(&RecordFrame {
                record: self,
                is_self: false,
            })?),
            for_owner: Arc::new(serde_json::to_string(&RecordFrame {
                record: self,
                is_self: true,
            })?),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordFrame<'a> {
    #[serde(flatten)]
    record: &'a PresenceRecord,
    #[serde(skip_serializing_if = "is_false")]
    is_self: bool,
}

/// A frame serialized for its owner (`isSelf: true`) and for everyone else.
#[derive(Clone, Debug)]
pub struct EncodedFrames {
    /// Frame sent to recipients other than the owner.
    pub for_others: Arc<String>,
    /// Frame sent back to the owner.
    pub for_owner: Arc<String>,
}

/// Departure notice; always public.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectNotice {
    /// User that left (or is being hidden).
    pub user_id: UserId,
    /// That user's display name.
    pub username: String,
    /// Always `"disconnect"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl DisconnectNotice {
    /// Build a notice for `user_id`.
    pub fn new(user_id: UserId, username: String, timestamp: i64) -> Self {
        Self {
            user_id,
            username,
            kind: "disconnect".to_string(),
            timestamp,
        }
    }
}

/// A one-shot action relayed to the users allowed to see its author.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFrame<'a> {
    /// Author.
    pub user_id: &'a UserId,
    /// Author's display name.
    pub username: &'a str,
    /// Always `"action"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Set on the author's own copy.
    #[serde(skip_serializing_if = "is_false")]
    pub is_self: bool,
    /// Client-defined action payload.
    #[serde(flatten)]
    pub payload: &'a Map<String, Value>,
}

/// Reply to a client-level `ping`.
pub const PONG_FRAME: &str = r#"{"type":"pong"}"#;

/// A validated coordinate pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coordinates {
    /// Latitude in degrees, `[-90, 90]`.
    pub lat: f64,
    /// Longitude in degrees, `[-180, 180]`.
    pub lng: f64,
}

/// A state-bearing update from a client.
///
/// Absent fields leave the stored value untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateUpdate {
    /// New position.
    pub coordinates: Option<Coordinates>,
    /// New accuracy radius.
    pub accuracy: Option<f64>,
    /// New visibility.
    pub show_location_to_everyone: Option<bool>,
    /// Bypass throttling (`immediate` or `forceUpdate`).
    pub immediate: bool,
    /// Free-form fields, replacing the stored ones when non-empty.
    pub extra: Map<String, Value>,
}

/// A parsed inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// `{type: "disconnect"}`.
    Disconnect,
    /// `{type: "ping"}`.
    Ping,
    /// `{type: "visibility", showLocationToEveryone}`.
    Visibility {
        /// Requested visibility.
        show_location_to_everyone: bool,
    },
    /// `{type: "action", ...}`.
    Action {
        /// Everything but `type` and identity fields.
        payload: Map<String, Value>,
    },
    /// `{type: "subscribe", topics: [...]}`.
    Subscribe {
        /// Topic names; non-string entries are skipped.
        topics: Vec<String>,
    },
    /// `{type: "unsubscribe", topics: [...]}`.
    Unsubscribe {
        /// Topic names; non-string entries are skipped.
        topics: Vec<String>,
    },
    /// `{type: "publish", topic, ...}`, relayed verbatim to the topic.
    Publish {
        /// Target topic.
        topic: String,
        /// The whole frame as received.
        message: Map<String, Value>,
    },
    /// A location report or any other state update.
    Update(StateUpdate),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lng: Option<f64>,
    #[serde(default)]
    accuracy: Option<f64>,
    #[serde(default)]
    immediate: Option<bool>,
    #[serde(default)]
    force_update: Option<bool>,
    #[serde(default)]
    show_location_to_everyone: Option<bool>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl ClientMessage {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, PresenceError> {
        let object: Map<String, Value> = serde_json::from_str(text).map_err(PresenceError::malformed)?;
        let kind = object.get("type").and_then(Value::as_str).map(str::to_string);
        match kind.as_deref() {
            Some("subscribe") => return Ok(Self::Subscribe { topics: topic_names(&object)? }),
            Some("unsubscribe") => return Ok(Self::Unsubscribe { topics: topic_names(&object)? }),
            Some("publish") => {
                let topic = object
                    .get("topic")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| PresenceError::MalformedMessage("publish without topic".to_string()))?;
                return Ok(Self::Publish { topic, message: object });
            }
            _ => {}
        }

        let mut raw: RawFrame =
            serde_json::from_value(Value::Object(object)).map_err(PresenceError::malformed)?;
        for key in RESERVED_KEYS {
            let _ = raw.extra.remove(key);
        }

        match raw.kind.as_deref() {
            Some("disconnect") => Ok(Self::Disconnect),
            Some("ping") => Ok(Self::Ping),
            Some("visibility") => {
                let show = raw.show_location_to_everyone.ok_or_else(|| {
                    PresenceError::MalformedMessage(
                        "visibility message without showLocationToEveryone".to_string(),
                    )
                })?;
                Ok(Self::Visibility {
                    show_location_to_everyone: show,
                })
            }
            Some("action") => {
                let mut payload = raw.extra;
                for (key, value) in [("lat", raw.lat), ("lng", raw.lng), ("accuracy", raw.accuracy)] {
                    if let Some(v) = value.and_then(serde_json::Number::from_f64) {
                        let _ = payload.insert(key.to_string(), Value::Number(v));
                    }
                }
                Ok(Self::Action { payload })
            }
            other => {
                let coordinates = validate_coordinates(raw.lat, raw.lng)?;
                if let Some(accuracy) = raw.accuracy {
                    if !accuracy.is_finite() || accuracy < 0.0 {
                        return Err(PresenceError::MalformedMessage(format!(
                            "accuracy out of range: {accuracy}"
                        )));
                    }
                }
                let mut extra = raw.extra;
                // unrecognized types are generic state and kept as-is
                if let Some(kind) = other {
                    let _ = extra.insert("type".to_string(), Value::String(kind.to_string()));
                }
                Ok(Self::Update(StateUpdate {
                    coordinates,
                    accuracy: raw.accuracy,
                    show_location_to_everyone: raw.show_location_to_everyone,
                    immediate: raw.immediate.unwrap_or(false) || raw.force_update.unwrap_or(false),
                    extra,
                }))
            }
        }
    }
}

fn topic_names(object: &Map<String, Value>) -> Result<Vec<String>, PresenceError> {
    match object.get("topics") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()),
        Some(_) => Err(PresenceError::MalformedMessage("topics must be an array".to_string())),
    }
}

fn validate_coordinates(
    lat: Option<f64>,
    lng: Option<f64>,
) -> Result<Option<Coordinates>, PresenceError> {
    match (lat, lng) {
        (None, None) => Ok(None),
        (Some(lat), Some(lng)) => {
            if !(lat.is_finite() && (-90.0..=90.0).contains(&lat)) {
                return Err(PresenceError::MalformedMessage(format!(
                    "latitude out of range: {lat}"
                )));
            }
            if !(lng.is_finite() && (-180.0..=180.0).contains(&lng)) {
                return Err(PresenceError::MalformedMessage(format!(
                    "longitude out of range: {lng}"
                )));
            }
            Ok(Some(Coordinates { lat, lng }))
        }
        _ => Err(PresenceError::MalformedMessage(
            "lat and lng must be sent together".to_string(),
        )),
    }
}
