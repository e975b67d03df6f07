//! Wire messages exchanged between peers.
//!
//! Three message kinds share one envelope keyed by a numeric `type` field:
//! PATCH (10) carries a row delta, PING (20) carries a peer-stat map on the
//! reserved table `_`, MISSING_PATCH (30) asks any recipient to replay a
//! producer's sequence range.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ReplicationError;
use crate::hlc::Hlc;
use crate::peer::PeerId;

/// Reserved table name for peer-stat pings.
pub const PING_TABLE: &str = "_";

pub const MSG_PATCH: u64 = 10;
pub const MSG_PING: u64 = 20;
pub const MSG_MISSING_PATCH: u64 = 30;

/// An immutable, per-peer, per-row change: a partial column mapping plus
/// provenance. PINGs reuse this shape with `tab == "_"` and the peer-stat
/// map as the delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub at: Hlc,
    pub peer: PeerId,
    pub seq: i64,
    pub ver: u32,
    pub tab: String,
    pub delta: Map<String, Value>,
}

impl Patch {
    /// Whether this patch is a peer-stat ping rather than a row change.
    pub fn is_ping(&self) -> bool {
        self.tab == PING_TABLE
    }
}

/// "I, `for_peer`, ask you (any recipient) for patches produced by `peer`
/// in `[min_seq..max_seq]`."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingPatchRequest {
    pub peer: PeerId,
    pub min_seq: i64,
    pub max_seq: i64,
    pub for_peer: PeerId,
}

/// A decoded inbound or outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Patch(Patch),
    Ping(Patch),
    MissingPatch(MissingPatchRequest),
}

/// What actually travels on a socket: a structured record, or its JSON text
/// when `socket_string_mode` is set.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Structured(Value),
    Text(String),
}

impl Message {
    fn type_tag(&self) -> u64 {
        match self {
            Self::Patch(_) => MSG_PATCH,
            Self::Ping(_) => MSG_PING,
            Self::MissingPatch(_) => MSG_MISSING_PATCH,
        }
    }

    /// Encode to the wire envelope (a JSON object with a `type` field).
    pub fn to_value(&self) -> Value {
        let mut obj = match self {
            Self::Patch(p) | Self::Ping(p) => serde_json::to_value(p),
            Self::MissingPatch(r) => serde_json::to_value(r),
        }
        .expect("wire messages serialize infallibly");
        obj.as_object_mut()
            .expect("wire envelope is an object")
            .insert("type".to_string(), Value::from(self.type_tag()));
        obj
    }

    /// Decode from the wire envelope.
    pub fn from_value(value: &Value) -> Result<Self, ReplicationError> {
        let kind = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ReplicationError::MalformedMessage {
                reason: "missing numeric type field".to_string(),
            })?;
        let malformed = |e: serde_json::Error| ReplicationError::MalformedMessage {
            reason: e.to_string(),
        };
        match kind {
            MSG_PATCH => Ok(Self::Patch(
                serde_json::from_value(value.clone()).map_err(malformed)?,
            )),
            MSG_PING => Ok(Self::Ping(
                serde_json::from_value(value.clone()).map_err(malformed)?,
            )),
            MSG_MISSING_PATCH => Ok(Self::MissingPatch(
                serde_json::from_value(value.clone()).map_err(malformed)?,
            )),
            other => Err(ReplicationError::UnsupportedMessageType { kind: other }),
        }
    }

    /// Encode for a socket, honouring `socket_string_mode`.
    pub fn to_frame(&self, string_mode: bool) -> WireFrame {
        let value = self.to_value();
        if string_mode {
            WireFrame::Text(value.to_string())
        } else {
            WireFrame::Structured(value)
        }
    }

    /// Decode from a socket frame. Both encodings are accepted regardless of
    /// the configured mode.
    pub fn from_frame(frame: &WireFrame) -> Result<Self, ReplicationError> {
        match frame {
            WireFrame::Structured(value) => Self::from_value(value),
            WireFrame::Text(text) => {
                let value: Value =
                    serde_json::from_str(text).map_err(|e| ReplicationError::MalformedMessage {
                        reason: e.to_string(),
                    })?;
                Self::from_value(&value)
            }
        }
    }
}
