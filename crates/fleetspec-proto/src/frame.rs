//! JSON-lines framing.
//!
//! Each line on the connection is one [`Frame`]. Calls carry a correlation
//! id that the matching reply echoes; pushes carry none.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fleetspec_core::PushEvent;

use crate::message::{Command, ErrorCode, RpcError};

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Call(CallFrame),
    Reply(ReplyFrame),
    Push(PushEvent),
}

/// A synchronous call awaiting exactly one reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    pub id: u64,
    pub command: Command,
}

/// The reply to a call. `id` is null only when the call was too malformed
/// to recover its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: Option<u64>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Value),
    Err(RpcError),
}

/// A line that could not be decoded into a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedFrame {
    /// Correlation id, if one could be salvaged.
    pub id: Option<u64>,
    pub reason: String,
}

impl MalformedFrame {
    /// The error reply the sender should get.
    pub fn into_reply(self) -> Frame {
        Frame::Reply(ReplyFrame {
            id: self.id,
            outcome: Outcome::Err(RpcError::new(ErrorCode::Malformed, self.reason)),
        })
    }
}

impl Frame {
    pub fn call(id: u64, command: Command) -> Self {
        Self::Call(CallFrame { id, command })
    }

    pub fn reply(id: u64, outcome: Outcome) -> Self {
        Self::Reply(ReplyFrame {
            id: Some(id),
            outcome,
        })
    }

    /// Encode as one line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one line, salvaging the call id when the rest is unusable.
    pub fn from_line(line: &str) -> Result<Self, MalformedFrame> {
        let value: Value = serde_json::from_str(line).map_err(|e| MalformedFrame {
            id: None,
            reason: format!("invalid JSON: {}", e),
        })?;

        let id = value.get("id").and_then(Value::as_u64);
        serde_json::from_value(value).map_err(|e| MalformedFrame {
            id,
            reason: e.to_string(),
        })
    }
}
