//! Manager/worker message contract.
//!
//! One request line goes to the worker: `{"record": ...}`. Exactly one reply
//! line comes back: `{"ok":true,"bytes":"<base64>"}` on success or
//! `{"ok":false,"error":"..."}` on failure. Anything else is malformed.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// The single input message of a worker unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub record: Value,
}

impl WorkerRequest {
    pub fn new(record: Value) -> Self {
        Self { record }
    }

    /// Encode as one newline-terminated JSON line.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// The single terminal message of a worker unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Success(Bytes),
    Failure(String),
}

#[derive(Serialize, Deserialize)]
struct WireReply {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bytes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl WorkerReply {
    /// Encode as one newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String> {
        let wire = match self {
            WorkerReply::Success(bytes) => WireReply {
                ok: true,
                bytes: Some(STANDARD.encode(bytes)),
                error: None,
            },
            WorkerReply::Failure(error) => WireReply {
                ok: false,
                bytes: None,
                error: Some(error.clone()),
            },
        };
        let mut line = serde_json::to_string(&wire)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse a reply line.
    pub fn parse(line: &str) -> Result<Self> {
        let wire: WireReply = serde_json::from_str(line.trim())
            .map_err(|e| Error::protocol(format!("unparsable reply: {}", e)))?;

        match wire {
            WireReply {
                ok: true,
                bytes: Some(encoded),
                ..
            } => STANDARD
                .decode(encoded.as_bytes())
                .map(|decoded| WorkerReply::Success(Bytes::from(decoded)))
                .map_err(|e| Error::protocol(format!("invalid base64 payload: {}", e))),
            WireReply { ok: true, .. } => Err(Error::protocol("success reply without bytes")),
            WireReply {
                ok: false,
                error: Some(error),
                ..
            } => Ok(WorkerReply::Failure(error)),
            WireReply { ok: false, .. } => Err(Error::protocol("failure reply without error")),
        }
    }
}
