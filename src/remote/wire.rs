//! JSON messages exchanged with the services.
//!
//! The log service speaks newline-delimited JSON over one persistent TCP
//! stream. Payload bytes travel base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::types::{NimbusError, Result, TimelineId, WalRecord};

/// Requests understood by the log service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRequest {
    /// Append one record.
    Append {
        /// Target timeline.
        timeline_id: u64,
        /// Record sequence number.
        lsn: u64,
        /// Payload length before encoding.
        length: u32,
        /// Base64 payload.
        data: String,
    },
    /// Create a timeline.
    CreateTimeline {
        /// Timeline to create.
        timeline_id: u64,
    },
    /// Delete a timeline.
    DeleteTimeline {
        /// Timeline to delete.
        timeline_id: u64,
    },
    /// Query the committed position of a timeline.
    TimelineStatus {
        /// Timeline to query.
        timeline_id: u64,
    },
    /// Liveness probe.
    Ping,
}

impl LogRequest {
    /// Builds an append request for `record`.
    pub fn append(timeline: TimelineId, record: &WalRecord) -> Self {
        LogRequest::Append {
            timeline_id: timeline.get(),
            lsn: record.lsn().0,
            length: record.len(),
            data: STANDARD.encode(record.data()),
        }
    }

    /// Encodes the request as one line, newline included.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line =
            serde_json::to_vec(self).map_err(|err| NimbusError::Protocol(err.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Replies sent by the log service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LogResponse {
    /// Request succeeded.
    Ok {
        /// Durably committed position, present on append acknowledgments.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        committed_lsn: Option<u64>,
    },
    /// Request failed on the service side.
    Error {
        /// Service-defined status code.
        #[serde(default)]
        code: u16,
        /// Human readable reason.
        #[serde(default)]
        message: String,
    },
}

impl LogResponse {
    /// Decodes one response line.
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end())
            .map_err(|err| NimbusError::Protocol(format!("bad log response: {err}")))
    }
}

/// Body of the page service's timeline metadata endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineInfo {
    /// Latest durable position of the timeline.
    pub latest_lsn: u64,
}

/// Decodes a base64 payload carried in an append request.
pub fn decode_payload(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|err| NimbusError::Protocol(format!("bad payload encoding: {err}")))
}
