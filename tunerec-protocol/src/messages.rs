//! Request, response, and notification messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::types::{EncodeJobSpec, RecordOption, ReserveEntry, Rule};

/// Every request is treated as failed once this much time has passed
/// without a matching response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// A request with a caller-chosen correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: RequestOp,
}

/// Operations the control channel supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestOp {
    /// Add a manual reservation for a program.
    AddReserve {
        program_id: i64,
        #[serde(default)]
        option: RecordOption,
    },
    /// Cancel a reservation (manual delete, or exclude a rule match).
    CancelReserve { program_id: i64 },
    /// Toggle the skip flag on a reservation without deleting it.
    SkipReserve { program_id: i64, skip: bool },
    /// Create a rule. The assigned id comes back in the response.
    AddRule { rule: Rule },
    UpdateRule { rule: Rule },
    DeleteRule { rule_id: i64 },
    EnableRule { rule_id: i64 },
    DisableRule { rule_id: i64 },
    /// Delete a recording row and its files.
    DeleteRecorded { recorded_id: i64 },
    /// Register an additional (encoded) output file for a recording.
    RegisterEncodedFile {
        recorded_id: i64,
        name: String,
        path: String,
    },
    /// Recompute the whole reservation set now.
    UpdateAllReserves,
    /// Fetch the current reservation set.
    GetReserves,
}

/// Response to a [`Request`], echoing its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub code: ErrorCode,
    /// Operation-specific payload; absent on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ResponseBody>,
    /// Human-readable error detail; absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn ok(id: u64) -> Self {
        Self {
            id,
            code: ErrorCode::Success,
            body: None,
            message: None,
        }
    }

    pub fn ok_with(id: u64, body: ResponseBody) -> Self {
        Self {
            id,
            code: ErrorCode::Success,
            body: Some(body),
            message: None,
        }
    }

    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            code,
            body: None,
            message: Some(message.into()),
        }
    }
}

/// Operation-specific response payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "body", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Id assigned to a newly created rule.
    RuleId { rule_id: i64 },
    /// The current reservation set, sorted by start time.
    Reserves { reserves: Vec<ReserveEntry> },
}

/// Fire-and-forget messages. No correlation id, no response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// Server-side state changed; observers should refresh.
    ClientStateChanged,
    /// An encode job is handed to the encoder role.
    EncodeJobHandoff { job: EncodeJobSpec },
}
