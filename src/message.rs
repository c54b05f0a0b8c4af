//! Module that contains every message exchanged between nodes.
//!
//! Each [`Rpc`] travels as one JSON line and is answered by exactly one
//! [`Reply`] line.

use crate::{error::Result, lock::LockBusy};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap, fmt};

/// Stable identity of a participant (a student's roll number, `"teacher"`, ...).
///
/// Numeric ids order numerically and sort ahead of every non-numeric id, so
/// `"9" < "10" < "teacher"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for ParticipantId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ParticipantId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A critical-section request. Field order gives the `(timestamp, id)` total order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Request {
    pub timestamp: u64,
    pub participant: ParticipantId,
}

impl Request {
    pub fn new(timestamp: u64, participant: ParticipantId) -> Self {
        Self {
            timestamp,
            participant,
        }
    }
}

/// One row of the result table, keyed by participant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: ParticipantId,
    pub fields: BTreeMap<String, String>,
}

impl Record {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl ToString) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// A participant's answers, forwarded verbatim to whichever desk grades them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub participant: ParticipantId,
    pub answers: BTreeMap<u32, u32>,
}

/// Which desk ended up finalizing a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Desk {
    Primary,
    Secondary,
}

/// Every call a node can receive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Rpc {
    // registry
    Register { participant: ParticipantId, address: String },
    Registry,

    // Ricart–Agrawala
    RequestEntry,
    ReceiveRequest { timestamp: u64, from: ParticipantId },
    /// `timestamp` names the request being granted.
    ReceiveOk { from: ParticipantId, timestamp: u64 },
    ReceiveRelease { from: ParticipantId },
    RegisterIntent { timestamp: u64, from: ParticipantId },
    OkSignal { from: ParticipantId, to: ParticipantId },
    RecordMark { from: ParticipantId, value: i64 },
    ExitCs { from: ParticipantId },

    // Berkeley
    CalculateOffset { round: u64, reference: f64 },
    /// `round` echoes the [`Rpc::CalculateOffset`] being answered.
    ReportLocalTime { from: ParticipantId, round: u64, delta: f64 },
    ApplyAdjustment { delta: f64 },
    PhaseComplete { phase: String },

    // chunk locks
    AcquireRead { chunk: String, who: ParticipantId },
    ReleaseRead { chunk: String, who: ParticipantId },
    AcquireWrite { chunk: String, who: ParticipantId },
    TryAcquireWrite { chunk: String, who: ParticipantId },
    ReleaseWrite { chunk: String, who: ParticipantId },
    /// Allowed only while `who` holds `chunk` and `id` belongs to it.
    ReadRecord { chunk: String, who: ParticipantId, id: ParticipantId },
    /// Allowed only while `who` holds `chunk` for writing and `id` belongs to it.
    UpdateRecord {
        chunk: String,
        who: ParticipantId,
        id: ParticipantId,
        fields: BTreeMap<String, String>,
    },

    // submissions
    SubmitForFinalization { submission: Submission },
    PushFinalizedResult { participant: ParticipantId, value: i64 },

    // results
    ShowResults { rows: Vec<Record> },

    // operator commands
    StartSynchronization,
    StartIsa,
    CreateReplication { factor: usize },
    AnnounceResults,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "body", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Registry(BTreeMap<ParticipantId, String>),
    Granted,
    Busy(LockBusy),
    Record(Option<Record>),
    Finalized {
        participant: ParticipantId,
        value: i64,
        desk: Desk,
    },
    Err(String),
}

impl Rpc {
    /// Function that returns the call as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses a call from a JSON formatted `String`.
    pub fn from_json_string(line: &str) -> Result<Self> {
        Ok(serde_json::from_str::<Self>(line)?)
    }

    /// Short name used in log lines.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registry => "registry",
            Self::RequestEntry => "request_entry",
            Self::ReceiveRequest { .. } => "receive_request",
            Self::ReceiveOk { .. } => "receive_ok",
            Self::ReceiveRelease { .. } => "receive_release",
            Self::RegisterIntent { .. } => "register_intent",
            Self::OkSignal { .. } => "ok_signal",
            Self::RecordMark { .. } => "record_mark",
            Self::ExitCs { .. } => "exit_cs",
            Self::CalculateOffset { .. } => "calculate_offset",
            Self::ReportLocalTime { .. } => "report_local_time",
            Self::ApplyAdjustment { .. } => "apply_adjustment",
            Self::PhaseComplete { .. } => "phase_complete",
            Self::AcquireRead { .. } => "acquire_read",
            Self::ReleaseRead { .. } => "release_read",
            Self::AcquireWrite { .. } => "acquire_write",
            Self::TryAcquireWrite { .. } => "try_acquire_write",
            Self::ReleaseWrite { .. } => "release_write",
            Self::ReadRecord { .. } => "read_record",
            Self::UpdateRecord { .. } => "update_record",
            Self::SubmitForFinalization { .. } => "submit_for_finalization",
            Self::PushFinalizedResult { .. } => "push_finalized_result",
            Self::ShowResults { .. } => "show_results",
            Self::StartSynchronization => "start_synchronization",
            Self::StartIsa => "start_isa",
            Self::CreateReplication { .. } => "create_replication",
            Self::AnnounceResults => "announce_results",
        }
    }
}

impl Reply {
    /// Function that returns the reply as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses a reply from a JSON formatted `String`.
    pub fn from_json_string(line: &str) -> Result<Self> {
        Ok(serde_json::from_str::<Self>(line)?)
    }

    pub fn unsupported(rpc: &Rpc) -> Self {
        Self::Err(format!("{} is not served by this node", rpc.method()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_order_numerically() {
        let mut ids: Vec<ParticipantId> = ["10", "teacher", "9", "2", "backup"]
            .into_iter()
            .map(ParticipantId::from)
            .collect();
        ids.sort();
        let ids: Vec<&str> = ids.iter().map(ParticipantId::as_str).collect();
        assert_eq!(ids, ["2", "9", "10", "backup", "teacher"]);
    }

    #[test]
    fn requests_order_by_timestamp_then_id() {
        let a = Request::new(4, "2".into());
        let b = Request::new(4, "10".into());
        let c = Request::new(3, "99".into());
        assert!(c < a);
        assert!(a < b);
    }

    #[test]
    fn rpc_lines_carry_method_and_params() {
        let rpc = Rpc::ReceiveRequest {
            timestamp: 7,
            from: "3".into(),
        };
        let line = rpc.to_json_string().unwrap();
        assert_eq!(
            line,
            r#"{"method":"receive_request","params":{"timestamp":7,"from":"3"}}"#
        );
        assert_eq!(Rpc::from_json_string(&line).unwrap(), rpc);
    }

    #[test]
    fn busy_reply_keeps_reason() {
        let line = Reply::Busy(LockBusy::BeingRead).to_json_string().unwrap();
        assert_eq!(
            Reply::from_json_string(&line).unwrap(),
            Reply::Busy(LockBusy::BeingRead)
        );
    }
}
