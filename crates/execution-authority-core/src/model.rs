use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::AuthorityError;

/// Marker prefixed to every self-issued execution id.
pub const EXECUTION_ID_PREFIX: &str = "exec-";

/// Identity recorded in every lineage snapshot.
pub const ORIGIN_SERVICE: &str = "execution-authority";
pub const ORIGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An authority-issued `exec-<uuid>` identifier.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    #[must_use]
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn uuid(self) -> Uuid {
        self.0
    }

    /// Parses the exact minted shape: the `exec-` marker followed by a
    /// lowercase hyphenated uuid.
    ///
    /// # Errors
    /// Returns [`AuthorityError::MalformedExecutionId`] for anything else.
    pub fn parse(raw: &str) -> Result<Self, AuthorityError> {
        let malformed = || AuthorityError::MalformedExecutionId(raw.to_string());
        let rest = raw.strip_prefix(EXECUTION_ID_PREFIX).ok_or_else(malformed)?;
        let uuid = Uuid::try_parse(rest).map_err(|_| malformed())?;
        if uuid.hyphenated().to_string() != rest {
            return Err(malformed());
        }
        Ok(Self(uuid))
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{EXECUTION_ID_PREFIX}{}", self.0.hyphenated())
    }
}

impl TryFrom<String> for ExecutionId {
    type Error = AuthorityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ExecutionId> for String {
    fn from(value: ExecutionId) -> Self {
        value.to_string()
    }
}

/// Trace span identifier.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(Uuid);

impl SpanId {
    #[must_use]
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn uuid(self) -> Uuid {
        self.0
    }

    /// # Errors
    /// Returns [`AuthorityError::MalformedSpanId`] when `raw` is not a uuid.
    pub fn parse(raw: &str) -> Result<Self, AuthorityError> {
        Uuid::try_parse(raw)
            .map(Self)
            .map_err(|_| AuthorityError::MalformedSpanId(raw.to_string()))
    }
}

impl Display for SpanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Durable snapshot of who authorized an execution, and when.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lineage {
    pub origin_service: String,
    pub origin_version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub accepted_at: OffsetDateTime,
    pub root_span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub caller_id: Option<String>,
    pub org_id: Option<String>,
    pub simulation_type: Option<String>,
    pub intent_description: String,
    pub simulation_context: Value,
}

/// One row of the append-only execution ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub accepted: bool,
    pub caller_id: Option<String>,
    pub org_id: Option<String>,
    pub simulation_type: Option<String>,
    pub intent_description: String,
    pub simulation_context: Value,
    pub authority_signature: String,
    pub root_span_id: SpanId,
    pub lineage: Lineage,
    pub idempotency_key: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Filter values accepted by the list operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Accepted,
    Rejected,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    #[must_use]
    pub fn accepted_flag(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

pub const DEFAULT_LIST_LIMIT: u32 = 100;
pub const MAX_LIST_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    pub caller_id: Option<String>,
    pub org_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

/// Pagination window with the limit already clamped to `[1, MAX_LIST_LIMIT]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u64,
}

impl PageRequest {
    #[must_use]
    pub fn new(limit: Option<u32>, offset: Option<u64>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionPage {
    pub data: Vec<ExecutionRecord>,
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
}

/// Negative validation results.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    ExecutionNotFound,
    SignatureMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub execution_id: String,
    pub reason: Option<InvalidReason>,
}

impl ValidationOutcome {
    #[must_use]
    pub fn valid(execution_id: impl Into<String>) -> Self {
        Self { valid: true, execution_id: execution_id.into(), reason: None }
    }

    #[must_use]
    pub fn invalid(execution_id: impl Into<String>, reason: InvalidReason) -> Self {
        Self { valid: false, execution_id: execution_id.into(), reason: Some(reason) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_id_round_trips_through_display() {
        let raw = "exec-3f1c2a9e-8b1d-4c55-9a0e-1f2b3c4d5e6f";
        let parsed = match ExecutionId::parse(raw) {
            Ok(value) => value,
            Err(err) => panic!("fixture id should parse: {err}"),
        };
        assert_eq!(parsed.to_string(), raw);
    }

    #[test]
    fn execution_id_rejects_other_shapes() {
        for raw in [
            "",
            "exec-",
            "3f1c2a9e-8b1d-4c55-9a0e-1f2b3c4d5e6f",
            "exec_3f1c2a9e-8b1d-4c55-9a0e-1f2b3c4d5e6f",
            "EXEC-3f1c2a9e-8b1d-4c55-9a0e-1f2b3c4d5e6f",
            "exec-3F1C2A9E-8B1D-4C55-9A0E-1F2B3C4D5E6F",
            "exec-3f1c2a9e8b1d4c559a0e1f2b3c4d5e6f",
            "exec-{3f1c2a9e-8b1d-4c55-9a0e-1f2b3c4d5e6f}",
            "exec-3f1c2a9e-8b1d-4c55-9a0e-1f2b3c4d5e6f ",
            "sim-3f1c2a9e-8b1d-4c55-9a0e-1f2b3c4d5e6f",
        ] {
            assert!(ExecutionId::parse(raw).is_err(), "expected {raw:?} to be rejected");
        }
    }

    #[test]
    fn execution_id_serializes_as_string() {
        let id = ExecutionId::from_uuid(Uuid::nil());
        let value = match serde_json::to_value(id) {
            Ok(value) => value,
            Err(err) => panic!("serialize failed: {err}"),
        };
        assert_eq!(value, serde_json::json!("exec-00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn page_request_clamps_limit() {
        assert_eq!(PageRequest::new(None, None).limit, DEFAULT_LIST_LIMIT);
        assert_eq!(PageRequest::new(Some(5000), None).limit, MAX_LIST_LIMIT);
        assert_eq!(PageRequest::new(Some(0), Some(7)), PageRequest { limit: 1, offset: 7 });
    }

    #[test]
    fn invalid_reason_uses_snake_case() {
        let outcome = ValidationOutcome::invalid("exec-x", InvalidReason::ExecutionNotFound);
        let value = match serde_json::to_value(&outcome) {
            Ok(value) => value,
            Err(err) => panic!("serialize failed: {err}"),
        };
        assert_eq!(value["reason"], serde_json::json!("execution_not_found"));
        assert_eq!(value["valid"], serde_json::json!(false));

        let ok = ValidationOutcome::valid("exec-x");
        let value = match serde_json::to_value(&ok) {
            Ok(value) => value,
            Err(err) => panic!("serialize failed: {err}"),
        };
        assert_eq!(value["reason"], serde_json::Value::Null);
    }
}
