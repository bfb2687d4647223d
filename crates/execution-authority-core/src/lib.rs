//! Domain types and pure protocol pieces of the execution authority:
//! identifier minting, acceptance signatures, request parsing, record
//! construction, claim evaluation and the append-only statement policy.

use time::{OffsetDateTime, UtcOffset};

mod acceptance;
pub mod guard;
mod model;
mod request;
pub mod signing;

pub use acceptance::{build_record, evaluate_claim, record_integrity_holds};
pub use guard::{ImmutabilityGuard, ImmutabilityViolation, MutationVerb, APPEND_ONLY_TABLES};
pub use model::{
    ExecutionFilter, ExecutionId, ExecutionPage, ExecutionRecord, ExecutionStatus, InvalidReason,
    Lineage, PageRequest, SpanId, ValidationOutcome, DEFAULT_LIST_LIMIT, EXECUTION_ID_PREFIX,
    MAX_LIST_LIMIT, ORIGIN_SERVICE, ORIGIN_VERSION,
};
pub use request::{
    AcceptRequest, AcceptanceKind, AuthorityMint, ContractIssue, FieldError, StandardAcceptance,
    ValidateRequest, MAX_IDENTIFIER_CHARS, MAX_INTENT_DESCRIPTION_CHARS,
};
pub use signing::{generate_root_span_id, mint_execution_id, sign, verify, SigningKey};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AuthorityError {
    #[error("validation failed: {}", summarize_fields(.0))]
    Validation(Vec<FieldError>),
    #[error("contract violation: {}", summarize_issues(.0))]
    ContractViolation(Vec<ContractIssue>),
    #[error("malformed execution id: {0:?}")]
    MalformedExecutionId(String),
    #[error("malformed span id: {0:?}")]
    MalformedSpanId(String),
    #[error(transparent)]
    Immutability(#[from] ImmutabilityViolation),
    #[error("signature error: {0}")]
    Signature(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error("stored execution record {0} failed signature recomputation")]
    CorruptRecord(String),
}

fn summarize_fields(errors: &[FieldError]) -> String {
    errors.iter().map(|error| error.message.as_str()).collect::<Vec<_>>().join("; ")
}

fn summarize_issues(issues: &[ContractIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.path, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`AuthorityError::Timestamp`] for unparsable or non-UTC input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AuthorityError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AuthorityError::Timestamp(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AuthorityError::Timestamp("timestamp MUST use UTC offset Z".to_string()));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AuthorityError::Timestamp`] if formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AuthorityError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AuthorityError::Timestamp(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trip_preserves_subseconds() {
        let original = "2026-02-07T12:00:00.123456789Z";
        let parsed = match parse_rfc3339_utc(original) {
            Ok(value) => value,
            Err(err) => panic!("fixture timestamp should parse: {err}"),
        };
        match format_rfc3339(parsed) {
            Ok(formatted) => assert_eq!(formatted, original),
            Err(err) => panic!("format failed: {err}"),
        }
    }

    #[test]
    fn non_utc_timestamps_are_rejected() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("yesterday").is_err());
    }

    #[test]
    fn validation_error_message_lists_fields() {
        let err = AuthorityError::Validation(vec![
            FieldError::new("org_id", "org_id must be provided"),
            FieldError::new("caller_id", "caller_id cannot be empty"),
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: org_id must be provided; caller_id cannot be empty"
        );
    }
}
