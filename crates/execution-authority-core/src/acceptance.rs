use time::OffsetDateTime;

use crate::{
    format_rfc3339, generate_root_span_id, mint_execution_id, AcceptRequest, AuthorityError,
    ExecutionId, ExecutionRecord, InvalidReason, Lineage, SigningKey, ValidationOutcome,
    ORIGIN_SERVICE, ORIGIN_VERSION,
};

/// Mints, signs and snapshots a fresh record for `request`.
///
/// The signature covers the execution id and the RFC3339 rendering of
/// `accepted_at`, which is also stored as `created_at`.
///
/// # Errors
/// Returns [`AuthorityError::Timestamp`] or [`AuthorityError::Signature`]
/// when the record cannot be signed. No partial record is produced.
pub fn build_record(
    request: &AcceptRequest,
    key: &SigningKey,
    accepted_at: OffsetDateTime,
) -> Result<ExecutionRecord, AuthorityError> {
    let execution_id = mint_execution_id();
    let root_span_id = generate_root_span_id();
    let timestamp = format_rfc3339(accepted_at)?;
    let authority_signature = key.sign(&execution_id.to_string(), &timestamp)?;

    let caller_id = request.caller_id().map(str::to_string);
    let org_id = request.org_id().map(str::to_string);
    let simulation_type = request.simulation_type().map(str::to_string);
    let intent_description = request.intent_description().to_string();
    let simulation_context = request.simulation_context().clone();

    let lineage = Lineage {
        origin_service: ORIGIN_SERVICE.to_string(),
        origin_version: ORIGIN_VERSION.to_string(),
        accepted_at,
        root_span_id,
        parent_span_id: None,
        caller_id: caller_id.clone(),
        org_id: org_id.clone(),
        simulation_type: simulation_type.clone(),
        intent_description: intent_description.clone(),
        simulation_context: simulation_context.clone(),
    };

    Ok(ExecutionRecord {
        execution_id,
        accepted: true,
        caller_id,
        org_id,
        simulation_type,
        intent_description,
        simulation_context,
        authority_signature,
        root_span_id,
        lineage,
        idempotency_key: request.idempotency_key().map(str::to_string),
        created_at: accepted_at,
    })
}

/// True when the stored signature still matches a recomputation over the
/// stored id and timestamp.
#[must_use]
pub fn record_integrity_holds(record: &ExecutionRecord, key: &SigningKey) -> bool {
    let Ok(timestamp) = format_rfc3339(record.created_at) else {
        return false;
    };
    key.verify(&record.execution_id.to_string(), &timestamp, &record.authority_signature)
}

/// Evaluates a caller's `(execution_id, authority_signature)` claim against
/// the ledger lookup result.
///
/// Malformed ids and missing records both read as `execution_not_found`.
///
/// # Errors
/// Returns [`AuthorityError::CorruptRecord`] when the stored record itself
/// fails recomputation.
pub fn evaluate_claim(
    claimed_id: &str,
    claimed_signature: &str,
    stored: Option<&ExecutionRecord>,
    key: &SigningKey,
) -> Result<ValidationOutcome, AuthorityError> {
    let Some(record) = stored else {
        return Ok(ValidationOutcome::invalid(claimed_id, InvalidReason::ExecutionNotFound));
    };
    if ExecutionId::parse(claimed_id).ok() != Some(record.execution_id) {
        return Ok(ValidationOutcome::invalid(claimed_id, InvalidReason::ExecutionNotFound));
    }
    if !record_integrity_holds(record, key) {
        return Err(AuthorityError::CorruptRecord(record.execution_id.to_string()));
    }

    let timestamp = format_rfc3339(record.created_at)?;
    if key.verify(claimed_id, &timestamp, claimed_signature) {
        Ok(ValidationOutcome::valid(claimed_id))
    } else {
        Ok(ValidationOutcome::invalid(claimed_id, InvalidReason::SignatureMismatch))
    }
}
