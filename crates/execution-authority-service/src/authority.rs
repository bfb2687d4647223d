use std::path::PathBuf;

use anyhow::Result;
use execution_authority_core::{
    build_record, evaluate_claim, now_utc, AcceptRequest, ExecutionFilter, ExecutionId,
    ExecutionPage, ExecutionRecord, PageRequest, SigningKey, ValidateRequest, ValidationOutcome,
};
use execution_authority_store_sqlite::{
    AppendOutcome, ConstraintReport, IdempotencyLookup, SchemaStatus, SqliteLedgerStore,
};

/// Acceptance and validation protocols over the ledger.
///
/// Holds no connection: each operation opens its own store handle, so
/// concurrent requests share nothing in-process.
#[derive(Debug, Clone)]
pub struct ExecutionAuthority {
    db_path: PathBuf,
    key: SigningKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptOutcome {
    pub record: ExecutionRecord,
    pub idempotent_replay: bool,
}

impl ExecutionAuthority {
    #[must_use]
    pub fn new(db_path: PathBuf, key: SigningKey) -> Self {
        Self { db_path, key }
    }

    fn store(&self) -> Result<SqliteLedgerStore> {
        SqliteLedgerStore::open(&self.db_path)
    }

    pub fn migrate(&self) -> Result<()> {
        self.store()?.migrate()
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.store()?.schema_status()
    }

    pub fn verify_constraints(&self) -> Result<ConstraintReport> {
        self.store()?.verify_constraints()
    }

    /// Replays the stored record for a known idempotency key, otherwise
    /// mints, signs and appends a new one. Losing an insert race on the key
    /// also resolves to the winner's record.
    pub fn accept(&self, request: &AcceptRequest) -> Result<AcceptOutcome> {
        let store = self.store()?;

        if let Some(key) = request.idempotency_key() {
            if let IdempotencyLookup::Replay(existing) = store.find_by_idempotency_key(key)? {
                return Ok(AcceptOutcome { record: *existing, idempotent_replay: true });
            }
        }

        let record = build_record(request, &self.key, now_utc())?;
        Ok(match store.append_record(&record)? {
            AppendOutcome::Inserted(record) => {
                AcceptOutcome { record: *record, idempotent_replay: false }
            }
            AppendOutcome::Conflict(winner) => {
                tracing::info!(
                    execution_id = %winner.execution_id,
                    "idempotency race lost; returning committed record"
                );
                AcceptOutcome { record: *winner, idempotent_replay: true }
            }
        })
    }

    /// Malformed ids cannot exist in the ledger and read as absent.
    pub fn get(&self, raw_id: &str) -> Result<Option<ExecutionRecord>> {
        match ExecutionId::parse(raw_id) {
            Ok(execution_id) => self.store()?.get(execution_id),
            Err(_) => Ok(None),
        }
    }

    pub fn list(&self, filter: &ExecutionFilter, page: PageRequest) -> Result<ExecutionPage> {
        self.store()?.list(filter, page)
    }

    pub fn validate(&self, request: &ValidateRequest) -> Result<ValidationOutcome> {
        let stored = self.get(&request.execution_id)?;
        let outcome = evaluate_claim(
            &request.execution_id,
            &request.authority_signature,
            stored.as_ref(),
            &self.key,
        )?;
        Ok(outcome)
    }
}
