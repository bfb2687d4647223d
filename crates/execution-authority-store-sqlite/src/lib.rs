#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use execution_authority_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, record_integrity_holds, AuthorityError,
    ExecutionFilter, ExecutionId, ExecutionPage, ExecutionRecord, ImmutabilityGuard, Lineage,
    PageRequest, SigningKey, SpanId,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

pub const LEDGER_MIGRATION_VERSION: i64 = 1;
pub const LEDGER_TABLE: &str = "execution_records";
pub const NO_UPDATE_TRIGGER: &str = "trg_execution_records_no_update";
pub const NO_DELETE_TRIGGER: &str = "trg_execution_records_no_delete";

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS execution_records (
  execution_id TEXT PRIMARY KEY,
  accepted INTEGER NOT NULL CHECK (accepted IN (0, 1)),
  caller_id TEXT,
  org_id TEXT,
  simulation_type TEXT,
  intent_description TEXT NOT NULL,
  simulation_context_json TEXT NOT NULL DEFAULT '{}',
  authority_signature TEXT NOT NULL,
  root_span_id TEXT NOT NULL,
  lineage_json TEXT NOT NULL,
  idempotency_key TEXT UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_execution_records_no_update
BEFORE UPDATE ON execution_records
BEGIN
  SELECT RAISE(FAIL, 'execution_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_execution_records_no_delete
BEFORE DELETE ON execution_records
BEGIN
  SELECT RAISE(FAIL, 'execution_records is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_execution_records_caller_created
  ON execution_records(caller_id, created_at);
CREATE INDEX IF NOT EXISTS idx_execution_records_org_created
  ON execution_records(org_id, created_at);
CREATE INDEX IF NOT EXISTS idx_execution_records_accepted_created
  ON execution_records(accepted, created_at);
";

const RECORD_COLUMNS: &str = "execution_id, accepted, caller_id, org_id, simulation_type,
    intent_description, simulation_context_json, authority_signature, root_span_id,
    lineage_json, idempotency_key, created_at";

/// Append-only ledger of accepted executions backed by SQLite.
///
/// Every statement passes the [`ImmutabilityGuard`] before it reaches the
/// connection, and the schema carries triggers that refuse updates and
/// deletes as a second line.
pub struct SqliteLedgerStore {
    conn: Connection,
    guard: ImmutabilityGuard,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SchemaStatus {
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.pending_versions.is_empty() && self.current_version == self.target_version
    }
}

/// Presence of the storage guarantees the ledger depends on.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct ConstraintReport {
    pub ledger_table: bool,
    pub unique_execution_id: bool,
    pub unique_idempotency_key: bool,
    pub no_update_trigger: bool,
    pub no_delete_trigger: bool,
}

impl ConstraintReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    #[must_use]
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.ledger_table {
            missing.push("execution_records table");
        }
        if !self.unique_execution_id {
            missing.push("UNIQUE(execution_id)");
        }
        if !self.unique_idempotency_key {
            missing.push("UNIQUE(idempotency_key)");
        }
        if !self.no_update_trigger {
            missing.push(NO_UPDATE_TRIGGER);
        }
        if !self.no_delete_trigger {
            missing.push(NO_DELETE_TRIGGER);
        }
        missing
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyLookup {
    Replay(Box<ExecutionRecord>),
    Fresh,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Inserted(Box<ExecutionRecord>),
    /// A concurrent writer committed the same idempotency key first.
    Conflict(Box<ExecutionRecord>),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditFinding {
    pub execution_id: String,
    pub problem: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditReport {
    pub checked: usize,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, guard: ImmutabilityGuard::default() })
    }

    pub fn migrate(&self) -> Result<()> {
        self.execute_guarded(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        self.execute_guarded(SCHEMA_LEDGER_V1).context("failed to apply ledger schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                self.admit(
                    "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                )?,
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let applied: Vec<i64> = if table_exists(&self.conn, "schema_migrations")? {
            let mut stmt = self
                .conn
                .prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            collect_rows(rows)?
        } else {
            Vec::new()
        };

        let current_version = applied.iter().copied().max().unwrap_or(0);
        let pending_versions = (1..=LEDGER_MIGRATION_VERSION)
            .filter(|version| !applied.contains(version))
            .collect();

        Ok(SchemaStatus {
            current_version,
            target_version: LEDGER_MIGRATION_VERSION,
            pending_versions,
        })
    }

    /// Inspects the live schema rather than trusting the migration log, so
    /// a ledger table created by hand without its constraints is reported.
    pub fn verify_constraints(&self) -> Result<ConstraintReport> {
        let ledger_table = table_exists(&self.conn, LEDGER_TABLE)?;
        if !ledger_table {
            return Ok(ConstraintReport {
                ledger_table,
                unique_execution_id: false,
                unique_idempotency_key: false,
                no_update_trigger: false,
                no_delete_trigger: false,
            });
        }

        Ok(ConstraintReport {
            ledger_table,
            unique_execution_id: has_unique_index_on_columns(
                &self.conn,
                LEDGER_TABLE,
                &["execution_id"],
            )?,
            unique_idempotency_key: has_unique_index_on_columns(
                &self.conn,
                LEDGER_TABLE,
                &["idempotency_key"],
            )?,
            no_update_trigger: trigger_exists(&self.conn, NO_UPDATE_TRIGGER)?,
            no_delete_trigger: trigger_exists(&self.conn, NO_DELETE_TRIGGER)?,
        })
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> Result<IdempotencyLookup> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM execution_records WHERE idempotency_key = ?1"
                ),
                params![key],
                parse_record_row,
            )
            .optional()
            .context("failed to look up idempotency key")?;

        Ok(match record {
            Some(record) => IdempotencyLookup::Replay(Box::new(record)),
            None => IdempotencyLookup::Fresh,
        })
    }

    /// Inserts `record`. When the insert loses a race on its idempotency
    /// key, the committed winner is returned as [`AppendOutcome::Conflict`].
    pub fn append_record(&self, record: &ExecutionRecord) -> Result<AppendOutcome> {
        let created_at =
            format_rfc3339(record.created_at).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = self.conn.execute(
            self.admit(
                "INSERT INTO execution_records(
                    execution_id, accepted, caller_id, org_id, simulation_type,
                    intent_description, simulation_context_json, authority_signature,
                    root_span_id, lineage_json, idempotency_key, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?,
            params![
                record.execution_id.to_string(),
                bool_to_sql(record.accepted),
                record.caller_id,
                record.org_id,
                record.simulation_type,
                record.intent_description,
                serde_json::to_string(&record.simulation_context)
                    .context("failed to serialize simulation_context")?,
                record.authority_signature,
                record.root_span_id.to_string(),
                serde_json::to_string(&record.lineage).context("failed to serialize lineage")?,
                record.idempotency_key,
                created_at,
            ],
        );

        match inserted {
            Ok(_) => Ok(AppendOutcome::Inserted(Box::new(record.clone()))),
            Err(err) if is_unique_violation(&err) => {
                if let Some(key) = record.idempotency_key.as_deref() {
                    if let IdempotencyLookup::Replay(existing) =
                        self.find_by_idempotency_key(key)?
                    {
                        return Ok(AppendOutcome::Conflict(existing));
                    }
                }
                Err(anyhow::Error::new(err).context("failed to append execution record"))
            }
            Err(err) => Err(anyhow::Error::new(err).context("failed to append execution record")),
        }
    }

    pub fn get(&self, execution_id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM execution_records WHERE execution_id = ?1"),
                params![execution_id.to_string()],
                parse_record_row,
            )
            .optional()
            .with_context(|| format!("failed to load execution record {execution_id}"))
    }

    /// Newest first in acceptance order, filtered, with the total matching
    /// count. `created_at` text does not sort by time once trailing
    /// sub-second zeros are trimmed.
    pub fn list(&self, filter: &ExecutionFilter, page: PageRequest) -> Result<ExecutionPage> {
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(caller_id) = &filter.caller_id {
            values.push(SqlValue::Text(caller_id.clone()));
            clauses.push(format!("caller_id = ?{}", values.len()));
        }
        if let Some(org_id) = &filter.org_id {
            values.push(SqlValue::Text(org_id.clone()));
            clauses.push(format!("org_id = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(SqlValue::Integer(bool_to_sql(status.accepted_flag())));
            clauses.push(format!("accepted = ?{}", values.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM execution_records{where_clause}"),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .context("failed to count execution records")?;

        let mut page_values = values.clone();
        page_values.push(SqlValue::Integer(i64::from(page.limit)));
        page_values.push(SqlValue::Integer(i64::try_from(page.offset).unwrap_or(i64::MAX)));
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM execution_records{where_clause}
             ORDER BY rowid DESC
             LIMIT ?{} OFFSET ?{}",
            values.len() + 1,
            values.len() + 2
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(page_values.iter()), parse_record_row)?;
        let data = collect_rows(rows)?;

        Ok(ExecutionPage {
            data,
            total: u64::try_from(total).unwrap_or(0),
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// Whole ledger in insertion order.
    pub fn all_records(&self) -> Result<Vec<ExecutionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM execution_records ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map([], parse_record_row)?;
        collect_rows(rows)
    }

    /// Recomputes every stored signature with `key`.
    pub fn audit_signatures(&self, key: &SigningKey) -> Result<AuditReport> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM execution_records ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map([], |row| {
            let execution_id: String = row.get(0)?;
            Ok((execution_id, parse_record_row(row)))
        })?;

        let mut report = AuditReport { checked: 0, findings: Vec::new() };
        for row in rows {
            let (execution_id, parsed) = row?;
            report.checked += 1;
            match parsed {
                Ok(record) if record_integrity_holds(&record, key) => {}
                Ok(_) => report.findings.push(AuditFinding {
                    execution_id,
                    problem: "authority_signature does not match recomputation".to_string(),
                }),
                Err(err) => report.findings.push(AuditFinding {
                    execution_id,
                    problem: format!("unreadable record: {err}"),
                }),
            }
        }

        Ok(report)
    }

    /// Runs `sql` as a batch after the immutability check.
    pub fn execute_guarded(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(self.admit(sql)?)?;
        Ok(())
    }

    fn admit<'a>(&self, sql: &'a str) -> Result<&'a str> {
        self.guard.check(sql).map_err(AuthorityError::from)?;
        Ok(sql)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let execution_id_raw: String = row.get(0)?;
    let accepted: i64 = row.get(1)?;
    let simulation_context_raw: String = row.get(6)?;
    let root_span_raw: String = row.get(8)?;
    let lineage_raw: String = row.get(9)?;
    let created_at_raw: String = row.get(11)?;

    let execution_id = ExecutionId::parse(&execution_id_raw).map_err(|err| to_sql_error(0, &err))?;
    let root_span_id = SpanId::parse(&root_span_raw).map_err(|err| to_sql_error(8, &err))?;
    let created_at = parse_rfc3339_utc(&created_at_raw).map_err(|err| to_sql_error(11, &err))?;
    let simulation_context: Value = serde_json::from_str(&simulation_context_raw)
        .map_err(|err| invalid_column(6, format!("invalid simulation_context_json: {err}")))?;
    let lineage: Lineage = serde_json::from_str(&lineage_raw)
        .map_err(|err| invalid_column(9, format!("invalid lineage_json: {err}")))?;

    Ok(ExecutionRecord {
        execution_id,
        accepted: accepted != 0,
        caller_id: row.get(2)?,
        org_id: row.get(3)?,
        simulation_type: row.get(4)?,
        intent_description: row.get(5)?,
        simulation_context,
        authority_signature: row.get(7)?,
        root_span_id,
        lineage,
        idempotency_key: row.get(10)?,
        created_at,
    })
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    sqlite_master_has(conn, "table", table_name)
}

fn trigger_exists(conn: &Connection, trigger_name: &str) -> Result<bool> {
    sqlite_master_has(conn, "trigger", trigger_name)
}

fn sqlite_master_has(conn: &Connection, kind: &str, name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = ?1 AND name = ?2
             LIMIT 1",
            params![kind, name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn has_unique_index_on_columns(
    conn: &Connection,
    table_name: &str,
    columns: &[&str],
) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({table_name})"))
        .with_context(|| format!("failed to inspect index_list for {table_name}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let is_unique: i64 = row.get(2)?;
        if is_unique != 1 {
            continue;
        }

        let indexed_columns = index_columns(conn, &index_name)?;
        if indexed_columns == columns {
            return Ok(true);
        }
    }

    Ok(false)
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({index_name})"))
        .with_context(|| format!("failed to inspect index_info for {index_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(2)?);
    }

    Ok(columns)
}

fn to_sql_error(column: usize, err: &AuthorityError) -> rusqlite::Error {
    invalid_column(column, err.to_string())
}

fn invalid_column(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
