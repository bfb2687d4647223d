//! Operator command surface for the execution authority ledger.
//!
//! [`run_cli`] executes a parsed [`Cli`]; [`run_ledger`] and
//! [`run_execution`] run a single command group against an open store.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use execution_authority_core::{
    evaluate_claim, ExecutionFilter, ExecutionId, ExecutionPage, ExecutionStatus, PageRequest,
    SigningKey, ValidationOutcome,
};
use execution_authority_store_sqlite::{
    AuditReport, ConstraintReport, SchemaStatus, SqliteLedgerStore,
};
use serde::Serialize;

pub const CLI_CONTRACT_VERSION: &str = "ea_cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ea")]
#[command(about = "Execution Authority operator CLI")]
pub struct Cli {
    #[arg(long, env = "EXECUTION_AUTHORITY_DB", default_value = "./execution_authority.sqlite3")]
    db: PathBuf,

    /// Needed by commands that recompute signatures.
    #[arg(long, env = "EXECUTION_AUTHORITY_SECRET", hide_env_values = true)]
    signing_secret: Option<String>,

    #[arg(long, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    Execution {
        #[command(subcommand)]
        command: ExecutionCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    /// Apply pending schema migrations.
    Migrate(JsonFlag),
    /// Report applied and pending schema versions.
    Status(JsonFlag),
    /// Verify the uniqueness constraints and append-only triggers.
    Check(JsonFlag),
    /// Recompute every stored signature.
    Audit(JsonFlag),
}

#[derive(Debug, Args)]
pub struct JsonFlag {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ExecutionCommand {
    Show(ShowArgs),
    List(ListArgs),
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    execution_id: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    caller_id: Option<String>,
    #[arg(long)]
    org_id: Option<String>,
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    offset: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    #[arg(long)]
    execution_id: String,
    #[arg(long)]
    signature: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Accepted,
    Rejected,
}

#[derive(Debug, Serialize)]
struct CheckPayload<'a> {
    contract_version: &'static str,
    complete: bool,
    missing: Vec<&'static str>,
    constraints: &'a ConstraintReport,
}

#[derive(Debug, Serialize)]
struct AuditPayload<'a> {
    contract_version: &'static str,
    clean: bool,
    #[serde(flatten)]
    report: &'a AuditReport,
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when the store cannot be opened, a check or audit fails,
/// or the requested record does not exist.
pub fn run_cli(cli: Cli) -> Result<()> {
    tracing::debug!(db = %cli.db.display(), "opening ledger");
    let store = SqliteLedgerStore::open(&cli.db)?;
    match cli.command {
        Command::Ledger { command } => {
            run_ledger(command, &store, cli.signing_secret.as_deref())
        }
        Command::Execution { command } => {
            store.migrate()?;
            run_execution(command, &store, cli.signing_secret.as_deref())
        }
    }
}

/// # Errors
/// Returns an error when migration fails, constraints are missing, or the
/// audit finds records whose signatures no longer recompute.
pub fn run_ledger(
    command: LedgerCommand,
    store: &SqliteLedgerStore,
    signing_secret: Option<&str>,
) -> Result<()> {
    match command {
        LedgerCommand::Migrate(flag) => {
            store.migrate()?;
            emit_schema_status(&store.schema_status()?, flag.json)
        }
        LedgerCommand::Status(flag) => emit_schema_status(&store.schema_status()?, flag.json),
        LedgerCommand::Check(flag) => {
            let report = store.verify_constraints()?;
            let payload = CheckPayload {
                contract_version: CLI_CONTRACT_VERSION,
                complete: report.is_complete(),
                missing: report.missing(),
                constraints: &report,
            };
            if flag.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_check(&payload);
            }
            if !payload.complete {
                return Err(anyhow!(
                    "ledger constraints missing: {}",
                    payload.missing.join(", ")
                ));
            }
            Ok(())
        }
        LedgerCommand::Audit(flag) => {
            let key = require_key(signing_secret)?;
            let report = store.audit_signatures(&key)?;
            let payload = AuditPayload {
                contract_version: CLI_CONTRACT_VERSION,
                clean: report.is_clean(),
                report: &report,
            };
            if flag.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_audit(&report);
            }
            if !report.is_clean() {
                return Err(anyhow!(
                    "ledger audit found {} of {} records failing signature recomputation",
                    report.findings.len(),
                    report.checked
                ));
            }
            Ok(())
        }
    }
}

/// # Errors
/// Returns an error for malformed ids, unknown executions, or an
/// integrity failure of the stored record during validation.
pub fn run_execution(
    command: ExecutionCommand,
    store: &SqliteLedgerStore,
    signing_secret: Option<&str>,
) -> Result<()> {
    match command {
        ExecutionCommand::Show(args) => {
            let execution_id = ExecutionId::parse(&args.execution_id)?;
            let record = store
                .get(execution_id)?
                .ok_or_else(|| anyhow!("execution not found: {execution_id}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        ExecutionCommand::List(args) => {
            let filter = ExecutionFilter {
                caller_id: args.caller_id,
                org_id: args.org_id,
                status: args.status.map(map_status),
            };
            let page = store.list(&filter, PageRequest::new(args.limit, args.offset))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                print_page(&page);
            }
            Ok(())
        }
        ExecutionCommand::Validate(args) => {
            let key = require_key(signing_secret)?;
            let stored = match ExecutionId::parse(&args.execution_id) {
                Ok(execution_id) => store.get(execution_id)?,
                Err(_) => None,
            };
            let outcome: ValidationOutcome =
                evaluate_claim(&args.execution_id, &args.signature, stored.as_ref(), &key)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
    }
}

fn require_key(signing_secret: Option<&str>) -> Result<SigningKey> {
    signing_secret
        .map(str::trim)
        .filter(|secret| !secret.is_empty())
        .map(|secret| SigningKey::new(secret.as_bytes().to_vec()))
        .context("a signing secret is required (--signing-secret or EXECUTION_AUTHORITY_SECRET)")
}

fn map_status(value: StatusArg) -> ExecutionStatus {
    match value {
        StatusArg::Accepted => ExecutionStatus::Accepted,
        StatusArg::Rejected => ExecutionStatus::Rejected,
    }
}

fn emit_schema_status(status: &SchemaStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
    } else {
        let pending = status
            .pending_versions
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "current_version={} target_version={} pending=[{}]",
            status.current_version, status.target_version, pending
        );
    }
    Ok(())
}

fn print_check(payload: &CheckPayload<'_>) {
    println!("contract={}", payload.contract_version);
    println!("complete={}", if payload.complete { "yes" } else { "no" });
    if !payload.missing.is_empty() {
        println!("missing={}", payload.missing.join(" | "));
        println!("hint=run `ea ledger migrate` on a fresh database and copy records across");
    }
}

fn print_audit(report: &AuditReport) {
    println!("checked={} findings={}", report.checked, report.findings.len());
    for finding in &report.findings {
        println!("{:<42} {}", finding.execution_id, finding.problem);
    }
}

fn print_page(page: &ExecutionPage) {
    println!("total={} limit={} offset={}", page.total, page.limit, page.offset);
    println!(
        "{:<42} {:<8} {:<20} {:<20} created_at",
        "execution_id", "accepted", "caller_id", "org_id"
    );
    println!("{}", "-".repeat(120));
    for record in &page.data {
        println!(
            "{:<42} {:<8} {:<20} {:<20} {}",
            record.execution_id,
            if record.accepted { "yes" } else { "no" },
            record.caller_id.as_deref().unwrap_or("-"),
            record.org_id.as_deref().unwrap_or("-"),
            execution_authority_core::format_rfc3339(record.created_at)
                .unwrap_or_else(|_| "n/a".to_string())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execution_authority_core::{build_record, now_utc, AcceptRequest, AcceptanceKind};
    use serde_json::json;
    use std::path::Path;

    const SECRET: &str = "cli-unit-secret";

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn seeded_db(records: usize) -> (PathBuf, Vec<String>) {
        let db_path = std::env::temp_dir()
            .join(format!("execution-authority-cli-{}.sqlite3", ulid::Ulid::new()));
        let store = must(SqliteLedgerStore::open(&db_path));
        must(store.migrate());
        let key = SigningKey::new(SECRET.as_bytes().to_vec());
        let mut ids = Vec::new();
        for index in 0..records {
            let request = match AcceptRequest::parse(
                AcceptanceKind::AuthorityMint,
                &json!({"intent_description": format!("fixture {index}"), "caller_id": "ops"}),
            ) {
                Ok(request) => request,
                Err(err) => panic!("invalid fixture: {err}"),
            };
            let record = match build_record(&request, &key, now_utc()) {
                Ok(record) => record,
                Err(err) => panic!("failed to build fixture record: {err}"),
            };
            ids.push(record.execution_id.to_string());
            must(store.append_record(&record));
        }
        (db_path, ids)
    }

    fn db_arg(path: &Path) -> String {
        path.display().to_string()
    }

    #[test]
    fn migrate_then_check_passes_on_fresh_ledger() {
        let db_path = std::env::temp_dir()
            .join(format!("execution-authority-cli-fresh-{}.sqlite3", ulid::Ulid::new()));
        let db = db_arg(&db_path);
        must(execute_cli(&["ea", "--db", &db, "ledger", "migrate", "--json"]));
        must(execute_cli(&["ea", "--db", &db, "ledger", "check", "--json"]));
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn check_fails_before_migration() {
        let db_path = std::env::temp_dir()
            .join(format!("execution-authority-cli-empty-{}.sqlite3", ulid::Ulid::new()));
        let db = db_arg(&db_path);
        let err = match execute_cli(&["ea", "--db", &db, "ledger", "check"]) {
            Ok(()) => panic!("check must fail without a ledger table"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("ledger constraints missing"));
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn audit_requires_secret_and_passes_with_matching_key() {
        let (db_path, _) = seeded_db(3);
        let db = db_arg(&db_path);
        assert!(execute_cli(&["ea", "--db", &db, "ledger", "audit"]).is_err());
        must(execute_cli(&["ea", "--db", &db, "--signing-secret", SECRET, "ledger", "audit"]));

        let rotated: [&str; 7] =
            ["ea", "--db", &db, "--signing-secret", "other", "ledger", "audit"];
        let err = match execute_cli(&rotated) {
            Ok(()) => panic!("audit under a different key must fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("3 of 3"));
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn show_list_and_validate_read_the_ledger() {
        let (db_path, ids) = seeded_db(2);
        let db = db_arg(&db_path);
        must(execute_cli(&["ea", "--db", &db, "execution", "show", "--execution-id", &ids[0]]));
        must(execute_cli(&[
            "ea",
            "--db",
            &db,
            "execution",
            "list",
            "--caller-id",
            "ops",
            "--limit",
            "1",
        ]));
        must(execute_cli(&[
            "ea",
            "--db",
            &db,
            "--signing-secret",
            SECRET,
            "execution",
            "validate",
            "--execution-id",
            &ids[1],
            "--signature",
            "00",
        ]));

        let missing = execute_cli(&[
            "ea",
            "--db",
            &db,
            "execution",
            "show",
            "--execution-id",
            "exec-00000000-0000-4000-8000-000000000000",
        ]);
        assert!(missing.is_err());
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn status_values_map_to_filters() {
        assert_eq!(map_status(StatusArg::Accepted), ExecutionStatus::Accepted);
        assert_eq!(map_status(StatusArg::Rejected), ExecutionStatus::Rejected);
    }
}
