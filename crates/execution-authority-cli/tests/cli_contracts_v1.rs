#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use execution_authority_core::{build_record, now_utc, AcceptRequest, AcceptanceKind, SigningKey};
use execution_authority_store_sqlite::SqliteLedgerStore;
use jsonschema::JSONSchema;
use serde_json::{json, Value};
use ulid::Ulid;

const SECRET: &str = "cli-contract-secret-with-32-bytes!!";

fn ea_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_ea") {
        Ok(value) => PathBuf::from(value),
        Err(_) => Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/ea"),
    }
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ea-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn ea_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(ea_binary_path());
    command.env_remove("EXECUTION_AUTHORITY_SECRET");
    command.env_remove("EXECUTION_AUTHORITY_DB");
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run ea command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_name);
    let body = fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
    let schema: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!("schema validation failed for {schema_name}:\n{}", errors.join("\n"));
    }
}

/// Appends records signed under `secret`; returns `(execution_id, signature)` pairs.
fn seed_records(db_path: &Path, secret: &str, count: usize) -> Vec<(String, String)> {
    let store = match SqliteLedgerStore::open(db_path) {
        Ok(store) => store,
        Err(err) => panic!("failed to open seed store: {err:#}"),
    };
    if let Err(err) = store.migrate() {
        panic!("failed to migrate seed store: {err:#}");
    }
    let key = SigningKey::new(secret.as_bytes().to_vec());

    (0..count)
        .map(|index| {
            let body = json!({
                "caller_id": "planner",
                "org_id": "org-1",
                "simulation_type": "stress",
                "intent_description": format!("contract fixture {index}"),
                "simulation_context": {"index": index},
                "idempotency_key": format!("seed-{index}"),
            });
            let request = AcceptRequest::parse(AcceptanceKind::Standard, &body)
                .unwrap_or_else(|err| panic!("invalid fixture request: {err}"));
            let record = build_record(&request, &key, now_utc())
                .unwrap_or_else(|err| panic!("failed to build fixture: {err}"));
            if let Err(err) = store.append_record(&record) {
                panic!("failed to append fixture: {err:#}");
            }
            (record.execution_id.to_string(), record.authority_signature)
        })
        .collect()
}

#[test]
fn help_lists_command_groups() {
    let output = match Command::new(ea_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["ledger", "execution"] {
        assert!(stdout.contains(required), "help output missing {required}: {stdout}");
    }
}

#[test]
fn ledger_check_json_matches_contract() {
    let db_path = temp_db("check");
    let migrate = ea_output(&db_path, &["ledger", "migrate", "--json"]);
    assert!(migrate.status.success(), "{}", String::from_utf8_lossy(&migrate.stderr));
    let status = stdout_json(&migrate);
    assert_eq!(status["pending_versions"], json!([]));

    let output = ea_output(&db_path, &["ledger", "check", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let payload = stdout_json(&output);
    assert_schema("ledger-check.schema.json", &payload);
    assert_eq!(payload["complete"], json!(true));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn ledger_check_exits_non_zero_when_ledger_is_missing() {
    let db_path = temp_db("check-missing");
    let output = ea_output(&db_path, &["ledger", "check", "--json"]);
    assert!(!output.status.success());

    let payload = stdout_json(&output);
    assert_schema("ledger-check.schema.json", &payload);
    assert_eq!(payload["complete"], json!(false));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ledger constraints missing"), "stderr={stderr}");

    let _ = fs::remove_file(&db_path);
}

#[test]
fn execution_show_emits_record_contract() {
    let db_path = temp_db("show");
    let seeded = seed_records(&db_path, SECRET, 1);

    let output = ea_output(&db_path, &["execution", "show", "--execution-id", &seeded[0].0]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let record = stdout_json(&output);
    assert_schema("execution-record.schema.json", &record);
    assert_eq!(record["authority_signature"], json!(seeded[0].1));
    assert_eq!(record["simulation_context"], json!({"index": 0}));
    assert_eq!(record["lineage"]["root_span_id"], record["root_span_id"]);

    let _ = fs::remove_file(&db_path);
}

#[test]
fn execution_list_pages_newest_first() {
    let db_path = temp_db("list");
    seed_records(&db_path, SECRET, 3);

    let output = ea_output(&db_path, &["execution", "list", "--limit", "2", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let page = stdout_json(&output);
    assert_eq!(page["total"], json!(3));
    assert_eq!(page["limit"], json!(2));
    let data = page["data"].as_array().cloned().unwrap_or_default();
    assert_eq!(data.len(), 2);
    for record in &data {
        assert_schema("execution-record.schema.json", record);
    }
    assert_eq!(data[0]["intent_description"], json!("contract fixture 2"));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn execution_validate_reports_outcomes() {
    let db_path = temp_db("validate");
    let seeded = seed_records(&db_path, SECRET, 1);
    let (execution_id, signature) = &seeded[0];

    let valid = ea_output(
        &db_path,
        &[
            "--signing-secret",
            SECRET,
            "execution",
            "validate",
            "--execution-id",
            execution_id,
            "--signature",
            signature,
        ],
    );
    assert!(valid.status.success(), "{}", String::from_utf8_lossy(&valid.stderr));
    let payload = stdout_json(&valid);
    assert_schema("validation-outcome.schema.json", &payload);
    assert_eq!(payload["valid"], json!(true));

    let mismatch = ea_output(
        &db_path,
        &[
            "--signing-secret",
            SECRET,
            "execution",
            "validate",
            "--execution-id",
            execution_id,
            "--signature",
            &"0".repeat(64),
        ],
    );
    let payload = stdout_json(&mismatch);
    assert_schema("validation-outcome.schema.json", &payload);
    assert_eq!(payload["reason"], json!("signature_mismatch"));

    let unknown = ea_output(
        &db_path,
        &[
            "--signing-secret",
            SECRET,
            "execution",
            "validate",
            "--execution-id",
            "exec-not-minted-here",
            "--signature",
            signature,
        ],
    );
    let payload = stdout_json(&unknown);
    assert_eq!(payload["reason"], json!("execution_not_found"));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn ledger_audit_flags_records_signed_under_another_key() {
    let db_path = temp_db("audit");
    seed_records(&db_path, SECRET, 2);

    let clean = ea_output(&db_path, &["--signing-secret", SECRET, "ledger", "audit", "--json"]);
    assert!(clean.status.success(), "{}", String::from_utf8_lossy(&clean.stderr));
    let payload = stdout_json(&clean);
    assert_schema("ledger-audit.schema.json", &payload);
    assert_eq!(payload["checked"], json!(2));
    assert_eq!(payload["clean"], json!(true));

    let rotated = ea_output(
        &db_path,
        &["--signing-secret", "a-different-secret", "ledger", "audit", "--json"],
    );
    assert!(!rotated.status.success(), "audit under a rotated key must exit non-zero");
    let payload = stdout_json(&rotated);
    assert_schema("ledger-audit.schema.json", &payload);
    assert_eq!(payload["findings"].as_array().map(Vec::len), Some(2));
    let stderr = String::from_utf8_lossy(&rotated.stderr);
    assert!(stderr.contains("failing signature recomputation"), "stderr={stderr}");

    let _ = fs::remove_file(&db_path);
}

#[test]
fn audit_without_secret_is_refused() {
    let db_path = temp_db("audit-nosecret");
    let output = ea_output(&db_path, &["ledger", "audit"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("signing secret is required"), "stderr={stderr}");
    let _ = fs::remove_file(&db_path);
}
