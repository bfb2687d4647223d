//! Route-specific request parsing.
//!
//! Bodies arrive as raw JSON and go through two stages: a structural contract
//! check (shape, unknown keys, value types) and then field validation
//! (presence, blankness, length caps). Only a fully parsed value reaches the
//! acceptance protocol.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::AuthorityError;

pub const MAX_INTENT_DESCRIPTION_CHARS: usize = 2000;
pub const MAX_IDENTIFIER_CHARS: usize = 255;

const ACCEPT_STRING_FIELDS: [&str; 5] =
    ["caller_id", "org_id", "simulation_type", "intent_description", "idempotency_key"];
const ACCEPT_OBJECT_FIELDS: [&str; 1] = ["simulation_context"];
const VALIDATE_STRING_FIELDS: [&str; 2] = ["execution_id", "authority_signature"];

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ContractIssue {
    pub path: String,
    pub message: String,
}

impl ContractIssue {
    #[must_use]
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), message: message.into() }
    }
}

/// Which accept route a body arrived on.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceKind {
    /// Full acceptance: caller, org and simulation type are mandatory.
    Standard,
    /// Issuance with only an intent description; business validation
    /// happens downstream.
    AuthorityMint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StandardAcceptance {
    pub caller_id: String,
    pub org_id: String,
    pub simulation_type: String,
    pub intent_description: String,
    pub simulation_context: Value,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthorityMint {
    pub intent_description: String,
    pub caller_id: Option<String>,
    pub org_id: Option<String>,
    pub simulation_type: Option<String>,
    pub simulation_context: Value,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcceptRequest {
    Standard(StandardAcceptance),
    AuthorityMint(AuthorityMint),
}

impl AcceptRequest {
    /// Parses an accept body for the given route.
    ///
    /// # Errors
    /// Returns [`AuthorityError::ContractViolation`] when the body shape is
    /// wrong, or [`AuthorityError::Validation`] when fields are missing,
    /// blank or too long.
    pub fn parse(kind: AcceptanceKind, body: &Value) -> Result<Self, AuthorityError> {
        let object = check_contract(body, &ACCEPT_STRING_FIELDS, &ACCEPT_OBJECT_FIELDS)?;
        let mut errors = Vec::new();

        let intent_description = required_string(
            object,
            "intent_description",
            MAX_INTENT_DESCRIPTION_CHARS,
            &mut errors,
        );
        let idempotency_key = optional_key(object, &mut errors);
        let simulation_context = match object.get("simulation_context") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => Value::Object(Map::new()),
        };

        let request = match kind {
            AcceptanceKind::Standard => {
                let caller_id =
                    required_string(object, "caller_id", MAX_IDENTIFIER_CHARS, &mut errors);
                let org_id = required_string(object, "org_id", MAX_IDENTIFIER_CHARS, &mut errors);
                let simulation_type =
                    required_string(object, "simulation_type", MAX_IDENTIFIER_CHARS, &mut errors);
                Self::Standard(StandardAcceptance {
                    caller_id: caller_id.unwrap_or_default(),
                    org_id: org_id.unwrap_or_default(),
                    simulation_type: simulation_type.unwrap_or_default(),
                    intent_description: intent_description.unwrap_or_default(),
                    simulation_context,
                    idempotency_key,
                })
            }
            AcceptanceKind::AuthorityMint => Self::AuthorityMint(AuthorityMint {
                intent_description: intent_description.unwrap_or_default(),
                caller_id: optional_string(object, "caller_id", MAX_IDENTIFIER_CHARS, &mut errors),
                org_id: optional_string(object, "org_id", MAX_IDENTIFIER_CHARS, &mut errors),
                simulation_type: optional_string(
                    object,
                    "simulation_type",
                    MAX_IDENTIFIER_CHARS,
                    &mut errors,
                ),
                simulation_context,
                idempotency_key,
            }),
        };

        if errors.is_empty() {
            Ok(request)
        } else {
            Err(AuthorityError::Validation(errors))
        }
    }

    #[must_use]
    pub fn kind(&self) -> AcceptanceKind {
        match self {
            Self::Standard(_) => AcceptanceKind::Standard,
            Self::AuthorityMint(_) => AcceptanceKind::AuthorityMint,
        }
    }

    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            Self::Standard(request) => request.idempotency_key.as_deref(),
            Self::AuthorityMint(request) => request.idempotency_key.as_deref(),
        }
    }

    #[must_use]
    pub fn caller_id(&self) -> Option<&str> {
        match self {
            Self::Standard(request) => Some(request.caller_id.as_str()),
            Self::AuthorityMint(request) => request.caller_id.as_deref(),
        }
    }

    #[must_use]
    pub fn org_id(&self) -> Option<&str> {
        match self {
            Self::Standard(request) => Some(request.org_id.as_str()),
            Self::AuthorityMint(request) => request.org_id.as_deref(),
        }
    }

    #[must_use]
    pub fn simulation_type(&self) -> Option<&str> {
        match self {
            Self::Standard(request) => Some(request.simulation_type.as_str()),
            Self::AuthorityMint(request) => request.simulation_type.as_deref(),
        }
    }

    #[must_use]
    pub fn intent_description(&self) -> &str {
        match self {
            Self::Standard(request) => &request.intent_description,
            Self::AuthorityMint(request) => &request.intent_description,
        }
    }

    #[must_use]
    pub fn simulation_context(&self) -> &Value {
        match self {
            Self::Standard(request) => &request.simulation_context,
            Self::AuthorityMint(request) => &request.simulation_context,
        }
    }
}

/// Body of the validate protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateRequest {
    pub execution_id: String,
    pub authority_signature: String,
}

impl ValidateRequest {
    /// # Errors
    /// Returns [`AuthorityError::ContractViolation`] or
    /// [`AuthorityError::Validation`] for malformed bodies.
    pub fn parse(body: &Value) -> Result<Self, AuthorityError> {
        let object = check_contract(body, &VALIDATE_STRING_FIELDS, &[])?;
        let mut errors = Vec::new();
        let execution_id =
            required_string(object, "execution_id", MAX_IDENTIFIER_CHARS, &mut errors);
        let authority_signature =
            required_string(object, "authority_signature", MAX_IDENTIFIER_CHARS, &mut errors);

        match (execution_id, authority_signature) {
            (Some(execution_id), Some(authority_signature)) if errors.is_empty() => {
                Ok(Self { execution_id, authority_signature })
            }
            _ => Err(AuthorityError::Validation(errors)),
        }
    }
}

fn check_contract<'a>(
    body: &'a Value,
    string_fields: &[&str],
    object_fields: &[&str],
) -> Result<&'a Map<String, Value>, AuthorityError> {
    let Value::Object(object) = body else {
        return Err(AuthorityError::ContractViolation(vec![ContractIssue::new(
            "$",
            format!("expected a JSON object, found {}", json_type_name(body)),
        )]));
    };

    let mut issues = Vec::new();
    for (key, value) in object {
        let path = format!("$.{key}");
        if string_fields.contains(&key.as_str()) {
            if !matches!(value, Value::String(_) | Value::Null) {
                issues.push(ContractIssue::new(
                    path,
                    format!("expected string or null, found {}", json_type_name(value)),
                ));
            }
        } else if object_fields.contains(&key.as_str()) {
            if !matches!(value, Value::Object(_) | Value::Null) {
                issues.push(ContractIssue::new(
                    path,
                    format!("expected object or null, found {}", json_type_name(value)),
                ));
            }
        } else {
            issues.push(ContractIssue::new(path, "unknown field"));
        }
    }

    if issues.is_empty() {
        Ok(object)
    } else {
        Err(AuthorityError::ContractViolation(issues))
    }
}

fn string_value<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    object.get(field).and_then(Value::as_str).map(str::trim)
}

fn required_string(
    object: &Map<String, Value>,
    field: &str,
    max_chars: usize,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match string_value(object, field) {
        None => {
            errors.push(FieldError::new(field, format!("{field} must be provided")));
            None
        }
        Some("") => {
            errors.push(FieldError::new(field, format!("{field} cannot be empty")));
            None
        }
        Some(value) => check_length(field, value, max_chars, errors),
    }
}

fn optional_string(
    object: &Map<String, Value>,
    field: &str,
    max_chars: usize,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match string_value(object, field) {
        None | Some("") => None,
        Some(value) => check_length(field, value, max_chars, errors),
    }
}

fn optional_key(object: &Map<String, Value>, errors: &mut Vec<FieldError>) -> Option<String> {
    match string_value(object, "idempotency_key") {
        None => None,
        Some("") => {
            errors.push(FieldError::new(
                "idempotency_key",
                "idempotency_key cannot be empty when provided",
            ));
            None
        }
        Some(value) => check_length("idempotency_key", value, MAX_IDENTIFIER_CHARS, errors),
    }
}

fn check_length(
    field: &str,
    value: &str,
    max_chars: usize,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    let length = value.chars().count();
    if length > max_chars {
        errors.push(FieldError::new(
            field,
            format!("{field} must be at most {max_chars} characters (got {length})"),
        ));
        return None;
    }
    Some(value.to_string())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
