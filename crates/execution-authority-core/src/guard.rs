//! Statement policy for append-only tables.
//!
//! Statements are tokenized (comments and string literals removed, quoted
//! identifiers unwrapped, case folded) and scanned for mutation verbs whose
//! target is a protected table. The scan covers every statement in a batch.

use std::fmt::{Display, Formatter};

use serde::Serialize;

/// Tables that only ever receive inserts.
pub const APPEND_ONLY_TABLES: [&str; 2] = ["execution_records", "schema_migrations"];

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MutationVerb {
    Update,
    Delete,
    Truncate,
    Drop,
    Alter,
    Replace,
    Upsert,
}

impl MutationVerb {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Drop => "DROP",
            Self::Alter => "ALTER",
            Self::Replace => "REPLACE",
            Self::Upsert => "UPSERT",
        }
    }
}

impl Display for MutationVerb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq, thiserror::Error)]
#[error("{verb} on append-only object {target} is not permitted")]
pub struct ImmutabilityViolation {
    pub verb: MutationVerb,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ImmutabilityGuard {
    protected: Vec<String>,
}

impl Default for ImmutabilityGuard {
    fn default() -> Self {
        Self::new(APPEND_ONLY_TABLES)
    }
}

impl ImmutabilityGuard {
    #[must_use]
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            protected: tables
                .into_iter()
                .map(|table| table.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    #[must_use]
    pub fn protected_tables(&self) -> &[String] {
        &self.protected
    }

    /// Rejects any statement in `sql` that mutates a protected table.
    ///
    /// # Errors
    /// Returns the first [`ImmutabilityViolation`] found.
    pub fn check(&self, sql: &str) -> Result<(), ImmutabilityViolation> {
        let tokens = tokenize(sql);
        for statement in tokens.split(|token| token == ";") {
            self.check_statement(statement)?;
        }
        Ok(())
    }

    fn is_protected(&self, name: &str) -> bool {
        let bare = name.rsplit('.').next().unwrap_or(name);
        self.protected.iter().any(|table| table == bare)
    }

    fn guards_object(&self, name: &str) -> bool {
        let bare = name.rsplit('.').next().unwrap_or(name);
        self.protected.iter().any(|table| bare.contains(table.as_str()))
    }

    fn check_statement(&self, tokens: &[String]) -> Result<(), ImmutabilityViolation> {
        let mut insert_target: Option<&str> = None;

        for (index, token) in tokens.iter().enumerate() {
            let previous = index.checked_sub(1).and_then(|at| peek(tokens, at));
            let violation = match token.as_str() {
                "into" => {
                    let after_replace = previous == Some("replace");
                    let target = peek(tokens, index + 1);
                    if after_replace || tokens[..index].iter().any(|t| t == "insert") {
                        insert_target = target;
                    }
                    target
                        .filter(|target| after_replace && self.is_protected(target))
                        .map(|target| (MutationVerb::Replace, target))
                }
                "update" if previous == Some("do") => insert_target
                    .filter(|target| self.is_protected(target))
                    .map(|target| (MutationVerb::Upsert, target)),
                "update" => {
                    let offset = if peek(tokens, index + 1) == Some("or") { 3 } else { 1 };
                    peek(tokens, index + offset)
                        .filter(|target| self.is_protected(target))
                        .map(|target| (MutationVerb::Update, target))
                }
                "delete" => match (peek(tokens, index + 1), peek(tokens, index + 2)) {
                    (Some("from"), Some(target)) if self.is_protected(target) => {
                        Some((MutationVerb::Delete, target))
                    }
                    _ => None,
                },
                "truncate" => {
                    let offset = if peek(tokens, index + 1) == Some("table") { 2 } else { 1 };
                    peek(tokens, index + offset)
                        .filter(|target| self.is_protected(target))
                        .map(|target| (MutationVerb::Truncate, target))
                }
                "drop" => {
                    let guarded_if_exists = peek(tokens, index + 2) == Some("if")
                        && peek(tokens, index + 3) == Some("exists");
                    let offset = if guarded_if_exists { 4 } else { 2 };
                    match (peek(tokens, index + 1), peek(tokens, index + offset)) {
                        (Some("table" | "view"), Some(target)) if self.is_protected(target) => {
                            Some((MutationVerb::Drop, target))
                        }
                        (Some("trigger" | "index"), Some(target)) if self.guards_object(target) => {
                            Some((MutationVerb::Drop, target))
                        }
                        _ => None,
                    }
                }
                "alter" => match (peek(tokens, index + 1), peek(tokens, index + 2)) {
                    (Some("table"), Some(target)) if self.is_protected(target) => {
                        Some((MutationVerb::Alter, target))
                    }
                    _ => None,
                },
                _ => None,
            };

            if let Some((verb, target)) = violation {
                return Err(ImmutabilityViolation { verb, target: target.to_string() });
            }
        }

        Ok(())
    }
}

fn peek(tokens: &[String], index: usize) -> Option<&str> {
    tokens.get(index).map(String::as_str)
}

/// Convenience check against the default protected tables.
///
/// # Errors
/// Returns the first [`ImmutabilityViolation`] found.
pub fn check_statement(sql: &str) -> Result<(), ImmutabilityViolation> {
    ImmutabilityGuard::default().check(sql)
}

fn tokenize(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];
        if ch.is_whitespace() {
            index += 1;
        } else if ch == '-' && chars.get(index + 1) == Some(&'-') {
            while index < chars.len() && chars[index] != '\n' {
                index += 1;
            }
        } else if ch == '/' && chars.get(index + 1) == Some(&'*') {
            index += 2;
            while index < chars.len()
                && !(chars[index] == '*' && chars.get(index + 1) == Some(&'/'))
            {
                index += 1;
            }
            index += 2;
        } else if ch == '\'' {
            index += 1;
            while index < chars.len() {
                if chars[index] == '\'' {
                    if chars.get(index + 1) == Some(&'\'') {
                        index += 2;
                        continue;
                    }
                    break;
                }
                index += 1;
            }
            index += 1;
            tokens.push("'literal'".to_string());
        } else if matches!(ch, '"' | '`' | '[') {
            let close = if ch == '[' { ']' } else { ch };
            let start = index + 1;
            index = start;
            while index < chars.len() && chars[index] != close {
                index += 1;
            }
            let ident: String = chars[start..index.min(chars.len())].iter().collect();
            index += 1;
            append_identifier(&mut tokens, &ident.to_ascii_lowercase());
        } else if ch.is_alphanumeric() || ch == '_' {
            let start = index;
            while index < chars.len() && (chars[index].is_alphanumeric() || chars[index] == '_') {
                index += 1;
            }
            let word: String = chars[start..index].iter().collect();
            append_identifier(&mut tokens, &word.to_ascii_lowercase());
        } else if ch == '.' {
            if let Some(last) = tokens.last_mut() {
                last.push('.');
            }
            index += 1;
        } else {
            tokens.push(ch.to_string());
            index += 1;
        }
    }

    tokens
}

// `main.` followed by a quoted or bare name joins into one dotted token.
fn append_identifier(tokens: &mut Vec<String>, ident: &str) {
    match tokens.last_mut() {
        Some(last) if last.ends_with('.') => last.push_str(ident),
        _ => tokens.push(ident.to_string()),
    }
}
