//! Identifier minting and acceptance signatures.
//!
//! Signatures are HMAC-SHA256 over `{execution_id}:{timestamp}` rendered as
//! lowercase hex. Verification compares the hex text in constant time, so a
//! change of letter case in a supplied signature is a mismatch.

use std::fmt::{Debug, Formatter};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{AuthorityError, ExecutionId, SpanId};

type HmacSha256 = Hmac<Sha256>;

/// Minimum secret length accepted in production mode.
pub const MIN_PRODUCTION_SECRET_BYTES: usize = 32;

/// Mints a fresh `exec-<uuid>` identifier.
#[must_use]
pub fn mint_execution_id() -> ExecutionId {
    ExecutionId::from_uuid(Uuid::new_v4())
}

/// Generates a root span id. It is unrelated to the execution id.
#[must_use]
pub fn generate_root_span_id() -> SpanId {
    SpanId::from_uuid(Uuid::new_v4())
}

/// Canonical signing material.
#[must_use]
pub fn signing_material(execution_id: &str, timestamp: &str) -> String {
    format!("{execution_id}:{timestamp}")
}

/// Computes the acceptance signature as lowercase hex.
///
/// # Errors
/// Returns [`AuthorityError::Signature`] when the MAC cannot be keyed.
pub fn sign(execution_id: &str, timestamp: &str, secret: &[u8]) -> Result<String, AuthorityError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| AuthorityError::Signature(format!("invalid signing secret: {err}")))?;
    mac.update(signing_material(execution_id, timestamp).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Recomputes the signature and compares it with `signature`.
#[must_use]
pub fn verify(execution_id: &str, timestamp: &str, signature: &str, secret: &[u8]) -> bool {
    let Ok(expected) = sign(execution_id, timestamp, secret) else {
        return false;
    };
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(provided).into()
}

/// Holds the authority secret. `Debug` never prints key material.
#[derive(Clone)]
pub struct SigningKey {
    secret: Vec<u8>,
}

impl SigningKey {
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.secret.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secret.is_empty()
    }

    #[must_use]
    pub fn is_production_strength(&self) -> bool {
        self.secret.len() >= MIN_PRODUCTION_SECRET_BYTES
    }

    /// # Errors
    /// Returns [`AuthorityError::Signature`] when the MAC cannot be keyed.
    pub fn sign(&self, execution_id: &str, timestamp: &str) -> Result<String, AuthorityError> {
        sign(execution_id, timestamp, &self.secret)
    }

    #[must_use]
    pub fn verify(&self, execution_id: &str, timestamp: &str, signature: &str) -> bool {
        verify(execution_id, timestamp, signature, &self.secret)
    }
}

impl Debug for SigningKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("len", &self.secret.len())
            .finish_non_exhaustive()
    }
}
