//! API credentials
//!
//! Tokens are opaque bearer strings handed out once at creation. Only an
//! Argon2 PHC hash is ever stored, so validation has to verify the
//! presented token against each active hash.

use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult, Result};

/// Prefix of every issued token
pub const TOKEN_PREFIX: &str = "pm_";

/// Engine-facing credential contract: validate the token and, when it is
/// valid, record that it was used.
pub trait CredentialValidator: Send + Sync {
    fn validate_credential(&self, token: &str) -> Result<bool>;
}

/// Stored credential metadata. The hash never leaves the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialInfo {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Generate a fresh random token
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    format!(
        "{}{}",
        TOKEN_PREFIX,
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

/// Hash a token for storage
pub fn hash_token(token: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::HashingFailed { reason: e.to_string() })
}

/// Check a presented token against a stored hash. Malformed hashes never
/// match.
pub fn verify_token(token: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(token.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed credential hash");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_prefixed_and_unique() {
        let first = generate_token();
        let second = generate_token();

        assert!(first.starts_with(TOKEN_PREFIX));
        assert_eq!(first.len(), TOKEN_PREFIX.len() + 43);
        assert_ne!(first, second);
    }

    #[test]
    fn test_hash_and_verify() {
        let token = generate_token();
        let hash = hash_token(&token).unwrap();

        assert_ne!(hash, token);
        assert!(verify_token(&token, &hash));
        assert!(!verify_token("pm_wrong", &hash));
    }

    #[test]
    fn test_malformed_hash_never_matches() {
        assert!(!verify_token("pm_anything", "not-a-phc-string"));
    }
}
