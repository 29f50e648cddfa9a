#![forbid(unsafe_code)]

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier as _, SaltString},
    Argon2,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Argon2 PHC string for a private room. The plaintext password is never kept.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PasswordVerifier(String);

impl PasswordVerifier {
    pub fn create(password: &str) -> Result<Self, argon2::password_hash::Error> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
        Ok(Self(hash.to_string()))
    }

    /// A malformed stored verifier rejects every candidate.
    pub fn verify(&self, candidate: &str) -> bool {
        let parsed = match PasswordHash::new(&self.0) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Stored room password verifier is malformed: {}", e);
                return false;
            }
        };
        Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok()
    }
}

impl std::fmt::Debug for PasswordVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordVerifier(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_verify() {
        let verifier = PasswordVerifier::create("movie-night").unwrap();
        assert!(verifier.verify("movie-night"));
        assert!(!verifier.verify("Movie-Night"));
        let stored = serde_json::to_string(&verifier).unwrap();
        assert!(stored.starts_with("\"$argon2"));
        assert!(!stored.contains("movie-night"));
    }

    #[test]
    fn test_salted() {
        let a = PasswordVerifier::create("same").unwrap();
        let b = PasswordVerifier::create("same").unwrap();
        assert_ne!(a, b);
        assert!(a.verify("same") && b.verify("same"));
    }

    #[test]
    fn test_malformed_rejects() {
        let verifier: PasswordVerifier = serde_json::from_str("\"not-a-phc-string\"").unwrap();
        assert!(!verifier.verify("anything"));
    }

    #[test]
    fn test_debug_hides_hash() {
        let verifier = PasswordVerifier::create("secret").unwrap();
        assert_eq!(format!("{verifier:?}"), "PasswordVerifier(..)");
    }
}
