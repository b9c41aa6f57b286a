//! Token, username and password helpers shared by the auth services.

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use base64ct::{Base64UrlUnpadded, Encoding};
use once_cell::sync::Lazy;
use rand::{RngCore, rngs::OsRng};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

static USERNAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._@-]{0,63}$").ok());

/// Usernames end up inside store keys; keep them to a safe alphabet.
pub(crate) fn valid_username(name: &str) -> Result<()> {
    if USERNAME.as_ref().is_some_and(|regex| regex.is_match(name)) {
        Ok(())
    } else {
        Err(Error::bad_parameter(format!("invalid username {name:?}")))
    }
}

/// 32 random bytes, base64url. Used for session ids and signup tokens.
pub(crate) fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| Error::storage(format!("failed to generate token: {err}")))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Raw tokens never reach the store; records are keyed by this digest.
pub(crate) fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    Base64UrlUnpadded::encode_string(&hasher.finalize())
}

/// Argon2id PHC string. Runs on the blocking pool.
pub(crate) async fn hash_password(password: &SecretString) -> Result<String> {
    let password = password.clone();
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.expose_secret().as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|_| Error::storage("failed to hash password"))
    })
    .await
    .map_err(Error::storage)?
}

/// `Ok(false)` on mismatch; errors only when the stored hash is unreadable.
pub(crate) async fn verify_password(password: &SecretString, stored_hash: &str) -> Result<bool> {
    let password = password.clone();
    let stored_hash = stored_hash.to_string();
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored_hash)
            .map_err(|_| Error::storage("stored password hash is malformed"))?;
        Ok(Argon2::default()
            .verify_password(password.expose_secret().as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(Error::storage)?
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn usernames() {
        for good in ["alice", "bob.smith", "a", "ops@example.com", "n0de-1_x"] {
            assert!(valid_username(good).is_ok(), "{good}");
        }
        for bad in ["", ".alice", "a/b", "with space", &"x".repeat(65)] {
            assert!(valid_username(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn tokens_are_random_and_url_safe() {
        let a = generate_token().unwrap();
        let b = generate_token().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(!a.contains('/') && !a.contains('+'));
        assert_eq!(hash_token(&a), hash_token(&a));
        assert_ne!(hash_token(&a), a);
    }

    #[tokio::test]
    async fn password_hash_round_trip() {
        let password = SecretString::from("pwd123");
        let hash = hash_password(&password).await.unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password(&password, &hash).await.unwrap());
        assert!(!verify_password(&SecretString::from("pwd124"), &hash)
            .await
            .unwrap());
        assert!(verify_password(&password, "garbage").await.is_err());
    }
}
