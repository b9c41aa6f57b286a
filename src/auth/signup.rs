//! Single-use signup tokens.
//!
//! An operator issues a token for a username; the prospective user redeems it
//! once with a password and the first code of the HOTP secret provisioned
//! with the token. Layout:
//!
//! * `signup/tokens/<digest>` holds the record and carries the token TTL.
//! * `signup/users/<name>` points at the user's single live token, so issuing
//!   a new one invalidates the previous one.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::users::Users;
use super::utils;
use crate::backend::{self, Backend};
use crate::otp::Hotp;
use crate::{Error, Result};

const ISSUE_ATTEMPTS: usize = 3;

/// Stored form of a signup token. Carries the HOTP state the new user will
/// inherit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignupTokenData {
    pub username: String,
    pub hotp: Hotp,
    pub otp_url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Time the holder is expected to need to finish enrollment.
    /// Informational, nothing enforces it.
    pub user_actions_ttl: Duration,
}

/// What `GetSignupTokenData` returns to the token holder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignupTokenInfo {
    pub username: String,
    pub otp_url: String,
    #[serde(with = "crate::secret::string")]
    pub otp_secret: SecretString,
    /// Time the token has left.
    pub ttl: Duration,
    pub user_actions_ttl: Duration,
}

fn token_key(token: &str) -> String {
    backend::key(&["signup", "tokens", &utils::hash_token(token)])
}

fn index_key(username: &str) -> String {
    backend::key(&["signup", "users", username])
}

fn not_found() -> Error {
    Error::not_found("signup token")
}

#[derive(Clone)]
pub struct SignupTokens {
    backend: Arc<dyn Backend>,
    users: Users,
    otp_issuer: String,
    token_ttl: Duration,
    user_actions_ttl: Duration,
}

impl SignupTokens {
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        users: Users,
        otp_issuer: impl Into<String>,
        token_ttl: Duration,
        user_actions_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            users,
            otp_issuer: otp_issuer.into(),
            token_ttl,
            user_actions_ttl,
        }
    }

    /// Issue a token for `username`, invalidating any earlier one.
    ///
    /// # Errors
    /// Returns `BadParameter` for an invalid username, `CompareFailed` if
    /// concurrent issuers kept racing for the same user, and `Storage` if
    /// the superseded token could not be removed. The superseded token is
    /// unusable either way once the index points elsewhere.
    #[instrument(skip(self))]
    pub async fn create_signup_token(&self, username: &str) -> Result<String> {
        utils::valid_username(username)?;
        let index = index_key(username);

        for _ in 0..ISSUE_ATTEMPTS {
            let previous = match self.backend.get(&index).await {
                Ok(item) => Some(item.value),
                Err(Error::NotFound(_)) => None,
                Err(err) => return Err(err),
            };

            let token = utils::generate_token()?;
            let digest = utils::hash_token(&token);
            let hotp = Hotp::generate()?;
            let now = Utc::now();
            let ttl = chrono::Duration::from_std(self.token_ttl)
                .map_err(|_| Error::bad_parameter("signup token ttl out of range"))?;
            let data = SignupTokenData {
                username: username.to_string(),
                otp_url: hotp.url(&self.otp_issuer, username)?,
                hotp,
                created_at: now,
                expires_at: now + ttl,
                user_actions_ttl: self.user_actions_ttl,
            };
            let key = token_key(&token);
            self.backend
                .put(&key, &backend::encode(&data)?, Some(self.token_ttl))
                .await?;

            match self
                .backend
                .compare_and_swap(
                    &index,
                    previous.as_deref(),
                    digest.as_bytes(),
                    Some(self.token_ttl),
                )
                .await
            {
                Ok(()) => {
                    if let Some(previous) = previous {
                        self.revoke(&previous).await?;
                    }
                    info!("issued signup token for {username}");
                    return Ok(token);
                }
                Err(Error::CompareFailed(_)) => {
                    debug!("signup token index for {username} moved, retrying");
                    self.discard(&key).await;
                }
                Err(err) => {
                    self.discard(&key).await;
                    return Err(err);
                }
            }
        }
        Err(Error::CompareFailed(format!("signup token for {username}")))
    }

    async fn revoke(&self, digest: &[u8]) -> Result<()> {
        let digest = std::str::from_utf8(digest)
            .map_err(|_| Error::storage("signup token index holds a non-utf8 digest"))?;
        let key = backend::key(&["signup", "tokens", digest]);
        match self.backend.delete(&key).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(err) => {
                warn!("failed to revoke superseded signup token: {err}");
                Err(err)
            }
        }
    }

    // Best effort: the record is unreachable once the index no longer names it.
    async fn discard(&self, key: &str) {
        match self.backend.delete(key).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(err) => warn!("failed to discard unissued signup token: {err}"),
        }
    }

    async fn load(&self, token: &str) -> Result<(Vec<u8>, Option<Duration>, SignupTokenData)> {
        let item = self
            .backend
            .get(&token_key(token))
            .await
            .map_err(|err| if err.is_not_found() { not_found() } else { err })?;
        let data: SignupTokenData = backend::decode(&item.value)?;
        if Utc::now() >= data.expires_at {
            return Err(Error::Expired("signup token".to_string()));
        }
        // Only the token the index names is live.
        match self.backend.get(&index_key(&data.username)).await {
            Ok(index) if index.value == utils::hash_token(token).as_bytes() => {}
            Ok(_) | Err(Error::NotFound(_)) => return Err(not_found()),
            Err(err) => return Err(err),
        }
        Ok((item.value, item.ttl, data))
    }

    /// Look up a live token.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown or consumed tokens and `Expired` when
    /// the record outlived its own deadline.
    pub async fn get_signup_token(&self, token: &str) -> Result<(SignupTokenData, Duration)> {
        let (_, ttl, data) = self.load(token).await?;
        let remaining = ttl.unwrap_or_else(|| {
            (data.expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        });
        Ok((data, remaining))
    }

    /// Everything the token holder needs before choosing a password.
    ///
    /// # Errors
    /// See [`SignupTokens::get_signup_token`].
    pub async fn get_signup_token_info(&self, token: &str) -> Result<SignupTokenInfo> {
        let (data, ttl) = self.get_signup_token(token).await?;
        Ok(SignupTokenInfo {
            otp_secret: SecretString::from(data.hotp.secret_base32().to_string()),
            username: data.username,
            otp_url: data.otp_url,
            ttl,
            user_actions_ttl: data.user_actions_ttl,
        })
    }

    /// Redeem `token`: create the user with `password` and the token's HOTP
    /// secret, advanced past `code`. Returns the new username.
    ///
    /// # Errors
    /// Returns `InvalidCredentials` for a wrong code (the token stays usable)
    /// and `NotFound` once the token is gone, including when a concurrent
    /// redemption won.
    #[instrument(skip_all)]
    pub async fn create_user_with_token(
        &self,
        token: &str,
        password: &SecretString,
        code: &str,
    ) -> Result<String> {
        let (observed, ttl, data) = self.load(token).await?;
        if !data.hotp.check(code) {
            debug!("signup code mismatch for {}", data.username);
            return Err(Error::InvalidCredentials);
        }
        if password.expose_secret().is_empty() {
            return Err(Error::bad_parameter("password is empty"));
        }
        // Hash before consuming so nothing slow sits between delete and write.
        let password_hash = utils::hash_password(password).await?;

        let key = token_key(token);
        match self.backend.compare_and_delete(&key, &observed).await {
            Ok(()) => {}
            Err(Error::NotFound(_) | Error::CompareFailed(_)) => return Err(not_found()),
            Err(err) => return Err(err),
        }

        let mut hotp = data.hotp;
        hotp.advance();
        if let Err(err) = self
            .users
            .store_hashed(&data.username, password_hash, hotp)
            .await
        {
            if let Err(restore) = self.backend.put(&key, &observed, ttl).await {
                warn!("failed to restore signup token after error: {restore}");
            }
            return Err(err);
        }

        let digest = utils::hash_token(token);
        match self
            .backend
            .compare_and_delete(&index_key(&data.username), digest.as_bytes())
            .await
        {
            // A newer token may already own the index.
            Ok(()) | Err(Error::NotFound(_) | Error::CompareFailed(_)) => {}
            Err(err) => warn!("failed to clear signup index for {}: {err}", data.username),
        }
        info!("created user {} from signup token", data.username);
        Ok(data.username)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::{Item, MemoryBackend};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn tokens(ttl: Duration) -> (SignupTokens, Users) {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let users = Users::new(backend.clone(), "custos");
        (
            SignupTokens::new(backend, users.clone(), "custos", ttl, HOUR.min(ttl)),
            users,
        )
    }

    fn pwd(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    const DAY: Duration = Duration::from_secs(24 * 3600);
    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn redeem_once() {
        let (tokens, users) = tokens(DAY);
        let token = tokens.create_signup_token("alice").await.unwrap();

        let info = tokens.get_signup_token_info(&token).await.unwrap();
        assert_eq!(info.username, "alice");
        assert!(info.ttl <= DAY && info.ttl > DAY - Duration::from_secs(60));
        let (mut otp, _) = Hotp::from_url(&info.otp_url).unwrap();
        let code = otp.next_code().unwrap();

        assert_eq!(
            tokens.create_user_with_token(&token, &pwd("pwd123"), "bad").await,
            Err(Error::InvalidCredentials)
        );
        let name = tokens
            .create_user_with_token(&token, &pwd("pwd123"), &code)
            .await
            .unwrap();
        assert_eq!(name, "alice");

        // Gone after use.
        assert!(tokens.get_signup_token(&token).await.unwrap_err().is_not_found());
        assert!(tokens
            .create_user_with_token(&token, &pwd("pwd123"), &code)
            .await
            .unwrap_err()
            .is_not_found());

        // The user inherits the secret, past the code used at signup.
        let next = otp.next_code().unwrap();
        users.verify_password("alice", &pwd("pwd123"), &code).await.unwrap_err();
        users.verify_password("alice", &pwd("pwd123"), &next).await.unwrap();
    }

    #[tokio::test]
    async fn new_token_replaces_the_old_one() {
        let (tokens, _) = tokens(DAY);
        let first = tokens.create_signup_token("bob").await.unwrap();
        let second = tokens.create_signup_token("bob").await.unwrap();
        assert!(tokens.get_signup_token(&first).await.unwrap_err().is_not_found());
        tokens.get_signup_token(&second).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_expire() {
        let (tokens, _) = tokens(Duration::from_secs(60));
        let token = tokens.create_signup_token("carol").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(tokens.get_signup_token(&token).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn concurrent_redemption_has_one_winner() {
        let (tokens, _) = tokens(DAY);
        let token = tokens.create_signup_token("dave").await.unwrap();
        let info = tokens.get_signup_token_info(&token).await.unwrap();
        let (otp, _) = Hotp::from_url(&info.otp_url).unwrap();
        let code = otp.code().unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let tokens = tokens.clone();
            let token = token.clone();
            let code = code.clone();
            tasks.spawn(async move {
                tokens
                    .create_user_with_token(&token, &pwd("pwd123"), &code)
                    .await
            });
        }
        let mut wins = 0;
        while let Some(outcome) = tasks.join_next().await {
            match outcome.unwrap() {
                Ok(_) => wins += 1,
                Err(err) => assert!(err.is_not_found(), "{err}"),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn token_carries_the_user_actions_window() {
        let (tokens, _) = tokens(DAY);
        let token = tokens.create_signup_token("erin").await.unwrap();
        let info = tokens.get_signup_token_info(&token).await.unwrap();
        assert_eq!(info.user_actions_ttl, HOUR);
        assert!(info.ttl > info.user_actions_ttl);
    }

    /// Memory store whose deletes fail under a chosen key prefix.
    struct FailingDeletes {
        inner: MemoryBackend,
        prefix: Mutex<Option<&'static str>>,
    }

    impl FailingDeletes {
        fn check(&self, key: &str) -> Result<()> {
            match *self.prefix.lock().unwrap() {
                Some(prefix) if key.starts_with(prefix) => Err(Error::storage("disk")),
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Backend for FailingDeletes {
        async fn get(&self, key: &str) -> Result<Item> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
            self.inner.put(key, value, ttl).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&[u8]>,
            value: &[u8],
            ttl: Option<Duration>,
        ) -> Result<()> {
            self.inner.compare_and_swap(key, expected, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.check(key)?;
            self.inner.delete(key).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<()> {
            self.check(key)?;
            self.inner.compare_and_delete(key, expected).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<Item>> {
            self.inner.list(prefix).await
        }
    }

    fn failing_tokens() -> (SignupTokens, Users, Arc<FailingDeletes>) {
        let store = Arc::new(FailingDeletes {
            inner: MemoryBackend::new(),
            prefix: Mutex::new(None),
        });
        let backend: Arc<dyn Backend> = store.clone();
        let users = Users::new(backend.clone(), "custos");
        (
            SignupTokens::new(backend, users.clone(), "custos", DAY, HOUR),
            users,
            store,
        )
    }

    #[tokio::test]
    async fn failed_revocation_is_reported() {
        let (tokens, _, store) = failing_tokens();
        let first = tokens.create_signup_token("bob").await.unwrap();

        *store.prefix.lock().unwrap() = Some("signup/tokens/");
        assert_eq!(
            tokens.create_signup_token("bob").await,
            Err(Error::Storage("disk".to_string()))
        );

        // The old record survived the failed delete but the index moved on.
        store.inner.get(&token_key(&first)).await.unwrap();
        assert!(tokens.get_signup_token(&first).await.unwrap_err().is_not_found());
        assert_eq!(
            tokens.create_user_with_token(&first, &pwd("pwd123"), "000000").await,
            Err(not_found())
        );
    }

    #[tokio::test]
    async fn redemption_survives_a_failed_index_cleanup() {
        let (tokens, users, store) = failing_tokens();
        let token = tokens.create_signup_token("frank").await.unwrap();
        let info = tokens.get_signup_token_info(&token).await.unwrap();
        let (otp, _) = Hotp::from_url(&info.otp_url).unwrap();
        let code = otp.code().unwrap();

        *store.prefix.lock().unwrap() = Some("signup/users/");
        let name = tokens
            .create_user_with_token(&token, &pwd("pwd123"), &code)
            .await
            .unwrap();
        assert_eq!(name, "frank");
        users.get_user("frank").await.unwrap();
        assert!(tokens.get_signup_token(&token).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unknown_token() {
        let (tokens, _) = tokens(DAY);
        assert!(tokens.get_signup_token("nope").await.unwrap_err().is_not_found());
        assert!(matches!(
            tokens.create_signup_token("no spaces").await,
            Err(Error::BadParameter(_))
        ));
    }
}
