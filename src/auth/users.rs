//! Password + HOTP credentials, one record per user.
//!
//! Verification is a read, a check and a conditional write of the advanced
//! counter. Two verifiers racing on the same code both read counter `n`, but
//! only one compare-and-swap from the observed bytes can land.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::utils;
use crate::backend::{self, Backend};
use crate::otp::Hotp;
use crate::{Error, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct UserRecord {
    name: String,
    password_hash: String,
    hotp: Hotp,
    created_at: DateTime<Utc>,
}

/// Public view of a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// What a user needs to enrol their authenticator app.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OtpEnrollment {
    pub url: String,
    #[serde(with = "crate::secret::string")]
    pub secret: SecretString,
}

fn user_key(name: &str) -> String {
    backend::key(&["users", name])
}

#[derive(Clone)]
pub struct Users {
    backend: Arc<dyn Backend>,
    otp_issuer: String,
}

impl Users {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, otp_issuer: impl Into<String>) -> Self {
        Self {
            backend,
            otp_issuer: otp_issuer.into(),
        }
    }

    async fn load(&self, name: &str) -> Result<(Vec<u8>, UserRecord)> {
        let item = self.backend.get(&user_key(name)).await?;
        let record = backend::decode(&item.value)?;
        Ok((item.value, record))
    }

    /// Set `name`'s password and enrol a fresh HOTP secret at counter zero.
    /// Replaces any previous credential.
    ///
    /// # Errors
    /// Returns `BadParameter` for an invalid username or empty password.
    #[instrument(skip(self, password))]
    pub async fn upsert_password(&self, name: &str, password: &SecretString) -> Result<OtpEnrollment> {
        let hotp = Hotp::generate()?;
        let enrollment = OtpEnrollment {
            url: hotp.url(&self.otp_issuer, name)?,
            secret: SecretString::from(hotp.secret_base32().to_string()),
        };
        self.store(name, password, hotp).await?;
        info!("password credential set for {name}");
        Ok(enrollment)
    }

    /// Write a credential with an already-provisioned HOTP state.
    pub(crate) async fn store(&self, name: &str, password: &SecretString, hotp: Hotp) -> Result<()> {
        utils::valid_username(name)?;
        if password.expose_secret().is_empty() {
            return Err(Error::bad_parameter("password is empty"));
        }
        let password_hash = utils::hash_password(password).await?;
        self.store_hashed(name, password_hash, hotp).await
    }

    /// Like [`Users::store`] with the Argon2 hash already computed, so the
    /// write itself never waits on the blocking pool.
    pub(crate) async fn store_hashed(
        &self,
        name: &str,
        password_hash: String,
        hotp: Hotp,
    ) -> Result<()> {
        utils::valid_username(name)?;
        let created_at = match self.load(name).await {
            Ok((_, existing)) => existing.created_at,
            Err(Error::NotFound(_)) => Utc::now(),
            Err(err) => return Err(err),
        };
        let record = UserRecord {
            name: name.to_string(),
            password_hash,
            hotp,
            created_at,
        };
        self.backend
            .put(&user_key(name), &backend::encode(&record)?, None)
            .await
    }

    /// Check password and the next HOTP code, consuming the code.
    ///
    /// # Errors
    /// Returns `InvalidCredentials` for any mismatch, an unknown user, or a
    /// code consumed concurrently. The counter only moves on success.
    #[instrument(skip(self, password, code))]
    pub async fn verify_password(&self, name: &str, password: &SecretString, code: &str) -> Result<()> {
        let (observed, mut record) = match self.load(name).await {
            Ok(found) => found,
            Err(Error::NotFound(_)) => return Err(Error::InvalidCredentials),
            Err(err) => return Err(err),
        };
        if !utils::verify_password(password, &record.password_hash).await? {
            debug!("password mismatch for {name}");
            return Err(Error::InvalidCredentials);
        }
        if !record.hotp.check(code) {
            debug!("otp mismatch for {name}");
            return Err(Error::InvalidCredentials);
        }
        record.hotp.advance();
        match self
            .backend
            .compare_and_swap(
                &user_key(name),
                Some(&observed),
                &backend::encode(&record)?,
                None,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::CompareFailed(_) | Error::NotFound(_)) => {
                debug!("otp for {name} was consumed concurrently");
                Err(Error::InvalidCredentials)
            }
            Err(err) => Err(err),
        }
    }

    /// Check the password alone. Leaves the HOTP counter untouched.
    ///
    /// # Errors
    /// Returns `InvalidCredentials` on mismatch or unknown user.
    pub async fn check_password(&self, name: &str, password: &SecretString) -> Result<()> {
        let (_, record) = match self.load(name).await {
            Ok(found) => found,
            Err(Error::NotFound(_)) => return Err(Error::InvalidCredentials),
            Err(err) => return Err(err),
        };
        if utils::verify_password(password, &record.password_hash).await? {
            Ok(())
        } else {
            Err(Error::InvalidCredentials)
        }
    }

    /// # Errors
    /// Returns `NotFound` if `name` has no credential.
    pub async fn get_user(&self, name: &str) -> Result<User> {
        let (_, record) = self.load(name).await?;
        Ok(User {
            name: record.name,
            created_at: record.created_at,
        })
    }

    /// Current HOTP state, for operators re-enrolling a device.
    pub(crate) async fn hotp(&self, name: &str) -> Result<Hotp> {
        Ok(self.load(name).await?.1.hotp)
    }

    /// # Errors
    /// Returns `Storage` if the store cannot be listed.
    pub async fn get_users(&self) -> Result<Vec<User>> {
        self.backend
            .list("users/")
            .await?
            .into_iter()
            .map(|item| {
                let record: UserRecord = backend::decode(&item.value)?;
                Ok(User {
                    name: record.name,
                    created_at: record.created_at,
                })
            })
            .collect()
    }

    /// Remove the credential. Sessions are cleaned up by the caller.
    ///
    /// # Errors
    /// Returns `NotFound` if `name` has no credential.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, name: &str) -> Result<()> {
        self.backend
            .delete(&user_key(name))
            .await
            .map_err(|err| match err {
                Error::NotFound(_) => Error::not_found(format!("user {name}")),
                other => other,
            })?;
        info!("deleted user {name}");
        Ok(())
    }
}
