//! Host and user certificate authorities.
//!
//! Each domain has at most one active Ed25519 signing key, stored as a single
//! record so a reset is observed either fully or not at all by concurrent
//! issuers. Resetting a domain revokes every certificate it signed before:
//! their signatures no longer match the active public key.

mod cert;
mod keys;

pub use cert::{Certificate, CertificateBody};
pub use keys::KeyPair;

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::auth::Role;
use crate::backend::{self, Backend};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaDomain {
    Host,
    User,
}

impl CaDomain {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::User => "user",
        }
    }
}

impl fmt::Display for CaDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize)]
struct AuthorityRecord {
    #[serde(with = "crate::secret::string")]
    private_key: SecretString,
    public_key: String,
    created_at: DateTime<Utc>,
}

fn authority_key(domain: CaDomain) -> String {
    backend::key(&["authorities", domain.as_str()])
}

#[derive(Clone)]
pub struct CertificateAuthority {
    backend: Arc<dyn Backend>,
}

impl CertificateAuthority {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Generate a fresh signing key for `domain`, discarding the previous one.
    ///
    /// Returns the new public key.
    ///
    /// # Errors
    /// Returns `Storage` if the key cannot be persisted.
    #[instrument(skip(self))]
    pub async fn reset(&self, domain: CaDomain) -> Result<String> {
        let pair = KeyPair::generate();
        let record = AuthorityRecord {
            private_key: pair.private_key,
            public_key: pair.public_key.clone(),
            created_at: Utc::now(),
        };
        self.backend
            .put(&authority_key(domain), &backend::encode(&record)?, None)
            .await?;
        info!("reset {domain} certificate authority");
        Ok(pair.public_key)
    }

    /// Produce a keypair for a future certificate holder. Does not touch CA state.
    #[must_use]
    pub fn generate_key_pair(&self) -> KeyPair {
        KeyPair::generate()
    }

    async fn load(&self, domain: CaDomain) -> Result<AuthorityRecord> {
        match self.backend.get(&authority_key(domain)).await {
            Ok(item) => backend::decode(&item.value),
            Err(Error::NotFound(_)) => Err(Error::NotInitialized(domain)),
            Err(err) => Err(err),
        }
    }

    async fn signing_key(&self, domain: CaDomain) -> Result<SigningKey> {
        let record = self.load(domain).await?;
        keys::signing_key(record.private_key.expose_secret())
    }

    /// Active public key of `domain`, encoded.
    ///
    /// # Errors
    /// Returns `NotInitialized` before the first reset of `domain`.
    pub async fn public_key(&self, domain: CaDomain) -> Result<String> {
        Ok(self.load(domain).await?.public_key)
    }

    async fn verifying_key(&self, domain: CaDomain) -> Result<VerifyingKey> {
        keys::verifying_key(&self.public_key(domain).await?)
    }

    pub async fn is_initialized(&self, domain: CaDomain) -> bool {
        self.load(domain).await.is_ok()
    }

    async fn issue(
        &self,
        domain: CaDomain,
        public_key: &str,
        principal: &str,
        hostname: Option<&str>,
        role: Role,
        ttl: Duration,
    ) -> Result<String> {
        keys::verifying_key(public_key)?;
        if principal.is_empty() {
            return Err(Error::bad_parameter("certificate principal is empty"));
        }
        // One read of the CA record: a concurrent reset is seen in full or not at all.
        let ca_key = self.signing_key(domain).await?;

        let now = Utc::now();
        let valid_before = if ttl.is_zero() {
            None
        } else {
            let ttl = chrono::Duration::from_std(ttl)
                .map_err(|_| Error::bad_parameter("certificate ttl out of range"))?;
            Some(now + ttl)
        };
        let body = CertificateBody {
            serial: Uuid::new_v4(),
            domain,
            public_key: public_key.to_string(),
            principal: principal.to_string(),
            hostname: hostname.map(ToString::to_string),
            role,
            valid_after: now,
            valid_before,
        };
        Ok(Certificate::sign(body, &ca_key)?.to_string())
    }

    /// Sign a host certificate for `(node_name, hostname, role)`.
    /// A zero `ttl` produces a certificate that never expires.
    ///
    /// `role` is not restricted: a host certificate may carry `Role::Admin`,
    /// so whoever may call this can mint administrator identities.
    ///
    /// # Errors
    /// Returns `NotInitialized` if the host CA was never reset.
    #[instrument(skip(self, public_key))]
    pub async fn issue_host_certificate(
        &self,
        public_key: &str,
        node_name: &str,
        hostname: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<String> {
        self.issue(
            CaDomain::Host,
            public_key,
            node_name,
            Some(hostname),
            role,
            ttl,
        )
        .await
    }

    /// Sign a user certificate for `username`.
    ///
    /// # Errors
    /// Returns `NotInitialized` if the user CA was never reset.
    #[instrument(skip(self, public_key))]
    pub async fn issue_user_certificate(
        &self,
        public_key: &str,
        username: &str,
        ttl: Duration,
    ) -> Result<String> {
        self.issue(CaDomain::User, public_key, username, None, Role::User, ttl)
            .await
    }

    /// Parse `encoded` and check it against the *current* key of `domain`.
    ///
    /// # Errors
    /// Returns `InvalidCredentials` if it was signed by another (or a reset)
    /// key, `Expired` outside its validity window.
    pub async fn verify_certificate(&self, domain: CaDomain, encoded: &str) -> Result<Certificate> {
        let cert = Certificate::parse(encoded)?;
        if cert.body().domain != domain {
            return Err(Error::InvalidCredentials);
        }
        cert.verify(&self.verifying_key(domain).await?, Utc::now())?;
        Ok(cert)
    }

    /// # Errors
    /// See [`CertificateAuthority::verify_certificate`].
    pub async fn verify_host_certificate(&self, encoded: &str) -> Result<Certificate> {
        self.verify_certificate(CaDomain::Host, encoded).await
    }
}

/// Private key and certificate a tunnel server uses to prove its identity.
#[derive(Clone)]
pub struct HostSigner {
    key: SigningKey,
    certificate: String,
}

impl HostSigner {
    /// # Errors
    /// Returns `BadParameter` if the key is malformed or does not match the
    /// certificate.
    pub fn new(pair: &KeyPair, certificate: &str) -> Result<Self> {
        let key = pair.signing_key()?;
        let cert = Certificate::parse(certificate)?;
        if cert.subject_key()? != key.verifying_key() {
            return Err(Error::bad_parameter(
                "host certificate does not match the private key",
            ));
        }
        Ok(Self {
            key,
            certificate: certificate.to_string(),
        })
    }

    #[must_use]
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> String {
        keys::sign(&self.key, message)
    }
}

impl fmt::Debug for HostSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSigner")
            .field("key", &"***")
            .field("certificate", &self.certificate)
            .finish()
    }
}

/// Check a signature made with the key a certificate certifies.
///
/// # Errors
/// Returns `InvalidCredentials` if the signature does not verify.
pub fn verify_proof(cert: &Certificate, message: &[u8], proof: &str) -> Result<()> {
    keys::verify(&cert.subject_key()?, message, proof)
}

/// Sign `message` with an encoded private key (the client half of
/// [`verify_proof`]).
///
/// # Errors
/// Returns `BadParameter` if the key is malformed.
pub fn sign_proof(pair: &KeyPair, message: &[u8]) -> Result<String> {
    Ok(keys::sign(&pair.signing_key()?, message))
}

/// Check a certificate against a pinned authority key instead of the store.
///
/// # Errors
/// Returns `BadParameter` for a malformed key, `InvalidCredentials` or
/// `Expired` like [`CertificateAuthority::verify_certificate`].
pub fn verify_with_authority(
    domain: CaDomain,
    encoded: &str,
    authority_public_key: &str,
) -> Result<Certificate> {
    let cert = Certificate::parse(encoded)?;
    if cert.body().domain != domain {
        return Err(Error::InvalidCredentials);
    }
    cert.verify(&keys::verifying_key(authority_public_key)?, Utc::now())?;
    Ok(cert)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn authority() -> CertificateAuthority {
        CertificateAuthority::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn issuing_before_reset_fails() {
        let ca = authority();
        let pair = ca.generate_key_pair();
        let err = ca
            .issue_host_certificate(&pair.public_key, "n", "n", Role::Node, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err, Error::NotInitialized(CaDomain::Host));

        ca.reset(CaDomain::Host).await.unwrap();
        let err = ca
            .issue_user_certificate(&pair.public_key, "alice", Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err, Error::NotInitialized(CaDomain::User));
    }

    #[tokio::test]
    async fn reset_revokes_previous_certificates() {
        let ca = authority();
        ca.reset(CaDomain::Host).await.unwrap();
        let pair = ca.generate_key_pair();
        let cert = ca
            .issue_host_certificate(
                &pair.public_key,
                "localhost",
                "localhost",
                Role::Node,
                Duration::ZERO,
            )
            .await
            .unwrap();

        let verified = ca.verify_host_certificate(&cert).await.unwrap();
        assert_eq!(verified.body().principal, "localhost");
        assert_eq!(verified.body().valid_before, None);

        ca.reset(CaDomain::Host).await.unwrap();
        assert_eq!(
            ca.verify_host_certificate(&cert).await.unwrap_err(),
            Error::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn user_certificate_is_not_a_host_certificate() {
        let ca = authority();
        ca.reset(CaDomain::Host).await.unwrap();
        ca.reset(CaDomain::User).await.unwrap();
        let pair = ca.generate_key_pair();
        let cert = ca
            .issue_user_certificate(&pair.public_key, "alice", Duration::from_secs(60))
            .await
            .unwrap();
        let verified = ca.verify_certificate(CaDomain::User, &cert).await.unwrap();
        assert_eq!(verified.body().role, Role::User);
        assert!(verified.body().valid_before.is_some());
        assert_eq!(
            ca.verify_host_certificate(&cert).await.unwrap_err(),
            Error::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn host_signer_requires_matching_key() {
        let ca = authority();
        ca.reset(CaDomain::Host).await.unwrap();
        let pair = ca.generate_key_pair();
        let cert = ca
            .issue_host_certificate(&pair.public_key, "a", "a", Role::Node, Duration::ZERO)
            .await
            .unwrap();

        let signer = HostSigner::new(&pair, &cert).unwrap();
        let parsed = Certificate::parse(signer.certificate()).unwrap();
        let proof = signer.sign(b"nonce");
        assert!(verify_proof(&parsed, b"nonce", &proof).is_ok());

        let other = ca.generate_key_pair();
        assert!(matches!(
            HostSigner::new(&other, &cert),
            Err(Error::BadParameter(_))
        ));
    }

    #[tokio::test]
    async fn issuing_rejects_malformed_public_key() {
        let ca = authority();
        ca.reset(CaDomain::User).await.unwrap();
        let err = ca
            .issue_user_certificate("not-a-key", "alice", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
    }

    #[tokio::test]
    async fn pinned_authority_check() {
        let ca = authority();
        let authority_key = ca.reset(CaDomain::Host).await.unwrap();
        let pair = ca.generate_key_pair();
        let cert = ca
            .issue_host_certificate(&pair.public_key, "a", "a", Role::Node, Duration::ZERO)
            .await
            .unwrap();
        assert!(verify_with_authority(CaDomain::Host, &cert, &authority_key).is_ok());
        assert_eq!(
            verify_with_authority(CaDomain::Host, &cert, &pair.public_key).unwrap_err(),
            Error::InvalidCredentials
        );
        assert!(verify_with_authority(CaDomain::User, &cert, &authority_key).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resets_never_yield_a_mixed_key() {
        let ca = authority();
        let mut keys = vec![ca.reset(CaDomain::Host).await.unwrap()];
        let pair = ca.generate_key_pair();

        let mut resets = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let ca = ca.clone();
            resets.spawn(async move { ca.reset(CaDomain::Host).await });
        }
        let mut issues = tokio::task::JoinSet::new();
        for i in 0..16 {
            let ca = ca.clone();
            let public_key = pair.public_key.clone();
            issues.spawn(async move {
                let name = format!("node-{i}");
                ca.issue_host_certificate(&public_key, &name, &name, Role::Node, Duration::ZERO)
                    .await
            });
        }

        while let Some(key) = resets.join_next().await {
            keys.push(key.unwrap().unwrap());
        }
        let mut certs = Vec::new();
        while let Some(cert) = issues.join_next().await {
            certs.push(cert.unwrap().unwrap());
        }

        for cert in &certs {
            let signers = keys
                .iter()
                .filter(|key| verify_with_authority(CaDomain::Host, cert, key).is_ok())
                .count();
            assert_eq!(signers, 1, "{cert}");
        }
    }
}
