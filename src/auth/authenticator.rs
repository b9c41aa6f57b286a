//! Turns a presented credential into an [`Identity`].
//!
//! Every failure leaves the caller with the same `AuthenticationFailed`; the
//! reason is only logged.

use secrecy::ExposeSecret;
use tracing::{debug, instrument};

use super::identity::{AuthMethod, Credential, Identity, Role};
use super::sessions::Sessions;
use super::signup::SignupTokens;
use super::users::Users;
use crate::ca::{self, CertificateAuthority};
use crate::{Error, Result};

/// Identity plus what the handshake hands back to the client.
#[derive(Clone, Debug)]
pub struct Authenticated {
    pub identity: Identity,
    /// Set when a password login opened a new web session.
    pub session_id: Option<String>,
}

impl Authenticated {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            session_id: None,
        }
    }
}

#[derive(Clone)]
pub struct Authenticator {
    ca: CertificateAuthority,
    users: Users,
    sessions: Sessions,
    signups: SignupTokens,
}

impl Authenticator {
    #[must_use]
    pub fn new(
        ca: CertificateAuthority,
        users: Users,
        sessions: Sessions,
        signups: SignupTokens,
    ) -> Self {
        Self {
            ca,
            users,
            sessions,
            signups,
        }
    }

    /// Check `credential`. Certificate holders must have signed `challenge`,
    /// which is unique to the connection.
    ///
    /// # Errors
    /// Returns `AuthenticationFailed` for every rejected credential.
    #[instrument(skip_all, fields(method = %credential.method()))]
    pub async fn authenticate(
        &self,
        credential: &Credential,
        challenge: &[u8],
    ) -> Result<Authenticated> {
        self.check(credential, challenge).await.map_err(|err| {
            debug!("authentication rejected: {err}");
            Error::AuthenticationFailed
        })
    }

    async fn check(&self, credential: &Credential, challenge: &[u8]) -> Result<Authenticated> {
        match credential {
            Credential::Password {
                username,
                password,
                code,
            } => {
                self.users.verify_password(username, password, code).await?;
                let session_id = self.sessions.create_session(username).await?;
                Ok(Authenticated {
                    identity: Identity::new(username.clone(), Role::User, AuthMethod::Password),
                    session_id: Some(session_id),
                })
            }
            Credential::Session {
                username,
                session_id,
            } => {
                let session = self
                    .sessions
                    .get_session(username, session_id.expose_secret())
                    .await?;
                Ok(Authenticated::new(Identity::new(
                    session.user,
                    Role::User,
                    AuthMethod::Session,
                )))
            }
            Credential::SignupToken { token } => {
                let (data, _) = self.signups.get_signup_token(token.expose_secret()).await?;
                Ok(Authenticated::new(Identity::new(
                    data.username,
                    Role::Signup,
                    AuthMethod::SignupToken,
                )))
            }
            Credential::HostCertificate { certificate, proof } => {
                let cert = self.ca.verify_host_certificate(certificate).await?;
                ca::verify_proof(&cert, challenge, proof)?;
                let body = cert.body();
                if !matches!(body.role, Role::Node | Role::Admin) {
                    return Err(Error::PermissionDenied(format!(
                        "host certificates cannot carry role {}",
                        body.role
                    )));
                }
                Ok(Authenticated::new(Identity::new(
                    body.principal.clone(),
                    body.role,
                    AuthMethod::Certificate,
                )))
            }
        }
    }
}
