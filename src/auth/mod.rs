//! Authentication services: password + HOTP credentials, signup tokens, web
//! sessions, the server directory and the authenticator tying them to the
//! certificate authority.

mod authenticator;
mod config;
mod identity;
mod servers;
mod sessions;
mod signup;
mod users;
pub(crate) mod utils;

pub use authenticator::{Authenticated, Authenticator};
pub use config::AuthConfig;
pub use identity::{AuthMethod, Credential, Identity, Role};
pub use servers::{Server, Servers};
pub use sessions::{Sessions, WebSession};
pub use signup::{SignupTokenData, SignupTokenInfo, SignupTokens};
pub use users::{OtpEnrollment, User, Users};

use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::backend::Backend;
use crate::ca::{CaDomain, CertificateAuthority};
use crate::Result;

/// Every auth service over one shared backend.
#[derive(Clone)]
pub struct AuthServer {
    config: AuthConfig,
    ca: CertificateAuthority,
    users: Users,
    sessions: Sessions,
    signups: SignupTokens,
    servers: Servers,
    authenticator: Authenticator,
}

impl AuthServer {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: AuthConfig) -> Self {
        let ca = CertificateAuthority::new(backend.clone());
        let users = Users::new(backend.clone(), config.otp_issuer());
        let sessions = Sessions::new(backend.clone(), config.session_ttl());
        let signups = SignupTokens::new(
            backend.clone(),
            users.clone(),
            config.otp_issuer(),
            config.signup_token_ttl(),
            config.signup_user_actions_ttl(),
        );
        let servers = Servers::new(backend);
        let authenticator =
            Authenticator::new(ca.clone(), users.clone(), sessions.clone(), signups.clone());
        Self {
            config,
            ca,
            users,
            sessions,
            signups,
            servers,
            authenticator,
        }
    }

    /// Reset whichever certificate authority has never been initialized.
    ///
    /// # Errors
    /// Returns `Storage` if a new key cannot be persisted.
    pub async fn ensure_authorities(&self) -> Result<()> {
        for domain in [CaDomain::Host, CaDomain::User] {
            if !self.ca.is_initialized(domain).await {
                self.ca.reset(domain).await?;
            }
        }
        Ok(())
    }

    /// Check the password only and open a new web session.
    ///
    /// # Errors
    /// Returns `InvalidCredentials` on a wrong password or unknown user.
    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, username: &str, password: &SecretString) -> Result<String> {
        self.users.check_password(username, password).await?;
        self.sessions.create_session(username).await
    }

    /// Remove the credential and every web session of `username`.
    ///
    /// # Errors
    /// Returns `NotFound` if the user does not exist.
    pub async fn delete_user(&self, username: &str) -> Result<()> {
        self.users.delete_user(username).await?;
        let sessions = self.sessions.delete_all(username).await?;
        info!("removed {sessions} web sessions of {username}");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    #[must_use]
    pub fn users(&self) -> &Users {
        &self.users
    }

    #[must_use]
    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    #[must_use]
    pub fn signups(&self) -> &SignupTokens {
        &self.signups
    }

    #[must_use]
    pub fn servers(&self) -> &Servers {
        &self.servers
    }

    #[must_use]
    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }
}
