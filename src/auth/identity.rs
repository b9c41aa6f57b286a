//! Who a connection is, and how it proved it.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of roles attached at authentication time. Never escalated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Host certificate holder.
    Node,
    /// Person authenticated by password + OTP or by a resumed web session.
    User,
    /// Holder of a valid, unconsumed signup token.
    Signup,
    /// Trusted in-process caller.
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Node => "node",
            Self::User => "user",
            Self::Signup => "signup",
            Self::Admin => "admin",
        })
    }
}

/// How an identity was established. Part of the authorization key: a
/// resumed web session is not equivalent to a fresh password login.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    Session,
    SignupToken,
    Certificate,
    Internal,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Password => "password",
            Self::Session => "session",
            Self::SignupToken => "signup_token",
            Self::Certificate => "certificate",
            Self::Internal => "internal",
        })
    }
}

/// Result of a successful authentication. Lives as long as its connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub principal: String,
    pub role: Role,
    pub method: AuthMethod,
}

impl Identity {
    #[must_use]
    pub fn new(principal: impl Into<String>, role: Role, method: AuthMethod) -> Self {
        Self {
            principal: principal.into(),
            role,
            method,
        }
    }

    /// Identity for trusted callers inside the process.
    #[must_use]
    pub fn admin(principal: impl Into<String>) -> Self {
        Self::new(principal, Role::Admin, AuthMethod::Internal)
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}/{})", self.principal, self.role, self.method)
    }
}

/// One credential presentation per authentication method.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Credential {
    Password {
        username: String,
        #[serde(with = "crate::secret::string")]
        password: SecretString,
        code: String,
    },
    Session {
        username: String,
        #[serde(with = "crate::secret::string")]
        session_id: SecretString,
    },
    SignupToken {
        #[serde(with = "crate::secret::string")]
        token: SecretString,
    },
    /// Host certificate plus a signature over the server's handshake nonce
    /// made with the certified key.
    HostCertificate { certificate: String, proof: String },
}

impl Credential {
    #[must_use]
    pub fn password(username: &str, password: &str, code: &str) -> Self {
        Self::Password {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
            code: code.to_string(),
        }
    }

    #[must_use]
    pub fn session(username: &str, session_id: &str) -> Self {
        Self::Session {
            username: username.to_string(),
            session_id: SecretString::from(session_id.to_string()),
        }
    }

    #[must_use]
    pub fn signup_token(token: &str) -> Self {
        Self::SignupToken {
            token: SecretString::from(token.to_string()),
        }
    }

    #[must_use]
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::Password { .. } => AuthMethod::Password,
            Self::Session { .. } => AuthMethod::Session,
            Self::SignupToken { .. } => AuthMethod::SignupToken,
            Self::HostCertificate { .. } => AuthMethod::Certificate,
        }
    }
}
