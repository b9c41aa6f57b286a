//! The remote call surface and the gate in front of it.
//!
//! Every [`Call`] is checked against the caller's [`Identity`] by a pluggable
//! [`PermissionChecker`] before it reaches the auth services. A denied call
//! has no side effect.

mod permissions;

pub use permissions::{AllowAllPermissions, PermissionChecker, StandardPermissions};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::auth::{AuthServer, Identity, OtpEnrollment, Role, Server, SignupTokenInfo, User};
use crate::ca::{CaDomain, KeyPair};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    GenerateKeyPair,
    GenerateHostCert,
    GenerateUserCert,
    ResetHostCa,
    ResetUserCa,
    GetCertAuthority,
    UpsertPassword,
    CreateSignupToken,
    GetSignupTokenData,
    CreateUserWithToken,
    GetUsers,
    DeleteUser,
    SignIn,
    GetWebSession,
    DeleteWebSession,
    GetServers,
    UpsertServer,
}

impl Operation {
    pub const ALL: [Self; 17] = [
        Self::GenerateKeyPair,
        Self::GenerateHostCert,
        Self::GenerateUserCert,
        Self::ResetHostCa,
        Self::ResetUserCa,
        Self::GetCertAuthority,
        Self::UpsertPassword,
        Self::CreateSignupToken,
        Self::GetSignupTokenData,
        Self::CreateUserWithToken,
        Self::GetUsers,
        Self::DeleteUser,
        Self::SignIn,
        Self::GetWebSession,
        Self::DeleteWebSession,
        Self::GetServers,
        Self::UpsertServer,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One remote call with its arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    GenerateKeyPair,
    GenerateHostCert {
        public_key: String,
        node_name: String,
        hostname: String,
        role: Role,
        /// Zero means no expiry.
        ttl: Duration,
    },
    GenerateUserCert {
        public_key: String,
        username: String,
        ttl: Duration,
    },
    ResetHostCa,
    ResetUserCa,
    GetCertAuthority {
        domain: CaDomain,
    },
    UpsertPassword {
        username: String,
        #[serde(with = "crate::secret::string")]
        password: SecretString,
    },
    CreateSignupToken {
        username: String,
    },
    GetSignupTokenData {
        #[serde(with = "crate::secret::string")]
        token: SecretString,
    },
    CreateUserWithToken {
        #[serde(with = "crate::secret::string")]
        token: SecretString,
        #[serde(with = "crate::secret::string")]
        password: SecretString,
        code: String,
    },
    GetUsers,
    DeleteUser {
        username: String,
    },
    SignIn {
        username: String,
        #[serde(with = "crate::secret::string")]
        password: SecretString,
    },
    GetWebSession {
        username: String,
        #[serde(with = "crate::secret::string")]
        session_id: SecretString,
    },
    DeleteWebSession {
        username: String,
        #[serde(with = "crate::secret::string")]
        session_id: SecretString,
    },
    GetServers,
    UpsertServer {
        server: Server,
        #[serde(default)]
        ttl: Option<Duration>,
    },
}

impl Call {
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::GenerateKeyPair => Operation::GenerateKeyPair,
            Self::GenerateHostCert { .. } => Operation::GenerateHostCert,
            Self::GenerateUserCert { .. } => Operation::GenerateUserCert,
            Self::ResetHostCa => Operation::ResetHostCa,
            Self::ResetUserCa => Operation::ResetUserCa,
            Self::GetCertAuthority { .. } => Operation::GetCertAuthority,
            Self::UpsertPassword { .. } => Operation::UpsertPassword,
            Self::CreateSignupToken { .. } => Operation::CreateSignupToken,
            Self::GetSignupTokenData { .. } => Operation::GetSignupTokenData,
            Self::CreateUserWithToken { .. } => Operation::CreateUserWithToken,
            Self::GetUsers => Operation::GetUsers,
            Self::DeleteUser { .. } => Operation::DeleteUser,
            Self::SignIn { .. } => Operation::SignIn,
            Self::GetWebSession { .. } => Operation::GetWebSession,
            Self::DeleteWebSession { .. } => Operation::DeleteWebSession,
            Self::GetServers => Operation::GetServers,
            Self::UpsertServer { .. } => Operation::UpsertServer,
        }
    }

    /// The user a call acts on behalf of, when it is scoped to one.
    fn target_user(&self) -> Option<&str> {
        match self {
            Self::GenerateUserCert { username, .. }
            | Self::SignIn { username, .. }
            | Self::GetWebSession { username, .. }
            | Self::DeleteWebSession { username, .. } => Some(username),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Done,
    KeyPair(KeyPair),
    Certificate(String),
    PublicKey(String),
    OtpEnrollment(OtpEnrollment),
    SignupToken(String),
    SignupTokenData(SignupTokenInfo),
    Username(String),
    Users(Vec<User>),
    SessionId(String),
    Servers(Vec<Server>),
}

/// The auth services behind a permission check.
#[derive(Clone)]
pub struct RoleGatedApi {
    auth: AuthServer,
    permissions: Arc<dyn PermissionChecker>,
}

impl RoleGatedApi {
    #[must_use]
    pub fn new(auth: AuthServer, permissions: Arc<dyn PermissionChecker>) -> Self {
        Self { auth, permissions }
    }

    #[must_use]
    pub fn auth(&self) -> &AuthServer {
        &self.auth
    }

    /// Check and execute `call` as `identity`. `Expired` leaves as `NotFound`.
    ///
    /// # Errors
    /// Returns `PermissionDenied` when the caller may not make this call, or
    /// whatever the underlying operation fails with.
    #[instrument(skip_all, fields(principal = %identity.principal, op = %call.operation()))]
    pub async fn call(&self, identity: &Identity, call: Call) -> Result<Reply> {
        let result = match self.authorize(identity, &call) {
            Ok(()) => self.dispatch(call).await,
            Err(err) => {
                debug!("denied: {err}");
                Err(err)
            }
        };
        result.map_err(Error::at_boundary)
    }

    fn authorize(&self, identity: &Identity, call: &Call) -> Result<()> {
        self.permissions.check(identity, call.operation())?;
        if self.permissions.binds_principal() && !identity.is_admin() {
            if let Some(user) = call.target_user() {
                if user != identity.principal {
                    return Err(Error::PermissionDenied(format!(
                        "{} may not act on behalf of {user}",
                        identity.principal
                    )));
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, call: Call) -> Result<Reply> {
        let auth = &self.auth;
        let reply = match call {
            Call::GenerateKeyPair => Reply::KeyPair(auth.ca().generate_key_pair()),
            Call::GenerateHostCert {
                public_key,
                node_name,
                hostname,
                role,
                ttl,
            } => Reply::Certificate(
                auth.ca()
                    .issue_host_certificate(&public_key, &node_name, &hostname, role, ttl)
                    .await?,
            ),
            Call::GenerateUserCert {
                public_key,
                username,
                ttl,
            } => Reply::Certificate(
                auth.ca()
                    .issue_user_certificate(&public_key, &username, ttl)
                    .await?,
            ),
            Call::ResetHostCa => Reply::PublicKey(auth.ca().reset(CaDomain::Host).await?),
            Call::ResetUserCa => Reply::PublicKey(auth.ca().reset(CaDomain::User).await?),
            Call::GetCertAuthority { domain } => {
                Reply::PublicKey(auth.ca().public_key(domain).await?)
            }
            Call::UpsertPassword { username, password } => Reply::OtpEnrollment(
                auth.users().upsert_password(&username, &password).await?,
            ),
            Call::CreateSignupToken { username } => {
                Reply::SignupToken(auth.signups().create_signup_token(&username).await?)
            }
            Call::GetSignupTokenData { token } => Reply::SignupTokenData(
                auth.signups()
                    .get_signup_token_info(token.expose_secret())
                    .await?,
            ),
            Call::CreateUserWithToken {
                token,
                password,
                code,
            } => Reply::Username(
                auth.signups()
                    .create_user_with_token(token.expose_secret(), &password, &code)
                    .await?,
            ),
            Call::GetUsers => Reply::Users(auth.users().get_users().await?),
            Call::DeleteUser { username } => {
                auth.delete_user(&username).await?;
                Reply::Done
            }
            Call::SignIn { username, password } => {
                Reply::SessionId(auth.sign_in(&username, &password).await?)
            }
            Call::GetWebSession {
                username,
                session_id,
            } => {
                let id = session_id.expose_secret();
                auth.sessions().get_session(&username, id).await?;
                Reply::SessionId(id.to_string())
            }
            Call::DeleteWebSession {
                username,
                session_id,
            } => {
                auth.sessions()
                    .delete_session(&username, session_id.expose_secret())
                    .await?;
                Reply::Done
            }
            Call::GetServers => Reply::Servers(auth.servers().get_servers().await?),
            Call::UpsertServer { server, ttl } => {
                let ttl = ttl.or(auth.config().server_ttl());
                auth.servers().upsert_server(&server, ttl).await?;
                Reply::Done
            }
        };
        Ok(reply)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, AuthMethod};
    use crate::backend::MemoryBackend;

    async fn api() -> RoleGatedApi {
        let auth = AuthServer::new(Arc::new(MemoryBackend::new()), AuthConfig::default());
        auth.ensure_authorities().await.unwrap();
        RoleGatedApi::new(auth, Arc::new(StandardPermissions::new()))
    }

    fn server(id: &str) -> Server {
        Server {
            id: id.to_string(),
            addr: "127.0.0.1:3022".to_string(),
            hostname: id.to_string(),
        }
    }

    #[test]
    fn every_operation_has_a_distinct_name() {
        let names: std::collections::HashSet<String> =
            Operation::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(names.len(), Operation::ALL.len());
    }

    #[test]
    fn call_wire_shape() {
        let call = Call::CreateSignupToken {
            username: "alice".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&call).unwrap(),
            r#"{"op":"create_signup_token","username":"alice"}"#
        );
    }

    #[tokio::test]
    async fn denied_calls_have_no_effect() {
        let api = api().await;
        let node = Identity::new("node1", Role::Node, AuthMethod::Certificate);
        let before = api.auth().ca().public_key(CaDomain::Host).await.unwrap();
        assert!(matches!(
            api.call(&node, Call::ResetHostCa).await,
            Err(Error::PermissionDenied(_))
        ));
        assert_eq!(
            api.auth().ca().public_key(CaDomain::Host).await.unwrap(),
            before
        );

        api.call(&node, Call::UpsertServer { server: server("n1"), ttl: None })
            .await
            .unwrap();
        match api.call(&node, Call::GetServers).await.unwrap() {
            Reply::Servers(list) => assert_eq!(list, vec![server("n1")]),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_scoped_calls_are_bound_to_the_caller() {
        let api = api().await;
        let admin = Identity::admin("root");
        let password = SecretString::from("pwd123");
        for name in ["alice", "bob"] {
            api.call(
                &admin,
                Call::UpsertPassword {
                    username: name.to_string(),
                    password: password.clone(),
                },
            )
            .await
            .unwrap();
        }

        let alice = Identity::new("alice", Role::User, AuthMethod::Password);
        assert!(matches!(
            api.call(
                &alice,
                Call::SignIn {
                    username: "bob".to_string(),
                    password: password.clone()
                }
            )
            .await,
            Err(Error::PermissionDenied(_))
        ));
        let Reply::SessionId(id) = api
            .call(
                &alice,
                Call::SignIn {
                    username: "alice".to_string(),
                    password: password.clone(),
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected a session id");
        };

        let resumed = Identity::new("alice", Role::User, AuthMethod::Session);
        let Reply::SessionId(same) = api
            .call(
                &resumed,
                Call::GetWebSession {
                    username: "alice".to_string(),
                    session_id: SecretString::from(id.clone()),
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected a session id");
        };
        assert_eq!(same, id);

        // Admin acts for anyone, allow-all skips principal binding.
        api.call(&admin, Call::DeleteUser { username: "bob".to_string() })
            .await
            .unwrap();
        let open = RoleGatedApi::new(api.auth().clone(), Arc::new(AllowAllPermissions));
        open.call(
            &alice,
            Call::GetWebSession {
                username: "alice".to_string(),
                session_id: SecretString::from(id),
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn missing_token_and_uninitialized_ca() {
        let auth = AuthServer::new(
            Arc::new(MemoryBackend::new()),
            AuthConfig::default(),
        );
        let api = RoleGatedApi::new(auth, Arc::new(AllowAllPermissions));
        let err = api
            .call(
                &Identity::admin("root"),
                Call::GetSignupTokenData {
                    token: SecretString::from("missing"),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            api.call(
                &Identity::admin("root"),
                Call::GetCertAuthority { domain: CaDomain::User }
            )
            .await,
            Err(Error::NotInitialized(CaDomain::User))
        ));
    }
}
