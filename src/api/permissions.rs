//! Permission tables for the role-gated API.
//!
//! A table maps `(Role, AuthMethod)` to the set of operations that identity
//! may call. Anything absent is denied.

use std::collections::{HashMap, HashSet};

use super::Operation;
use crate::auth::{AuthMethod, Identity, Role};
use crate::{Error, Result};

pub trait PermissionChecker: Send + Sync {
    /// # Errors
    /// Returns `PermissionDenied` when `identity` may not call `operation`.
    fn check(&self, identity: &Identity, operation: Operation) -> Result<()>;

    /// Whether user-scoped calls must name the caller's own principal.
    fn binds_principal(&self) -> bool {
        true
    }
}

fn denied(identity: &Identity, operation: Operation) -> Error {
    Error::PermissionDenied(format!(
        "{} authenticated by {} may not call {operation}",
        identity.role, identity.method
    ))
}

/// Data-driven table. `Admin` is always allowed.
#[derive(Clone, Debug, Default)]
pub struct StandardPermissions {
    table: HashMap<(Role, AuthMethod), HashSet<Operation>>,
}

impl StandardPermissions {
    /// Empty table: only `Admin` gets through.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The production table.
    #[must_use]
    pub fn new() -> Self {
        use Operation::{
            CreateUserWithToken, DeleteWebSession, GenerateKeyPair, GenerateUserCert,
            GetCertAuthority, GetServers, GetSignupTokenData, GetWebSession, SignIn, UpsertServer,
        };

        Self::empty()
            .allow(
                Role::User,
                AuthMethod::Password,
                &[
                    SignIn,
                    GenerateKeyPair,
                    GenerateUserCert,
                    GetCertAuthority,
                    UpsertServer,
                ],
            )
            .allow(
                Role::User,
                AuthMethod::Session,
                &[
                    GetWebSession,
                    DeleteWebSession,
                    GenerateKeyPair,
                    GenerateUserCert,
                    GetCertAuthority,
                ],
            )
            .allow(
                Role::Signup,
                AuthMethod::SignupToken,
                &[GetSignupTokenData, CreateUserWithToken],
            )
            .allow(
                Role::Node,
                AuthMethod::Certificate,
                &[UpsertServer, GetServers, GetCertAuthority, GenerateKeyPair],
            )
    }

    #[must_use]
    pub fn allow(mut self, role: Role, method: AuthMethod, operations: &[Operation]) -> Self {
        self.table
            .entry((role, method))
            .or_default()
            .extend(operations.iter().copied());
        self
    }

    #[must_use]
    pub fn deny(mut self, role: Role, method: AuthMethod, operation: Operation) -> Self {
        if let Some(allowed) = self.table.get_mut(&(role, method)) {
            allowed.remove(&operation);
        }
        self
    }

    #[must_use]
    pub fn is_allowed(&self, role: Role, method: AuthMethod, operation: Operation) -> bool {
        role == Role::Admin
            || self
                .table
                .get(&(role, method))
                .is_some_and(|allowed| allowed.contains(&operation))
    }
}

impl PermissionChecker for StandardPermissions {
    fn check(&self, identity: &Identity, operation: Operation) -> Result<()> {
        if self.is_allowed(identity.role, identity.method, operation) {
            Ok(())
        } else {
            Err(denied(identity, operation))
        }
    }
}

/// For trusted deployments and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllPermissions;

impl PermissionChecker for AllowAllPermissions {
    fn check(&self, _identity: &Identity, _operation: Operation) -> Result<()> {
        Ok(())
    }

    fn binds_principal(&self) -> bool {
        false
    }
}
