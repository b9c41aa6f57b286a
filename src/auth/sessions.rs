//! Web sessions: opaque ids bound to a user.
//!
//! Only the digest of an id reaches the store, under
//! `sessions/<user>/<digest>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use super::utils;
use crate::backend::{self, Backend};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSession {
    pub user: String,
    pub created_at: DateTime<Utc>,
}

fn session_key(user: &str, id: &str) -> String {
    backend::key(&["sessions", user, &utils::hash_token(id)])
}

fn not_found() -> Error {
    Error::not_found("web session")
}

#[derive(Clone)]
pub struct Sessions {
    backend: Arc<dyn Backend>,
    ttl: Option<Duration>,
}

impl Sessions {
    /// `ttl` of `None` keeps sessions until they are deleted.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, ttl: Option<Duration>) -> Self {
        Self { backend, ttl }
    }

    /// Create a session for `user` and return its id.
    ///
    /// # Errors
    /// Returns `BadParameter` for an invalid username.
    #[instrument(skip(self))]
    pub async fn create_session(&self, user: &str) -> Result<String> {
        utils::valid_username(user)?;
        let id = utils::generate_token()?;
        let session = WebSession {
            user: user.to_string(),
            created_at: Utc::now(),
        };
        self.backend
            .put(&session_key(user, &id), &backend::encode(&session)?, self.ttl)
            .await?;
        info!("created web session for {user}");
        Ok(id)
    }

    /// # Errors
    /// Returns `NotFound` if the session is unknown, deleted, expired or
    /// belongs to another user.
    pub async fn get_session(&self, user: &str, id: &str) -> Result<WebSession> {
        if utils::valid_username(user).is_err() {
            return Err(not_found());
        }
        let item = self
            .backend
            .get(&session_key(user, id))
            .await
            .map_err(|err| if err.is_not_found() { not_found() } else { err })?;
        backend::decode(&item.value)
    }

    /// # Errors
    /// Returns `NotFound` if there was no such session.
    #[instrument(skip(self, id))]
    pub async fn delete_session(&self, user: &str, id: &str) -> Result<()> {
        if utils::valid_username(user).is_err() {
            return Err(not_found());
        }
        self.backend
            .delete(&session_key(user, id))
            .await
            .map_err(|err| if err.is_not_found() { not_found() } else { err })
    }

    /// Drop every session of `user`; returns how many were removed.
    ///
    /// # Errors
    /// Returns `Storage` if the store fails.
    pub async fn delete_all(&self, user: &str) -> Result<usize> {
        let prefix = format!("{}/", backend::key(&["sessions", user]));
        let mut removed = 0;
        for item in self.backend.list(&prefix).await? {
            match self.backend.delete(&item.key).await {
                Ok(()) => removed += 1,
                Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }
}
