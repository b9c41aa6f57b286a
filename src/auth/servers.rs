//! Directory of nodes that announced themselves.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backend::{self, Backend};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub addr: String,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Clone)]
pub struct Servers {
    backend: Arc<dyn Backend>,
}

impl Servers {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Record or refresh `server`. A `ttl` lets stale announcements lapse.
    ///
    /// # Errors
    /// Returns `BadParameter` when the id is empty or contains `/`.
    pub async fn upsert_server(&self, server: &Server, ttl: Option<Duration>) -> Result<()> {
        if server.id.is_empty() || server.id.contains('/') {
            return Err(Error::bad_parameter(format!("invalid server id {:?}", server.id)));
        }
        debug!(id = %server.id, addr = %server.addr, "upsert server");
        self.backend
            .put(
                &backend::key(&["servers", &server.id]),
                &backend::encode(server)?,
                ttl,
            )
            .await
    }

    /// # Errors
    /// Returns `Storage` if the store cannot be listed.
    pub async fn get_servers(&self) -> Result<Vec<Server>> {
        self.backend
            .list("servers/")
            .await?
            .iter()
            .map(|item| backend::decode(&item.value))
            .collect()
    }
}
