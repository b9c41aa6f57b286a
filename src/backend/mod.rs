//! Keyed credential store.
//!
//! Everything the control plane persists (CA keys, password credentials,
//! signup tokens, web sessions, the server directory) goes through the
//! [`Backend`] trait. Implementations must make every single-key operation
//! atomic; check-then-act sequences above this layer rely on
//! [`Backend::compare_and_swap`] and [`Backend::compare_and_delete`].
//!
//! Expired items are invisible: reads, conditional updates and deletes all
//! behave as if the key were absent once its deadline has passed.

mod memory;
mod postgres;

pub use memory::MemoryBackend;
pub use postgres::PgBackend;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;

use crate::{Error, Result};

/// A stored value and the time it has left to live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Vec<u8>,
    pub ttl: Option<Duration>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Read a key. Fails with `NotFound` when absent or expired.
    async fn get(&self, key: &str) -> Result<Item>;

    /// Unconditionally write a key; `ttl` of `None` never expires.
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Replace the value only if it currently equals `expected`.
    ///
    /// `expected == None` means "create only if absent". Fails with
    /// `CompareFailed` when the current value differs.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Remove a key. Fails with `NotFound` when absent or expired.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove a key only if its value equals `expected`.
    ///
    /// Fails with `NotFound` when absent and `CompareFailed` when the value
    /// differs.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<()>;

    /// All live items whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<Item>>;
}

/// Join key segments with `/`.
#[must_use]
pub fn key(parts: &[&str]) -> String {
    parts.join("/")
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(Error::storage)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(Error::storage)
}
