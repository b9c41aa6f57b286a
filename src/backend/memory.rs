use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Backend, Item};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    deadline: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline.map_or(true, |deadline| deadline > now)
    }

    fn ttl(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(now))
    }
}

/// In-process store guarded by a single async mutex.
///
/// Used when no database is configured and by the test suites.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Reads already ignore them; this only frees memory.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Periodically purge expired entries until `shutdown` fires.
    pub fn spawn_reaper(&self, period: Duration, shutdown: CancellationToken) {
        let backend = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = backend.purge_expired().await;
                        if purged > 0 {
                            debug!("purged {purged} expired entries");
                        }
                    }
                }
            }
        });
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Item> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Item {
                key: key.to_string(),
                value: entry.value.clone(),
                ttl: entry.ttl(now),
            }),
            _ => Err(Error::not_found(key)),
        }
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                deadline: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let current = entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.as_slice());
        if current != expected {
            return Err(Error::CompareFailed(key.to_string()));
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                deadline: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(entry) if entry.is_live(now) => Ok(()),
            _ => Err(Error::not_found(key)),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                if entry.value != expected {
                    return Err(Error::CompareFailed(key.to_string()));
                }
                entries.remove(key);
                Ok(())
            }
            _ => Err(Error::not_found(key)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Item>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| Item {
                key: key.clone(),
                value: entry.value.clone(),
                ttl: entry.ttl(now),
            })
            .collect())
    }
}
