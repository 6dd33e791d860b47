//! Write-back of cached grids to durable storage.
//!
//! Runs when a file loses its last editor. The cached grid is serialized to
//! row-major text and written through the [`DurableStore`], retrying with
//! exponential backoff. The cache entry is evicted only after a successful
//! write, and only if nobody changed it while the write was in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::cache::{CacheError, DocumentCache};
use crate::grid;
use crate::store::{self, DurableStore, StoreError};

/// Retry behavior for flushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Write attempts before giving up (at least one is always made)
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further failure
    pub initial_backoff: Duration,
    /// Drop the cached grid even when every attempt failed
    pub evict_on_failure: bool,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            evict_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing cached for the file.
    NotCached,
    /// Another flush of the same file is in progress.
    AlreadyRunning,
    Flushed {
        location: String,
        attempts: u32,
        /// `false` when the grid changed during the write and stays cached.
        evicted: bool,
    },
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("flush of {file_id} failed after {attempts} attempts: {source}")]
    Store {
        file_id: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

pub struct Reconciler {
    cache: Arc<DocumentCache>,
    store: Arc<dyn DurableStore>,
    policy: FlushPolicy,
    in_flight: Mutex<HashSet<String>>,
}

/// Marks a file as being flushed until dropped.
struct InFlight<'a> {
    files: &'a Mutex<HashSet<String>>,
    file_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.file_id);
    }
}

impl Reconciler {
    pub fn new(
        cache: Arc<DocumentCache>,
        store: Arc<dyn DurableStore>,
        policy: FlushPolicy,
    ) -> Self {
        Self {
            cache,
            store,
            policy,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> &FlushPolicy {
        &self.policy
    }

    fn claim(&self, file_id: &str) -> Option<InFlight<'_>> {
        let mut files = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        files.insert(file_id.to_string()).then(|| InFlight {
            files: &self.in_flight,
            file_id: file_id.to_string(),
        })
    }

    /// Flush the cached grid of `file_id` and evict it.
    pub async fn reconcile(&self, file_id: &str) -> Result<FlushOutcome, FlushError> {
        let Some(_claim) = self.claim(file_id) else {
            log::debug!("Flush of {file_id} already running");
            return Ok(FlushOutcome::AlreadyRunning);
        };
        let Some((snapshot, matrix)) = self.cache.snapshot(file_id).await? else {
            return Ok(FlushOutcome::NotCached);
        };

        let text = grid::to_text(&matrix);
        let owner = store::owner_of(file_id);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 1;

        let location = loop {
            match self.store.write_file(owner, file_id, text.as_bytes()).await {
                Ok(location) => break location,
                Err(source) if attempt >= max_attempts => {
                    log::error!("Giving up on flush of {file_id} after {attempt} attempts: {source}");
                    if self.policy.evict_on_failure {
                        self.cache.evict(file_id).await;
                        log::error!("Evicted {file_id} without a durable copy");
                    }
                    return Err(FlushError::Store {
                        file_id: file_id.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    log::warn!("Flush attempt {attempt} for {file_id} failed: {e}, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
            }
        };

        if let Err(e) = self.store.touch_modified(file_id, owner).await {
            log::warn!("Could not update modification time of {file_id}: {e}");
        }

        let evicted = self.cache.evict_if_unchanged(file_id, &snapshot).await;
        if evicted {
            log::info!("Flushed {file_id} to {location} ({} rows) and evicted", matrix.len());
        } else {
            log::info!("Flushed {file_id} to {location}; it changed during the write and stays cached");
        }

        Ok(FlushOutcome::Flushed {
            location,
            attempts: attempt,
            evicted,
        })
    }
}
