//! Signal deduplication ledger.
//!
//! An equivalent signal (same ticker, direction and trading date) must not
//! be emitted twice within the ledger TTL, even across pipeline runs. The
//! ledger maps a fixed-length fingerprint to the time it was recorded and
//! is persisted as `{ "<hash>": { "recordedAt": ... } }`.
//!
//! Call [`SignalDeduplicator::is_duplicate`] right before a signal consumes
//! risk budget, and [`SignalDeduplicator::record`] only after it has been
//! accepted. Recording earlier would mark a rejected candidate as seen.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::config::DedupConfig;
use crate::errors::ResilienceError;
use crate::storage::write_atomic;

/// Computes the fingerprint of a signal.
///
/// SHA-256 over `TICKER|direction|YYYY-MM-DD`, hex encoded (64 chars).
/// Ticker is upper-cased and direction lower-cased, so `spy`/`LONG` and
/// `SPY`/`long` are the same signal.
pub fn signal_hash(ticker: &str, direction: &str, date: NaiveDate) -> String {
    let mut hasher = Sha256::new();

    hasher.update(ticker.trim().to_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(direction.trim().to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());

    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupRecord {
    pub recorded_at: DateTime<Utc>,
}

pub struct SignalDeduplicator {
    ledger: Mutex<HashMap<String, DedupRecord>>,
    ttl: Duration,
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl SignalDeduplicator {
    /// Ledger backed by `config.ledger_path` (memory-only when unset).
    /// Call [`load`](Self::load) to pick up a previous run's records.
    pub fn new(config: &DedupConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: Mutex::new(HashMap::new()),
            ttl: Duration::hours(config.ttl_hours as i64),
            path: config.ledger_path.clone(),
            clock,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True if an unexpired record exists for this signal.
    pub fn is_duplicate(&self, ticker: &str, direction: &str, date: NaiveDate) -> bool {
        let hash = signal_hash(ticker, direction, date);
        let now = self.clock.now();
        self.lock_ledger()
            .get(&hash)
            .is_some_and(|record| !self.is_expired(record, now))
    }

    /// Record an accepted signal. Returns its fingerprint.
    pub fn record(&self, ticker: &str, direction: &str, date: NaiveDate) -> String {
        let hash = signal_hash(ticker, direction, date);
        let recorded_at = self.clock.now();
        debug!("Recording signal {} {} {} ({})", ticker, direction, date, &hash[..12]);
        self.lock_ledger()
            .insert(hash.clone(), DedupRecord { recorded_at });
        hash
    }

    /// Drop records older than the TTL as of `now`. Returns how many were removed.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut ledger = self.lock_ledger();
        let before = ledger.len();
        ledger.retain(|_, record| !self.is_expired(record, now));
        let removed = before - ledger.len();
        if removed > 0 {
            debug!("Pruned {} expired dedup records", removed);
        }
        removed
    }

    /// Replace the in-memory ledger with the persisted one, minus expired
    /// records. A missing file is an empty ledger. Returns how many records
    /// were kept.
    pub fn load(&self) -> Result<usize, ResilienceError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let content = match fs::read(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No dedup ledger at {}, starting empty", path.display());
                self.lock_ledger().clear();
                return Ok(0);
            }
            Err(e) => {
                return Err(ResilienceError::Storage(format!(
                    "failed to read ledger {}: {e}",
                    path.display()
                )))
            }
        };

        let stored: HashMap<String, DedupRecord> = serde_json::from_slice(&content)
            .map_err(|e| {
                ResilienceError::Storage(format!("corrupt ledger {}: {e}", path.display()))
            })?;

        let now = self.clock.now();
        let total = stored.len();
        let live: HashMap<_, _> = stored
            .into_iter()
            .filter(|(_, record)| !self.is_expired(record, now))
            .collect();
        let kept = live.len();

        *self.lock_ledger() = live;
        info!(
            "Loaded dedup ledger {} ({} records, {} expired)",
            path.display(),
            kept,
            total - kept
        );
        Ok(kept)
    }

    /// Atomically write the unexpired records to the ledger file.
    pub fn persist(&self) -> Result<(), ResilienceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let now = self.clock.now();
        let snapshot: BTreeMap<String, DedupRecord> = self
            .lock_ledger()
            .iter()
            .filter(|(_, record)| !self.is_expired(record, now))
            .map(|(hash, record)| (hash.clone(), *record))
            .collect();

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(path, &bytes)?;
        debug!("Persisted {} dedup records to {}", snapshot.len(), path.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock_ledger().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_ledger().is_empty()
    }

    fn is_expired(&self, record: &DedupRecord, now: DateTime<Utc>) -> bool {
        now - record.recorded_at > self.ttl
    }

    fn lock_ledger(&self) -> MutexGuard<'_, HashMap<String, DedupRecord>> {
        match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Dedup ledger mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
