//! On-disk persistence for circuit breaker state.
//!
//! Layout: `{dir}/{provider}.json`, one small record per provider,
//! written with [`write_atomic`](crate::storage::write_atomic).

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::circuit_breaker::BreakerSnapshot;
use crate::errors::ResilienceError;
use crate::storage::write_atomic;

pub struct BreakerStore {
    dir: PathBuf,
}

impl BreakerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, provider_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(provider_id)))
    }

    pub fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), ResilienceError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path_for(&snapshot.provider_id), &json)
    }

    /// Load a provider's record, if one exists and parses.
    ///
    /// A corrupt record is logged and ignored; the breaker starts fresh.
    pub fn load(&self, provider_id: &str) -> Option<BreakerSnapshot> {
        let path = self.path_for(provider_id);
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read breaker state {}: {e}", path.display());
                return None;
            }
        };

        match serde_json::from_slice::<BreakerSnapshot>(&content) {
            Ok(snapshot) if snapshot.provider_id == provider_id => {
                debug!("Loaded breaker state for '{}'", provider_id);
                Some(snapshot)
            }
            Ok(snapshot) => {
                warn!(
                    "Breaker state {} belongs to '{}', not '{}'; ignoring",
                    path.display(),
                    snapshot.provider_id,
                    provider_id
                );
                None
            }
            Err(e) => {
                warn!("Corrupt breaker state {}: {e}; ignoring", path.display());
                None
            }
        }
    }
}

/// Provider ids become file names; keep them to a safe alphabet.
pub(crate) fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CircuitState;
    use chrono::{TimeZone, Utc};

    fn snapshot(provider: &str) -> BreakerSnapshot {
        BreakerSnapshot {
            provider_id: provider.to_string(),
            state: CircuitState::Open,
            window: vec![false, true, false],
            last_transition_time: Utc.with_ymd_and_hms(2026, 2, 20, 15, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = BreakerStore::new(dir.path());

        store.save(&snapshot("POLYGON")).unwrap();
        assert_eq!(store.load("POLYGON"), Some(snapshot("POLYGON")));
        assert_eq!(store.load("FRED"), None);
    }

    #[test]
    fn test_corrupt_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = BreakerStore::new(dir.path());
        fs::write(dir.path().join("POLYGON.json"), b"{ not json").unwrap();

        assert_eq!(store.load("POLYGON"), None);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("CBOE/DELAYED"), "CBOE_DELAYED");
        assert_eq!(sanitize("fred-v2"), "fred-v2");
        assert_eq!(sanitize(".."), "__");
    }
}
