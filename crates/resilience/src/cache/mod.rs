//! File cache for provider responses.
//!
//! Layout: `{root}/{provider}/{endpoint}/{date-bucket}/{param-hash}.{ext}`
//!
//! Features:
//! - Atomic writes (unique temp file in the same directory, fsync, rename)
//! - Forward-date safety: a range reaching past today is never written,
//!   and the current day's bucket is never cached because it is still
//!   accumulating
//! - TTL on read: entries older than their TTL are misses
//! - Corrupt entries are quarantined (`{file}.quarantined`) and read as misses
//! - Maintenance: [`FileCache::purge_expired`] sweeps expired entries,
//!   abandoned temp files and quarantined files older than the default TTL

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::errors::ResilienceError;
use crate::models::{DateRange, Payload, ProviderRequest};
use crate::registry::sanitize;
use crate::storage::{is_temp_file, write_atomic};

/// Temp files younger than this may belong to a live writer.
const STALE_TEMP_AGE: StdDuration = StdDuration::from_secs(3600);

const QUARANTINE_EXTENSION: &str = "quarantined";

/// Identity of one cached response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKey {
    pub provider: String,
    pub endpoint: String,
    pub date_bucket: NaiveDate,
    pub param_hash: String,
}

impl CacheKey {
    pub fn new(
        provider: impl Into<String>,
        endpoint: impl Into<String>,
        date_bucket: NaiveDate,
        param_hash: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            endpoint: endpoint.into(),
            date_bucket,
            param_hash: param_hash.into(),
        }
    }

    pub fn for_request(provider: &str, request: &ProviderRequest) -> Self {
        Self::new(
            provider,
            request.endpoint.clone(),
            request.date_bucket,
            request.param_hash(),
        )
    }
}

/// On-disk envelope. The payload is base64 so arbitrary bytes survive JSON.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    key: CacheKey,
    created_at: DateTime<Utc>,
    requested_range: DateRange,
    ttl_days: u32,
    payload: String,
}

/// Result of a [`FileCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// Caching is turned off.
    Disabled,
    /// The requested range reaches past today.
    ForwardLooking,
    /// The entry belongs to today's (still accumulating) bucket.
    TodayBucket,
}

/// Counts from a maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub expired_entries: usize,
    pub corrupt_entries: usize,
    pub stale_temp_files: usize,
    pub quarantined_files: usize,
}

pub struct FileCache {
    root: PathBuf,
    enabled: bool,
    default_ttl_days: u32,
    extension: String,
    clock: Arc<dyn Clock>,
}

impl FileCache {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: config.dir.clone(),
            enabled: config.enabled,
            default_ttl_days: config.ttl_days,
            extension: config.extension.trim_start_matches('.').to_string(),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_ttl_days(&self) -> u32 {
        self.default_ttl_days
    }

    /// Path for a key: `{root}/{provider}/{endpoint}/{date-bucket}/{param-hash}.{ext}`
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(sanitize(&key.provider))
            .join(sanitize(key.endpoint.trim_matches('/')))
            .join(key.date_bucket.format("%Y-%m-%d").to_string())
            .join(format!("{}.{}", sanitize(&key.param_hash), self.extension))
    }

    /// Look up a cached payload.
    ///
    /// Misses when caching is disabled, the key is for today's bucket, the
    /// file is absent or corrupt, the entry is older than its TTL, or its
    /// stored range ends after today.
    pub fn get(&self, key: &CacheKey) -> Option<Payload> {
        if !self.enabled {
            return None;
        }

        let now = self.clock.now();
        let today = now.date_naive();
        if key.date_bucket >= today {
            return None;
        }

        let path = self.path_for(key);
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read cache entry {}: {e}", path.display());
                return None;
            }
        };

        let entry = match decode_entry(&content) {
            Ok(entry) => entry,
            Err(reason) => {
                self.quarantine(&path, &content, &reason);
                return None;
            }
        };

        if &entry.key != key {
            debug!("Cache entry {} belongs to another key", path.display());
            return None;
        }

        if is_expired(&entry, now) {
            debug!(
                "Cache entry {} expired (created {}, ttl {}d)",
                path.display(),
                entry.created_at,
                entry.ttl_days
            );
            return None;
        }

        if entry.requested_range.is_forward_looking(today) {
            return None;
        }

        match BASE64.decode(entry.payload.as_bytes()) {
            Ok(payload) => {
                debug!("Cache hit {}", path.display());
                Some(payload)
            }
            Err(e) => {
                self.quarantine(&path, &content, &format!("payload decode: {e}"));
                None
            }
        }
    }

    /// Store a payload.
    ///
    /// `requested_range` defaults to the key's date bucket. A range whose
    /// upper bound is after today is not written at all: tomorrow the same
    /// logical request must return more data than today.
    pub fn put(
        &self,
        key: &CacheKey,
        value: &[u8],
        requested_range: Option<DateRange>,
        ttl_days: u32,
    ) -> Result<PutOutcome, ResilienceError> {
        if !self.enabled {
            return Ok(PutOutcome::Disabled);
        }

        let now = self.clock.now();
        let today = now.date_naive();
        let range = requested_range.unwrap_or_else(|| DateRange::day(key.date_bucket));

        if range.is_forward_looking(today) {
            debug!(
                "Not caching {}/{}: range ends {} after today {}",
                key.provider, key.endpoint, range.to, today
            );
            return Ok(PutOutcome::ForwardLooking);
        }

        if key.date_bucket >= today {
            debug!(
                "Not caching {}/{}: bucket {} is still accumulating",
                key.provider, key.endpoint, key.date_bucket
            );
            return Ok(PutOutcome::TodayBucket);
        }

        let entry = CacheEntry {
            key: key.clone(),
            created_at: now,
            requested_range: range.capped_at(today),
            ttl_days,
            payload: BASE64.encode(value),
        };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| ResilienceError::Cache(format!("serialize entry: {e}")))?;

        write_atomic(&self.path_for(key), &bytes)
            .map_err(|e| ResilienceError::Cache(e.to_string()))?;
        Ok(PutOutcome::Written)
    }

    /// Remove one entry. Returns whether a file was deleted.
    pub fn invalidate(&self, key: &CacheKey) -> Result<bool, ResilienceError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ResilienceError::Cache(format!("invalidate: {e}"))),
        }
    }

    /// Remove expired and corrupt entries, abandoned temp files, and
    /// quarantined files untouched for longer than the default TTL.
    pub fn purge_expired(&self) -> Result<PurgeStats, ResilienceError> {
        let mut stats = PurgeStats::default();
        if !self.root.exists() {
            return Ok(stats);
        }

        let now = self.clock.now();
        let quarantine_age =
            StdDuration::from_secs(u64::from(self.default_ttl_days.max(1)) * 86_400);
        let mut files = Vec::new();
        collect_files(&self.root, &mut files)
            .map_err(|e| ResilienceError::Cache(format!("walk {}: {e}", self.root.display())))?;

        for path in files {
            if is_temp_file(&path) {
                if is_older_than(&path, STALE_TEMP_AGE) && fs::remove_file(&path).is_ok() {
                    stats.stale_temp_files += 1;
                }
                continue;
            }

            if is_quarantined(&path) {
                if is_older_than(&path, quarantine_age) && fs::remove_file(&path).is_ok() {
                    stats.quarantined_files += 1;
                }
                continue;
            }

            if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
                continue;
            }

            let remove = match fs::read(&path).map_err(|e| e.to_string()).and_then(|c| decode_entry(&c)) {
                Ok(entry) if is_expired(&entry, now) => {
                    stats.expired_entries += 1;
                    true
                }
                Ok(_) => false,
                Err(reason) => {
                    debug!("Purging corrupt cache entry {}: {}", path.display(), reason);
                    stats.corrupt_entries += 1;
                    true
                }
            };

            if remove {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove {}: {e}", path.display());
                }
            }
        }

        info!(
            "Cache purge: {} expired, {} corrupt, {} stale temp files, {} quarantined",
            stats.expired_entries,
            stats.corrupt_entries,
            stats.stale_temp_files,
            stats.quarantined_files
        );
        Ok(stats)
    }

    /// Delete everything under the cache root.
    pub fn clear(&self) -> Result<(), ResilienceError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ResilienceError::Cache(format!("clear: {e}"))),
        }
    }

    /// Move a corrupt entry aside, unless a writer replaced it after
    /// `observed` was read.
    fn quarantine(&self, path: &Path, observed: &[u8], reason: &str) {
        match fs::read(path) {
            Ok(current) if current == observed => {}
            _ => {
                debug!(
                    "Cache entry {} changed since it was read, not quarantining",
                    path.display()
                );
                return;
            }
        }

        let quarantined =
            path.with_extension(format!("{}.{}", self.extension, QUARANTINE_EXTENSION));
        warn!(
            "Quarantining corrupt cache entry {}: {}",
            path.display(),
            reason
        );
        if let Err(e) = fs::rename(path, &quarantined) {
            warn!("Failed to quarantine {}: {e}", path.display());
        }
    }
}

fn decode_entry(content: &[u8]) -> Result<CacheEntry, String> {
    serde_json::from_slice(content).map_err(|e| e.to_string())
}

fn is_expired(entry: &CacheEntry, now: DateTime<Utc>) -> bool {
    now - entry.created_at > Duration::days(entry.ttl_days as i64)
}

fn is_quarantined(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(QUARANTINE_EXTENSION)
}

fn is_older_than(path: &Path, max_age: StdDuration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > max_age)
        .unwrap_or(false)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn setup() -> (tempfile::TempDir, FileCache, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 20, 16, 0, 0).unwrap(),
        ));
        let config = CacheConfig {
            enabled: true,
            dir: dir.path().to_path_buf(),
            ttl_days: 7,
            extension: "json".to_string(),
        };
        let cache = FileCache::new(&config, clock.clone());
        (dir, cache, clock)
    }

    fn key(bucket: NaiveDate) -> CacheKey {
        CacheKey::new("POLYGON", "v3/snapshot/options", bucket, "abc123")
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, cache, _) = setup();
        let k = key(date(2026, 2, 19));
        let range = DateRange::new(date(2026, 1, 20), date(2026, 2, 19));

        let outcome = cache.put(&k, b"\x00chain\xff", Some(range), 7).unwrap();
        assert_eq!(outcome, PutOutcome::Written);
        assert_eq!(cache.get(&k).unwrap(), b"\x00chain\xff");
    }

    #[test]
    fn test_path_layout() {
        let (dir, cache, _) = setup();
        let path = cache.path_for(&key(date(2026, 2, 19)));
        assert_eq!(
            path,
            dir.path()
                .join("POLYGON")
                .join("v3_snapshot_options")
                .join("2026-02-19")
                .join("abc123.json")
        );
    }

    #[test]
    fn test_forward_looking_range_is_not_written() {
        let (_dir, cache, _) = setup();
        let k = key(date(2026, 2, 19));
        let range = DateRange::new(date(2026, 2, 1), date(2026, 3, 20));

        let outcome = cache.put(&k, b"partial", Some(range), 7).unwrap();
        assert_eq!(outcome, PutOutcome::ForwardLooking);
        assert!(cache.get(&k).is_none());
        assert!(!cache.path_for(&k).exists());
    }

    #[test]
    fn test_today_bucket_is_never_cached() {
        let (_dir, cache, _) = setup();
        let k = key(date(2026, 2, 20));

        let outcome = cache.put(&k, b"intraday", None, 7).unwrap();
        assert_eq!(outcome, PutOutcome::TodayBucket);
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let (_dir, cache, clock) = setup();
        let k = key(date(2026, 2, 19));
        cache.put(&k, b"bars", None, 2).unwrap();

        clock.advance(Duration::days(2));
        assert!(cache.get(&k).is_some());

        clock.advance(Duration::minutes(1));
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 20, 16, 0, 0).unwrap(),
        ));
        let cache = FileCache::new(
            &CacheConfig {
                enabled: false,
                dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            clock,
        );
        let k = key(date(2026, 2, 19));

        assert_eq!(cache.put(&k, b"x", None, 7).unwrap(), PutOutcome::Disabled);
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn test_corrupt_entry_is_quarantined() {
        let (_dir, cache, _) = setup();
        let k = key(date(2026, 2, 19));
        let path = cache.path_for(&k);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ truncated").unwrap();

        assert!(cache.get(&k).is_none());
        assert!(!path.exists());
        assert!(path.with_extension("json.quarantined").exists());
    }

    #[test]
    fn test_entry_replaced_after_read_is_not_quarantined() {
        let (_dir, cache, _) = setup();
        let k = key(date(2026, 2, 19));
        cache.put(&k, b"chain", None, 7).unwrap();
        let path = cache.path_for(&k);

        // The corrupt bytes a reader saw before a concurrent put landed.
        cache.quarantine(&path, b"{ truncated", "EOF while parsing");

        assert!(path.exists());
        assert!(!path.with_extension("json.quarantined").exists());
        assert_eq!(cache.get(&k).unwrap(), b"chain");
    }

    #[test]
    fn test_purge_removes_old_quarantined_files() {
        let (_dir, cache, _) = setup();
        let stale = key(date(2026, 2, 10));
        let recent = key(date(2026, 2, 19));
        for k in [&stale, &recent] {
            let path = cache.path_for(k);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"not json").unwrap();
            assert!(cache.get(k).is_none());
        }

        let stale_path = cache.path_for(&stale).with_extension("json.quarantined");
        let recent_path = cache.path_for(&recent).with_extension("json.quarantined");
        let eight_days_ago = SystemTime::now() - StdDuration::from_secs(8 * 86_400);
        fs::File::options()
            .write(true)
            .open(&stale_path)
            .unwrap()
            .set_modified(eight_days_ago)
            .unwrap();

        let stats = cache.purge_expired().unwrap();
        assert_eq!(stats.quarantined_files, 1);
        assert_eq!(stats.corrupt_entries, 0);
        assert!(!stale_path.exists());
        assert!(recent_path.exists());
    }

    #[test]
    fn test_invalidate() {
        let (_dir, cache, _) = setup();
        let k = key(date(2026, 2, 19));
        cache.put(&k, b"bars", None, 7).unwrap();

        assert!(cache.invalidate(&k).unwrap());
        assert!(!cache.invalidate(&k).unwrap());
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let (_dir, cache, clock) = setup();
        let old = key(date(2026, 2, 10));
        let fresh = CacheKey::new("FRED", "series", date(2026, 2, 19), "def456");

        cache.put(&old, b"old", None, 1).unwrap();
        cache.put(&fresh, b"fresh", None, 30).unwrap();
        clock.advance(Duration::days(3));

        let stats = cache.purge_expired().unwrap();
        assert_eq!(stats.expired_entries, 1);
        assert!(!cache.path_for(&old).exists());
        assert_eq!(cache.get(&fresh).unwrap(), b"fresh");
    }

    #[test]
    fn test_concurrent_puts_never_expose_partial_payloads() {
        let (_dir, cache, _) = setup();
        let cache = Arc::new(cache);
        let k = key(date(2026, 2, 19));
        let big_a = vec![b'a'; 256 * 1024];
        let big_b = vec![b'b'; 256 * 1024];
        cache.put(&k, &big_a, None, 7).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let cache = cache.clone();
                let k = k.clone();
                let value = if i % 2 == 0 { big_a.clone() } else { big_b.clone() };
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        cache.put(&k, &value, None, 7).unwrap();
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let k = k.clone();
                let (a, b) = (big_a.clone(), big_b.clone());
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let got = cache.get(&k).expect("entry must always be readable");
                        assert!(got == a || got == b);
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
    }
}
