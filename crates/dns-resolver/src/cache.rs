use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use dns_types::protocol::types::*;

/// A convenience wrapper around a `Cache` which lets it be shared
/// between threads.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying `Cache` object.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<Cache>>,
}

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

impl SharedCache {
    /// Make a new, empty, shared cache.
    pub fn new() -> Self {
        Self::from_cache(Cache::new())
    }

    pub fn from_cache(cache: Cache) -> Self {
        SharedCache {
            cache: Arc::new(Mutex::new(cache)),
        }
    }

    /// Get an entry from the cache, evicting it instead if it has
    /// gone stale.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn get(&self, name: &DomainName, rtype: RecordType) -> Option<CacheEntry> {
        self.get_at(name, rtype, SystemTime::now())
    }

    /// Like `get`, but judging staleness as of `now`.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn get_at(&self, name: &DomainName, rtype: RecordType, now: SystemTime) -> Option<CacheEntry> {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .get_at(name, rtype, now)
    }

    /// Insert an entry into the cache, unless there is already one
    /// for this name and type.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn add(&self, name: &DomainName, rtype: RecordType, records: Vec<ResourceRecord>) {
        self.add_at(name, rtype, records, SystemTime::now());
    }

    /// Like `add`, but with an explicit insertion time.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn add_at(
        &self,
        name: &DomainName,
        rtype: RecordType,
        records: Vec<ResourceRecord>,
        now: SystemTime,
    ) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .add_at(name, rtype, records, now);
    }

    /// Delete all stale entries, returning how many there were.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn remove_expired(&self) -> usize {
        self.remove_expired_at(SystemTime::now())
    }

    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn remove_expired_at(&self, now: SystemTime) -> usize {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .remove_expired_at(now)
    }

    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn len(&self) -> usize {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).len()
    }

    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).is_empty()
    }

    /// Read a cache previously written by `save`.
    ///
    /// A missing file is created, and a missing or empty file gives
    /// an empty cache.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or created, or does not hold a
    /// cache.
    pub async fn load(path: &Path) -> Result<Self, CacheError> {
        let octets = match tokio::fs::read(path).await {
            Ok(octets) => octets,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "cache file missing, creating it");
                tokio::fs::write(path, b"").await?;
                Vec::new()
            }
            Err(error) => return Err(error.into()),
        };

        if octets.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::new());
        }

        let entries: Vec<PersistedEntry> = serde_json::from_slice(&octets)?;
        Ok(Self::from_cache(Cache::from_entries(entries)))
    }

    /// Write the whole cache to a file, replacing its contents.
    ///
    /// # Errors
    ///
    /// If the file cannot be written.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub async fn save(&self, path: &Path) -> Result<(), CacheError> {
        let entries = self.cache.lock().expect(MUTEX_POISON_MESSAGE).to_entries();
        let octets = serde_json::to_vec(&entries)?;
        tokio::fs::write(path, octets).await?;
        Ok(())
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Caching for `ResourceRecord`s, keyed by name and type.
///
/// You probably want to use `SharedCache` instead.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    entries: HashMap<(DomainName, RecordType), CacheEntry>,
}

/// A set of records and when they were cached.  All the records
/// share the one insertion time.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheEntry {
    pub inserted: SystemTime,
    pub records: Vec<ResourceRecord>,
}

impl CacheEntry {
    /// An entry is stale once the shortest TTL among its records has
    /// elapsed since it was inserted, in whole seconds.
    pub fn is_stale_at(&self, now: SystemTime) -> bool {
        let elapsed = now
            .duration_since(self.inserted)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        self.records
            .iter()
            .any(|rr| elapsed >= u64::from(rr.ttl))
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_at(&mut self, name: &DomainName, rtype: RecordType, now: SystemTime) -> Option<CacheEntry> {
        let key = (name.clone(), rtype);
        let stale = self.entries.get(&key)?.is_stale_at(now);

        if stale {
            self.entries.remove(&key);
            None
        } else {
            self.entries.get(&key).cloned()
        }
    }

    /// Empty record sets are not stored, as they have no TTL to
    /// expire on.
    pub fn add_at(
        &mut self,
        name: &DomainName,
        rtype: RecordType,
        records: Vec<ResourceRecord>,
        now: SystemTime,
    ) {
        if records.is_empty() {
            return;
        }

        self.entries
            .entry((name.clone(), rtype))
            .or_insert(CacheEntry {
                inserted: now,
                records,
            });
    }

    pub fn remove_expired_at(&mut self, now: SystemTime) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale_at(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn from_entries(entries: Vec<PersistedEntry>) -> Self {
        let mut cache = Self::new();
        for entry in entries {
            cache.add_at(&entry.name, entry.rtype, entry.records, entry.inserted);
        }
        cache
    }

    fn to_entries(&self) -> Vec<PersistedEntry> {
        self.entries
            .iter()
            .map(|((name, rtype), entry)| PersistedEntry {
                name: name.clone(),
                rtype: *rtype,
                inserted: entry.inserted,
                records: entry.records.clone(),
            })
            .collect()
    }
}

/// The on-disk form of one cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    name: DomainName,
    rtype: RecordType,
    inserted: SystemTime,
    records: Vec<ResourceRecord>,
}

/// Errors that can arise when loading or saving the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("could not access cache file")]
    Io(#[from] io::Error),

    #[error("cache file is corrupt")]
    Corrupt(#[from] serde_json::Error),
}

/// Delete expired cache entries every `period`.  This never
/// returns.
pub async fn prune_cache_task(cache: SharedCache, period: Duration) {
    loop {
        tokio::time::sleep(period).await;

        let expired = cache.remove_expired();
        tracing::info!(%expired, current_size = %cache.len(), "pruned cache");
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_types::protocol::types::test_util::*;

    use super::*;

    fn a_record_with_ttl(name: &str, address: Ipv4Addr, ttl: u32) -> ResourceRecord {
        let mut rr = a_record(name, address);
        rr.ttl = ttl;
        rr
    }

    #[test]
    fn cache_staleness_boundary() {
        let cache = SharedCache::new();
        let name = domain("www.example.com");
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let rr = a_record_with_ttl("www.example.com", Ipv4Addr::new(1, 1, 1, 1), 2);

        cache.add_at(&name, RecordType::A, vec![rr.clone()], t);

        assert_eq!(
            Some(vec![rr.clone()]),
            cache.get_at(&name, RecordType::A, t).map(|e| e.records)
        );
        assert_eq!(
            Some(vec![rr]),
            cache
                .get_at(&name, RecordType::A, t + Duration::from_secs(1))
                .map(|e| e.records)
        );
        assert_eq!(None, cache.get_at(&name, RecordType::A, t + Duration::from_secs(3)));
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_stale_when_ttl_exactly_elapsed() {
        let cache = SharedCache::new();
        let name = domain("www.example.com");
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let rr = a_record_with_ttl("www.example.com", Ipv4Addr::new(1, 1, 1, 1), 2);

        cache.add_at(&name, RecordType::A, vec![rr], t);

        assert_eq!(
            None,
            cache.get_at(&name, RecordType::A, t + Duration::from_millis(2_500))
        );
    }

    #[test]
    fn cache_first_write_wins() {
        let cache = SharedCache::new();
        let name = domain("www.example.com");
        let first = vec![a_record("www.example.com", Ipv4Addr::new(1, 1, 1, 1))];
        let second = vec![a_record("www.example.com", Ipv4Addr::new(2, 2, 2, 2))];

        cache.add(&name, RecordType::A, first.clone());
        cache.add(&name, RecordType::A, second);

        assert_eq!(Some(first), cache.get(&name, RecordType::A).map(|e| e.records));
        assert_eq!(1, cache.len());
    }

    #[test]
    fn cache_ignores_empty_record_set() {
        let cache = SharedCache::new();
        cache.add(&domain("www.example.com"), RecordType::A, Vec::new());

        assert!(cache.is_empty());
    }

    #[test]
    fn cache_keys_by_type() {
        let cache = SharedCache::new();
        let name = domain("www.example.com");
        cache.add(
            &name,
            RecordType::A,
            vec![a_record("www.example.com", Ipv4Addr::new(1, 1, 1, 1))],
        );

        assert_eq!(None, cache.get(&name, RecordType::AAAA));
        assert!(cache.get(&name, RecordType::A).is_some());
    }

    #[test]
    fn cache_entry_expires_with_shortest_ttl() {
        let cache = SharedCache::new();
        let name = domain("www.example.com");
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        cache.add_at(
            &name,
            RecordType::A,
            vec![
                a_record_with_ttl("www.example.com", Ipv4Addr::new(1, 1, 1, 1), 300),
                a_record_with_ttl("www.example.com", Ipv4Addr::new(2, 2, 2, 2), 5),
            ],
            t,
        );

        assert!(cache
            .get_at(&name, RecordType::A, t + Duration::from_secs(4))
            .is_some());
        assert!(cache
            .get_at(&name, RecordType::A, t + Duration::from_secs(5))
            .is_none());
    }

    #[test]
    fn remove_expired_only_removes_stale() {
        let cache = SharedCache::new();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        cache.add_at(
            &domain("short.example.com"),
            RecordType::A,
            vec![a_record_with_ttl("short.example.com", Ipv4Addr::new(1, 1, 1, 1), 10)],
            t,
        );
        cache.add_at(
            &domain("long.example.com"),
            RecordType::A,
            vec![a_record_with_ttl("long.example.com", Ipv4Addr::new(1, 1, 1, 1), 100)],
            t,
        );

        assert_eq!(0, cache.remove_expired_at(t + Duration::from_secs(9)));
        assert_eq!(1, cache.remove_expired_at(t + Duration::from_secs(50)));
        assert_eq!(1, cache.len());
        assert!(cache
            .get_at(&domain("long.example.com"), RecordType::A, t + Duration::from_secs(50))
            .is_some());
    }

    #[tokio::test]
    async fn load_missing_file_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = SharedCache::load(&path).await.unwrap();

        assert!(cache.is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn load_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"").unwrap();

        assert!(SharedCache::load(&path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"not a cache").unwrap();

        assert!(matches!(
            SharedCache::load(&path).await,
            Err(CacheError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let name = domain("www.example.com");
        let records = vec![
            a_record("www.example.com", Ipv4Addr::new(1, 1, 1, 1)),
            a_record("www.example.com", Ipv4Addr::new(2, 2, 2, 2)),
        ];

        let cache = SharedCache::new();
        cache.add(&name, RecordType::A, records.clone());
        cache.add(
            &domain("example.com"),
            RecordType::NS,
            vec![ns_record("example.com", "ns1.example.com")],
        );
        let before = cache.get(&name, RecordType::A).unwrap();
        cache.save(&path).await.unwrap();

        let loaded = SharedCache::load(&path).await.unwrap();

        assert_eq!(2, loaded.len());
        assert_eq!(
            Some(before),
            loaded.get_at(&name, RecordType::A, SystemTime::now())
        );
    }
}
