use crate::config::CacheConfig;
use crate::error::ControlError;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// TTL class declared by the caller on every `set`.
///
/// Classes trade freshness for churn: hot lookup state goes in
/// `HighFrequency`, replicated records and snapshots in `Archival`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtlClass {
    HighFrequency,
    Medium,
    Low,
    Archival,
}

impl TtlClass {
    fn ttl_ms(self, config: &CacheConfig) -> u64 {
        match self {
            TtlClass::HighFrequency => config.ttl_high_ms,
            TtlClass::Medium => config.ttl_medium_ms,
            TtlClass::Low => config.ttl_low_ms,
            TtlClass::Archival => config.ttl_archival_ms,
        }
    }
}

/// Self-describing value blob used when round-tripping through a remote
/// backing store. Local mode keeps raw bytes and never serializes this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub class: TtlClass,
    pub version: u64,
    pub data_b64: String,
}

impl Blob {
    fn encode(class: TtlClass, version: u64, data: &[u8]) -> Self {
        Self {
            class,
            version,
            data_b64: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    fn decode_data(&self) -> Result<Bytes, ControlError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data_b64)
            .map(Bytes::from)
            .map_err(|e| ControlError::Internal(format!("cache blob corrupt: {}", e)))
    }
}

/// Remote key/value store for distributed mode.
#[async_trait::async_trait]
pub trait CacheBacking: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Blob>, ControlError>;
    async fn put(&self, key: &str, blob: Blob, ttl_ms: u64) -> Result<(), ControlError>;
    /// Atomic compare-and-set on the stored version. `expected = None` means
    /// "create only". Returns the new version.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        blob: Blob,
        ttl_ms: u64,
    ) -> Result<u64, ControlError>;
    async fn delete(&self, key: &str) -> Result<(), ControlError>;
}

struct Entry {
    data: Bytes,
    class: TtlClass,
    version: u64,
    expires_at_ms: u64,
    /// Microseconds since process start, updated on every hit (for LRU).
    last_access: AtomicU64,
}

impl Entry {
    fn cost(&self, key: &str) -> u64 {
        (key.len() + self.data.len()) as u64
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Process-local typed key/value store with per-class TTLs, an LRU byte cap
/// and versioned compare-and-swap.
///
/// Concurrent `get`/`set` are linearizable per key: mutations go through the
/// DashMap entry lock, and the version counter makes lost updates visible to
/// CAS users. With a `CacheBacking` attached, reads and writes round-trip
/// the remote store as self-describing blobs; the local map doubles as a
/// fallback so backing outages degrade to local behavior.
pub struct TypedCache {
    config: CacheConfig,
    entries: DashMap<String, Entry>,
    backing: Option<Arc<dyn CacheBacking>>,
    bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Join a namespace and key into the canonical cache key.
pub fn nskey(namespace: &str, key: &str) -> String {
    format!("{}/{}", namespace.trim_end_matches('/'), key)
}

impl TypedCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            backing: None,
            bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_backing(config: CacheConfig, backing: Arc<dyn CacheBacking>) -> Self {
        let mut cache = Self::new(config);
        cache.backing = Some(backing);
        cache
    }

    /// Fetch a value. Expired entries count as misses and are dropped.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, ControlError> {
        if let Some(backing) = &self.backing {
            match backing.get(key).await {
                Ok(Some(blob)) => {
                    let data = blob.decode_data()?;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(data));
                }
                Ok(None) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Err(e) => {
                    // Backing outage degrades to the local map below.
                    tracing::warn!("cache: backing get failed, key={}, error={}", key, e);
                }
            }
        }

        let now = now_ms();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at_ms > now => {
                entry.last_access.store(now_us(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.data.clone()))
            }
            Some(entry) => {
                let cost = entry.cost(key);
                drop(entry);
                if self.entries.remove(key).is_some() {
                    self.bytes.fetch_sub(cost, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store a value under the class TTL. Overwrites bump the version.
    pub async fn set(
        &self,
        key: &str,
        value: Bytes,
        class: TtlClass,
    ) -> Result<(), ControlError> {
        let version = self.set_local(key, value.clone(), class);

        if let Some(backing) = &self.backing {
            let ttl = class.ttl_ms(&self.config);
            let blob = Blob::encode(class, version, &value);
            if let Err(e) = backing.put(key, blob, ttl).await {
                tracing::warn!("cache: backing put failed, key={}, error={}", key, e);
                return Err(ControlError::CacheUnavailable(e.to_string()));
            }
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), ControlError> {
        if let Some((k, entry)) = self.entries.remove(key) {
            self.bytes.fetch_sub(entry.cost(&k), Ordering::Relaxed);
        }
        if let Some(backing) = &self.backing {
            backing.delete(key).await.map_err(|e| {
                ControlError::CacheUnavailable(format!("delete {}: {}", key, e))
            })?;
        }
        Ok(())
    }

    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, ControlError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    pub async fn mset(
        &self,
        entries: Vec<(String, Bytes)>,
        class: TtlClass,
    ) -> Result<(), ControlError> {
        for (key, value) in entries {
            self.set(&key, value, class).await?;
        }
        Ok(())
    }

    /// Compare-and-swap on the entry's version. `expected = None` succeeds
    /// only when the key is absent (or expired). Returns the new version.
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
        class: TtlClass,
    ) -> Result<u64, ControlError> {
        if let Some(backing) = &self.backing {
            let ttl = class.ttl_ms(&self.config);
            let blob = Blob::encode(class, expected.map(|v| v + 1).unwrap_or(1), &value);
            match backing.compare_and_swap(key, expected, blob, ttl).await {
                Ok(version) => {
                    self.set_local_versioned(key, value, class, version);
                    return Ok(version);
                }
                Err(ControlError::Unavailable(msg)) => {
                    return Err(ControlError::CacheUnavailable(msg));
                }
                Err(e) => return Err(e),
            }
        }

        self.cas_local(key, expected, value, class)
    }

    /// Current version of a key, if present and unexpired.
    pub fn version(&self, key: &str) -> Option<u64> {
        let now = now_ms();
        self.entries
            .get(key)
            .filter(|e| e.expires_at_ms > now)
            .map(|e| e.version)
    }

    /// Snapshot of all live keys under a namespace prefix, with values.
    /// Used by the replication log to replay trailing records.
    pub fn scan_namespace(&self, namespace: &str) -> Vec<(String, Bytes)> {
        let prefix = format!("{}/", namespace.trim_end_matches('/'));
        let now = now_ms();
        let mut out: Vec<(String, Bytes)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&prefix) && e.value().expires_at_ms > now)
            .map(|e| (e.key().clone(), e.value().data.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            bytes: self.bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Typed helpers for JSON-serializable values.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, ControlError> {
        match self.get(key).await? {
            Some(data) => {
                let value = serde_json::from_slice(&data)
                    .map_err(|e| ControlError::Internal(format!("cache decode {}: {}", key, e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        class: TtlClass,
    ) -> Result<(), ControlError> {
        let data = serde_json::to_vec(value)
            .map_err(|e| ControlError::Internal(format!("cache encode {}: {}", key, e)))?;
        self.set(key, Bytes::from(data), class).await
    }

    /// Spawn the background sweep that drops expired entries and enforces
    /// the byte cap. Call once after construction.
    pub fn start_gc(self: &Arc<Self>, interval: std::time::Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                cache.sweep();
            }
        });
    }

    /// Drop expired entries, then LRU-evict until under the byte cap.
    pub fn sweep(&self) {
        let now = now_ms();

        let mut freed = 0u64;
        self.entries.retain(|k, e| {
            if e.expires_at_ms > now {
                true
            } else {
                freed += e.cost(k);
                false
            }
        });
        if freed > 0 {
            self.bytes.fetch_sub(freed, Ordering::Relaxed);
        }

        while self.bytes.load(Ordering::Relaxed) > self.config.max_bytes {
            if !self.evict_lru_batch() {
                break;
            }
        }
    }

    /// Evict the least-recently-used tenth of entries. Returns false when
    /// there was nothing left to evict.
    fn evict_lru_batch(&self) -> bool {
        let mut candidates: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().last_access.load(Ordering::Relaxed)))
            .collect();
        if candidates.is_empty() {
            return false;
        }
        candidates.sort_unstable_by_key(|(_, at)| *at);

        let batch = (candidates.len() / 10).max(1);
        for (key, _) in candidates.into_iter().take(batch) {
            if let Some((k, entry)) = self.entries.remove(&key) {
                self.bytes.fetch_sub(entry.cost(&k), Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        metrics::counter!("aether_cache_evictions_total").increment(1);
        true
    }

    // -- private helpers --

    fn set_local(&self, key: &str, value: Bytes, class: TtlClass) -> u64 {
        let next_version = self.version(key).map(|v| v + 1).unwrap_or(1);
        self.set_local_versioned(key, value, class, next_version);
        next_version
    }

    fn set_local_versioned(&self, key: &str, value: Bytes, class: TtlClass, version: u64) {
        let ttl = class.ttl_ms(&self.config);
        let entry = Entry {
            data: value,
            class,
            version,
            expires_at_ms: now_ms() + ttl,
            last_access: AtomicU64::new(now_us()),
        };
        let cost = entry.cost(key);

        match self.entries.insert(key.to_string(), entry) {
            Some(old) => {
                let old_cost = old.cost(key);
                if cost > old_cost {
                    self.bytes.fetch_add(cost - old_cost, Ordering::Relaxed);
                } else {
                    self.bytes.fetch_sub(old_cost - cost, Ordering::Relaxed);
                }
            }
            None => {
                self.bytes.fetch_add(cost, Ordering::Relaxed);
            }
        }
    }

    fn cas_local(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
        class: TtlClass,
    ) -> Result<u64, ControlError> {
        let now = now_ms();
        let ttl = class.ttl_ms(&self.config);

        // The entry API holds the shard lock across the check-and-set,
        // making the CAS linearizable per key.
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                let live = occ.get().expires_at_ms > now;
                let current = if live { Some(occ.get().version) } else { None };
                if current != expected {
                    return Err(ControlError::Internal(format!(
                        "cas conflict on {}: expected {:?}, found {:?}",
                        key, expected, current
                    )));
                }
                let version = current.map(|v| v + 1).unwrap_or(1);
                let old_cost = occ.get().cost(key);
                let entry = Entry {
                    data: value,
                    class,
                    version,
                    expires_at_ms: now + ttl,
                    last_access: AtomicU64::new(now_us()),
                };
                let cost = entry.cost(key);
                occ.insert(entry);
                if cost > old_cost {
                    self.bytes.fetch_add(cost - old_cost, Ordering::Relaxed);
                } else {
                    self.bytes.fetch_sub(old_cost - cost, Ordering::Relaxed);
                }
                Ok(version)
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                if expected.is_some() {
                    return Err(ControlError::Internal(format!(
                        "cas conflict on {}: expected {:?}, found none",
                        key, expected
                    )));
                }
                let entry = Entry {
                    data: value,
                    class,
                    version: 1,
                    expires_at_ms: now + ttl,
                    last_access: AtomicU64::new(now_us()),
                };
                self.bytes.fetch_add(entry.cost(key), Ordering::Relaxed);
                vac.insert(entry);
                Ok(1)
            }
        }
    }
}

/// Wall-clock milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// HTTP-backed remote store: GET/PUT/DELETE against `{base}/kv/{key}` with
/// the blob as the JSON body and the expected version as a query parameter
/// for CAS. Any transport failure maps to `CacheUnavailable`.
pub struct HttpCacheBacking {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCacheBacking {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, key)
    }
}

#[async_trait::async_trait]
impl CacheBacking for HttpCacheBacking {
    async fn get(&self, key: &str) -> Result<Option<Blob>, ControlError> {
        let resp = self
            .client
            .get(self.url(key))
            .send()
            .await
            .map_err(|e| ControlError::CacheUnavailable(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let blob = resp
            .error_for_status()
            .map_err(|e| ControlError::CacheUnavailable(e.to_string()))?
            .json::<Blob>()
            .await
            .map_err(|e| ControlError::CacheUnavailable(e.to_string()))?;
        Ok(Some(blob))
    }

    async fn put(&self, key: &str, blob: Blob, ttl_ms: u64) -> Result<(), ControlError> {
        self.client
            .put(self.url(key))
            .query(&[("ttl_ms", ttl_ms)])
            .json(&blob)
            .send()
            .await
            .map_err(|e| ControlError::CacheUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| ControlError::CacheUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        blob: Blob,
        ttl_ms: u64,
    ) -> Result<u64, ControlError> {
        let mut req = self.client.put(self.url(key)).query(&[("ttl_ms", ttl_ms)]);
        if let Some(v) = expected {
            req = req.query(&[("if_version", v)]);
        } else {
            req = req.query(&[("if_absent", "true")]);
        }
        let resp = req
            .json(&blob)
            .send()
            .await
            .map_err(|e| ControlError::CacheUnavailable(e.to_string()))?;
        if resp.status().as_u16() == 409 {
            return Err(ControlError::Internal(format!("cas conflict on {}", key)));
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| ControlError::CacheUnavailable(e.to_string()))?;
        #[derive(Deserialize)]
        struct CasResponse {
            version: u64,
        }
        let body = resp
            .json::<CasResponse>()
            .await
            .map_err(|e| ControlError::CacheUnavailable(e.to_string()))?;
        Ok(body.version)
    }

    async fn delete(&self, key: &str) -> Result<(), ControlError> {
        self.client
            .delete(self.url(key))
            .send()
            .await
            .map_err(|e| ControlError::CacheUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> TypedCache {
        TypedCache::new(CacheConfig {
            max_bytes: 1024,
            ttl_high_ms: 50,
            ttl_medium_ms: 300_000,
            ttl_low_ms: 3_600_000,
            ttl_archival_ms: 86_400_000,
            backing_url: None,
        })
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = small_cache();
        cache
            .set("ns/a", Bytes::from_static(b"hello"), TtlClass::Medium)
            .await
            .unwrap();
        let got = cache.get("ns/a").await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = small_cache();
        cache
            .set("ns/a", Bytes::from_static(b"x"), TtlClass::HighFrequency)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert!(cache.get("ns/a").await.unwrap().is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_mget_mset() {
        let cache = small_cache();
        cache
            .mset(
                vec![
                    ("ns/a".to_string(), Bytes::from_static(b"1")),
                    ("ns/b".to_string(), Bytes::from_static(b"2")),
                ],
                TtlClass::Medium,
            )
            .await
            .unwrap();
        let got = cache
            .mget(&["ns/a".to_string(), "ns/b".to_string(), "ns/c".to_string()])
            .await
            .unwrap();
        assert_eq!(got[0].as_deref(), Some(&b"1"[..]));
        assert_eq!(got[1].as_deref(), Some(&b"2"[..]));
        assert!(got[2].is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_byte_cap() {
        let cache = small_cache();
        // 64 entries x ~36 bytes >> 1024 byte cap.
        for i in 0..64 {
            let key = format!("ns/key-{:02}", i);
            cache
                .set(&key, Bytes::from(vec![0u8; 26]), TtlClass::Medium)
                .await
                .unwrap();
        }
        cache.sweep();
        assert!(cache.stats().bytes <= 1024);
        assert!(cache.stats().evictions > 0);
    }

    #[tokio::test]
    async fn test_cas_create_and_conflict() {
        let cache = small_cache();
        let v1 = cache
            .compare_and_swap("ns/ctr", None, Bytes::from_static(b"1"), TtlClass::Medium)
            .await
            .unwrap();
        assert_eq!(v1, 1);

        // Stale expected version fails.
        let err = cache
            .compare_and_swap("ns/ctr", None, Bytes::from_static(b"2"), TtlClass::Medium)
            .await;
        assert!(err.is_err());

        let v2 = cache
            .compare_and_swap(
                "ns/ctr",
                Some(v1),
                Bytes::from_static(b"2"),
                TtlClass::Medium,
            )
            .await
            .unwrap();
        assert_eq!(v2, 2);
        assert_eq!(
            cache.get("ns/ctr").await.unwrap().as_deref(),
            Some(&b"2"[..])
        );
    }

    #[tokio::test]
    async fn test_scan_namespace_sorted() {
        let cache = small_cache();
        for key in ["allocations/3", "allocations/1", "leases/1", "allocations/2"] {
            cache
                .set(key, Bytes::from_static(b"v"), TtlClass::Medium)
                .await
                .unwrap();
        }
        let scanned = cache.scan_namespace("allocations");
        let keys: Vec<&str> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["allocations/1", "allocations/2", "allocations/3"]);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Rec {
            id: String,
            n: u32,
        }
        let cache = small_cache();
        let rec = Rec { id: "x".into(), n: 7 };
        cache
            .set_json("ns/rec", &rec, TtlClass::Medium)
            .await
            .unwrap();
        let got: Option<Rec> = cache.get_json("ns/rec").await.unwrap();
        assert_eq!(got, Some(rec));
    }

    #[test]
    fn test_nskey() {
        assert_eq!(nskey("allocations", "a1"), "allocations/a1");
        assert_eq!(nskey("allocations/", "a1"), "allocations/a1");
    }
}
