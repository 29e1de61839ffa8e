//! Three-tier lookup: memory, then disk, then network.
//!
//! [`ImageCache::lookup`] never waits on the network. A memory hit or a
//! decodable disk entry is returned immediately; otherwise a fetch is queued
//! and the result arrives later through the [`Deliveries`] receiver returned
//! at construction, tagged with whatever the caller passed to `lookup`.
//!
//! ### Workers
//! - At most `workers` fetches run at once (tokio semaphore); the rest wait
//!   for a permit in FIFO order.
//! - Concurrent lookups of the same missing identifier each fetch.
//! - Decoding and disk writes run on the blocking pool.
//! - Failures are delivered once and never retried.
//!
//! ### Tier consistency
//! The memory tier is keyed by identifier, the disk tier by
//! [`derive_key`]. No lock spans both; a value may sit in one tier and
//! not the other. Disk persistence is best-effort: a fetched value is
//! delivered and kept in memory even if the disk write fails.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use pixcache_core::{AppConfig, DiskCache, Error, MemoryCache, MemoryStats, derive_key};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::codec::Codec;
use crate::fetch::Fetcher;
use crate::router::{self, Deliveries, Router};

/// Construction parameters for [`ImageCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub directory: PathBuf,
    pub app_version: u32,
    /// Must be 1; the encoded value is the entry's only file.
    pub values_per_entry: usize,
    pub memory_max_bytes: usize,
    pub disk_max_bytes: u64,
    pub workers: usize,
}

impl From<&AppConfig> for CacheOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            directory: config.cache_dir.clone(),
            app_version: config.app_version,
            values_per_entry: config.values_per_entry,
            memory_max_bytes: config.memory_max_bytes,
            disk_max_bytes: config.disk_max_bytes,
            workers: config.workers,
        }
    }
}

/// Outcome of a non-blocking lookup.
#[derive(Debug)]
pub enum Lookup<V> {
    /// Found in memory or on disk.
    Ready(Arc<V>),
    /// A fetch was queued; watch the deliveries for the lookup's tag.
    Pending,
}

impl<V> Lookup<V> {
    pub fn ready(self) -> Option<Arc<V>> {
        match self {
            Lookup::Ready(value) => Some(value),
            Lookup::Pending => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Lookup::Pending)
    }
}

/// Counters across all three tiers.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub memory: MemoryStats,
    pub disk_size: u64,
    pub disk_max_size: u64,
    pub disk_entries: usize,
    pub disk_hits: u64,
    pub fetches_started: u64,
    pub fetches_succeeded: u64,
    pub fetches_failed: u64,
    pub fetches_in_flight: usize,
}

#[derive(Default)]
struct FetchCounters {
    disk_hits: AtomicU64,
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

struct Inner<C: Codec> {
    memory: MemoryCache<String, Arc<C::Value>>,
    disk: DiskCache,
    codec: Arc<C>,
    fetcher: Arc<dyn Fetcher>,
    permits: Arc<Semaphore>,
    workers: usize,
    router: Router<C::Value>,
    runtime: Handle,
    counters: FetchCounters,
}

/// Memory, disk and network tiers behind one lookup call.
///
/// Cheap to clone; clones share every tier.
pub struct ImageCache<C: Codec> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Clone for ImageCache<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: Codec> ImageCache<C> {
    /// Open the disk tier and start accepting lookups.
    ///
    /// Must be called from within a tokio runtime; fetches are spawned onto
    /// it.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for zero budgets or workers, or when no
    /// runtime is available, and `Error::Io` if the disk cache cannot be
    /// opened.
    pub fn open(
        options: &CacheOptions, codec: C, fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, Deliveries<C::Value>), Error> {
        if options.workers == 0 {
            return Err(Error::InvalidConfig("workers must be greater than 0".into()));
        }
        if options.values_per_entry != 1 {
            return Err(Error::InvalidConfig(format!(
                "image cache stores one value per entry, got values_per_entry = {}",
                options.values_per_entry
            )));
        }
        let runtime = Handle::try_current()
            .map_err(|e| Error::InvalidConfig(format!("image cache requires a tokio runtime: {e}")))?;

        let codec = Arc::new(codec);
        let sizer = Arc::clone(&codec);
        let memory = MemoryCache::builder(options.memory_max_bytes)
            .size_of(move |_identifier: &String, value: &Arc<C::Value>| sizer.size_of(value))
            .on_removed(|evicted, identifier: &String, _old: &Arc<C::Value>, _new: Option<&Arc<C::Value>>| {
                if evicted {
                    tracing::trace!(identifier = %identifier, "evicted from memory");
                }
            })
            .build()?;
        let disk = DiskCache::open(&options.directory, options.app_version, 1, options.disk_max_bytes)?;

        let (router, deliveries) = router::channel();
        let inner = Inner {
            memory,
            disk,
            codec,
            fetcher,
            permits: Arc::new(Semaphore::new(options.workers)),
            workers: options.workers,
            router,
            runtime,
            counters: FetchCounters::default(),
        };
        Ok((Self { inner: Arc::new(inner) }, deliveries))
    }

    /// Resolve `identifier` without waiting on the network.
    ///
    /// May block briefly on disk I/O. On [`Lookup::Pending`] exactly one
    /// delivery tagged `tag` will follow.
    pub fn lookup(&self, identifier: &str, tag: impl Into<String>) -> Lookup<C::Value> {
        let inner = &self.inner;
        if let Some(value) = inner.memory.get(identifier) {
            tracing::debug!(identifier, tier = "memory", "hit");
            return Lookup::Ready(value);
        }

        if let Some(value) = inner.read_disk(identifier) {
            inner.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
            inner.memory.put(identifier.to_string(), Arc::clone(&value));
            tracing::debug!(identifier, tier = "disk", "hit");
            return Lookup::Ready(value);
        }

        tracing::debug!(identifier, tier = "network", "queueing fetch");
        let worker = Arc::clone(inner);
        let identifier = identifier.to_string();
        let tag = tag.into();
        inner.runtime.spawn(Inner::run_fetch(worker, identifier, tag));
        Lookup::Pending
    }

    /// Force buffered disk journal lines to durable storage.
    pub fn flush(&self) -> Result<(), Error> {
        self.inner.disk.flush()
    }

    /// Stop accepting fetches and close the disk tier.
    ///
    /// Fetches still waiting for a worker are delivered as failures; ones
    /// already running complete but are not persisted.
    pub fn close(&self) -> Result<(), Error> {
        self.inner.permits.close();
        self.inner.disk.close()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        CacheStats {
            memory: inner.memory.stats(),
            disk_size: inner.disk.size(),
            disk_max_size: inner.disk.max_size(),
            disk_entries: inner.disk.len(),
            disk_hits: inner.counters.disk_hits.load(Ordering::Relaxed),
            fetches_started: inner.counters.started.load(Ordering::Relaxed),
            fetches_succeeded: inner.counters.succeeded.load(Ordering::Relaxed),
            fetches_failed: inner.counters.failed.load(Ordering::Relaxed),
            fetches_in_flight: inner.workers.saturating_sub(inner.permits.available_permits()),
        }
    }

    pub fn memory(&self) -> &MemoryCache<String, Arc<C::Value>> {
        &self.inner.memory
    }

    pub fn disk(&self) -> &DiskCache {
        &self.inner.disk
    }
}

impl<C: Codec> Inner<C> {
    /// Decoded disk entry for `identifier`, if present and readable.
    ///
    /// An entry that cannot be decoded is removed so the next fetch can
    /// replace it.
    fn read_disk(&self, identifier: &str) -> Option<Arc<C::Value>> {
        let key = derive_key(identifier);
        let mut snapshot = match self.disk.get(&key) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(identifier, key = %key, error = %e, "disk lookup failed; treating as miss");
                return None;
            }
        };

        match snapshot.read_to_vec(0).and_then(|bytes| self.codec.decode(&bytes)) {
            Ok(value) => Some(Arc::new(value)),
            Err(e) => {
                tracing::warn!(identifier, key = %key, error = %e, "unreadable disk entry; removing");
                drop(snapshot);
                if let Err(e) = self.disk.remove(&key) {
                    tracing::debug!(key = %key, error = %e, "failed to remove unreadable disk entry");
                }
                None
            }
        }
    }

    async fn run_fetch(inner: Arc<Self>, identifier: String, tag: String) {
        let Ok(_permit) = Arc::clone(&inner.permits).acquire_owned().await else {
            inner.router.deliver(tag, identifier, Err(Error::Closed));
            return;
        };
        inner.counters.started.fetch_add(1, Ordering::Relaxed);

        let result = Self::fetch_and_store(Arc::clone(&inner), &identifier).await;
        match &result {
            Ok(_) => {
                inner.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(identifier = %identifier, error = %e, "fetch failed");
            }
        }
        inner.router.deliver(tag, identifier, result);
    }

    async fn fetch_and_store(inner: Arc<Self>, identifier: &str) -> Result<Arc<C::Value>, Error> {
        let bytes = inner.fetcher.fetch(identifier).await?;
        let identifier = identifier.to_string();
        tokio::task::spawn_blocking(move || inner.store(&identifier, &bytes))
            .await
            .map_err(|e| Error::DecodeFailed(format!("decode task failed: {e}")))?
    }

    /// Decode fetched bytes into memory, then persist best-effort.
    fn store(&self, identifier: &str, bytes: &[u8]) -> Result<Arc<C::Value>, Error> {
        let value = Arc::new(self.codec.decode(bytes)?);
        self.memory.put(identifier.to_string(), Arc::clone(&value));
        if let Err(e) = self.persist(identifier, &value) {
            tracing::warn!(identifier = %identifier, error = %e, "disk write skipped");
        }
        Ok(value)
    }

    fn persist(&self, identifier: &str, value: &C::Value) -> Result<(), Error> {
        let encoded = self.codec.encode(value)?;
        let mut editor = self.disk.edit(&derive_key(identifier))?;
        editor.set(0, &encoded)?;
        editor.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;

    use crate::codec::BytesCodec;
    use crate::router::Delivery;

    /// Serves canned bodies; unknown identifiers answer 404.
    #[derive(Default)]
    struct FakeFetcher {
        bodies: HashMap<String, Bytes>,
        delay: Duration,
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl FakeFetcher {
        fn with<B: AsRef<[u8]>>(bodies: &[(&str, B)]) -> Self {
            let bodies =
                bodies.iter().map(|(id, body)| (id.to_string(), Bytes::copy_from_slice(body.as_ref()))).collect();
            Self { bodies, ..Self::default() }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, identifier: &str) -> Result<Bytes, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            self.bodies.get(identifier).cloned().ok_or_else(|| Error::HttpError("status 404".into()))
        }
    }

    /// Only accepts UTF-8 payloads; lets tests produce undecodable entries.
    struct Utf8Codec;

    impl Codec for Utf8Codec {
        type Value = String;

        fn decode(&self, bytes: &[u8]) -> Result<String, Error> {
            String::from_utf8(bytes.to_vec()).map_err(|e| Error::DecodeFailed(e.to_string()))
        }

        fn encode(&self, value: &String) -> Result<Vec<u8>, Error> {
            Ok(value.as_bytes().to_vec())
        }

        fn size_of(&self, value: &String) -> usize {
            value.len()
        }
    }

    fn options(dir: &TempDir, workers: usize) -> CacheOptions {
        CacheOptions {
            directory: dir.path().to_path_buf(),
            app_version: 1,
            values_per_entry: 1,
            memory_max_bytes: 1024,
            disk_max_bytes: 4096,
            workers,
        }
    }

    async fn next<V>(deliveries: &mut Deliveries<V>) -> Delivery<V> {
        tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
            .await
            .expect("delivery timed out")
            .expect("router closed")
    }

    #[tokio::test]
    async fn test_miss_fetches_then_hits_memory() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::with(&[("https://img/a.jpg", b"AAAA")]));
        let (cache, mut deliveries) = ImageCache::open(&options(&dir, 2), BytesCodec, fetcher.clone()).unwrap();

        assert!(cache.lookup("https://img/a.jpg", "row-7").is_pending());
        let delivery = next(&mut deliveries).await;
        assert_eq!(delivery.tag, "row-7");
        assert_eq!(delivery.identifier, "https://img/a.jpg");
        assert_eq!(*delivery.result.unwrap(), Bytes::from_static(b"AAAA"));

        let value = cache.lookup("https://img/a.jpg", "row-7").ready().unwrap();
        assert_eq!(*value, Bytes::from_static(b"AAAA"));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.memory().size(), 4);
        assert!(cache.disk().get(&derive_key("https://img/a.jpg")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disk_hit_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let fetcher = Arc::new(FakeFetcher::with(&[("a", b"persisted")]));
            let (cache, mut deliveries) = ImageCache::open(&options(&dir, 1), BytesCodec, fetcher).unwrap();
            cache.lookup("a", "t");
            assert!(next(&mut deliveries).await.is_success());
            cache.close().unwrap();
        }

        let fetcher = Arc::new(FakeFetcher::default());
        let (cache, _deliveries) = ImageCache::open(&options(&dir, 1), BytesCodec, fetcher.clone()).unwrap();
        let value = cache.lookup("a", "t").ready().unwrap();

        assert_eq!(*value, Bytes::from_static(b"persisted"));
        assert_eq!(fetcher.calls(), 0);
        assert!(cache.memory().contains("a"));
        assert_eq!(cache.stats().disk_hits, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_delivered_and_not_cached() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let (cache, mut deliveries) = ImageCache::open(&options(&dir, 2), BytesCodec, fetcher.clone()).unwrap();

        assert!(cache.lookup("missing", "t1").is_pending());
        let delivery = next(&mut deliveries).await;
        assert_eq!(delivery.tag, "t1");
        assert!(matches!(delivery.result, Err(Error::HttpError(_))));

        assert!(cache.lookup("missing", "t2").is_pending());
        assert!(!next(&mut deliveries).await.is_success());
        assert_eq!(fetcher.calls(), 2);
        assert!(cache.disk().is_empty());

        let stats = cache.stats();
        assert_eq!((stats.fetches_started, stats.fetches_failed, stats.fetches_succeeded), (2, 2, 0));
    }

    #[tokio::test]
    async fn test_undecodable_fetch_reports_decode_failure() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::with(&[("bad", b"\xff\xfe\x00")]));
        let (cache, mut deliveries) = ImageCache::open(&options(&dir, 1), Utf8Codec, fetcher).unwrap();

        cache.lookup("bad", "t");
        assert!(matches!(next(&mut deliveries).await.result, Err(Error::DecodeFailed(_))));
        assert!(!cache.memory().contains("bad"));
        assert!(cache.disk().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_disk_entry_is_refetched() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::with(&[("pic", b"fresh")]));
        let (cache, mut deliveries) = ImageCache::open(&options(&dir, 1), Utf8Codec, fetcher.clone()).unwrap();

        let key = derive_key("pic");
        let mut editor = cache.disk().edit(&key).unwrap();
        editor.set(0, &[0xc3, 0x28]).unwrap();
        editor.commit().unwrap();

        assert!(cache.lookup("pic", "t").is_pending());
        assert_eq!(next(&mut deliveries).await.result.unwrap().as_str(), "fresh");
        assert_eq!(fetcher.calls(), 1);

        let mut snapshot = cache.disk().get(&key).unwrap().unwrap();
        assert_eq!(snapshot.read_to_vec(0).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_disk_write_failure_keeps_memory_value() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::with(&[("a", b"value")]));
        let (cache, mut deliveries) = ImageCache::open(&options(&dir, 1), BytesCodec, fetcher).unwrap();

        let blocker = cache.disk().edit(&derive_key("a")).unwrap();
        cache.lookup("a", "t");
        assert!(next(&mut deliveries).await.is_success());
        blocker.abort().unwrap();

        assert!(cache.memory().contains("a"));
        assert!(cache.disk().get(&derive_key("a")).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fetch_concurrency_is_bounded() {
        let dir = TempDir::new().unwrap();
        let ids: Vec<String> = (0..8).map(|i| format!("img-{i}")).collect();
        let bodies: Vec<(&str, &[u8])> = ids.iter().map(|id| (id.as_str(), b"px".as_slice())).collect();
        let fetcher = Arc::new(FakeFetcher::with(&bodies).delayed(Duration::from_millis(30)));
        let (cache, mut deliveries) = ImageCache::open(&options(&dir, 2), BytesCodec, fetcher.clone()).unwrap();

        for (i, id) in ids.iter().enumerate() {
            assert!(cache.lookup(id, i.to_string()).is_pending());
        }
        let mut delivered = 0;
        for _ in 0..ids.len() {
            if next(&mut deliveries).await.is_success() {
                delivered += 1;
            }
        }

        assert_eq!(delivered, 8);
        assert_eq!(fetcher.calls(), 8);
        assert!(fetcher.max_running.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_are_not_deduplicated() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::with(&[("same", b"x")]).delayed(Duration::from_millis(20)));
        let (cache, mut deliveries) = ImageCache::open(&options(&dir, 2), BytesCodec, fetcher.clone()).unwrap();

        assert!(cache.lookup("same", "first").is_pending());
        assert!(cache.lookup("same", "second").is_pending());

        let mut tags = vec![next(&mut deliveries).await.tag, next(&mut deliveries).await.tag];
        tags.sort();
        assert_eq!(tags, ["first", "second"]);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_closed_cache_fails_queued_fetches() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::with(&[("a", b"1")]));
        let (cache, mut deliveries) = ImageCache::open(&options(&dir, 1), BytesCodec, fetcher.clone()).unwrap();

        cache.close().unwrap();
        assert!(cache.lookup("a", "t").is_pending());
        assert!(matches!(next(&mut deliveries).await.result, Err(Error::Closed)));
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn test_open_requires_runtime() {
        let dir = TempDir::new().unwrap();
        let result = ImageCache::open(&options(&dir, 1), BytesCodec, Arc::new(FakeFetcher::default()));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_open_rejects_zero_workers() {
        let dir = TempDir::new().unwrap();
        let result = ImageCache::open(&options(&dir, 0), BytesCodec, Arc::new(FakeFetcher::default()));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_open_rejects_multiple_values_per_entry() {
        let dir = TempDir::new().unwrap();
        let options = CacheOptions { values_per_entry: 2, ..options(&dir, 1) };
        let result = ImageCache::open(&options, BytesCodec, Arc::new(FakeFetcher::default()));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_options_from_config() {
        let config = AppConfig { workers: 3, disk_max_bytes: 77, ..Default::default() };
        let options = CacheOptions::from(&config);
        assert_eq!(options.workers, 3);
        assert_eq!(options.disk_max_bytes, 77);
        assert_eq!(options.directory, config.cache_dir);
    }
}
