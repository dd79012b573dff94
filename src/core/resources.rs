//! Shared limits for all concurrent I/O: a bounded worker pool, a socket lease
//! pool and a TTL cache for scan results.
//!
//! Every scanner task runs through `submit`, every outbound probe connection
//! holds a `SocketLease`, and repeated scans of the same subnet are answered
//! from the cache until the entry expires.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ResourceConfig;
use crate::discovery::Device;
use crate::error::{CoreError, CoreResult};

/// A cached device list and the instant it was stored.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub devices: Vec<Device>,
    pub stored_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() > ttl
    }
}

/// Owns the worker pool, socket pool and scan cache.
pub struct ResourceManager {
    config: ResourceConfig,
    workers: Arc<Semaphore>,
    worker_capacity: usize,
    sockets: Arc<Semaphore>,
    on_demand: Arc<AtomicUsize>,
    live: Arc<DashMap<u64, Option<SocketAddr>>>,
    next_lease_id: AtomicU64,
    cache: RwLock<HashMap<String, CacheEntry>>,
    closed: AtomicBool,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig) -> Self {
        let worker_capacity = config.effective_pool_size();
        let socket_capacity = config.socket_pool_capacity;
        tracing::debug!(
            "Resource manager: {worker_capacity} workers, {socket_capacity} sockets, cache TTL {}s",
            config.cache_ttl_secs
        );
        Self {
            workers: Arc::new(Semaphore::new(worker_capacity)),
            worker_capacity,
            sockets: Arc::new(Semaphore::new(socket_capacity)),
            on_demand: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(DashMap::new()),
            next_lease_id: AtomicU64::new(1),
            cache: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Run `task` once a worker slot is free. Work beyond capacity queues.
    pub fn submit<F, T>(&self, task: F) -> JoinHandle<CoreResult<T>>
    where
        F: Future<Output = CoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .map_err(|_| CoreError::ResourceExhausted("worker pool is closed".into()))?;
            task.await
        })
    }

    /// Lease a socket slot.
    ///
    /// When the pool is exhausted the call waits up to the configured bound,
    /// then falls back to an on-demand lease. On-demand leases are capped at
    /// the pool capacity; past that the call fails with `ResourceExhausted`.
    pub async fn acquire_socket(&self) -> CoreResult<SocketLease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::ResourceExhausted("socket pool is closed".into()));
        }

        let slot = match Arc::clone(&self.sockets).try_acquire_owned() {
            Ok(permit) => LeaseSlot::Pooled(permit),
            Err(TryAcquireError::Closed) => {
                return Err(CoreError::ResourceExhausted("socket pool is closed".into()))
            }
            Err(TryAcquireError::NoPermits) => {
                let wait = self.config.socket_wait();
                match tokio::time::timeout(wait, Arc::clone(&self.sockets).acquire_owned()).await {
                    Ok(Ok(permit)) => LeaseSlot::Pooled(permit),
                    Ok(Err(_)) => {
                        return Err(CoreError::ResourceExhausted("socket pool is closed".into()))
                    }
                    Err(_) => self.on_demand_slot()?,
                }
            }
        };

        let id = self.next_lease_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, None);
        Ok(SocketLease {
            id,
            _slot: slot,
            stream: None,
            live: Arc::clone(&self.live),
        })
    }

    fn on_demand_slot(&self) -> CoreResult<LeaseSlot> {
        let cap = self.config.socket_pool_capacity;
        let previous = self.on_demand.fetch_add(1, Ordering::SeqCst);
        if previous >= cap {
            self.on_demand.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::ResourceExhausted(format!(
                "socket pool exhausted ({cap} pooled + {cap} on-demand leases in use)"
            )));
        }
        tracing::debug!("Socket pool exhausted, created on-demand lease ({})", previous + 1);
        Ok(LeaseSlot::OnDemand(OnDemandGuard(Arc::clone(&self.on_demand))))
    }

    /// Cached device list for `key`, or `None` on miss. Expired entries are evicted.
    pub fn get_cached(&self, key: &str) -> Option<Vec<Device>> {
        let ttl = self.config.cache_ttl();
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            match cache.get(key) {
                Some(entry) if !entry.is_expired(ttl) => return Some(entry.devices.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if cache.get(key).is_some_and(|e| e.is_expired(ttl)) {
            cache.remove(key);
            tracing::debug!("Evicted expired cache entry '{key}'");
        }
        None
    }

    pub fn put_cached(&self, key: impl Into<String>, devices: Vec<Device>) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            key.into(),
            CacheEntry {
                devices,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate_cache(&self) {
        self.cache.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of leases currently held (pooled and on-demand).
    pub fn live_sockets(&self) -> usize {
        self.live.len()
    }

    pub fn worker_capacity(&self) -> usize {
        self.worker_capacity
    }

    /// Worker slots not currently in use.
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Close both pools and drop the cache. Outstanding leases stay valid
    /// until dropped; new submissions and leases fail.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.workers.close();
        self.sockets.close();
        self.invalidate_cache();
        tracing::info!("Resource manager closed ({} leases outstanding)", self.live.len());
    }
}

enum LeaseSlot {
    Pooled(OwnedSemaphorePermit),
    OnDemand(OnDemandGuard),
}

struct OnDemandGuard(Arc<AtomicUsize>);

impl Drop for OnDemandGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A leased socket slot. Owns at most one TCP stream, closed on drop.
pub struct SocketLease {
    id: u64,
    _slot: LeaseSlot,
    stream: Option<TcpStream>,
    live: Arc<DashMap<u64, Option<SocketAddr>>>,
}

impl SocketLease {
    /// Connect the leased socket to `addr`, replacing any previous stream.
    /// Returns the connect latency. A timeout surfaces as `ErrorKind::TimedOut`.
    pub async fn connect(
        &mut self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> std::io::Result<Duration> {
        self.stream = None;
        let started = Instant::now();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))
            })??;
        self.stream = Some(stream);
        if let Some(mut entry) = self.live.get_mut(&self.id) {
            *entry = Some(addr);
        }
        Ok(started.elapsed())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_on_demand(&self) -> bool {
        matches!(self._slot, LeaseSlot::OnDemand(_))
    }
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        self.stream = None;
        self.live.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn manager(workers: usize, sockets: usize) -> ResourceManager {
        ResourceManager::new(ResourceConfig {
            worker_pool_size: workers,
            socket_pool_capacity: sockets,
            socket_wait_ms: 50,
            cache_ttl_secs: 60,
        })
    }

    fn device(last_octet: u8) -> Device {
        Device::new(Ipv4Addr::new(192, 168, 1, last_octet))
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_bounds_concurrency() {
        let rm = manager(5, 50);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                rm.submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 5);
        assert_eq!(rm.idle_workers(), 5);
    }

    #[test]
    fn test_worker_capacity_is_clamped() {
        assert_eq!(manager(2, 1).worker_capacity(), 5);
        assert_eq!(manager(64, 1).worker_capacity(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_falls_back_to_on_demand_then_fails() {
        let rm = manager(5, 1);

        let first = rm.acquire_socket().await.unwrap();
        assert!(!first.is_on_demand());

        let second = rm.acquire_socket().await.unwrap();
        assert!(second.is_on_demand());
        assert_eq!(rm.live_sockets(), 2);

        let third = rm.acquire_socket().await;
        assert!(matches!(third, Err(CoreError::ResourceExhausted(_))));

        drop(second);
        assert_eq!(rm.live_sockets(), 1);
        let again = rm.acquire_socket().await.unwrap();
        assert!(again.is_on_demand());
        drop(again);
        drop(first);
        assert_eq!(rm.live_sockets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_acquire_gets_released_permit() {
        let rm = Arc::new(manager(5, 1));
        let held = rm.acquire_socket().await.unwrap();

        let rm2 = Arc::clone(&rm);
        let waiter = tokio::spawn(async move { rm2.acquire_socket().await.map(|l| l.is_on_demand()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert!(!waiter.await.unwrap().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_then_expiry_evicts() {
        let rm = manager(5, 5);
        rm.put_cached("192.168.1|quick", vec![device(1), device(2)]);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(rm.get_cached("192.168.1|quick").unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(rm.get_cached("192.168.1|quick").is_none());
        assert!(rm.cache.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_cache_clears_entries() {
        let rm = manager(5, 5);
        rm.put_cached("a", vec![device(3)]);
        rm.put_cached("b", vec![]);
        rm.invalidate_cache();
        assert!(rm.get_cached("a").is_none());
        assert!(rm.get_cached("b").is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_new_work() {
        let rm = manager(5, 5);
        rm.put_cached("a", vec![device(3)]);
        rm.close();

        let result = rm.submit(async { Ok(1) }).await.unwrap();
        assert!(matches!(result, Err(CoreError::ResourceExhausted(_))));
        assert!(rm.acquire_socket().await.is_err());
        assert!(rm.get_cached("a").is_none());
    }

    #[tokio::test]
    async fn test_lease_connect_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let rm = manager(5, 5);

        let mut lease = rm.acquire_socket().await.unwrap();
        lease.connect(addr, Duration::from_secs(1)).await.unwrap();
        assert!(lease.is_connected());
        assert_eq!(*rm.live.get(&lease.id).unwrap(), Some(addr));
    }
}
