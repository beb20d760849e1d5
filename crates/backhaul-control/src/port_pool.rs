//! Port pool for forwards that ask the relay to pick their public port
//!
//! The pool is the set of ports in the configured range that could be bound
//! when the relay started. Assignments are remembered per forward name in a
//! [`KeyValueCache`], so a client that reconnects gets the same port back.

use crate::cache::KeyValueCache;
use crate::registry::ForwardEvent;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a temporary reservation is held
pub const TEMPORARY_TTL: Duration = Duration::from_secs(15 * 60);

const KEY_PREFIX: &str = "port:";

/// Inclusive port range probed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPoolConfig {
    pub min: u16,
    pub max: u16,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            min: 4000,
            max: 65535,
        }
    }
}

impl PortPoolConfig {
    /// The configured range, or the default one if it is unusable
    pub fn validated(self) -> Self {
        if self.min == 0 || self.min > self.max {
            warn!(
                "Invalid port pool range {}-{}, using default",
                self.min, self.max
            );
            return Self::default();
        }
        self
    }
}

fn cache_key(name: &str) -> String {
    format!("{}{}", KEY_PREFIX, name)
}

/// Check whether a port can currently be bound on all interfaces
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Ports in `min..=max` that can currently be bound
pub fn probe_range(min: u16, max: u16) -> BTreeSet<u16> {
    (min..=max).filter(|port| is_port_available(*port)).collect()
}

pub struct PortPool {
    available: Mutex<BTreeSet<u16>>,
    /// Name -> port for assignments made or seen by this process
    assigned: Mutex<HashMap<String, u16>>,
    cache: Arc<dyn KeyValueCache>,
}

impl PortPool {
    /// Build a pool from an explicit set of ports
    pub fn from_ports(ports: impl IntoIterator<Item = u16>, cache: Arc<dyn KeyValueCache>) -> Self {
        Self {
            available: Mutex::new(ports.into_iter().collect()),
            assigned: Mutex::new(HashMap::new()),
            cache,
        }
    }

    /// Probe the configured range and build a pool of the bindable ports
    pub async fn scan(config: PortPoolConfig, cache: Arc<dyn KeyValueCache>) -> Self {
        let config = config.validated();
        let (min, max) = (config.min, config.max);

        let available = tokio::task::spawn_blocking(move || probe_range(min, max))
            .await
            .unwrap_or_default();

        let total = usize::from(max - min) + 1;
        info!(
            "Port pool {}-{}: {} ports available",
            min,
            max,
            available.len()
        );
        if available.len() < total {
            let unavailable: Vec<u16> = (min..=max).filter(|p| !available.contains(p)).collect();
            debug!("Ports in use at startup: {:?}", unavailable);
        }

        Self::from_ports(available, cache)
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Port previously assigned to `name`, if any
    pub async fn get_assigned_port(&self, name: &str) -> Option<u16> {
        let port = self.cache.get(&cache_key(name)).await?.parse::<u16>().ok()?;
        if let Ok(mut assigned) = self.assigned.lock() {
            assigned.insert(name.to_string(), port);
        }
        Some(port)
    }

    /// Pick a uniformly random pool port that is neither assigned nor bound
    pub fn allocate_random_free_port(&self) -> Option<u16> {
        let taken: BTreeSet<u16> = self
            .assigned
            .lock()
            .map(|a| a.values().copied().collect())
            .unwrap_or_default();

        let mut available = self.available.lock().ok()?;
        let mut rng = rand::thread_rng();

        loop {
            let port = available
                .iter()
                .filter(|port| !taken.contains(port))
                .choose(&mut rng)
                .copied()?;

            if is_port_available(port) {
                return Some(port);
            }

            // Bound since startup; stop offering it
            debug!("Port {} is no longer free, dropping it from the pool", port);
            available.remove(&port);
        }
    }

    /// Choose the public port for a forward that left the choice to the relay.
    ///
    /// A named forward gets its previous port back unless `in_use` reports it
    /// taken. Otherwise a random free port is picked and, for a named
    /// forward, reserved for [`TEMPORARY_TTL`] until the forward is
    /// registered and the assignment becomes permanent.
    pub async fn assign(&self, name: Option<&str>, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        if let Some(name) = name {
            if let Some(port) = self.get_assigned_port(name).await {
                if !in_use(port) {
                    return Some(port);
                }
                debug!("Port {} assigned to {} is taken, picking another", port, name);
            }
        }

        let port = self.allocate_random_free_port()?;
        if let Some(name) = name {
            self.persist_temporary(name, port).await;
        }
        Some(port)
    }

    /// Remember `port` for `name` with no expiry
    pub async fn persist(&self, name: &str, port: u16) {
        self.remember(name, port);
        self.cache.set(&cache_key(name), port.to_string(), None).await;
        info!("Port {} assigned to {}", port, name);
    }

    /// Remember `port` for `name` for [`TEMPORARY_TTL`]
    pub async fn persist_temporary(&self, name: &str, port: u16) {
        self.remember(name, port);
        self.cache
            .set(&cache_key(name), port.to_string(), Some(TEMPORARY_TTL))
            .await;
        debug!("Port {} reserved for {} for {:?}", port, name, TEMPORARY_TTL);
    }

    /// Forget the assignment for `name`
    pub async fn release(&self, name: &str) {
        if let Ok(mut assigned) = self.assigned.lock() {
            assigned.remove(name);
        }
        self.cache.remove(&cache_key(name)).await;
        info!("Port assignment for {} released", name);
    }

    fn remember(&self, name: &str, port: u16) {
        if let Ok(mut assigned) = self.assigned.lock() {
            assigned.insert(name.to_string(), port);
        }
    }

    /// Apply a registry forward event
    pub async fn handle_event(&self, event: ForwardEvent) {
        match event {
            ForwardEvent::Added {
                name: Some(name),
                port,
            } => self.persist(&name, port).await,
            ForwardEvent::Removed {
                name: Some(name), ..
            } => self.release(&name).await,
            ForwardEvent::Added { name: None, .. } | ForwardEvent::Removed { name: None, .. } => {}
        }
    }

    /// Follow registry forward events until the registry goes away
    pub fn spawn_event_listener(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ForwardEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Port pool missed {} forward events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::registry::SessionRegistry;

    fn free_ports(count: usize) -> Vec<u16> {
        // Let the OS hand out ports, then release them
        let listeners: Vec<std::net::TcpListener> = (0..count)
            .map(|_| std::net::TcpListener::bind("0.0.0.0:0").unwrap())
            .collect();
        listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect()
    }

    #[test]
    fn test_config_validation() {
        let bad = PortPoolConfig { min: 5000, max: 4000 };
        assert_eq!(bad.validated(), PortPoolConfig::default());

        let good = PortPoolConfig { min: 10000, max: 10010 };
        assert_eq!(good.validated(), good);
    }

    #[tokio::test]
    async fn test_persist_and_lookup() {
        let cache = Arc::new(MemoryCache::new());
        let pool = PortPool::from_ports(free_ports(2), cache.clone());

        assert_eq!(pool.get_assigned_port("ssh").await, None);
        pool.persist("ssh", 9022).await;
        assert_eq!(pool.get_assigned_port("ssh").await, Some(9022));

        pool.release("ssh").await;
        assert_eq!(pool.get_assigned_port("ssh").await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_allocation_skips_assigned_ports() {
        let ports = free_ports(2);
        let pool = PortPool::from_ports(ports.clone(), Arc::new(MemoryCache::new()));

        pool.persist("first", ports[0]).await;
        for _ in 0..10 {
            assert_eq!(pool.allocate_random_free_port(), Some(ports[1]));
        }

        pool.persist("second", ports[1]).await;
        assert_eq!(pool.allocate_random_free_port(), None);
    }

    #[tokio::test]
    async fn test_allocation_skips_bound_ports() {
        let holder = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let busy = holder.local_addr().unwrap().port();
        let pool = PortPool::from_ports(vec![busy], Arc::new(MemoryCache::new()));

        assert_eq!(pool.allocate_random_free_port(), None);
        assert_eq!(pool.available_count(), 0);
    }

    #[tokio::test]
    async fn test_events_drive_persistence() {
        let registry = SessionRegistry::new();
        let cache = Arc::new(MemoryCache::new());
        let pool = Arc::new(PortPool::from_ports(Vec::new(), cache.clone()));
        let task = pool.clone().spawn_event_listener(registry.subscribe());

        pool.handle_event(ForwardEvent::Added {
            name: Some("db".to_string()),
            port: 15432,
        })
        .await;
        assert_eq!(cache.get("port:db").await.as_deref(), Some("15432"));

        pool.handle_event(ForwardEvent::Removed {
            name: Some("db".to_string()),
            port: 15432,
        })
        .await;
        assert_eq!(cache.get("port:db").await, None);

        drop(registry);
        task.await.unwrap();
    }

    /// Cache that records the expiry each key was stored with
    #[derive(Default)]
    struct RecordingCache {
        inner: MemoryCache,
        ttls: Mutex<HashMap<String, Option<Duration>>>,
    }

    #[async_trait::async_trait]
    impl KeyValueCache for RecordingCache {
        async fn get(&self, key: &str) -> Option<String> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
            self.ttls.lock().unwrap().insert(key.to_string(), ttl);
            self.inner.set(key, value, ttl).await;
        }

        async fn remove(&self, key: &str) {
            self.inner.remove(key).await;
        }
    }

    #[tokio::test]
    async fn test_assign_reserves_random_port_for_named_forward() {
        let ports = free_ports(1);
        let cache = Arc::new(RecordingCache::default());
        let pool = PortPool::from_ports(ports.clone(), cache.clone());

        assert_eq!(pool.assign(Some("web"), |_| false).await, Some(ports[0]));
        assert_eq!(pool.get_assigned_port("web").await, Some(ports[0]));
        assert_eq!(
            cache.ttls.lock().unwrap().get("port:web"),
            Some(&Some(TEMPORARY_TTL))
        );

        // Registration makes it permanent
        pool.handle_event(ForwardEvent::Added {
            name: Some("web".to_string()),
            port: ports[0],
        })
        .await;
        assert_eq!(cache.ttls.lock().unwrap().get("port:web"), Some(&None));
    }

    #[tokio::test]
    async fn test_assign_reuses_previous_port() {
        let ports = free_ports(2);
        let pool = PortPool::from_ports(ports.clone(), Arc::new(MemoryCache::new()));
        pool.persist("ssh", ports[1]).await;

        assert_eq!(pool.assign(Some("ssh"), |_| false).await, Some(ports[1]));
        // Taken by another live forward: fall back to a free one
        assert_eq!(
            pool.assign(Some("ssh"), |port| port == ports[1]).await,
            Some(ports[0])
        );
    }

    #[tokio::test]
    async fn test_assign_unnamed_is_not_remembered() {
        let ports = free_ports(1);
        let cache = Arc::new(MemoryCache::new());
        let pool = PortPool::from_ports(ports.clone(), cache.clone());

        assert_eq!(pool.assign(None, |_| false).await, Some(ports[0]));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_scan_small_range() {
        let ports = free_ports(1);
        let port = ports[0];
        let pool = PortPool::scan(
            PortPoolConfig { min: port, max: port },
            Arc::new(MemoryCache::new()),
        )
        .await;
        assert!(pool.available_count() <= 1);
    }
}
