//! Bounded, reusable collection of [`DeviceLink`]s keyed by device id.
//!
//! Each device has at most one slot. A slot is either `Connecting` (a link is
//! being opened and other acquirers wait on it) or `Ready` with a lease count.
//! Leased links are shared while they stay usable and keyed to the caller's
//! credentials; the link's own mutex serializes commands. A leased link that
//! is broken, expired or re-keyed is never handed out again: acquirers wait
//! for its leases to drain and then replace it.
//!
//! The slot map is only touched under the pool lock, and link internals are
//! never touched while holding it. Closing, probing and connecting all happen
//! after the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{LinkConfig, PoolConfig};
use crate::credentials::{CredentialResolver, Credentials};
use crate::error::NetError;
use crate::inventory::{Device, Inventory, Vendor};
use crate::link::{Connector, DeviceLink, LinkInfo, LinkTarget, vendor_link_config};

mod stats;

use stats::PoolCounters;
pub use stats::PoolStats;

enum Slot {
    Connecting(Arc<Notify>),
    Ready(Entry),
}

struct Entry {
    link: Arc<DeviceLink>,
    leases: usize,
    /// Signalled when `leases` drops to zero or the entry is evicted.
    drained: Arc<Notify>,
}

struct PoolShared {
    config: PoolConfig,
    link_config: LinkConfig,
    connector: Arc<dyn Connector>,
    resolver: Arc<CredentialResolver>,
    inventory: Arc<dyn Inventory>,
    slots: Mutex<HashMap<String, Slot>>,
    gate: Semaphore,
    counters: PoolCounters,
    started: Instant,
}

struct Loops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Link pool with idle and health sweeps.
#[derive(Clone)]
pub struct LinkPool {
    shared: Arc<PoolShared>,
    loops: Arc<Mutex<Option<Loops>>>,
}

impl LinkPool {
    pub fn new(
        config: PoolConfig,
        link_config: LinkConfig,
        connector: Arc<dyn Connector>,
        resolver: Arc<CredentialResolver>,
        inventory: Arc<dyn Inventory>,
    ) -> Self {
        let gate = Semaphore::new(config.max_concurrent_connections.max(1));
        Self {
            shared: Arc::new(PoolShared {
                config,
                link_config,
                connector,
                resolver,
                inventory,
                slots: Mutex::new(HashMap::new()),
                gate,
                counters: PoolCounters::default(),
                started: Instant::now(),
            }),
            loops: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Returns a leased link for `device`, opening one if needed.
    ///
    /// Credentials are resolved first, so a missing dynamic secret fails
    /// without touching the network. Every successful call must be paired
    /// with [`release`](Self::release).
    ///
    /// An open link is shared between lease holders only when it is usable
    /// and was opened with the caller's credentials. Otherwise the caller
    /// waits, up to `acquire_timeout`, until every lease is returned and the
    /// link can be replaced.
    pub async fn acquire(
        &self,
        device: &Device,
        user_secret: Option<&str>,
    ) -> Result<Arc<DeviceLink>, NetError> {
        let shared = &self.shared;
        PoolCounters::bump(&shared.counters.total_requests);

        let credentials = shared.resolver.resolve_device(device, user_secret).await?;
        let vendor = shared.inventory.get_vendor(&device.vendor_id).await?;
        if vendor.is_none() {
            warn!(
                "Vendor {} of device {} not found, using the generic platform",
                device.vendor_id, device.id
            );
        }

        let mut swept = false;
        loop {
            let mut slots = shared.slots.lock().await;

            let waiter = match slots.get_mut(&device.id) {
                Some(Slot::Ready(entry)) => {
                    let reusable =
                        entry.link.is_usable() && entry.link.uses_secret(&credentials);
                    if reusable {
                        entry.leases += 1;
                        PoolCounters::bump(&shared.counters.hits);
                        debug!(
                            "Pool hit for {} ({} leases)",
                            device.hostname, entry.leases
                        );
                        return Ok(entry.link.clone());
                    }
                    (entry.leases > 0).then(|| entry.drained.clone())
                }
                Some(Slot::Connecting(notify)) => Some(notify.clone()),
                None => None,
            };

            if let Some(notify) = waiter {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(slots);
                debug!("Waiting for link to {} to be opened or drained", device.hostname);
                if tokio::time::timeout(shared.config.acquire_timeout, notified)
                    .await
                    .is_err()
                {
                    return Err(NetError::PoolExhausted(format!(
                        "timed out waiting for link to {}",
                        device.hostname
                    )));
                }
                continue;
            }

            let stale = match slots.remove(&device.id) {
                Some(Slot::Ready(entry)) => Some(entry.link),
                _ => None,
            };

            if slots.len() >= shared.config.max_size {
                let size = slots.len();
                drop(slots);
                if let Some(link) = stale {
                    link.close().await;
                }
                if swept {
                    return Err(NetError::PoolExhausted(format!(
                        "{size} links held, max_size is {}",
                        shared.config.max_size
                    )));
                }
                debug!("Pool full ({size}), sweeping idle links");
                shared.sweep_idle().await;
                swept = true;
                continue;
            }

            let notify = Arc::new(Notify::new());
            slots.insert(device.id.clone(), Slot::Connecting(notify.clone()));
            drop(slots);

            if let Some(link) = stale {
                debug!(
                    "Replacing stale or re-keyed link for {}",
                    device.hostname
                );
                link.close().await;
            }
            PoolCounters::bump(&shared.counters.misses);
            return self
                .establish(device, vendor.as_ref(), credentials, notify)
                .await;
        }
    }

    async fn establish(
        &self,
        device: &Device,
        vendor: Option<&Vendor>,
        credentials: Credentials,
        notify: Arc<Notify>,
    ) -> Result<Arc<DeviceLink>, NetError> {
        let shared = &self.shared;
        let mut guard = ConnectingGuard {
            shared: shared.clone(),
            device_id: device.id.clone(),
            notify: notify.clone(),
            armed: true,
        };

        let outcome = shared.open_link(device, vendor, credentials).await;

        let mut slots = shared.slots.lock().await;
        let result = match outcome {
            Ok(link) => {
                slots.insert(
                    device.id.clone(),
                    Slot::Ready(Entry {
                        link: link.clone(),
                        leases: 1,
                        drained: Arc::new(Notify::new()),
                    }),
                );
                shared.counters.record_size(slots.len());
                info!(
                    "Opened pooled link to {} ({})",
                    device.hostname,
                    device.address()
                );
                Ok(link)
            }
            Err(err) => {
                slots.remove(&device.id);
                PoolCounters::bump(&shared.counters.connection_errors);
                warn!("Failed to open link to {}: {}", device.hostname, err);
                Err(err)
            }
        };
        drop(slots);
        guard.armed = false;
        notify.notify_waiters();
        result
    }

    /// Returns one lease. The link stays open.
    pub async fn release(&self, device_id: &str) -> bool {
        let mut slots = self.shared.slots.lock().await;
        match slots.get_mut(device_id) {
            Some(Slot::Ready(entry)) if entry.leases > 0 => {
                entry.leases -= 1;
                debug!("Released {} ({} leases left)", device_id, entry.leases);
                if entry.leases == 0 {
                    entry.drained.notify_waiters();
                }
                true
            }
            _ => false,
        }
    }

    /// Closes and evicts the device's link, leased or not.
    pub async fn remove(&self, device_id: &str) -> bool {
        let removed = {
            let mut slots = self.shared.slots.lock().await;
            match slots.get(device_id) {
                Some(Slot::Ready(_)) => match slots.remove(device_id) {
                    Some(Slot::Ready(entry)) => {
                        entry.drained.notify_waiters();
                        Some(entry.link)
                    }
                    _ => None,
                },
                _ => None,
            }
        };
        match removed {
            Some(link) => {
                link.close().await;
                debug!("Removed link for {}", device_id);
                true
            }
            None => false,
        }
    }

    /// Closes expired, broken and idle free links. Idle ones only down to `min_size`.
    pub async fn cleanup_idle(&self) -> usize {
        self.shared.sweep_idle().await
    }

    /// Probes free links and closes the ones that fail.
    pub async fn check_health(&self) -> usize {
        self.shared.sweep_health().await
    }

    /// Closes every link.
    pub async fn close_all(&self) -> usize {
        let links: Vec<Arc<DeviceLink>> = {
            let mut slots = self.shared.slots.lock().await;
            let ids: Vec<String> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| match slots.remove(id) {
                    Some(Slot::Ready(entry)) => {
                        entry.drained.notify_waiters();
                        Some(entry.link)
                    }
                    _ => None,
                })
                .collect()
        };
        for link in &links {
            link.close().await;
        }
        if !links.is_empty() {
            info!("Closed {} pooled links", links.len());
        }
        links.len()
    }

    /// Starts the idle and health sweep loops. No-op when already running.
    pub async fn start(&self) {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let config = &self.shared.config;
        let handles = vec![
            tokio::spawn(sweep_loop(
                self.shared.clone(),
                Sweep::Idle,
                config.idle_sweep_interval,
                cancel.clone(),
            )),
            tokio::spawn(sweep_loop(
                self.shared.clone(),
                Sweep::Health,
                config.health_sweep_interval,
                cancel.clone(),
            )),
        ];
        *loops = Some(Loops { cancel, handles });
        info!(
            "Link pool started, max_size {}, min_size {}",
            config.max_size, config.min_size
        );
    }

    /// Stops the sweep loops and closes every link.
    pub async fn stop(&self) {
        let loops = self.loops.lock().await.take();
        if let Some(loops) = loops {
            loops.cancel.cancel();
            for handle in loops.handles {
                let _ = handle.await;
            }
        }
        self.close_all().await;
        info!("Link pool stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.loops.lock().await.is_some()
    }

    pub async fn links(&self) -> Vec<LinkInfo> {
        let slots = self.shared.slots.lock().await;
        let mut infos: Vec<LinkInfo> = slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(entry) => Some(entry.link.info()),
                Slot::Connecting(_) => None,
            })
            .collect();
        infos.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        infos
    }

    pub async fn stats(&self) -> PoolStats {
        let running = self.is_running().await;
        let shared = &self.shared;
        let slots = shared.slots.lock().await;

        let mut by_state = BTreeMap::new();
        let (mut size, mut connecting, mut reserved) = (0, 0, 0);
        for slot in slots.values() {
            match slot {
                Slot::Connecting(_) => connecting += 1,
                Slot::Ready(entry) => {
                    size += 1;
                    if entry.leases > 0 {
                        reserved += 1;
                    }
                    *by_state
                        .entry(entry.link.state().to_string())
                        .or_insert(0) += 1;
                }
            }
        }
        drop(slots);

        let counters = &shared.counters;
        let total_requests = counters.total_requests.load(Ordering::SeqCst);
        let cache_hits = counters.hits.load(Ordering::SeqCst);
        let connection_errors = counters.connection_errors.load(Ordering::SeqCst);
        PoolStats {
            size,
            connecting,
            reserved,
            free: size - reserved,
            by_state,
            total_requests,
            cache_hits,
            cache_misses: counters.misses.load(Ordering::SeqCst),
            connection_errors,
            hit_rate: PoolStats::percentage(cache_hits, total_requests),
            error_rate: PoolStats::percentage(connection_errors, total_requests),
            peak_size: counters.peak_size.load(Ordering::SeqCst),
            uptime_secs: shared.started.elapsed().as_secs(),
            max_size: shared.config.max_size,
            min_size: shared.config.min_size,
            max_concurrent_connections: shared.config.max_concurrent_connections,
            available_permits: shared.gate.available_permits(),
            running,
        }
    }
}

impl PoolShared {
    /// Opens a new link while holding a connection gate permit.
    async fn open_link(
        &self,
        device: &Device,
        vendor: Option<&Vendor>,
        credentials: Credentials,
    ) -> Result<Arc<DeviceLink>, NetError> {
        let permit = match tokio::time::timeout(self.config.acquire_timeout, self.gate.acquire())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(NetError::Internal("connection gate closed".to_string())),
            Err(_) => {
                return Err(NetError::PoolExhausted(format!(
                    "all {} connection slots busy",
                    self.config.max_concurrent_connections
                )));
            }
        };

        let config = vendor_link_config(&self.link_config, vendor);
        let target = LinkTarget::for_device(device, vendor, credentials, &config);
        let link = Arc::new(DeviceLink::new(target, self.connector.clone(), config));
        let result = link.connect_with_retry().await;
        drop(permit);
        result.map(|_| link)
    }

    async fn sweep_idle(&self) -> usize {
        let victims: Vec<Arc<DeviceLink>> = {
            let mut slots = self.slots.lock().await;
            let mut candidates: Vec<(u8, Duration, String)> = slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Ready(entry) if entry.leases == 0 => {
                        let link = &entry.link;
                        let rank = if link.is_expired() {
                            0
                        } else if !link.is_connected() {
                            1
                        } else if link.is_idle(None) {
                            2
                        } else {
                            return None;
                        };
                        Some((rank, link.idle_for(), id.clone()))
                    }
                    _ => None,
                })
                .collect();
            // Expired first, then broken, then longest idle.
            candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

            let mut remaining = slots
                .values()
                .filter(|slot| matches!(slot, Slot::Ready(_)))
                .count();
            let mut victims = Vec::new();
            for (rank, _, id) in candidates {
                if rank == 2 && remaining <= self.config.min_size {
                    continue;
                }
                if let Some(Slot::Ready(entry)) = slots.remove(&id) {
                    if rank == 0 {
                        entry.link.mark_expired();
                    }
                    victims.push(entry.link);
                    remaining -= 1;
                }
            }
            victims
        };

        for link in &victims {
            link.close().await;
        }
        if !victims.is_empty() {
            info!("Idle sweep closed {} links", victims.len());
        }
        victims.len()
    }

    async fn sweep_health(&self) -> usize {
        let free: Vec<(String, Arc<DeviceLink>)> = {
            let slots = self.slots.lock().await;
            slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Ready(entry) if entry.leases == 0 => {
                        Some((id.clone(), entry.link.clone()))
                    }
                    _ => None,
                })
                .collect()
        };

        let mut failed = Vec::new();
        for (id, link) in free {
            if link.is_expired() || !link.health_check().await {
                failed.push((id, link));
            }
        }

        let victims: Vec<Arc<DeviceLink>> = {
            let mut slots = self.slots.lock().await;
            failed
                .into_iter()
                .filter_map(|(id, link)| {
                    let still_free = matches!(
                        slots.get(&id),
                        Some(Slot::Ready(entry)) if entry.leases == 0 && Arc::ptr_eq(&entry.link, &link)
                    );
                    if still_free {
                        slots.remove(&id);
                        Some(link)
                    } else {
                        None
                    }
                })
                .collect()
        };

        for link in &victims {
            link.close().await;
        }
        if !victims.is_empty() {
            info!("Health sweep closed {} links", victims.len());
        }
        victims.len()
    }
}

/// Clears a `Connecting` slot if the acquiring future is dropped mid-connect.
struct ConnectingGuard {
    shared: Arc<PoolShared>,
    device_id: String,
    notify: Arc<Notify>,
    armed: bool,
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = self.shared.clone();
        let device_id = std::mem::take(&mut self.device_id);
        let notify = self.notify.clone();
        handle.spawn(async move {
            let mut slots = shared.slots.lock().await;
            let ours = matches!(
                slots.get(&device_id),
                Some(Slot::Connecting(n)) if Arc::ptr_eq(n, &notify)
            );
            if ours {
                slots.remove(&device_id);
            }
            drop(slots);
            notify.notify_waiters();
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Idle,
    Health,
}

async fn sweep_loop(
    shared: Arc<PoolShared>,
    kind: Sweep,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let closed = match kind {
                    Sweep::Idle => shared.sweep_idle().await,
                    Sweep::Health => shared.sweep_health().await,
                };
                debug!("{:?} sweep finished, {} links closed", kind, closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialConfig;
    use crate::inventory::{AuthMode, HexCodec, MemoryInventory, NetworkTier, Region};
    use crate::link::LinkState;
    use crate::link::scripted::{ScriptedConnector, ScriptedDevice};

    fn device(id: &str, ip: &str) -> Device {
        Device {
            id: id.to_string(),
            hostname: format!("{id}-sw"),
            ip_address: ip.to_string(),
            port: 22,
            vendor_id: "cisco".to_string(),
            region_id: "north".to_string(),
            network_layer: NetworkTier::Access,
            platform_hint: None,
            auth_mode: AuthMode::Dynamic,
            static_username: None,
            static_secret_ciphertext: None,
            active: true,
        }
    }

    async fn inventory() -> Arc<MemoryInventory> {
        let inventory = Arc::new(MemoryInventory::new());
        inventory
            .upsert_vendor(Vendor {
                id: "cisco".to_string(),
                code: "cisco".to_string(),
                name: "Cisco".to_string(),
                platform_tag: None,
                connect_timeout_secs: None,
                command_timeout_secs: None,
            })
            .await;
        inventory
            .upsert_region(Region {
                id: "north".to_string(),
                code: "N1".to_string(),
                name: "North".to_string(),
                shared_secret_ciphertext: None,
            })
            .await;
        inventory
    }

    async fn pool_with(
        connector: Arc<ScriptedConnector>,
        config: PoolConfig,
        link_config: LinkConfig,
    ) -> LinkPool {
        let inventory = inventory().await;
        let resolver = Arc::new(CredentialResolver::new(
            inventory.clone(),
            Arc::new(HexCodec),
            CredentialConfig::default(),
        ));
        LinkPool::new(config, link_config, connector, resolver, inventory)
    }

    fn link_config() -> LinkConfig {
        LinkConfig {
            idle_timeout: Duration::from_secs(10),
            retry_min_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(20),
            ..LinkConfig::default()
        }
    }

    fn two_devices() -> Arc<ScriptedConnector> {
        Arc::new(
            ScriptedConnector::new()
                .with_device("10.0.0.1", ScriptedDevice::new("a-sw#"))
                .with_device("10.0.0.2", ScriptedDevice::new("b-sw#")),
        )
    }

    #[tokio::test]
    async fn released_link_is_reused() {
        let connector = two_devices();
        let pool = pool_with(connector.clone(), PoolConfig::default(), link_config()).await;
        let a = device("a", "10.0.0.1");

        let first = pool.acquire(&a, Some("pw")).await.expect("first acquire");
        assert!(pool.release("a").await);
        let second = pool.acquire(&a, None).await.expect("second acquire");

        assert_eq!(first.id(), second.id());
        assert_eq!(connector.connect_attempts(), 1);
        let stats = pool.stats().await;
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.reserved, 1);
        assert!((stats.hit_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.error_rate, 0.0);
    }

    #[tokio::test]
    async fn missing_dynamic_secret_fails_before_connecting() {
        let connector = two_devices();
        let pool = pool_with(connector.clone(), PoolConfig::default(), link_config()).await;

        let err = match pool.acquire(&device("a", "10.0.0.1"), None).await {
            Ok(_) => panic!("dynamic device without a secret should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::CredentialsRequired { .. }));
        assert_eq!(connector.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn changed_secret_replaces_free_link() {
        let connector = two_devices();
        let pool = pool_with(connector.clone(), PoolConfig::default(), link_config()).await;
        let a = device("a", "10.0.0.1");

        let first = pool.acquire(&a, Some("pw")).await.expect("acquire");
        pool.release("a").await;
        let second = pool.acquire(&a, Some("rotated")).await.expect("re-acquire");

        assert_ne!(first.id(), second.id());
        assert_eq!(first.state(), LinkState::Closed);
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn leased_expired_link_is_replaced_once_drained() {
        let connector = two_devices();
        let pool = pool_with(connector.clone(), PoolConfig::default(), link_config()).await;
        let a = device("a", "10.0.0.1");

        let first = pool.acquire(&a, Some("pw")).await.expect("acquire");
        first.mark_expired();

        let waiting = {
            let pool = pool.clone();
            let a = a.clone();
            tokio::spawn(async move { pool.acquire(&a, Some("pw")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        assert_eq!(connector.connect_attempts(), 1);

        assert!(pool.release("a").await);
        let second = waiting.await.expect("join").expect("replacement");
        assert_ne!(first.id(), second.id());
        assert_eq!(first.state(), LinkState::Closed);
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn leased_link_is_not_shared_across_secrets() {
        let connector = two_devices();
        let config = PoolConfig {
            acquire_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        let pool = pool_with(connector.clone(), config, link_config()).await;
        let a = device("a", "10.0.0.1");

        let _held = pool.acquire(&a, Some("pw")).await.expect("acquire");
        let err = match pool.acquire(&a, Some("rotated")).await {
            Ok(_) => panic!("a re-keyed acquirer must not share the leased link"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::PoolExhausted(_)));
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_pool_sweeps_idle_links_before_failing() {
        let connector = two_devices();
        let config = PoolConfig {
            max_size: 1,
            min_size: 0,
            ..PoolConfig::default()
        };
        let pool = pool_with(connector, config, link_config()).await;
        let a = device("a", "10.0.0.1");
        let b = device("b", "10.0.0.2");

        let link_a = pool.acquire(&a, Some("pw")).await.expect("acquire a");
        let err = match pool.acquire(&b, Some("pw")).await {
            Ok(_) => panic!("pool should be full"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::PoolExhausted(_)));

        pool.release("a").await;
        tokio::time::advance(Duration::from_secs(11)).await;
        pool.acquire(&b, Some("pw")).await.expect("idle link a evicted");
        assert_eq!(link_a.state(), LinkState::Closed);
        assert_eq!(pool.stats().await.size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_keeps_reserved_links_and_min_size() {
        let connector = two_devices();
        let config = PoolConfig {
            min_size: 1,
            ..PoolConfig::default()
        };
        let pool = pool_with(connector, config, link_config()).await;
        let a = pool
            .acquire(&device("a", "10.0.0.1"), Some("pw"))
            .await
            .expect("a");
        let b = pool
            .acquire(&device("b", "10.0.0.2"), Some("pw"))
            .await
            .expect("b");
        pool.release("b").await;

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(pool.cleanup_idle().await, 1);
        assert!(a.is_connected());
        assert_eq!(b.state(), LinkState::Closed);

        pool.release("a").await;
        assert_eq!(pool.cleanup_idle().await, 0, "min_size keeps the last link");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquirers_share_one_connect() {
        let connector = Arc::new(ScriptedConnector::new().with_device(
            "10.0.0.1",
            ScriptedDevice::new("a-sw#").connect_delay(Duration::from_millis(50)),
        ));
        let pool = pool_with(connector.clone(), PoolConfig::default(), link_config()).await;
        let a = device("a", "10.0.0.1");

        let (first, second) = tokio::join!(pool.acquire(&a, Some("pw")), pool.acquire(&a, Some("pw")));
        let first = first.expect("first");
        let second = second.expect("second");

        assert_eq!(first.id(), second.id());
        assert_eq!(connector.connect_attempts(), 1);
        assert_eq!(pool.stats().await.reserved, 1);
    }

    #[tokio::test]
    async fn health_sweep_drops_unreachable_free_links() {
        let scripted = ScriptedDevice::new("a-sw#");
        let connector = Arc::new(ScriptedConnector::new().with_device("10.0.0.1", scripted.clone()));
        let pool = pool_with(connector, PoolConfig::default(), link_config()).await;

        pool.acquire(&device("a", "10.0.0.1"), Some("pw"))
            .await
            .expect("acquire");
        pool.release("a").await;
        scripted.set_reachable(false);

        assert_eq!(pool.check_health().await, 1);
        assert_eq!(pool.stats().await.size, 0);
    }

    #[tokio::test]
    async fn failed_connect_frees_the_slot() {
        let connector = Arc::new(ScriptedConnector::new());
        let pool = pool_with(
            connector,
            PoolConfig::default(),
            LinkConfig {
                max_retry_attempts: 1,
                ..link_config()
            },
        )
        .await;

        let err = match pool.acquire(&device("a", "10.9.9.9"), Some("pw")).await {
            Ok(_) => panic!("unknown host should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::LinkConnect { .. }));
        let stats = pool.stats().await;
        assert_eq!(stats.size + stats.connecting, 0);
        assert_eq!(stats.connection_errors, 1);
    }

    #[tokio::test]
    async fn stop_closes_links_and_start_is_idempotent() {
        let pool = pool_with(two_devices(), PoolConfig::default(), link_config()).await;
        pool.start().await;
        pool.start().await;
        assert!(pool.is_running().await);

        let link = pool
            .acquire(&device("a", "10.0.0.1"), Some("pw"))
            .await
            .expect("acquire");
        pool.stop().await;

        assert!(!pool.is_running().await);
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(pool.stats().await.size, 0);
    }
}
