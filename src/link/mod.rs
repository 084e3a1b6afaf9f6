//! One authenticated shell connection to one device.
//!
//! A [`DeviceLink`] owns at most one [`Transport`] at a time and serializes
//! every operation on it behind a local mutex. Bookkeeping (state, last use,
//! retry and command counters) lives in atomics so the pool can read it
//! without taking the link lock. Interrupts reach a running command through
//! a [`Notify`], never through the lock.
//!
//! # Main Components
//!
//! - [`DeviceLink`] - connection lifecycle, command execution, health probes
//! - [`Transport`] / [`Connector`] - the wire seam, implemented by [`SshConnector`]
//!   and by [`scripted::ScriptedConnector`] for tests and dry runs
//! - [`SecurityLevel`] - SSH algorithm policy

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_ssh2_tokio::ServerCheckMethod;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use russh::Preferred;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{self, LinkConfig};
use crate::credentials::Credentials;
use crate::error::NetError;
use crate::platform;

pub mod scripted;
mod security;
mod ssh;
mod transport;

pub use security::SecurityLevel;
pub use ssh::{SshConnector, SshTransport};
pub use transport::{Connector, LinkTarget, RawOutput, Transport, vendor_link_config};

/// How long an interrupted command may take to give the prompt back.
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a [`DeviceLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Created,
    Connecting,
    Connected,
    /// A command is running.
    Active,
    /// Connected and waiting for work.
    Idle,
    /// A probe or command failed. Awaiting close.
    Unhealthy,
    /// Lifetime exceeded. Awaiting close.
    Expired,
    Closed,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkState::Created,
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            3 => LinkState::Active,
            4 => LinkState::Idle,
            5 => LinkState::Unhealthy,
            6 => LinkState::Expired,
            _ => LinkState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LinkState::Created => 0,
            LinkState::Connecting => 1,
            LinkState::Connected => 2,
            LinkState::Active => 3,
            LinkState::Idle => 4,
            LinkState::Unhealthy => 5,
            LinkState::Expired => 6,
            LinkState::Closed => 7,
        }
    }

    /// States in which the transport is believed usable.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            LinkState::Connected | LinkState::Active | LinkState::Idle
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Created => "created",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Active => "active",
            LinkState::Idle => "idle",
            LinkState::Unhealthy => "unhealthy",
            LinkState::Expired => "expired",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Result of one command on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandResult {
    pub command: String,
    pub output: String,
    pub success: bool,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub prompt: String,
}

impl CommandResult {
    /// A command that never reached the device.
    pub fn failed(command: &str, error: &NetError) -> Self {
        Self::unanswered(command, error.to_string())
    }

    /// A command left unsent because an earlier one broke the link.
    pub fn not_run(command: &str, failed_command: &str) -> Self {
        Self::unanswered(command, format!("not run: '{failed_command}' failed first"))
    }

    fn unanswered(command: &str, error: String) -> Self {
        Self {
            command: command.to_string(),
            output: String::new(),
            success: false,
            error: Some(error),
            latency_ms: 0,
            prompt: String::new(),
        }
    }
}

/// Point-in-time view of a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LinkInfo {
    pub link_id: Uuid,
    pub device_id: String,
    pub hostname: String,
    pub address: String,
    pub platform: String,
    pub state: LinkState,
    pub created_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub retry_count: u32,
    pub command_count: u64,
}

/// One authenticated connection to one device.
pub struct DeviceLink {
    id: Uuid,
    target: LinkTarget,
    connector: Arc<dyn Connector>,
    config: LinkConfig,
    created_at: DateTime<Utc>,
    epoch: Instant,
    state: AtomicU8,
    last_used_ms: AtomicU64,
    last_probe_ms: AtomicU64,
    retry_count: AtomicU32,
    command_count: AtomicU64,
    running: AtomicBool,
    cancel: Notify,
    transport: Mutex<Option<Box<dyn Transport>>>,
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink")
            .field("id", &self.id)
            .field("device_id", &self.target.device_id)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceLink {
    pub fn new(target: LinkTarget, connector: Arc<dyn Connector>, config: LinkConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            connector,
            config,
            created_at: Utc::now(),
            epoch: Instant::now(),
            state: AtomicU8::new(LinkState::Created.as_u8()),
            last_used_ms: AtomicU64::new(0),
            last_probe_ms: AtomicU64::new(0),
            retry_count: AtomicU32::new(0),
            command_count: AtomicU64::new(0),
            running: AtomicBool::new(false),
            cancel: Notify::new(),
            transport: Mutex::new(None),
        }
    }

    /// Identity of this link object. Changes whenever the pool replaces a link.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.target.device_id
    }

    pub fn platform(&self) -> &str {
        &self.target.platform
    }

    pub fn target(&self) -> &LinkTarget {
        &self.target
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LinkState) {
        trace!("{} -> {}", self.target.label(), state);
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn command_count(&self) -> u64 {
        self.command_count.load(Ordering::SeqCst)
    }

    /// Whether a command is on the wire right now.
    pub fn is_busy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        self.last_used_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    /// Time since the link object was created.
    pub fn age(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Time since the last connect or command.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_used_ms.load(Ordering::SeqCst);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    pub fn is_idle(&self, timeout: Option<Duration>) -> bool {
        self.idle_for() > timeout.unwrap_or(self.config.idle_timeout)
    }

    pub fn is_expired(&self) -> bool {
        self.age() > self.config.max_lifetime
    }

    /// Connected and within its lifetime.
    pub fn is_usable(&self) -> bool {
        self.is_connected() && !self.is_expired()
    }

    /// Whether this link was opened with the given secret.
    pub fn uses_secret(&self, credentials: &Credentials) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(credentials.secret.as_bytes());
        let fingerprint: [u8; 32] = hasher.finalize().into();
        fingerprint == self.target.secret_fingerprint()
            && credentials.username == self.target.credentials.username
    }

    async fn open_locked(&self, slot: &mut Option<Box<dyn Transport>>) -> Result<(), NetError> {
        if self.is_connected() && slot.as_ref().is_some_and(|t| t.is_alive()) {
            return Ok(());
        }
        if let Some(mut stale) = slot.take() {
            let _ = stale.close().await;
        }

        let label = self.target.label();
        self.set_state(LinkState::Connecting);
        debug!("{} connecting", label);

        let attempt = tokio::time::timeout(
            self.target.connect_timeout,
            self.connector.connect(&self.target),
        )
        .await
        .unwrap_or_else(|_| Err(NetError::Timeout(format!("connect to {label}"))));

        match attempt {
            Ok(transport) => {
                *slot = Some(transport);
                self.retry_count.store(0, Ordering::SeqCst);
                self.touch();
                self.last_probe_ms.store(self.now_ms(), Ordering::SeqCst);
                self.set_state(LinkState::Connected);
                debug!("{} connected", label);
                Ok(())
            }
            Err(err) => {
                self.retry_count.fetch_add(1, Ordering::SeqCst);
                self.set_state(LinkState::Closed);
                debug!("{} connect failed: {}", label, err);
                Err(err)
            }
        }
    }

    /// Opens the transport once. Idempotent when already connected.
    pub async fn try_connect(&self) -> Result<(), NetError> {
        let mut slot = self.transport.lock().await;
        self.open_locked(&mut slot).await
    }

    /// Opens the transport once and reports success.
    ///
    /// A failure increments the retry counter. Retry policy is left to the caller.
    pub async fn connect(&self) -> bool {
        self.try_connect().await.is_ok()
    }

    /// Opens the transport, retrying transient failures with exponential backoff.
    pub async fn connect_with_retry(&self) -> Result<(), NetError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.retry_min_delay)
            .with_max_delay(self.config.retry_max_delay)
            .with_max_times(self.config.max_retry_attempts.saturating_sub(1))
            .with_jitter();

        let label = self.target.label();
        let result = (|| async { self.try_connect().await })
            .retry(backoff)
            .when(|e: &NetError| {
                let retryable = e.is_retryable();
                if !retryable {
                    warn!("{} failed with non-retryable error: {}", label, e);
                }
                retryable
            })
            .notify(|err: &NetError, dur: Duration| {
                warn!("{} connect failed: {}. Retrying in {:?}", label, err, dur);
            })
            .await;

        result.map_err(|err| match err {
            NetError::LinkConnect { .. } => err,
            other => NetError::LinkConnect {
                device_id: self.target.device_id.clone(),
                address: format!("{}:{}", self.target.address, self.target.port),
                reason: other.to_string(),
            },
        })
    }

    /// Runs one command, reconnecting once first if the link is down.
    ///
    /// A device-reported error yields `success == false`. Transport failures
    /// close the transport, mark the link unhealthy and return
    /// [`NetError::LinkExecution`].
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, NetError> {
        let timeout = timeout.unwrap_or(self.config.command_timeout);
        let mut slot = self.transport.lock().await;

        if !(self.is_connected() && slot.as_ref().is_some_and(|t| t.is_alive())) {
            debug!(
                "{} not connected, reconnecting before '{}'",
                self.target.label(),
                command
            );
            if let Err(err) = self.open_locked(&mut slot).await {
                self.set_state(LinkState::Unhealthy);
                return Err(self.execution_error(command, format!("reconnect failed: {err}")));
            }
        }

        let Some(transport) = slot.as_mut() else {
            return Err(NetError::Internal(format!(
                "{} has no transport after connect",
                self.target.label()
            )));
        };

        self.set_state(LinkState::Active);
        let started = Instant::now();
        // Registered before `running` is raised so no interrupt is missed.
        let cancelled = self.cancel.notified();
        self.running.store(true, Ordering::SeqCst);
        let outcome = tokio::select! {
            biased;
            _ = cancelled => None,
            result = transport.execute(command, timeout) => Some(result),
        };
        self.running.store(false, Ordering::SeqCst);

        let Some(outcome) = outcome else {
            let resync = async {
                transport.send_raw("\x03").await?;
                transport.read_prompt(INTERRUPT_TIMEOUT).await
            }
            .await;
            return match resync {
                Ok(prompt) => {
                    debug!("{} '{}' interrupted at {}", self.target.label(), command, prompt);
                    self.touch();
                    self.set_state(LinkState::Idle);
                    Err(NetError::Interrupted {
                        device_id: self.target.device_id.clone(),
                        command: command.to_string(),
                    })
                }
                Err(err) => {
                    if let Some(mut broken) = slot.take() {
                        let _ = broken.close().await;
                    }
                    self.set_state(LinkState::Unhealthy);
                    Err(self.execution_error(command, format!("interrupt failed: {err}")))
                }
            };
        };

        match outcome {
            Ok(raw) => {
                self.command_count.fetch_add(1, Ordering::SeqCst);
                self.touch();
                self.set_state(LinkState::Idle);
                let error = (!raw.success).then(|| {
                    let detail = raw
                        .content
                        .lines()
                        .rev()
                        .find(|l| !l.trim().is_empty())
                        .unwrap_or("")
                        .trim();
                    format!("device rejected command: {detail}")
                });
                Ok(CommandResult {
                    command: command.to_string(),
                    output: raw.content,
                    success: raw.success,
                    error,
                    latency_ms: started.elapsed().as_millis() as u64,
                    prompt: raw.prompt,
                })
            }
            Err(err) => {
                warn!("{} '{}' failed: {}", self.target.label(), command, err);
                if let Some(mut broken) = slot.take() {
                    let _ = broken.close().await;
                }
                self.set_state(LinkState::Unhealthy);
                Err(self.execution_error(command, err.to_string()))
            }
        }
    }

    fn execution_error(&self, command: &str, reason: String) -> NetError {
        NetError::LinkExecution {
            device_id: self.target.device_id.clone(),
            command: command.to_string(),
            reason,
        }
    }

    /// Liveness check. Issues the platform probe command at most once per
    /// probe interval to catch half-open sockets.
    pub async fn health_check(&self) -> bool {
        let mut slot = self.transport.lock().await;
        let alive = self.is_connected() && slot.as_ref().is_some_and(|t| t.is_alive());
        if !alive {
            if self.state() != LinkState::Closed && self.state() != LinkState::Created {
                self.set_state(LinkState::Unhealthy);
            }
            return false;
        }

        let since_probe = self
            .now_ms()
            .saturating_sub(self.last_probe_ms.load(Ordering::SeqCst));
        if Duration::from_millis(since_probe) < self.config.health_probe_interval {
            return true;
        }

        let probe = platform::probe_command(&self.target.platform);
        let Some(transport) = slot.as_mut() else {
            return false;
        };
        match transport.execute(probe, self.config.command_timeout).await {
            Ok(_) => {
                self.last_probe_ms.store(self.now_ms(), Ordering::SeqCst);
                true
            }
            Err(err) => {
                debug!("{} health probe failed: {}", self.target.label(), err);
                if let Some(mut broken) = slot.take() {
                    let _ = broken.close().await;
                }
                self.set_state(LinkState::Unhealthy);
                false
            }
        }
    }

    /// Sends Ctrl-C.
    ///
    /// A running command is cancelled in place: its own `execute` call writes
    /// the interrupt, resyncs on the prompt and returns
    /// [`NetError::Interrupted`], while this returns `Ok(None)` at once. With
    /// nothing running the interrupt is written here and the prompt returned.
    pub async fn interrupt(&self, timeout: Duration) -> Result<Option<String>, NetError> {
        if self.is_busy() {
            self.cancel.notify_waiters();
            return Ok(None);
        }
        let mut slot = self.transport.lock().await;
        let Some(transport) = slot.as_mut() else {
            return Err(NetError::LinkClosed(self.target.device_id.clone()));
        };
        transport.send_raw("\x03").await?;
        let prompt = transport.read_prompt(timeout).await?;
        self.touch();
        Ok(Some(prompt))
    }

    /// Last prompt reported by the transport.
    pub async fn prompt(&self) -> Option<String> {
        let slot = self.transport.lock().await;
        slot.as_ref()
            .map(|t| t.prompt().to_string())
            .filter(|p| !p.is_empty())
    }

    /// Closes the transport. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut slot = self.transport.lock().await;
        if let Some(mut transport) = slot.take()
            && let Err(err) = transport.close().await
        {
            debug!("{} close error: {}", self.target.label(), err);
        }
        self.set_state(LinkState::Closed);
    }

    /// Marks an over-age link so sweeps and acquirers skip it.
    pub(crate) fn mark_expired(&self) {
        if self.state() != LinkState::Closed {
            self.set_state(LinkState::Expired);
        }
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            link_id: self.id,
            device_id: self.target.device_id.clone(),
            hostname: self.target.hostname.clone(),
            address: format!("{}:{}", self.target.address, self.target.port),
            platform: self.target.platform.clone(),
            state: self.state(),
            created_at: self.created_at,
            age_secs: self.age().as_secs(),
            idle_secs: self.idle_for().as_secs(),
            retry_count: self.retry_count(),
            command_count: self.command_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::{Reply, ScriptedConnector, ScriptedDevice};
    use super::*;
    use crate::inventory::AuthMode;

    fn target(address: &str) -> LinkTarget {
        LinkTarget {
            device_id: "d1".to_string(),
            hostname: "edge-1".to_string(),
            address: address.to_string(),
            port: 22,
            platform: "cisco_iosxe".to_string(),
            credentials: Credentials {
                username: "admin".to_string(),
                secret: "pw".to_string(),
                auth_mode: AuthMode::Static,
                community: None,
                port: 22,
            },
            security: SecurityLevel::Secure,
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            retry_min_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(20),
            ..LinkConfig::default()
        }
    }

    #[tokio::test]
    async fn connect_resets_retry_count_on_success() {
        let device = ScriptedDevice::new("edge-1#").fail_connects(1);
        let connector = ScriptedConnector::new().with_device("10.0.0.1", device);
        let link = DeviceLink::new(target("10.0.0.1"), Arc::new(connector), fast_config());

        assert!(!link.connect().await);
        assert_eq!(link.retry_count(), 1);
        assert_eq!(link.state(), LinkState::Closed);

        assert!(link.connect().await);
        assert_eq!(link.retry_count(), 0);
        assert!(link.is_connected());
        assert!(link.connect().await);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_with_retry_recovers_from_transient_failures() {
        let device = ScriptedDevice::new("edge-1#").fail_connects(2);
        let connector = Arc::new(ScriptedConnector::new().with_device("10.0.0.1", device));
        let link = DeviceLink::new(target("10.0.0.1"), connector.clone(), fast_config());

        link.connect_with_retry().await.expect("third attempt succeeds");
        assert_eq!(connector.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_is_not_retried() {
        let device = ScriptedDevice::new("edge-1#").expect_secret("other");
        let connector = Arc::new(ScriptedConnector::new().with_device("10.0.0.1", device));
        let link = DeviceLink::new(target("10.0.0.1"), connector.clone(), fast_config());

        let err = match link.connect_with_retry().await {
            Ok(_) => panic!("wrong secret should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::LinkConnect { .. }));
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn execute_reconnects_once_when_closed() {
        let device = ScriptedDevice::new("edge-1#").reply("show clock", Reply::output("12:00"));
        let connector = ScriptedConnector::new().with_device("10.0.0.1", device);
        let link = DeviceLink::new(target("10.0.0.1"), Arc::new(connector), fast_config());

        let result = link.execute("show clock", None).await.expect("execute");
        assert!(result.success);
        assert_eq!(result.output, "12:00");
        assert_eq!(result.prompt, "edge-1#");
        assert_eq!(link.command_count(), 1);
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[tokio::test]
    async fn device_errors_are_results_not_failures() {
        let device = ScriptedDevice::new("edge-1#").reply(
            "show bogus",
            Reply::rejected("% Invalid input detected at '^' marker."),
        );
        let connector = ScriptedConnector::new().with_device("10.0.0.1", device);
        let link = DeviceLink::new(target("10.0.0.1"), Arc::new(connector), fast_config());

        let result = link.execute("show bogus", None).await.expect("execute");
        assert!(!result.success);
        assert!(
            result
                .error
                .as_deref()
                .is_some_and(|e| e.contains("Invalid input"))
        );
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn transport_failure_marks_link_unhealthy() {
        let device = ScriptedDevice::new("edge-1#").reply("reload", Reply::Drop);
        let connector = ScriptedConnector::new().with_device("10.0.0.1", device);
        let link = DeviceLink::new(target("10.0.0.1"), Arc::new(connector), fast_config());

        let err = match link.execute("reload", None).await {
            Ok(_) => panic!("dropped channel should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::LinkExecution { .. }));
        assert_eq!(link.state(), LinkState::Unhealthy);
        assert!(!link.health_check().await);
    }

    #[tokio::test]
    async fn interrupt_cancels_the_running_command() {
        let device = ScriptedDevice::new("edge-1#").reply("ping 10.0.0.9 repeat 100000", Reply::Hang);
        let connector = ScriptedConnector::new().with_device("10.0.0.1", device.clone());
        let link = Arc::new(DeviceLink::new(
            target("10.0.0.1"),
            Arc::new(connector),
            fast_config(),
        ));
        assert!(link.connect().await);

        let running = {
            let link = link.clone();
            tokio::spawn(async move { link.execute("ping 10.0.0.9 repeat 100000", None).await })
        };
        while !link.is_busy() {
            tokio::task::yield_now().await;
        }
        let signalled = tokio::time::timeout(
            Duration::from_secs(1),
            link.interrupt(Duration::from_secs(1)),
        )
        .await
        .expect("interrupt returns while the command runs")
        .expect("interrupt");
        assert_eq!(signalled, None);

        let err = match running.await.expect("join") {
            Ok(_) => panic!("interrupted command should not complete"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::Interrupted { .. }));
        assert_eq!(device.raw_input().await, vec!["\x03".to_string()]);
        assert_eq!(link.state(), LinkState::Idle);

        let prompt = link.interrupt(Duration::from_secs(1)).await.expect("idle interrupt");
        assert_eq!(prompt.as_deref(), Some("edge-1#"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_and_expiry_follow_configured_thresholds() {
        let config = LinkConfig {
            idle_timeout: Duration::from_secs(10),
            max_lifetime: Duration::from_secs(30),
            ..fast_config()
        };
        let connector = ScriptedConnector::new().with_device("10.0.0.1", ScriptedDevice::new("r#"));
        let link = DeviceLink::new(target("10.0.0.1"), Arc::new(connector), config);
        assert!(link.connect().await);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(link.is_idle(None));
        assert!(!link.is_idle(Some(Duration::from_secs(20))));
        assert!(!link.is_expired());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(link.is_expired());
        assert!(!link.is_usable());
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_probes_only_after_interval() {
        let device = ScriptedDevice::new("edge-1#");
        let connector = Arc::new(ScriptedConnector::new().with_device("10.0.0.1", device.clone()));
        let config = LinkConfig {
            health_probe_interval: Duration::from_secs(60),
            ..fast_config()
        };
        let link = DeviceLink::new(target("10.0.0.1"), connector, config);
        assert!(link.connect().await);

        assert!(link.health_check().await);
        assert_eq!(device.executed().await.len(), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(link.health_check().await);
        assert_eq!(device.executed().await, vec!["show clock".to_string()]);

        device.set_reachable(false);
        assert!(!link.health_check().await);
        assert_eq!(link.state(), LinkState::Unhealthy);
    }

    #[tokio::test]
    async fn concurrent_commands_never_overlap() {
        let device = ScriptedDevice::new("edge-1#").latency(Duration::from_millis(20));
        let connector = ScriptedConnector::new().with_device("10.0.0.1", device.clone());
        let link = Arc::new(DeviceLink::new(
            target("10.0.0.1"),
            Arc::new(connector),
            fast_config(),
        ));

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let link = link.clone();
                tokio::spawn(async move { link.execute(&format!("show run {i}"), None).await })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("execute");
        }

        let mut spans = device.spans().await;
        assert_eq!(spans.len(), 6);
        spans.sort_by_key(|(start, _)| *start);
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "command spans overlap");
        }
    }
}
