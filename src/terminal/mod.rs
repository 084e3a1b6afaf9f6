//! Interactive CLI sessions.
//!
//! A [`SessionManager`] owns one [`CliSession`] per operator terminal. Each
//! session holds a dedicated [`DeviceLink`] outside the pool, buffers
//! keystrokes until Enter, and tracks whether the device is in
//! configuration mode. A reaper loop closes sessions that sit idle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{LinkConfig, SessionConfig};
use crate::credentials::{CredentialResolver, Credentials};
use crate::error::NetError;
use crate::inventory::{AuthMode, Inventory};
use crate::link::{Connector, DeviceLink, LinkTarget, vendor_link_config};
use crate::platform::DEFAULT_PLATFORM;

pub mod input;
mod session;

pub use session::{CliSession, Endpoint, SessionInfo, SessionState, SessionTarget, TargetInfo};

/// Snapshot of the session table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionStats {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub total_commands: u64,
    pub per_user: BTreeMap<String, usize>,
    pub avg_commands_per_session: f64,
    pub created_total: u64,
    pub reaped_total: u64,
}

/// Byte channels bridging a client stream to a session.
///
/// Dropping `input` closes the session.
pub struct SessionStream {
    pub input: mpsc::Sender<String>,
    pub output: mpsc::Receiver<String>,
}

struct ManagerShared {
    config: SessionConfig,
    link_config: LinkConfig,
    connector: Arc<dyn Connector>,
    resolver: Arc<CredentialResolver>,
    inventory: Arc<dyn Inventory>,
    sessions: RwLock<HashMap<String, Arc<CliSession>>>,
    created: AtomicU64,
    reaped: AtomicU64,
}

struct Reaper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<ManagerShared>,
    reaper: Arc<Mutex<Option<Reaper>>>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        link_config: LinkConfig,
        connector: Arc<dyn Connector>,
        resolver: Arc<CredentialResolver>,
        inventory: Arc<dyn Inventory>,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                config,
                link_config,
                connector,
                resolver,
                inventory,
                sessions: RwLock::new(HashMap::new()),
                created: AtomicU64::new(0),
                reaped: AtomicU64::new(0),
            }),
            reaper: Arc::new(Mutex::new(None)),
        }
    }

    /// Connects a new session and registers it.
    ///
    /// Credential and lookup errors are returned as-is. Transport failures
    /// become [`NetError::SessionConnect`].
    pub async fn create_session(
        &self,
        user_id: &str,
        target: SessionTarget,
    ) -> Result<Arc<CliSession>, NetError> {
        let label = target.to_string();
        let (info, link) = self.open_link(target).await?;

        let session = Arc::new(CliSession::new(
            Uuid::new_v4().to_string(),
            user_id.to_string(),
            info,
            link,
            self.shared.config.clone(),
        ));
        if let Err(err) = session.connect().await {
            warn!("Session for {} failed to connect: {}", label, err);
            return Err(NetError::SessionConnect {
                target: label,
                reason: err.to_string(),
            });
        }

        self.shared
            .sessions
            .write()
            .await
            .insert(session.id().to_string(), session.clone());
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        info!(
            "Session {} created for user {} on {}",
            session.id(),
            user_id,
            label
        );
        Ok(session)
    }

    async fn open_link(&self, target: SessionTarget) -> Result<(TargetInfo, DeviceLink), NetError> {
        let shared = &self.shared;
        match target {
            SessionTarget::Device {
                device_id,
                user_secret,
            } => {
                let device = shared
                    .inventory
                    .get_device(&device_id)
                    .await?
                    .ok_or_else(|| NetError::DeviceNotFound(device_id.clone()))?;
                if !device.active {
                    return Err(NetError::SessionConnect {
                        target: format!("device {device_id}"),
                        reason: "device is inactive".to_string(),
                    });
                }
                let credentials = shared
                    .resolver
                    .resolve_device(&device, user_secret.as_deref())
                    .await?;
                let vendor = shared.inventory.get_vendor(&device.vendor_id).await?;
                let config = vendor_link_config(&shared.link_config, vendor.as_ref());
                let target = LinkTarget::for_device(&device, vendor.as_ref(), credentials, &config);
                let info = TargetInfo {
                    device_id: Some(device.id.clone()),
                    hostname: device.hostname.clone(),
                    address: device.address(),
                    platform: target.platform.clone(),
                };
                Ok((info, DeviceLink::new(target, shared.connector.clone(), config)))
            }
            SessionTarget::Endpoint(endpoint) => {
                let missing_username = endpoint.username.trim().is_empty();
                let missing_secret = endpoint.secret.is_empty();
                if endpoint.host.trim().is_empty() || missing_username || missing_secret {
                    return Err(NetError::CredentialsIncomplete {
                        device_id: endpoint.host.clone(),
                        missing_username,
                        missing_secret,
                    });
                }
                let platform = endpoint
                    .platform
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .map(str::to_ascii_lowercase)
                    .unwrap_or_else(|| DEFAULT_PLATFORM.to_string());
                let config = shared.link_config.clone();
                let target = LinkTarget {
                    device_id: endpoint.host.clone(),
                    hostname: endpoint.host.clone(),
                    address: endpoint.host.clone(),
                    port: endpoint.port,
                    platform: platform.clone(),
                    credentials: Credentials {
                        username: endpoint.username,
                        secret: endpoint.secret,
                        auth_mode: AuthMode::Static,
                        community: None,
                        port: endpoint.port,
                    },
                    security: config.security,
                    connect_timeout: config.connect_timeout,
                };
                let info = TargetInfo {
                    device_id: None,
                    hostname: endpoint.host.clone(),
                    address: format!("{}:{}", endpoint.host, endpoint.port),
                    platform,
                };
                Ok((info, DeviceLink::new(target, shared.connector.clone(), config)))
            }
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<CliSession>> {
        self.shared.sessions.read().await.get(session_id).cloned()
    }

    /// Feeds keystrokes to a session and returns the terminal echo.
    pub async fn send_input(&self, session_id: &str, chunk: &str) -> Result<String, NetError> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or_else(|| NetError::SessionNotFound(session_id.to_string()))?;
        session.send_input(chunk).await
    }

    /// Closes and forgets a session. Returns false for unknown ids.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let removed = self.shared.sessions.write().await.remove(session_id);
        match removed {
            Some(session) => {
                session.close().await;
                info!("Session {} closed", session_id);
                true
            }
            None => false,
        }
    }

    pub async fn user_sessions(&self, user_id: &str) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<CliSession>> = self
            .shared
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id() == user_id)
            .cloned()
            .collect();
        collect_infos(sessions).await
    }

    pub async fn all_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<CliSession>> =
            self.shared.sessions.read().await.values().cloned().collect();
        collect_infos(sessions).await
    }

    pub async fn stats(&self) -> SessionStats {
        let infos = self.all_sessions().await;
        let mut per_user = BTreeMap::new();
        let mut connected = 0;
        let mut total_commands = 0;
        for info in &infos {
            *per_user.entry(info.user_id.clone()).or_insert(0) += 1;
            if info.connected {
                connected += 1;
            }
            total_commands += info.command_count;
        }
        let total = infos.len();
        SessionStats {
            total,
            connected,
            disconnected: total - connected,
            total_commands,
            per_user,
            avg_commands_per_session: if total == 0 {
                0.0
            } else {
                total_commands as f64 / total as f64
            },
            created_total: self.shared.created.load(Ordering::SeqCst),
            reaped_total: self.shared.reaped.load(Ordering::SeqCst),
        }
    }

    /// Closes sessions idle past their limit. Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        self.shared.reap_idle().await
    }

    /// Closes every session.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<CliSession>> = self
            .shared
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in &drained {
            session.close().await;
        }
        drained.len()
    }

    /// Starts the idle reaper. Calling twice is a no-op.
    pub async fn start(&self) {
        let mut reaper = self.reaper.lock().await;
        if reaper.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reaper_loop(
            self.shared.clone(),
            self.shared.config.reaper_interval,
            cancel.clone(),
        ));
        *reaper = Some(Reaper { cancel, handle });
        info!(
            "Session reaper started, idle limit {:?}",
            self.shared.config.idle_limit
        );
    }

    /// Stops the reaper and closes every session.
    pub async fn stop(&self) {
        let reaper = self.reaper.lock().await.take();
        if let Some(reaper) = reaper {
            reaper.cancel.cancel();
            let _ = reaper.handle.await;
        }
        let closed = self.close_all().await;
        info!("Session manager stopped, {} sessions closed", closed);
    }

    pub async fn is_running(&self) -> bool {
        self.reaper.lock().await.is_some()
    }

    /// Bridges a session to a pair of channels.
    ///
    /// Every input chunk produces one output message. When the input side is
    /// dropped or the session fails, the session is closed.
    pub async fn open_stream(&self, session_id: &str) -> Result<SessionStream, NetError> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or_else(|| NetError::SessionNotFound(session_id.to_string()))?;
        let (input_tx, mut input_rx) = mpsc::channel::<String>(64);
        let (output_tx, output_rx) = mpsc::channel::<String>(64);
        let manager = self.clone();

        tokio::spawn(async move {
            while let Some(chunk) = input_rx.recv().await {
                match session.send_input(&chunk).await {
                    Ok(echo) => {
                        if !echo.is_empty() && output_tx.send(echo).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = output_tx.send(format!("\r\nError: {err}\r\n")).await;
                        break;
                    }
                }
            }
            debug!("Stream for session {} ended", session.id());
            manager.close_session(session.id()).await;
        });

        Ok(SessionStream {
            input: input_tx,
            output: output_rx,
        })
    }
}

impl ManagerShared {
    async fn reap_idle(&self) -> usize {
        let sessions: Vec<Arc<CliSession>> = self.sessions.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for session in sessions {
            let idle = session.idle_for().await;
            let limit = if session.is_connected().await {
                self.config.idle_limit
            } else {
                self.config.disconnected_idle_limit
            };
            if idle > limit {
                expired.push(session);
            }
        }

        let mut closed = 0;
        for session in expired {
            let removed = self.sessions.write().await.remove(session.id());
            if removed.is_some() {
                session.close().await;
                debug!("Session {} reaped", session.id());
                closed += 1;
            }
        }
        if closed > 0 {
            self.reaped.fetch_add(closed as u64, Ordering::SeqCst);
            info!("Reaped {} idle sessions", closed);
        }
        closed
    }
}

async fn collect_infos(sessions: Vec<Arc<CliSession>>) -> Vec<SessionInfo> {
    let mut infos = Vec::with_capacity(sessions.len());
    for session in sessions {
        infos.push(session.info().await);
    }
    infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.session_id.cmp(&b.session_id)));
    infos
}

async fn reaper_loop(shared: Arc<ManagerShared>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let closed = shared.reap_idle().await;
                debug!("Session sweep finished, {} closed", closed);
            }
        }
    }
}
