use super::*;

use crate::inventory::{Device, Vendor};

/// Everything needed to open a shell on one device.
#[derive(Debug, Clone)]
pub struct LinkTarget {
    pub device_id: String,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub platform: String,
    pub credentials: Credentials,
    pub security: SecurityLevel,
    pub connect_timeout: Duration,
}

impl LinkTarget {
    /// Target for an inventory device, honoring vendor timeouts.
    pub fn for_device(
        device: &Device,
        vendor: Option<&Vendor>,
        credentials: Credentials,
        config: &LinkConfig,
    ) -> Self {
        let connect_timeout = vendor
            .and_then(|v| v.connect_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(config.connect_timeout);
        Self {
            device_id: device.id.clone(),
            hostname: device.hostname.clone(),
            address: device.ip_address.clone(),
            port: credentials.port,
            platform: platform::resolve_platform(device, vendor),
            credentials,
            security: config.security,
            connect_timeout,
        }
    }

    /// `user@address:port`, used as the log key.
    pub fn label(&self) -> String {
        format!(
            "{}@{}:{}",
            self.credentials.username, self.address, self.port
        )
    }

    /// SHA-256 of the secret, used to detect credential changes without
    /// keeping a second plaintext copy around.
    pub fn secret_fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.credentials.secret.as_bytes());
        hasher.finalize().into()
    }
}

/// Link settings with the vendor's command timeout applied.
pub fn vendor_link_config(config: &LinkConfig, vendor: Option<&Vendor>) -> LinkConfig {
    let mut config = config.clone();
    if let Some(secs) = vendor.and_then(|v| v.command_timeout_secs) {
        config.command_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = vendor.and_then(|v| v.connect_timeout_secs) {
        config.connect_timeout = Duration::from_secs(secs);
    }
    config
}

/// Output of one command as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    /// False when the device printed an error for the command.
    pub success: bool,
    /// Output without the echoed command and trailing prompt.
    pub content: String,
    /// Prompt seen after the command completed.
    pub prompt: String,
}

/// An open interactive shell.
///
/// Implementations are driven by one caller at a time; [`DeviceLink`]
/// provides the mutual exclusion.
#[async_trait]
pub trait Transport: Send {
    /// Sends `command` followed by a newline and waits for the next prompt.
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<RawOutput, NetError>;

    /// Writes bytes verbatim, without waiting for output.
    async fn send_raw(&mut self, data: &str) -> Result<(), NetError>;

    /// Discards pending output until a prompt is seen and returns it.
    async fn read_prompt(&mut self, timeout: Duration) -> Result<String, NetError>;

    /// Last prompt seen.
    fn prompt(&self) -> &str;

    fn is_alive(&self) -> bool;

    async fn close(&mut self) -> Result<(), NetError>;
}

/// Opens [`Transport`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &LinkTarget) -> Result<Box<dyn Transport>, NetError>;
}
