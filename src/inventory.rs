//! Inbound collaborator contracts.
//!
//! Device, vendor, region and query-template records are persisted elsewhere.
//! The core reads them through [`Inventory`] and decrypts stored secrets
//! through [`SecretCodec`]. [`MemoryInventory`] and [`HexCodec`] are
//! self-contained implementations for embedding and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::NetError;

/// How the password for a device is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Supplied by the operator per session and cached transiently.
    Dynamic,
    /// Stored encrypted at rest.
    Static,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Dynamic => f.write_str("dynamic"),
            AuthMode::Static => f.write_str("static"),
        }
    }
}

/// Position of a device in the network hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTier {
    Access,
    Aggregation,
    Core,
    Other,
}

impl NetworkTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkTier::Access => "access",
            NetworkTier::Aggregation => "aggregation",
            NetworkTier::Core => "core",
            NetworkTier::Other => "other",
        }
    }
}

/// A managed network device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Device {
    pub id: String,
    pub hostname: String,
    pub ip_address: String,
    pub port: u16,
    pub vendor_id: String,
    pub region_id: String,
    pub network_layer: NetworkTier,
    /// Overrides the vendor's platform tag when set.
    pub platform_hint: Option<String>,
    pub auth_mode: AuthMode,
    pub static_username: Option<String>,
    pub static_secret_ciphertext: Option<String>,
    pub active: bool,
}

impl Device {
    /// `ip:port` string used in logs and error details.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

/// A device vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Vendor {
    pub id: String,
    /// Short vendor code such as `cisco` or `huawei`.
    pub code: String,
    pub name: String,
    /// Explicit platform tag. Derived from `code` when absent.
    pub platform_tag: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
}

/// An administrative region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Region {
    pub id: String,
    pub code: String,
    pub name: String,
    /// Encrypted SNMP community shared by every device in the region.
    pub shared_secret_ciphertext: Option<String>,
}

/// An abstract, vendor-independent query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QueryTemplate {
    pub id: String,
    pub name: String,
    pub template_type: String,
    pub description: Option<String>,
    pub version: u32,
    pub active: bool,
}

/// How output of a vendor command set is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    /// Template lookup with line fallback.
    #[default]
    Textfsm,
    /// No parsing.
    Raw,
}

/// Vendor-specific command set for a query template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VendorCommand {
    pub template_id: String,
    pub vendor_id: String,
    /// Commands with `{param}` placeholders, executed in order.
    pub commands: Vec<String>,
    pub parser_type: ParserKind,
    /// Custom parse template applied to this command set's output.
    pub parser_template: Option<String>,
}

/// Read-only access to persisted records.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn get_device(&self, id: &str) -> Result<Option<Device>, NetError>;

    /// Returns the devices that exist, in request order. Unknown ids are skipped.
    async fn get_devices_by_ids(&self, ids: &[String]) -> Result<Vec<Device>, NetError>;

    async fn get_vendor(&self, id: &str) -> Result<Option<Vendor>, NetError>;

    async fn get_region(&self, id: &str) -> Result<Option<Region>, NetError>;

    async fn get_query_template(&self, id: &str) -> Result<Option<QueryTemplate>, NetError>;

    async fn get_templates_by_type(
        &self,
        template_type: &str,
    ) -> Result<Vec<QueryTemplate>, NetError>;

    async fn get_vendor_command(
        &self,
        template_id: &str,
        vendor_id: &str,
    ) -> Result<Option<VendorCommand>, NetError>;

    async fn get_vendor_commands(&self, template_id: &str)
    -> Result<Vec<VendorCommand>, NetError>;
}

/// Failure reported by a [`SecretCodec`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CodecError(pub String);

/// Reversible transform between stored ciphertext and plaintext.
pub trait SecretCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CodecError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, CodecError>;
}

/// Hex encoding. Obfuscation only, for tests and local setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct HexCodec;

impl SecretCodec for HexCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        Ok(hex::encode(plaintext))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CodecError> {
        let bytes = hex::decode(ciphertext.trim()).map_err(CodecError::from)?;
        String::from_utf8(bytes).map_err(|e| CodecError(e.to_string()))
    }
}

impl From<hex::FromHexError> for CodecError {
    fn from(err: hex::FromHexError) -> Self {
        CodecError(format!("invalid hex: {err}"))
    }
}

#[derive(Default)]
struct Records {
    devices: HashMap<String, Device>,
    vendors: HashMap<String, Vendor>,
    regions: HashMap<String, Region>,
    templates: HashMap<String, QueryTemplate>,
    /// Keyed by (template_id, vendor_id).
    commands: HashMap<(String, String), VendorCommand>,
}

/// In-process [`Inventory`] backed by hash maps.
#[derive(Clone, Default)]
pub struct MemoryInventory {
    records: Arc<RwLock<Records>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_device(&self, device: Device) {
        self.records
            .write()
            .await
            .devices
            .insert(device.id.clone(), device);
    }

    pub async fn upsert_vendor(&self, vendor: Vendor) {
        self.records
            .write()
            .await
            .vendors
            .insert(vendor.id.clone(), vendor);
    }

    pub async fn upsert_region(&self, region: Region) {
        self.records
            .write()
            .await
            .regions
            .insert(region.id.clone(), region);
    }

    pub async fn upsert_template(&self, template: QueryTemplate) {
        self.records
            .write()
            .await
            .templates
            .insert(template.id.clone(), template);
    }

    pub async fn upsert_vendor_command(&self, command: VendorCommand) {
        let key = (command.template_id.clone(), command.vendor_id.clone());
        self.records.write().await.commands.insert(key, command);
    }

    pub async fn remove_device(&self, id: &str) -> bool {
        self.records.write().await.devices.remove(id).is_some()
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn get_device(&self, id: &str) -> Result<Option<Device>, NetError> {
        Ok(self.records.read().await.devices.get(id).cloned())
    }

    async fn get_devices_by_ids(&self, ids: &[String]) -> Result<Vec<Device>, NetError> {
        let records = self.records.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| records.devices.get(id).cloned())
            .collect())
    }

    async fn get_vendor(&self, id: &str) -> Result<Option<Vendor>, NetError> {
        Ok(self.records.read().await.vendors.get(id).cloned())
    }

    async fn get_region(&self, id: &str) -> Result<Option<Region>, NetError> {
        Ok(self.records.read().await.regions.get(id).cloned())
    }

    async fn get_query_template(&self, id: &str) -> Result<Option<QueryTemplate>, NetError> {
        Ok(self.records.read().await.templates.get(id).cloned())
    }

    async fn get_templates_by_type(
        &self,
        template_type: &str,
    ) -> Result<Vec<QueryTemplate>, NetError> {
        let records = self.records.read().await;
        let mut templates: Vec<QueryTemplate> = records
            .templates
            .values()
            .filter(|t| t.template_type == template_type)
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(templates)
    }

    async fn get_vendor_command(
        &self,
        template_id: &str,
        vendor_id: &str,
    ) -> Result<Option<VendorCommand>, NetError> {
        let key = (template_id.to_string(), vendor_id.to_string());
        Ok(self.records.read().await.commands.get(&key).cloned())
    }

    async fn get_vendor_commands(
        &self,
        template_id: &str,
    ) -> Result<Vec<VendorCommand>, NetError> {
        let records = self.records.read().await;
        let mut commands: Vec<VendorCommand> = records
            .commands
            .values()
            .filter(|c| c.template_id == template_id)
            .cloned()
            .collect();
        commands.sort_by(|a, b| a.vendor_id.cmp(&b.vendor_id));
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_codec_is_deterministic_and_reversible() {
        let codec = HexCodec;
        let cipher = codec.encrypt("s3cret!").expect("encrypt");
        assert_eq!(cipher, "73336372657421");
        assert_eq!(cipher, codec.encrypt("s3cret!").expect("encrypt again"));
        assert_eq!(codec.decrypt("6F70").expect("upper case"), "op");
        assert_eq!(codec.decrypt(&cipher).expect("decrypt"), "s3cret!");
    }

    #[test]
    fn hex_codec_rejects_malformed_input() {
        let codec = HexCodec;
        let err = match codec.decrypt("abc") {
            Ok(_) => panic!("odd length should fail"),
            Err(e) => e,
        };
        assert!(err.0.starts_with("invalid hex"));
        assert!(codec.decrypt("zz").is_err());
        assert!(codec.decrypt("ff").is_err());
    }

    #[tokio::test]
    async fn memory_inventory_skips_unknown_ids_and_keeps_order() {
        let inventory = MemoryInventory::new();
        for id in ["b", "a"] {
            inventory
                .upsert_device(Device {
                    id: id.to_string(),
                    hostname: format!("host-{id}"),
                    ip_address: "10.0.0.1".to_string(),
                    port: 22,
                    vendor_id: "v1".to_string(),
                    region_id: "r1".to_string(),
                    network_layer: NetworkTier::Access,
                    platform_hint: None,
                    auth_mode: AuthMode::Dynamic,
                    static_username: None,
                    static_secret_ciphertext: None,
                    active: true,
                })
                .await;
        }

        let ids = vec!["a".to_string(), "missing".to_string(), "b".to_string()];
        let devices = inventory.get_devices_by_ids(&ids).await.expect("lookup");
        let found: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(found, vec!["a", "b"]);
    }
}
