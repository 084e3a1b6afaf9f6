//! Per-device credential resolution.
//!
//! Dynamic-mode secrets come from the operator and are cached with a TTL,
//! per device and optionally per region. Static-mode secrets are decrypted
//! from stored ciphertext on every resolution and never cached.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use moka::future::Cache;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::CredentialConfig;
use crate::error::NetError;
use crate::inventory::{AuthMode, Device, Inventory, Region, SecretCodec};

/// Usable login material for one device. Produced fresh per resolution.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
    pub auth_mode: AuthMode,
    pub community: Option<String>,
    pub port: u16,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("auth_mode", &self.auth_mode)
            .field("community", &self.community.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .finish()
    }
}

/// What the caller must show the operator when a secret is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecretPrompt {
    pub device_id: String,
    pub hostname: String,
    pub username: String,
}

/// Outcome of [`CredentialResolver::try_resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ready(Credentials),
    /// Dynamic auth with no secret supplied or cached.
    SecretRequired(SecretPrompt),
}

/// TTL-bounded secret cache with explicit invalidation.
#[derive(Clone)]
pub struct SecretCache {
    cache: Cache<String, String>,
}

impl SecretCache {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: &str, secret: String) {
        self.cache.insert(key.to_string(), secret).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Live entries after pending expirations and invalidations are applied.
    pub async fn len(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Turns a device id and optional operator secret into [`Credentials`].
pub struct CredentialResolver {
    inventory: Arc<dyn Inventory>,
    codec: Arc<dyn SecretCodec>,
    config: CredentialConfig,
    device_secrets: SecretCache,
    region_secrets: SecretCache,
}

impl CredentialResolver {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        codec: Arc<dyn SecretCodec>,
        config: CredentialConfig,
    ) -> Self {
        let device_secrets = SecretCache::new(config.secret_ttl, config.max_cached_secrets);
        let region_secrets = SecretCache::new(config.secret_ttl, config.max_cached_secrets);
        Self {
            inventory,
            codec,
            config,
            device_secrets,
            region_secrets,
        }
    }

    /// Resolves credentials, reporting a missing dynamic secret as a value.
    pub async fn try_resolve(
        &self,
        device_id: &str,
        user_secret: Option<&str>,
    ) -> Result<Resolution, NetError> {
        let device = self
            .inventory
            .get_device(device_id)
            .await?
            .ok_or_else(|| NetError::DeviceNotFound(device_id.to_string()))?;
        self.try_resolve_device(&device, user_secret).await
    }

    /// Same as [`try_resolve`](Self::try_resolve) for an already loaded device.
    pub async fn try_resolve_device(
        &self,
        device: &Device,
        user_secret: Option<&str>,
    ) -> Result<Resolution, NetError> {
        let region = self
            .inventory
            .get_region(&device.region_id)
            .await?
            .ok_or_else(|| NetError::RegionNotFound(device.region_id.clone()))?;

        match device.auth_mode {
            AuthMode::Dynamic => self.resolve_dynamic(device, &region, user_secret).await,
            AuthMode::Static => self.resolve_static(device, &region).map(Resolution::Ready),
        }
    }

    /// Resolves credentials, failing with [`NetError::CredentialsRequired`]
    /// when the operator must supply a secret.
    pub async fn resolve(
        &self,
        device_id: &str,
        user_secret: Option<&str>,
    ) -> Result<Credentials, NetError> {
        let resolution = self.try_resolve(device_id, user_secret).await?;
        Self::require(resolution)
    }

    pub async fn resolve_device(
        &self,
        device: &Device,
        user_secret: Option<&str>,
    ) -> Result<Credentials, NetError> {
        let resolution = self.try_resolve_device(device, user_secret).await?;
        Self::require(resolution)
    }

    fn require(resolution: Resolution) -> Result<Credentials, NetError> {
        match resolution {
            Resolution::Ready(credentials) => Ok(credentials),
            Resolution::SecretRequired(prompt) => Err(NetError::CredentialsRequired {
                device_id: prompt.device_id,
                hostname: prompt.hostname,
            }),
        }
    }

    async fn resolve_dynamic(
        &self,
        device: &Device,
        region: &Region,
        user_secret: Option<&str>,
    ) -> Result<Resolution, NetError> {
        let username = self.dynamic_username(device, region);

        let supplied = user_secret.filter(|s| !s.is_empty());
        let secret = match supplied {
            Some(secret) => {
                self.device_secrets
                    .insert(&device.id, secret.to_string())
                    .await;
                Some(secret.to_string())
            }
            None => match self.device_secrets.get(&device.id).await {
                Some(secret) => Some(secret),
                None => self.region_secrets.get(&device.region_id).await,
            },
        };

        let Some(secret) = secret else {
            debug!(
                "No dynamic secret for {} ({}), operator input required",
                device.id, device.hostname
            );
            return Ok(Resolution::SecretRequired(SecretPrompt {
                device_id: device.id.clone(),
                hostname: device.hostname.clone(),
                username,
            }));
        };

        let community = self.decrypt_community(device, region)?;
        debug!(
            "Resolved dynamic credentials for {} as {} on port {}",
            device.id, username, device.port
        );
        Ok(Resolution::Ready(Credentials {
            username,
            secret,
            auth_mode: AuthMode::Dynamic,
            community,
            port: device.port,
        }))
    }

    fn resolve_static(&self, device: &Device, region: &Region) -> Result<Credentials, NetError> {
        let username = device
            .static_username
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let ciphertext = device
            .static_secret_ciphertext
            .as_deref()
            .filter(|s| !s.is_empty());

        let (Some(username), Some(ciphertext)) = (username, ciphertext) else {
            return Err(NetError::CredentialsIncomplete {
                device_id: device.id.clone(),
                missing_username: username.is_none(),
                missing_secret: ciphertext.is_none(),
            });
        };

        let secret = self
            .codec
            .decrypt(ciphertext)
            .map_err(|e| NetError::Decryption {
                device_id: device.id.clone(),
                field: "password".to_string(),
                reason: e.to_string(),
            })?;
        if secret.is_empty() {
            return Err(NetError::CredentialsIncomplete {
                device_id: device.id.clone(),
                missing_username: false,
                missing_secret: true,
            });
        }

        let community = self.decrypt_community(device, region)?;
        debug!(
            "Resolved static credentials for {} as {} on port {}",
            device.id, username, device.port
        );
        Ok(Credentials {
            username: username.to_string(),
            secret,
            auth_mode: AuthMode::Static,
            community,
            port: device.port,
        })
    }

    fn decrypt_community(&self, device: &Device, region: &Region) -> Result<Option<String>, NetError> {
        match region.shared_secret_ciphertext.as_deref() {
            Some(ciphertext) if !ciphertext.is_empty() => self
                .codec
                .decrypt(ciphertext)
                .map(Some)
                .map_err(|e| NetError::Decryption {
                    device_id: device.id.clone(),
                    field: "community".to_string(),
                    reason: e.to_string(),
                }),
            _ => Ok(None),
        }
    }

    /// Username derived from the device tier and the region code.
    pub fn dynamic_username(&self, device: &Device, region: &Region) -> String {
        let tier = device.network_layer.as_str();
        let patterns = &self.config.username_patterns;
        let pattern = patterns
            .by_tier
            .get(tier)
            .unwrap_or(&patterns.fallback);
        pattern
            .replace("{region_code}", &region.code.to_lowercase())
            .replace("{network_layer}", tier)
    }

    /// Structural check only. No network call.
    pub fn validate(&self, credentials: &Credentials) -> bool {
        let username = credentials.username.trim();
        !username.is_empty()
            && username.len() <= self.config.max_username_len
            && !username.chars().any(char::is_whitespace)
            && !credentials.secret.is_empty()
            && credentials.secret.len() <= self.config.max_secret_len
            && credentials.port != 0
    }

    /// Clears the cached secret of one device, or every cached secret.
    pub async fn invalidate(&self, device_id: Option<&str>) {
        match device_id {
            Some(id) => {
                debug!("Invalidating cached secret for {}", id);
                self.device_secrets.invalidate(id).await;
            }
            None => {
                debug!("Clearing all cached secrets");
                self.device_secrets.clear();
                self.region_secrets.clear();
            }
        }
    }

    /// Number of devices with a cached dynamic secret.
    pub async fn cached_count(&self) -> u64 {
        self.device_secrets.len().await
    }

    /// Seeds device secrets, e.g. from a batch request. Empty values are skipped.
    pub async fn prime_device_secrets(&self, secrets: &HashMap<String, String>) {
        for (device_id, secret) in secrets.iter().filter(|(_, s)| !s.is_empty()) {
            self.device_secrets.insert(device_id, secret.clone()).await;
        }
    }

    /// Seeds a secret shared by every dynamic-mode device of a region.
    pub async fn prime_region_secrets(&self, secrets: &HashMap<String, String>) {
        for (region_id, secret) in secrets.iter().filter(|(_, s)| !s.is_empty()) {
            self.region_secrets.insert(region_id, secret.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialConfig;
    use crate::inventory::{HexCodec, MemoryInventory, NetworkTier};

    fn device(id: &str, mode: AuthMode) -> Device {
        Device {
            id: id.to_string(),
            hostname: format!("{id}.lab"),
            ip_address: "192.0.2.10".to_string(),
            port: 22,
            vendor_id: "v-huawei".to_string(),
            region_id: "r-east".to_string(),
            network_layer: NetworkTier::Core,
            platform_hint: None,
            auth_mode: mode,
            static_username: None,
            static_secret_ciphertext: None,
            active: true,
        }
    }

    async fn resolver_with(devices: Vec<Device>) -> CredentialResolver {
        let inventory = MemoryInventory::new();
        inventory
            .upsert_region(Region {
                id: "r-east".to_string(),
                code: "EAST".to_string(),
                name: "East".to_string(),
                shared_secret_ciphertext: Some(HexCodec.encrypt("public").expect("encrypt")),
            })
            .await;
        for d in devices {
            inventory.upsert_device(d).await;
        }
        CredentialResolver::new(
            Arc::new(inventory),
            Arc::new(HexCodec),
            CredentialConfig::default(),
        )
    }

    #[tokio::test]
    async fn dynamic_without_secret_requires_operator_input() {
        let resolver = resolver_with(vec![device("d1", AuthMode::Dynamic)]).await;

        let resolution = resolver.try_resolve("d1", None).await.expect("resolve");
        match resolution {
            Resolution::SecretRequired(prompt) => {
                assert_eq!(prompt.device_id, "d1");
                assert_eq!(prompt.username, "opeasthx");
            }
            Resolution::Ready(_) => panic!("secret should be required"),
        }

        let err = match resolver.resolve("d1", Some("")).await {
            Ok(_) => panic!("empty secret must not satisfy dynamic auth"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::CredentialsRequired { .. }));
    }

    #[tokio::test]
    async fn dynamic_secret_is_cached_until_invalidated() {
        let resolver = resolver_with(vec![device("d1", AuthMode::Dynamic)]).await;

        let first = resolver.resolve("d1", Some("pw")).await.expect("first");
        assert_eq!(first.secret, "pw");
        assert_eq!(first.community.as_deref(), Some("public"));
        assert_eq!(resolver.cached_count().await, 1);

        let second = resolver.resolve("d1", None).await.expect("cached");
        assert_eq!(second.secret, "pw");

        resolver.invalidate(Some("d1")).await;
        assert_eq!(resolver.cached_count().await, 0);
        assert!(resolver.resolve("d1", None).await.is_err());
    }

    #[tokio::test]
    async fn region_secret_covers_devices_without_own_secret() {
        let resolver = resolver_with(vec![device("d1", AuthMode::Dynamic)]).await;
        let secrets = HashMap::from([("r-east".to_string(), "region-pw".to_string())]);
        resolver.prime_region_secrets(&secrets).await;

        let creds = resolver.resolve("d1", None).await.expect("region secret");
        assert_eq!(creds.secret, "region-pw");

        resolver.invalidate(None).await;
        assert!(resolver.resolve("d1", None).await.is_err());
    }

    #[tokio::test]
    async fn static_resolution_is_deterministic() {
        let mut d = device("s1", AuthMode::Static);
        d.static_username = Some("netops".to_string());
        d.static_secret_ciphertext = Some(HexCodec.encrypt("hunter2").expect("encrypt"));
        let resolver = resolver_with(vec![d]).await;

        let a = resolver.resolve("s1", None).await.expect("first");
        let b = resolver.resolve("s1", Some("ignored")).await.expect("second");
        assert_eq!(a, b);
        assert_eq!(a.secret, "hunter2");
        assert_eq!(resolver.cached_count().await, 0);
    }

    #[tokio::test]
    async fn static_resolution_reports_missing_fields() {
        let mut d = device("s1", AuthMode::Static);
        d.static_username = Some("  ".to_string());
        let resolver = resolver_with(vec![d]).await;

        let err = match resolver.resolve("s1", None).await {
            Ok(_) => panic!("incomplete credentials should fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err,
            NetError::CredentialsIncomplete {
                missing_username: true,
                missing_secret: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn static_resolution_surfaces_decryption_failure() {
        let mut d = device("s1", AuthMode::Static);
        d.static_username = Some("netops".to_string());
        d.static_secret_ciphertext = Some("not-hex".to_string());
        let resolver = resolver_with(vec![d]).await;

        let err = match resolver.resolve("s1", None).await {
            Ok(_) => panic!("bad ciphertext should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::Decryption { ref field, .. } if field == "password"));
    }

    #[tokio::test]
    async fn validate_is_structural() {
        let resolver = resolver_with(vec![]).await;
        let mut creds = Credentials {
            username: "admin".to_string(),
            secret: "pw".to_string(),
            auth_mode: AuthMode::Static,
            community: None,
            port: 22,
        };
        assert!(resolver.validate(&creds));
        creds.secret.clear();
        assert!(!resolver.validate(&creds));
        creds.secret = "x".repeat(500);
        assert!(!resolver.validate(&creds));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = Credentials {
            username: "admin".to_string(),
            secret: "topsecret".to_string(),
            auth_mode: AuthMode::Dynamic,
            community: Some("public".to_string()),
            port: 22,
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("topsecret"));
        assert!(!rendered.contains("public"));
    }
}
