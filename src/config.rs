//! Configuration for links, pooling, queries, credentials, parsing and sessions.
//!
//! The first half of this module holds the SSH algorithm preference tables used
//! by [`crate::link::SecurityLevel`]. The second half holds the
//! runtime settings. Every setting has a built-in default and may be overridden
//! from the environment:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RNETOPS_CONNECT_TIMEOUT` | 30s | Connect timeout per attempt |
//! | `RNETOPS_COMMAND_TIMEOUT` | 60s | Command timeout |
//! | `RNETOPS_MAX_RETRIES` | 3 | Connect attempts per link |
//! | `RNETOPS_POOL_MAX_SIZE` | 100 | Pool capacity |
//! | `RNETOPS_POOL_MIN_SIZE` | 5 | Warm entries kept by the idle sweep |
//! | `RNETOPS_MAX_CONCURRENT_CONNECTIONS` | 50 | Global connect gate |
//! | `RNETOPS_MAX_CONCURRENT_QUERIES` | 20 | Query fan-out gate |
//! | `RNETOPS_SECRET_TTL` | 3600s | Dynamic secret cache TTL |
//! | `RNETOPS_TEMPLATE_DIR` | `templates/custom` | Custom parse template store |

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};
use serde::{Deserialize, Serialize};

use crate::link::SecurityLevel;

/// All supported key exchange algorithms in order of preference.
///
/// Includes modern algorithms like Curve25519 as well as legacy Diffie-Hellman
/// variants for compatibility with older devices.
pub const ALL_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G15_SHA512,
    kex::DH_G16_SHA512,
    kex::DH_G17_SHA512,
    kex::DH_G18_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::NONE,
];

/// Modern key exchange only.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
];

/// Modern key exchange plus SHA-1 group exchange seen on older IOS and VRP images.
pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA256,
    kex::DH_G14_SHA1,
    kex::DH_GEX_SHA1,
];

/// Everything the client can speak.
pub const LEGACY_KEX_ORDER: &[kex::Name] = ALL_KEX_ORDER;

/// All supported cipher algorithms for encryption.
///
/// Includes modern ciphers like AES-GCM and ChaCha20-Poly1305, as well as
/// legacy CBC mode ciphers for compatibility with older devices.
pub static ALL_CIPHERS: &[cipher::Name] = &[
    cipher::CLEAR,
    cipher::NONE,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_256_GCM,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
    cipher::CHACHA20_POLY1305,
];

pub static SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub static BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_128_CBC,
];

/// All supported MAC (Message Authentication Code) algorithms.
///
/// Includes both standard HMAC variants and ETM (Encrypt-then-MAC) variants
/// for enhanced security.
pub const ALL_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::NONE,
    mac::HMAC_SHA1,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = ALL_MAC_ALGORITHMS;

/// All supported compression algorithms.
pub const ALL_COMPRESSION_ALGORITHMS: &[compression::Name] = &[
    compression::NONE,
    compression::ZLIB,
    compression::ZLIB_LEGACY,
];

/// Compression offered by every profile. Device CLIs rarely benefit from zlib.
pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = &[compression::NONE];

/// All supported host key algorithms.
///
/// Includes modern algorithms like Ed25519 and ECDSA, as well as legacy
/// RSA and DSA for compatibility with older devices.
pub const ALL_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Dsa,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Ed25519,
    Algorithm::Rsa { hash: None },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::SkEcdsaSha2NistP256,
    Algorithm::SkEd25519,
];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

pub const BALANCED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
];

pub const LEGACY_KEY_TYPES: &[Algorithm] = ALL_KEY_TYPES;

const ENV_PREFIX: &str = "RNETOPS_";

/// Serializes a [`Duration`] as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Settings for a single device link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Timeout for one connect attempt.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Default timeout for one command.
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,
    /// Connect attempts before giving up, the first included.
    pub max_retry_attempts: usize,
    #[serde(with = "duration_secs")]
    pub retry_min_delay: Duration,
    #[serde(with = "duration_secs")]
    pub retry_max_delay: Duration,
    /// Minimum spacing between probe commands issued by health checks.
    #[serde(with = "duration_secs")]
    pub health_probe_interval: Duration,
    #[serde(with = "duration_secs")]
    pub max_lifetime: Duration,
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    pub security: SecurityLevel,
    pub terminal_width: u32,
    pub terminal_height: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            max_retry_attempts: 3,
            retry_min_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(10),
            health_probe_interval: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(1800),
            security: SecurityLevel::Secure,
            terminal_width: 120,
            terminal_height: 24,
        }
    }
}

/// Settings for the link pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    pub min_size: usize,
    #[serde(with = "duration_secs")]
    pub idle_sweep_interval: Duration,
    #[serde(with = "duration_secs")]
    pub health_sweep_interval: Duration,
    /// How long `acquire` waits on the connect gate before failing.
    #[serde(with = "duration_secs")]
    pub acquire_timeout: Duration,
    pub max_concurrent_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            min_size: 5,
            idle_sweep_interval: Duration::from_secs(600),
            health_sweep_interval: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
            max_concurrent_connections: 50,
        }
    }
}

/// Settings for the query orchestrator and connection probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_concurrent_queries: usize,
    pub max_concurrent_auth_tests: usize,
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub stability_duration: Duration,
    #[serde(with = "duration_secs")]
    pub stability_interval: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 20,
            max_concurrent_auth_tests: 10,
            probe_timeout: Duration::from_secs(10),
            stability_duration: Duration::from_secs(60),
            stability_interval: Duration::from_secs(5),
        }
    }
}

/// Username patterns per network tier.
///
/// `{region_code}` expands to the lowercased region code and
/// `{network_layer}` to the tier name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsernamePatterns {
    pub by_tier: BTreeMap<String, String>,
    pub fallback: String,
}

impl Default for UsernamePatterns {
    fn default() -> Self {
        let by_tier = [
            ("access", "op{region_code}jr"),
            ("aggregation", "op{region_code}hj"),
            ("core", "op{region_code}hx"),
        ]
        .into_iter()
        .map(|(tier, pattern)| (tier.to_string(), pattern.to_string()))
        .collect();
        Self {
            by_tier,
            fallback: "{region_code}_{network_layer}_admin".to_string(),
        }
    }
}

/// Settings for credential resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    #[serde(with = "duration_secs")]
    pub secret_ttl: Duration,
    pub max_cached_secrets: u64,
    pub username_patterns: UsernamePatterns,
    pub max_username_len: usize,
    pub max_secret_len: usize,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            secret_ttl: Duration::from_secs(3600),
            max_cached_secrets: 1000,
            username_patterns: UsernamePatterns::default(),
            max_username_len: 64,
            max_secret_len: 128,
        }
    }
}

/// Settings for the output parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Extra directory of platform templates named `{platform}_{command}.textfsm`.
    pub builtin_dir: Option<PathBuf>,
    /// Writable store for custom templates.
    pub custom_dir: PathBuf,
    pub template_extension: String,
    pub description_extension: String,
    pub compiled_cache_capacity: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            builtin_dir: None,
            custom_dir: PathBuf::from("templates/custom"),
            template_extension: "textfsm".to_string(),
            description_extension: "desc".to_string(),
            compiled_cache_capacity: 512,
        }
    }
}

/// Settings for interactive terminal sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "duration_secs")]
    pub reaper_interval: Duration,
    #[serde(with = "duration_secs")]
    pub idle_limit: Duration,
    #[serde(with = "duration_secs")]
    pub disconnected_idle_limit: Duration,
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub completion_timeout: Duration,
    pub config_enter_keywords: Vec<String>,
    pub config_exit_keywords: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(300),
            idle_limit: Duration::from_secs(3600),
            disconnected_idle_limit: Duration::from_secs(600),
            command_timeout: Duration::from_secs(30),
            completion_timeout: Duration::from_secs(5),
            config_enter_keywords: [
                "system-view",
                "configure terminal",
                "configuration terminal",
                "conf t",
                "configure",
                "config",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            config_exit_keywords: ["quit", "exit", "end", "return"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Aggregate runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetOpsConfig {
    pub link: LinkConfig,
    pub pool: PoolConfig,
    pub query: QueryConfig,
    pub credentials: CredentialConfig,
    pub parser: ParserConfig,
    pub session: SessionConfig,
}

impl NetOpsConfig {
    /// Defaults overlaid with `RNETOPS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.overlay_with(|key| env::var(key).ok());
        config
    }

    /// Overlays values returned by `lookup`, keyed by full variable name.
    ///
    /// Unparseable values are ignored and the current value kept.
    pub fn overlay_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let secs = |name: &str| {
            get(name)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
        };
        let count = |name: &str| get(name).and_then(|v| v.trim().parse::<usize>().ok());

        if let Some(v) = secs("CONNECT_TIMEOUT") {
            self.link.connect_timeout = v;
        }
        if let Some(v) = secs("COMMAND_TIMEOUT") {
            self.link.command_timeout = v;
        }
        if let Some(v) = count("MAX_RETRIES") {
            self.link.max_retry_attempts = v.max(1);
        }
        if let Some(v) = secs("MAX_LIFETIME") {
            self.link.max_lifetime = v;
        }
        if let Some(v) = secs("IDLE_TIMEOUT") {
            self.link.idle_timeout = v;
        }
        if let Some(level) = get("SECURITY_LEVEL").and_then(|v| v.parse::<SecurityLevel>().ok()) {
            self.link.security = level;
        }
        if let Some(v) = count("POOL_MAX_SIZE") {
            self.pool.max_size = v;
        }
        if let Some(v) = count("POOL_MIN_SIZE") {
            self.pool.min_size = v;
        }
        if let Some(v) = secs("POOL_ACQUIRE_TIMEOUT") {
            self.pool.acquire_timeout = v;
        }
        if let Some(v) = count("MAX_CONCURRENT_CONNECTIONS") {
            self.pool.max_concurrent_connections = v.max(1);
        }
        if let Some(v) = count("MAX_CONCURRENT_QUERIES") {
            self.query.max_concurrent_queries = v.max(1);
        }
        if let Some(v) = count("MAX_CONCURRENT_AUTH_TESTS") {
            self.query.max_concurrent_auth_tests = v.max(1);
        }
        if let Some(v) = secs("SECRET_TTL") {
            self.credentials.secret_ttl = v;
        }
        if let Some(v) = get("TEMPLATE_DIR") {
            self.parser.custom_dir = PathBuf::from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_follow_documented_values() {
        let config = NetOpsConfig::default();
        assert_eq!(config.pool.max_size, 100);
        assert_eq!(config.pool.min_size, 5);
        assert_eq!(config.link.command_timeout, Duration::from_secs(60));
        assert_eq!(config.query.max_concurrent_queries, 20);
        assert_eq!(
            config.credentials.username_patterns.by_tier["core"],
            "op{region_code}hx"
        );
    }

    #[test]
    fn overlay_replaces_only_parseable_values() {
        let vars: HashMap<&str, &str> = [
            ("RNETOPS_POOL_MAX_SIZE", "8"),
            ("RNETOPS_COMMAND_TIMEOUT", "2.5"),
            ("RNETOPS_MAX_CONCURRENT_QUERIES", "not-a-number"),
            ("RNETOPS_SECURITY_LEVEL", "legacy"),
        ]
        .into_iter()
        .collect();

        let mut config = NetOpsConfig::default();
        config.overlay_with(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.pool.max_size, 8);
        assert_eq!(config.link.command_timeout, Duration::from_millis(2500));
        assert_eq!(config.query.max_concurrent_queries, 20);
        assert_eq!(config.link.security, SecurityLevel::LegacyCompatible);
    }

    #[test]
    fn config_round_trips_through_json_with_partial_input() {
        let parsed: NetOpsConfig =
            serde_json::from_str(r#"{"pool":{"max_size":3},"session":{"idle_limit":1.5}}"#)
                .expect("parse partial config");
        assert_eq!(parsed.pool.max_size, 3);
        assert_eq!(parsed.pool.min_size, 5);
        assert_eq!(parsed.session.idle_limit, Duration::from_millis(1500));
    }

    #[test]
    fn secure_tables_exclude_null_algorithms() {
        assert!(!SECURE_KEX_ORDER.contains(&kex::NONE));
        assert!(!SECURE_CIPHERS.contains(&cipher::NONE));
        assert!(!BALANCED_MAC_ALGORITHMS.contains(&mac::NONE));
    }
}
