use std::str::FromStr;

use super::*;

/// SSH algorithm policy for a link.
///
/// Each level selects a preference table from [`crate::config`] and a host
/// key policy. Older network gear often speaks only SHA-1 key exchange and
/// CBC ciphers, which only the legacy level offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    #[default]
    Secure,
    Balanced,
    LegacyCompatible,
}

impl SecurityLevel {
    /// Algorithm preferences offered during key exchange.
    pub fn algorithms(self) -> Preferred {
        let (kex, key, cipher, mac, compression) = match self {
            SecurityLevel::Secure => (
                config::SECURE_KEX_ORDER,
                config::SECURE_KEY_TYPES,
                config::SECURE_CIPHERS,
                config::SECURE_MAC_ALGORITHMS,
                config::DEFAULT_COMPRESSION_ALGORITHMS,
            ),
            SecurityLevel::Balanced => (
                config::BALANCED_KEX_ORDER,
                config::BALANCED_KEY_TYPES,
                config::BALANCED_CIPHERS,
                config::BALANCED_MAC_ALGORITHMS,
                config::DEFAULT_COMPRESSION_ALGORITHMS,
            ),
            SecurityLevel::LegacyCompatible => (
                config::LEGACY_KEX_ORDER,
                config::LEGACY_KEY_TYPES,
                config::ALL_CIPHERS,
                config::LEGACY_MAC_ALGORITHMS,
                config::ALL_COMPRESSION_ALGORITHMS,
            ),
        };
        Preferred {
            kex: Cow::Borrowed(kex),
            key: Cow::Borrowed(key),
            cipher: Cow::Borrowed(cipher),
            mac: Cow::Borrowed(mac),
            compression: Cow::Borrowed(compression),
        }
    }

    /// Host key policy. Legacy devices are reached without a known-hosts check.
    pub fn host_key_check(self) -> ServerCheckMethod {
        match self {
            SecurityLevel::Secure | SecurityLevel::Balanced => {
                ServerCheckMethod::DefaultKnownHostsFile
            }
            SecurityLevel::LegacyCompatible => ServerCheckMethod::NoCheck,
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecurityLevel::Secure => "secure",
            SecurityLevel::Balanced => "balanced",
            SecurityLevel::LegacyCompatible => "legacy_compatible",
        })
    }
}

impl FromStr for SecurityLevel {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "secure" => Ok(SecurityLevel::Secure),
            "balanced" => Ok(SecurityLevel::Balanced),
            "legacy" | "legacy_compatible" => Ok(SecurityLevel::LegacyCompatible),
            other => Err(NetError::Internal(format!("unknown security level '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SecurityLevel;
    use async_ssh2_tokio::ServerCheckMethod;
    use russh::{cipher, kex, mac};

    #[test]
    fn levels_parse_from_config_strings() {
        assert_eq!("Legacy".parse::<SecurityLevel>().ok(), Some(SecurityLevel::LegacyCompatible));
        assert_eq!("balanced".parse::<SecurityLevel>().ok(), Some(SecurityLevel::Balanced));
        assert!("paranoid".parse::<SecurityLevel>().is_err());
        assert_eq!(SecurityLevel::default().to_string(), "secure");
    }

    #[test]
    fn only_legacy_skips_host_key_check() {
        assert!(matches!(
            SecurityLevel::Secure.host_key_check(),
            ServerCheckMethod::DefaultKnownHostsFile
        ));
        assert!(matches!(
            SecurityLevel::LegacyCompatible.host_key_check(),
            ServerCheckMethod::NoCheck
        ));
    }

    #[test]
    fn secure_level_offers_no_weak_algorithms() {
        let preferred = SecurityLevel::Secure.algorithms();
        assert!(preferred.kex.iter().all(|alg| *alg != kex::DH_G1_SHA1));
        assert!(preferred.cipher.iter().all(|alg| *alg != cipher::NONE));
        assert!(preferred.mac.iter().all(|alg| *alg != mac::NONE));
    }

    #[test]
    fn legacy_level_reaches_old_devices() {
        let balanced = SecurityLevel::Balanced.algorithms();
        assert!(balanced.kex.contains(&kex::DH_G14_SHA1));
        assert!(balanced.cipher.contains(&cipher::AES_128_CBC));

        let legacy = SecurityLevel::LegacyCompatible.algorithms();
        assert!(legacy.kex.contains(&kex::DH_G1_SHA1));
        assert!(legacy.cipher.contains(&cipher::NONE));
    }
}
