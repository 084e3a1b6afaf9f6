//! Finite platform tables.
//!
//! Vendor codes map to platform tags, and platform tags map to probe
//! commands, session setup commands, parser namespaces and prompt profiles.
//! Unknown inputs fall back to [`DEFAULT_PLATFORM`].

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::NetError;
use crate::inventory::{Device, Vendor};
use crate::prompt::{InputRule, PromptMatcher, PromptProfile};

pub const DEFAULT_PLATFORM: &str = "generic";

static VENDOR_PLATFORMS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("cisco", "cisco_iosxe"),
        ("huawei", "huawei_vrp"),
        ("h3c", "hp_comware"),
        ("juniper", "juniper_junos"),
        ("arista", "arista_eos"),
        ("nokia", "nokia_sros"),
        ("fortinet", "fortinet_fortios"),
        ("paloalto", "paloalto_panos"),
        ("checkpoint", "checkpoint_gaia"),
        ("f5", "f5_tmsh"),
        ("dell", "dell_os10"),
        ("hp", "hp_procurve"),
        ("extreme", "extreme_exos"),
        ("mikrotik", "mikrotik_routeros"),
        ("vyos", "vyos"),
        ("linux", "linux"),
    ])
});

static PROBE_COMMANDS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("hp_comware", "display clock"),
        ("huawei_vrp", "display clock"),
        ("cisco_iosxe", "show clock"),
        ("cisco_ios", "show clock"),
        ("cisco_nxos", "show clock"),
        ("juniper_junos", "show system uptime | display terse"),
        ("arista_eos", "show clock"),
        ("nokia_sros", "show time"),
        ("extreme_exos", "show time"),
        ("mikrotik_routeros", "system clock print"),
        ("vyos", "show date"),
        ("linux", "date"),
        ("generic", "show clock"),
    ])
});

/// Platform tag for a vendor code such as `cisco` or `H3C`.
pub fn platform_for_vendor(code: &str) -> &'static str {
    VENDOR_PLATFORMS
        .get(code.trim().to_ascii_lowercase().as_str())
        .copied()
        .unwrap_or(DEFAULT_PLATFORM)
}

/// Effective platform: device hint, then vendor tag, then vendor code.
pub fn resolve_platform(device: &Device, vendor: Option<&Vendor>) -> String {
    if let Some(hint) = device.platform_hint.as_deref().filter(|h| !h.is_empty()) {
        return hint.to_ascii_lowercase();
    }
    vendor_platform(vendor)
}

/// Platform of a vendor: explicit tag, then vendor code.
pub fn vendor_platform(vendor: Option<&Vendor>) -> String {
    match vendor {
        Some(v) => match v.platform_tag.as_deref().filter(|t| !t.is_empty()) {
            Some(tag) => tag.to_ascii_lowercase(),
            None => platform_for_vendor(&v.code).to_string(),
        },
        None => DEFAULT_PLATFORM.to_string(),
    }
}

/// Cheap read-only command used for connection tests and health probes.
pub fn probe_command(platform: &str) -> &'static str {
    PROBE_COMMANDS
        .get(platform)
        .copied()
        .unwrap_or("show clock")
}

/// Template namespace used by the parser for a platform.
pub fn parser_platform(platform: &str) -> &str {
    match platform {
        "cisco_iosxe" => "cisco_ios",
        other => other,
    }
}

/// Commands run once after login to disable paging.
pub fn setup_commands(platform: &str) -> &'static [&'static str] {
    match platform {
        "cisco_iosxe" | "cisco_ios" | "cisco_nxos" | "arista_eos" | "dell_os10" => {
            &["terminal length 0"]
        }
        "huawei_vrp" => &["screen-length 0 temporary"],
        "hp_comware" => &["screen-length disable"],
        "juniper_junos" => &["set cli screen-length 0"],
        _ => &[],
    }
}

fn strings(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

fn cisco_profile() -> PromptProfile {
    PromptProfile {
        prompts: vec![
            ("Config".to_string(), strings(&[r"^\S+\(\S+\)#\s*$"])),
            ("Enable".to_string(), strings(&[r"^[^\s#]+#\s*$"])),
            ("Login".to_string(), strings(&[r"^[^\s<]+>\s*$"])),
        ],
        more: strings(&[r"\s*<--- More --->\s*", r"\s*--More--\s*"]),
        errors: strings(&[
            r"% Invalid command at '\^' marker\.",
            r"% Invalid parameter detected at '\^' marker\.",
            r"% Invalid input detected at '\^' marker\.",
            r"% Incomplete command\.",
            r"% Ambiguous command",
            r"^Command authorization failed.*",
            r"^Command rejected:.*",
            r"Access denied.",
        ]),
        ignore_errors: Vec::new(),
        inputs: vec![InputRule {
            state: "Confirm".to_string(),
            patterns: strings(&[r"\[confirm\]\s*$"]),
            response: "\n".to_string(),
            record: true,
        }],
    }
}

fn huawei_profile() -> PromptProfile {
    PromptProfile {
        prompts: vec![
            ("Config".to_string(), strings(&[r"^(HRP_M|HRP_S){0,1}\[.+]+\s*$"])),
            ("Enable".to_string(), strings(&[r"^(RBM_P|RBM_S)?<.+>\s*$"])),
        ],
        more: strings(&[r"\s*---- More ----\s*"]),
        errors: strings(&[r"Error: .+$", r"^\s+\^$"]),
        ignore_errors: Vec::new(),
        inputs: vec![InputRule {
            state: "Continue".to_string(),
            patterns: strings(&[
                r"Are you sure to continue\?\[Y\/N\]: ",
                r"Continue\? \[Y\/N\]: ",
            ]),
            response: "y\n".to_string(),
            record: true,
        }],
    }
}

fn comware_profile() -> PromptProfile {
    PromptProfile {
        prompts: vec![
            ("Config".to_string(), strings(&[r"^(RBM_P|RBM_S)?\[.+\]\s*$"])),
            ("Enable".to_string(), strings(&[r"^(RBM_P|RBM_S)?<.+>\s*$"])),
        ],
        more: strings(&[r"\s*---- More ----\s*"]),
        errors: strings(&[
            r".+\^.+",
            r"^\s+% .+",
            r"% Unrecognized command found at '\^' position\.",
            r"% Incomplete command found at '\^' position\.",
        ]),
        ignore_errors: Vec::new(),
        inputs: Vec::new(),
    }
}

fn juniper_profile() -> PromptProfile {
    PromptProfile {
        prompts: vec![
            ("Config".to_string(), strings(&[r"^\S+@\S+#\s*$"])),
            ("Enable".to_string(), strings(&[r"^\S+@\S+>\s*$"])),
        ],
        more: strings(&[r"---\(more.*\)---"]),
        errors: strings(&[
            r".*unknown command.*",
            r"syntax error.*",
            r"error:.+",
            r"\s+\^$",
        ]),
        ignore_errors: strings(&[
            r"warning: statement not found",
            r"warning: element \S+ not found",
        ]),
        inputs: vec![InputRule {
            state: "Save".to_string(),
            patterns: strings(&[r"Exit with uncommitted changes\? \[yes,no\] \(yes\) "]),
            response: "yes\n".to_string(),
            record: true,
        }],
    }
}

fn shell_profile() -> PromptProfile {
    PromptProfile {
        prompts: vec![
            ("Root".to_string(), strings(&[r"^\S*[\w\]~)]\s*#\s*$"])),
            ("User".to_string(), strings(&[r"^\S*[\w\]~)]\s*\$\s*$"])),
        ],
        more: Vec::new(),
        errors: strings(&[r"^\S+: command not found$"]),
        ignore_errors: Vec::new(),
        inputs: Vec::new(),
    }
}

fn generic_profile() -> PromptProfile {
    PromptProfile {
        prompts: vec![
            ("Config".to_string(), strings(&[r"^\S+\(\S+\)#\s*$", r"^\[.+\]\s*$"])),
            ("Enable".to_string(), strings(&[r"^[^\s#]+#\s*$", r"^<.+>\s*$"])),
            ("Login".to_string(), strings(&[r"^[^\s]+[>$%]\s*$"])),
        ],
        more: strings(&[r"--\s*[Mm]ore\s*--", r"---- More ----"]),
        errors: strings(&[r"^% .+", r"^Error: .+", r"^\s+\^$"]),
        ignore_errors: Vec::new(),
        inputs: Vec::new(),
    }
}

/// Prompt profile for a platform tag.
pub fn prompt_profile(platform: &str) -> PromptProfile {
    match platform {
        "cisco_iosxe" | "cisco_ios" | "cisco_nxos" | "cisco_xr" | "arista_eos" | "dell_os10" => {
            cisco_profile()
        }
        "huawei_vrp" => huawei_profile(),
        "hp_comware" => comware_profile(),
        "juniper_junos" => juniper_profile(),
        "linux" | "vyos" => shell_profile(),
        _ => generic_profile(),
    }
}

/// Compiled [`PromptMatcher`] for a platform tag.
pub fn prompt_matcher(platform: &str) -> Result<PromptMatcher, NetError> {
    PromptMatcher::new(&prompt_profile(platform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{AuthMode, NetworkTier};

    #[test]
    fn vendor_codes_map_to_platforms_with_generic_fallback() {
        assert_eq!(platform_for_vendor("H3C"), "hp_comware");
        assert_eq!(platform_for_vendor("cisco"), "cisco_iosxe");
        assert_eq!(platform_for_vendor("acme"), "generic");
    }

    #[test]
    fn probe_commands_follow_platform_family() {
        assert_eq!(probe_command("huawei_vrp"), "display clock");
        assert_eq!(
            probe_command("juniper_junos"),
            "show system uptime | display terse"
        );
        assert_eq!(probe_command("unknown"), "show clock");
    }

    #[test]
    fn device_hint_overrides_vendor() {
        let mut device = Device {
            id: "d".to_string(),
            hostname: "d".to_string(),
            ip_address: "192.0.2.1".to_string(),
            port: 22,
            vendor_id: "v".to_string(),
            region_id: "r".to_string(),
            network_layer: NetworkTier::Access,
            platform_hint: None,
            auth_mode: AuthMode::Dynamic,
            static_username: None,
            static_secret_ciphertext: None,
            active: true,
        };
        let vendor = Vendor {
            id: "v".to_string(),
            code: "huawei".to_string(),
            name: "Huawei".to_string(),
            platform_tag: None,
            connect_timeout_secs: None,
            command_timeout_secs: None,
        };
        assert_eq!(resolve_platform(&device, Some(&vendor)), "huawei_vrp");
        device.platform_hint = Some("Linux".to_string());
        assert_eq!(resolve_platform(&device, Some(&vendor)), "linux");
    }

    #[test]
    fn every_profile_compiles() {
        for platform in [
            "cisco_iosxe",
            "huawei_vrp",
            "hp_comware",
            "juniper_junos",
            "linux",
            "generic",
        ] {
            prompt_matcher(platform).expect("profile should compile");
        }
    }

    #[test]
    fn vendor_prompts_are_recognized() {
        let huawei = prompt_matcher("huawei_vrp").expect("huawei");
        assert!(huawei.read_prompt("<HUAWEI>"));
        assert!(huawei.read_prompt("[HUAWEI-GigabitEthernet0/0/1]"));

        let cisco = prompt_matcher("cisco_iosxe").expect("cisco");
        assert!(cisco.read_prompt("core-1#"));
        assert!(cisco.read_prompt("core-1(config-if)#"));
        assert!(!cisco.read_prompt("Cisco IOS XE Software, Version 17.3"));
    }
}
