//! Platform template index.
//!
//! Templates are named `{platform}_{command}` where `command` is the
//! normalized command with spaces as underscores. A small set ships embedded
//! in the crate; an optional directory (for example a checkout of
//! ntc-templates) adds or overrides entries.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::NetError;

const CISCO_IOS_SHOW_VERSION: &str = r"Value VERSION ([^,\s]+)
Value HOSTNAME (\S+)
Value UPTIME (.+)
Value HARDWARE (\S+)
Value SERIAL (\S+)

Start
  ^.*Software.*Version\s+${VERSION}
  ^\s*${HOSTNAME}\s+uptime\s+is\s+${UPTIME}
  ^[Cc]isco\s+${HARDWARE}\s+.+processor
  ^[Pp]rocessor\s+board\s+ID\s+${SERIAL}
";

const CISCO_IOS_SHOW_CLOCK: &str = r"Value TIME (\d+:\d+:\d+(?:\.\d+)?)
Value TIMEZONE (\S+)
Value DAYWEEK (\w+)
Value MONTH (\w+)
Value DAY (\d+)
Value YEAR (\d+)

Start
  ^[*.]?${TIME}\s+${TIMEZONE}\s+${DAYWEEK}\s+${MONTH}\s+${DAY}\s+${YEAR}\s*$$ -> Record
";

const CISCO_IOS_SHOW_IP_INTERFACE_BRIEF: &str = r"Value INTERFACE (\S+)
Value IP_ADDRESS (\S+)
Value STATUS (up|down|administratively down)
Value PROTO (up|down)

Start
  ^${INTERFACE}\s+${IP_ADDRESS}\s+\w+\s+\w+\s+${STATUS}\s+${PROTO}\s*$$ -> Record
";

const CISCO_IOS_SHOW_MAC_ADDRESS_TABLE: &str = r"Value VLAN (\d+|All)
Value MAC_ADDRESS ([0-9a-fA-F]{4}\.[0-9a-fA-F]{4}\.[0-9a-fA-F]{4})
Value TYPE (\S+)
Value List PORTS (\S+)

Start
  ^\s*${VLAN}\s+${MAC_ADDRESS}\s+${TYPE}\s+${PORTS}\s*$$ -> Record
";

const HUAWEI_VRP_DISPLAY_VERSION: &str = r"Value VRP_VERSION (\S+)
Value PRODUCT_VERSION (.+)
Value MODEL (\S+)
Value UPTIME (.+)

Start
  ^VRP\s+\(R\)\s+software,\s+Version\s+${VRP_VERSION}\s+\(${PRODUCT_VERSION}\)
  ^HUAWEI\s+${MODEL}\s+uptime\s+is\s+${UPTIME}
";

const HUAWEI_VRP_DISPLAY_INTERFACE_BRIEF: &str = r"Value INTERFACE (\S+)
Value PHY (\S+)
Value PROTOCOL (\S+)
Value IN_UTI (\S+)
Value OUT_UTI (\S+)
Value IN_ERRORS (\d+)
Value OUT_ERRORS (\d+)

Start
  ^Interface\s+PHY -> Interfaces

Interfaces
  ^${INTERFACE}\s+${PHY}\s+${PROTOCOL}\s+${IN_UTI}\s+${OUT_UTI}\s+${IN_ERRORS}\s+${OUT_ERRORS}\s*$$ -> Record
";

const HP_COMWARE_DISPLAY_INTERFACE_BRIEF: &str = r"Value INTERFACE (\S+)
Value LINK (UP|DOWN|ADM|Stby)
Value SPEED (\S+)
Value DUPLEX (\S+)
Value TYPE (\S+)
Value PVID (\S+)
Value DESCRIPTION (.*)

Start
  ^Interface\s+Link\s+Speed -> Bridge

Bridge
  ^${INTERFACE}\s+${LINK}\s+${SPEED}\s+${DUPLEX}\s+${TYPE}\s+${PVID}\s*${DESCRIPTION}$$ -> Record
";

const JUNIPER_JUNOS_SHOW_INTERFACES_TERSE: &str = r"Value INTERFACE (\S+)
Value ADMIN (up|down)
Value LINK (up|down)
Value PROTO (\S*)
Value LOCAL (\S*)

Start
  ^Interface\s+Admin\s+Link -> Interfaces

Interfaces
  ^${INTERFACE}\s+${ADMIN}\s+${LINK}\s*${PROTO}\s*${LOCAL}\s*$$ -> Record
";

const EMBEDDED: &[(&str, &str)] = &[
    ("cisco_ios_show_version", CISCO_IOS_SHOW_VERSION),
    ("cisco_ios_show_clock", CISCO_IOS_SHOW_CLOCK),
    (
        "cisco_ios_show_ip_interface_brief",
        CISCO_IOS_SHOW_IP_INTERFACE_BRIEF,
    ),
    (
        "cisco_ios_show_mac_address-table",
        CISCO_IOS_SHOW_MAC_ADDRESS_TABLE,
    ),
    ("huawei_vrp_display_version", HUAWEI_VRP_DISPLAY_VERSION),
    (
        "huawei_vrp_display_interface_brief",
        HUAWEI_VRP_DISPLAY_INTERFACE_BRIEF,
    ),
    (
        "hp_comware_display_interface_brief",
        HP_COMWARE_DISPLAY_INTERFACE_BRIEF,
    ),
    (
        "juniper_junos_show_interfaces_terse",
        JUNIPER_JUNOS_SHOW_INTERFACES_TERSE,
    ),
];

#[derive(Debug, Clone)]
enum Source {
    Embedded(&'static str),
    File(PathBuf),
}

/// Lookup table of platform templates.
#[derive(Debug, Clone, Default)]
pub struct BuiltinIndex {
    templates: BTreeMap<String, Source>,
    dir: Option<PathBuf>,
}

impl BuiltinIndex {
    /// Embedded templates plus every `*.{extension}` file in `dir`.
    pub fn load(dir: Option<&Path>, extension: &str) -> Self {
        let mut templates: BTreeMap<String, Source> = EMBEDDED
            .iter()
            .map(|(name, text)| (name.to_string(), Source::Embedded(text)))
            .collect();

        if let Some(dir) = dir {
            match fs::read_dir(dir) {
                Ok(entries) => {
                    for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
                        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                            continue;
                        }
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            templates.insert(stem.to_ascii_lowercase(), Source::File(path.clone()));
                        }
                    }
                }
                Err(e) => warn!("Cannot read template directory {}: {}", dir.display(), e),
            }
        }
        debug!("Indexed {} platform templates", templates.len());

        Self {
            templates,
            dir: dir.map(Path::to_path_buf),
        }
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Template names of one platform, sorted.
    pub fn platform_templates<'a>(&'a self, platform: &'a str) -> impl Iterator<Item = &'a str> {
        let prefix = format!("{platform}_");
        self.templates
            .keys()
            .filter(move |name| name.starts_with(&prefix))
            .map(String::as_str)
    }

    /// Template text by index name.
    pub fn read(&self, name: &str) -> Result<Option<String>, NetError> {
        match self.templates.get(name) {
            None => Ok(None),
            Some(Source::Embedded(text)) => Ok(Some(text.to_string())),
            Some(Source::File(path)) => Ok(Some(fs::read_to_string(path)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::fsm::Template;

    #[test]
    fn embedded_templates_compile() {
        for (name, text) in EMBEDDED {
            Template::parse(name, text).expect("embedded template should compile");
        }
    }

    #[test]
    fn directory_templates_extend_the_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("arista_eos_show_vlan.textfsm"),
            "Value VLAN (\\d+)\n\nStart\n  ^${VLAN}\n",
        )
        .expect("write");
        fs::write(dir.path().join("README.md"), "ignored").expect("write");

        let index = BuiltinIndex::load(Some(dir.path()), "textfsm");
        assert_eq!(index.len(), EMBEDDED.len() + 1);
        assert!(index.contains("arista_eos_show_vlan"));
        assert_eq!(
            index.platform_templates("arista_eos").collect::<Vec<_>>(),
            vec!["arista_eos_show_vlan"]
        );
        assert!(index.read("arista_eos_show_vlan").expect("read").is_some());
    }
}
