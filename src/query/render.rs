use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| match Regex::new(r"\{(\w+)\}") {
    Ok(re) => re,
    Err(err) => panic!("invalid PLACEHOLDER regex: {err}"),
});

/// Query parameters substituted into `{name}` placeholders.
pub type QueryParams = BTreeMap<String, String>;

/// A command with its parameters substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub template: String,
    pub command: String,
    /// Placeholders left in `command` because no parameter supplied them.
    pub missing: Vec<String>,
}

impl RenderedCommand {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Placeholder names used by `command`.
pub fn placeholders(command: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .captures_iter(command)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Substitutes known parameters. Unknown placeholders stay literal.
pub fn render(command: &str, params: &QueryParams) -> RenderedCommand {
    let mut missing = Vec::new();
    let rendered = PLACEHOLDER.replace_all(command, |caps: &Captures<'_>| {
        let name = &caps[1];
        match params.get(name) {
            Some(value) => value.clone(),
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                caps[0].to_string()
            }
        }
    });
    RenderedCommand {
        template: command.to_string(),
        command: rendered.into_owned(),
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> QueryParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn known_parameters_are_substituted() {
        let rendered = render(
            "show mac address-table address {mac_address} vlan {vlan}",
            &params(&[("mac_address", "0011.2233.4455"), ("vlan", "10")]),
        );
        assert!(rendered.is_complete());
        assert_eq!(
            rendered.command,
            "show mac address-table address 0011.2233.4455 vlan 10"
        );
    }

    #[test]
    fn missing_parameters_stay_literal_and_are_flagged_once() {
        let rendered = render("display {section} {section} {depth}", &params(&[("depth", "2")]));
        assert_eq!(rendered.command, "display {section} {section} 2");
        assert_eq!(rendered.missing, vec!["section".to_string()]);
    }

    #[test]
    fn placeholder_extraction_ignores_non_word_braces() {
        let found = placeholders("show run | section {name} {not valid} {x1}");
        assert_eq!(
            found.into_iter().collect::<Vec<_>>(),
            vec!["name".to_string(), "x1".to_string()]
        );
    }
}
