//! Output Parser Engine.
//!
//! Turns raw command output into rows. Template resolution order:
//!
//! 1. an explicitly named custom template from the [`TemplateStore`]
//! 2. the platform template named after the normalized command
//! 3. the platform template sharing the most keywords with the command
//! 4. line fallback, one `{line_number, content}` row per non-blank line
//!
//! Parsing never fails: a template that cannot be compiled or raises while
//! applied degrades to the line fallback with [`ParsingMethod::Error`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use moka::sync::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ParserConfig;
use crate::error::NetError;
use crate::platform;

pub mod builtin;
pub mod fsm;
pub mod store;

pub use builtin::BuiltinIndex;
pub use fsm::{Row, Template};
pub use store::{CustomTemplateInfo, TemplateStore};

const CUSTOM: &str = "custom";
const BUILTIN: &str = "builtin";

/// Tokens that are addresses rather than command words.
static ADDRESS_TOKEN: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(r"^[0-9a-f]*[:.][0-9a-f:.]*(/\d+)?$") {
        Ok(re) => re,
        Err(err) => panic!("invalid ADDRESS_TOKEN regex: {err}"),
    }
});

/// How a [`ParseOutcome`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParsingMethod {
    Template,
    Fallback,
    /// A template was found but failed. Rows hold the line fallback.
    Error,
    /// Parsing was disabled for this command set.
    Raw,
    /// The command did not run, nothing to parse.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParseOutcome {
    pub rows: Vec<Row>,
    pub template_used: Option<String>,
    pub method: ParsingMethod,
    pub error: Option<String>,
}

impl ParseOutcome {
    pub fn fallback(raw: &str) -> Self {
        Self {
            rows: fallback_rows(raw),
            template_used: None,
            method: ParsingMethod::Fallback,
            error: None,
        }
    }

    fn degraded(raw: &str, err: &NetError) -> Self {
        Self {
            rows: fallback_rows(raw),
            template_used: None,
            method: ParsingMethod::Error,
            error: Some(err.to_string()),
        }
    }

    pub fn raw() -> Self {
        Self {
            rows: Vec::new(),
            template_used: None,
            method: ParsingMethod::Raw,
            error: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            rows: Vec::new(),
            template_used: None,
            method: ParsingMethod::Skipped,
            error: None,
        }
    }
}

/// One row per non-blank line of `raw`.
pub fn fallback_rows(raw: &str) -> Vec<Row> {
    raw.trim()
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let mut row = Row::new();
            row.insert("line_number".to_string(), Value::from(index + 1));
            row.insert("content".to_string(), Value::from(line.trim()));
            row
        })
        .collect()
}

/// Template-name form of a command.
///
/// Lowercased, pipes and everything after a numeric argument dropped,
/// address-like tokens removed, words joined with underscores.
pub fn normalize_command(command: &str) -> String {
    let lower = command.trim().to_ascii_lowercase();
    let head = lower.split('|').next().unwrap_or_default();
    let mut words = Vec::new();
    for token in head.split_whitespace() {
        if token.starts_with(|c: char| c.is_ascii_digit()) {
            break;
        }
        if ADDRESS_TOKEN.is_match(token) {
            continue;
        }
        let word: String = token
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
            .collect();
        if !word.is_empty() {
            words.push(word);
        }
    }
    words.join("_")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    Custom,
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParserStats {
    pub builtin_templates: usize,
    pub custom_templates: usize,
    pub cached_templates: u64,
    pub builtin_dir: Option<PathBuf>,
    pub custom_dir: PathBuf,
    pub total_parses: u64,
    pub template_parses: u64,
    pub fallback_parses: u64,
    pub failed_parses: u64,
}

/// Maps raw output to rows.
pub struct ParserEngine {
    store: TemplateStore,
    builtin: BuiltinIndex,
    compiled: Cache<(String, String), Arc<Template>>,
    total: AtomicU64,
    templated: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

impl ParserEngine {
    pub fn new(config: &ParserConfig) -> Self {
        let store = TemplateStore::new(
            config.custom_dir.clone(),
            config.template_extension.clone(),
            config.description_extension.clone(),
        );
        let builtin = BuiltinIndex::load(config.builtin_dir.as_deref(), &config.template_extension);
        Self {
            store,
            builtin,
            compiled: Cache::new(config.compiled_cache_capacity),
            total: AtomicU64::new(0),
            templated: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    fn compiled(&self, namespace: &str, name: &str) -> Result<Option<Arc<Template>>, NetError> {
        let key = (namespace.to_string(), name.to_string());
        if let Some(template) = self.compiled.get(&key) {
            return Ok(Some(template));
        }
        let text = if namespace == CUSTOM {
            self.store.load(name)?
        } else {
            self.builtin.read(name)?
        };
        let Some(text) = text else {
            return Ok(None);
        };
        let template = Arc::new(Template::parse(name, &text)?);
        self.compiled.insert(key, template.clone());
        debug!("Compiled {} template {}", namespace, name);
        Ok(Some(template))
    }

    fn resolve(
        &self,
        platform: &str,
        command: &str,
        custom: Option<&str>,
    ) -> Result<Option<(Arc<Template>, Match)>, NetError> {
        if let Some(name) = custom.filter(|n| !n.is_empty()) {
            match self.compiled(CUSTOM, name)? {
                Some(template) => return Ok(Some((template, Match::Custom))),
                None => warn!(
                    "Custom template {} not found, trying {} templates",
                    name, platform
                ),
            }
        }

        let normalized = normalize_command(command);
        if normalized.is_empty() {
            return Ok(None);
        }

        let candidates = [
            format!("{platform}_{normalized}"),
            format!("{platform}_{}", normalized.replace('-', "_")),
        ];
        for candidate in &candidates {
            if self.builtin.contains(candidate) {
                return Ok(self
                    .compiled(BUILTIN, candidate)?
                    .map(|t| (t, Match::Exact)));
            }
        }

        match self.fuzzy_match(platform, &normalized) {
            Some(name) => {
                debug!("Fuzzy matched '{}' to template {}", command, name);
                Ok(self.compiled(BUILTIN, &name)?.map(|t| (t, Match::Fuzzy)))
            }
            None => Ok(None),
        }
    }

    /// Best platform template by total length of shared keywords.
    ///
    /// The leading verb (`show`, `display`) is not a keyword.
    fn fuzzy_match(&self, platform: &str, normalized: &str) -> Option<String> {
        let keywords: Vec<&str> = normalized
            .split(['_', '-'])
            .skip(1)
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return None;
        }

        let prefix_len = platform.len() + 1;
        let mut best: Option<(&str, usize)> = None;
        for name in self.builtin.platform_templates(platform) {
            let command_part = &name[prefix_len..];
            let score: usize = keywords
                .iter()
                .filter(|k| command_part.contains(**k))
                .map(|k| k.len())
                .sum();
            if score > best.map(|(_, s)| s).unwrap_or(0) {
                best = Some((name, score));
            }
        }
        best.map(|(name, _)| name.to_string())
    }

    /// Parses `raw` produced by `command` on a device of `platform`.
    pub fn parse(
        &self,
        raw: &str,
        platform: &str,
        command: &str,
        custom: Option<&str>,
    ) -> ParseOutcome {
        self.total.fetch_add(1, Ordering::Relaxed);
        let parser_platform = platform::parser_platform(platform);

        let resolved = match self.resolve(parser_platform, command, custom) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!("Template lookup for '{}' failed: {}", command, err);
                self.failures.fetch_add(1, Ordering::Relaxed);
                return ParseOutcome::degraded(raw, &err);
            }
        };

        let Some((template, matched)) = resolved else {
            debug!(
                "No template for {} '{}', using line fallback",
                parser_platform, command
            );
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            return ParseOutcome::fallback(raw);
        };

        match template.apply(raw) {
            Ok(rows) if rows.is_empty() && matched == Match::Fuzzy => {
                debug!(
                    "Fuzzy template {} produced nothing for '{}'",
                    template.name(),
                    command
                );
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                ParseOutcome::fallback(raw)
            }
            Ok(rows) => {
                self.templated.fetch_add(1, Ordering::Relaxed);
                ParseOutcome {
                    rows,
                    template_used: Some(template.name().to_string()),
                    method: ParsingMethod::Template,
                    error: None,
                }
            }
            Err(err) => {
                warn!("Template {} failed on '{}': {}", template.name(), command, err);
                self.failures.fetch_add(1, Ordering::Relaxed);
                ParseOutcome::degraded(raw, &err)
            }
        }
    }

    /// Rows only.
    pub fn parse_rows(
        &self,
        raw: &str,
        platform: &str,
        command: &str,
        custom: Option<&str>,
    ) -> Vec<Row> {
        self.parse(raw, platform, command, custom).rows
    }

    /// Compiles and stores a custom template, replacing any previous version.
    pub fn add_custom_template(
        &self,
        name: &str,
        content: &str,
        description: Option<&str>,
    ) -> Result<(), NetError> {
        TemplateStore::validate_name(name)?;
        Template::parse(name, content)?;
        self.store.save(name, content, description)?;
        self.compiled
            .invalidate(&(CUSTOM.to_string(), name.to_string()));
        Ok(())
    }

    pub fn list_custom_templates(&self) -> Result<Vec<CustomTemplateInfo>, NetError> {
        self.store.list()
    }

    pub fn delete_custom_template(&self, name: &str) -> Result<(), NetError> {
        self.store.delete(name)?;
        self.compiled
            .invalidate(&(CUSTOM.to_string(), name.to_string()));
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.compiled.invalidate_all();
    }

    pub fn stats(&self) -> ParserStats {
        self.compiled.run_pending_tasks();
        ParserStats {
            builtin_templates: self.builtin.len(),
            custom_templates: self.store.count(),
            cached_templates: self.compiled.entry_count(),
            builtin_dir: self.builtin.dir().map(|d| d.to_path_buf()),
            custom_dir: self.store.dir().to_path_buf(),
            total_parses: self.total.load(Ordering::Relaxed),
            template_parses: self.templated.load(Ordering::Relaxed),
            fallback_parses: self.fallbacks.load(Ordering::Relaxed),
            failed_parses: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_BRIEF: &str = "\
Interface              IP-Address      OK? Method Status                Protocol
GigabitEthernet0/0     10.0.0.1        YES NVRAM  up                    up
GigabitEthernet0/1     unassigned      YES unset  administratively down down
";

    const MAC_TABLE: &str = "\
          Mac Address Table
-------------------------------------------

Vlan    Mac Address       Type        Ports
----    -----------       --------    -----
  10    0011.2233.4455    DYNAMIC     Gi0/1
  20    aabb.ccdd.eeff    STATIC      Gi0/2
";

    fn engine() -> (tempfile::TempDir, ParserEngine) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ParserConfig {
            custom_dir: dir.path().join("custom"),
            ..ParserConfig::default()
        };
        (dir, ParserEngine::new(&config))
    }

    #[test]
    fn command_normalization() {
        assert_eq!(
            normalize_command("Show IP Interface Brief | include up"),
            "show_ip_interface_brief"
        );
        assert_eq!(
            normalize_command("show mac address-table address 0011.2233.4455"),
            "show_mac_address-table_address"
        );
        assert_eq!(normalize_command("display interface 10 verbose"), "display_interface");
        assert_eq!(normalize_command("show ip route 10.0.0.0/8"), "show_ip_route");
    }

    #[test]
    fn exact_template_is_used_for_platform_alias() {
        let (_dir, engine) = engine();
        let outcome = engine.parse(IP_BRIEF, "cisco_iosxe", "show ip interface brief", None);
        assert_eq!(outcome.method, ParsingMethod::Template);
        assert_eq!(
            outcome.template_used.as_deref(),
            Some("cisco_ios_show_ip_interface_brief")
        );
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[1]["STATUS"], "administratively down");
    }

    #[test]
    fn fuzzy_match_scores_shared_keywords() {
        let (_dir, engine) = engine();
        let outcome = engine.parse(MAC_TABLE, "cisco_ios", "show mac address-table dynamic", None);
        assert_eq!(outcome.method, ParsingMethod::Template);
        assert_eq!(
            outcome.template_used.as_deref(),
            Some("cisco_ios_show_mac_address-table")
        );
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[0]["PORTS"], serde_json::json!(["Gi0/1"]));
    }

    #[test]
    fn unknown_command_falls_back_to_lines() {
        let (_dir, engine) = engine();
        let outcome = engine.parse("first\n\n  second  \n", "acme_os", "show widgets", None);
        assert_eq!(outcome.method, ParsingMethod::Fallback);
        assert_eq!(outcome.template_used, None);
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[1]["line_number"], 3);
        assert_eq!(outcome.rows[1]["content"], "second");
    }

    #[test]
    fn custom_templates_take_precedence_and_reload_on_replace() {
        let (_dir, engine) = engine();
        engine
            .add_custom_template("names", "Value NAME (\\S+)\n\nStart\n  ^name ${NAME} -> Record\n", Some("names"))
            .expect("add");
        let outcome = engine.parse("name a\nname b\n", "cisco_ios", "show version", Some("names"));
        assert_eq!(outcome.template_used.as_deref(), Some("names"));
        assert_eq!(outcome.rows.len(), 2);

        engine
            .add_custom_template("names", "Value ID (\\S+)\n\nStart\n  ^name ${ID} -> Record\n", None)
            .expect("replace");
        let outcome = engine.parse("name a\n", "cisco_ios", "show version", Some("names"));
        assert_eq!(outcome.rows[0]["ID"], "a");

        engine.delete_custom_template("names").expect("delete");
        assert!(engine.list_custom_templates().expect("list").is_empty());
    }

    #[test]
    fn invalid_custom_template_is_rejected_before_saving() {
        let (_dir, engine) = engine();
        let err = match engine.add_custom_template("broken", "Start\n  ^x\n", None) {
            Ok(_) => panic!("syntax error expected"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::TemplateSyntax { .. }));
        assert!(engine.list_custom_templates().expect("list").is_empty());
    }

    #[test]
    fn failing_template_degrades_to_fallback() {
        let (_dir, engine) = engine();
        engine
            .add_custom_template(
                "strict",
                "Value NAME (\\S+)\n\nStart\n  ^name ${NAME} -> Record\n  ^. -> Error\n",
                None,
            )
            .expect("add");
        let outcome = engine.parse("name a\n% oops\n", "cisco_ios", "show x", Some("strict"));
        assert_eq!(outcome.method, ParsingMethod::Error);
        assert!(outcome.error.is_some());
        assert_eq!(outcome.rows.len(), 2);

        let stats = engine.stats();
        assert_eq!(stats.failed_parses, 1);
        assert_eq!(stats.custom_templates, 1);
        assert!(stats.builtin_templates >= 8);
    }
}
