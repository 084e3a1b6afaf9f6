//! Line-level prompt recognition for interactive device shells.
//!
//! A [`PromptMatcher`] classifies each line of shell output as plain output,
//! a paging marker, an error, a prompt, or a question that needs an automatic
//! answer. The SSH transport feeds it every line and uses the result to decide
//! when a command has finished and whether it failed.

use std::collections::HashMap;

use log::trace;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// Carriage-return and backspace runs that devices emit before redrawn lines.
pub static IGNORE_START_LINE: Lazy<Regex> =
    Lazy::new(
        || match Regex::new(r"^(\r+(\s+\r+)*)|(\u{8}+(\s+\u{8}+)*)") {
            Ok(re) => re,
            Err(err) => panic!("invalid IGNORE_START_LINE regex: {err}"),
        },
    );

/// ANSI CSI sequences. Stripped before matching, never rendered.
pub static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]") {
        Ok(re) => re,
        Err(err) => panic!("invalid ANSI_ESCAPE regex: {err}"),
    }
});

const OUTPUT: usize = 0;
const MORE: usize = 1;
const ERROR: usize = 2;
const PRE_STATES: [&str; 3] = ["output", "more", "error"];

/// A question the device asks that gets a fixed answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InputRule {
    pub state: String,
    pub patterns: Vec<String>,
    /// Bytes sent back, newline included.
    pub response: String,
    /// Whether the question line stays in the captured output.
    pub record: bool,
}

/// Regex description of one platform's shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PromptProfile {
    /// `(mode, patterns)` pairs, most specific first.
    pub prompts: Vec<(String, Vec<String>)>,
    pub more: Vec<String>,
    pub errors: Vec<String>,
    pub ignore_errors: Vec<String>,
    pub inputs: Vec<InputRule>,
}

/// Stateful line classifier compiled from a [`PromptProfile`].
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    current_state_index: usize,
    all_states: Vec<String>,
    all_regex: RegexSet,
    /// Maps regex match index to state index.
    regex_index_map: HashMap<usize, usize>,
    /// Inclusive range of prompt states in `all_states`.
    prompt_index: (usize, usize),
    input_map: HashMap<usize, (String, bool)>,
    ignore_errors: Option<RegexSet>,
    current_prompt: Option<String>,
}

impl PromptMatcher {
    pub fn new(profile: &PromptProfile) -> Result<Self, NetError> {
        let mut all_states: Vec<String> = PRE_STATES.iter().map(|s| s.to_string()).collect();
        let mut regexs: Vec<String> = Vec::new();
        let mut regex_index_map = HashMap::new();

        for (patterns, state) in [(&profile.more, MORE), (&profile.errors, ERROR)] {
            let start = regexs.len();
            regexs.extend(patterns.iter().cloned());
            for i in start..regexs.len() {
                regex_index_map.insert(i, state);
            }
        }

        let prompt_start = all_states.len();
        for (mode, patterns) in &profile.prompts {
            let state_index = all_states.len();
            all_states.push(mode.to_ascii_lowercase());
            let start = regexs.len();
            regexs.extend(
                patterns
                    .iter()
                    .map(|p| format!(r"^\x00*\r{{0,1}}{}", p.trim_start_matches('^'))),
            );
            for i in start..regexs.len() {
                regex_index_map.insert(i, state_index);
            }
        }
        if all_states.len() == prompt_start {
            return Err(NetError::InvalidPromptProfile(
                "at least one prompt pattern is required".to_string(),
            ));
        }
        let prompt_index = (prompt_start, all_states.len() - 1);

        let mut input_map = HashMap::new();
        for rule in &profile.inputs {
            let state_index = all_states.len();
            all_states.push(rule.state.to_ascii_lowercase());
            let start = regexs.len();
            regexs.extend(rule.patterns.iter().cloned());
            for i in start..regexs.len() {
                regex_index_map.insert(i, state_index);
            }
            input_map.insert(state_index, (rule.response.clone(), rule.record));
        }
        input_map.insert(MORE, (" ".to_string(), false));

        let all_regex = RegexSet::new(&regexs).map_err(|err| {
            NetError::InvalidPromptProfile(format!("failed to build state regex set: {err}"))
        })?;

        let ignore_errors = if profile.ignore_errors.is_empty() {
            None
        } else {
            Some(RegexSet::new(&profile.ignore_errors).map_err(|err| {
                NetError::InvalidPromptProfile(format!("invalid ignore_errors regex set: {err}"))
            })?)
        };

        Ok(Self {
            current_state_index: OUTPUT,
            all_states,
            all_regex,
            regex_index_map,
            prompt_index,
            input_map,
            ignore_errors,
            current_prompt: None,
        })
    }

    fn line2state(&self, line: &str) -> usize {
        self.all_regex
            .matches(line)
            .into_iter()
            .next()
            .and_then(|index| self.regex_index_map.get(&index).copied())
            .unwrap_or(OUTPUT)
    }

    fn is_prompt_state(&self, index: usize) -> bool {
        let (start, end) = self.prompt_index;
        index >= start && index <= end
    }

    /// Feeds one line and updates the current state.
    pub fn read(&mut self, line: &str) {
        trace!("Read line: '{:?}'", line);
        let state_index = self.line2state(line);
        if self.ignore_error(line) {
            trace!("Ignoring error state");
            self.current_state_index = OUTPUT;
            return;
        }
        if self.is_prompt_state(state_index) {
            self.current_prompt = Some(line.trim().to_string());
        }
        self.current_state_index = state_index;
    }

    fn ignore_error(&self, line: &str) -> bool {
        self.ignore_errors
            .as_ref()
            .map(|set| set.is_match(line))
            .unwrap_or(false)
    }

    /// Whether `line` is a prompt. Does not change state.
    pub fn read_prompt(&self, line: &str) -> bool {
        self.is_prompt_state(self.line2state(line))
    }

    /// Answer for a question or paging marker in `line`, with its record flag.
    pub fn read_need_write(&self, line: &str) -> Option<(String, bool)> {
        self.input_map.get(&self.line2state(line)).cloned()
    }

    pub fn error(&self) -> bool {
        self.current_state_index == ERROR
    }

    pub fn current_state(&self) -> &str {
        self.all_states
            .get(self.current_state_index)
            .map(|s| s.as_str())
            .unwrap_or(PRE_STATES[OUTPUT])
    }

    /// Last prompt line seen, trimmed.
    pub fn current_prompt(&self) -> Option<&str> {
        self.current_prompt.as_deref()
    }
}

/// Removes ANSI sequences and leading redraw noise from one line.
pub fn clean_line(line: &str) -> String {
    let without_ansi = ANSI_ESCAPE.replace_all(line, "");
    IGNORE_START_LINE.replace(&without_ansi, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> PromptProfile {
        PromptProfile {
            prompts: vec![
                ("Config".to_string(), vec![r"^dev\(cfg\)#\s*$".to_string()]),
                ("Enable".to_string(), vec![r"^dev#\s*$".to_string()]),
            ],
            more: vec![r"^--More--$".to_string()],
            errors: vec![r"^ERROR: .+$".to_string()],
            ignore_errors: vec![r"^ERROR: benign$".to_string()],
            inputs: vec![InputRule {
                state: "Confirm".to_string(),
                patterns: vec![r"\[y/n\]\?\s*$".to_string()],
                response: "y\n".to_string(),
                record: false,
            }],
        }
    }

    #[test]
    fn error_state_is_detected_after_error_line() {
        let mut matcher = PromptMatcher::new(&profile()).expect("valid profile");
        assert!(!matcher.error());
        matcher.read("ERROR: invalid command");
        assert!(matcher.error());
        matcher.read("dev#");
        assert!(!matcher.error());
    }

    #[test]
    fn ignore_error_pattern_resets_to_output_state() {
        let mut matcher = PromptMatcher::new(&profile()).expect("valid profile");
        matcher.read("ERROR: benign");
        assert_eq!(matcher.current_state(), "output");
    }

    #[test]
    fn prompt_lines_update_current_prompt_and_mode() {
        let mut matcher = PromptMatcher::new(&profile()).expect("valid profile");
        assert!(matcher.read_prompt("dev(cfg)#"));
        assert!(!matcher.read_prompt("interface Gi0/1"));
        matcher.read("dev(cfg)# ");
        assert_eq!(matcher.current_state(), "config");
        assert_eq!(matcher.current_prompt(), Some("dev(cfg)#"));
    }

    #[test]
    fn questions_and_paging_get_automatic_answers() {
        let matcher = PromptMatcher::new(&profile()).expect("valid profile");
        assert_eq!(
            matcher.read_need_write("Proceed? [y/n]? "),
            Some(("y\n".to_string(), false))
        );
        assert_eq!(
            matcher.read_need_write("--More--"),
            Some((" ".to_string(), false))
        );
        assert_eq!(matcher.read_need_write("plain output"), None);
    }

    #[test]
    fn invalid_regex_is_a_profile_error() {
        let mut bad = profile();
        bad.errors.push("(unclosed".to_string());
        let err = match PromptMatcher::new(&bad) {
            Ok(_) => panic!("invalid regex should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::InvalidPromptProfile(_)));
    }

    #[test]
    fn clean_line_strips_ansi_and_redraws() {
        assert_eq!(clean_line("\x1b[K\r\r  \rdev#"), "dev#");
    }
}
