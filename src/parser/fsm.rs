//! TextFSM-compatible template language.
//!
//! A template declares `Value` lines followed by named states of `^regex -> action`
//! rules. Input is fed line by line through the current state's rules; captured
//! values accumulate into a record that `Record` actions append to the result.
//!
//! Supported: value options `Filldown`, `Fillup`, `Required`, `List` and `Key`;
//! line actions `Next`, `Continue` and `Error`; record actions `NoRecord`,
//! `Record`, `Clear` and `Clearall`; state transitions including `End`; an
//! explicit `EOF` state suppressing the implicit final record.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::NetError;

/// One parsed record. Keys are value names.
pub type Row = Map<String, Value>;

const START: &str = "Start";
const END: &str = "End";
const EOF: &str = "EOF";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ValueOptions {
    filldown: bool,
    fillup: bool,
    required: bool,
    list: bool,
    key: bool,
}

#[derive(Debug, Clone)]
struct ValueDef {
    name: String,
    /// Value regex turned into a named capture group.
    pattern: String,
    options: ValueOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineOp {
    Next,
    Continue,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOp {
    NoRecord,
    Record,
    Clear,
    ClearAll,
}

#[derive(Debug, Clone)]
struct Rule {
    regex: Regex,
    line_op: LineOp,
    record_op: RecordOp,
    new_state: Option<String>,
    message: Option<String>,
    source: String,
}

/// A compiled template.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    values: Vec<ValueDef>,
    states: HashMap<String, Vec<Rule>>,
    explicit_eof: bool,
}

fn syntax(name: &str, line_no: usize, reason: impl std::fmt::Display) -> NetError {
    NetError::TemplateSyntax {
        name: name.to_string(),
        reason: format!("line {line_no}: {reason}"),
    }
}

impl Template {
    /// Compiles template text. `name` is only used in error messages.
    pub fn parse(name: &str, text: &str) -> Result<Self, NetError> {
        let mut values: Vec<ValueDef> = Vec::new();
        let mut states: HashMap<String, Vec<Rule>> = HashMap::new();
        let mut state_order: Vec<String> = Vec::new();
        let mut current: Option<String> = None;
        let mut in_values = true;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim_end();
            if line.trim_start().starts_with('#') {
                continue;
            }

            if in_values {
                if line.is_empty() {
                    if !values.is_empty() {
                        in_values = false;
                    }
                    continue;
                }
                if let Some(rest) = line.strip_prefix("Value ") {
                    let value = Self::parse_value(name, line_no, rest)?;
                    if values.iter().any(|v| v.name == value.name) {
                        return Err(syntax(name, line_no, format!("duplicate value {}", value.name)));
                    }
                    values.push(value);
                    continue;
                }
                if values.is_empty() {
                    return Err(syntax(name, line_no, "expected a Value definition"));
                }
                in_values = false;
            }

            if line.is_empty() {
                current = None;
                continue;
            }

            if !line.starts_with(char::is_whitespace) {
                let state = line.trim();
                if !state.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(syntax(name, line_no, format!("invalid state name '{state}'")));
                }
                if states.contains_key(state) {
                    return Err(syntax(name, line_no, format!("duplicate state {state}")));
                }
                states.insert(state.to_string(), Vec::new());
                state_order.push(state.to_string());
                current = Some(state.to_string());
                continue;
            }

            let Some(state) = current.as_ref() else {
                return Err(syntax(name, line_no, "rule outside of a state"));
            };
            let rule = Self::parse_rule(name, line_no, line.trim(), &values)?;
            if let Some(rules) = states.get_mut(state) {
                rules.push(rule);
            }
        }

        if values.is_empty() {
            return Err(syntax(name, 0, "template declares no values"));
        }
        if !states.contains_key(START) {
            return Err(syntax(name, 0, "missing Start state"));
        }
        for state in &state_order {
            for rule in states.get(state).into_iter().flatten() {
                if let Some(target) = &rule.new_state
                    && target != END
                    && target != EOF
                    && !states.contains_key(target)
                {
                    return Err(syntax(
                        name,
                        0,
                        format!("rule '{}' targets unknown state {target}", rule.source),
                    ));
                }
            }
        }

        let explicit_eof = states.contains_key(EOF);
        Ok(Self {
            name: name.to_string(),
            values,
            states,
            explicit_eof,
        })
    }

    fn parse_value(name: &str, line_no: usize, rest: &str) -> Result<ValueDef, NetError> {
        let rest = rest.trim();
        let (first, remainder) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| syntax(name, line_no, "incomplete Value line"))?;
        let remainder = remainder.trim_start();

        let (options, value_name, regex) = if remainder.starts_with('(') {
            ("", first, remainder)
        } else {
            match remainder.split_once(char::is_whitespace) {
                Some((value_name, regex)) => (first, value_name, regex.trim_start()),
                None => ("", first, remainder),
            }
        };

        if !value_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(syntax(name, line_no, format!("invalid value name '{value_name}'")));
        }
        if !(regex.starts_with('(') && regex.ends_with(')')) {
            return Err(syntax(
                name,
                line_no,
                format!("value {value_name} regex must be wrapped in parentheses"),
            ));
        }

        let mut parsed = ValueOptions::default();
        for option in options.split(',').filter(|o| !o.is_empty()) {
            match option {
                "Filldown" => parsed.filldown = true,
                "Fillup" => parsed.fillup = true,
                "Required" => parsed.required = true,
                "List" => parsed.list = true,
                "Key" => parsed.key = true,
                other => {
                    return Err(syntax(name, line_no, format!("unknown value option {other}")));
                }
            }
        }

        let pattern = format!("(?P<{value_name}>{}", &regex[1..]);
        Regex::new(&pattern).map_err(|e| {
            syntax(name, line_no, format!("value {value_name} has an invalid regex: {e}"))
        })?;

        Ok(ValueDef {
            name: value_name.to_string(),
            pattern,
            options: parsed,
        })
    }

    fn parse_rule(
        name: &str,
        line_no: usize,
        line: &str,
        values: &[ValueDef],
    ) -> Result<Rule, NetError> {
        if !line.starts_with('^') {
            return Err(syntax(name, line_no, "rules must start with '^'"));
        }
        let (pattern, action) = match line.rfind(" ->") {
            Some(pos) => (line[..pos].trim_end(), line[pos + 3..].trim()),
            None => (line, ""),
        };

        let expanded = Self::expand(name, line_no, pattern, values)?;
        let regex = Regex::new(&expanded)
            .map_err(|e| syntax(name, line_no, format!("invalid rule regex: {e}")))?;

        let mut rule = Rule {
            regex,
            line_op: LineOp::Next,
            record_op: RecordOp::NoRecord,
            new_state: None,
            message: None,
            source: line.to_string(),
        };
        if action.is_empty() {
            return Ok(rule);
        }

        let (ops, rest) = match action.split_once(char::is_whitespace) {
            Some((ops, rest)) => (ops, rest.trim()),
            None => (action, ""),
        };

        let mut named_op = false;
        for op in ops.split('.') {
            match op {
                "Next" => rule.line_op = LineOp::Next,
                "Continue" => rule.line_op = LineOp::Continue,
                "Error" => rule.line_op = LineOp::Error,
                "NoRecord" => rule.record_op = RecordOp::NoRecord,
                "Record" => rule.record_op = RecordOp::Record,
                "Clear" => rule.record_op = RecordOp::Clear,
                "Clearall" => rule.record_op = RecordOp::ClearAll,
                _ => {
                    named_op = false;
                    break;
                }
            }
            named_op = true;
        }

        if !named_op {
            if !rest.is_empty() || ops.contains('.') {
                return Err(syntax(name, line_no, format!("invalid action '{action}'")));
            }
            rule.new_state = Some(ops.to_string());
            return Ok(rule);
        }

        if rule.line_op == LineOp::Error {
            if !rest.is_empty() {
                rule.message = Some(rest.trim_matches('"').to_string());
            }
            return Ok(rule);
        }
        if !rest.is_empty() {
            if rule.line_op == LineOp::Continue {
                return Err(syntax(name, line_no, "Continue cannot change state"));
            }
            rule.new_state = Some(rest.to_string());
        }
        Ok(rule)
    }

    /// Substitutes `${NAME}` and `$NAME` with value groups. `$$` is a literal `$`.
    fn expand(
        name: &str,
        line_no: usize,
        pattern: &str,
        values: &[ValueDef],
    ) -> Result<String, NetError> {
        let mut out = String::with_capacity(pattern.len() * 2);
        let mut used = HashSet::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let var = match chars.peek() {
                Some('$') => {
                    chars.next();
                    out.push('$');
                    continue;
                }
                Some('{') => {
                    chars.next();
                    let mut var = String::new();
                    for c in chars.by_ref() {
                        if c == '}' {
                            break;
                        }
                        var.push(c);
                    }
                    var
                }
                Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
                    let mut var = String::new();
                    while let Some(c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || *c == '_' {
                            var.push(*c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    var
                }
                _ => {
                    out.push('$');
                    continue;
                }
            };

            let Some(value) = values.iter().find(|v| v.name == var) else {
                return Err(syntax(name, line_no, format!("unknown value ${{{var}}}")));
            };
            if !used.insert(var.clone()) {
                return Err(syntax(name, line_no, format!("value {var} used twice in one rule")));
            }
            out.push_str(&value.pattern);
        }
        Ok(out)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value names in declaration order.
    pub fn header(&self) -> Vec<&str> {
        self.values.iter().map(|v| v.name.as_str()).collect()
    }

    /// Names of values marked `Key`.
    pub fn keys(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|v| v.options.key)
            .map(|v| v.name.as_str())
            .collect()
    }

    /// Runs the state machine over `input`.
    ///
    /// Fails with [`NetError::TemplateApply`] when an `Error` action fires.
    pub fn apply(&self, input: &str) -> Result<Vec<Row>, NetError> {
        let mut run = Run::new(&self.values);
        let mut state = START;

        'lines: for line in input.lines() {
            let line = line.trim_end_matches('\r');
            let Some(rules) = self.states.get(state) else {
                break;
            };
            for rule in rules {
                let Some(captures) = rule.regex.captures(line) else {
                    continue;
                };
                for (index, value) in self.values.iter().enumerate() {
                    if let Some(m) = captures.name(&value.name) {
                        run.assign(index, m.as_str());
                    }
                }

                if rule.line_op == LineOp::Error {
                    let reason = match &rule.message {
                        Some(message) => format!("{message} (line {line:?})"),
                        None => format!("rule '{}' rejected line {line:?}", rule.source),
                    };
                    return Err(NetError::TemplateApply {
                        name: self.name.clone(),
                        reason,
                    });
                }

                match rule.record_op {
                    RecordOp::NoRecord => {}
                    RecordOp::Record => run.record(),
                    RecordOp::Clear => run.clear(false),
                    RecordOp::ClearAll => run.clear(true),
                }

                if let Some(next) = &rule.new_state {
                    if next == END {
                        return Ok(run.finish());
                    }
                    state = next.as_str();
                }
                if rule.line_op == LineOp::Next {
                    continue 'lines;
                }
            }
        }

        if !self.explicit_eof {
            run.record();
        }
        Ok(run.finish())
    }
}

#[derive(Debug, Clone)]
enum Cell {
    Scalar(String),
    List(Vec<String>),
}

impl Cell {
    fn is_empty(&self) -> bool {
        match self {
            Cell::Scalar(s) => s.is_empty(),
            Cell::List(l) => l.is_empty(),
        }
    }

    fn empty_like(&self) -> Cell {
        match self {
            Cell::Scalar(_) => Cell::Scalar(String::new()),
            Cell::List(_) => Cell::List(Vec::new()),
        }
    }
}

struct Run<'a> {
    values: &'a [ValueDef],
    current: Vec<Cell>,
    rows: Vec<Vec<Cell>>,
}

impl<'a> Run<'a> {
    fn new(values: &'a [ValueDef]) -> Self {
        let current = values
            .iter()
            .map(|v| {
                if v.options.list {
                    Cell::List(Vec::new())
                } else {
                    Cell::Scalar(String::new())
                }
            })
            .collect();
        Self {
            values,
            current,
            rows: Vec::new(),
        }
    }

    fn assign(&mut self, index: usize, text: &str) {
        match &mut self.current[index] {
            Cell::List(items) => items.push(text.to_string()),
            Cell::Scalar(value) => *value = text.to_string(),
        }
        if self.values[index].options.fillup {
            for row in self.rows.iter_mut().rev() {
                if !row[index].is_empty() {
                    break;
                }
                row[index] = Cell::Scalar(text.to_string());
            }
        }
    }

    fn record(&mut self) {
        let missing_required = self
            .values
            .iter()
            .zip(&self.current)
            .any(|(v, cell)| v.options.required && cell.is_empty());
        let nothing_new = self
            .values
            .iter()
            .zip(&self.current)
            .all(|(v, cell)| v.options.filldown || cell.is_empty());

        if !missing_required && !nothing_new {
            self.rows.push(self.current.clone());
        }
        self.clear(false);
    }

    fn clear(&mut self, all: bool) {
        for (value, cell) in self.values.iter().zip(self.current.iter_mut()) {
            if all || !value.options.filldown {
                *cell = cell.empty_like();
            }
        }
    }

    fn finish(self) -> Vec<Row> {
        let values = self.values;
        self.rows
            .into_iter()
            .map(|cells| {
                values
                    .iter()
                    .zip(cells)
                    .map(|(value, cell)| {
                        let json = match cell {
                            Cell::Scalar(s) => Value::String(s),
                            Cell::List(items) => {
                                Value::Array(items.into_iter().map(Value::String).collect())
                            }
                        };
                        (value.name.clone(), json)
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERFACES: &str = r"Value Required INTERFACE (\S+)
Value STATUS (up|down)
Value Filldown DEVICE (\S+)

Start
  ^Device:\s+${DEVICE}
  ^${INTERFACE}\s+${STATUS}\s*$$ -> Record
";

    #[test]
    fn records_rows_with_filldown() {
        let template = Template::parse("ifaces", INTERFACES).expect("compile");
        assert_eq!(template.header(), vec!["INTERFACE", "STATUS", "DEVICE"]);

        let rows = template
            .apply("Device: sw1\nGi0/1 up\nGi0/2 down\n")
            .expect("apply");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["INTERFACE"], "Gi0/1");
        assert_eq!(rows[1]["STATUS"], "down");
        assert_eq!(rows[1]["DEVICE"], "sw1");
    }

    #[test]
    fn required_value_suppresses_incomplete_records() {
        let template = Template::parse("ifaces", INTERFACES).expect("compile");
        let rows = template.apply("Device: sw1\nno interfaces here\n").expect("apply");
        assert!(rows.is_empty());
    }

    #[test]
    fn state_transitions_and_list_values() {
        let text = r"Value VLAN (\d+)
Value List PORTS (\S+)

Start
  ^VLAN -> Table

Table
  ^\d+\s*$$ -> Continue.Record
  ^${VLAN}\s*$$
  ^\s+${PORTS}
";
        let template = Template::parse("vlans", text).expect("compile");
        let rows = template
            .apply("noise\nVLAN\n10\n  Gi0/1\n  Gi0/2\n20\n  Gi0/3\n")
            .expect("apply");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["VLAN"], "10");
        assert_eq!(rows[0]["PORTS"], serde_json::json!(["Gi0/1", "Gi0/2"]));
        assert_eq!(rows[1]["PORTS"], serde_json::json!(["Gi0/3"]));
    }

    #[test]
    fn explicit_eof_state_suppresses_final_record() {
        let text = r"Value NAME (\S+)

Start
  ^name\s+${NAME}

EOF
";
        let template = Template::parse("eof", text).expect("compile");
        assert!(template.apply("name a\n").expect("apply").is_empty());
    }

    #[test]
    fn error_action_fails_application() {
        let text = r#"Value NAME (\S+)

Start
  ^name\s+${NAME} -> Record
  ^% -> Error "device error"
"#;
        let template = Template::parse("err", text).expect("compile");
        let err = match template.apply("name a\n% Invalid input\n") {
            Ok(_) => panic!("error action should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::TemplateApply { .. }));
    }

    #[test]
    fn syntax_errors_are_reported() {
        for (text, needle) in [
            ("Start\n  ^x\n", "expected a Value"),
            ("Value NAME \\S+\n\nStart\n  ^x\n", "parentheses"),
            ("Value NAME (\\S+)\n\nBegin\n  ^x\n", "missing Start"),
            ("Value NAME (\\S+)\n\nStart\n  ^${OTHER}\n", "unknown value"),
            ("Value NAME (\\S+)\n\nStart\n  ^x -> Nowhere\n", "unknown state"),
            ("Value NAME (\\S+)\n\nStart\n  ^x -> Continue Other\n\nOther\n  ^y\n", "Continue"),
        ] {
            let err = match Template::parse("bad", text) {
                Ok(_) => panic!("template should be rejected: {text}"),
                Err(err) => err,
            };
            assert!(
                err.to_string().contains(needle),
                "'{err}' should mention '{needle}'"
            );
        }
    }
}
