use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::input::{ERASE, Key, split_keys};
use crate::config::SessionConfig;
use crate::error::NetError;
use crate::link::DeviceLink;

/// Prompt shown before the device reports one.
const DEFAULT_PROMPT: &str = "# ";

/// Where an interactive session connects.
#[derive(Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// An inventory device, with the operator's secret for dynamic auth.
    Device {
        device_id: String,
        user_secret: Option<String>,
    },
    /// An ad-hoc endpoint outside the inventory.
    Endpoint(Endpoint),
}

impl SessionTarget {
    pub fn device(device_id: impl Into<String>, user_secret: Option<&str>) -> Self {
        SessionTarget::Device {
            device_id: device_id.into(),
            user_secret: user_secret.map(str::to_string),
        }
    }
}

impl fmt::Debug for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionTarget::Device { device_id, .. } => {
                f.debug_struct("Device").field("device_id", device_id).finish()
            }
            SessionTarget::Endpoint(endpoint) => endpoint.fmt(f),
        }
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionTarget::Device { device_id, .. } => write!(f, "device {device_id}"),
            SessionTarget::Endpoint(endpoint) => {
                write!(f, "{}@{}:{}", endpoint.username, endpoint.host, endpoint.port)
            }
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub platform: Option<String>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("platform", &self.platform)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initialized,
    Connecting,
    Connected,
    Closed,
}

/// What the session is connected to, without credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TargetInfo {
    pub device_id: Option<String>,
    pub hostname: String,
    pub address: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub target: TargetInfo,
    pub state: SessionState,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub command_count: u64,
    pub in_config_mode: bool,
    pub prompt: String,
}

struct Terminal {
    state: SessionState,
    input_buffer: String,
    in_config_mode: bool,
    prompt: String,
    last_activity: Instant,
    command_count: u64,
}

/// Whether `command` starts with every token of `keyword`.
fn starts_with_tokens(command: &str, keyword: &str) -> bool {
    let mut command_tokens = command.split_whitespace();
    let mut keyword_tokens = keyword.split_whitespace().peekable();
    if keyword_tokens.peek().is_none() {
        return false;
    }
    keyword_tokens.all(|k| {
        command_tokens
            .next()
            .is_some_and(|c| c.eq_ignore_ascii_case(k))
    })
}

/// One operator terminal on one device link.
pub struct CliSession {
    id: String,
    user_id: String,
    target: TargetInfo,
    link: DeviceLink,
    config: SessionConfig,
    created_at: DateTime<Utc>,
    terminal: Mutex<Terminal>,
}

impl CliSession {
    pub(crate) fn new(
        id: String,
        user_id: String,
        target: TargetInfo,
        link: DeviceLink,
        config: SessionConfig,
    ) -> Self {
        Self {
            id,
            user_id,
            target,
            link,
            config,
            created_at: Utc::now(),
            terminal: Mutex::new(Terminal {
                state: SessionState::Initialized,
                input_buffer: String::new(),
                in_config_mode: false,
                prompt: DEFAULT_PROMPT.to_string(),
                last_activity: Instant::now(),
                command_count: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    /// Opens the link and records the first prompt.
    pub(crate) async fn connect(&self) -> Result<(), NetError> {
        self.terminal.lock().await.state = SessionState::Connecting;
        let connected = self.link.try_connect().await;
        let prompt = match connected {
            Ok(()) => self.link.prompt().await,
            Err(_) => None,
        };

        let mut terminal = self.terminal.lock().await;
        if let Err(err) = connected {
            terminal.state = SessionState::Closed;
            return Err(err);
        }
        if let Some(prompt) = prompt {
            terminal.prompt = prompt;
        }
        terminal.state = SessionState::Connected;
        terminal.last_activity = Instant::now();
        info!("Session {} connected to {}", self.id, self.target.address);
        Ok(())
    }

    /// Closes the session, cancelling any command still running.
    pub async fn close(&self) {
        self.terminal.lock().await.state = SessionState::Closed;
        if self.link.is_busy()
            && let Err(err) = self.link.interrupt(self.config.completion_timeout).await
        {
            debug!("Session {} interrupt on close failed: {}", self.id, err);
        }
        self.link.close().await;
        debug!("Session {} closed", self.id);
    }

    pub async fn is_connected(&self) -> bool {
        self.terminal.lock().await.state == SessionState::Connected && self.link.is_connected()
    }

    pub async fn in_config_mode(&self) -> bool {
        self.terminal.lock().await.in_config_mode
    }

    pub async fn input_buffer(&self) -> String {
        self.terminal.lock().await.input_buffer.clone()
    }

    pub async fn idle_for(&self) -> Duration {
        self.terminal.lock().await.last_activity.elapsed()
    }

    pub async fn command_count(&self) -> u64 {
        self.terminal.lock().await.command_count
    }

    /// Whether a command is still running on the device.
    pub fn is_busy(&self) -> bool {
        self.link.is_busy()
    }

    /// Feeds a chunk of keystrokes and returns what the terminal should show.
    ///
    /// The terminal state is never locked across device I/O, so a Ctrl-C in
    /// a second call reaches a command that is still running.
    pub async fn send_input(&self, chunk: &str) -> Result<String, NetError> {
        {
            let mut terminal = self.terminal.lock().await;
            if terminal.state != SessionState::Connected {
                return Err(NetError::LinkClosed(
                    self.target.device_id.clone().unwrap_or_else(|| self.target.address.clone()),
                ));
            }
            terminal.last_activity = Instant::now();
        }

        let mut response = String::new();
        for key in split_keys(chunk) {
            response.push_str(&self.handle_key(key).await);
        }
        self.terminal.lock().await.last_activity = Instant::now();
        Ok(response)
    }

    async fn handle_key(&self, key: Key) -> String {
        match key {
            Key::Text(text) => {
                self.terminal.lock().await.input_buffer.push_str(&text);
                text
            }
            Key::Backspace => {
                let erased = self.terminal.lock().await.input_buffer.pop().is_some();
                if erased {
                    ERASE.to_string()
                } else {
                    String::new()
                }
            }
            Key::Enter => {
                let (command, prompt) = {
                    let mut terminal = self.terminal.lock().await;
                    let command = std::mem::take(&mut terminal.input_buffer);
                    let command = command.trim().to_string();
                    if !command.is_empty() {
                        terminal.command_count += 1;
                    }
                    (command, terminal.prompt.clone())
                };
                if command.is_empty() {
                    return format!("\r\n{prompt}");
                }
                self.run(&command).await
            }
            Key::Tab => {
                let buffer = self.terminal.lock().await.input_buffer.clone();
                if buffer.trim().is_empty() {
                    return String::new();
                }
                let completion = format!("{buffer}?");
                match self
                    .link
                    .execute(&completion, Some(self.config.completion_timeout))
                    .await
                {
                    Ok(result) => to_terminal(&result.output),
                    Err(err) => {
                        debug!("Session {} completion failed: {}", self.id, err);
                        String::new()
                    }
                }
            }
            Key::Interrupt => {
                let prompt = {
                    let mut terminal = self.terminal.lock().await;
                    terminal.input_buffer.clear();
                    terminal.prompt.clone()
                };
                match self.link.interrupt(self.config.completion_timeout).await {
                    Ok(Some(fresh)) => {
                        self.terminal.lock().await.prompt = fresh.clone();
                        format!("^C\r\n{fresh}")
                    }
                    // The running command resyncs the prompt itself.
                    Ok(None) => format!("^C\r\n{prompt}"),
                    Err(err) => {
                        debug!("Session {} interrupt failed: {}", self.id, err);
                        "^C\r\n".to_string()
                    }
                }
            }
            // No history buffer: arrows reach the client unchanged.
            Key::Arrow(arrow) => arrow.sequence().to_string(),
            Key::Ignored(_) => String::new(),
        }
    }

    async fn run(&self, command: &str) -> String {
        let outcome = self
            .link
            .execute(command, Some(self.config.command_timeout))
            .await;
        let link_up = self.link.is_connected();

        let mut terminal = self.terminal.lock().await;
        match outcome {
            Ok(result) => {
                if result.success {
                    self.update_config_mode(&mut terminal, command);
                }
                if !result.prompt.is_empty() {
                    terminal.prompt = result.prompt.clone();
                }
                let mut shown = String::from("\r\n");
                let output = to_terminal(result.output.trim_end());
                if !output.is_empty() {
                    shown.push_str(&output);
                    shown.push_str("\r\n");
                }
                shown.push_str(&terminal.prompt);
                shown
            }
            // The Ctrl-C reply already showed the prompt.
            Err(NetError::Interrupted { .. }) => {
                debug!("Session {} command '{}' interrupted", self.id, command);
                String::new()
            }
            Err(err) => {
                warn!("Session {} command '{}' failed: {}", self.id, command, err);
                if !link_up {
                    terminal.state = SessionState::Closed;
                }
                format!("\r\nError: {err}\r\n{}", terminal.prompt)
            }
        }
    }

    fn update_config_mode(&self, terminal: &mut Terminal, command: &str) {
        let enters = self
            .config
            .config_enter_keywords
            .iter()
            .any(|k| starts_with_tokens(command, k));
        if enters {
            terminal.in_config_mode = true;
            return;
        }
        let exits = self
            .config
            .config_exit_keywords
            .iter()
            .any(|k| starts_with_tokens(command, k));
        if exits {
            terminal.in_config_mode = false;
        }
    }

    pub async fn info(&self) -> SessionInfo {
        let terminal = self.terminal.lock().await;
        SessionInfo {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            target: self.target.clone(),
            state: terminal.state,
            connected: terminal.state == SessionState::Connected && self.link.is_connected(),
            created_at: self.created_at,
            idle_secs: terminal.last_activity.elapsed().as_secs(),
            command_count: terminal.command_count,
            in_config_mode: terminal.in_config_mode,
            prompt: terminal.prompt.clone(),
        }
    }
}

fn to_terminal(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_match_leading_tokens_only() {
        assert!(starts_with_tokens("configure terminal", "configure"));
        assert!(starts_with_tokens("Conf T", "conf t"));
        assert!(!starts_with_tokens("show configuration", "config"));
        assert!(!starts_with_tokens("configuration", "config"));
        assert!(!starts_with_tokens("exit-address-family", "exit"));
        assert!(!starts_with_tokens("conf", "conf t"));
        assert!(!starts_with_tokens("anything", "   "));
    }

    #[test]
    fn line_endings_are_normalized() {
        assert_eq!(to_terminal("a\nb\r\nc"), "a\r\nb\r\nc");
    }

    #[test]
    fn endpoint_debug_hides_secret() {
        let target = SessionTarget::Endpoint(Endpoint {
            host: "192.0.2.1".to_string(),
            port: 22,
            username: "ops".to_string(),
            secret: "hunter2".to_string(),
            platform: None,
        });
        assert!(!format!("{target:?}").contains("hunter2"));
        assert_eq!(target.to_string(), "ops@192.0.2.1:22");
    }
}
