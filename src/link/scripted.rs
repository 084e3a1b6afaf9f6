//! In-memory devices that answer commands from a script.
//!
//! [`ScriptedConnector`] stands in for [`SshConnector`] in tests and dry runs.
//! Each [`ScriptedDevice`] maps exact command strings to canned [`Reply`]s and
//! records what was executed and when, so callers can assert ordering and
//! serialization without a network.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;

use tokio::time::Instant;

use super::*;

/// Canned response to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Output {
        text: String,
        success: bool,
        /// Prompt shown after the command, when it changes mode.
        prompt: Option<String>,
    },
    /// The shell goes away mid-command.
    Drop,
    /// Nothing comes back until the command times out.
    Hang,
}

impl Reply {
    pub fn output(text: impl Into<String>) -> Self {
        Reply::Output {
            text: text.into(),
            success: true,
            prompt: None,
        }
    }

    /// Output the device flags as an error.
    pub fn rejected(text: impl Into<String>) -> Self {
        Reply::Output {
            text: text.into(),
            success: false,
            prompt: None,
        }
    }

    /// Switches the prompt after this reply.
    pub fn with_prompt(self, prompt: impl Into<String>) -> Self {
        match self {
            Reply::Output { text, success, .. } => Reply::Output {
                text,
                success,
                prompt: Some(prompt.into()),
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
struct Script {
    prompt: String,
    replies: HashMap<String, Reply>,
    fallback: Reply,
    expected_secret: Option<String>,
    latency: Duration,
    connect_delay: Duration,
}

#[derive(Debug)]
struct Runtime {
    reachable: AtomicBool,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
    executed: Mutex<Vec<String>>,
    raw_input: Mutex<Vec<String>>,
    spans: Mutex<Vec<(Instant, Instant)>>,
}

/// A fake device. Clones share recorded history and reachability.
#[derive(Debug, Clone)]
pub struct ScriptedDevice {
    script: Arc<Script>,
    runtime: Arc<Runtime>,
}

impl ScriptedDevice {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            script: Arc::new(Script {
                prompt: prompt.into(),
                replies: HashMap::new(),
                fallback: Reply::output(""),
                expected_secret: None,
                latency: Duration::ZERO,
                connect_delay: Duration::ZERO,
            }),
            runtime: Arc::new(Runtime {
                reachable: AtomicBool::new(true),
                failing_connects: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                executed: Mutex::new(Vec::new()),
                raw_input: Mutex::new(Vec::new()),
                spans: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn reply(mut self, command: &str, reply: Reply) -> Self {
        Arc::make_mut(&mut self.script)
            .replies
            .insert(command.to_string(), reply);
        self
    }

    /// Reply for commands without a scripted answer.
    pub fn otherwise(mut self, reply: Reply) -> Self {
        Arc::make_mut(&mut self.script).fallback = reply;
        self
    }

    /// Rejects logins whose secret differs.
    pub fn expect_secret(mut self, secret: &str) -> Self {
        Arc::make_mut(&mut self.script).expected_secret = Some(secret.to_string());
        self
    }

    /// Delay before each command completes.
    pub fn latency(mut self, latency: Duration) -> Self {
        Arc::make_mut(&mut self.script).latency = latency;
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        Arc::make_mut(&mut self.script).connect_delay = delay;
        self
    }

    /// Refuses the next `count` connection attempts.
    pub fn fail_connects(self, count: usize) -> Self {
        self.runtime.failing_connects.store(count, Ordering::SeqCst);
        self
    }

    /// Makes open shells look dead and refuses new ones.
    pub fn set_reachable(&self, reachable: bool) {
        self.runtime.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Successful logins so far.
    pub fn connects(&self) -> usize {
        self.runtime.connects.load(Ordering::SeqCst)
    }

    /// Commands executed, in completion order.
    pub async fn executed(&self) -> Vec<String> {
        self.runtime.executed.lock().await.clone()
    }

    /// Bytes written with [`Transport::send_raw`].
    pub async fn raw_input(&self) -> Vec<String> {
        self.runtime.raw_input.lock().await.clone()
    }

    /// Start and end instant of every executed command.
    pub async fn spans(&self) -> Vec<(Instant, Instant)> {
        self.runtime.spans.lock().await.clone()
    }

    fn reachable(&self) -> bool {
        self.runtime.reachable.load(Ordering::SeqCst)
    }
}

/// Connects to [`ScriptedDevice`]s by address.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    devices: HashMap<String, ScriptedDevice>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, address: &str, device: ScriptedDevice) -> Self {
        self.devices.insert(address.to_string(), device);
        self
    }

    /// Connection attempts across all devices, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, target: &LinkTarget) -> Result<Box<dyn Transport>, NetError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refuse = |reason: &str| NetError::LinkConnect {
            device_id: target.device_id.clone(),
            address: format!("{}:{}", target.address, target.port),
            reason: reason.to_string(),
        };

        let Some(device) = self.devices.get(&target.address) else {
            return Err(refuse("no route to host"));
        };
        if !device.script.connect_delay.is_zero() {
            tokio::time::sleep(device.script.connect_delay).await;
        }
        if !device.reachable() {
            return Err(refuse("connection timed out"));
        }
        let pending_failures = device.runtime.failing_connects.load(Ordering::SeqCst);
        if pending_failures > 0 {
            device
                .runtime
                .failing_connects
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(refuse("connection refused"));
        }
        if let Some(expected) = &device.script.expected_secret
            && expected != &target.credentials.secret
        {
            return Err(refuse("password authentication failed"));
        }

        device.runtime.connects.fetch_add(1, Ordering::SeqCst);
        trace!("{} scripted login", target.label());
        Ok(Box::new(ScriptedTransport {
            device: device.clone(),
            prompt: device.script.prompt.clone(),
            open: true,
        }))
    }
}

/// Shell on a [`ScriptedDevice`].
#[derive(Debug)]
pub struct ScriptedTransport {
    device: ScriptedDevice,
    prompt: String,
    open: bool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<RawOutput, NetError> {
        if !self.is_alive() {
            return Err(NetError::ChannelDisconnected);
        }
        let started = Instant::now();
        let script = &self.device.script;
        let reply = script.replies.get(command).unwrap_or(&script.fallback);

        if !script.latency.is_zero() {
            tokio::time::sleep(script.latency).await;
        }

        let (text, success) = match reply {
            Reply::Output {
                text,
                success,
                prompt,
            } => {
                if let Some(next) = prompt {
                    self.prompt = next.clone();
                }
                (text.clone(), *success)
            }
            Reply::Drop => {
                self.open = false;
                return Err(NetError::ChannelDisconnected);
            }
            Reply::Hang => {
                tokio::time::sleep(timeout).await;
                return Err(NetError::Timeout(format!("'{command}' produced no prompt")));
            }
        };

        let runtime = &self.device.runtime;
        runtime.executed.lock().await.push(command.to_string());
        runtime.spans.lock().await.push((started, Instant::now()));
        Ok(RawOutput {
            success,
            content: text,
            prompt: self.prompt.clone(),
        })
    }

    async fn send_raw(&mut self, data: &str) -> Result<(), NetError> {
        if !self.is_alive() {
            return Err(NetError::ChannelDisconnected);
        }
        self.device
            .runtime
            .raw_input
            .lock()
            .await
            .push(data.to_string());
        Ok(())
    }

    async fn read_prompt(&mut self, _timeout: Duration) -> Result<String, NetError> {
        if !self.is_alive() {
            return Err(NetError::ChannelDisconnected);
        }
        Ok(self.prompt.clone())
    }

    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn is_alive(&self) -> bool {
        self.open && self.device.reachable()
    }

    async fn close(&mut self) -> Result<(), NetError> {
        self.open = false;
        Ok(())
    }
}
