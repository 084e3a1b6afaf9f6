use super::*;

use async_ssh2_tokio::Config;
use async_ssh2_tokio::client::{AuthMethod, Client};
use russh::ChannelMsg;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

use crate::platform;
use crate::prompt::{PromptMatcher, clean_line};

/// Opens PTY shells over SSH.
#[derive(Debug, Clone)]
pub struct SshConnector {
    terminal_width: u32,
    terminal_height: u32,
    setup_timeout: Duration,
}

impl SshConnector {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            terminal_width: config.terminal_width,
            terminal_height: config.terminal_height,
            setup_timeout: config.command_timeout,
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(&LinkConfig::default())
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &LinkTarget) -> Result<Box<dyn Transport>, NetError> {
        let label = target.label();
        let transport = tokio::time::timeout(target.connect_timeout, self.open(target))
            .await
            .map_err(|_| NetError::Timeout(format!("connect to {label}")))??;
        Ok(Box::new(transport))
    }
}

impl SshConnector {
    async fn open(&self, target: &LinkTarget) -> Result<SshTransport, NetError> {
        let label = target.label();

        let config = Config {
            preferred: target.security.algorithms(),
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let client = Client::connect_with_config(
            (target.address.clone(), target.port),
            &target.credentials.username,
            AuthMethod::with_password(&target.credentials.secret),
            target.security.host_key_check(),
            config,
        )
        .await?;
        debug!("{} TCP connection successful", label);

        let mut channel = client.get_channel().await?;
        channel
            .request_pty(
                false,
                "vt100",
                self.terminal_width,
                self.terminal_height,
                0,
                0,
                &[],
            )
            .await?;
        channel.request_shell(false).await?;
        debug!("{} Shell request successful", label);

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);
        let alive = Arc::new(AtomicBool::new(true));

        let io_alive = alive.clone();
        let io_label = label.clone();
        let io_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = receiver_from_user.recv() => {
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{} Failed to send data to shell: {:?}", io_label, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                let text = String::from_utf8_lossy(data).into_owned();
                                if sender_to_user.send(text).await.is_err() {
                                    debug!("{} Shell output receiver dropped. Closing task.", io_label);
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} Shell exited with status code: {}", io_label, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} Shell sent EOF.", io_label);
                                break;
                            }
                            _ => {}
                        }
                    }
                    else => break,
                }
            }
            io_alive.store(false, Ordering::SeqCst);
            debug!("{} SSH I/O task ended.", io_label);
        });

        let matcher = platform::prompt_matcher(&target.platform)?;
        let mut transport = SshTransport {
            client,
            sender: sender_to_shell,
            recv: receiver_from_shell,
            matcher,
            prompt: String::new(),
            label,
            alive,
            io_task,
        };

        transport.read_prompt(target.connect_timeout).await?;
        for command in platform::setup_commands(&target.platform) {
            if let Err(e) = transport.execute(command, self.setup_timeout).await {
                debug!("{} setup command '{}' failed: {}", transport.label, command, e);
            }
        }
        Ok(transport)
    }
}

/// An interactive PTY shell on an SSH connection.
pub struct SshTransport {
    client: Client,
    sender: Sender<String>,
    recv: Receiver<String>,
    matcher: PromptMatcher,
    prompt: String,
    label: String,
    alive: Arc<AtomicBool>,
    io_task: JoinHandle<()>,
}

impl SshTransport {
    async fn send(&self, data: String) -> Result<(), NetError> {
        self.sender
            .send(data)
            .await
            .map_err(|_| NetError::ChannelDisconnected)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<RawOutput, NetError> {
        // Drop output left over from a previous command.
        while self.recv.try_recv().is_ok() {}

        self.send(format!("{command}\n")).await?;

        let matcher = &mut self.matcher;
        let recv = &mut self.recv;
        let sender = &self.sender;
        let label = &self.label;
        let mut clean_output = String::new();
        let mut line_buffer = String::new();

        let result = tokio::time::timeout(timeout, async {
            let mut is_error = false;
            loop {
                let Some(data) = recv.recv().await else {
                    return Err(NetError::ChannelDisconnected);
                };
                trace!("{} {:?}", label, data);
                line_buffer.push_str(&data);

                while let Some(newline_pos) = line_buffer.find('\n') {
                    let line = line_buffer.drain(..=newline_pos).collect::<String>();
                    let cleaned = clean_line(&line);
                    let trimmed = cleaned.trim_end();
                    matcher.read(trimmed);
                    if matcher.error() {
                        is_error = true;
                    }
                    clean_output.push_str(trimmed);
                    clean_output.push('\n');
                }

                // The prompt usually arrives without a trailing newline.
                if !line_buffer.is_empty() {
                    let partial = clean_line(&line_buffer);
                    if matcher.read_prompt(&partial) {
                        matcher.read(&partial);
                        clean_output.push_str(&partial);
                        return Ok((!is_error, partial.trim().to_string()));
                    }
                    if let Some((answer, record)) = matcher.read_need_write(&partial) {
                        matcher.read(&partial);
                        if record {
                            clean_output.push_str(partial.trim_end());
                            clean_output.push('\n');
                        }
                        line_buffer.clear();
                        trace!("{} Input required: '{:?}'", label, answer);
                        sender
                            .send(answer)
                            .await
                            .map_err(|_| NetError::ChannelDisconnected)?;
                    }
                }
            }
        })
        .await;

        let (success, prompt) = match result {
            Err(_) => return Err(silent_timeout(&format!("'{command}'"), clean_output.len())),
            Ok(Err(err)) => return Err(err),
            Ok(Ok(done)) => done,
        };
        self.prompt = prompt;

        let mut content = clean_output.as_str();
        if !command.is_empty()
            && let Some(rest) = content.strip_prefix(command)
        {
            content = rest.trim_start_matches(['\n', '\r']);
        }
        let content = match content.rfind('\n') {
            Some(pos) => &content[..pos],
            None => "",
        };

        Ok(RawOutput {
            success,
            content: content.to_string(),
            prompt: self.prompt.clone(),
        })
    }

    async fn send_raw(&mut self, data: &str) -> Result<(), NetError> {
        self.send(data.to_string()).await
    }

    async fn read_prompt(&mut self, timeout: Duration) -> Result<String, NetError> {
        let matcher = &mut self.matcher;
        let recv = &mut self.recv;
        let sender = &self.sender;
        let mut buffer = String::new();
        let mut received = 0usize;

        let result = tokio::time::timeout(timeout, async {
            loop {
                let Some(data) = recv.recv().await else {
                    return Err(NetError::ChannelDisconnected);
                };
                buffer.push_str(&data);
                received += data.len();

                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer.drain(..=newline_pos).collect::<String>();
                    matcher.read(clean_line(&line).trim_end());
                }

                if !buffer.is_empty() {
                    let partial = clean_line(&buffer);
                    if matcher.read_prompt(&partial) {
                        matcher.read(&partial);
                        return Ok(partial.trim().to_string());
                    }
                    if let Some((answer, _)) = matcher.read_need_write(&partial) {
                        matcher.read(&partial);
                        buffer.clear();
                        sender
                            .send(answer)
                            .await
                            .map_err(|_| NetError::ChannelDisconnected)?;
                    }
                }
            }
        })
        .await;

        match result {
            Ok(Ok(prompt)) => {
                self.prompt = prompt.clone();
                Ok(prompt)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(silent_timeout("waiting for prompt", received)),
        }
    }

    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.client.is_closed()
    }

    async fn close(&mut self) -> Result<(), NetError> {
        debug!("{} Safely closing SSH connection...", self.label);
        self.recv.close();

        if self.is_alive() {
            if let Err(e) = self.sender.send("exit\n".to_string()).await {
                debug!("{} Failed to send exit command: {:?}", self.label, e);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let result = self.client.disconnect().await;
        self.io_task.abort();
        self.alive.store(false, Ordering::SeqCst);
        debug!("{} SSH connection closed", self.label);
        result.map_err(NetError::from)
    }
}

/// Timeout error that reports how much arrived, never what.
fn silent_timeout(waiting_for: &str, received: usize) -> NetError {
    NetError::Timeout(format!("{waiting_for}: no prompt after {received} bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_report_size_not_content() {
        let err = silent_timeout("'show running-config'", 4096);
        let report = err.report();
        assert_eq!(
            report.message,
            "operation timed out: 'show running-config': no prompt after 4096 bytes"
        );
        assert!(err.is_retryable());
    }
}
