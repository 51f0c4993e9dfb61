use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::{self, HashAlg, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::credentials::AuthMethod;
use crate::error::VmError;
use crate::vm_state::SshInfo;

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn from_info(info: &SshInfo, connect_timeout: Duration) -> Self {
        Self {
            host: info.host.clone(),
            port: info.port,
            username: info.username.clone(),
            connect_timeout,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

/// Guest SSH access. The manager and readiness monitor only talk to the
/// guest through this trait so tests can substitute a stub.
#[async_trait]
pub trait SshDialer: Send + Sync {
    /// Connect and authenticate, then disconnect.
    async fn probe(&self, target: &SshTarget, method: &AuthMethod) -> Result<(), VmError>;

    async fn exec(
        &self,
        target: &SshTarget,
        method: &AuthMethod,
        command: &str,
    ) -> Result<ExecOutput, VmError>;

    /// Run a long-lived command and forward its output line by line until
    /// it exits or `cancel` fires.
    async fn stream(
        &self,
        target: &SshTarget,
        method: &AuthMethod,
        command: &str,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), VmError>;
}

/// Try each method in order; return the first that authenticates.
pub async fn probe_any(
    dialer: &dyn SshDialer,
    target: &SshTarget,
    methods: &[AuthMethod],
) -> Result<AuthMethod, VmError> {
    let mut failures = Vec::new();
    for method in methods {
        match dialer.probe(target, method).await {
            Ok(()) => return Ok(method.clone()),
            Err(e) => {
                tracing::debug!(host = %target.host, port = target.port, %method, "SSH probe failed: {e}");
                failures.push(format!("{method}: {e}"));
            }
        }
    }
    Err(VmError::Ssh {
        message: failures.join("; "),
    })
}

fn ssh_err(message: impl Into<String>) -> VmError {
    VmError::Ssh {
        message: message.into(),
    }
}

/// Accepts all server keys; guests regenerate host keys on every first boot.
struct SshHandler;

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// [`SshDialer`] backed by `russh`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshDialer;

impl RusshDialer {
    async fn connect(
        &self,
        target: &SshTarget,
        method: &AuthMethod,
    ) -> Result<client::Handle<SshHandler>, VmError> {
        let config = Arc::new(client::Config::default());
        let addr = (target.host.as_str(), target.port);

        let mut handle = tokio::time::timeout(
            target.connect_timeout,
            client::connect(config, addr, SshHandler),
        )
        .await
        .map_err(|_| {
            ssh_err(format!(
                "connecting to {}:{} timed out",
                target.host, target.port
            ))
        })?
        .map_err(|e| ssh_err(format!("connecting to {}:{}: {e}", target.host, target.port)))?;

        let user = target.username.as_str();
        let auth = match method {
            AuthMethod::KeyFile(path) => {
                let key_data = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| ssh_err(format!("reading {}: {e}", path.display())))?;
                let key = keys::decode_secret_key(&key_data, None)
                    .map_err(|e| ssh_err(format!("decoding {}: {e}", path.display())))?;
                let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(user, key_with_alg)
                    .await
                    .map_err(|e| ssh_err(e.to_string()))?
            }
            AuthMethod::Agent { fingerprint, .. } => {
                let mut agent = keys::agent::client::AgentClient::connect_env()
                    .await
                    .map_err(|e| ssh_err(format!("connecting to ssh-agent: {e}")))?;
                let identities = agent
                    .request_identities()
                    .await
                    .map_err(|e| ssh_err(format!("listing agent keys: {e}")))?;
                let key = identities
                    .into_iter()
                    .find(|k| k.fingerprint(HashAlg::Sha256).to_string() == *fingerprint)
                    .ok_or_else(|| ssh_err(format!("agent no longer holds {fingerprint}")))?;
                handle
                    .authenticate_publickey_with(user, key, None, &mut agent)
                    .await
                    .map_err(|e| ssh_err(e.to_string()))?
            }
            AuthMethod::Password(password) => handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| ssh_err(e.to_string()))?,
        };

        if !auth.success() {
            return Err(ssh_err(format!("{method} rejected for user {user}")));
        }
        Ok(handle)
    }
}

#[async_trait]
impl SshDialer for RusshDialer {
    async fn probe(&self, target: &SshTarget, method: &AuthMethod) -> Result<(), VmError> {
        let handle = self.connect(target, method).await?;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        Ok(())
    }

    async fn exec(
        &self,
        target: &SshTarget,
        method: &AuthMethod,
        command: &str,
    ) -> Result<ExecOutput, VmError> {
        let handle = self.connect(target, method).await?;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_err(format!("opening session: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ssh_err(format!("exec: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, .. } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn stream(
        &self,
        target: &SshTarget,
        method: &AuthMethod,
        command: &str,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), VmError> {
        let handle = self.connect(target, method).await?;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_err(format!("opening session: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ssh_err(format!("exec: {e}")))?;

        let mut buffer = LineBuffer::default();
        let mut exit_code = None;
        'read: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = channel.close().await;
                    break;
                }
                msg = channel.wait() => match msg {
                    None => break,
                    Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                        for line in buffer.push(&data) {
                            if lines.send(line).await.is_err() {
                                // Receiver gone; nobody is listening any more.
                                let _ = channel.close().await;
                                break 'read;
                            }
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                    Some(_) => {}
                },
            }
        }
        if let Some(rest) = buffer.finish() {
            let _ = lines.send(rest).await;
        }
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        match exit_code {
            Some(code) if code != 0 && !cancel.is_cancelled() => {
                Err(ssh_err(format!("`{command}` exited with status {code}")))
            }
            _ => Ok(()),
        }
    }
}

/// Splits a byte stream into lines, carrying partial lines across chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(i) = self.pending.find('\n') {
            let line = self.pending[..i].trim_end_matches('\r').to_string();
            self.pending.drain(..=i);
            lines.push(line);
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn line_buffer_joins_partial_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"[    0.1] Linux ver").is_empty());
        assert_eq!(buf.push(b"sion 6.8\r\n[    0.2] x"), vec!["[    0.1] Linux version 6.8"]);
        assert_eq!(buf.push(b"\n\n"), vec!["[    0.2] x", ""]);
        assert_eq!(buf.finish(), None);
        buf.push(b"tail");
        assert_eq!(buf.finish().as_deref(), Some("tail"));
    }

    /// Accepts only the listed methods.
    struct PickyDialer {
        accept: AuthMethod,
        seen: Mutex<Vec<AuthMethod>>,
    }

    #[async_trait]
    impl SshDialer for PickyDialer {
        async fn probe(&self, _target: &SshTarget, method: &AuthMethod) -> Result<(), VmError> {
            self.seen.lock().unwrap().push(method.clone());
            if *method == self.accept {
                Ok(())
            } else {
                Err(ssh_err("rejected"))
            }
        }

        async fn exec(
            &self,
            _target: &SshTarget,
            _method: &AuthMethod,
            _command: &str,
        ) -> Result<ExecOutput, VmError> {
            Ok(ExecOutput::default())
        }

        async fn stream(
            &self,
            _target: &SshTarget,
            _method: &AuthMethod,
            _command: &str,
            _lines: mpsc::Sender<String>,
            _cancel: CancellationToken,
        ) -> Result<(), VmError> {
            Ok(())
        }
    }

    fn target() -> SshTarget {
        SshTarget {
            host: "127.0.0.1".into(),
            port: 2222,
            username: "dev".into(),
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn probe_any_tries_methods_in_order() {
        let methods = vec![
            AuthMethod::KeyFile("/vm/id_ed25519".into()),
            AuthMethod::KeyFile("/home/u/.ssh/id_rsa".into()),
            AuthMethod::Password(String::new()),
        ];
        let dialer = PickyDialer {
            accept: methods[1].clone(),
            seen: Mutex::new(Vec::new()),
        };
        let winner = probe_any(&dialer, &target(), &methods).await.unwrap();
        assert_eq!(winner, methods[1]);
        assert_eq!(*dialer.seen.lock().unwrap(), methods[..2].to_vec());
    }

    #[tokio::test]
    async fn probe_any_reports_every_failure() {
        let methods = vec![
            AuthMethod::KeyFile("/vm/id_ed25519".into()),
            AuthMethod::Password(String::new()),
        ];
        let dialer = PickyDialer {
            accept: AuthMethod::Password("other".into()),
            seen: Mutex::new(Vec::new()),
        };
        let err = probe_any(&dialer, &target(), &methods).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("key file /vm/id_ed25519"));
        assert!(msg.contains("empty password"));
    }
}
