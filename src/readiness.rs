//! First-boot readiness detection.
//!
//! Two strategies race: SSH authentication attempts at a fixed interval,
//! and a scan of the serial console log for a login prompt. The first
//! success wins and the sibling is canceled through a child token.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::credentials::{AuthMethod, CredentialSource};
use crate::error::VmError;
use crate::retry::{Attempt, RetryError, RetryPolicy};
use crate::ssh::{SshDialer, SshTarget, probe_any};

/// Bytes of console output kept between scans, so prompts split across
/// reads are still matched.
const WINDOW_BYTES: usize = 4096;

/// Incremental scanner over a growing console log.
#[derive(Debug)]
pub struct ConsoleScanner {
    path: PathBuf,
    patterns: Vec<String>,
    offset: u64,
    window: String,
}

impl ConsoleScanner {
    pub fn new(path: PathBuf, patterns: Vec<String>) -> Self {
        Self {
            path,
            patterns: patterns.into_iter().filter(|p| !p.is_empty()).collect(),
            offset: 0,
            window: String::new(),
        }
    }

    /// Read bytes appended since the last call and return the first
    /// pattern now present in the rolling window.
    pub fn scan(&mut self) -> std::io::Result<Option<String>> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len < self.offset {
            // Truncated or replaced; start over.
            self.offset = 0;
            self.window.clear();
        }
        if len == self.offset {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut fresh = Vec::new();
        file.read_to_end(&mut fresh)?;
        self.offset += fresh.len() as u64;
        self.window.push_str(&String::from_utf8_lossy(&fresh));

        let found = self
            .patterns
            .iter()
            .find(|p| self.window.contains(p.as_str()))
            .cloned();
        self.trim_window();
        Ok(found)
    }

    fn trim_window(&mut self) {
        if self.window.len() <= WINDOW_BYTES {
            return;
        }
        let mut cut = self.window.len() - WINDOW_BYTES;
        while !self.window.is_char_boundary(cut) {
            cut += 1;
        }
        self.window.drain(..cut);
    }
}

/// Which strategy declared the VM ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadySignal {
    Ssh { method: AuthMethod },
    LoginPrompt { pattern: String },
}

#[derive(Debug)]
pub enum NotReady {
    /// Both strategies ran out of time; last observed failure of each.
    TimedOut {
        ssh: Option<String>,
        console: Option<String>,
    },
    Canceled,
    /// A strategy hit a non-retryable error.
    Failed(VmError),
}

impl NotReady {
    pub fn describe(&self) -> String {
        match self {
            NotReady::TimedOut { ssh, console } => format!(
                "timed out (ssh: {}; console: {})",
                ssh.as_deref().unwrap_or("no attempt completed"),
                console.as_deref().unwrap_or("no login prompt seen"),
            ),
            NotReady::Canceled => "canceled by caller".into(),
            NotReady::Failed(e) => e.to_string(),
        }
    }
}

pub type Liveness = Arc<dyn Fn() -> bool + Send + Sync>;

/// Everything one readiness wait needs. Owned so both strategies can run
/// as spawned tasks.
pub struct ReadinessProbe {
    pub dialer: Arc<dyn SshDialer>,
    pub target: SshTarget,
    pub credentials: CredentialSource,
    pub console_log: PathBuf,
    pub login_patterns: Vec<String>,
    pub ssh_policy: RetryPolicy,
    pub console_policy: RetryPolicy,
    /// Reports whether the hypervisor process is still alive.
    pub process_alive: Liveness,
}

enum StrategyOutcome {
    Ready(ReadySignal),
    Gave(Strategy, RetryError),
}

#[derive(Debug, Clone, Copy)]
enum Strategy {
    Ssh,
    Console,
}

impl ReadinessProbe {
    /// Race both strategies. Returns once one succeeds, both fail, or
    /// `cancel` fires; no strategy task outlives this call.
    pub async fn wait(self, cancel: &CancellationToken) -> Result<ReadySignal, NotReady> {
        let race = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<StrategyOutcome>(1);

        let ssh_task = tokio::spawn(ssh_strategy(
            self.dialer.clone(),
            self.target.clone(),
            self.credentials.clone(),
            self.ssh_policy,
            race.clone(),
            tx.clone(),
        ));
        let console_task = tokio::spawn(console_strategy(
            self.credentials.vm_name.clone(),
            ConsoleScanner::new(self.console_log.clone(), self.login_patterns.clone()),
            self.console_policy,
            self.process_alive.clone(),
            race.clone(),
            tx,
        ));

        let mut ssh_failure = None;
        let mut console_failure = None;
        let mut outcome = None;
        let mut finished = 0;

        while let Some(result) = rx.recv().await {
            match result {
                StrategyOutcome::Ready(signal) => {
                    outcome = Some(Ok(signal));
                    break;
                }
                // Only a dead hypervisor ends the race; SSH giving up leaves
                // the console scan running.
                StrategyOutcome::Gave(Strategy::Console, RetryError::Aborted(e)) => {
                    outcome = Some(Err(NotReady::Failed(e)));
                    break;
                }
                StrategyOutcome::Gave(strategy, e) => {
                    tracing::debug!(?strategy, "readiness strategy gave up: {e}");
                    let last = e.last_failure().map(str::to_string).or(Some(e.to_string()));
                    match strategy {
                        Strategy::Ssh => ssh_failure = last,
                        Strategy::Console => console_failure = last,
                    }
                    finished += 1;
                    if finished == 2 {
                        break;
                    }
                }
            }
        }

        race.cancel();
        drop(rx);
        let _ = ssh_task.await;
        let _ = console_task.await;

        if cancel.is_cancelled() {
            return Err(NotReady::Canceled);
        }
        outcome.unwrap_or(Err(NotReady::TimedOut {
            ssh: ssh_failure,
            console: console_failure,
        }))
    }
}

async fn ssh_strategy(
    dialer: Arc<dyn SshDialer>,
    target: SshTarget,
    credentials: CredentialSource,
    policy: RetryPolicy,
    cancel: CancellationToken,
    tx: mpsc::Sender<StrategyOutcome>,
) {
    let result = policy
        .run(&cancel, |attempt| {
            let dialer = dialer.clone();
            let target = target.clone();
            let credentials = credentials.clone();
            async move {
                // Re-resolved each attempt; agent contents may have changed.
                let methods = match credentials.resolve().await {
                    Ok(m) => m,
                    Err(e) => return Attempt::Abort(e),
                };
                match probe_any(dialer.as_ref(), &target, &methods).await {
                    Ok(method) => Attempt::Done(method),
                    Err(e) => {
                        tracing::debug!(attempt, port = target.port, "guest not reachable yet: {e}");
                        Attempt::Retry(e.to_string())
                    }
                }
            }
        })
        .await;

    let outcome = match result {
        Ok(method) => {
            tracing::info!(%method, "guest reachable over SSH");
            StrategyOutcome::Ready(ReadySignal::Ssh { method })
        }
        Err(e) => StrategyOutcome::Gave(Strategy::Ssh, e),
    };
    let _ = tx.send(outcome).await;
}

async fn console_strategy(
    vm_name: String,
    mut scanner: ConsoleScanner,
    policy: RetryPolicy,
    process_alive: Liveness,
    cancel: CancellationToken,
    tx: mpsc::Sender<StrategyOutcome>,
) {
    let result = policy
        .run(&cancel, |_| {
            let mut found = scanner.scan();
            let alive = process_alive();
            if !alive && matches!(found, Ok(None)) {
                // The guest may have printed the prompt just before exiting.
                found = scanner.scan();
            }
            let vm_name = vm_name.clone();
            async move {
                match found {
                    Ok(Some(pattern)) => Attempt::Done(pattern),
                    // A prompt seen before exit still counts; only a silent
                    // exit is fatal.
                    Ok(None) if !alive => Attempt::Abort(VmError::HypervisorLaunchFailed {
                        name: vm_name,
                        message: "hypervisor exited before the guest became ready".into(),
                    }),
                    Ok(None) => Attempt::Retry("no login prompt yet".into()),
                    Err(e) => Attempt::Retry(format!("reading console log: {e}")),
                }
            }
        })
        .await;

    let outcome = match result {
        Ok(pattern) => {
            tracing::info!(%pattern, "login prompt observed on console");
            StrategyOutcome::Ready(ReadySignal::LoginPrompt { pattern })
        }
        Err(e) => StrategyOutcome::Gave(Strategy::Console, e),
    };
    let _ = tx.send(outcome).await;
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::SshConfig;
    use crate::ssh::ExecOutput;

    fn append(path: &std::path::Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn scanner_matches_prompt_split_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("qemu.log");
        let mut scanner = ConsoleScanner::new(log.clone(), vec!["login:".into()]);

        assert_eq!(scanner.scan().unwrap(), None);
        append(&log, "Ubuntu 22.04 LTS t1 ttyS0\n\nt1 log");
        assert_eq!(scanner.scan().unwrap(), None);
        append(&log, "in: ");
        assert_eq!(scanner.scan().unwrap().as_deref(), Some("login:"));
    }

    #[test]
    fn scanner_window_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("qemu.log");
        let mut scanner = ConsoleScanner::new(log.clone(), vec!["login:".into()]);
        append(&log, &"x".repeat(WINDOW_BYTES * 3));
        assert_eq!(scanner.scan().unwrap(), None);
        assert!(scanner.window.len() <= WINDOW_BYTES);
        append(&log, "login:");
        assert!(scanner.scan().unwrap().is_some());
    }

    #[test]
    fn scanner_restarts_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("qemu.log");
        let mut scanner = ConsoleScanner::new(log.clone(), vec!["login:".into()]);
        append(&log, "booting kernel...\n");
        assert_eq!(scanner.scan().unwrap(), None);
        std::fs::write(&log, "login:").unwrap();
        assert!(scanner.scan().unwrap().is_some());
    }

    struct ScriptedDialer {
        succeed_after: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SshDialer for ScriptedDialer {
        async fn probe(&self, _t: &SshTarget, _m: &AuthMethod) -> Result<(), VmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_after {
                Ok(())
            } else {
                Err(VmError::Ssh {
                    message: "connection refused".into(),
                })
            }
        }

        async fn exec(
            &self,
            _t: &SshTarget,
            _m: &AuthMethod,
            _c: &str,
        ) -> Result<ExecOutput, VmError> {
            Ok(ExecOutput::default())
        }

        async fn stream(
            &self,
            _t: &SshTarget,
            _m: &AuthMethod,
            _c: &str,
            _lines: mpsc::Sender<String>,
            _cancel: CancellationToken,
        ) -> Result<(), VmError> {
            Ok(())
        }
    }

    fn probe(dir: &std::path::Path, dialer: Arc<dyn SshDialer>, alive: Liveness) -> ReadinessProbe {
        let ssh = SshConfig::default();
        ReadinessProbe {
            dialer,
            target: SshTarget {
                host: "127.0.0.1".into(),
                port: 2222,
                username: "dev".into(),
                connect_timeout: Duration::from_secs(1),
            },
            credentials: CredentialSource {
                vm_name: "t1".into(),
                vm_key: dir.join("id_ed25519"),
                vm_public_key: dir.join("id_ed25519.pub"),
                home: None,
                ssh,
                stored_password: None,
            },
            console_log: dir.join("qemu.log"),
            login_patterns: vec!["login:".into()],
            ssh_policy: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(400)),
            console_policy: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(400)),
            process_alive: alive,
        }
    }

    fn always_alive() -> Liveness {
        Arc::new(|| true)
    }

    #[tokio::test]
    async fn ssh_success_wins() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = Arc::new(ScriptedDialer {
            succeed_after: 3,
            calls: AtomicU32::new(0),
        });
        let signal = probe(dir.path(), dialer.clone(), always_alive())
            .wait(&CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(signal, ReadySignal::Ssh { .. }));
        assert!(dialer.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn login_prompt_wins_even_after_process_exit() {
        let dir = tempfile::tempdir().unwrap();
        append(&dir.path().join("qemu.log"), "\nt1 login: ");
        let dialer = Arc::new(ScriptedDialer {
            succeed_after: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let signal = probe(dir.path(), dialer, Arc::new(|| false))
            .wait(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            signal,
            ReadySignal::LoginPrompt {
                pattern: "login:".into()
            }
        );
    }

    #[tokio::test]
    async fn silent_process_exit_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = Arc::new(ScriptedDialer {
            succeed_after: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let err = probe(dir.path(), dialer, Arc::new(|| false))
            .wait(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NotReady::Failed(_)));
    }

    #[tokio::test]
    async fn both_strategies_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = Arc::new(ScriptedDialer {
            succeed_after: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let err = probe(dir.path(), dialer, always_alive())
            .wait(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            NotReady::TimedOut { ssh, console } => {
                assert!(ssh.unwrap().contains("connection refused"));
                assert_eq!(console.as_deref(), Some("no login prompt yet"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_both_strategies() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = Arc::new(ScriptedDialer {
            succeed_after: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let mut p = probe(dir.path(), dialer, always_alive());
        p.ssh_policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(60));
        p.console_policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fired2.store(true, Ordering::SeqCst);
            trigger.cancel();
        });
        let err = p.wait(&cancel).await.unwrap_err();
        assert!(fired.load(Ordering::SeqCst));
        assert!(matches!(err, NotReady::Canceled));
    }

    #[tokio::test]
    async fn prompt_written_as_the_process_exits_still_counts() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("qemu.log");
        append(&log, "booting kernel...\n");
        let dialer = Arc::new(ScriptedDialer {
            succeed_after: u32::MAX,
            calls: AtomicU32::new(0),
        });
        // The prompt lands after the scan but before the liveness check.
        let exiting_guest: Liveness = Arc::new(move || {
            append(&log, "t1 login: ");
            false
        });
        let signal = probe(dir.path(), dialer, exiting_guest)
            .wait(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            signal,
            ReadySignal::LoginPrompt {
                pattern: "login:".into()
            }
        );
    }

    #[tokio::test]
    async fn missing_credentials_leave_console_scan_running() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = Arc::new(ScriptedDialer {
            succeed_after: 1,
            calls: AtomicU32::new(0),
        });
        let mut p = probe(dir.path(), dialer.clone(), always_alive());
        p.credentials.ssh.allow_password = false;
        p.credentials.ssh.key_paths.clear();

        let log = dir.path().join("qemu.log");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            append(&log, "\nt1 login: ");
        });

        let signal = p.wait(&CancellationToken::new()).await.unwrap();
        assert!(matches!(signal, ReadySignal::LoginPrompt { .. }));
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }
}
