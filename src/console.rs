//! Concurrent guest log streaming over SSH.
//!
//! Each source runs as its own task. Failures are fanned into one
//! collector and reported; they never stop the other sources. Only the
//! caller's cancellation token stops everything.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::credentials::AuthMethod;
use crate::error::VmError;
use crate::ssh::{SshDialer, SshTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSource {
    pub label: &'static str,
    pub command: &'static str,
}

pub const KERNEL: LogSource = LogSource {
    label: "kernel",
    command: "sudo dmesg --follow",
};
pub const CLOUD_INIT_JOURNAL: LogSource = LogSource {
    label: "cloud-init",
    command: "sudo journalctl --follow --no-pager -u cloud-init -u cloud-final",
};
pub const CLOUD_INIT_LOG: LogSource = LogSource {
    label: "cloud-init.log",
    command: "sudo tail -n 50 -F /var/log/cloud-init.log",
};

pub const DEFAULT_SOURCES: &[LogSource] = &[KERNEL, CLOUD_INIT_JOURNAL, CLOUD_INIT_LOG];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source: &'static str,
    pub line: String,
}

#[derive(Debug)]
pub struct SourceFailure {
    pub source: &'static str,
    pub error: VmError,
}

/// Stream every source into `out` until all of them end or `cancel` fires.
/// Returns the failures collected along the way.
pub async fn stream_logs(
    dialer: Arc<dyn SshDialer>,
    target: SshTarget,
    method: AuthMethod,
    sources: &[LogSource],
    out: mpsc::Sender<LogLine>,
    cancel: CancellationToken,
) -> Vec<SourceFailure> {
    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel::<SourceFailure>();
    let mut tasks = JoinSet::new();

    for &source in sources {
        let dialer = dialer.clone();
        let target = target.clone();
        let method = method.clone();
        let out = out.clone();
        let cancel = cancel.clone();
        let fail_tx = fail_tx.clone();
        tasks.spawn(async move {
            let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
            // Owns the receiver, so a caller that stops listening also
            // unblocks the guest-side stream.
            let forward = async move {
                while let Some(line) = line_rx.recv().await {
                    let tagged = LogLine {
                        source: source.label,
                        line,
                    };
                    if out.send(tagged).await.is_err() {
                        break;
                    }
                }
            };
            let run = dialer.stream(&target, &method, source.command, line_tx, cancel);
            let (result, ()) = tokio::join!(run, forward);
            if let Err(error) = result {
                tracing::warn!(source = source.label, "log source failed: {error}");
                let _ = fail_tx.send(SourceFailure {
                    source: source.label,
                    error,
                });
            }
        });
    }
    drop(fail_tx);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!("log stream task panicked: {e}");
        }
    }

    let mut failures = Vec::new();
    while let Ok(failure) = fail_rx.try_recv() {
        failures.push(failure);
    }
    failures
}
