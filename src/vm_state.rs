//! Persisted VM record and the lifecycle state machine.
//!
//! `vm-state.json` is the only durable record of a VM. It is rewritten in
//! full on every status change and re-read on every lookup; in-memory
//! copies are never trusted across calls.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use facet::Facet;

use crate::config::VmConfig;
use crate::error::VmError;
use crate::util::write_atomic;

/// Metadata key set once the guest has reached `ready` at least once.
pub const META_EVER_READY: &str = "ever_ready";
/// Metadata key holding the hypervisor pid while a process is live.
pub const META_PID: &str = "pid";
/// Metadata key holding the hash of the cloud-init documents.
pub const META_SEED_HASH: &str = "seed_hash";
/// Metadata key recording which launch strategy owns the process.
pub const META_LAUNCH: &str = "launch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmStatus {
    Created,
    Initializing,
    Ready,
    Starting,
    Started,
    Stopped,
    Failed,
    Deleted,
}

impl VmStatus {
    pub const ALL: [VmStatus; 8] = [
        VmStatus::Created,
        VmStatus::Initializing,
        VmStatus::Ready,
        VmStatus::Starting,
        VmStatus::Started,
        VmStatus::Stopped,
        VmStatus::Failed,
        VmStatus::Deleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Created => "created",
            VmStatus::Initializing => "initializing",
            VmStatus::Ready => "ready",
            VmStatus::Starting => "starting",
            VmStatus::Started => "started",
            VmStatus::Stopped => "stopped",
            VmStatus::Failed => "failed",
            VmStatus::Deleted => "deleted",
        }
    }

    /// Statuses that claim a hypervisor process exists.
    pub fn claims_process(self) -> bool {
        matches!(
            self,
            VmStatus::Initializing | VmStatus::Starting | VmStatus::Started
        )
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VmStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown VM status '{s}'"))
    }
}

/// Lifecycle-mutating operations, checked against the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    WaitForInitialization,
    Stop,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Start => "start",
            Operation::WaitForInitialization => "wait for initialization of",
            Operation::Stop => "stop",
            Operation::Delete => "delete",
        })
    }
}

/// Status entered when `op` is accepted from `current`.
///
/// Every pair not listed is rejected with `InvalidState` and the caller
/// must leave the persisted status untouched.
pub fn transition(name: &str, current: VmStatus, op: Operation) -> Result<VmStatus, VmError> {
    use Operation as Op;
    use VmStatus as S;

    let next = match (op, current) {
        (Op::Start, S::Created) => Some(S::Initializing),
        (Op::Start, S::Ready | S::Stopped) => Some(S::Starting),
        (Op::WaitForInitialization, S::Initializing) => Some(S::Initializing),
        (Op::Stop, S::Started | S::Starting) => Some(S::Stopped),
        // Interrupting first boot leaves nothing usable behind.
        (Op::Stop, S::Initializing) => Some(S::Failed),
        (Op::Delete, s) if s != S::Deleted => Some(S::Deleted),
        _ => None,
    };

    next.ok_or_else(|| VmError::InvalidState {
        name: name.to_string(),
        operation: op.to_string(),
        status: current.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct SshInfo {
    pub username: String,
    pub host: String,
    pub port: u16,
    /// Path of the VM-local private key. A hint only; credentials are
    /// re-resolved on every connection.
    #[facet(default)]
    pub private_key_ref: String,
    #[facet(default)]
    pub password: Option<String>,
}

impl SshInfo {
    pub fn describe(&self) -> String {
        let mut s = format!("ssh -p {} {}@{}", self.port, self.username, self.host);
        if !self.private_key_ref.is_empty() {
            s.push_str(&format!(" -i {}", self.private_key_ref));
        }
        s
    }
}

/// The persisted VM entity.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct VmRecord {
    pub name: String,
    pub config: VmConfig,
    pub ssh_info: SshInfo,
    status: String,
    #[facet(default)]
    pub last_error: Option<String>,
    #[facet(default)]
    pub metadata: BTreeMap<String, String>,
    #[facet(default)]
    pub console_port: Option<u16>,
}

impl VmRecord {
    pub fn new(config: VmConfig, ssh_info: SshInfo) -> Self {
        Self {
            name: config.name.clone(),
            config,
            ssh_info,
            status: VmStatus::Created.to_string(),
            last_error: None,
            metadata: BTreeMap::new(),
            console_port: None,
        }
    }

    pub fn status(&self) -> VmStatus {
        // load_state rejects unknown statuses, so this only falls back for
        // records built in memory from bad input.
        self.status.parse().unwrap_or(VmStatus::Failed)
    }

    pub fn set_status(&mut self, status: VmStatus) {
        self.status = status.to_string();
        if status == VmStatus::Ready {
            self.metadata
                .insert(META_EVER_READY.to_string(), "true".to_string());
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.set_status(VmStatus::Failed);
        self.last_error = Some(reason.into());
    }

    /// Has the guest ever completed first boot?
    pub fn ever_ready(&self) -> bool {
        self.metadata
            .get(META_EVER_READY)
            .is_some_and(|v| v == "true")
    }

    pub fn pid(&self) -> Option<u32> {
        self.metadata.get(META_PID).and_then(|p| p.parse().ok())
    }

    pub fn set_pid(&mut self, pid: Option<u32>) {
        match pid {
            Some(pid) => {
                self.metadata.insert(META_PID.to_string(), pid.to_string());
            }
            None => {
                self.metadata.remove(META_PID);
            }
        }
    }

    /// Status a VM falls back to when its process has vanished.
    pub fn reconciled_status(&self) -> VmStatus {
        if self.ever_ready() {
            VmStatus::Stopped
        } else {
            VmStatus::Failed
        }
    }
}

/// Read and validate a state file.
pub async fn load_state(path: &Path) -> Result<VmRecord, VmError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| VmError::io(format!("reading {}", path.display()), e))?;
    parse_state(&contents, path)
}

fn parse_state(contents: &str, path: &Path) -> Result<VmRecord, VmError> {
    let record: VmRecord = facet_json::from_str(contents).map_err(|e| VmError::StateFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if let Err(message) = record.status.parse::<VmStatus>() {
        return Err(VmError::StateFile {
            path: path.display().to_string(),
            message,
        });
    }
    if record.name != record.config.name {
        return Err(VmError::StateFile {
            path: path.display().to_string(),
            message: format!(
                "name '{}' does not match config name '{}'",
                record.name, record.config.name
            ),
        });
    }
    Ok(record)
}

/// Rewrite the whole state file through an atomic replace.
pub async fn write_state(path: &Path, record: &VmRecord) -> Result<(), VmError> {
    let json = facet_json::to_string(record).map_err(|e| VmError::StateFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    write_atomic(path, json.as_bytes()).await?;
    tracing::debug!(vm = %record.name, status = %record.status, "persisted VM state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> VmRecord {
        VmRecord::new(
            VmConfig::new("t1", "ubuntu-22.04"),
            SshInfo {
                username: "dev".into(),
                host: "127.0.0.1".into(),
                port: 2222,
                private_key_ref: "/data/vms/t1/id_ed25519".into(),
                password: None,
            },
        )
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in VmStatus::ALL {
            assert_eq!(status.as_str().parse::<VmStatus>().unwrap(), status);
        }
        assert!("running".parse::<VmStatus>().is_err());
    }

    #[test]
    fn allowed_transitions() {
        use Operation as Op;
        use VmStatus as S;
        let cases = [
            (S::Created, Op::Start, S::Initializing),
            (S::Ready, Op::Start, S::Starting),
            (S::Stopped, Op::Start, S::Starting),
            (S::Initializing, Op::WaitForInitialization, S::Initializing),
            (S::Started, Op::Stop, S::Stopped),
            (S::Initializing, Op::Stop, S::Failed),
            (S::Failed, Op::Delete, S::Deleted),
            (S::Started, Op::Delete, S::Deleted),
        ];
        for (from, op, to) in cases {
            assert_eq!(transition("t1", from, op).unwrap(), to, "{from} --{op}-->");
        }
    }

    #[test]
    fn every_other_pair_is_invalid_state() {
        use Operation as Op;
        use VmStatus as S;
        let allowed = |from: S, op: Op| match op {
            Op::Start => matches!(from, S::Created | S::Ready | S::Stopped),
            Op::WaitForInitialization => from == S::Initializing,
            Op::Stop => matches!(from, S::Started | S::Starting | S::Initializing),
            Op::Delete => from != S::Deleted,
        };
        for from in S::ALL {
            for op in [Op::Start, Op::WaitForInitialization, Op::Stop, Op::Delete] {
                let result = transition("t1", from, op);
                if allowed(from, op) {
                    assert!(result.is_ok(), "{op} from {from} should be allowed");
                } else {
                    assert!(
                        matches!(result, Err(VmError::InvalidState { .. })),
                        "{op} from {from} should be InvalidState"
                    );
                }
            }
        }
    }

    #[test]
    fn reaching_ready_is_remembered() {
        let mut r = record();
        assert!(!r.ever_ready());
        assert_eq!(r.reconciled_status(), VmStatus::Failed);
        r.set_status(VmStatus::Ready);
        r.set_status(VmStatus::Started);
        assert!(r.ever_ready());
        assert_eq!(r.reconciled_status(), VmStatus::Stopped);
    }

    #[test]
    fn pid_metadata() {
        let mut r = record();
        r.set_pid(Some(4242));
        assert_eq!(r.pid(), Some(4242));
        r.set_pid(None);
        assert_eq!(r.pid(), None);
    }

    #[tokio::test]
    async fn state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-state.json");
        let mut r = record();
        r.fail("canceled by caller");
        r.console_port = Some(45555);
        write_state(&path, &r).await.unwrap();

        let loaded = load_state(&path).await.unwrap();
        assert_eq!(loaded, r);
        assert_eq!(loaded.status(), VmStatus::Failed);
        assert_eq!(loaded.last_error.as_deref(), Some("canceled by caller"));
    }

    #[tokio::test]
    async fn corrupt_state_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-state.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_state(&path).await.unwrap_err();
        assert!(matches!(err, VmError::StateFile { .. }));
    }
}
