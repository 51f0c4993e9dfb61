//! Live hypervisor processes, allocated host ports and per-VM locks.
//!
//! Owned by the [`Manager`](crate::manager::Manager) and handed to
//! collaborators by reference. Nothing here is persisted; on startup the
//! manager adopts processes it finds recorded in state files.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedMutexGuard, watch};

use crate::error::VmError;

/// Exit status published by the task that reaps a directly-owned child.
/// `None` while the process runs.
pub type ExitWatch = watch::Receiver<Option<i32>>;

#[derive(Debug, Clone)]
pub struct LiveProcess {
    pub pid: u32,
    pub ssh_port: Option<u16>,
    pub console_port: Option<u16>,
    /// Present only for processes this manager spawned directly.
    pub exit: Option<ExitWatch>,
}

impl LiveProcess {
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.ssh_port.into_iter().chain(self.console_port)
    }

    /// Whether the process is still running, as far as we can observe.
    pub fn is_running(&self) -> bool {
        match &self.exit {
            Some(exit) => exit.borrow().is_none(),
            None => crate::hypervisor::pid_alive(self.pid),
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    processes: HashMap<String, LiveProcess>,
    ports: HashSet<u16>,
}

#[derive(Debug, Default)]
pub struct Registry {
    table: Mutex<Table>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Attempts at finding an ephemeral port not already handed out.
const PORT_ATTEMPTS: usize = 64;

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // A poisoned table is still structurally valid.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serialize lifecycle-mutating operations on one VM name.
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Ask the OS for an ephemeral loopback port, skipping any this
    /// registry has already handed out.
    pub fn allocate_port(&self) -> Result<u16, VmError> {
        for _ in 0..PORT_ATTEMPTS {
            let listener = TcpListener::bind(("127.0.0.1", 0))
                .map_err(|e| VmError::io("binding an ephemeral port", e))?;
            let port = listener
                .local_addr()
                .map_err(|e| VmError::io("reading ephemeral port", e))?
                .port();
            drop(listener);

            let mut table = self.table();
            if table.ports.insert(port) {
                tracing::debug!(port, "allocated host port");
                return Ok(port);
            }
        }
        Err(VmError::io(
            "allocating a host port",
            std::io::Error::other("no unused ephemeral port found"),
        ))
    }

    pub fn release_ports(&self, ports: impl IntoIterator<Item = u16>) {
        let mut table = self.table();
        for port in ports {
            table.ports.remove(&port);
        }
    }

    /// Record a live process; its ports count as allocated.
    pub fn insert(&self, name: &str, process: LiveProcess) {
        let mut table = self.table();
        for port in process.ports() {
            table.ports.insert(port);
        }
        table.processes.insert(name.to_string(), process);
    }

    /// Forget a process and free its ports.
    pub fn remove(&self, name: &str) -> Option<LiveProcess> {
        let mut table = self.table();
        let process = table.processes.remove(name)?;
        for port in process.ports() {
            table.ports.remove(&port);
        }
        Some(process)
    }

    pub fn get(&self, name: &str) -> Option<LiveProcess> {
        self.table().processes.get(name).cloned()
    }

    /// Tracked and still running.
    pub fn is_running(&self, name: &str) -> bool {
        self.get(name).is_some_and(|p| p.is_running())
    }

    pub fn tracked_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table().processes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn allocated_ports(&self) -> HashSet<u16> {
        self.table().ports.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn allocated_ports_are_unique() {
        let registry = Registry::new();
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let port = registry.allocate_port().unwrap();
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        assert_eq!(registry.allocated_ports(), seen);
    }

    #[test]
    fn remove_frees_ports() {
        let registry = Registry::new();
        let (_tx, rx) = watch::channel(None);
        registry.insert(
            "t1",
            LiveProcess {
                pid: 4242,
                ssh_port: Some(40022),
                console_port: Some(40023),
                exit: Some(rx),
            },
        );
        assert!(registry.allocated_ports().contains(&40022));
        assert!(registry.is_running("t1"));

        let process = registry.remove("t1").unwrap();
        assert_eq!(process.pid, 4242);
        assert!(registry.allocated_ports().is_empty());
        assert!(registry.remove("t1").is_none());
    }

    #[test]
    fn exit_watch_reports_termination() {
        let registry = Registry::new();
        let (tx, rx) = watch::channel(None);
        registry.insert(
            "t1",
            LiveProcess {
                pid: 1,
                ssh_port: None,
                console_port: None,
                exit: Some(rx),
            },
        );
        tx.send(Some(0)).unwrap();
        assert!(!registry.is_running("t1"));
    }

    #[tokio::test]
    async fn per_name_lock_serializes() {
        let registry = Arc::new(Registry::new());
        let guard = registry.lock("t1").await;

        let r = registry.clone();
        let waiter = tokio::spawn(async move {
            let _g = r.lock("t1").await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        // Other names are independent.
        let _other = registry.lock("t2").await;

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
