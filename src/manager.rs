//! VM lifecycle orchestration.
//!
//! The manager owns the [`Registry`] and the collaborators that reach
//! outside the process (SSH, terminal multiplexer). Every mutating
//! operation holds the per-name lock for its whole duration; reads go
//! straight to the state file and take the lock only to persist a
//! reconciliation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cloudinit::{GuestCredential, SeedInput, build_documents, parse_static_address, write_seed};
use crate::config::{AuthMode, HostConfig, LaunchStrategy, NetworkMode, VmConfig};
use crate::console::{DEFAULT_SOURCES, LogLine, SourceFailure, stream_logs};
use crate::credentials::{AuthMethod, CredentialSource, generate_keypair};
use crate::error::VmError;
use crate::hypervisor::{
    HostInfo, LaunchPlan, build_invocation, detect_host, launch_direct, launch_in_session,
    pid_alive, terminate,
};
use crate::image::ImageStore;
use crate::logging::utc_timestamp;
use crate::mux::{Multiplexer, TmuxMultiplexer};
use crate::overlay;
use crate::paths::{VmPaths, quarantine_dir, vms_dir};
use crate::readiness::{Liveness, NotReady, ReadinessProbe};
use crate::registry::{LiveProcess, Registry};
use crate::retry::RetryPolicy;
use crate::ssh::{ExecOutput, RusshDialer, SshDialer, SshTarget, probe_any};
use crate::util::{generate_mac, random_password, tail_lines};
use crate::vm_state::{
    META_LAUNCH, META_SEED_HASH, Operation, SshInfo, VmRecord, VmStatus, load_state, transition,
    write_state,
};

const PASSWORD_LEN: usize = 20;

pub struct Manager {
    config: HostConfig,
    data_dir: PathBuf,
    host: HostInfo,
    registry: Arc<Registry>,
    images: ImageStore,
    dialer: Arc<dyn SshDialer>,
    mux: Arc<dyn Multiplexer>,
}

impl Manager {
    /// A manager talking to real guests over SSH and to `tmux`.
    pub fn new(config: HostConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(RusshDialer),
            Arc::new(TmuxMultiplexer::default()),
        )
    }

    pub fn with_collaborators(
        config: HostConfig,
        dialer: Arc<dyn SshDialer>,
        mux: Arc<dyn Multiplexer>,
    ) -> Self {
        let data_dir = config.data_dir();
        Self {
            images: ImageStore::new(&data_dir),
            host: detect_host(),
            registry: Arc::new(Registry::new()),
            config,
            data_dir,
            dialer,
            mux,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn paths(&self, name: &str) -> VmPaths {
        VmPaths::new(&self.data_dir, name, &self.config.hypervisor.disk_format)
    }

    // ── Create ────────────────────────────────────────────

    /// Clone the disk, generate credentials and the cloud-init seed, and
    /// persist the VM as `created`. Never downloads images.
    pub async fn create(&self, mut config: VmConfig) -> Result<VmRecord, VmError> {
        config.validate()?;
        let name = config.name.clone();
        let _guard = self.registry.lock(&name).await;
        let paths = self.paths(&name);

        if paths.dir.exists() {
            match self.load(&name).await {
                Ok(record) if record.status() == VmStatus::Deleted => {
                    tracing::warn!(vm = %name, "removing leftovers of an interrupted delete");
                    remove_tree(&paths.dir).await?;
                }
                _ => return Err(VmError::AlreadyExists { name }),
            }
        }

        let base = self.images.require(&config.base_image).await?;
        if config.network.mac_address.is_empty() {
            config.network.mac_address = generate_mac();
        }

        tokio::fs::create_dir_all(&paths.dir)
            .await
            .map_err(|e| VmError::io(format!("creating {}", paths.dir.display()), e))?;

        match self.provision(config, &base, &paths).await {
            Ok(record) => {
                tracing::info!(vm = %name, path = %paths.dir.display(), "VM created");
                Ok(record)
            }
            Err(e) => {
                // Nothing has run yet; a half-built directory would only
                // block the next attempt.
                if let Err(cleanup) = remove_tree(&paths.dir).await {
                    tracing::warn!(vm = %name, "cleaning up after failed create: {cleanup}");
                }
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        config: VmConfig,
        base: &Path,
        paths: &VmPaths,
    ) -> Result<VmRecord, VmError> {
        let hv = &self.config.hypervisor;
        overlay::create_overlay(&hv.qemu_img, base, &paths.disk(), &hv.disk_format).await?;
        if !config.disk_size.is_empty() {
            overlay::resize(&hv.qemu_img, &paths.disk(), &config.disk_size).await?;
        }

        let (credential, password, private_key_ref) = match self.config.auth_mode() {
            AuthMode::Key => {
                let public = generate_keypair(
                    &paths.private_key(),
                    &paths.public_key(),
                    &format!("vmlab-{}", config.name),
                )
                .await
                .map_err(|e| VmError::NoCredentialsAvailable {
                    name: config.name.clone(),
                    tried: format!("generating a VM key pair: {e}"),
                })?;
                (
                    GuestCredential::PublicKey(public),
                    None,
                    paths.private_key().display().to_string(),
                )
            }
            AuthMode::Password => {
                let password = random_password(PASSWORD_LEN);
                (
                    GuestCredential::Password(password.clone()),
                    Some(password),
                    String::new(),
                )
            }
        };

        let docs = build_documents(&SeedInput {
            config: &config,
            username: &self.config.ssh.username,
            credential: &credential,
        })?;
        write_seed(paths, &docs).await?;

        let (host, port) = match config.network.mode() {
            // The forward port is allocated on every start.
            NetworkMode::User => ("127.0.0.1".to_string(), 0),
            NetworkMode::Bridged => (bridged_host(&config), 22),
        };
        let ssh_info = SshInfo {
            username: self.config.ssh.username.clone(),
            host,
            port,
            private_key_ref,
            password,
        };

        let mut record = VmRecord::new(config, ssh_info);
        record
            .metadata
            .insert(META_SEED_HASH.to_string(), docs.hash());
        self.persist(paths, &record).await?;
        Ok(record)
    }

    // ── Start ─────────────────────────────────────────────

    /// `created` boots with the cloud-init seed and becomes `initializing`;
    /// `ready`/`stopped` pass through `starting` to `started`.
    pub async fn start(&self, name: &str) -> Result<VmRecord, VmError> {
        let _guard = self.registry.lock(name).await;
        let paths = self.paths(name);
        let record = self.load(name).await?;
        let mut record = self.reconcile(record, &paths).await?;

        let current = record.status();
        let next = transition(name, current, Operation::Start)?;
        let first_boot = current == VmStatus::Created;

        let ssh_port = match record.config.network.mode() {
            NetworkMode::User => Some(self.registry.allocate_port()?),
            NetworkMode::Bridged => None,
        };
        let qmp_port = match self.registry.allocate_port() {
            Ok(port) => port,
            Err(e) => {
                self.registry.release_ports(ssh_port);
                return Err(e);
            }
        };
        let ports: Vec<u16> = ssh_port.into_iter().chain([qmp_port]).collect();

        let strategy = self.config.launch_strategy();
        let plan = LaunchPlan {
            config: &record.config,
            paths: &paths,
            first_boot,
            ssh_port,
            qmp_port,
            strategy,
        };
        let invocation = match build_invocation(&self.host, &self.config.hypervisor, &plan) {
            Ok(invocation) => invocation,
            Err(e) => {
                self.registry.release_ports(ports);
                return Err(e);
            }
        };
        tracing::debug!(vm = name, command = %invocation.shell_line(), "launching hypervisor");

        let launched = match strategy {
            LaunchStrategy::Direct => launch_direct(name, &invocation, &paths).await,
            LaunchStrategy::Session => {
                launch_in_session(name, &invocation, &paths, self.mux.as_ref()).await
            }
        };
        let launched = match launched {
            Ok(launched) => launched,
            Err(e) => {
                self.registry.release_ports(ports);
                self.close_session_quietly(name).await;
                record.set_pid(None);
                record.fail(e.to_string());
                self.persist(&paths, &record).await?;
                return Err(e);
            }
        };

        self.registry.insert(
            name,
            LiveProcess {
                pid: launched.pid,
                ssh_port,
                console_port: Some(qmp_port),
                exit: launched.exit,
            },
        );
        record.set_pid(Some(launched.pid));
        record.console_port = Some(qmp_port);
        if let Some(port) = ssh_port {
            record.ssh_info.port = port;
        }
        record.metadata.insert(
            META_LAUNCH.to_string(),
            match strategy {
                LaunchStrategy::Direct => "direct",
                LaunchStrategy::Session => "session",
            }
            .to_string(),
        );
        record.last_error = None;
        record.set_status(next);
        self.persist(&paths, &record).await?;

        if next == VmStatus::Starting {
            record.set_status(VmStatus::Started);
            self.persist(&paths, &record).await?;
        }

        tracing::info!(
            vm = name,
            status = %record.status(),
            pid = launched.pid,
            ssh = %record.ssh_info.describe(),
            "VM started"
        );
        self.publish_status(&record, None).await;
        Ok(record)
    }

    // ── WaitForInitialization ─────────────────────────────

    /// Block until first boot completes, then power the guest off and mark
    /// it `ready`. Timeout, SSH failure or cancellation kills the
    /// hypervisor and leaves the VM `failed`.
    ///
    /// Cancellation while another operation holds the VM's lock returns
    /// `CanceledByCaller` without touching the VM; that operation owns its
    /// state. Once the lock is held, cancellation at any point ends `failed`.
    pub async fn wait_for_initialization(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<VmRecord, VmError> {
        // A free lock wins over an already-canceled token.
        let _guard = tokio::select! {
            biased;
            guard = self.registry.lock(name) => guard,
            _ = cancel.cancelled() => {
                return Err(VmError::CanceledByCaller {
                    name: name.to_string(),
                    report: format!("VM '{name}' was busy with another operation; nothing was changed"),
                });
            }
        };
        let paths = self.paths(name);
        let mut record = self.load(name).await?;
        transition(name, record.status(), Operation::WaitForInitialization)?;
        if cancel.is_cancelled() {
            return Err(self.cancel_initialization(&mut record, &paths).await);
        }

        let process = self.live_process(name, &record);
        let process_alive: Liveness = match process.clone() {
            Some(p) => Arc::new(move || p.is_running()),
            None => Arc::new(|| false),
        };

        let ssh = &self.config.ssh;
        let deadline = Duration::from_secs(ssh.ready_timeout_s);
        let probe = ReadinessProbe {
            dialer: self.dialer.clone(),
            target: self.ssh_target(&record),
            credentials: self.credential_source(&record, &paths),
            console_log: paths.console_log(),
            login_patterns: self.config.console.login_patterns.clone(),
            ssh_policy: RetryPolicy::new(Duration::from_secs(ssh.poll_interval_s), deadline),
            console_policy: RetryPolicy::new(
                Duration::from_millis(self.config.console.scan_interval_ms),
                deadline,
            ),
            process_alive,
        };

        tracing::info!(vm = name, timeout_s = ssh.ready_timeout_s, "waiting for first boot");
        match probe.wait(cancel).await {
            Ok(signal) => {
                tracing::info!(vm = name, ?signal, "first boot complete");
                if let Some(process) = &process {
                    let shutdown = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        result = terminate(name, process, true, &self.config.shutdown) => Some(result),
                    };
                    match shutdown {
                        None => return Err(self.cancel_initialization(&mut record, &paths).await),
                        Some(Err(e)) => {
                            self.abandon(&mut record, &paths, format!("shutdown after first boot failed: {e}"))
                                .await;
                            return Err(e);
                        }
                        Some(Ok(_)) => {}
                    }
                }
                self.registry.remove(name);
                record.set_pid(None);
                record.last_error = None;
                record.set_status(VmStatus::Ready);
                self.persist(&paths, &record).await?;
                self.close_session_quietly(name).await;
                Ok(record)
            }
            Err(NotReady::Canceled) => Err(self.cancel_initialization(&mut record, &paths).await),
            Err(not_ready) => {
                let message = not_ready.describe();
                let report = self
                    .abandon(&mut record, &paths, format!("not ready: {message}"))
                    .await;
                Err(VmError::ReadinessTimeout {
                    name: name.to_string(),
                    message,
                    report,
                })
            }
        }
    }

    async fn cancel_initialization(&self, record: &mut VmRecord, paths: &VmPaths) -> VmError {
        let report = self.abandon(record, paths, "canceled by caller".into()).await;
        VmError::CanceledByCaller {
            name: record.name.clone(),
            report,
        }
    }

    /// Kill the hypervisor and record `failed`. Returns the failure report.
    async fn abandon(&self, record: &mut VmRecord, paths: &VmPaths, reason: String) -> String {
        let name = record.name.clone();
        if let Some(process) = self.live_process(&name, record) {
            if let Err(e) = terminate(&name, &process, false, &self.config.shutdown).await {
                tracing::error!(vm = %name, pid = process.pid, "could not kill hypervisor: {e}");
            }
        }
        self.registry.remove(&name);
        record.set_pid(None);
        record.fail(reason);
        if let Err(e) = self.persist(paths, record).await {
            tracing::error!(vm = %name, "could not record failure: {e}");
        }
        self.close_session_quietly(&name).await;
        tracing::warn!(vm = %name, error = record.last_error.as_deref().unwrap_or(""), "VM failed");
        self.failure_report(record, paths)
    }

    // ── Stop / Delete ─────────────────────────────────────

    /// Power-down, then SIGTERM, then SIGKILL. A process that is already
    /// gone counts as stopped.
    pub async fn stop(&self, name: &str) -> Result<VmRecord, VmError> {
        let _guard = self.registry.lock(name).await;
        let paths = self.paths(name);
        let mut record = self.load(name).await?;
        let next = transition(name, record.status(), Operation::Stop)?;

        if let Some(process) = self.live_process(name, &record) {
            let outcome = terminate(name, &process, true, &self.config.shutdown).await?;
            tracing::debug!(vm = name, ?outcome, "hypervisor stopped");
        }
        self.registry.remove(name);
        record.set_pid(None);
        if next == VmStatus::Failed {
            record.fail("stopped before first boot completed");
        } else {
            record.set_status(next);
        }
        self.persist(&paths, &record).await?;
        self.close_session_quietly(name).await;

        tracing::info!(vm = name, status = %record.status(), "VM stopped");
        Ok(record)
    }

    /// Kill any running hypervisor, record `deleted`, then remove the VM
    /// directory.
    pub async fn delete(&self, name: &str) -> Result<(), VmError> {
        let _guard = self.registry.lock(name).await;
        let paths = self.paths(name);
        if !paths.dir.exists() {
            return Err(VmError::NotFound {
                name: name.to_string(),
            });
        }

        match self.load(name).await {
            Ok(mut record) => {
                if let Some(process) = self.live_process(name, &record) {
                    terminate(name, &process, false, &self.config.shutdown).await?;
                }
                if record.status() != VmStatus::Deleted {
                    let next = transition(name, record.status(), Operation::Delete)?;
                    record.set_pid(None);
                    record.set_status(next);
                    self.persist(&paths, &record).await?;
                }
            }
            Err(e) => tracing::warn!(vm = name, "state unreadable, deleting anyway: {e}"),
        }

        self.registry.remove(name);
        self.close_session_quietly(name).await;
        remove_tree(&paths.dir).await?;
        tracing::info!(vm = name, "VM deleted");
        Ok(())
    }

    /// Move every `stopped` VM directory to `<data_dir>/quarantine/`.
    pub async fn quarantine_stopped(&self) -> Result<Vec<(String, PathBuf)>, VmError> {
        let root = quarantine_dir(&self.data_dir);
        let stamp = utc_timestamp();
        let mut moved = Vec::new();

        for candidate in self.list().await? {
            if candidate.status() != VmStatus::Stopped {
                continue;
            }
            let name = candidate.name;
            let _guard = self.registry.lock(&name).await;
            // Re-check under the lock.
            let paths = self.paths(&name);
            match self.load(&name).await {
                Ok(record) if record.status() == VmStatus::Stopped => {}
                _ => continue,
            }

            tokio::fs::create_dir_all(&root)
                .await
                .map_err(|e| VmError::io(format!("creating {}", root.display()), e))?;
            let dest = root.join(format!("{name}-{stamp}"));
            tokio::fs::rename(&paths.dir, &dest).await.map_err(|e| {
                VmError::io(
                    format!("moving {} to {}", paths.dir.display(), dest.display()),
                    e,
                )
            })?;
            self.registry.remove(&name);
            tracing::info!(vm = %name, path = %dest.display(), "quarantined stopped VM");
            moved.push((name, dest));
        }
        Ok(moved)
    }

    // ── Queries ───────────────────────────────────────────

    /// Re-read the state file, correcting a status that claims a process
    /// nobody can find.
    pub async fn get(&self, name: &str) -> Result<VmRecord, VmError> {
        let record = self.load(name).await?;
        let record = if self.needs_reconcile(&record).await {
            let _guard = self.registry.lock(name).await;
            let fresh = self.load(name).await?;
            self.reconcile(fresh, &self.paths(name)).await?
        } else {
            record
        };
        if record.status() == VmStatus::Deleted {
            return Err(VmError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<VmRecord>, VmError> {
        let mut records = Vec::new();
        for name in self.vm_names().await? {
            match self.get(&name).await {
                Ok(record) => records.push(record),
                Err(VmError::NotFound { .. }) => {}
                Err(e) => tracing::warn!(vm = %name, "skipping unreadable VM: {e}"),
            }
        }
        Ok(records)
    }

    /// Register hypervisors started by an earlier invocation that are still
    /// running, so their ports count as taken.
    pub async fn adopt_running(&self) -> Result<Vec<String>, VmError> {
        let mut adopted = Vec::new();
        for name in self.vm_names().await? {
            if self.registry.get(&name).is_some() {
                continue;
            }
            let Ok(record) = self.load(&name).await else {
                continue;
            };
            if !record.status().claims_process() {
                continue;
            }
            if let Some(pid) = record.pid().filter(|pid| pid_alive(*pid)) {
                self.registry.insert(
                    &name,
                    LiveProcess {
                        pid,
                        ssh_port: forwarded_port(&record),
                        console_port: record.console_port,
                        exit: None,
                    },
                );
                tracing::debug!(vm = %name, pid, "adopted running hypervisor");
                adopted.push(name);
            }
        }
        Ok(adopted)
    }

    // ── Guest access ──────────────────────────────────────

    pub async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput, VmError> {
        let record = self.get(name).await?;
        let (target, method) = self.connect(&record).await?;
        tracing::debug!(vm = name, %method, command, "running guest command");
        self.dialer.exec(&target, &method, command).await
    }

    /// Tail the guest's kernel and cloud-init logs until `cancel` fires.
    pub async fn logs(
        &self,
        name: &str,
        out: mpsc::Sender<LogLine>,
        cancel: CancellationToken,
    ) -> Result<Vec<SourceFailure>, VmError> {
        let record = self.get(name).await?;
        let (target, method) = self.connect(&record).await?;
        Ok(stream_logs(self.dialer.clone(), target, method, DEFAULT_SOURCES, out, cancel).await)
    }

    pub async fn attach(&self, name: &str) -> Result<(), VmError> {
        self.get(name).await?;
        if !self.mux.has_session(name).await? {
            return Err(VmError::SessionError {
                message: format!(
                    "VM '{name}' has no terminal session (it is not running, or was launched with launch = \"direct\")"
                ),
            });
        }
        self.mux.attach_session(name).await
    }

    /// Whether the guest accepts an SSH login right now.
    pub async fn is_reachable(&self, record: &VmRecord) -> bool {
        self.connect(record).await.is_ok()
    }

    /// Reachability of every VM that claims a running process, probed
    /// concurrently.
    pub async fn probe_all(&self, records: &[VmRecord]) -> Vec<Option<bool>> {
        join_all(records.iter().map(|record| async move {
            if record.status().claims_process() {
                Some(self.is_reachable(record).await)
            } else {
                None
            }
        }))
        .await
    }

    async fn connect(&self, record: &VmRecord) -> Result<(SshTarget, AuthMethod), VmError> {
        if !record.status().claims_process() {
            return Err(VmError::InvalidState {
                name: record.name.clone(),
                operation: "connect to".into(),
                status: record.status().to_string(),
            });
        }
        let paths = self.paths(&record.name);
        let methods = self.credential_source(record, &paths).resolve().await?;
        let target = self.ssh_target(record);
        let method = probe_any(self.dialer.as_ref(), &target, &methods).await?;
        Ok((target, method))
    }

    /// Re-render the VM's status window, if it has a session.
    pub async fn publish_status(&self, record: &VmRecord, reachable: Option<bool>) {
        match self.mux.has_session(&record.name).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::debug!(vm = %record.name, "cannot query session: {e}");
                return;
            }
        }
        let fields = status_fields(record, reachable);
        if let Err(e) = self.mux.update_status(&record.name, &fields).await {
            tracing::warn!(vm = %record.name, "updating status window failed: {e}");
        }
    }

    // ── Internals ─────────────────────────────────────────

    async fn load(&self, name: &str) -> Result<VmRecord, VmError> {
        let path = self.paths(name).state_file();
        if !path.exists() {
            return Err(VmError::NotFound {
                name: name.to_string(),
            });
        }
        load_state(&path).await
    }

    async fn persist(&self, paths: &VmPaths, record: &VmRecord) -> Result<(), VmError> {
        write_state(&paths.state_file(), record).await
    }

    async fn vm_names(&self) -> Result<Vec<String>, VmError> {
        let dir = vms_dir(&self.data_dir);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VmError::io(format!("reading {}", dir.display()), e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VmError::io(format!("reading {}", dir.display()), e))?
        {
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn process_running(&self, record: &VmRecord) -> bool {
        if let Some(process) = self.registry.get(&record.name) {
            return process.is_running();
        }
        if let Some(pid) = record.pid() {
            return pid_alive(pid);
        }
        record.metadata.get(META_LAUNCH).is_some_and(|l| l == "session")
            && self.mux.has_session(&record.name).await.unwrap_or(false)
    }

    async fn needs_reconcile(&self, record: &VmRecord) -> bool {
        record.status().claims_process() && !self.process_running(record).await
    }

    /// Correct and persist a status whose process has vanished.
    async fn reconcile(&self, mut record: VmRecord, paths: &VmPaths) -> Result<VmRecord, VmError> {
        if !self.needs_reconcile(&record).await {
            return Ok(record);
        }
        let claimed = record.status();
        let corrected = record.reconciled_status();
        self.registry.remove(&record.name);
        record.set_pid(None);
        if corrected == VmStatus::Failed {
            record.fail(format!("hypervisor exited while {claimed}"));
        } else {
            record.set_status(corrected);
        }
        self.persist(paths, &record).await?;
        tracing::warn!(
            vm = %record.name,
            %claimed,
            status = %corrected,
            "hypervisor process is gone; status corrected"
        );
        Ok(record)
    }

    /// The VM's hypervisor, from the registry or, failing that, from the
    /// pid recorded in its state file.
    fn live_process(&self, name: &str, record: &VmRecord) -> Option<LiveProcess> {
        self.registry.get(name).or_else(|| {
            record
                .pid()
                .filter(|pid| pid_alive(*pid))
                .map(|pid| LiveProcess {
                    pid,
                    ssh_port: forwarded_port(record),
                    console_port: record.console_port,
                    exit: None,
                })
        })
    }

    fn ssh_target(&self, record: &VmRecord) -> SshTarget {
        SshTarget::from_info(
            &record.ssh_info,
            Duration::from_secs(self.config.ssh.connect_timeout_s),
        )
    }

    fn credential_source(&self, record: &VmRecord, paths: &VmPaths) -> CredentialSource {
        CredentialSource {
            vm_name: record.name.clone(),
            vm_key: paths.private_key(),
            vm_public_key: paths.public_key(),
            home: dirs::home_dir(),
            ssh: self.config.ssh.clone(),
            stored_password: record.ssh_info.password.clone(),
        }
    }

    async fn close_session_quietly(&self, name: &str) {
        if self.config.launch_strategy() != LaunchStrategy::Session {
            return;
        }
        if let Err(e) = self.mux.close_session(name).await {
            tracing::warn!(vm = name, "closing terminal session failed: {e}");
        }
    }

    /// Everything needed to pick up debugging a failed VM.
    pub fn failure_report(&self, record: &VmRecord, paths: &VmPaths) -> String {
        let lines = self.config.console.tail_lines;
        let tail = tail_lines(&paths.console_log(), lines);
        format!(
            "VM:         {}\nstatus:     {}\nssh:        {}\nlast error: {}\nconsole log {} (last {lines} lines):\n{}",
            record.name,
            record.status(),
            record.ssh_info.describe(),
            record.last_error.as_deref().unwrap_or("-"),
            paths.console_log().display(),
            if tail.is_empty() { "(empty)" } else { tail.as_str() },
        )
    }
}

/// Key/value block shown in the session's status window.
pub fn status_fields(record: &VmRecord, reachable: Option<bool>) -> Vec<(String, String)> {
    let mut fields = vec![
        ("vm".to_string(), record.name.clone()),
        ("status".to_string(), record.status().to_string()),
        ("ssh".to_string(), record.ssh_info.describe()),
    ];
    if let Some(pid) = record.pid() {
        fields.push(("pid".to_string(), pid.to_string()));
    }
    if let Some(reachable) = reachable {
        let text = if reachable { "yes" } else { "no" };
        fields.push(("reachable".to_string(), text.to_string()));
    }
    if let Some(err) = &record.last_error {
        fields.push(("last error".to_string(), err.clone()));
    }
    fields
}

fn forwarded_port(record: &VmRecord) -> Option<u16> {
    match record.config.network.mode() {
        NetworkMode::User if record.ssh_info.port != 0 => Some(record.ssh_info.port),
        _ => None,
    }
}

fn bridged_host(config: &VmConfig) -> String {
    config
        .network
        .static_address
        .as_deref()
        .and_then(|addr| parse_static_address(addr, config.network.subnet_mask.as_deref()).ok())
        .map(|addr| addr.ip.to_string())
        .unwrap_or_else(|| config.hostname().to_string())
}

async fn remove_tree(dir: &Path) -> Result<(), VmError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VmError::io(format!("removing {}", dir.display()), e)),
    }
}
