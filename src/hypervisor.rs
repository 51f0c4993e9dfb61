//! QEMU invocation and process supervision.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{HypervisorConfig, LaunchStrategy, NetworkMode, ShutdownConfig, VmConfig};
use crate::error::VmError;
use crate::mux::Multiplexer;
use crate::paths::VmPaths;
use crate::registry::{ExitWatch, LiveProcess};
use crate::retry::{Attempt, RetryPolicy};
use crate::util::{shell_quote, tail_lines};

/// How long a freshly spawned hypervisor must survive before the launch
/// counts as successful.
const LAUNCH_GRACE: Duration = Duration::from_millis(500);
const PIDFILE_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// UEFI firmware locations, checked in order, for guests that need one.
const AARCH64_FIRMWARE: &[&str] = &[
    "/usr/share/AAVMF/AAVMF_CODE.fd",
    "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
    "/usr/share/edk2/aarch64/QEMU_EFI.fd",
    "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
    "/usr/local/share/qemu/edk2-aarch64-code.fd",
];

// ── Host detection ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub arch: String,
    pub kvm: bool,
    pub hvf: bool,
}

pub fn detect_host() -> HostInfo {
    HostInfo {
        arch: std::env::consts::ARCH.to_string(),
        kvm: cfg!(target_os = "linux") && Path::new("/dev/kvm").exists(),
        hvf: cfg!(target_os = "macos"),
    }
}

impl HostInfo {
    /// Accelerator to use for `requested` (`auto`, `kvm`, `hvf`, `tcg`).
    pub fn accelerator(&self, requested: &str) -> &'static str {
        match requested {
            "kvm" => "kvm",
            "hvf" => "hvf",
            "tcg" => "tcg",
            _ if self.kvm => "kvm",
            _ if self.hvf => "hvf",
            _ => "tcg",
        }
    }
}

fn find_firmware(candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

// ── Invocation ────────────────────────────────────────────

/// A concrete hypervisor command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Single shell line, for running inside a multiplexer window.
    pub fn shell_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Per-launch inputs besides the VM definition.
pub struct LaunchPlan<'a> {
    pub config: &'a VmConfig,
    pub paths: &'a VmPaths,
    /// Attach the cloud-init seed.
    pub first_boot: bool,
    /// Host side of the SSH forward (user-mode networking only).
    pub ssh_port: Option<u16>,
    pub qmp_port: u16,
    pub strategy: LaunchStrategy,
}

pub fn build_invocation(
    host: &HostInfo,
    hv: &HypervisorConfig,
    plan: &LaunchPlan<'_>,
) -> Result<Invocation, VmError> {
    let config = plan.config;
    let paths = plan.paths;
    let launch_err = |message: String| VmError::HypervisorLaunchFailed {
        name: config.name.clone(),
        message,
    };

    let program = if hv.binary.is_empty() {
        format!("qemu-system-{}", host.arch)
    } else {
        hv.binary.clone()
    };
    let accel = host.accelerator(&hv.accel);
    let machine = match (hv.machine.as_str(), host.arch.as_str()) {
        ("", "aarch64") => "virt",
        ("", _) => "q35",
        (m, _) => m,
    };
    let cpu = if accel == "tcg" { "max" } else { "host" };

    let firmware = if !hv.firmware.is_empty() {
        Some(PathBuf::from(&hv.firmware))
    } else if host.arch == "aarch64" {
        Some(find_firmware(AARCH64_FIRMWARE).ok_or_else(|| {
            launch_err(format!(
                "no UEFI firmware found (looked in {}); set hypervisor.firmware",
                AARCH64_FIRMWARE.join(", ")
            ))
        })?)
    } else {
        None
    };

    let mut args: Vec<String> = Vec::new();
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    push("-name", config.name.clone());
    push("-machine", format!("{machine},accel={accel}"));
    push("-cpu", cpu.to_string());
    push("-smp", config.cpus.to_string());
    push("-m", format!("{}M", config.memory_mib()?));
    if let Some(fw) = firmware {
        push("-bios", fw.display().to_string());
    }

    push(
        "-drive",
        format!(
            "file={},if=virtio,format={}",
            paths.disk().display(),
            paths.disk_format()
        ),
    );
    if plan.first_boot {
        push(
            "-drive",
            format!(
                "file={},if=virtio,format=raw,readonly=on",
                paths.cidata_iso().display()
            ),
        );
    }

    let netdev = match config.network.mode() {
        NetworkMode::User => {
            let port = plan
                .ssh_port
                .ok_or_else(|| launch_err("user networking needs an SSH forward port".into()))?;
            format!("user,id=net0,hostfwd=tcp:127.0.0.1:{port}-:22")
        }
        NetworkMode::Bridged => format!("bridge,id=net0,br={}", hv.bridge),
    };
    push("-netdev", netdev);
    push(
        "-device",
        format!("virtio-net-pci,netdev=net0,mac={}", config.network.mac_address),
    );

    // Session launches keep an interactive console in the window; direct
    // launches have no terminal to attach to.
    let chardev = match plan.strategy {
        LaunchStrategy::Session => format!(
            "stdio,id=console0,signal=off,logfile={},logappend=on",
            paths.console_log().display()
        ),
        LaunchStrategy::Direct => format!(
            "file,id=console0,path={},append=on",
            paths.console_log().display()
        ),
    };
    push("-chardev", chardev);
    push("-serial", "chardev:console0".into());
    push(
        "-qmp",
        format!("tcp:127.0.0.1:{},server=on,wait=off", plan.qmp_port),
    );
    push("-pidfile", paths.pidfile().display().to_string());
    push("-display", "none".into());

    args.extend(config.extra_args.iter().cloned());

    Ok(Invocation { program, args })
}

// ── Launch ────────────────────────────────────────────────

pub struct Launched {
    pub pid: u32,
    pub exit: Option<ExitWatch>,
}

fn launch_failure(name: &str, paths: &VmPaths, what: String) -> VmError {
    let mut message = what;
    for log in [paths.hypervisor_log(), paths.console_log()] {
        let tail = tail_lines(&log, 20);
        if !tail.is_empty() {
            message.push_str(&format!("\n--- {} ---\n{tail}", log.display()));
        }
    }
    VmError::HypervisorLaunchFailed {
        name: name.to_string(),
        message,
    }
}

/// Spawn as a direct child, stdout/stderr appended to `hypervisor.log`.
pub async fn launch_direct(
    name: &str,
    invocation: &Invocation,
    paths: &VmPaths,
) -> Result<Launched, VmError> {
    let _ = tokio::fs::remove_file(paths.pidfile()).await;

    let log_path = paths.hypervisor_log();
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| launch_failure(name, paths, format!("opening {}: {e}", log_path.display())))?;
    let log_err = log
        .try_clone()
        .map_err(|e| launch_failure(name, paths, format!("duplicating log handle: {e}")))?;

    let mut child = tokio::process::Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .map_err(|e| launch_failure(name, paths, format!("spawning {}: {e}", invocation.program)))?;

    let pid = child
        .id()
        .ok_or_else(|| launch_failure(name, paths, "process exited during spawn".into()))?;

    let (tx, mut rx) = watch::channel(None);
    let vm = name.to_string();
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                tracing::warn!(vm, "waiting on hypervisor failed: {e}");
                -1
            }
        };
        tracing::info!(vm, pid, code, "hypervisor exited");
        let _ = tx.send(Some(code));
    });

    if let Ok(Ok(())) = tokio::time::timeout(LAUNCH_GRACE, rx.changed()).await {
        let code = (*rx.borrow()).unwrap_or(-1);
        return Err(launch_failure(
            name,
            paths,
            format!("{} exited immediately with status {code}", invocation.program),
        ));
    }

    tracing::info!(vm = name, pid, "hypervisor started");
    Ok(Launched {
        pid,
        exit: Some(rx),
    })
}

/// Spawn inside the VM's multiplexer console window; the pid comes from
/// QEMU's pidfile.
pub async fn launch_in_session(
    name: &str,
    invocation: &Invocation,
    paths: &VmPaths,
    mux: &dyn Multiplexer,
) -> Result<Launched, VmError> {
    let pidfile = paths.pidfile();
    let _ = tokio::fs::remove_file(&pidfile).await;

    mux.create_session(name).await?;
    mux.run_console_command(name, &invocation.shell_line())
        .await?;

    let pid = RetryPolicy::new(Duration::from_millis(100), PIDFILE_TIMEOUT)
        .run(&CancellationToken::new(), |_| {
            let pidfile = pidfile.clone();
            async move {
                match tokio::fs::read_to_string(&pidfile).await {
                    Ok(text) => match text.trim().parse::<u32>() {
                        Ok(pid) => Attempt::Done(pid),
                        Err(_) => Attempt::Retry("pidfile not written yet".into()),
                    },
                    Err(e) => Attempt::Retry(e.to_string()),
                }
            }
        })
        .await
        .map_err(|e| {
            launch_failure(
                name,
                paths,
                format!("no pidfile at {} ({e})", pidfile.display()),
            )
        })?;

    tracing::info!(vm = name, pid, "hypervisor started in session");
    Ok(Launched { pid, exit: None })
}

// ── Signals and shutdown ──────────────────────────────────

/// Whether `pid` names a process we could signal.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Deliver `signal`; `Ok(false)` when the process is already gone.
fn send_signal(pid: u32, signal: libc::c_int) -> Result<bool, VmError> {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Ok(false);
    };
    // SAFETY: plain kill(2) on a pid we recorded for this VM.
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(VmError::io(format!("sending signal {signal} to pid {pid}"), err))
}

/// Wait until the process exits or `timeout` elapses. True if it exited.
pub async fn wait_exit(process: &LiveProcess, timeout: Duration) -> bool {
    if let Some(exit) = &process.exit {
        let mut exit = exit.clone();
        let waited = tokio::time::timeout(timeout, exit.wait_for(|code| code.is_some())).await;
        return match waited {
            Ok(Ok(_)) => true,
            // Sender dropped without a status: the reaper is gone.
            Ok(Err(_)) => !pid_alive(process.pid),
            Err(_) => false,
        };
    }

    let pid = process.pid;
    RetryPolicy::new(Duration::from_millis(100), timeout)
        .run(&CancellationToken::new(), |_| async move {
            if pid_alive(pid) {
                Attempt::Retry("still running".into())
            } else {
                Attempt::Done(())
            }
        })
        .await
        .is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyGone,
    PoweredOff,
    Terminated,
    Killed,
}

/// Stop a hypervisor: ACPI power-down over QMP when `graceful`, then
/// SIGTERM, then SIGKILL. A process that is already gone is success.
pub async fn terminate(
    name: &str,
    process: &LiveProcess,
    graceful: bool,
    shutdown: &ShutdownConfig,
) -> Result<StopOutcome, VmError> {
    if !process.is_running() {
        return Ok(StopOutcome::AlreadyGone);
    }

    if graceful {
        match process.console_port {
            Some(port) => {
                match crate::qmp::system_powerdown(port, Duration::from_secs(5)).await {
                    Ok(()) => {
                        let timeout = Duration::from_secs(shutdown.graceful_timeout_s);
                        if wait_exit(process, timeout).await {
                            tracing::info!(vm = name, pid = process.pid, "guest powered off");
                            return Ok(StopOutcome::PoweredOff);
                        }
                        tracing::warn!(vm = name, "guest ignored power-down request");
                    }
                    Err(e) => tracing::warn!(vm = name, "graceful shutdown failed: {e}"),
                }
            }
            None => tracing::warn!(vm = name, "no QMP port recorded, skipping power-down"),
        }

        if !send_signal(process.pid, libc::SIGTERM)? {
            return Ok(StopOutcome::AlreadyGone);
        }
        if wait_exit(process, Duration::from_secs(shutdown.term_timeout_s)).await {
            return Ok(StopOutcome::Terminated);
        }
        tracing::warn!(vm = name, pid = process.pid, "hypervisor ignored SIGTERM, killing");
    }

    kill(name, process).await
}

/// SIGKILL and wait for the process to disappear.
pub async fn kill(name: &str, process: &LiveProcess) -> Result<StopOutcome, VmError> {
    if !send_signal(process.pid, libc::SIGKILL)? {
        return Ok(StopOutcome::AlreadyGone);
    }
    if !wait_exit(process, KILL_TIMEOUT).await {
        return Err(VmError::io(
            format!("killing hypervisor for VM '{name}'"),
            std::io::Error::other(format!("pid {} survived SIGKILL", process.pid)),
        ));
    }
    tracing::warn!(vm = name, pid = process.pid, "hypervisor killed");
    Ok(StopOutcome::Killed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;

    fn x86_kvm() -> HostInfo {
        HostInfo {
            arch: "x86_64".into(),
            kvm: true,
            hvf: false,
        }
    }

    fn config() -> VmConfig {
        let mut c = VmConfig::new("t1", "ubuntu-22.04");
        c.network.mac_address = "52:54:00:12:34:56".into();
        c
    }

    fn args_after<'a>(inv: &'a Invocation, flag: &str) -> Vec<&'a str> {
        inv.args
            .windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn first_boot_invocation_on_kvm_host() {
        let config = config();
        let paths = VmPaths::new(Path::new("/data"), "t1", "qcow2");
        let plan = LaunchPlan {
            config: &config,
            paths: &paths,
            first_boot: true,
            ssh_port: Some(40022),
            qmp_port: 40023,
            strategy: LaunchStrategy::Direct,
        };
        let inv = build_invocation(&x86_kvm(), &HypervisorConfig::default(), &plan).unwrap();

        assert_eq!(inv.program, "qemu-system-x86_64");
        assert_eq!(args_after(&inv, "-machine"), ["q35,accel=kvm"]);
        assert_eq!(args_after(&inv, "-cpu"), ["host"]);
        assert_eq!(args_after(&inv, "-smp"), ["2"]);
        assert_eq!(args_after(&inv, "-m"), ["2048M"]);
        assert_eq!(
            args_after(&inv, "-drive"),
            [
                "file=/data/vms/t1/disk.qcow2,if=virtio,format=qcow2",
                "file=/data/vms/t1/cidata.iso,if=virtio,format=raw,readonly=on",
            ]
        );
        assert_eq!(
            args_after(&inv, "-netdev"),
            ["user,id=net0,hostfwd=tcp:127.0.0.1:40022-:22"]
        );
        assert_eq!(
            args_after(&inv, "-device"),
            ["virtio-net-pci,netdev=net0,mac=52:54:00:12:34:56"]
        );
        assert_eq!(
            args_after(&inv, "-qmp"),
            ["tcp:127.0.0.1:40023,server=on,wait=off"]
        );
        assert_eq!(args_after(&inv, "-pidfile"), ["/data/vms/t1/qemu.pid"]);
        assert!(args_after(&inv, "-chardev")[0].starts_with("file,id=console0,path=/data/vms/t1/qemu.log"));
        assert!(args_after(&inv, "-bios").is_empty());
    }

    #[test]
    fn restart_omits_seed_and_tcg_uses_max_cpu() {
        let mut config = config();
        config.extra_args = vec!["-device".into(), "virtio-rng-pci".into()];
        let paths = VmPaths::new(Path::new("/data"), "t1", "qcow2");
        let plan = LaunchPlan {
            config: &config,
            paths: &paths,
            first_boot: false,
            ssh_port: Some(40022),
            qmp_port: 40023,
            strategy: LaunchStrategy::Session,
        };
        let host = HostInfo {
            arch: "x86_64".into(),
            kvm: false,
            hvf: false,
        };
        let inv = build_invocation(&host, &HypervisorConfig::default(), &plan).unwrap();
        assert_eq!(args_after(&inv, "-machine"), ["q35,accel=tcg"]);
        assert_eq!(args_after(&inv, "-cpu"), ["max"]);
        assert_eq!(args_after(&inv, "-drive").len(), 1);
        assert!(args_after(&inv, "-chardev")[0].starts_with("stdio,"));
        assert_eq!(&inv.args[inv.args.len() - 2..], ["-device", "virtio-rng-pci"]);
    }

    #[test]
    fn bridged_network_and_firmware_override() {
        let mut config = config();
        config.network.mode = "bridged".into();
        let paths = VmPaths::new(Path::new("/data"), "t1", "qcow2");
        let plan = LaunchPlan {
            config: &config,
            paths: &paths,
            first_boot: false,
            ssh_port: None,
            qmp_port: 40023,
            strategy: LaunchStrategy::Direct,
        };
        let hv = HypervisorConfig {
            firmware: "/opt/fw/QEMU_EFI.fd".into(),
            bridge: "virbr1".into(),
            ..HypervisorConfig::default()
        };
        let host = HostInfo {
            arch: "aarch64".into(),
            kvm: true,
            hvf: false,
        };
        let inv = build_invocation(&host, &hv, &plan).unwrap();
        assert_eq!(inv.program, "qemu-system-aarch64");
        assert_eq!(args_after(&inv, "-machine"), ["virt,accel=kvm"]);
        assert_eq!(args_after(&inv, "-bios"), ["/opt/fw/QEMU_EFI.fd"]);
        assert_eq!(args_after(&inv, "-netdev"), ["bridge,id=net0,br=virbr1"]);
    }

    #[test]
    fn user_network_requires_port() {
        let config = config();
        let paths = VmPaths::new(Path::new("/data"), "t1", "qcow2");
        let plan = LaunchPlan {
            config: &config,
            paths: &paths,
            first_boot: true,
            ssh_port: None,
            qmp_port: 40023,
            strategy: LaunchStrategy::Direct,
        };
        let err = build_invocation(&x86_kvm(), &HypervisorConfig::default(), &plan).unwrap_err();
        assert!(matches!(err, VmError::HypervisorLaunchFailed { .. }));
    }

    #[test]
    fn shell_line_quotes_arguments() {
        let inv = Invocation {
            program: "qemu-system-x86_64".into(),
            args: vec!["-name".into(), "my vm".into()],
        };
        assert_eq!(inv.shell_line(), "qemu-system-x86_64 -name 'my vm'");
    }

    #[test]
    fn accelerator_selection() {
        let host = x86_kvm();
        assert_eq!(host.accelerator("auto"), "kvm");
        assert_eq!(host.accelerator("tcg"), "tcg");
        let mac = HostInfo {
            arch: "aarch64".into(),
            kvm: false,
            hvf: true,
        };
        assert_eq!(mac.accelerator("auto"), "hvf");
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    fn sh(script: &str) -> Invocation {
        Invocation {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[tokio::test]
    async fn immediate_exit_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::new(dir.path(), "t1", "qcow2");
        std::fs::create_dir_all(&paths.dir).unwrap();
        let err = launch_direct("t1", &sh("echo 'could not open disk' >&2; exit 3"), &paths)
            .await
            .err()
            .unwrap();
        match err {
            VmError::HypervisorLaunchFailed { name, message } => {
                assert_eq!(name, "t1");
                assert!(message.contains("status 3"));
                assert!(message.contains("could not open disk"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn direct_launch_then_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::new(dir.path(), "t1", "qcow2");
        std::fs::create_dir_all(&paths.dir).unwrap();
        let launched = launch_direct("t1", &sh("exec sleep 30"), &paths)
            .await
            .unwrap();
        let process = LiveProcess {
            pid: launched.pid,
            ssh_port: None,
            console_port: None,
            exit: launched.exit,
        };
        assert!(process.is_running());

        let shutdown = ShutdownConfig {
            graceful_timeout_s: 1,
            term_timeout_s: 2,
        };
        let outcome = terminate("t1", &process, true, &shutdown).await.unwrap();
        assert_eq!(outcome, StopOutcome::Terminated);
        assert!(!process.is_running());

        // Stopping again is not an error.
        let again = terminate("t1", &process, true, &shutdown).await.unwrap();
        assert_eq!(again, StopOutcome::AlreadyGone);
    }
}
