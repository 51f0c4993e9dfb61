use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::VmError;
use crate::util::parse_size;

// ── Host configuration ────────────────────────────────────

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct HostConfig {
    #[facet(default)]
    pub paths: PathsConfig,
    #[facet(default)]
    pub hypervisor: HypervisorConfig,
    #[facet(default)]
    pub ssh: SshConfig,
    #[facet(default)]
    pub console: ConsoleConfig,
    #[facet(default)]
    pub shutdown: ShutdownConfig,
    #[facet(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct PathsConfig {
    /// Root for VM directories, images and logs. Empty means `~/.local/share/vmlab`.
    #[facet(default)]
    pub data_dir: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HypervisorConfig {
    /// Overrides `qemu-system-<arch>`.
    #[facet(default)]
    pub binary: String,
    #[facet(default = "qemu-img")]
    pub qemu_img: String,
    /// Overrides the architecture default (`q35` / `virt`).
    #[facet(default)]
    pub machine: String,
    /// Overrides firmware discovery.
    #[facet(default)]
    pub firmware: String,
    #[facet(default = "auto")]
    pub accel: String,
    #[facet(default = "session")]
    pub launch: String,
    #[facet(default = "br0")]
    pub bridge: String,
    #[facet(default = "qcow2")]
    pub disk_format: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            binary: String::new(),
            qemu_img: "qemu-img".into(),
            machine: String::new(),
            firmware: String::new(),
            accel: "auto".into(),
            launch: "session".into(),
            bridge: "br0".into(),
            disk_format: "qcow2".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SshConfig {
    #[facet(default = "dev")]
    pub username: String,
    #[facet(default = 600)]
    pub ready_timeout_s: u64,
    #[facet(default = 5)]
    pub poll_interval_s: u64,
    #[facet(default = 10)]
    pub connect_timeout_s: u64,
    #[facet(default = true)]
    pub allow_password: bool,
    /// `key` embeds an SSH public key in user-data, `password` a one-time password.
    #[facet(default = "key")]
    pub auth: String,
    /// Agent keys whose comment or fingerprint matches one of these are offered.
    #[facet(default)]
    pub agent_labels: Vec<String>,
    /// Conventional private key locations, relative to the home directory.
    pub key_paths: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: "dev".into(),
            ready_timeout_s: 600,
            poll_interval_s: 5,
            connect_timeout_s: 10,
            allow_password: true,
            auth: "key".into(),
            agent_labels: Vec::new(),
            key_paths: vec![
                ".ssh/id_ed25519".into(),
                ".ssh/id_ecdsa".into(),
                ".ssh/id_rsa".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ConsoleConfig {
    pub login_patterns: Vec<String>,
    #[facet(default = 500)]
    pub scan_interval_ms: u64,
    #[facet(default = 40)]
    pub tail_lines: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            login_patterns: vec!["login:".into()],
            scan_interval_ms: 500,
            tail_lines: 40,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ShutdownConfig {
    #[facet(default = 60)]
    pub graceful_timeout_s: u64,
    #[facet(default = 10)]
    pub term_timeout_s: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_s: 60,
            term_timeout_s: 10,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct MonitorConfig {
    #[facet(default = 5)]
    pub interval_s: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_s: 5 }
    }
}

/// How the hypervisor process is owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Spawned as a direct child; stdout/stderr go to `hypervisor.log`.
    Direct,
    /// Spawned inside the VM's multiplexer console window.
    Session,
}

/// Which authentication path cloud-init embeds in user-data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Key,
    Password,
}

impl HostConfig {
    pub fn data_dir(&self) -> PathBuf {
        if self.paths.data_dir.is_empty() {
            crate::paths::default_data_dir()
        } else {
            PathBuf::from(&self.paths.data_dir)
        }
    }

    pub fn launch_strategy(&self) -> LaunchStrategy {
        match self.hypervisor.launch.as_str() {
            "direct" => LaunchStrategy::Direct,
            _ => LaunchStrategy::Session,
        }
    }

    pub fn auth_mode(&self) -> AuthMode {
        match self.ssh.auth.as_str() {
            "password" => AuthMode::Password,
            _ => AuthMode::Key,
        }
    }
}

fn validate_host_config(config: &HostConfig) -> Result<(), VmError> {
    if !matches!(config.hypervisor.launch.as_str(), "direct" | "session") {
        return Err(VmError::Validation {
            message: format!(
                "hypervisor.launch must be 'direct' or 'session' (got '{}')",
                config.hypervisor.launch
            ),
        });
    }
    if !matches!(config.hypervisor.accel.as_str(), "auto" | "kvm" | "hvf" | "tcg") {
        return Err(VmError::Validation {
            message: format!(
                "hypervisor.accel must be one of auto, kvm, hvf, tcg (got '{}')",
                config.hypervisor.accel
            ),
        });
    }
    if !matches!(config.ssh.auth.as_str(), "key" | "password") {
        return Err(VmError::Validation {
            message: format!("ssh.auth must be 'key' or 'password' (got '{}')", config.ssh.auth),
        });
    }
    if config.ssh.auth == "password" && !config.ssh.allow_password {
        return Err(VmError::Validation {
            message: "ssh.auth = 'password' requires ssh.allow_password = true".into(),
        });
    }
    if config.ssh.username.is_empty() {
        return Err(VmError::Validation {
            message: "ssh.username must not be empty".into(),
        });
    }
    if config.ssh.poll_interval_s < 1 || config.ssh.ready_timeout_s < 1 {
        return Err(VmError::Validation {
            message: "ssh.poll_interval_s and ssh.ready_timeout_s must be at least 1".into(),
        });
    }
    if config.console.login_patterns.iter().all(|p| p.is_empty()) {
        return Err(VmError::Validation {
            message: "console.login_patterns must contain at least one pattern".into(),
        });
    }
    if config.monitor.interval_s < 1 {
        return Err(VmError::Validation {
            message: "monitor.interval_s must be at least 1".into(),
        });
    }
    Ok(())
}

/// Load the host config.
///
/// An explicit path must exist; the default location is optional and falls
/// back to built-in defaults when absent.
pub fn load_host_config(path: Option<&Path>) -> Result<HostConfig, VmError> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (crate::paths::default_config_path(), false),
    };

    if !explicit && !path.exists() {
        return Ok(HostConfig::default());
    }

    let contents = std::fs::read_to_string(&path).map_err(|source| VmError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    let config = parse_host_config(&contents).map_err(|e| match e {
        VmError::ConfigParse { message, .. } => VmError::ConfigParse {
            path: path.display().to_string(),
            message,
        },
        other => other,
    })?;
    Ok(config)
}

pub fn parse_host_config(contents: &str) -> Result<HostConfig, VmError> {
    let config: HostConfig = facet_toml::from_str(contents).map_err(|e| VmError::ConfigParse {
        path: "<inline>".into(),
        message: e.to_string(),
    })?;
    validate_host_config(&config)?;
    Ok(config)
}

// ── Per-VM configuration ──────────────────────────────────

/// Caller-supplied VM definition. Immutable once the VM is created.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct VmConfig {
    pub name: String,
    pub cpus: u32,
    pub memory: String,
    #[facet(default)]
    pub disk_size: String,
    pub base_image: String,
    #[facet(default)]
    pub network: NetworkConfig,
    #[facet(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Facet)]
#[facet(default)]
pub struct NetworkConfig {
    /// `user` (slirp with an SSH host forward) or `bridged`.
    #[facet(default = "user")]
    pub mode: String,
    /// Generated once at creation when empty.
    #[facet(default)]
    pub mac_address: String,
    /// `192.168.50.10/24` style address; DHCP when absent.
    #[facet(default)]
    pub static_address: Option<String>,
    #[facet(default)]
    pub subnet_mask: Option<String>,
    /// Falls back to the VM name when empty.
    #[facet(default)]
    pub hostname: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: "user".into(),
            mac_address: String::new(),
            static_address: None,
            subnet_mask: None,
            hostname: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    User,
    Bridged,
}

impl NetworkConfig {
    pub fn mode(&self) -> NetworkMode {
        match self.mode.as_str() {
            "bridged" => NetworkMode::Bridged,
            _ => NetworkMode::User,
        }
    }
}

impl VmConfig {
    pub fn new(name: &str, base_image: &str) -> Self {
        Self {
            name: name.into(),
            cpus: 2,
            memory: "2G".into(),
            disk_size: String::new(),
            base_image: base_image.into(),
            network: NetworkConfig::default(),
            extra_args: Vec::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        if self.network.hostname.is_empty() {
            &self.name
        } else {
            &self.network.hostname
        }
    }

    /// Memory in MiB, as passed to `-m`.
    pub fn memory_mib(&self) -> Result<u64, VmError> {
        Ok(parse_size(&self.memory)? / (1024 * 1024))
    }

    pub fn validate(&self) -> Result<(), VmError> {
        validate_name(&self.name)?;
        if self.cpus < 1 {
            return Err(VmError::Validation {
                message: "cpus must be at least 1".into(),
            });
        }
        if self.memory_mib()? < 256 {
            return Err(VmError::Validation {
                message: format!("memory must be at least 256M (got '{}')", self.memory),
            });
        }
        if !self.disk_size.is_empty() {
            parse_size(&self.disk_size)?;
        }
        if self.base_image.is_empty() {
            return Err(VmError::Validation {
                message: "base_image must not be empty".into(),
            });
        }
        if !matches!(self.network.mode.as_str(), "user" | "bridged") {
            return Err(VmError::Validation {
                message: format!(
                    "network.mode must be 'user' or 'bridged' (got '{}')",
                    self.network.mode
                ),
            });
        }
        if !self.network.mac_address.is_empty() && !is_valid_mac(&self.network.mac_address) {
            return Err(VmError::Validation {
                message: format!("invalid MAC address '{}'", self.network.mac_address),
            });
        }
        if let Some(addr) = &self.network.static_address {
            crate::cloudinit::parse_static_address(addr, self.network.subnet_mask.as_deref())?;
        }
        Ok(())
    }
}

/// Parse a VM definition from TOML (the `--from` file of `vmlab create`).
pub fn parse_vm_config(contents: &str, path: &Path) -> Result<VmConfig, VmError> {
    let config: VmConfig = facet_toml::from_str(contents).map_err(|e| VmError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

pub fn validate_name(name: &str) -> Result<(), VmError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(VmError::Validation {
            message: format!("VM name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}
