use std::path::{Path, PathBuf};

/// Default data root: `~/.local/share/vmlab/`
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmlab")
}

/// Default host config: `~/.config/vmlab/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vmlab")
        .join("config.toml")
}

/// Directory holding one subdirectory per VM.
pub fn vms_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("vms")
}

/// Base image cache and its index.
pub fn images_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("images")
}

/// Application log directory (`vmlab.log`).
pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Where the quarantine sweep moves stopped VMs.
pub fn quarantine_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("quarantine")
}

/// File layout of a single VM directory.
#[derive(Debug, Clone)]
pub struct VmPaths {
    pub dir: PathBuf,
    disk_ext: String,
}

impl VmPaths {
    pub fn new(data_dir: &Path, name: &str, disk_format: &str) -> Self {
        Self {
            dir: vms_dir(data_dir).join(name),
            disk_ext: disk_format.to_string(),
        }
    }

    /// Copy-on-write clone of the base image.
    pub fn disk(&self) -> PathBuf {
        self.dir.join(format!("disk.{}", self.disk_ext))
    }

    pub fn disk_format(&self) -> &str {
        &self.disk_ext
    }

    /// Cloud-init NoCloud seed.
    pub fn cidata_iso(&self) -> PathBuf {
        self.dir.join("cidata.iso")
    }

    /// Serial console capture.
    pub fn console_log(&self) -> PathBuf {
        self.dir.join("qemu.log")
    }

    /// stdout/stderr of a directly-owned hypervisor process.
    pub fn hypervisor_log(&self) -> PathBuf {
        self.dir.join("hypervisor.log")
    }

    pub fn pidfile(&self) -> PathBuf {
        self.dir.join("qemu.pid")
    }

    pub fn meta_data(&self) -> PathBuf {
        self.dir.join("meta-data")
    }

    pub fn user_data(&self) -> PathBuf {
        self.dir.join("user-data")
    }

    pub fn network_config(&self) -> PathBuf {
        self.dir.join("network-config")
    }

    pub fn state_file(&self) -> PathBuf {
        self.dir.join("vm-state.json")
    }

    /// VM-local private key; `.pub` alongside.
    pub fn private_key(&self) -> PathBuf {
        self.dir.join("id_ed25519")
    }

    pub fn public_key(&self) -> PathBuf {
        self.dir.join("id_ed25519.pub")
    }
}
