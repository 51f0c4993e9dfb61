use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vmlab", about = "Local VM lifecycle manager for QEMU")]
pub struct Cli {
    /// Path to host config file (default: ~/.config/vmlab/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress log output on stderr
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Print machine-readable JSON (get, list, image list)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a VM from a base image (does not boot it)
    Create {
        /// VM name (required unless --from provides one)
        name: Option<String>,

        /// Read the VM definition from a TOML file
        #[arg(long)]
        from: Option<PathBuf>,

        /// Base image name or absolute path
        #[arg(long, default_value = "ubuntu-24.04")]
        image: String,

        #[arg(long, default_value_t = 2)]
        cpus: u32,

        /// Memory size, e.g. 2G or 512M
        #[arg(long, default_value = "2G")]
        memory: String,

        /// Grow the disk to this size, e.g. 20G
        #[arg(long)]
        disk: Option<String>,

        /// Network mode: user or bridged
        #[arg(long, default_value = "user")]
        network: String,

        /// Fixed MAC address (generated when omitted)
        #[arg(long)]
        mac: Option<String>,

        /// Static IPv4 address, optionally with /prefix
        #[arg(long)]
        ip: Option<String>,

        /// Dotted subnet mask for --ip
        #[arg(long)]
        netmask: Option<String>,

        /// Guest hostname (defaults to the VM name)
        #[arg(long)]
        hostname: Option<String>,

        /// Extra argument passed to the hypervisor (repeatable)
        #[arg(long = "qemu-arg", allow_hyphen_values = true)]
        qemu_args: Vec<String>,
    },

    /// Boot a VM
    Start {
        name: String,

        /// After a first boot, wait for initialization to finish
        #[arg(long)]
        wait: bool,
    },

    /// Wait for first boot to complete, then power the VM off as ready
    Wait { name: String },

    /// Stop a running VM
    Stop { name: String },

    /// Delete a VM and its files
    Delete {
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Move all stopped VMs to quarantine first
        #[arg(long)]
        quarantine_stopped: bool,
    },

    /// Show one VM
    Get { name: String },

    /// List all VMs
    List,

    /// Run a command in the guest over SSH
    Exec {
        name: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },

    /// Follow kernel and cloud-init logs from the guest
    Logs { name: String },

    /// Attach to the VM's terminal session
    Attach { name: String },

    /// Periodically refresh every VM's status until Ctrl+C
    Monitor {
        /// Seconds between refreshes (default from config)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Move all stopped VMs to the quarantine directory
    Quarantine,

    /// Manage base images
    Image {
        #[command(subcommand)]
        action: ImageCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// List registered images
    List,
    /// Download an image (catalog name, or any name with --url)
    Pull {
        name: String,
        #[arg(long)]
        url: Option<String>,
    },
    /// Register an existing local image file
    Add { name: String, path: PathBuf },
    /// Unregister an image (and delete it if it was downloaded)
    Rm { name: String },
}
