use std::io::IsTerminal;

use clap::Parser;
use console::{StyledObject, Term, style};
use inquire::Confirm;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vmlab::cli::{Cli, Command, ImageCommand};
use vmlab::config::{self, VmConfig};
use vmlab::console::LogLine;
use vmlab::error::VmError;
use vmlab::image::format_size;
use vmlab::logging;
use vmlab::manager::Manager;
use vmlab::monitor::{self, VmSnapshot};
use vmlab::vm_state::{VmRecord, VmStatus};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let terminal_filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("off")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmlab=info"))
    };
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always vmlab=debug, discarded until the data dir is known.
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("vmlab=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let host_config = config::load_host_config(cli.config.as_deref())?;
    let data_dir = host_config.data_dir();
    let log_path = vmlab::paths::logs_dir(&data_dir).join("vmlab.log");
    if let Err(e) = file_handle.set_file(&log_path) {
        tracing::debug!("file logging disabled ({}): {e}", log_path.display());
    }

    let manager = Manager::new(host_config);

    // Image commands never touch VMs; everything else needs to know which
    // hypervisors an earlier invocation left running.
    if !matches!(cli.command, Command::Image { .. }) {
        manager.adopt_running().await?;
    }

    match cli.command {
        Command::Image { action } => run_image(&manager, action, cli.json).await?,
        Command::Create {
            name,
            from,
            image,
            cpus,
            memory,
            disk,
            network,
            mac,
            ip,
            netmask,
            hostname,
            qemu_args,
        } => {
            let mut vm = match from {
                Some(path) => {
                    let contents = std::fs::read_to_string(&path).map_err(|source| {
                        VmError::ConfigLoad {
                            path: path.display().to_string(),
                            source,
                        }
                    })?;
                    let mut vm = config::parse_vm_config(&contents, &path)?;
                    if let Some(name) = name {
                        vm.name = name;
                    }
                    vm
                }
                None => {
                    let Some(name) = name else {
                        return Err(VmError::Validation {
                            message: "a VM name is required (or pass --from <file>)".into(),
                        }
                        .into());
                    };
                    let mut vm = VmConfig::new(&name, &image);
                    vm.cpus = cpus;
                    vm.memory = memory;
                    vm.disk_size = disk.unwrap_or_default();
                    vm.network.mode = network;
                    vm.network.mac_address = mac.unwrap_or_default();
                    vm.network.static_address = ip;
                    vm.network.subnet_mask = netmask;
                    vm.network.hostname = hostname.unwrap_or_default();
                    vm.extra_args = qemu_args;
                    vm
                }
            };
            vm.validate()?;
            let record = manager.create(vm).await?;
            println!(
                "VM '{}' {} from {}",
                record.name,
                status_label(record.status()),
                record.config.base_image
            );
        }
        Command::Start { name, wait } => {
            let record = manager.start(&name).await?;
            println!("VM '{name}' {}", status_label(record.status()));
            println!("  ssh: {}", record.ssh_info.describe());
            if wait && record.status() == VmStatus::Initializing {
                wait_for_init(&manager, &name).await?;
            }
        }
        Command::Wait { name } => wait_for_init(&manager, &name).await?,
        Command::Stop { name } => {
            let record = manager.stop(&name).await?;
            println!("VM '{name}' {}", status_label(record.status()));
        }
        Command::Delete {
            name,
            yes,
            quarantine_stopped,
        } => {
            if quarantine_stopped {
                print_quarantined(&manager.quarantine_stopped().await?);
            }
            // The sweep may have just moved this VM away.
            if quarantine_stopped && !manager.paths(&name).dir.exists() {
                return Ok(());
            }
            if !yes && !confirm(&format!("Delete VM '{name}' and all of its files?"))? {
                println!("Cancelled.");
                return Ok(());
            }
            manager.delete(&name).await?;
            println!("VM '{name}' deleted.");
        }
        Command::Get { name } => {
            let record = manager.get(&name).await?;
            if cli.json {
                println!("{}", to_json(&record)?);
            } else {
                print_record(&record);
            }
        }
        Command::List => {
            let records = manager.list().await?;
            if cli.json {
                println!("{}", to_json(&records)?);
            } else {
                print_table(&records);
            }
        }
        Command::Exec { name, args } => {
            let output = manager.exec(&name, &args.join(" ")).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            let code = output.exit_code.map(|c| c as i32).unwrap_or(255);
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::Logs { name } => {
            let cancel = cancel_on_ctrl_c();
            let (tx, mut rx) = mpsc::channel::<LogLine>(256);
            let printer = tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    println!("{} {}", style(format!("[{}]", line.source)).dim(), line.line);
                }
            });
            let failures = manager.logs(&name, tx, cancel).await?;
            let _ = printer.await;
            for failure in failures {
                eprintln!(
                    "{} {}: {}",
                    style("error").red(),
                    failure.source,
                    failure.error
                );
            }
        }
        Command::Attach { name } => manager.attach(&name).await?,
        Command::Monitor { interval } => {
            let seconds = interval.unwrap_or(manager.config().monitor.interval_s).max(1);
            let cancel = cancel_on_ctrl_c();
            let term = Term::stdout();
            monitor::run(
                &manager,
                std::time::Duration::from_secs(seconds),
                &cancel,
                |snapshots| print_snapshots(&term, snapshots),
            )
            .await;
        }
        Command::Quarantine => print_quarantined(&manager.quarantine_stopped().await?),
    }

    Ok(())
}

async fn run_image(manager: &Manager, action: ImageCommand, json: bool) -> miette::Result<()> {
    let store = manager.images();
    match action {
        ImageCommand::List => {
            let images = store.list().await?;
            if json {
                println!("{}", to_json(&images)?);
            } else if images.is_empty() {
                println!("No images. Try `vmlab image pull ubuntu-24.04`.");
            } else {
                for image in &images {
                    let size = std::fs::metadata(image.path())
                        .map(|m| format_size(m.len()))
                        .unwrap_or_else(|_| "missing".into());
                    println!("  {:<16} {:>10}  {}", image.name, size, image.local_path);
                }
            }
        }
        ImageCommand::Pull { name, url } => {
            let image = store.pull(&name, url.as_deref()).await?;
            println!("Image '{}' at {}", image.name, image.local_path);
        }
        ImageCommand::Add { name, path } => {
            let image = store.add(&name, &path).await?;
            println!("Registered '{}' -> {}", image.name, image.local_path);
        }
        ImageCommand::Rm { name } => {
            store.remove(&name).await?;
            println!("Removed image '{name}'.");
        }
    }
    Ok(())
}

async fn wait_for_init(manager: &Manager, name: &str) -> miette::Result<()> {
    let cancel = cancel_on_ctrl_c();
    let record = manager.wait_for_initialization(name, &cancel).await?;
    println!("VM '{name}' {}", status_label(record.status()));
    Ok(())
}

/// Token canceled on the first Ctrl+C. Long operations observe it and
/// clean up instead of being dropped mid-flight.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });
    token
}

fn confirm(question: &str) -> Result<bool, VmError> {
    if !std::io::stdin().is_terminal() {
        return Err(VmError::Validation {
            message: "refusing to delete without --yes when stdin is not a terminal".into(),
        });
    }
    match Confirm::new(question).with_default(false).prompt() {
        Ok(answer) => Ok(answer),
        Err(
            inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted,
        ) => Ok(false),
        Err(other) => Err(VmError::Validation {
            message: format!("prompt error: {other}"),
        }),
    }
}

fn to_json<T: facet::Facet<'static>>(value: &T) -> Result<String, VmError> {
    facet_json::to_string(value).map_err(|e| VmError::Validation {
        message: format!("JSON serialization failed: {e}"),
    })
}

fn status_label(status: VmStatus) -> StyledObject<&'static str> {
    let label = style(status.as_str());
    match status {
        VmStatus::Ready | VmStatus::Started => label.green(),
        VmStatus::Created | VmStatus::Initializing | VmStatus::Starting => label.yellow(),
        VmStatus::Failed => label.red(),
        VmStatus::Stopped | VmStatus::Deleted => label.dim(),
    }
}

fn print_record(record: &VmRecord) {
    println!("{} {}", style(&record.name).bold(), status_label(record.status()));
    println!("  image:   {}", record.config.base_image);
    println!("  cpus:    {}", record.config.cpus);
    println!("  memory:  {}", record.config.memory);
    println!("  network: {} ({})", record.config.network.mode, record.config.network.mac_address);
    println!("  ssh:     {}", record.ssh_info.describe());
    if let Some(pid) = record.pid() {
        println!("  pid:     {pid}");
    }
    if let Some(port) = record.console_port {
        println!("  qmp:     127.0.0.1:{port}");
    }
    if let Some(err) = &record.last_error {
        println!("  error:   {}", style(err).red());
    }
}

fn print_table(records: &[VmRecord]) {
    if records.is_empty() {
        println!("No VMs.");
        return;
    }
    for record in records {
        println!(
            "  {:<20} {:<14} {:>2} cpu {:>6}  {}",
            record.name,
            status_label(record.status()).to_string(),
            record.config.cpus,
            record.config.memory,
            record.ssh_info.describe()
        );
    }
}

fn print_snapshots(term: &Term, snapshots: &[VmSnapshot]) {
    if term.is_term() {
        let _ = term.clear_screen();
    }
    println!("{}", style(logging::utc_timestamp()).dim());
    if snapshots.is_empty() {
        println!("No VMs.");
    }
    for snap in snapshots {
        let reachable = match snap.reachable {
            Some(true) => style("reachable").green(),
            Some(false) => style("unreachable").red(),
            None => style("-").dim(),
        };
        println!(
            "  {:<20} {:<14} {:<12} {}",
            snap.name,
            status_label(snap.status).to_string(),
            reachable.to_string(),
            snap.ssh
        );
    }
}

fn print_quarantined(moved: &[(String, std::path::PathBuf)]) {
    if moved.is_empty() {
        println!("No stopped VMs to quarantine.");
    }
    for (name, dest) in moved {
        println!("Quarantined '{name}' -> {}", dest.display());
    }
}
