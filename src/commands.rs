//! Implementations of the CLI verbs. Everything here is a thin foreground
//! orchestration over the store, disk, engine, and daemon modules; the
//! daemon process itself re-enters through [`Command::RunDaemon`].

use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;

use crate::cli::{Command, OutputFormat};
use crate::cloudinit;
use crate::config::VmConfig;
use crate::console::ConsoleClient;
use crate::daemon::{self, DaemonOptions};
use crate::disk;
use crate::error::{DiskError, ManagerError, RunnerError, VmError};
use crate::logging::LogContext;
use crate::paths;
use crate::rescue;
use crate::store::{self, RESCUE_VM_NAME};
use crate::util;

/// How long `vm stop` waits for a graceful shutdown before handing the
/// user the force hint.
const STOP_GRACE: Duration = Duration::from_secs(30);
/// Console socket wait on interactive start.
const SOCKET_WAIT: Duration = Duration::from_secs(10);
/// Console socket wait for the rescue VM (first boot does more work).
const RESCUE_SOCKET_WAIT: Duration = Duration::from_secs(15);

/// Fresh rescue boot disks get room to grow beyond the image size.
const RESCUE_DISK_SIZE: u64 = 10 * 1024 * 1024 * 1024;

pub async fn dispatch(command: Command, log: LogContext) -> Result<(), VmError> {
    match command {
        Command::Create {
            name,
            iso,
            disk_size,
            cpus,
            memory,
            interactive,
        } => create(&name, iso, &disk_size, cpus, &memory, interactive).await,
        Command::Import {
            name,
            disk,
            copy,
            cpus,
            memory,
            size,
        } => import(&name, &disk, copy, cpus, &memory, size.as_deref()),
        Command::Start {
            name,
            interactive,
            iso,
        } => start(&name, interactive, iso).await,
        Command::Stop { name, force } => stop(&name, force).await,
        Command::Attach { name } => attach(&name).await,
        Command::Ssh {
            name,
            user,
            port,
            args,
        } => ssh(&name, user.as_deref(), port, &args),
        Command::Ip { name } => ip(&name),
        Command::Info { name, format } => info(&name, format),
        Command::List { format } => list(format),
        Command::Edit { name, cpus, memory } => edit(&name, cpus, memory.as_deref()),
        Command::Resize { name, size } => resize(&name, &size),
        Command::Delete { name, force } => delete(&name, force),
        Command::Rescue {
            name,
            force_download,
            offline,
        } => rescue_vm(&name, force_download, offline).await,
        Command::RunDaemon {
            name,
            iso,
            rescue,
            target_disk,
        } => {
            daemon::run(
                DaemonOptions {
                    name,
                    attach_iso: iso,
                    rescue,
                    target_disk,
                },
                log,
            )
            .await
        }
    }
}

// ── create / import ──────────────────────────────────────

async fn create(
    name: &str,
    iso: Option<PathBuf>,
    disk_size: &str,
    cpus: u32,
    memory: &str,
    interactive: bool,
) -> Result<(), VmError> {
    let memory_size = util::parse_size(memory)?;
    let disk_size = util::parse_size(disk_size)?;

    let mut config = VmConfig::new(name, cpus, memory_size, disk_size);
    if let Some(iso) = iso {
        let iso = iso.canonicalize().map_err(|_| {
            ManagerError::ConfigurationError(format!("ISO not found: {}", iso.display()))
        })?;
        config.iso_path = Some(iso);
    }
    config.validate()?;

    store::create_vm(&config)?;
    if let Err(err) = populate_vm(&config) {
        // Half-created VMs would block a retry under the same name.
        let _ = std::fs::remove_dir_all(paths::vm_dir(name));
        return Err(err);
    }

    println!(
        "Created VM '{name}' ({} CPUs, {} memory, {} disk)",
        config.cpu_count,
        util::format_size(config.memory_size),
        util::format_size(config.disk_size),
    );

    if interactive {
        start(name, true, config.iso_path.is_some()).await?;
    }
    Ok(())
}

fn populate_vm(config: &VmConfig) -> Result<(), VmError> {
    disk::create_disk_image(&config.resolved_disk_path(), config.disk_size)?;
    cloudinit::generate_seed_iso(
        &paths::cloud_init_iso_path(&config.name),
        &config.name,
        &cloudinit::host_ssh_keys(),
    )?;
    write_ssh_config(&config.name)?;
    Ok(())
}

fn import(
    name: &str,
    source: &Path,
    copy: bool,
    cpus: u32,
    memory: &str,
    size: Option<&str>,
) -> Result<(), VmError> {
    let memory_size = util::parse_size(memory)?;
    if !source.exists() {
        return Err(DiskError::FileNotFound(source.to_path_buf()).into());
    }
    let source = source.canonicalize().map_err(|e| DiskError::CopyFailed {
        path: source.to_path_buf(),
        source: e,
    })?;

    let disk_size = match size {
        Some(s) => util::parse_size(s)?,
        None => disk::disk_virtual_size(&source)?,
    };

    let config = VmConfig::new(name, cpus, memory_size, disk_size);
    config.validate()?;
    store::create_vm(&config)?;

    let dest = paths::disk_path(name);
    let result = if copy {
        disk::copy_disk_image(&source, &dest).map(|_| ())
    } else {
        disk::link_disk_image(&source, &dest)
    };
    if let Err(err) = result.map_err(VmError::from).and_then(|_| write_ssh_config(name)) {
        let _ = std::fs::remove_dir_all(paths::vm_dir(name));
        return Err(err);
    }

    let mode = if copy { "copied" } else { "linked" };
    println!("Imported '{}' as VM '{name}' ({mode})", source.display());
    Ok(())
}

fn write_ssh_config(name: &str) -> Result<(), VmError> {
    let contents = format!(
        "# SSH configuration for VM '{name}'.\n\
         # The guest address is dynamic; `vm ssh {name}` resolves it from\n\
         # the network info the daemon collects.\n\
         Host {name}\n  \
           User {user}\n  \
           StrictHostKeyChecking no\n  \
           UserKnownHostsFile /dev/null\n  \
           LogLevel ERROR\n",
        user = cloudinit::GUEST_USER,
    );
    std::fs::write(paths::ssh_config_path(name), contents).map_err(|e| {
        ManagerError::FileSystemError {
            context: format!("writing ssh_config for '{name}'"),
            source: e,
        }
        .into()
    })
}

// ── lifecycle ────────────────────────────────────────────

async fn start(name: &str, interactive: bool, iso: bool) -> Result<(), VmError> {
    let config = store::load_configuration(name)?;
    if store::running_pid(name).is_some() {
        return Err(RunnerError::AlreadyRunning(name.to_string()).into());
    }
    if iso && config.iso_path.is_none() {
        return Err(RunnerError::ConfigurationError(format!(
            "VM '{name}' has no ISO configured"
        ))
        .into());
    }

    let command = daemon::daemon_command(name, iso, None)?;
    if interactive {
        let spawned = daemon::spawn_and_wait_for_socket(command, name, SOCKET_WAIT, true).await?;
        println!("VM '{name}' started; attaching console (Ctrl-] to detach)");
        run_console(name, spawned.socket_path).await?;
    } else {
        let pid = daemon::spawn_background(command, name).await?;
        println!("VM '{name}' started (daemon pid {pid})");
    }
    Ok(())
}

async fn stop(name: &str, force: bool) -> Result<(), VmError> {
    store::load_configuration(name)?;
    let Some(pid) = store::running_pid(name) else {
        println!("VM '{name}' is not running");
        return Ok(());
    };

    if force {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        store::clear_runtime_info(name);
        println!("VM '{name}' force stopped");
        return Ok(());
    }

    // SIGTERM asks the daemon for a graceful engine stop; give it 30 s.
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    );
    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        if store::running_pid(name).is_none() {
            println!("VM '{name}' stopped");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    println!("VM '{name}' is still shutting down; use `vm stop {name} --force` to kill it");
    Ok(())
}

async fn attach(name: &str) -> Result<(), VmError> {
    store::load_configuration(name)?;
    if store::running_pid(name).is_none() {
        return Err(RunnerError::ConfigurationError(format!(
            "VM '{name}' is not running"
        ))
        .into());
    }
    let socket_path = paths::console_socket_path(name);
    if !socket_path.exists() {
        return Err(RunnerError::ConfigurationError(
            "VM may still be starting up".into(),
        )
        .into());
    }
    println!("Attaching to VM '{name}' (Ctrl-] to detach)");
    match run_console(name, socket_path).await {
        // A socket file whose listener is gone or not yet accepting.
        Err(VmError::ConsoleConnection(
            crate::console::ConsoleConnectionError::ConnectionFailed(_),
        )) => Err(RunnerError::ConfigurationError("VM may still be starting up".into()).into()),
        other => other,
    }
}

async fn run_console(name: &str, socket_path: PathBuf) -> Result<(), VmError> {
    let client = ConsoleClient::new(socket_path, name);
    client.run(|message| println!("{message}")).await?;
    Ok(())
}

// ── addressing ───────────────────────────────────────────

fn primary_ip(name: &str) -> Result<String, VmError> {
    store::load_configuration(name)?;
    store::load_network_info(name)
        .as_ref()
        .and_then(|info| info.primary_ipv4().map(str::to_string))
        .ok_or_else(|| {
            RunnerError::ConfigurationError(format!(
                "no known address for VM '{name}' (is it running?)"
            ))
            .into()
        })
}

fn ssh(name: &str, user: Option<&str>, port: Option<u16>, extra: &[String]) -> Result<(), VmError> {
    use std::os::unix::process::CommandExt;

    let address = primary_ip(name)?;
    let user = user.unwrap_or(cloudinit::GUEST_USER);

    let mut command = std::process::Command::new("ssh");
    command
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-o")
        .arg("LogLevel=ERROR");
    if let Some(port) = port {
        command.arg("-p").arg(port.to_string());
    }
    command.arg(format!("{user}@{address}"));
    command.args(extra);

    // exec only returns on failure.
    let err = command.exec();
    Err(RunnerError::RuntimeError(format!("failed to run ssh: {err}")).into())
}

fn ip(name: &str) -> Result<(), VmError> {
    let address = primary_ip(name)?;
    print!("{address}");
    let _ = std::io::stdout().flush();
    Ok(())
}

// ── inspection ───────────────────────────────────────────

fn status_of(name: &str) -> &'static str {
    if store::running_pid(name).is_some() {
        "running"
    } else {
        "stopped"
    }
}

fn info(name: &str, format: OutputFormat) -> Result<(), VmError> {
    let config = store::load_configuration(name)?;
    let status = status_of(name);
    let address = store::load_network_info(name)
        .as_ref()
        .and_then(|info| info.primary_ipv4().map(str::to_string));

    match format {
        OutputFormat::Json => {
            let mut value = serde_json::to_value(&config)
                .map_err(|e| ManagerError::ConfigurationError(e.to_string()))?;
            value["status"] = json!(status);
            if let Some(address) = &address {
                value["ip_address"] = json!(address);
            }
            println!("{}", serde_json::to_string_pretty(&value).expect("object"));
        }
        OutputFormat::Text => {
            println!("Name:     {}", config.name);
            println!("Status:   {status}");
            println!("CPUs:     {}", config.cpu_count);
            println!("Memory:   {}", util::format_size(config.memory_size));
            println!("Disk:     {}", util::format_size(config.disk_size));
            println!("MAC:      {}", config.mac_address);
            if let Some(iso) = &config.iso_path {
                println!("ISO:      {}", iso.display());
            }
            if let Some(address) = &address {
                println!("IP:       {address}");
            }
            println!("Created:  {}", config.created_at.to_rfc3339());
            println!("Modified: {}", config.modified_at.to_rfc3339());
        }
    }
    Ok(())
}

fn list(format: OutputFormat) -> Result<(), VmError> {
    let names = store::list_vms();

    match format {
        OutputFormat::Json => {
            let mut items = Vec::new();
            for name in &names {
                let config = store::load_configuration(name)?;
                items.push(json!({
                    "name": config.name,
                    "status": status_of(name),
                    "cpu_count": config.cpu_count,
                    "memory_size": config.memory_size,
                    "disk_size": config.disk_size,
                }));
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::Value::Array(items)).expect("array")
            );
        }
        OutputFormat::Text => {
            if names.is_empty() {
                println!("No VMs. Create one with `vm create <name>`.");
                return Ok(());
            }
            let name_width = names
                .iter()
                .map(String::len)
                .chain(["NAME".len()])
                .max()
                .unwrap_or(4);
            println!("{:<name_width$}  {:<8}  {:>4}  {:>8}  {:>8}", "NAME", "STATUS", "CPUS", "MEMORY", "DISK");
            for name in &names {
                let config = store::load_configuration(name)?;
                println!(
                    "{:<name_width$}  {:<8}  {:>4}  {:>8}  {:>8}",
                    config.name,
                    status_of(name),
                    config.cpu_count,
                    util::format_size(config.memory_size),
                    util::format_size(config.disk_size),
                );
            }
        }
    }
    Ok(())
}

// ── mutation ─────────────────────────────────────────────

fn edit(name: &str, cpus: Option<u32>, memory: Option<&str>) -> Result<(), VmError> {
    let mut config = store::load_configuration(name)?;
    if store::running_pid(name).is_some() {
        return Err(ManagerError::ConfigurationError(format!(
            "VM '{name}' is currently running; stop it before editing"
        ))
        .into());
    }
    if cpus.is_none() && memory.is_none() {
        return Err(ManagerError::ConfigurationError(
            "nothing to change: pass --cpus and/or --memory".into(),
        )
        .into());
    }

    if let Some(cpus) = cpus {
        config.cpu_count = cpus;
    }
    if let Some(memory) = memory {
        config.memory_size = util::parse_size(memory)?;
    }
    config.validate()?;
    store::save_configuration(&mut config)?;

    println!(
        "Updated VM '{name}' ({} CPUs, {} memory)",
        config.cpu_count,
        util::format_size(config.memory_size)
    );
    Ok(())
}

fn resize(name: &str, size: &str) -> Result<(), VmError> {
    let mut config = store::load_configuration(name)?;
    if store::running_pid(name).is_some() {
        return Err(ManagerError::ConfigurationError(format!(
            "VM '{name}' is currently running; stop it before resizing"
        ))
        .into());
    }

    let new_size = util::parse_size(size)?;
    disk::resize_disk_image(&config.resolved_disk_path(), config.disk_size, new_size)?;
    config.disk_size = new_size;
    store::save_configuration(&mut config)?;

    println!("Resized disk of VM '{name}' to {}", util::format_size(new_size));
    Ok(())
}

fn delete(name: &str, force: bool) -> Result<(), VmError> {
    store::load_configuration(name)?;
    if store::running_pid(name).is_some() {
        return Err(ManagerError::ConfigurationError(format!(
            "VM '{name}' is currently running; stop it first"
        ))
        .into());
    }

    if !force {
        if !std::io::stdin().is_terminal() {
            return Err(ManagerError::ConfigurationError(
                "refusing to delete without confirmation; pass --force".into(),
            )
            .into());
        }
        let confirmed = inquire::Confirm::new(&format!("Delete VM '{name}' and all its data?"))
            .with_default(false)
            .prompt()
            .unwrap_or(false);
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }

    store::delete_vm(name)?;
    println!("Deleted VM '{name}'");
    Ok(())
}

// ── rescue ───────────────────────────────────────────────

async fn rescue_vm(name: &str, force_download: bool, offline: bool) -> Result<(), VmError> {
    if name == RESCUE_VM_NAME {
        return Err(ManagerError::ConfigurationError(
            "cannot rescue the rescue VM".into(),
        )
        .into());
    }
    let target = store::load_configuration(name)?;
    if store::running_pid(name).is_some() {
        return Err(ManagerError::ConfigurationError(format!(
            "VM '{name}' is currently running; stop it before rescuing"
        ))
        .into());
    }
    if store::running_pid(RESCUE_VM_NAME).is_some() {
        return Err(RunnerError::AlreadyRunning(RESCUE_VM_NAME.to_string()).into());
    }

    let image = rescue::ensure_rescue_image(force_download, offline).await?;
    prepare_rescue_vm(&image)?;

    // Record which VM's disk we are holding; the daemon clears this marker
    // on exit.
    let target_disk = target.resolved_disk_path();
    std::fs::write(paths::rescue_target_path(RESCUE_VM_NAME), name).map_err(|e| {
        ManagerError::FileSystemError {
            context: "writing rescue target marker".into(),
            source: e,
        }
    })?;

    println!(
        "Booting rescue VM with the disk of '{name}' attached as a secondary device"
    );
    let command = daemon::daemon_command(RESCUE_VM_NAME, false, Some(target_disk.as_path()))?;
    let spawned =
        daemon::spawn_and_wait_for_socket(command, RESCUE_VM_NAME, RESCUE_SOCKET_WAIT, true)
            .await?;
    run_console(RESCUE_VM_NAME, spawned.socket_path).await
}

/// (Re)build the rescue VM directory with a fresh boot disk copied from
/// the cached image.
fn prepare_rescue_vm(image: &Path) -> Result<(), VmError> {
    let dir = paths::vm_dir(RESCUE_VM_NAME);
    std::fs::create_dir_all(&dir).map_err(|e| ManagerError::FileSystemError {
        context: format!("creating {}", dir.display()),
        source: e,
    })?;

    // Every rescue session starts from a pristine boot disk.
    let boot_disk = paths::disk_path(RESCUE_VM_NAME);
    let _ = std::fs::remove_file(&boot_disk);
    disk::copy_disk_image(image, &boot_disk)?;
    let image_size = disk::disk_virtual_size(&boot_disk)?;
    if image_size < RESCUE_DISK_SIZE {
        disk::resize_disk_image(&boot_disk, image_size, RESCUE_DISK_SIZE)?;
    }

    let mut config = VmConfig::new(RESCUE_VM_NAME, 2, 2 * 1024 * 1024 * 1024, RESCUE_DISK_SIZE);
    config.validate()?;
    // The reserved name bypasses create_vm on purpose.
    crate::config::write_json(&paths::config_path(RESCUE_VM_NAME), &config)?;

    cloudinit::generate_seed_iso(
        &paths::cloud_init_iso_path(RESCUE_VM_NAME),
        RESCUE_VM_NAME,
        &cloudinit::host_ssh_keys(),
    )?;
    Ok(())
}
