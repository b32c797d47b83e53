//! The VM daemon: a detached process owning one running VM end to end,
//! plus the spawner the foreground commands use to launch and stop it.
//!
//! Rendezvous protocol: `vm.pid` is written before the engine starts, the
//! console socket appears after it; anyone wanting an interactive attach
//! must therefore wait for the socket, not the PID file.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::net::unix::pipe;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Instant;

use crate::config::{RuntimeInfo, StartOptions};
use crate::console::ConsoleMultiplexer;
use crate::engine::{Engine, EngineConfig};
use crate::error::{RunnerError, VmError};
use crate::guest_agent;
use crate::logging::LogContext;
use crate::paths;
use crate::socket::set_nonblocking;
use crate::store::{self, RESCUE_VM_NAME};

/// Spawner: how long the PID file may take to appear.
const PID_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Spawner poll tick.
const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Daemon monitoring loop tick.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub name: String,
    pub attach_iso: bool,
    pub rescue: bool,
    pub target_disk: Option<PathBuf>,
}

/// Removes the rendezvous files on every daemon exit path, including
/// panics and early errors.
struct CleanupGuard {
    name: String,
    rescue: bool,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        store::clear_runtime_info(&self.name);
        let _ = std::fs::remove_file(paths::qmp_socket_path(&self.name));
        let _ = std::fs::remove_file(paths::console_socket_path(&self.name));
        if self.rescue {
            let _ = std::fs::remove_file(paths::rescue_target_path(&self.name));
        } else {
            store::clear_network_info(&self.name);
        }
    }
}

/// `run-daemon`: the reentrant entry point the spawner launches.
pub async fn run(options: DaemonOptions, log: LogContext) -> Result<(), VmError> {
    let name = options.name.clone();

    // Step 1: route our own and every component's logging into vm.log.
    if paths::vm_dir(&name).exists() {
        if let Err(err) = log.activate_file(&paths::log_path(&name)) {
            tracing::warn!(%err, "could not open VM log file");
        }
    }

    // Step 2: mode constraints, and no second daemon in either mode.
    if options.rescue {
        if name != RESCUE_VM_NAME {
            return Err(RunnerError::ConfigurationError(format!(
                "rescue mode is reserved for the '{RESCUE_VM_NAME}' VM"
            ))
            .into());
        }
        let target = options.target_disk.as_ref().ok_or_else(|| {
            RunnerError::ConfigurationError("rescue mode requires --target-disk".into())
        })?;
        std::fs::File::open(target).map_err(|e| {
            RunnerError::ConfigurationError(format!(
                "target disk {} is not readable: {e}",
                target.display()
            ))
        })?;
    } else if options.target_disk.is_some() {
        return Err(
            RunnerError::ConfigurationError("--target-disk requires --rescue".into()).into(),
        );
    }
    if let Some(pid) = store::running_pid(&name) {
        tracing::warn!(pid, "daemon already running");
        return Err(RunnerError::AlreadyRunning(name).into());
    }

    // Step 3: configuration.
    let config = store::load_configuration(&name)?;

    // Step 4: backing files, before any runtime resources exist.
    let disk = config.resolved_disk_path();
    if !disk.exists() {
        return Err(RunnerError::ConfigurationError(format!(
            "disk image not found: {}",
            disk.display()
        ))
        .into());
    }
    if options.attach_iso {
        let iso = config.iso_path.as_ref().ok_or_else(|| {
            RunnerError::ConfigurationError(format!("VM '{name}' has no ISO configured"))
        })?;
        if !iso.exists() {
            return Err(RunnerError::ConfigurationError(format!(
                "ISO not found: {}",
                iso.display()
            ))
            .into());
        }
    }

    let start_options = if options.rescue {
        StartOptions::rescue(options.target_disk.clone().expect("validated above"))
    } else {
        StartOptions::normal(options.attach_iso)
    };

    // Step 5: serial pipes. The engine reads console input from one pair
    // and writes console output to the other; the multiplexer owns the
    // daemon-side ends.
    let (serial_in_read, serial_in_write) =
        nix::unistd::pipe().map_err(|e| RunnerError::RuntimeError(format!("pipe: {e}")))?;
    let (serial_out_read, serial_out_write) =
        nix::unistd::pipe().map_err(|e| RunnerError::RuntimeError(format!("pipe: {e}")))?;
    set_nonblocking(serial_in_write.as_raw_fd())
        .map_err(|e| RunnerError::RuntimeError(format!("pipe setup: {e}")))?;
    set_nonblocking(serial_out_read.as_raw_fd())
        .map_err(|e| RunnerError::RuntimeError(format!("pipe setup: {e}")))?;
    let vm_in = pipe::Sender::from_owned_fd(serial_in_write)
        .map_err(|e| RunnerError::RuntimeError(format!("pipe setup: {e}")))?;
    let vm_out = pipe::Receiver::from_owned_fd(serial_out_read)
        .map_err(|e| RunnerError::RuntimeError(format!("pipe setup: {e}")))?;

    // Step 6: engine configuration, then the PID rendezvous file.
    let engine_config =
        EngineConfig::build(&config, &start_options, serial_in_read, serial_out_write)?;
    let mut engine = Engine::new(engine_config);

    store::save_runtime_info(
        &name,
        &RuntimeInfo {
            pid: std::process::id() as i32,
            started_at: chrono::Utc::now(),
        },
    )?;

    // Step 7: cleanup runs from here on, whatever happens.
    let _cleanup = CleanupGuard {
        name: name.clone(),
        rescue: options.rescue,
    };

    // Step 8.
    if let Err(err) = engine.start().await {
        tracing::error!(%err, "engine failed to start");
        return Err(err.into());
    }

    // Step 9: console multiplexer on the VM's socket.
    let mut multiplexer = ConsoleMultiplexer::new();
    if let Err(err) = multiplexer
        .start(&paths::console_socket_path(&name), vm_in, vm_out)
        .await
    {
        let _ = engine.force_stop().await;
        return Err(err.into());
    }

    // Step 10: guest-agent polling, normal mode only.
    let exit = Arc::new(AtomicBool::new(false));
    let agent_task = match (options.rescue, engine.guest_agent_endpoint()) {
        (false, Some(endpoint)) => Some(tokio::spawn(guest_agent::run_periodic_query(
            endpoint,
            name.clone(),
            exit.clone(),
        ))),
        _ => None,
    };

    // Step 11: SIGINT/SIGTERM flip the exit flag; dropping the streams at
    // the end of this function restores default dispositions.
    let handlers = signal(SignalKind::interrupt())
        .and_then(|sigint| Ok((sigint, signal(SignalKind::terminate())?)));
    let (mut sigint, mut sigterm) = match handlers {
        Ok(pair) => pair,
        Err(err) => {
            let _ = engine.force_stop().await;
            multiplexer.stop().await;
            return Err(RunnerError::RuntimeError(format!("signal handler: {err}")).into());
        }
    };
    let signal_task = tokio::spawn({
        let exit = exit.clone();
        async move {
            tokio::select! {
                _ = sigint.recv() => tracing::info!("received SIGINT"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            }
            exit.store(true, Ordering::Relaxed);
        }
    });

    tracing::info!(vm = %name, rescue = options.rescue, "VM is running");

    // Step 12: monitoring loop.
    loop {
        tokio::time::sleep(MONITOR_INTERVAL).await;
        let state = engine.state();
        if state.is_terminal() {
            tracing::info!(?state, "engine reached terminal state");
            break;
        }
        if exit.load(Ordering::Relaxed) {
            break;
        }
    }

    // Step 13: graceful stop on signal exit.
    if exit.load(Ordering::Relaxed) && !engine.state().is_terminal() {
        tracing::info!("stopping VM");
        if let Err(err) = engine.stop().await {
            tracing::error!(%err, "stop failed");
        }
    }

    exit.store(true, Ordering::Relaxed);
    if let Some(task) = agent_task {
        task.abort();
        let _ = task.await;
    }
    multiplexer.stop().await;
    signal_task.abort();

    tracing::info!(vm = %name, "daemon exiting");
    Ok(())
}

// ── Spawner ──────────────────────────────────────────────

/// Build the detached `run-daemon` invocation of this binary.
pub fn daemon_command(
    name: &str,
    attach_iso: bool,
    rescue_target: Option<&Path>,
) -> Result<std::process::Command, RunnerError> {
    use std::os::unix::process::CommandExt;
    use std::process::Stdio;

    let exe = std::env::current_exe()
        .map_err(|e| RunnerError::ConfigurationError(format!("cannot find own binary: {e}")))?;

    let mut command = std::process::Command::new(exe);
    command.arg("run-daemon").arg(name);
    if attach_iso {
        command.arg("--iso");
    }
    if let Some(target) = rescue_target {
        command.arg("--rescue").arg("--target-disk").arg(target);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    Ok(command)
}

/// Launch the daemon and wait for a valid PID file. Returns the daemon PID.
pub async fn spawn_background(
    mut command: std::process::Command,
    name: &str,
) -> Result<i32, RunnerError> {
    command
        .spawn()
        .map_err(|e| RunnerError::BootError(format!("failed to spawn daemon: {e}")))?;

    let deadline = Instant::now() + PID_WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if let Some(pid) = store::running_pid(name) {
            return Ok(pid);
        }
        tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
    }
    Err(RunnerError::BootError(format!(
        "VM failed to start (check {})",
        paths::log_path(name).display()
    )))
}

pub struct SpawnedDaemon {
    pub child: std::process::Child,
    pub socket_path: PathBuf,
}

/// Launch the daemon and wait for the console socket, optionally watching
/// for an early crash.
pub async fn spawn_and_wait_for_socket(
    mut command: std::process::Command,
    name: &str,
    timeout: Duration,
    check_crash: bool,
) -> Result<SpawnedDaemon, RunnerError> {
    let mut child = command
        .spawn()
        .map_err(|e| RunnerError::BootError(format!("failed to spawn daemon: {e}")))?;

    let socket_path = paths::console_socket_path(name);
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if socket_path.exists() {
            return Ok(SpawnedDaemon { child, socket_path });
        }
        if check_crash {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(RunnerError::BootError(format!(
                    "daemon exited before the console became ready ({status}); check {}",
                    paths::log_path(name).display()
                )));
            }
        }
        tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
    }
    Err(RunnerError::BootError(format!(
        "VM failed to start (no console socket after {}s; check {})",
        timeout.as_secs(),
        paths::log_path(name).display()
    )))
}

/// SIGTERM the daemon and poll for exit; escalate to SIGKILL after
/// `timeout`. Returns true when it exited gracefully.
pub async fn stop_daemon(pid: i32, timeout: Duration) -> bool {
    let target = Pid::from_raw(pid);
    if kill(target, Signal::SIGTERM).is_err() {
        return true; // already gone
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if kill(target, None).is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    tracing::warn!(pid, "daemon ignored SIGTERM, sending SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
    tokio::time::sleep(Duration::from_millis(200)).await;
    false
}
