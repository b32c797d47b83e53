//! QEMU-backed engine: argument assembly, child process lifecycle, and the
//! monitor task that turns process exit into observable state.

use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{StartOptions, VmConfig};
use crate::engine::qmp::QmpClient;
use crate::engine::{EngineState, VsockEndpoint};
use crate::error::RunnerError;
use crate::guest_agent::{GUEST_AGENT_CID, GUEST_AGENT_PORT};
use crate::paths;

/// Graceful stop: request powerdown, then poll before forcing.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long the freshly spawned hypervisor gets to expose its QMP socket.
const QMP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Mount tag for the optional host home share.
const SHARE_TAG: &str = "hostHome";

// ── Firmware discovery ───────────────────────────────────

struct Firmware {
    code: PathBuf,
    vars: PathBuf,
}

/// Well-known EFI firmware locations, per architecture and distro layout.
fn firmware_candidates() -> &'static [(&'static str, &'static str)] {
    match std::env::consts::ARCH {
        "aarch64" => &[
            ("/usr/share/AAVMF/AAVMF_CODE.fd", "/usr/share/AAVMF/AAVMF_VARS.fd"),
            (
                "/usr/share/edk2/aarch64/QEMU_EFI-pflash.raw",
                "/usr/share/edk2/aarch64/vars-template-pflash.raw",
            ),
        ],
        _ => &[
            ("/usr/share/OVMF/OVMF_CODE_4M.fd", "/usr/share/OVMF/OVMF_VARS_4M.fd"),
            ("/usr/share/OVMF/OVMF_CODE.fd", "/usr/share/OVMF/OVMF_VARS.fd"),
            ("/usr/share/edk2/x64/OVMF_CODE.4m.fd", "/usr/share/edk2/x64/OVMF_VARS.4m.fd"),
            ("/usr/share/edk2/x64/OVMF_CODE.fd", "/usr/share/edk2/x64/OVMF_VARS.fd"),
            ("/usr/share/edk2-ovmf/x64/OVMF_CODE.fd", "/usr/share/edk2-ovmf/x64/OVMF_VARS.fd"),
        ],
    }
}

fn find_firmware() -> Option<Firmware> {
    firmware_candidates()
        .iter()
        .find(|(code, vars)| Path::new(code).exists() && Path::new(vars).exists())
        .map(|(code, vars)| Firmware {
            code: PathBuf::from(code),
            vars: PathBuf::from(vars),
        })
}

/// The per-VM EFI variable store: copied from the template on first boot,
/// loaded as-is afterwards.
fn ensure_nvram(nvram: &Path, vars_template: &Path) -> Result<(), RunnerError> {
    if nvram.exists() {
        return Ok(());
    }
    std::fs::copy(vars_template, nvram).map_err(|e| {
        RunnerError::ConfigurationError(format!(
            "failed to create NVRAM store {}: {e}",
            nvram.display()
        ))
    })?;
    tracing::info!(path = %nvram.display(), "created NVRAM store");
    Ok(())
}

// ── Engine configuration ─────────────────────────────────

/// Validated hypervisor invocation, ready to start.
pub struct EngineConfig {
    program: PathBuf,
    args: Vec<OsString>,
    /// (serial input read end, serial output write end) — become the
    /// child's stdin/stdout.
    serial: Option<(OwnedFd, OwnedFd)>,
    qmp_path: PathBuf,
    vsock: Option<VsockEndpoint>,
    vm_name: String,
}

impl EngineConfig {
    /// Compose the full device tree for a VM and validate it.
    ///
    /// `serial_in` is the read end the VM consumes console input from;
    /// `serial_out` is the write end it emits console output to.
    pub fn build(
        config: &VmConfig,
        options: &StartOptions,
        serial_in: OwnedFd,
        serial_out: OwnedFd,
    ) -> Result<Self, RunnerError> {
        config
            .validate()
            .map_err(|e| RunnerError::ConfigurationError(e.to_string()))?;

        let disk_path = config.resolved_disk_path();
        if !disk_path.exists() {
            return Err(RunnerError::ConfigurationError(format!(
                "disk image not found: {}",
                disk_path.display()
            )));
        }

        if let Some(secondary) = &options.secondary_disk {
            if !secondary.exists() {
                return Err(RunnerError::ConfigurationError(format!(
                    "secondary disk not found: {}",
                    secondary.display()
                )));
            }
        }

        let iso_path = if options.attach_iso {
            let iso = config.iso_path.as_ref().ok_or_else(|| {
                RunnerError::ConfigurationError(format!(
                    "VM '{}' has no ISO configured",
                    config.name
                ))
            })?;
            if !iso.exists() {
                return Err(RunnerError::ConfigurationError(format!(
                    "ISO not found: {}",
                    iso.display()
                )));
            }
            Some(iso.clone())
        } else {
            None
        };

        let firmware = find_firmware().ok_or_else(|| {
            RunnerError::ConfigurationError(
                "EFI firmware not found (install the OVMF/AAVMF package)".into(),
            )
        })?;
        let nvram = paths::nvram_path(&config.name);
        ensure_nvram(&nvram, &firmware.vars)?;

        let cloud_init = paths::cloud_init_iso_path(&config.name);
        let cloud_init = cloud_init.exists().then_some(cloud_init);

        let share_dir = options
            .enable_directory_sharing
            .then(dirs::home_dir)
            .flatten();

        let qmp_path = paths::qmp_socket_path(&config.name);
        let vsock = options.enable_guest_agent.then_some(VsockEndpoint {
            cid: GUEST_AGENT_CID,
            port: GUEST_AGENT_PORT,
        });

        let args = compose_args(ComposeInputs {
            config,
            firmware: &firmware,
            nvram: &nvram,
            qmp_path: &qmp_path,
            disk: &disk_path,
            secondary_disk: options.secondary_disk.as_deref(),
            iso: iso_path.as_deref(),
            cloud_init: cloud_init.as_deref(),
            share_dir: share_dir.as_deref(),
            vsock,
        });

        Ok(Self {
            program: PathBuf::from(format!("qemu-system-{}", std::env::consts::ARCH)),
            args,
            serial: Some((serial_in, serial_out)),
            qmp_path,
            vsock,
            vm_name: config.name.clone(),
        })
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

struct ComposeInputs<'a> {
    config: &'a VmConfig,
    firmware: &'a Firmware,
    nvram: &'a Path,
    qmp_path: &'a Path,
    disk: &'a Path,
    secondary_disk: Option<&'a Path>,
    iso: Option<&'a Path>,
    cloud_init: Option<&'a Path>,
    share_dir: Option<&'a Path>,
    vsock: Option<VsockEndpoint>,
}

fn os(parts: &[&dyn AsRef<std::ffi::OsStr>]) -> OsString {
    let mut out = OsString::new();
    for part in parts {
        out.push(part.as_ref());
    }
    out
}

/// Device order: CPU/memory/firmware, block devices
/// [main, secondary?, iso?, cloud-init?], network, serial, entropy,
/// balloon, input, vsock, share.
fn compose_args(inputs: ComposeInputs<'_>) -> Vec<OsString> {
    let ComposeInputs {
        config,
        firmware,
        nvram,
        qmp_path,
        disk,
        secondary_disk,
        iso,
        cloud_init,
        share_dir,
        vsock,
    } = inputs;

    let mut args: Vec<OsString> = Vec::new();
    let mut push = |parts: &[&dyn AsRef<std::ffi::OsStr>]| args.push(os(parts));

    push(&[&"-name"]);
    push(&[&format!("guest={},process=vm-{}", config.name, config.name)]);

    let machine = match std::env::consts::ARCH {
        "aarch64" => "virt,accel=kvm",
        _ => "q35,accel=kvm",
    };
    push(&[&"-machine"]);
    push(&[&machine]);
    push(&[&"-cpu"]);
    push(&[&"host"]);
    push(&[&"-smp"]);
    push(&[&config.cpu_count.to_string()]);
    push(&[&"-m"]);
    push(&[&format!("{}M", config.memory_size / (1024 * 1024))]);

    // EFI firmware: read-only code plus the per-VM variable store.
    push(&[&"-drive"]);
    push(&[&"if=pflash,format=raw,readonly=on,file=", &firmware.code]);
    push(&[&"-drive"]);
    push(&[&"if=pflash,format=raw,file=", &nvram]);

    push(&[&"-drive"]);
    push(&[&"file=", &disk, &",if=none,id=disk0,format=raw,discard=unmap"]);
    push(&[&"-device"]);
    push(&[&"virtio-blk-pci,drive=disk0,bootindex=0"]);

    if let Some(secondary) = secondary_disk {
        push(&[&"-drive"]);
        push(&[&"file=", &secondary, &",if=none,id=disk1,format=raw"]);
        push(&[&"-device"]);
        push(&[&"virtio-blk-pci,drive=disk1"]);
    }

    let cdroms: Vec<&Path> = iso.into_iter().chain(cloud_init).collect();
    if !cdroms.is_empty() {
        push(&[&"-device"]);
        push(&[&"virtio-scsi-pci,id=scsi0"]);
        for (index, path) in cdroms.iter().enumerate() {
            push(&[&"-drive"]);
            push(&[
                &"file=",
                path,
                &format!(",if=none,id=cd{index},media=cdrom,readonly=on"),
            ]);
            push(&[&"-device"]);
            push(&[&format!("scsi-cd,drive=cd{index}")]);
        }
    }

    // NAT with the configured MAC; fall back to a fresh locally
    // administered one rather than refusing to boot.
    let mac = if crate::util::is_valid_mac_address(&config.mac_address) {
        config.mac_address.clone()
    } else {
        tracing::warn!(mac = %config.mac_address, "invalid MAC, generating a new one");
        crate::util::generate_mac_address()
    };
    push(&[&"-netdev"]);
    push(&[&"user,id=net0"]);
    push(&[&"-device"]);
    push(&[&format!("virtio-net-pci,netdev=net0,mac={mac}")]);

    // Serial console rides the child's stdin/stdout.
    push(&[&"-serial"]);
    push(&[&"stdio"]);
    push(&[&"-monitor"]);
    push(&[&"none"]);
    push(&[&"-display"]);
    push(&[&"none"]);

    push(&[&"-qmp"]);
    push(&[&"unix:", &qmp_path, &",server=on,wait=off"]);

    push(&[&"-object"]);
    push(&[&"rng-random,filename=/dev/urandom,id=rng0"]);
    push(&[&"-device"]);
    push(&[&"virtio-rng-pci,rng=rng0"]);
    push(&[&"-device"]);
    push(&[&"virtio-balloon-pci"]);
    push(&[&"-device"]);
    push(&[&"virtio-keyboard-pci"]);
    push(&[&"-device"]);
    push(&[&"virtio-tablet-pci"]);

    if let Some(endpoint) = vsock {
        push(&[&"-device"]);
        push(&[&format!("vhost-vsock-pci,guest-cid={}", endpoint.cid)]);
    }

    if let Some(dir) = share_dir {
        push(&[&"-virtfs"]);
        push(&[
            &"local,path=",
            &dir,
            &format!(",mount_tag={SHARE_TAG},security_model=none"),
        ]);
    }

    args
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    config: EngineConfig,
    child_pid: Option<i32>,
    qmp: Option<QmpClient>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Starting);
        Self {
            config,
            child_pid: None,
            qmp: None,
            state_tx,
            state_rx,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn guest_agent_endpoint(&self) -> Option<VsockEndpoint> {
        self.config.vsock
    }

    /// Spawn the hypervisor, hand it the serial pipe ends, and bring up the
    /// QMP control connection.
    pub async fn start(&mut self) -> Result<(), RunnerError> {
        if self.child_pid.is_some() {
            return Err(RunnerError::AlreadyRunning(self.config.vm_name.clone()));
        }
        let (serial_in, serial_out) = self
            .config
            .serial
            .take()
            .ok_or_else(|| RunnerError::RuntimeError("engine already consumed".into()))?;

        let mut command = tokio::process::Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::from(serial_in))
            .stdout(Stdio::from(serial_out))
            .stderr(Stdio::null());

        tracing::info!(
            program = %self.config.program.display(),
            vm = %self.config.vm_name,
            "starting hypervisor"
        );
        let mut child = command.spawn().map_err(|e| {
            RunnerError::BootError(format!(
                "failed to start {}: {e}",
                self.config.program.display()
            ))
        })?;
        self.state_tx.send_replace(EngineState::Starting);

        // The QMP socket appears shortly after exec; an early child exit
        // here means the configuration was unbootable.
        let deadline = Instant::now() + QMP_CONNECT_TIMEOUT;
        let qmp = loop {
            match QmpClient::connect(&self.config.qmp_path).await {
                Ok(qmp) => break qmp,
                Err(err) => {
                    if let Ok(Some(status)) = child.try_wait() {
                        self.state_tx.send_replace(EngineState::Error);
                        return Err(RunnerError::BootError(format!(
                            "hypervisor exited during startup ({status})"
                        )));
                    }
                    if Instant::now() >= deadline {
                        let _ = child.start_kill();
                        self.state_tx.send_replace(EngineState::Error);
                        return Err(RunnerError::BootError(format!(
                            "no QMP control socket after {}s: {err}",
                            QMP_CONNECT_TIMEOUT.as_secs()
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        };

        self.child_pid = child.id().map(|pid| pid as i32);
        self.qmp = Some(qmp);
        self.state_tx.send_replace(EngineState::Running);

        // Monitor task: owns the child, reaps it, and publishes the
        // terminal state the daemon's polling loop observes.
        let state_tx = self.state_tx.clone();
        let vm_name = self.config.vm_name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::info!(vm = %vm_name, "guest stopped");
                    state_tx.send_replace(EngineState::Stopped);
                }
                Ok(status) if status.code().is_none() => {
                    // Killed by signal: our own force stop.
                    tracing::info!(vm = %vm_name, %status, "hypervisor terminated");
                    state_tx.send_replace(EngineState::Stopped);
                }
                Ok(status) => {
                    tracing::error!(vm = %vm_name, %status, "hypervisor exited with error");
                    state_tx.send_replace(EngineState::Error);
                }
                Err(err) => {
                    tracing::error!(vm = %vm_name, %err, "failed to reap hypervisor");
                    state_tx.send_replace(EngineState::Error);
                }
            }
        });

        Ok(())
    }

    /// Graceful stop: ACPI powerdown via QMP, polled for up to 60 s, then
    /// forced.
    pub async fn stop(&mut self) -> Result<(), RunnerError> {
        if self.state().is_terminal() {
            return Ok(());
        }

        if let Some(qmp) = self.qmp.as_mut() {
            if let Err(err) = qmp.execute("system_powerdown").await {
                tracing::warn!(%err, "powerdown request failed");
            }
        }

        let deadline = Instant::now() + STOP_TIMEOUT;
        while Instant::now() < deadline {
            if self.state().is_terminal() {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        tracing::warn!(vm = %self.config.vm_name, "graceful stop timed out, forcing");
        self.force_stop().await
    }

    pub async fn force_stop(&mut self) -> Result<(), RunnerError> {
        let Some(pid) = self.child_pid else {
            self.state_tx.send_replace(EngineState::Stopped);
            return Ok(());
        };
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);

        // The monitor task flips the state once the child is reaped.
        for _ in 0..50 {
            if self.state().is_terminal() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(RunnerError::RuntimeError(format!(
            "hypervisor (pid {pid}) survived SIGKILL"
        )))
    }

    pub async fn pause(&mut self) -> Result<(), RunnerError> {
        if self.state() != EngineState::Running {
            return Err(RunnerError::RuntimeError("VM is not running".into()));
        }
        let qmp = self
            .qmp
            .as_mut()
            .ok_or_else(|| RunnerError::RuntimeError("no control connection".into()))?;
        qmp.execute("stop").await?;
        self.state_tx.send_replace(EngineState::Paused);
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<(), RunnerError> {
        if self.state() != EngineState::Paused {
            return Err(RunnerError::RuntimeError("VM is not paused".into()));
        }
        let qmp = self
            .qmp
            .as_mut()
            .ok_or_else(|| RunnerError::RuntimeError("no control connection".into()))?;
        qmp.execute("cont").await?;
        self.state_tx.send_replace(EngineState::Running);
        Ok(())
    }

    pub async fn wait_until_stopped(&mut self) {
        while !self.state().is_terminal() {
            if self.state_rx.changed().await.is_err() {
                break;
            }
        }
    }
}
