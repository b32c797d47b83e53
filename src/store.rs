//! On-disk VM store: directory lifecycle, configuration I/O, and the
//! runtime rendezvous files other processes read as advisory state.

use std::path::Path;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::config::{self, NetworkInfo, RuntimeInfo, VmConfig};
use crate::error::ManagerError;
use crate::paths;

/// Reserved name for the auxiliary rescue VM. Valid per the name rules but
/// refused for user VMs and hidden from listings.
pub const RESCUE_VM_NAME: &str = "rescue";

/// Accept names matching `^[A-Za-z0-9][A-Za-z0-9_-]*$`.
pub fn validate_vm_name(name: &str) -> Result<(), ManagerError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ManagerError::InvalidVmName(name.to_string()))
    }
}

// ── Configuration ────────────────────────────────────────

pub fn load_configuration(name: &str) -> Result<VmConfig, ManagerError> {
    validate_vm_name(name)?;
    let path = paths::config_path(name);
    if !path.exists() {
        return Err(ManagerError::VmNotFound(name.to_string()));
    }
    config::read_json(&path)
}

/// Persist a configuration, bumping `modified_at` first.
pub fn save_configuration(config: &mut VmConfig) -> Result<(), ManagerError> {
    validate_vm_name(&config.name)?;
    config.modified_at = chrono::Utc::now();
    config::write_json(&paths::config_path(&config.name), config)
}

/// Register a new VM: the directory must not pre-exist.
pub fn create_vm(config: &VmConfig) -> Result<(), ManagerError> {
    validate_vm_name(&config.name)?;
    if config.name == RESCUE_VM_NAME {
        return Err(ManagerError::InvalidVmName(config.name.clone()));
    }
    let dir = paths::vm_dir(&config.name);
    if dir.exists() {
        return Err(ManagerError::VmAlreadyExists(config.name.clone()));
    }
    std::fs::create_dir_all(&dir).map_err(|e| ManagerError::FileSystemError {
        context: format!("creating {}", dir.display()),
        source: e,
    })?;
    config::write_json(&paths::config_path(&config.name), config)
}

/// Remove a VM and all its state. Refuses while the daemon is alive.
pub fn delete_vm(name: &str) -> Result<(), ManagerError> {
    validate_vm_name(name)?;
    let dir = paths::vm_dir(name);
    if !dir.exists() {
        return Err(ManagerError::VmNotFound(name.to_string()));
    }
    if running_pid(name).is_some() {
        return Err(ManagerError::ConfigurationError(format!(
            "VM '{name}' is currently running; stop it first"
        )));
    }
    std::fs::remove_dir_all(&dir).map_err(|e| ManagerError::FileSystemError {
        context: format!("removing {}", dir.display()),
        source: e,
    })
}

/// Names of all VMs with a configuration, sorted, rescue VM excluded.
pub fn list_vms() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(paths::vm_root()) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            if name == RESCUE_VM_NAME {
                return None;
            }
            e.path().join("config.json").exists().then_some(name)
        })
        .collect();
    names.sort();
    names
}

// ── Runtime info ─────────────────────────────────────────

pub fn save_runtime_info(name: &str, info: &RuntimeInfo) -> Result<(), ManagerError> {
    config::write_json(&paths::pid_path(name), info)
}

pub fn clear_runtime_info(name: &str) {
    let _ = std::fs::remove_file(paths::pid_path(name));
}

/// PID of the daemon owning this VM, if it is alive.
///
/// Liveness is established with signal 0; a stale `vm.pid` whose process is
/// gone is pruned here.
pub fn running_pid(name: &str) -> Option<i32> {
    running_pid_at(&paths::pid_path(name))
}

pub(crate) fn running_pid_at(pid_path: &Path) -> Option<i32> {
    let info: RuntimeInfo = config::read_json(pid_path).ok()?;
    // EPERM still means the process exists; only ESRCH marks it gone.
    match kill(Pid::from_raw(info.pid), None) {
        Ok(()) => Some(info.pid),
        Err(nix::errno::Errno::EPERM) => Some(info.pid),
        Err(_) => {
            let _ = std::fs::remove_file(pid_path);
            None
        }
    }
}

// ── Network info ─────────────────────────────────────────

pub fn save_network_info(name: &str, info: &NetworkInfo) -> Result<(), ManagerError> {
    config::write_json(&paths::network_info_path(name), info)
}

pub fn load_network_info(name: &str) -> Option<NetworkInfo> {
    config::read_json(&paths::network_info_path(name)).ok()
}

pub fn clear_network_info(name: &str) {
    let _ = std::fs::remove_file(paths::network_info_path(name));
}
