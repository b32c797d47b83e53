use std::path::PathBuf;

/// Root of all VM state: `~/.vm/`
pub fn vm_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".vm")
}

/// Per-VM directory: `~/.vm/<name>/`
pub fn vm_dir(name: &str) -> PathBuf {
    vm_root().join(name)
}

/// Persistent configuration for a VM.
pub fn config_path(name: &str) -> PathBuf {
    vm_dir(name).join("config.json")
}

/// Default primary disk image location inside the VM directory.
pub fn disk_path(name: &str) -> PathBuf {
    vm_dir(name).join("disk.img")
}

/// EFI variable store, created by the engine on first boot.
pub fn nvram_path(name: &str) -> PathBuf {
    vm_dir(name).join("nvram.bin")
}

/// Runtime rendezvous file: owning PID + start timestamp.
pub fn pid_path(name: &str) -> PathBuf {
    vm_dir(name).join("vm.pid")
}

/// Console multiplexer listening socket.
pub fn console_socket_path(name: &str) -> PathBuf {
    vm_dir(name).join("console.sock")
}

/// Last known guest network state, refreshed by the daemon.
pub fn network_info_path(name: &str) -> PathBuf {
    vm_dir(name).join("network-info.json")
}

/// Cloud-init NoCloud seed ISO.
pub fn cloud_init_iso_path(name: &str) -> PathBuf {
    vm_dir(name).join("cloud-init.iso")
}

/// Append-only daemon log.
pub fn log_path(name: &str) -> PathBuf {
    vm_dir(name).join("vm.log")
}

/// Per-VM OpenSSH config stanza.
pub fn ssh_config_path(name: &str) -> PathBuf {
    vm_dir(name).join("ssh_config")
}

/// QMP control socket for the engine's hypervisor process.
pub fn qmp_socket_path(name: &str) -> PathBuf {
    vm_dir(name).join("qmp.sock")
}

/// Marker recording which VM's disk the rescue VM currently holds.
pub fn rescue_target_path(name: &str) -> PathBuf {
    vm_dir(name).join("rescue-target")
}

/// Shared download cache for rescue images: `~/.vm/.cache/`
pub fn cache_dir() -> PathBuf {
    vm_root().join(".cache")
}
