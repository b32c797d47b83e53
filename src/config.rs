//! Persistent per-VM state: configuration, runtime rendezvous info, and the
//! guest network snapshot.
//!
//! Everything is JSON on disk. Encoding goes through `serde_json::Value`,
//! whose object representation is a BTreeMap, so keys come out sorted and
//! two encodings of the same value are byte-identical.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::ManagerError;
use crate::paths;
use crate::util;

/// Lower bound for guest memory.
pub const MIN_MEMORY_SIZE: u64 = 512 * 1024 * 1024;

/// Lower bound for the primary disk.
pub const MIN_DISK_SIZE: u64 = 1024 * 1024 * 1024;

// ── VM configuration ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub cpu_count: u32,
    /// Guest memory in bytes.
    pub memory_size: u64,
    /// Relative to the VM directory, or absolute (imported disks).
    pub disk_image_path: PathBuf,
    /// Virtual disk size in bytes.
    pub disk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_path: Option<PathBuf>,
    pub mac_address: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl VmConfig {
    pub fn new(name: &str, cpu_count: u32, memory_size: u64, disk_size: u64) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            cpu_count,
            memory_size,
            disk_image_path: PathBuf::from("disk.img"),
            disk_size,
            iso_path: None,
            mac_address: util::generate_mac_address(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Enforce the configuration invariants against host resources.
    pub fn validate(&self) -> Result<(), ManagerError> {
        crate::store::validate_vm_name(&self.name)?;

        let host_cpus = util::host_cpu_count();
        if self.cpu_count == 0 || self.cpu_count > host_cpus {
            return Err(ManagerError::ConfigurationError(format!(
                "cpu_count must be between 1 and {host_cpus} (host CPUs), got {}",
                self.cpu_count
            )));
        }

        let host_memory = util::host_memory_bytes();
        if self.memory_size < MIN_MEMORY_SIZE || self.memory_size > host_memory {
            return Err(ManagerError::ConfigurationError(format!(
                "memory_size must be between {} and {} (host memory), got {}",
                util::format_size(MIN_MEMORY_SIZE),
                util::format_size(host_memory),
                util::format_size(self.memory_size),
            )));
        }

        if self.disk_size < MIN_DISK_SIZE {
            return Err(ManagerError::ConfigurationError(format!(
                "disk_size must be at least {}, got {}",
                util::format_size(MIN_DISK_SIZE),
                util::format_size(self.disk_size),
            )));
        }

        if !util::is_valid_mac_address(&self.mac_address) {
            return Err(ManagerError::ConfigurationError(format!(
                "invalid MAC address '{}'",
                self.mac_address
            )));
        }

        Ok(())
    }

    /// Absolute path of the primary disk image.
    pub fn resolved_disk_path(&self) -> PathBuf {
        if self.disk_image_path.is_absolute() {
            self.disk_image_path.clone()
        } else {
            paths::vm_dir(&self.name).join(&self.disk_image_path)
        }
    }
}

// ── Runtime rendezvous info (vm.pid) ─────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub pid: i32,
    pub started_at: DateTime<Utc>,
}

// ── Guest network state (network-info.json) ──────────────

/// One address on a guest interface. Kebab-case keys match the guest agent
/// wire format, so the same types decode agent responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpAddress {
    pub ip_address_type: String,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_address: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<IpAddress>,
}

/// The kebab-case key set is confined to the interface entries (the agent
/// wire format); `queried_at` follows the snake_case convention of the
/// other top-level on-disk types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub interfaces: Vec<NetworkInterface>,
    pub queried_at: DateTime<Utc>,
}

impl NetworkInfo {
    /// First IPv4 address of the first non-loopback interface.
    pub fn primary_ipv4(&self) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|iface| iface.name != "lo" && !iface.ip_addresses.is_empty())
            .and_then(|iface| {
                iface
                    .ip_addresses
                    .iter()
                    .find(|addr| addr.ip_address_type == "ipv4")
            })
            .map(|addr| addr.ip_address.as_str())
    }
}

// ── VM start options (ephemeral) ─────────────────────────

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub attach_iso: bool,
    pub secondary_disk: Option<PathBuf>,
    pub enable_guest_agent: bool,
    pub enable_directory_sharing: bool,
}

impl StartOptions {
    pub fn normal(attach_iso: bool) -> Self {
        Self {
            attach_iso,
            secondary_disk: None,
            enable_guest_agent: true,
            enable_directory_sharing: true,
        }
    }

    /// Rescue preset: the target VM's disk rides along as the secondary
    /// device; no install ISO, no agent, no host share.
    pub fn rescue(target_disk: PathBuf) -> Self {
        Self {
            attach_iso: false,
            secondary_disk: Some(target_disk),
            enable_guest_agent: false,
            enable_directory_sharing: false,
        }
    }
}

// ── JSON I/O ─────────────────────────────────────────────

/// Encode with sorted keys and a trailing newline; byte-stable for equal
/// values.
pub fn encode_stable<T: Serialize>(value: &T) -> Result<String, ManagerError> {
    let value = serde_json::to_value(value)
        .map_err(|e| ManagerError::ConfigurationError(format!("failed to encode: {e}")))?;
    let mut out = serde_json::to_string_pretty(&value)
        .map_err(|e| ManagerError::ConfigurationError(format!("failed to encode: {e}")))?;
    out.push('\n');
    Ok(out)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ManagerError> {
    let encoded = encode_stable(value)?;
    std::fs::write(path, encoded).map_err(|e| ManagerError::FileSystemError {
        context: format!("writing {}", path.display()),
        source: e,
    })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ManagerError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ManagerError::FileSystemError {
        context: format!("reading {}", path.display()),
        source: e,
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        ManagerError::ConfigurationError(format!("failed to parse {}: {e}", path.display()))
    })
}
