//! Cloud-init NoCloud seed generation.
//!
//! The seed provisions a default user, installs the guest agent, and points
//! it at the vsock port the daemon polls. `#cloud-config` documents are
//! emitted as JSON (a YAML subset), which keeps the assembly in `serde_json`
//! instead of string templating.

use std::path::Path;

use serde_json::json;

use crate::error::CloudInitError;
use crate::iso9660::{self, SeedFile};

/// Default guest account provisioned at first boot.
pub const GUEST_USER: &str = "vm";

/// Systemd unit that exposes the QEMU guest agent on the vsock port the
/// daemon queries (guest CID 3, port 9001).
const AGENT_UNIT: &str = "\
[Unit]
Description=VM manager guest agent
After=network.target

[Service]
ExecStart=/usr/bin/qemu-ga --method=vsock-listen --path=3:9001
Restart=always
RestartSec=2

[Install]
WantedBy=multi-user.target
";

/// Serial getty autologin so `vm attach` lands in a shell without a
/// password prompt on fresh images.
const AUTOLOGIN_DROPIN: &str = "\
[Service]
ExecStart=
ExecStart=-/sbin/agetty --autologin vm --noclear --keep-baud 115200,38400,9600 %I $TERM
";

fn meta_data(hostname: &str) -> String {
    format!("instance-id: {hostname}\nlocal-hostname: {hostname}\n")
}

fn network_config() -> &'static str {
    // NoCloud network config v2; the file itself is the config (no outer
    // "network:" wrapper).
    "version: 2\nethernets:\n  primary:\n    match:\n      name: \"en*\"\n    dhcp4: true\n"
}

fn user_data(hostname: &str, ssh_keys: &[String]) -> String {
    let doc = json!({
        "hostname": hostname,
        "users": [{
            "name": GUEST_USER,
            "plain_text_passwd": GUEST_USER,
            "lock_passwd": false,
            "shell": "/bin/bash",
            "sudo": "ALL=(ALL) NOPASSWD:ALL",
            "ssh_authorized_keys": ssh_keys,
        }],
        "packages": ["qemu-guest-agent"],
        "write_files": [
            {
                "path": "/etc/systemd/system/vm-guest-agent.service",
                "content": AGENT_UNIT,
            },
            {
                "path": "/etc/systemd/system/serial-getty@ttyS0.service.d/autologin.conf",
                "content": AUTOLOGIN_DROPIN,
            },
        ],
        "runcmd": [
            ["systemctl", "daemon-reload"],
            ["systemctl", "enable", "--now", "vm-guest-agent.service"],
            ["systemctl", "restart", "serial-getty@ttyS0.service"],
        ],
    });

    // JSON is valid YAML, so the cloud-config header is all that's needed.
    format!(
        "#cloud-config\n{}\n",
        serde_json::to_string_pretty(&doc).expect("static document encodes")
    )
}

/// Public keys from `~/.ssh/*.pub`, if any, for password-less `vm ssh`.
pub fn host_ssh_keys() -> Vec<String> {
    let Some(ssh_dir) = dirs::home_dir().map(|h| h.join(".ssh")) else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(&ssh_dir) else {
        return Vec::new();
    };

    let mut keys: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "pub"))
        .filter_map(|e| std::fs::read_to_string(e.path()).ok())
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    keys.sort();
    keys
}

/// Write the `cloud-init.iso` seed for a VM.
pub fn generate_seed_iso(
    iso_path: &Path,
    hostname: &str,
    ssh_keys: &[String],
) -> Result<(), CloudInitError> {
    let meta = meta_data(hostname);
    let user = user_data(hostname, ssh_keys);
    let network = network_config();

    let image = iso9660::build(
        "CIDATA",
        &[
            SeedFile {
                name: "meta-data",
                contents: meta.as_bytes(),
            },
            SeedFile {
                name: "user-data",
                contents: user.as_bytes(),
            },
            SeedFile {
                name: "network-config",
                contents: network.as_bytes(),
            },
        ],
    )?;

    std::fs::write(iso_path, &image).map_err(|e| CloudInitError::WriteFailed {
        path: iso_path.to_path_buf(),
        source: e,
    })?;

    tracing::info!(path = %iso_path.display(), "generated cloud-init seed ISO");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_is_cloud_config_with_agent_provisioning() {
        let doc = user_data("ubuntu", &["ssh-ed25519 AAAA test@host".into()]);
        assert!(doc.starts_with("#cloud-config\n"));
        assert!(doc.contains("qemu-guest-agent"));
        assert!(doc.contains("vsock-listen"));
        assert!(doc.contains("ssh-ed25519 AAAA test@host"));

        // The body after the header must parse as a mapping.
        let body: serde_json::Value = serde_json::from_str(&doc["#cloud-config\n".len()..]).unwrap();
        assert_eq!(body["users"][0]["name"], GUEST_USER);
    }

    #[test]
    fn meta_data_names_the_instance() {
        let meta = meta_data("web-01");
        assert!(meta.contains("instance-id: web-01"));
        assert!(meta.contains("local-hostname: web-01"));
    }

    #[test]
    fn seed_iso_is_written_and_labelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud-init.iso");
        generate_seed_iso(&path, "testvm", &[]).unwrap();

        let image = std::fs::read(&path).unwrap();
        assert_eq!(&image[16 * 2048 + 40..16 * 2048 + 46], b"CIDATA");
        assert!(image.windows(9).any(|w| w == b"meta-data"));
    }
}
