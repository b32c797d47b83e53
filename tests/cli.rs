use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

/// Every test gets its own `$HOME`, so the VM store lands in a tempdir.
fn vm(home: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("vm").into();
    cmd.env("HOME", home.path());
    cmd
}

fn create_small_vm(home: &tempfile::TempDir, name: &str) {
    vm(home)
        .args([
            "create", name, "--cpus", "1", "--memory", "1G", "--disk-size", "2G",
        ])
        .assert()
        .success();
}

fn vm_dir(home: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    home.path().join(".vm").join(name)
}

#[test]
fn help_works() {
    let home = tempfile::tempdir().unwrap();
    vm(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Manage Linux virtual machines"));
}

#[test]
fn create_lays_out_the_store() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");

    let dir = vm_dir(&home, "ubuntu");
    assert!(dir.join("config.json").exists());
    assert!(dir.join("cloud-init.iso").exists());
    assert!(dir.join("ssh_config").exists());
    assert_eq!(
        std::fs::metadata(dir.join("disk.img")).unwrap().len(),
        2 * 1024 * 1024 * 1024
    );

    let config = std::fs::read_to_string(dir.join("config.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert_eq!(parsed["name"], "ubuntu");
    assert_eq!(parsed["cpu_count"], 1);
    assert_eq!(parsed["disk_size"], 2u64 * 1024 * 1024 * 1024);
}

#[test]
fn list_reports_created_vm_as_stopped() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");

    let output = vm(&home)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let items: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["name"], "ubuntu");
    assert_eq!(items[0]["status"], "stopped");
}

#[test]
fn list_empty_store() {
    let home = tempfile::tempdir().unwrap();
    vm(&home)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No VMs"));
}

#[test]
fn invalid_names_are_rejected() {
    let home = tempfile::tempdir().unwrap();
    for bad in ["bad/name", "_leading", "has space"] {
        vm(&home)
            .args(["create", bad])
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid VM name"));
    }
}

#[test]
fn reserved_rescue_name_is_refused() {
    let home = tempfile::tempdir().unwrap();
    vm(&home)
        .args(["create", "rescue", "--disk-size", "2G", "--memory", "1G", "--cpus", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid VM name"));
}

#[test]
fn duplicate_create_fails() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");
    vm(&home)
        .args(["create", "ubuntu", "--cpus", "1", "--memory", "1G", "--disk-size", "2G"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn info_unknown_vm_fails() {
    let home = tempfile::tempdir().unwrap();
    vm(&home)
        .args(["info", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn info_json_includes_status() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");

    let output = vm(&home)
        .args(["info", "ubuntu", "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(parsed["status"], "stopped");
    assert_eq!(parsed["cpu_count"], 1);
    assert!(parsed["mac_address"].as_str().unwrap().len() == 17);
}

#[test]
fn resize_only_grows() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");

    vm(&home)
        .args(["resize", "ubuntu", "--size", "1G"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("must be larger"));

    vm(&home)
        .args(["resize", "ubuntu", "--size", "3G"])
        .assert()
        .success();

    let dir = vm_dir(&home, "ubuntu");
    assert_eq!(
        std::fs::metadata(dir.join("disk.img")).unwrap().len(),
        3 * 1024 * 1024 * 1024
    );
    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join("config.json")).unwrap()).unwrap();
    assert_eq!(config["disk_size"], 3u64 * 1024 * 1024 * 1024);
}

#[test]
fn edit_updates_configuration() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");

    vm(&home)
        .args(["edit", "ubuntu", "--memory", "2G"])
        .assert()
        .success();

    let config: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(vm_dir(&home, "ubuntu").join("config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(config["memory_size"], 2u64 * 1024 * 1024 * 1024);
}

#[test]
fn edit_without_changes_fails() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");
    vm(&home)
        .args(["edit", "ubuntu"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nothing to change"));
}

#[test]
fn delete_force_removes_everything() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");
    assert!(vm_dir(&home, "ubuntu").exists());

    vm(&home)
        .args(["delete", "ubuntu", "--force"])
        .assert()
        .success();
    assert!(!vm_dir(&home, "ubuntu").exists());
}

#[test]
fn delete_refuses_running_vm() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");

    // Fake a live daemon with a process we control.
    let mut sleeper = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let pid_file = vm_dir(&home, "ubuntu").join("vm.pid");
    std::fs::write(
        &pid_file,
        format!(
            "{{\"pid\": {}, \"started_at\": \"2026-01-01T00:00:00Z\"}}\n",
            sleeper.id()
        ),
    )
    .unwrap();

    vm(&home)
        .args(["delete", "ubuntu", "--force"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("currently running"));
    assert!(vm_dir(&home, "ubuntu").exists());

    sleeper.kill().unwrap();
    sleeper.wait().unwrap();
}

#[test]
fn stale_pid_file_reads_as_stopped_and_is_pruned() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");

    let pid_file = vm_dir(&home, "ubuntu").join("vm.pid");
    std::fs::write(
        &pid_file,
        "{\"pid\": 67108863, \"started_at\": \"2026-01-01T00:00:00Z\"}\n",
    )
    .unwrap();

    vm(&home)
        .args(["info", "ubuntu"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped"));
    assert!(!pid_file.exists(), "stale vm.pid should be pruned");
}

#[test]
fn stop_when_not_running_is_a_no_op() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");
    vm(&home)
        .args(["stop", "ubuntu"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));
}

#[test]
fn attach_requires_a_running_vm() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");
    vm(&home)
        .args(["attach", "ubuntu"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not running"));
}

#[test]
fn ip_without_network_info_fails() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");
    vm(&home)
        .args(["ip", "ubuntu"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no known address"));
}

#[test]
fn ip_prints_bare_address_from_network_info() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");

    std::fs::write(
        vm_dir(&home, "ubuntu").join("network-info.json"),
        r#"{
  "interfaces": [
    {
      "name": "enp0s1",
      "hardware-address": "06:12:34:56:78:9a",
      "ip-addresses": [
        {"ip-address-type": "ipv4", "ip-address": "192.168.64.7", "prefix": 24}
      ]
    }
  ],
  "queried_at": "2026-01-01T00:00:00Z"
}"#,
    )
    .unwrap();

    vm(&home)
        .args(["ip", "ubuntu"])
        .assert()
        .success()
        .stdout(predicate::eq("192.168.64.7"));
}

#[test]
fn import_links_disk_in_place() {
    let home = tempfile::tempdir().unwrap();
    let source = home.path().join("external.img");
    let file = std::fs::File::create(&source).unwrap();
    file.set_len(2 * 1024 * 1024 * 1024).unwrap();

    vm(&home)
        .args([
            "import", "imported", "--disk",
            source.to_str().unwrap(),
            "--cpus", "1", "--memory", "1G",
        ])
        .assert()
        .success();

    let disk = vm_dir(&home, "imported").join("disk.img");
    assert!(std::fs::symlink_metadata(&disk).unwrap().is_symlink());

    let config: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(vm_dir(&home, "imported").join("config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(config["disk_size"], 2u64 * 1024 * 1024 * 1024);
}

#[test]
fn start_unknown_vm_fails() {
    let home = tempfile::tempdir().unwrap();
    vm(&home)
        .args(["start", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn run_daemon_rejects_rescue_flags_for_normal_vms() {
    let home = tempfile::tempdir().unwrap();
    create_small_vm(&home, "ubuntu");
    vm(&home)
        .args(["run-daemon", "ubuntu", "--rescue", "--target-disk", "/dev/null"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("rescue"));
}
