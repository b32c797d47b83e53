use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "vm", about = "Manage Linux virtual machines on QEMU/KVM", version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new VM
    Create {
        name: String,

        /// Installer ISO to keep attached to the VM
        #[arg(long)]
        iso: Option<PathBuf>,

        /// Primary disk size (e.g. 64G)
        #[arg(long, default_value = "64G")]
        disk_size: String,

        /// Number of virtual CPUs
        #[arg(long, default_value_t = 2)]
        cpus: u32,

        /// Guest memory (e.g. 4G)
        #[arg(long, default_value = "4G")]
        memory: String,

        /// Boot the VM and attach the console right away
        #[arg(long)]
        interactive: bool,
    },

    /// Import an existing raw disk image as a VM
    Import {
        name: String,

        /// Disk image to import
        #[arg(long)]
        disk: PathBuf,

        /// Copy the image into the VM directory instead of linking it
        #[arg(long)]
        copy: bool,

        /// Number of virtual CPUs
        #[arg(long, default_value_t = 2)]
        cpus: u32,

        /// Guest memory (e.g. 4G)
        #[arg(long, default_value = "4G")]
        memory: String,

        /// Virtual disk size; defaults to the image size
        #[arg(long)]
        size: Option<String>,
    },

    /// Start a VM in the background
    Start {
        name: String,

        /// Attach the console once the VM is up
        #[arg(short, long)]
        interactive: bool,

        /// Boot with the configured ISO attached
        #[arg(long)]
        iso: bool,
    },

    /// Stop a running VM
    Stop {
        name: String,

        /// Kill the VM immediately instead of shutting down gracefully
        #[arg(short, long)]
        force: bool,
    },

    /// Attach to a VM's serial console (Ctrl-] detaches)
    #[command(visible_alias = "console")]
    Attach { name: String },

    /// Open an SSH session to a VM
    Ssh {
        name: String,

        /// Remote user
        #[arg(short = 'l', long)]
        user: Option<String>,

        /// Remote port
        #[arg(short, long)]
        port: Option<u16>,

        /// Extra arguments passed to ssh
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print a VM's primary IP address
    #[command(hide = true)]
    Ip { name: String },

    /// Show a VM's configuration and state
    Info {
        name: String,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List VMs
    List {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Change a VM's CPU or memory allocation
    Edit {
        name: String,

        #[arg(long)]
        cpus: Option<u32>,

        /// Guest memory (e.g. 8G)
        #[arg(long)]
        memory: Option<String>,
    },

    /// Grow a VM's disk
    Resize {
        name: String,

        /// New disk size (e.g. 128G); must be larger than the current size
        #[arg(long)]
        size: String,
    },

    /// Delete a VM and all of its data
    Delete {
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Boot the rescue VM with a target VM's disk attached
    Rescue {
        name: String,

        /// Re-download the rescue image even if cached
        #[arg(long)]
        force_download: bool,

        /// Fail instead of downloading when the cache is empty
        #[arg(long)]
        offline: bool,
    },

    /// Run the VM daemon (launched internally by start)
    #[command(hide = true)]
    RunDaemon {
        name: String,

        #[arg(long)]
        iso: bool,

        #[arg(long)]
        rescue: bool,

        #[arg(long, requires = "rescue")]
        target_disk: Option<PathBuf>,
    },
}
