//! Tracing setup shared by the foreground commands and the daemon.
//!
//! The subscriber is installed once at program start, before the VM name
//! (and therefore the log file path) is known. Daemon startup activates the
//! per-VM `vm.log` through the [`LogContext`] handle; until then file
//! output is discarded and only stderr receives events.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable controlling the log level.
pub const LOG_LEVEL_ENV: &str = "VM_LOG_LEVEL";

// ── Process-wide log context ─────────────────────────────

/// Handle for routing log output to a per-VM file after the subscriber is
/// already installed.
#[derive(Clone)]
pub struct LogContext {
    inner: Arc<Mutex<Option<File>>>,
}

impl LogContext {
    /// Open `path` in append mode and start mirroring log events into it.
    pub fn activate_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.inner.lock().unwrap() = Some(file);
        Ok(())
    }
}

/// `MakeWriter` that discards until the context is activated.
#[derive(Clone)]
struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        match guard.as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        match guard.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── Subscriber installation ──────────────────────────────

/// Map a `VM_LOG_LEVEL` value onto a tracing level directive.
fn level_directive(value: &str) -> &'static str {
    match value.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" | "notice" => "info",
        "warning" => "warn",
        "error" => "error",
        "critical" => "error",
        _ => "info",
    }
}

/// Install the global subscriber: stderr plus a deferred per-VM file.
///
/// The level is read from `VM_LOG_LEVEL` once, here, when the first handler
/// is created. Returns the context used to activate file output later.
pub fn init(verbose: bool) -> LogContext {
    let level = if verbose {
        "debug"
    } else {
        match std::env::var(LOG_LEVEL_ENV) {
            Ok(v) => level_directive(&v),
            Err(_) => "info",
        }
    };

    let inner: Arc<Mutex<Option<File>>> = Arc::new(Mutex::new(None));
    let file_writer = DeferredFileWriter {
        inner: inner.clone(),
    };

    let filter = EnvFilter::new(format!("vm={level}"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    LogContext { inner }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping_covers_all_documented_values() {
        assert_eq!(level_directive("trace"), "trace");
        assert_eq!(level_directive("debug"), "debug");
        assert_eq!(level_directive("info"), "info");
        assert_eq!(level_directive("notice"), "info");
        assert_eq!(level_directive("warning"), "warn");
        assert_eq!(level_directive("error"), "error");
        assert_eq!(level_directive("critical"), "error");
        assert_eq!(level_directive("bogus"), "info");
        assert_eq!(level_directive("DEBUG"), "debug");
    }

    #[test]
    fn deferred_writer_discards_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.log");

        let inner: Arc<Mutex<Option<File>>> = Arc::new(Mutex::new(None));
        let writer = DeferredFileWriter {
            inner: inner.clone(),
        };
        let ctx = LogContext {
            inner: inner.clone(),
        };

        writer.make_writer().write_all(b"dropped\n").unwrap();
        assert!(!path.exists());

        ctx.activate_file(&path).unwrap();
        writer.make_writer().write_all(b"kept\n").unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "kept\n");
    }
}
