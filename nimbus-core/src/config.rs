//! Resolved runtime configuration.
//!
//! Loading and validating configuration files happens outside the core; the
//! emulator receives an already-resolved [`EmulatorConfig`]. `init_logging`
//! must run before any provider starts so early startup messages are not
//! lost.

use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// The knobs the emulator recognizes.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Primary listening port. Per-service surfaces are allocated upward
    /// from here.
    pub port: u16,
    /// Whether state survives restarts.
    pub persist: bool,
    /// Location for persisted state.
    pub data_dir: PathBuf,
    /// Threshold for log emission (an `EnvFilter` directive).
    pub log_level: String,
    /// Glob lists for the optional re-synth watcher. Carried through for the
    /// watcher layer; unused by the core.
    pub watch_include: Vec<String>,
    pub watch_exclude: Vec<String>,
    /// Artificial delay before stream dispatch, emulating eventual
    /// consistency.
    pub eventual_consistency_delay: Duration,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            port: 4600,
            persist: true,
            data_dir: PathBuf::from(".nimbus"),
            log_level: "info".to_string(),
            watch_include: Vec::new(),
            watch_exclude: Vec::new(),
            eventual_consistency_delay: Duration::ZERO,
        }
    }
}

impl EmulatorConfig {
    /// Root of the object-store tree.
    pub fn object_dir(&self) -> PathBuf {
        self.data_dir.join("obj")
    }

    /// Root of the key-value store databases.
    pub fn kv_dir(&self) -> PathBuf {
        self.data_dir.join("kv")
    }

    /// Root of the queue snapshot databases.
    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }
}

/// Install the global tracing subscriber using the configured level.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
