//! Common test utilities: tracing setup for integration tests.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... test code with tracing::info!, tracing::debug!, etc.
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: filter directives (e.g., `duraset=debug`)
//! - `DURASET_LOG_DIR`: log directory (default: `logs/`)
//! - `DURASET_LOG_CONSOLE`: set to "0" to disable console output

#![allow(dead_code)]

use std::env;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber with file and console logging.
///
/// Safe to call multiple times - only the first call takes effect. Logs
/// are written to `logs/duraset.json` as NDJSON.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

/// Configuration for tracing setup.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Directory for log files.
    pub log_dir: PathBuf,
    /// Log file name.
    pub log_file: String,
    /// Enable console output.
    pub console_enabled: bool,
    /// Default log level if `RUST_LOG` is not set.
    pub default_level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_file: "duraset.json".to_string(),
            console_enabled: true,
            default_level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("DURASET_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if env::var("DURASET_LOG_CONSOLE").is_ok_and(|v| v == "0") {
            config.console_enabled = false;
        }
        config
    }
}

/// Create an `EnvFilter` from `RUST_LOG` or use the default level.
fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

#[expect(clippy::expect_used)]
fn setup_tracing() {
    let config = TracingConfig::from_env();

    std::fs::create_dir_all(&config.log_dir).expect("Failed to create log directory");
    let log_path = config.log_dir.join(&config.log_file);

    // Leaked to get the 'static lifetime the writer closure needs.
    let file: &'static Mutex<File> = Box::leak(Box::new(Mutex::new(
        File::create(log_path).expect("Failed to create log file"),
    )));

    let console_layer = config.console_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_target(true)
            .compact()
            .with_filter(make_filter(config.default_level))
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(move || {
            struct Guarded(&'static Mutex<File>);
            impl std::io::Write for Guarded {
                fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                    self.0.lock().map_or_else(
                        |_| Ok(buf.len()),
                        |mut file| std::io::Write::write(&mut *file, buf),
                    )
                }
                fn flush(&mut self) -> std::io::Result<()> {
                    Ok(())
                }
            }
            Guarded(file)
        })
        .with_thread_ids(true)
        .json()
        .with_filter(make_filter(config.default_level));

    // try_init so a second harness in the same process does not panic.
    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
