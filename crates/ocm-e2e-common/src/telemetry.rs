//! Logging initialization for the e2e harness
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a fmt
//! layer. Output is JSON when `OCM_E2E_LOG_FORMAT=json`, human readable
//! otherwise. Test binaries call [`init_logging`] from every test, so a
//! second call is a no-op.

use std::sync::OnceLock;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log format
pub const LOG_FORMAT_ENV: &str = "OCM_E2E_LOG_FORMAT";

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,ocm_e2e=debug,ocm_e2e_common=debug,kube=warn";

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, one line per event
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// Parse a format name; anything but `json` is pretty
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output format
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: std::env::var(LOG_FORMAT_ENV)
                .map(|s| LogFormat::parse(&s))
                .unwrap_or_default(),
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Initialize logging once per process.
///
/// Later calls return `Ok(())` without touching the installed subscriber.
pub fn init_logging(config: LogConfig) -> Result<(), TelemetryError> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_test_writer(),
            )
            .try_init(),
    };

    match result {
        Ok(()) => {
            let _ = INITIALIZED.set(());
            Ok(())
        }
        // Another subscriber is already global (e.g. installed by a test
        // framework); treat that the same as our own earlier init.
        Err(_) if tracing::dispatcher::has_been_set() => {
            let _ = INITIALIZED.set(());
            Ok(())
        }
        Err(e) => Err(TelemetryError::SubscriberInit(e.to_string())),
    }
}
