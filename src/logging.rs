//! Logging infrastructure - structured tracing throughout the heap
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels via `REFCYCLE_LOG_*` or `RUST_LOG`
//! - Zero-cost when disabled
//! - Span-based performance tracking
//! - Console or file output, human-readable or JSON
//!
//! The library only emits events; installing a subscriber is the embedder's call.

use once_cell::sync::OnceCell;
use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

pub use tracing::{debug, error, info, trace, warn, Level};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<PathBuf>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // REFCYCLE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("REFCYCLE_LOG_LEVEL") {
            config.level = parse_level(&level_str).unwrap_or(Level::INFO);
        }

        // REFCYCLE_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("REFCYCLE_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(PathBuf::from(path));
        }

        config.json_format = std::env::var("REFCYCLE_LOG_JSON").is_ok();
        config.show_spans = std::env::var("REFCYCLE_LOG_SPANS").is_ok();

        config
    }

    /// Errors only
    pub fn quiet() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Every reclamation and phase, with span timings
    pub fn verbose() -> Self {
        Self {
            level: Level::TRACE,
            show_spans: true,
            ..Self::default()
        }
    }
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration (first call wins)
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("refcycle={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let writer = match (&config.file_output, &config.log_path) {
            (true, Some(path)) => file_writer(path),
            _ => BoxMakeWriter::new(io::stderr),
        };

        let registry = tracing_subscriber::registry().with(env_filter);

        // Another subscriber may already be installed (tests, embedders)
        let _ = if config.json_format {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_span_events(span_events)
                        .with_target(true),
                )
                .try_init()
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_span_events(span_events)
                        .with_target(true)
                        .with_line_number(cfg!(debug_assertions)),
                )
                .try_init()
        };
    });
}

fn file_writer(path: &Path) -> BoxMakeWriter {
    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "refcycle.log".into());

    BoxMakeWriter::new(tracing_appender::rolling::never(directory, file_name))
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Heap-specific logging functions
// ============================================================================

/// Log collection pass start
pub fn log_gc_start(generation: usize, candidates: usize) {
    debug!(
        event = "gc_start",
        generation,
        candidates,
        "Starting cycle collection pass"
    );
}

/// Log trial-deletion result
pub fn log_gc_mark(reachable: usize) {
    debug!(
        event = "gc_mark",
        objects_reachable = reachable,
        "GC mark phase complete"
    );
}

/// Log disposal of unreachable objects
pub fn log_gc_sweep(swept: usize) {
    debug!(
        event = "gc_sweep",
        objects_swept = swept,
        "GC sweep phase complete"
    );
}

/// Log collection pass completion
pub fn log_gc_complete(generation: usize, duration_us: u64, collected: usize, live: usize) {
    info!(
        event = "gc_complete",
        generation,
        objects_collected = collected,
        live_objects = live,
        duration_us,
        "Cycle collection pass complete"
    );
}

/// Log automatic trigger
pub fn log_threshold_exceeded(count: usize, threshold: usize, generation: usize) {
    debug!(
        event = "gc_threshold",
        count,
        threshold,
        generation,
        "GC threshold exceeded, starting collection"
    );
}

/// Log a single reclaimed object
#[inline]
pub fn log_reclaim(object: impl Display, reason: &str) {
    trace!(
        event = "reclaim",
        object = %object,
        reason,
        "Object reclaimed"
    );
}

/// Log a finalizer that returned an error or panicked
pub fn log_finalizer_failure(object: impl Display, message: &str) {
    warn!(
        event = "finalizer_failed",
        object = %object,
        error = message,
        "Finalizer failed"
    );
}

/// Log a batch withheld from reclamation
pub fn log_uncollectable(objects: usize, reason: &str) {
    warn!(
        event = "uncollectable",
        objects,
        reason,
        "Batch retained in garbage list"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl PerformanceGuard {
        pub fn elapsed_us(&self) -> u64 {
            self.start.elapsed().as_micros() as u64
        }
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            debug!(
                operation = self.operation,
                duration_us = self.elapsed_us(),
                "operation completed"
            );
        }
    }
}
