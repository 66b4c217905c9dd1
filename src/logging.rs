//! Logging utilities for the pipeline workers.

use log::LevelFilter;
use simplelog::{CombinedLogger, Config, SimpleLogger, WriteLogger};
use std::error::Error;
use std::fs::File;

static LOG_INITIALIZED: std::sync::Once = std::sync::Once::new();

/// Initialize logging to file (and to stderr in debug builds).
///
/// Idempotent via `Once`, append-mode file handle, `log` macros everywhere
/// downstream.
pub fn init_logging(data_dir: &std::path::Path) {
    LOG_INITIALIZED.call_once(|| {
        let log_path = data_dir.join("pipeline.log");

        let file_logger = File::options()
            .create(true)
            .append(true)
            .open(&log_path)
            .map(|log_file| WriteLogger::new(LevelFilter::Debug, Config::default(), log_file));

        let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = Vec::new();
        if let Ok(w) = file_logger {
            loggers.push(w);
        }
        if cfg!(debug_assertions) {
            loggers.push(SimpleLogger::new(LevelFilter::Info, Config::default()));
        }

        if let Err(e) = CombinedLogger::init(loggers) {
            eprintln!("failed to initialize logger: {}", e);
        } else {
            log::info!("=== recruit-pipeline logging initialized ===");
            log::info!("log file: {}", log_path.display());
        }
    });
}

/// Capture unexpected handler panics to a crash log before the worker
/// harness converts them into `ErrorKind::Logic`.
pub fn setup_panic_hook(data_dir: &std::path::Path) {
    let crash_log_path = data_dir.join("crash.log");
    std::panic::set_hook(Box::new(move |panic_info| {
        let panic_message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        let message = format!(
            "PANIC: {}\nLocation: {}\nTime: {}",
            panic_message,
            location,
            chrono::Utc::now().to_rfc3339()
        );

        log::error!("{}", message);
        eprintln!("{}", message);

        if let Ok(mut crash_log) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&crash_log_path)
        {
            use std::io::Write;
            let _ = writeln!(crash_log, "{}", message);
        }
    }));
}

/// Log a structured worker event: subject, correlation, attempt.
pub fn log_worker_event(
    event: &str,
    subject: &str,
    correlation_id: &str,
    attempt: u32,
    detail: &str,
) {
    log::info!(
        "[{}] subject={} correlationId={} attempt={} {}",
        event,
        subject,
        correlation_id,
        attempt,
        detail
    );
}

/// Log an error with its full source chain, bounded to avoid infinite loops
/// on a cyclic (buggy) `source()` implementation.
pub fn log_error_chain(context: &str, error: &dyn Error) {
    log::error!("[{}] error: {}", context, error);
    let mut current: Option<&dyn Error> = error.source();
    let mut depth = 0;
    while let Some(err) = current {
        log::error!("[{}] caused by ({}): {}", context, depth, err);
        current = err.source();
        depth += 1;
        if depth > 10 {
            log::warn!("[{}] error chain too deep, truncating", context);
            break;
        }
    }
}
