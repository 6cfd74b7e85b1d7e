//! Logger routing records to the TUI log panel.
//!
//! Outside the TUI `env_logger` writes to stderr instead.

use log::{Level, LevelFilter, Metadata, Record};

/// Sends every record to the TUI event channel.
pub struct TuiLogger;

impl log::Log for TuiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        if record.level() == Level::Error {
            super::send_tui_event(super::TuiEvent::Error(message));
        } else {
            super::send_tui_event(super::TuiEvent::Log {
                level: record.level(),
                message,
            });
        }
    }

    fn flush(&self) {}
}

static TUI_LOGGER: TuiLogger = TuiLogger;

/// Level from `RUST_LOG`, Info if unset or not a plain level.
fn default_level() -> LevelFilter {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Initialize the logger for headless use (stderr via env_logger).
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Initialize the logger in TUI mode (log panel only).
pub fn init_tui_logger() {
    if log::set_logger(&TUI_LOGGER).is_ok() {
        log::set_max_level(default_level());
    }
}
