pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the root terminal logger for a process. The `level` string follows
/// the usual severity names ("trace", "debug", "info", ...); anything
/// unparseable falls back to "debug".
pub fn init(level: &str) -> Logger {
    let severity = level.parse().unwrap_or(Severity::Debug);

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);

    builder.build().expect("Error building the root logger")
}

/// A logger that swallows everything. Components take `Into<Option<&Logger>>`
/// in their constructors and fall back to this.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
