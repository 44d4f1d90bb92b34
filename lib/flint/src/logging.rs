//! Thin facade over `slog` so downstream crates only ever name this module.

use serdeconv;
use sloggers::{Config, LoggerConfig};

pub use slog::{
    b, crit, debug, error, info, kv, log, o, record, record_static, trace, warn, Discard, Drain,
    Level, Logger,
};

/// Levels accepted by the terminal drain. Anything else falls back to `info`.
const LEVELS: [&str; 6] = ["trace", "debug", "info", "warning", "error", "critical"];

/// Builds the root logger for a process: human readable records on stderr,
/// filtered at the given maximum level.
pub fn init(max_level: &str) -> Result<Logger, sloggers::Error> {
    let level = match LEVELS.iter().find(|l| **l == max_level) {
        Some(level) => *level,
        None => "info",
    };

    // The template only ever receives a vetted level string, so it always
    // deserializes.
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("logger config template is well formed");

    config.build_logger()
}

/// A logger that swallows everything. Library components fall back to this
/// when the caller does not supply a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a concrete child logger.
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_known_level() {
        let log = init("debug").unwrap();
        info!(log, "logger alive"; "level" => "debug");
    }

    #[test]
    fn test_init_unknown_level_falls_back() {
        assert!(init("chatty").is_ok());
    }

    #[test]
    fn test_child_of_none_is_silent() {
        let log = child(None);
        info!(log, "dropped on the floor");
    }
}
