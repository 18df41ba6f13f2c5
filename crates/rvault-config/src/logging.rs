//! Logging bootstrap.
//!
//! Every component logs through `tracing` with a `component` field (CACHE,
//! WATCH, SESSION, CHUNK, EXPORT, CLI) so one process's interleaved threads
//! can be filtered apart.

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const CACHE: &'static str = "CACHE";
    pub const WATCH: &'static str = "WATCH";
    pub const SESSION: &'static str = "SESSION";
    pub const CHUNK: &'static str = "CHUNK";
    pub const EXPORT: &'static str = "EXPORT";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::CACHE, "CACHE");
        assert_eq!(Component::EXPORT, "EXPORT");
    }
}
