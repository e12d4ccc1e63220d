use log::LevelFilter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level: "error", "warn", "info", "debug" or "trace"
    pub level: String,

    /// Forward records to log subscribers in addition to stderr
    pub forward_records: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            forward_records: true,
        }
    }
}

impl LoggingConfig {
    /// Parsed level, `Info` when the configured name is unknown
    pub fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::Info)
    }
}
