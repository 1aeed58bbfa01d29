// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `proxy.logging` configuration section.
//!
//! ```toml
//! [proxy.logging]
//! structured = true
//! format = "json"
//! level = "debug"
//! trace_id_header = "X-Request-ID"
//! static_fields = { service = "edge-gateway" }
//! ```

use crate::config::{Config, ConfigError};
use crate::logging::structured::{LogFormat, LoggerConfig};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Use slog instead of env_logger
    #[serde(default)]
    pub structured: bool,

    /// `terminal` or `json`; structured logging only
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default = "default_level")]
    pub level: String,

    /// Include source code location
    #[serde(default = "default_true")]
    pub include_location: bool,

    /// Reuse the client's trace id header instead of minting a new id
    #[serde(default = "default_true")]
    pub propagate_trace_id: bool,

    /// Echo the trace id back on every response
    #[serde(default = "default_true")]
    pub include_trace_id: bool,

    /// Header carrying the trace id, inbound and outbound
    #[serde(default = "default_trace_header")]
    pub trace_id_header: String,

    /// Fields attached to every structured record
    #[serde(default)]
    pub static_fields: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_format() -> String {
    "terminal".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

fn default_trace_header() -> String {
    "X-Trace-ID".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            structured: false,
            format: default_format(),
            level: default_level(),
            include_location: true,
            propagate_trace_id: true,
            include_trace_id: true,
            trace_id_header: default_trace_header(),
            static_fields: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    /// Read `proxy.logging.*` key by key so a single override (say
    /// `FALLGATE_PROXY__LOGGING__LEVEL`) lands on top of the file's table.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let key = |name: &str| format!("proxy.logging.{name}");
        Ok(Self {
            structured: config.get_or_default(&key("structured"), false)?,
            format: config.get_or_default(&key("format"), default_format())?,
            level: config.get_or_default(&key("level"), default_level())?,
            include_location: config.get_or_default(&key("include_location"), true)?,
            propagate_trace_id: config.get_or_default(&key("propagate_trace_id"), true)?,
            include_trace_id: config.get_or_default(&key("include_trace_id"), true)?,
            trace_id_header: config.get_or_default(&key("trace_id_header"), default_trace_header())?,
            static_fields: config.get_or_default(&key("static_fields"), HashMap::new())?,
        })
    }

    /// The configured level for the `log` facade; unknown names mean `info`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.to_lowercase().as_str() {
            "trace" => LevelFilter::Trace,
            "debug" => LevelFilter::Debug,
            "warn" | "warning" => LevelFilter::Warn,
            "error" | "critical" => LevelFilter::Error,
            "off" => LevelFilter::Off,
            _ => LevelFilter::Info,
        }
    }

    /// Convert to the slog logger configuration.
    pub fn to_logger_config(&self) -> LoggerConfig {
        let mut static_fields: Vec<(String, String)> = self
            .static_fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        static_fields.sort();

        LoggerConfig {
            format: match self.format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Terminal,
            },
            level: match self.level.to_lowercase().as_str() {
                "trace" => slog::Level::Trace,
                "debug" => slog::Level::Debug,
                "warn" | "warning" => slog::Level::Warning,
                "error" => slog::Level::Error,
                "critical" => slog::Level::Critical,
                _ => slog::Level::Info,
            },
            include_location: self.include_location,
            static_fields,
        }
    }
}
