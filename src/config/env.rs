// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment variable configuration provider.
//!
//! `FALLGATE_SERVER__PORT=9090` sets `server.port`; a double underscore
//! separates levels so single underscores survive in key names
//! (`FALLGATE_PROXY__FAILURE_STATUS` → `proxy.failure_status`).  Values are
//! parsed as JSON when possible, so arrays and tables can be given inline.

use std::collections::HashMap;
use std::env;

use serde_json::{Value, json};

use super::ConfigError;
use super::ConfigProvider;

/// Default variable prefix.
pub const DEFAULT_ENV_PREFIX: &str = "FALLGATE_";

/// Configuration provider backed by a snapshot of the process environment.
#[derive(Debug)]
pub struct EnvConfigProvider {
    prefix: String,
    cache: HashMap<String, String>,
}

impl EnvConfigProvider {
    /// Snapshot every variable starting with `prefix`.
    pub fn new(prefix: &str) -> Self {
        let mut provider = Self {
            prefix: prefix.to_string(),
            cache: HashMap::new(),
        };
        provider.refresh_cache();
        provider
    }

    /// Re-read the environment.
    pub fn refresh_cache(&mut self) {
        self.cache = env::vars()
            .filter_map(|(key, value)| {
                let rest = key.strip_prefix(&self.prefix)?;
                Some((key_for(rest), value))
            })
            .collect();
    }

    /// Number of variables captured.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// `PROXY__FAILURE_STATUS` → `proxy.failure_status`
fn key_for(var: &str) -> String {
    var.to_lowercase().replace("__", ".")
}

/// JSON first, then bool/number, then plain string.
fn parse_value(value: &str) -> Value {
    if let Ok(parsed) = serde_json::from_str(value) {
        return parsed;
    }
    if value.eq_ignore_ascii_case("true") {
        return json!(true);
    }
    if value.eq_ignore_ascii_case("false") {
        return json!(false);
    }
    if let Ok(int_val) = value.parse::<i64>() {
        return json!(int_val);
    }
    if let Ok(float_val) = value.parse::<f64>() {
        return json!(float_val);
    }
    json!(value)
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new(DEFAULT_ENV_PREFIX)
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.cache.get(key).map(|value| parse_value(value)))
    }

    fn has(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    fn provider_name(&self) -> &str {
        "env"
    }
}
