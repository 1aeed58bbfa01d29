// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layered configuration.
//!
//! A gateway is configured from an ordered list of [`ConfigProvider`]s;
//! providers added later override earlier ones:
//!
//! 1. `FileConfigProvider` – `fallgate.{toml,json,yaml}`
//! 2. `EnvConfigProvider`  – `FALLGATE_PROXY__TIMEOUT=10`
//! 3. any custom [`ConfigProvider`]
//!
//! | key | type | default | description |
//! |-----|------|---------|-------------|
//! | `server.host`                      | string  | `127.0.0.1` | Address to bind            |
//! | `server.port`                      | u16     | `8080`      | Gateway port               |
//! | `server.health_port`               | u16     | `8081`      | Liveness/readiness port    |
//! | `server.body_limit`                | usize   | `5242880`   | Maximum inbound body bytes |
//! | `proxy.timeout`                    | seconds | `30`        | Per backend call           |
//! | `proxy.failure_status`             | u16     | `400`       | Backend statuses ≥ this fail |
//! | `proxy.require_wildcard_fallback`  | bool    | `false`     | Refuse to start without `*` |
//! | `proxy.logging`                    | table   | –           | See `logging::config`      |
//! | `routes`                           | array   | `[]`        | Route id → backend target  |
//! | `filters`                          | array   | `[]`        | Filter pipeline            |
//! | `fallbacks`                        | array   | `[]`        | Route id → fallback provider |

mod env;
pub mod error;
mod file;


pub use env::EnvConfigProvider;
pub use error::ConfigError;
pub use file::{FileConfigProvider, FileFormat};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// A source of configuration values. Object-safe.
pub trait ConfigProvider: Debug + Send + Sync {
    /// Whether the provider has a value for `key` (dot-separated).
    fn has(&self, key: &str) -> bool;

    /// Name used in log lines and errors.
    fn provider_name(&self) -> &str;

    /// The raw value for `key`, deserialised later by the caller.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError>;
}

/// Typed access on top of [`ConfigProvider`]; not object-safe.
pub trait ConfigProviderExt: ConfigProvider {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get_raw(key)?.map(|value| decode(key, value)).transpose()
    }
}

impl<T: ConfigProvider> ConfigProviderExt for T {}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, ConfigError> {
    serde_json::from_value(value)
        .map_err(|e| ConfigError::ParseError(format!("failed to deserialize '{key}': {e}")))
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider; it overrides every provider added before it.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Add a provider that is already shared.
    pub fn with_shared_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn build(self) -> Config {
        Config {
            providers: self.providers,
        }
    }
}

/// The merged view over every provider.
#[derive(Debug, Clone)]
pub struct Config {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        // Last provider wins.
        for provider in self.providers.iter().rev() {
            if provider.has(key) {
                return provider.get_raw(key);
            }
        }
        Ok(None)
    }

    /// The value for `key` from the highest-priority provider that has it.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get_raw(key)?.map(|value| decode(key, value)).transpose()
    }

    /// Like [`Config::get`], with `default` when no provider has the key.
    pub fn get_or_default<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Names of the providers, lowest priority first.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.provider_name()).collect()
    }

    /// A configuration backed by a single file.
    pub fn default_file(file_path: &str) -> Result<Self, ConfigError> {
        let provider = FileConfigProvider::new(file_path)?;
        Ok(Self::builder().with_provider(provider).build())
    }
}
