// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fallback providers – what the client sees when a backend call fails.
//!
//! To the client the gateway and its backends are one black box: a backend
//! 5xx, a timeout or a refused connection all come back as the same
//! success-shaped response explaining that the service is degraded.
//!
//! Providers are bound to a route identifier, or to every route through the
//! wildcard `"*"`.  Bindings are validated once, at startup:
//!
//! ```toml
//! [[fallbacks]]
//! route = "user-service"
//! type = "static"
//! config = { status = 200, content_type = "application/json", body = "The service is unavailable." }
//!
//! [[fallbacks]]
//! route = "*"
//! ```


use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::FailureCause;
use crate::{debug_fmt, error_fmt, info_fmt};

/// Route identifier that binds a provider to every route.
pub const WILDCARD_ROUTE: &str = "*";

/// Body of the default provider.
pub const DEFAULT_FALLBACK_BODY: &str = "The service is unavailable.";

/// Header naming the failure kind when `cause_header` is enabled.
pub const FALLBACK_CAUSE_HEADER: &str = "X-Fallback-Cause";

/// Fallback misconfiguration, always reported at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FallbackError {
    /// A second provider was bound to the same route
    #[error("a fallback provider is already registered for route '{0}'")]
    DuplicateRoute(String),

    /// A second wildcard provider was registered
    #[error("a wildcard fallback provider is already registered")]
    DuplicateWildcard,

    /// The provider names no route
    #[error("fallback provider has an empty route identifier")]
    EmptyRoute,

    /// A wildcard provider is required but none was registered
    #[error("no wildcard fallback provider is registered")]
    MissingWildcard,

    /// The provider would answer with a non-2xx status
    #[error("fallback status {0} is not a success status")]
    UnsafeStatus(u16),

    /// No provider implementation of that type exists
    #[error("unknown fallback provider type '{0}'")]
    UnknownType(String),

    /// The provider configuration could not be parsed
    #[error("invalid fallback config: {0}")]
    InvalidConfig(String),
}

/// The substitute response a provider hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl SyntheticResponse {
    /// A response with a `Content-Type` header.
    pub fn new(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), content_type.to_string());
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The content type, looked up case-insensitively.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }
}

/// Synthesises a response for failed calls on one route.
///
/// `respond` is called exactly once per failed call that resolves to the
/// provider. It must not fail and must not retry the original call.
pub trait FallbackProvider: fmt::Debug + Send + Sync {
    /// Route identifier this provider guards, or [`WILDCARD_ROUTE`].
    fn route(&self) -> &str;

    /// Build the substitute response for `cause`.
    fn respond(&self, cause: &FailureCause) -> SyntheticResponse;
}

/// Route identifier → provider, plus an optional wildcard.
#[derive(Debug, Default)]
pub struct FallbackRegistry {
    providers: HashMap<String, Arc<dyn FallbackProvider>>,
    wildcard: Option<Arc<dyn FallbackProvider>>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `provider` to its route. Rebinding a route is an error.
    pub fn register(&mut self, provider: Arc<dyn FallbackProvider>) -> Result<(), FallbackError> {
        let route = provider.route().trim().to_string();

        if route.is_empty() {
            return Err(FallbackError::EmptyRoute);
        }

        if route == WILDCARD_ROUTE {
            if self.wildcard.is_some() {
                return Err(FallbackError::DuplicateWildcard);
            }
            info_fmt!("Fallback", "Registered wildcard fallback provider");
            self.wildcard = Some(provider);
            return Ok(());
        }

        if self.providers.contains_key(&route) {
            return Err(FallbackError::DuplicateRoute(route));
        }

        info_fmt!("Fallback", "Registered fallback provider for route '{}'", route);
        self.providers.insert(route, provider);
        Ok(())
    }

    /// Exact match, else the wildcard, else `None` (the failure propagates).
    pub fn resolve(&self, route_id: &str) -> Option<Arc<dyn FallbackProvider>> {
        self.providers
            .get(route_id)
            .or(self.wildcard.as_ref())
            .cloned()
    }

    /// Startup check run once every provider is registered.
    pub fn validate(&self, require_wildcard: bool) -> Result<(), FallbackError> {
        if require_wildcard && self.wildcard.is_none() {
            return Err(FallbackError::MissingWildcard);
        }
        Ok(())
    }

    pub fn has_wildcard(&self) -> bool {
        self.wildcard.is_some()
    }

    /// Routes with a dedicated provider, sorted.
    pub fn routes(&self) -> Vec<&str> {
        let mut routes: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        routes.sort_unstable();
        routes
    }

    /// Number of providers, wildcard included.
    pub fn len(&self) -> usize {
        self.providers.len() + usize::from(self.wildcard.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Configuration for the static provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticFallbackConfig {
    /// Status returned to the client; must be 2xx
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_body")]
    pub body: String,
    /// Add an `X-Fallback-Cause` header naming the failure kind
    #[serde(default)]
    pub cause_header: bool,
}

fn default_status() -> u16 {
    200
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_body() -> String {
    DEFAULT_FALLBACK_BODY.to_string()
}

impl Default for StaticFallbackConfig {
    fn default() -> Self {
        Self {
            status: default_status(),
            content_type: default_content_type(),
            body: default_body(),
            cause_header: false,
        }
    }
}

/// Answers every failure on its route with the same configured response.
#[derive(Debug)]
pub struct StaticFallbackProvider {
    route: String,
    config: StaticFallbackConfig,
}

impl StaticFallbackProvider {
    pub fn new(route: impl Into<String>, config: StaticFallbackConfig) -> Result<Self, FallbackError> {
        if !(200..300).contains(&config.status) {
            return Err(FallbackError::UnsafeStatus(config.status));
        }
        Ok(Self {
            route: route.into(),
            config,
        })
    }

    /// `200 application/json "The service is unavailable."` for `route`.
    pub fn unavailable(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            config: StaticFallbackConfig::default(),
        }
    }
}

impl FallbackProvider for StaticFallbackProvider {
    fn route(&self) -> &str {
        &self.route
    }

    fn respond(&self, cause: &FailureCause) -> SyntheticResponse {
        info_fmt!("Fallback", "Route '{}' degraded: {}", self.route, cause);

        let response = SyntheticResponse::new(
            self.config.status,
            &self.config.content_type,
            self.config.body.clone(),
        );

        if self.config.cause_header {
            response.with_header(FALLBACK_CAUSE_HEADER, cause.kind())
        } else {
            response
        }
    }
}

/// Configuration entry binding a provider to a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Route identifier, or `"*"`
    pub route: String,
    /// Provider implementation
    #[serde(rename = "type", default = "default_provider_type")]
    pub type_: String,
    /// Provider configuration
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn default_provider_type() -> String {
    "static".to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Constructor signature for provider types registered at runtime.
pub type FallbackConstructor =
    fn(String, serde_json::Value) -> Result<Arc<dyn FallbackProvider>, FallbackError>;

static FALLBACK_REGISTRY: Lazy<RwLock<HashMap<String, FallbackConstructor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Make a provider type available to configuration under `name`.
pub fn register_fallback(name: &str, ctor: FallbackConstructor) {
    FALLBACK_REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.to_string(), ctor);
}

fn get_registered_fallback(name: &str) -> Option<FallbackConstructor> {
    FALLBACK_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .copied()
}

/// Factory for creating providers based on configuration.
#[derive(Debug)]
pub struct FallbackFactory;

impl FallbackFactory {
    /// Create a provider of `provider_type` for `route`.
    pub fn create_provider(
        provider_type: &str,
        route: &str,
        config: serde_json::Value,
    ) -> Result<Arc<dyn FallbackProvider>, FallbackError> {
        debug_fmt!(
            "Fallback",
            "Creating '{}' provider for route '{}' with config: {}",
            provider_type,
            route,
            config
        );

        if let Some(ctor) = get_registered_fallback(provider_type) {
            return ctor(route.to_string(), config);
        }

        match provider_type {
            "static" => {
                let config: StaticFallbackConfig = serde_json::from_value(config).map_err(|e| {
                    let err = FallbackError::InvalidConfig(e.to_string());
                    error_fmt!("Fallback", "{}", err);
                    err
                })?;
                Ok(Arc::new(StaticFallbackProvider::new(route, config)?))
            }
            _ => {
                let err = FallbackError::UnknownType(provider_type.to_string());
                error_fmt!("Fallback", "{}", err);
                Err(err)
            }
        }
    }

    /// Build and register every configured binding.
    pub fn register_all(
        registry: &mut FallbackRegistry,
        configs: &[FallbackConfig],
    ) -> Result<(), FallbackError> {
        for entry in configs {
            let provider = Self::create_provider(&entry.type_, &entry.route, entry.config.clone())?;
            registry.register(provider)?;
        }
        Ok(())
    }
}
