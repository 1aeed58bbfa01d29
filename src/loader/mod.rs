// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level entry-point – "turn the key and go".
//!
//! The [`GatewayLoader`] consumes configuration, builds the router, the
//! filter pipeline and the fallback registry, and returns a [`Gateway`]
//! whose server is ready to start.
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), fallgate::LoaderError> {
//! use fallgate::Gateway;
//!
//! let gateway = Gateway::loader()
//!     .with_config_file("fallgate.toml")
//!     .with_env_vars()
//!     .build()
//!     .await?;
//! gateway.start().await
//! # }
//! ```


use std::sync::Arc;

use thiserror::Error;

use crate::config::{Config, ConfigError, ConfigProvider, EnvConfigProvider, FileConfigProvider};
use crate::core::{Filter, GatewayCore, GatewayError, Router};
use crate::fallback::{FallbackConfig, FallbackError, FallbackFactory, FallbackProvider, FallbackRegistry};
use crate::filters::{FilterConfig, FilterDescriptor, FilterFactory, FilterPipeline};
use crate::logging::config::LoggingConfig;
use crate::logging::init_with_config;
use crate::router::HttpRouter;
use crate::server::{GatewayServer, ServerConfig};
use crate::{info_fmt, warn_fmt};

/// Errors that can occur while assembling a gateway.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Gateway error
    #[error("gateway error: {0}")]
    GatewayError(#[from] GatewayError),

    /// Invalid fallback bindings
    #[error("fallback error: {0}")]
    FallbackError(#[from] FallbackError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Builder for a [`Gateway`].
#[derive(Debug, Default)]
pub struct GatewayLoader {
    config: Option<Config>,
    config_file_path: Option<String>,
    use_env_vars: bool,
    env_prefix: Option<String>,
    extra_providers: Vec<Arc<dyn ConfigProvider>>,
    custom_filters: Vec<(Arc<dyn Filter>, FilterDescriptor)>,
    custom_router: Option<Arc<dyn Router>>,
    custom_fallbacks: Vec<Arc<dyn FallbackProvider>>,
}

impl GatewayLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a ready-made configuration; file, env and provider settings are ignored.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set a configuration file to load.
    pub fn with_config_file(mut self, file_path: &str) -> Self {
        self.config_file_path = Some(file_path.to_string());
        self
    }

    /// Let `FALLGATE_*` environment variables override the file.
    pub fn with_env_vars(mut self) -> Self {
        self.use_env_vars = true;
        self
    }

    /// Set a custom prefix for environment variables (default is "FALLGATE_").
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.use_env_vars = true;
        self
    }

    /// Add a custom configuration provider; it overrides file and env values.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.extra_providers.push(Arc::new(provider));
        self
    }

    /// Add a custom filter at its own phase and priority.
    pub fn with_filter<F: Filter + 'static>(self, filter: F) -> Self {
        self.with_filter_at(filter, FilterDescriptor::default())
    }

    /// Add a custom filter with an explicit placement.
    pub fn with_filter_at<F: Filter + 'static>(mut self, filter: F, descriptor: FilterDescriptor) -> Self {
        self.custom_filters.push((Arc::new(filter), descriptor));
        self
    }

    /// Replace the configured [`HttpRouter`].
    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.custom_router = Some(router);
        self
    }

    /// Bind a fallback provider in addition to the configured ones.
    pub fn with_fallback(mut self, provider: Arc<dyn FallbackProvider>) -> Self {
        self.custom_fallbacks.push(provider);
        self
    }

    fn assemble_config(&mut self) -> Result<Config, LoaderError> {
        if let Some(config) = self.config.take() {
            return Ok(config);
        }

        let mut builder = Config::builder();

        if let Some(file_path) = &self.config_file_path {
            builder = builder.with_provider(FileConfigProvider::new(file_path)?);
        }

        if self.use_env_vars {
            builder = builder.with_provider(match &self.env_prefix {
                Some(prefix) => EnvConfigProvider::new(prefix),
                None => EnvConfigProvider::default(),
            });
        }

        for provider in self.extra_providers.drain(..) {
            builder = builder.with_shared_provider(provider);
        }

        Ok(builder.build())
    }

    /// Build the gateway. Every filter and fallback binding is validated here;
    /// nothing is registered after this returns.
    pub async fn build(mut self) -> Result<Gateway, LoaderError> {
        let config = self.assemble_config()?;

        let logging_config = LoggingConfig::from_config(&config)?;
        init_with_config(logging_config.level_filter(), &logging_config);

        info_fmt!("Startup", "fallgate starting up ({})", config.provider_names().join(", "));

        /* ---------- router ---------- */
        let router: Arc<dyn Router> = match self.custom_router.take() {
            Some(router) => router,
            None => Arc::new(HttpRouter::from_config(&config)?),
        };

        /* ---------- filters ---------- */
        let mut pipeline = FilterPipeline::new();
        let filter_configs: Vec<FilterConfig> = config.get_or_default("filters", Vec::new())?;
        for entry in &filter_configs {
            let filter = FilterFactory::create_filter(&entry.type_, entry.config.clone())?;
            pipeline.register_with(filter, entry.descriptor()?);
            info_fmt!("Startup", "Added filter: {}", entry.type_);
        }
        for (filter, descriptor) in self.custom_filters {
            info_fmt!("Startup", "Added custom filter: {}", filter.name());
            pipeline.register_with(filter, descriptor);
        }

        /* ---------- fallbacks ---------- */
        let mut fallbacks = FallbackRegistry::new();
        let fallback_configs: Vec<FallbackConfig> = config.get_or_default("fallbacks", Vec::new())?;
        FallbackFactory::register_all(&mut fallbacks, &fallback_configs)?;
        for provider in self.custom_fallbacks {
            fallbacks.register(provider)?;
        }

        let require_wildcard: bool =
            config.get_or_default("proxy.require_wildcard_fallback", false)?;
        fallbacks.validate(require_wildcard)?;
        if !fallbacks.has_wildcard() {
            warn_fmt!(
                "Startup",
                "No '*' fallback bound; failures on other routes propagate to clients"
            );
        }
        info_fmt!("Startup", "Fallbacks bound for: {}", fallbacks.routes().join(", "));

        /* ---------- server ---------- */
        let core = Arc::new(GatewayCore::new(router, pipeline, fallbacks));
        let server_config = ServerConfig::from_config(&config)?;
        let server = GatewayServer::new(server_config, core.clone(), logging_config);

        Ok(Gateway {
            config: Arc::new(config),
            core,
            server,
        })
    }
}

/// An assembled gateway.
#[derive(Debug, Clone)]
pub struct Gateway {
    config: Arc<Config>,
    core: Arc<GatewayCore>,
    server: GatewayServer,
}

impl Gateway {
    /// Create a new loader.
    pub fn loader() -> GatewayLoader {
        GatewayLoader::new()
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The request pipeline, for in-process use.
    pub fn core(&self) -> &Arc<GatewayCore> {
        &self.core
    }

    pub fn server(&self) -> &GatewayServer {
        &self.server
    }

    /// Serve until SIGINT/SIGTERM.
    pub async fn start(&self) -> Result<(), LoaderError> {
        self.server.start().await.map_err(LoaderError::GatewayError)
    }
}
