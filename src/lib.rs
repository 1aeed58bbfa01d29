// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fallgate - a configuration-driven API gateway with per-route fallbacks
//!
//! Every inbound request runs through an ordered pipeline of filters:
//!
//! - **pre** filters inspect and may reject the request (token checks, header rules)
//! - **route** filters pick the backend route and rewrite the forward path
//! - **post** filters decorate a successful backend response
//! - **error** filters observe failures, for side effects only
//!
//! When the backend call fails (5xx, timeout, refused connection) the route's
//! fallback provider answers instead, so the client always sees a
//! well-formed success-shaped response and never a raw upstream error.
//!
//! # Configuration System
//!
//! - **Multiple Configuration Sources**: files (JSON, TOML, YAML) and
//!   environment variables.
//! - **Layered Configuration**: providers added later override earlier ones.
//! - **Type Safety**: values are deserialised into the requested Rust types.
//!
//! # Custom Filters
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use fallgate::{Filter, FilterPhase, GatewayError, RequestContext};
//!
//! #[derive(Debug)]
//! struct RequireTenant;
//!
//! #[async_trait]
//! impl Filter for RequireTenant {
//!     fn name(&self) -> &str {
//!         "require_tenant"
//!     }
//!
//!     fn phase(&self) -> FilterPhase {
//!         FilterPhase::Pre
//!     }
//!
//!     async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
//!         if ctx.request.header("x-tenant").is_none() {
//!             ctx.reject(400, "missing tenant");
//!         }
//!         Ok(())
//!     }
//! }
//! ```

// Module declarations
pub mod config;
pub mod core;
pub mod fallback;
pub mod filters;
pub mod loader;
pub mod logging;
pub mod router;
pub mod server;

// Re-export key types at the crate root for convenience
pub use config::{ConfigError, ConfigProvider, ConfigProviderExt};
pub use core::{
    FailureCause, Filter, FilterPhase, GatewayCore, GatewayError, GatewayRequest, GatewayResponse,
    HttpMethod, RequestContext, RouteMatch, Router,
};
pub use fallback::{
    FallbackError, FallbackFactory, FallbackProvider, FallbackRegistry, StaticFallbackProvider,
    SyntheticResponse,
};
pub use filters::{
    FilterDescriptor, FilterFactory, FilterPipeline, HeaderFilter, LoggingFilter,
    PathRewriteFilter, PhaseOutcome, StaticResponseFilter, TokenFilter,
};
pub use loader::{Gateway, GatewayLoader, LoaderError};
pub use router::HttpRouter;
pub use server::{GatewayServer, ServerConfig};
