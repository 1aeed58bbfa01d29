// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filter pipeline & built-in filters
//!
//! Filters are **opt-in** – list them under `filters` in the configuration
//! for them to execute:
//!
//! ```toml
//! [[filters]]
//! type = "token"
//! phase = "pre"        # optional, defaults to the filter's own phase
//! priority = 0         # optional, lower runs first
//! when = [{ type = "path", config = { pattern = "/user-service/*" } }]
//! config = { param = "token", enforce = true }
//! ```
//!
//! Each built-in is documented below together with its configuration.

pub mod pipeline;
pub mod predicates;

#[cfg(test)]
mod tests;

pub use pipeline::{FilterDescriptor, FilterPipeline, PhaseOutcome};
pub use predicates::{Predicate, PredicateConfig, PredicateFactory};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use log::Level;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{
    DEFAULT_REJECTION_STATUS, Filter, FilterPhase, GatewayError, GatewayResponse, RequestContext,
    insert_header,
};
use crate::router::RouteRule;
use crate::{debug_fmt, error_fmt, info_fmt, trace_fmt, warn_fmt};

/// Constructor signature every dynamic filter must implement
pub type FilterConstructor = fn(serde_json::Value) -> Result<Arc<dyn Filter>, GatewayError>;

/// Global registry – `register_filter()` writes to it,
/// `FilterFactory::create_filter()` reads from it.
static FILTER_REGISTRY: Lazy<RwLock<HashMap<String, FilterConstructor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a filter type under a unique name.
/// Call this **before** you build the gateway:
///
/// ```rust
/// use fallgate::{filters::register_filter, Filter, FilterPhase, GatewayError, RequestContext};
///
/// #[derive(Debug)]
/// struct MyFilter;
///
/// #[async_trait::async_trait]
/// impl Filter for MyFilter {
///     fn name(&self) -> &str { "my_filter" }
///     fn phase(&self) -> FilterPhase { FilterPhase::Pre }
///     async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
///         ctx.annotate("seen", true);
///         Ok(())
///     }
/// }
///
/// register_filter("my_filter", |_cfg| Ok(std::sync::Arc::new(MyFilter)));
/// ```
pub fn register_filter(name: &str, ctor: FilterConstructor) {
    FILTER_REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.to_string(), ctor);
}

fn get_registered_filter(name: &str) -> Option<FilterConstructor> {
    FILTER_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .copied()
}

/// Configuration entry for one filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// The type of filter
    #[serde(rename = "type")]
    pub type_: String,
    /// Phase override
    #[serde(default)]
    pub phase: Option<FilterPhase>,
    /// Priority override
    #[serde(default)]
    pub priority: Option<i32>,
    /// Applicability rule
    #[serde(default)]
    pub when: Vec<PredicateConfig>,
    /// The configuration for the filter
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl FilterConfig {
    /// Build the placement for this entry.
    pub fn descriptor(&self) -> Result<FilterDescriptor, GatewayError> {
        let when = self
            .when
            .iter()
            .map(|p| PredicateFactory::create_predicate(&p.type_, p.config.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FilterDescriptor {
            phase: self.phase,
            priority: self.priority,
            when,
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

/// Configuration for the token filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFilterConfig {
    /// Query parameter carrying the token
    #[serde(default = "default_token_param")]
    pub param: String,
    /// Header carrying the token, checked when the parameter is absent
    #[serde(default)]
    pub header: Option<String>,
    /// Reject requests without a token; when false every request is forwarded
    #[serde(default = "default_true")]
    pub enforce: bool,
    /// Status for rejected requests
    #[serde(default = "default_rejection_status")]
    pub status: u16,
    /// Body for rejected requests
    #[serde(default = "default_token_message")]
    pub message: String,
}

fn default_token_param() -> String {
    "token".to_string()
}

fn default_rejection_status() -> u16 {
    DEFAULT_REJECTION_STATUS
}

fn default_token_message() -> String {
    "token is empty".to_string()
}

impl Default for TokenFilterConfig {
    fn default() -> Self {
        Self {
            param: default_token_param(),
            header: None,
            enforce: true,
            status: default_rejection_status(),
            message: default_token_message(),
        }
    }
}

/// Rejects requests that carry no token.
///
/// Only presence is checked; validating the token belongs in a custom
/// filter. The outcome is recorded in the `isSuccess` annotation.
#[derive(Debug, Default)]
pub struct TokenFilter {
    config: TokenFilterConfig,
}

impl TokenFilter {
    pub fn new(config: TokenFilterConfig) -> Self {
        Self { config }
    }

    /// First non-blank token, query parameter before header.
    fn token(&self, ctx: &RequestContext) -> Option<String> {
        let blank = |token: &String| token.trim().is_empty();
        ctx.request
            .query_param(&self.config.param)
            .filter(|token| !blank(token))
            .or_else(|| {
                self.config
                    .header
                    .as_deref()
                    .and_then(|h| ctx.request.header(h))
                    .map(str::to_string)
                    .filter(|token| !blank(token))
            })
    }
}

#[async_trait]
impl Filter for TokenFilter {
    fn name(&self) -> &str {
        "token"
    }

    fn phase(&self) -> FilterPhase {
        FilterPhase::Pre
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        info_fmt!("TokenFilter", "{} {}", ctx.request.method, ctx.request.path);

        if self.token(ctx).is_some() || !self.config.enforce {
            ctx.annotate("isSuccess", true);
        } else {
            ctx.reject(self.config.status, self.config.message.clone());
            ctx.annotate("isSuccess", false);
        }

        Ok(())
    }
}

/// Configuration for the static response filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticResponseFilterConfig {
    #[serde(default = "default_static_status")]
    pub status: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_static_content_type")]
    pub content_type: String,
}

fn default_static_status() -> u16 {
    200
}

fn default_static_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

/// Answers from the gateway itself; the backend is never called.
#[derive(Debug)]
pub struct StaticResponseFilter {
    config: StaticResponseFilterConfig,
}

impl StaticResponseFilter {
    pub fn new(config: StaticResponseFilterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Filter for StaticResponseFilter {
    fn name(&self) -> &str {
        "static_response"
    }

    fn phase(&self) -> FilterPhase {
        FilterPhase::Pre
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let body = Bytes::from(self.config.body.clone());
        ctx.response = Some(
            GatewayResponse::new(self.config.status, body.clone())
                .with_header("content-type", &self.config.content_type),
        );
        ctx.reject(self.config.status, body);
        Ok(())
    }
}

/// Configuration for a header modification filter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeaderFilterConfig {
    /// Headers to add or replace in the request
    #[serde(default)]
    pub add_request_headers: HashMap<String, String>,

    /// Headers to remove from the request
    #[serde(default)]
    pub remove_request_headers: Vec<String>,

    /// Headers to add or replace in the response
    #[serde(default)]
    pub add_response_headers: HashMap<String, String>,

    /// Headers to remove from the response
    #[serde(default)]
    pub remove_response_headers: Vec<String>,
}

/// Edits request headers in the pre/route phases and response headers in
/// the post phase.
#[derive(Debug, Default)]
pub struct HeaderFilter {
    config: HeaderFilterConfig,
}

impl HeaderFilter {
    pub fn new(config: HeaderFilterConfig) -> Self {
        Self { config }
    }

    fn apply_headers(
        headers: &mut reqwest::header::HeaderMap,
        add_headers: &HashMap<String, String>,
        remove_headers: &[String],
    ) {
        for header_name in remove_headers {
            if let Ok(name) = reqwest::header::HeaderName::from_bytes(header_name.as_bytes()) {
                headers.remove(&name);
            }
        }

        for (name, value) in add_headers {
            insert_header(headers, name, value);
        }
    }
}

#[async_trait]
impl Filter for HeaderFilter {
    fn name(&self) -> &str {
        "header"
    }

    fn phase(&self) -> FilterPhase {
        FilterPhase::Post
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        match ctx.phase {
            FilterPhase::Pre | FilterPhase::Route => Self::apply_headers(
                &mut ctx.request.headers,
                &self.config.add_request_headers,
                &self.config.remove_request_headers,
            ),
            FilterPhase::Post => {
                if let Some(response) = ctx.response.as_mut() {
                    Self::apply_headers(
                        &mut response.headers,
                        &self.config.add_response_headers,
                        &self.config.remove_response_headers,
                    );
                }
            }
            FilterPhase::Error => {}
        }
        Ok(())
    }
}

/// Configuration for a path rewrite filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRewriteFilterConfig {
    /// The pattern to match (regex)
    pub pattern: String,
    /// The replacement pattern
    pub replacement: String,
}

/// Rewrites the path forwarded to the backend.
#[derive(Debug)]
pub struct PathRewriteFilter {
    config: PathRewriteFilterConfig,
    regex: Regex,
}

impl PathRewriteFilter {
    pub fn new(config: PathRewriteFilterConfig) -> Result<Self, GatewayError> {
        let regex = Regex::new(&config.pattern).map_err(|e| {
            let err = GatewayError::FilterError(format!(
                "Invalid regex pattern '{}': {}",
                config.pattern, e
            ));
            error_fmt!("PathRewriteFilter", "{}", err);
            err
        })?;

        Ok(Self { config, regex })
    }
}

#[async_trait]
impl Filter for PathRewriteFilter {
    fn name(&self) -> &str {
        "path_rewrite"
    }

    fn phase(&self) -> FilterPhase {
        FilterPhase::Route
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let original = ctx
            .forward_path
            .clone()
            .unwrap_or_else(|| ctx.request.path.clone());
        let rewritten = self
            .regex
            .replace_all(&original, self.config.replacement.as_str())
            .to_string();

        if rewritten != original {
            debug_fmt!(
                "PathRewriteFilter",
                "Rewriting path from {} to {}",
                original,
                rewritten
            );
        }

        if ctx.forward_path.is_some() {
            ctx.forward_path = Some(rewritten);
        } else {
            ctx.request.path = rewritten;
        }
        Ok(())
    }
}

/// One entry of the route filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteFilterRule {
    /// Route identifier to select
    pub id: String,
    /// Path pattern (`:param`, `*`)
    pub path: String,
    /// Remove the literal prefix before forwarding
    #[serde(default = "default_true")]
    pub strip_prefix: bool,
}

/// Configuration for the route filter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouteFilterConfig {
    #[serde(default)]
    pub routes: Vec<RouteFilterRule>,
}

/// Picks the route identifier from the request path. The first matching
/// rule wins; requests that already have a route are left alone.
#[derive(Debug)]
pub struct RouteFilter {
    rules: Vec<RouteRule>,
}

impl RouteFilter {
    pub fn new(config: RouteFilterConfig) -> Result<Self, GatewayError> {
        let rules = config
            .routes
            .iter()
            .map(|r| RouteRule::new(&r.id, &r.path, r.strip_prefix))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }
}

#[async_trait]
impl Filter for RouteFilter {
    fn name(&self) -> &str {
        "route"
    }

    fn phase(&self) -> FilterPhase {
        FilterPhase::Route
    }

    fn should_filter(&self, ctx: &RequestContext) -> bool {
        ctx.route_id.is_none()
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let Some(found) = self.rules.iter().find_map(|r| r.matches(&ctx.request.path)) else {
            trace_fmt!("RouteFilter", "No rule for {}", ctx.request.path);
            return Ok(());
        };

        debug_fmt!(
            "RouteFilter",
            "{} -> route '{}' {}",
            ctx.request.path,
            found.route_id,
            found.forward_path
        );
        ctx.route_id = Some(found.route_id);
        ctx.forward_path = Some(found.forward_path);
        Ok(())
    }
}

/// Configuration for the annotate filter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnnotateFilterConfig {
    #[serde(default)]
    pub annotations: HashMap<String, serde_json::Value>,
}

/// Copies static values into the context annotations.
#[derive(Debug, Default)]
pub struct AnnotateFilter {
    config: AnnotateFilterConfig,
}

impl AnnotateFilter {
    pub fn new(config: AnnotateFilterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Filter for AnnotateFilter {
    fn name(&self) -> &str {
        "annotate"
    }

    fn phase(&self) -> FilterPhase {
        FilterPhase::Pre
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        for (key, value) in &self.config.annotations {
            ctx.annotate(key.clone(), value.clone());
        }
        Ok(())
    }
}

/// Configuration for a logging filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingFilterConfig {
    /// Whether to log headers
    #[serde(default = "default_true")]
    pub log_headers: bool,

    /// Whether to log the response body (post phase only)
    #[serde(default = "default_false")]
    pub log_body: bool,

    /// Log level to use
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Maximum body size to log (in bytes)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_log_level() -> String {
    "trace".to_string()
}

fn default_max_body_size() -> usize {
    1024
}

impl Default for LoggingFilterConfig {
    fn default() -> Self {
        Self {
            log_headers: true,
            log_body: false,
            log_level: default_log_level(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// Logs whatever the current phase is about: the request in pre/route, the
/// response in post, the failure in error.
#[derive(Debug, Default)]
pub struct LoggingFilter {
    config: LoggingFilterConfig,
}

impl LoggingFilter {
    pub fn new(config: LoggingFilterConfig) -> Self {
        Self { config }
    }

    fn get_log_level(&self) -> Level {
        match self.config.log_level.to_lowercase().as_str() {
            "error" => Level::Error,
            "warn" => Level::Warn,
            "info" => Level::Info,
            "debug" => Level::Debug,
            _ => Level::Trace,
        }
    }

    fn log(&self, message: &str) {
        match self.get_log_level() {
            Level::Error => error_fmt!("LoggingFilter", "{}", message),
            Level::Warn => warn_fmt!("LoggingFilter", "{}", message),
            Level::Info => info_fmt!("LoggingFilter", "{}", message),
            Level::Debug => debug_fmt!("LoggingFilter", "{}", message),
            Level::Trace => trace_fmt!("LoggingFilter", "{}", message),
        }
    }

    fn log_headers(&self, marker: &str, headers: &reqwest::header::HeaderMap) {
        if !self.config.log_headers {
            return;
        }
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                self.log(&format!("{marker} {name}: {value}"));
            }
        }
    }

    fn format_body(&self, body: &[u8]) -> String {
        if body.is_empty() {
            return "[Empty body]".to_string();
        }

        if body.len() > self.config.max_body_size {
            return format!(
                "[Body truncated, showing {}/{} bytes]\n{}",
                self.config.max_body_size,
                body.len(),
                String::from_utf8_lossy(&body[..self.config.max_body_size])
            );
        }

        String::from_utf8_lossy(body).to_string()
    }
}

#[async_trait]
impl Filter for LoggingFilter {
    fn name(&self) -> &str {
        "logging"
    }

    fn phase(&self) -> FilterPhase {
        FilterPhase::Pre
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        match ctx.phase {
            FilterPhase::Pre | FilterPhase::Route => {
                self.log(&format!(
                    ">> [{}] {} {}",
                    ctx.trace_id, ctx.request.method, ctx.request.path
                ));
                self.log_headers(">>", &ctx.request.headers);
            }
            FilterPhase::Post => {
                if let Some(response) = &ctx.response {
                    self.log(&format!("<< [{}] {}", ctx.trace_id, response.status));
                    self.log_headers("<<", &response.headers);
                    if self.config.log_body {
                        self.log(&format!("<< Response Body:\n{}", self.format_body(&response.body)));
                    }
                }
            }
            FilterPhase::Error => {
                let cause = ctx
                    .failure
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown failure".to_string());
                self.log(&format!(
                    "!! [{}] {} {} route={} {}",
                    ctx.trace_id,
                    ctx.request.method,
                    ctx.request.path,
                    ctx.route_id.as_deref().unwrap_or("-"),
                    cause
                ));
            }
        }
        Ok(())
    }
}

/// Factory for creating filters based on configuration.
#[derive(Debug)]
pub struct FilterFactory;

impl FilterFactory {
    /// Create a filter based on the filter type and configuration.
    pub fn create_filter(
        filter_type: &str,
        config: serde_json::Value,
    ) -> Result<Arc<dyn Filter>, GatewayError> {
        debug_fmt!(
            "Filter",
            "Creating filter of type '{}' with config: {}",
            filter_type,
            config
        );

        // See if we've got an external filter registered of that name
        if let Some(ctor) = get_registered_filter(filter_type) {
            return ctor(config);
        }

        match filter_type {
            "token" => Ok(Arc::new(TokenFilter::new(parse(filter_type, config)?))),
            "static_response" => Ok(Arc::new(StaticResponseFilter::new(parse(
                filter_type,
                config,
            )?))),
            "header" => Ok(Arc::new(HeaderFilter::new(parse(filter_type, config)?))),
            "path_rewrite" => Ok(Arc::new(PathRewriteFilter::new(parse(filter_type, config)?)?)),
            "route" => Ok(Arc::new(RouteFilter::new(parse(filter_type, config)?)?)),
            "annotate" => Ok(Arc::new(AnnotateFilter::new(parse(filter_type, config)?))),
            "logging" => Ok(Arc::new(LoggingFilter::new(parse(filter_type, config)?))),
            _ => {
                let err = GatewayError::FilterError(format!("Unknown filter type: {filter_type}"));
                error_fmt!("Filter", "{}", err);
                Err(err)
            }
        }
    }
}

fn parse<T: DeserializeOwned>(filter_type: &str, config: serde_json::Value) -> Result<T, GatewayError> {
    serde_json::from_value(config).map_err(|e| {
        let err = GatewayError::FilterError(format!("Invalid {filter_type} filter config: {e}"));
        error_fmt!("Filter", "{}", err);
        err
    })
}
