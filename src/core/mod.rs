// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core primitives – requests, responses, the filter contract & the
//! request state machine.
//!
//! Everything that physically moves through the gateway is defined in this
//! module.  No I/O happens here; the outbound call belongs to a [`Router`]
//! (`router/` ships the `reqwest` one) and sockets live in `server/`.
//!
//! A request walks strictly forward through
//!
//! ```text
//! Received → Pre → Route ─┬─ ShortCircuited ──────────────────────────► Responded
//!                         └─ Routed ─┬─ Success → Post ───────────────► Responded
//!                                    └─ Failed → FallbackLookup ─┬─────► Responded
//!                                                                └─────► ErrorPropagated
//! ```
//!
//! and the error phase runs on every failure, whichever branch recovers it.

mod context;

#[cfg(test)]
mod tests;

pub use context::RequestContext;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fallback::{FallbackRegistry, SyntheticResponse};
use crate::filters::{FilterPipeline, PhaseOutcome};
use crate::{debug_fmt, warn_fmt};

/// Body returned when a pre/route filter rejects a request without
/// providing its own `body_override`.
pub const DEFAULT_REJECTION_BODY: &str = "Request rejected by gateway filter";

/// Status returned when a pre/route filter rejects a request without
/// providing its own `status_override`.
pub const DEFAULT_REJECTION_STATUS: u16 = 400;

/// Annotation key holding the terminal state of a request.
pub const STATE_ANNOTATION: &str = "gateway.state";

/// Errors that can occur while a request moves through the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// HTTP client error
    #[error("HTTP client error: {0}")]
    ClientError(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// No route identifier could be derived for the request
    #[error("routing error: {0}")]
    RoutingError(String),

    /// A filter action failed
    #[error("filter error: {0}")]
    FilterError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The backend call failed and no fallback provider was bound to the route
    #[error("upstream failure: {0}")]
    Upstream(FailureCause),

    /// The client went away while the backend call was outstanding
    #[error("request cancelled by client")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<crate::config::error::ConfigError> for GatewayError {
    fn from(err: crate::config::error::ConfigError) -> Self {
        GatewayError::ConfigError(err.to_string())
    }
}

impl From<FailureCause> for GatewayError {
    fn from(cause: FailureCause) -> Self {
        match cause {
            FailureCause::Cancelled => GatewayError::Cancelled,
            FailureCause::NoRoute { path } => {
                GatewayError::RoutingError(format!("no route for path {path}"))
            }
            FailureCause::Filter { filter, message } => {
                GatewayError::FilterError(format!("{filter}: {message}"))
            }
            other => GatewayError::Upstream(other),
        }
    }
}

/// Structured description of why a request could not be completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The backend did not answer within the router's deadline.
    Timeout(Duration),
    /// The backend refused (or never accepted) the connection.
    ConnectionRefused(String),
    /// The backend answered with a status the router treats as failure.
    BackendError {
        /// Status the backend returned.
        status: u16,
    },
    /// The inbound connection was dropped while the call was in flight.
    Cancelled,
    /// The router has no live target for the route identifier.
    NoInstance {
        /// Route identifier that could not be resolved.
        route: String,
    },
    /// No route identifier could be derived from the request.
    NoRoute {
        /// Inbound request path.
        path: String,
    },
    /// Any other outbound transport failure.
    Transport(String),
    /// A filter action raised.
    Filter {
        /// Name of the failing filter.
        filter: String,
        /// Error message the filter produced.
        message: String,
    },
}

impl FailureCause {
    /// Stable lowercase tag for logs, annotations and fallback bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            FailureCause::Timeout(_) => "timeout",
            FailureCause::ConnectionRefused(_) => "connection-refused",
            FailureCause::BackendError { .. } => "backend-error",
            FailureCause::Cancelled => "cancelled",
            FailureCause::NoInstance { .. } => "no-instance",
            FailureCause::NoRoute { .. } => "no-route",
            FailureCause::Transport(_) => "transport",
            FailureCause::Filter { .. } => "filter",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Timeout(d) => write!(f, "timed out after {d:?}"),
            FailureCause::ConnectionRefused(msg) => write!(f, "connection refused: {msg}"),
            FailureCause::BackendError { status } => write!(f, "backend returned {status}"),
            FailureCause::Cancelled => write!(f, "cancelled"),
            FailureCause::NoInstance { route } => write!(f, "no live instance for route '{route}'"),
            FailureCause::NoRoute { path } => write!(f, "no route for path {path}"),
            FailureCause::Transport(msg) => write!(f, "transport error: {msg}"),
            FailureCause::Filter { filter, message } => {
                write!(f, "filter '{filter}' failed: {message}")
            }
        }
    }
}

/// HTTP methods supported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
            HttpMethod::Head => write!(f, "HEAD"),
            HttpMethod::Options => write!(f, "OPTIONS"),
            HttpMethod::Patch => write!(f, "PATCH"),
            HttpMethod::Trace => write!(f, "TRACE"),
            HttpMethod::Connect => write!(f, "CONNECT"),
        }
    }
}

impl From<&reqwest::Method> for HttpMethod {
    fn from(method: &reqwest::Method) -> Self {
        match *method {
            reqwest::Method::GET => HttpMethod::Get,
            reqwest::Method::POST => HttpMethod::Post,
            reqwest::Method::PUT => HttpMethod::Put,
            reqwest::Method::DELETE => HttpMethod::Delete,
            reqwest::Method::HEAD => HttpMethod::Head,
            reqwest::Method::OPTIONS => HttpMethod::Options,
            reqwest::Method::PATCH => HttpMethod::Patch,
            reqwest::Method::TRACE => HttpMethod::Trace,
            reqwest::Method::CONNECT => HttpMethod::Connect,
            _ => HttpMethod::Get, // Default to GET for extension methods
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Trace => reqwest::Method::TRACE,
            HttpMethod::Connect => reqwest::Method::CONNECT,
        }
    }
}

/// Inbound request data, buffered.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayRequest {
    /// Create a request with no query, headers or body.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Set the raw query string (without the leading `?`).
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Add a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        insert_header(&mut self.headers, name, value);
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a query parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        query
            .split('&')
            .filter_map(|pair| {
                let mut iter = pair.splitn(2, '=');
                Some((iter.next()?, iter.next().unwrap_or("")))
            })
            .find(|(key, _)| *key == name)
            .map(|(_, value)| {
                urlencoding::decode(value)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.to_string())
            })
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A response on its way back to the client.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    /// Create a response with no headers.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Add a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        insert_header(&mut self.headers, name, value);
        self
    }

    /// The `Content-Type` header, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

impl From<SyntheticResponse> for GatewayResponse {
    fn from(synthetic: SyntheticResponse) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in &synthetic.headers {
            insert_header(&mut headers, name, value);
        }
        Self {
            status: synthetic.status,
            headers,
            body: synthetic.body,
        }
    }
}

pub(crate) fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

/// The stage of request processing a filter participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterPhase {
    /// Before a route is invoked.
    #[default]
    Pre,
    /// Chooses and prepares the route; the backend call follows it.
    Route,
    /// After a successful backend call.
    Post,
    /// On any failure, for side effects only.
    Error,
}

impl FilterPhase {
    /// Whether setting `should_forward = false` ends the request in this phase.
    pub fn can_short_circuit(&self) -> bool {
        matches!(self, FilterPhase::Pre | FilterPhase::Route)
    }
}

impl fmt::Display for FilterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterPhase::Pre => write!(f, "pre"),
            FilterPhase::Route => write!(f, "route"),
            FilterPhase::Post => write!(f, "post"),
            FilterPhase::Error => write!(f, "error"),
        }
    }
}

impl FromStr for FilterPhase {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pre" => Ok(FilterPhase::Pre),
            "route" => Ok(FilterPhase::Route),
            "post" => Ok(FilterPhase::Post),
            "error" => Ok(FilterPhase::Error),
            other => Err(GatewayError::ConfigError(format!("unknown filter phase '{other}'"))),
        }
    }
}

/// A unit of request/response processing.
///
/// Filters are registered once and then shared by every in-flight request,
/// so all per-request state goes into the [`RequestContext`].
#[async_trait::async_trait]
pub trait Filter: fmt::Debug + Send + Sync {
    /// Get the filter name.
    fn name(&self) -> &str;

    /// Phase the filter runs in unless configuration says otherwise.
    fn phase(&self) -> FilterPhase;

    /// Lower runs first within a phase.
    fn priority(&self) -> i32 {
        0
    }

    /// Applicability predicate; must not mutate anything.
    fn should_filter(&self, _ctx: &RequestContext) -> bool {
        true
    }

    /// Filter action.
    async fn run(&self, ctx: &mut RequestContext) -> Result<(), GatewayError>;
}

/// Route identifier plus the path to forward to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub route_id: String,
    pub forward_path: String,
}

impl RouteMatch {
    /// `/<route-id>/rest` → (`route-id`, `/rest`).
    pub fn from_first_segment(path: &str) -> Option<Self> {
        let trimmed = path.trim_start_matches('/');
        let (segment, rest) = match trimmed.split_once('/') {
            Some((segment, rest)) => (segment, rest),
            None => (trimmed, ""),
        };
        if segment.is_empty() {
            return None;
        }
        Some(Self {
            route_id: segment.to_string(),
            forward_path: format!("/{rest}"),
        })
    }
}

/// Resolves route identifiers and performs the outbound call.
#[async_trait::async_trait]
pub trait Router: fmt::Debug + Send + Sync {
    /// Derive a route for a request no route filter claimed.
    fn resolve(&self, request: &GatewayRequest) -> Option<RouteMatch> {
        RouteMatch::from_first_segment(&request.path)
    }

    /// Call the backend behind `route_id`.
    async fn invoke(
        &self,
        route_id: &str,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, FailureCause>;
}

/// Runs requests through the filter pipeline, the router and the
/// fallback registry.
///
/// All three collaborators are immutable once the core is built, so a
/// single instance is shared by every connection without locking.
#[derive(Debug, Clone)]
pub struct GatewayCore {
    router: Arc<dyn Router>,
    pipeline: Arc<FilterPipeline>,
    fallbacks: Arc<FallbackRegistry>,
}

impl GatewayCore {
    /// Create a core from a router, a populated pipeline and a populated registry.
    pub fn new(router: Arc<dyn Router>, pipeline: FilterPipeline, fallbacks: FallbackRegistry) -> Self {
        Self {
            router,
            pipeline: Arc::new(pipeline),
            fallbacks: Arc::new(fallbacks),
        }
    }

    /// The filter pipeline.
    pub fn pipeline(&self) -> &FilterPipeline {
        &self.pipeline
    }

    /// The fallback registry.
    pub fn fallbacks(&self) -> &FallbackRegistry {
        &self.fallbacks
    }

    /// Process a request that can't be cancelled.
    pub async fn process_request(
        &self,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let mut ctx = RequestContext::new(request);
        self.process(&mut ctx, std::future::pending()).await
    }

    /// Process a request, abandoning the backend call if `cancel` completes first.
    pub async fn process_request_until<C>(
        &self,
        request: GatewayRequest,
        cancel: C,
    ) -> Result<GatewayResponse, GatewayError>
    where
        C: Future<Output = ()> + Send,
    {
        let mut ctx = RequestContext::new(request);
        self.process(&mut ctx, cancel).await
    }

    /// Drive a prepared context through every phase. The context is left
    /// holding the terminal state under [`STATE_ANNOTATION`].
    pub async fn process<C>(
        &self,
        ctx: &mut RequestContext,
        cancel: C,
    ) -> Result<GatewayResponse, GatewayError>
    where
        C: Future<Output = ()> + Send,
    {
        tokio::pin!(cancel);

        debug_fmt!(
            "Gateway",
            "[{}] {} {} received",
            ctx.trace_id,
            ctx.request.method,
            ctx.request.path
        );

        /* ---------- PRE & ROUTE filters ---------- */
        for phase in [FilterPhase::Pre, FilterPhase::Route] {
            match self.pipeline.run(phase, ctx).await {
                PhaseOutcome::Completed => {}
                PhaseOutcome::ShortCircuited => return Ok(self.short_circuit(ctx)),
                PhaseOutcome::Failed { filter, error } => {
                    let cause = FailureCause::Filter {
                        filter,
                        message: error.to_string(),
                    };
                    return self.recover(ctx, cause).await;
                }
            }
        }

        /* ---------- resolve route ---------- */
        let route = match ctx.route_id.clone() {
            Some(route_id) => RouteMatch {
                route_id,
                forward_path: ctx
                    .forward_path
                    .clone()
                    .unwrap_or_else(|| ctx.request.path.clone()),
            },
            None => match self.router.resolve(&ctx.request) {
                Some(found) => found,
                None => {
                    let cause = FailureCause::NoRoute {
                        path: ctx.request.path.clone(),
                    };
                    return self.recover(ctx, cause).await;
                }
            },
        };
        ctx.route_id = Some(route.route_id.clone());
        ctx.forward_path = Some(route.forward_path.clone());

        /* ---------- invoke backend ---------- */
        let mut outbound = ctx.request.clone();
        outbound.path = route.forward_path;

        debug_fmt!(
            "Gateway",
            "[{}] routing to '{}' {}",
            ctx.trace_id,
            route.route_id,
            outbound.path
        );

        let upstream_start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = &mut cancel => Err(FailureCause::Cancelled),
            res = self.router.invoke(&route.route_id, outbound) => res,
        };
        let upstream_elapsed = upstream_start.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(cause) => return self.recover(ctx, cause).await,
        };

        /* ---------- POST filters ---------- */
        ctx.response = Some(response);
        if let PhaseOutcome::Failed { filter, error } =
            self.pipeline.run(FilterPhase::Post, ctx).await
        {
            let cause = FailureCause::Filter {
                filter,
                message: error.to_string(),
            };
            return self.recover(ctx, cause).await;
        }

        let response = ctx.response.take().ok_or_else(|| {
            GatewayError::Other("post filters discarded the response".to_string())
        })?;
        ctx.annotate(STATE_ANNOTATION, "responded");

        /* ---------- timing log ---------- */
        let overall_elapsed = ctx.elapsed();
        log::debug!(
            "[timing] {} {} -> {} | total={:?} upstream={:?} internal={:?}",
            ctx.request.method,
            ctx.request.path,
            response.status,
            overall_elapsed,
            upstream_elapsed,
            overall_elapsed.saturating_sub(upstream_elapsed)
        );

        Ok(response)
    }

    /// Build the response for a request a filter refused to forward.
    fn short_circuit(&self, ctx: &mut RequestContext) -> GatewayResponse {
        let status = ctx.status_override.unwrap_or(DEFAULT_REJECTION_STATUS);
        let body = ctx
            .body_override
            .clone()
            .unwrap_or_else(|| Bytes::from_static(DEFAULT_REJECTION_BODY.as_bytes()));
        ctx.annotate(STATE_ANNOTATION, "short-circuited");

        debug_fmt!(
            "Gateway",
            "[{}] short-circuited with status {}",
            ctx.trace_id,
            status
        );

        // A rejecting filter may have seeded headers on `response`.
        let mut response = ctx
            .response
            .take()
            .unwrap_or_else(|| GatewayResponse::new(status, Bytes::new()));
        response.status = status;
        response.body = body;
        ensure_content_type(response)
    }

    /// Run the error phase and substitute a fallback response if one is bound.
    async fn recover(
        &self,
        ctx: &mut RequestContext,
        cause: FailureCause,
    ) -> Result<GatewayResponse, GatewayError> {
        warn_fmt!(
            "Gateway",
            "[{}] {} {} failed: {}",
            ctx.trace_id,
            ctx.request.method,
            ctx.request.path,
            cause
        );

        ctx.response = None;
        ctx.failure = Some(cause.clone());
        self.pipeline.run(FilterPhase::Error, ctx).await;

        if cause == FailureCause::Cancelled {
            ctx.annotate(STATE_ANNOTATION, "cancelled");
            return Err(GatewayError::Cancelled);
        }

        let route_id = ctx
            .route_id
            .clone()
            .or_else(|| self.router.resolve(&ctx.request).map(|m| m.route_id));

        let provider = route_id
            .as_deref()
            .and_then(|route_id| self.fallbacks.resolve(route_id));

        match provider {
            Some(provider) => {
                debug_fmt!(
                    "Gateway",
                    "[{}] fallback '{}' answers for route '{}'",
                    ctx.trace_id,
                    provider.route(),
                    route_id.as_deref().unwrap_or_default()
                );
                ctx.annotate(STATE_ANNOTATION, "fallback");
                Ok(client_safe(provider.respond(&cause)))
            }
            None => {
                ctx.annotate(STATE_ANNOTATION, "error-propagated");
                Err(cause.into())
            }
        }
    }
}

/// Coerce a provider's answer into the shape clients are promised.
fn client_safe(synthetic: SyntheticResponse) -> GatewayResponse {
    let mut response = GatewayResponse::from(synthetic);
    if !(200..300).contains(&response.status) {
        warn_fmt!(
            "Gateway",
            "Fallback produced non-success status {}; answering 200 instead",
            response.status
        );
        response.status = 200;
    }
    ensure_content_type(response)
}

fn ensure_content_type(mut response: GatewayResponse) -> GatewayResponse {
    if !response.headers.contains_key(CONTENT_TYPE) {
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
    response
}
