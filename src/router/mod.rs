// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Default router – route identifiers to backend base URLs, over `reqwest`.
//!
//! ```toml
//! [proxy]
//! timeout = 30          # seconds, per backend call
//! failure_status = 400  # backend statuses at or above this are failures
//!
//! [[routes]]
//! id = "user-service"
//! target = "http://10.0.0.12:9000"
//! path = "/users/*"     # optional; otherwise `/user-service/**` is used
//! strip_prefix = true
//! ```
//!
//! A request no route filter claimed is matched against the explicit `path`
//! patterns in declaration order, then against the `/<route-id>/**`
//! convention.  The router never retries; every failure is reported to the
//! core as a [`FailureCause`].


use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{CONNECTION, CONTENT_LENGTH, HOST, HeaderMap, TRANSFER_ENCODING};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::config::Config;
use crate::core::{FailureCause, GatewayError, GatewayRequest, GatewayResponse, RouteMatch, Router};
use crate::filters::predicates::pattern_to_regex;
use crate::{debug_fmt, info_fmt, trace_fmt};

/// Configuration for a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// The route identifier
    pub id: String,
    /// The base URL of the backend
    pub target: String,
    /// Optional path pattern claiming requests for this route
    #[serde(default)]
    pub path: Option<String>,
    /// Remove the matched prefix before forwarding
    #[serde(default = "default_true")]
    pub strip_prefix: bool,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_failure_status() -> u16 {
    400
}

/// A path pattern bound to a route identifier.
#[derive(Debug, Clone)]
pub struct RouteRule {
    id: String,
    regex: Regex,
    prefix: String,
    strip_prefix: bool,
}

impl RouteRule {
    /// Compile `pattern` (`:param` segments, `*` wildcards) for route `id`.
    pub fn new(id: &str, pattern: &str, strip_prefix: bool) -> Result<Self, GatewayError> {
        let regex = Regex::new(&pattern_to_regex(pattern)).map_err(|e| {
            GatewayError::ConfigError(format!(
                "Invalid path pattern '{pattern}' for route '{id}': {e}"
            ))
        })?;

        // Literal part before the first wildcard or parameter.
        let prefix = pattern
            .split(['*', ':'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            id: id.to_string(),
            regex,
            prefix,
            strip_prefix,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The route and forward path for `path`, if the pattern matches.
    pub fn matches(&self, path: &str) -> Option<RouteMatch> {
        if !self.regex.is_match(path) {
            return None;
        }

        let forward_path = if self.strip_prefix {
            let rest = path.get(self.prefix.len()..).unwrap_or_default();
            if rest.is_empty() {
                "/".to_string()
            } else if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            }
        } else {
            path.to_string()
        };

        Some(RouteMatch {
            route_id: self.id.clone(),
            forward_path,
        })
    }
}

/// Headers that describe one connection and must not be copied to the next.
const HOP_BY_HOP: [reqwest::header::HeaderName; 4] =
    [HOST, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// `reqwest`-backed [`Router`].
#[derive(Debug)]
pub struct HttpRouter {
    client: reqwest::Client,
    targets: HashMap<String, String>,
    rules: Vec<RouteRule>,
    timeout: Duration,
    failure_status: u16,
}

impl HttpRouter {
    /// Build a router for `routes`. Route identifiers must be unique.
    pub fn new(
        routes: Vec<RouteConfig>,
        timeout: Duration,
        failure_status: u16,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(GatewayError::ClientError)?;

        let mut targets = HashMap::new();
        let mut rules = Vec::new();

        for route in routes {
            if targets.contains_key(&route.id) {
                return Err(GatewayError::ConfigError(format!(
                    "route '{}' is defined more than once",
                    route.id
                )));
            }
            if let Some(pattern) = &route.path {
                rules.push(RouteRule::new(&route.id, pattern, route.strip_prefix)?);
            }
            info_fmt!("Router", "Route '{}' -> {}", route.id, route.target);
            targets.insert(route.id, route.target);
        }

        Ok(Self {
            client,
            targets,
            rules,
            timeout,
            failure_status,
        })
    }

    /// Build a router from the `routes` and `proxy.*` configuration keys.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let routes: Vec<RouteConfig> = config.get_or_default("routes", Vec::new())?;
        let timeout_secs: u64 = config.get_or_default("proxy.timeout", default_timeout_secs())?;
        let failure_status: u16 =
            config.get_or_default("proxy.failure_status", default_failure_status())?;

        Self::new(routes, Duration::from_secs(timeout_secs), failure_status)
    }

    /// Known route identifiers.
    pub fn route_ids(&self) -> Vec<&str> {
        self.targets.keys().map(String::as_str).collect()
    }

    fn classify(&self, err: reqwest::Error) -> FailureCause {
        if err.is_timeout() {
            FailureCause::Timeout(self.timeout)
        } else if err.is_connect() {
            FailureCause::ConnectionRefused(err.to_string())
        } else {
            FailureCause::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl Router for HttpRouter {
    fn resolve(&self, request: &GatewayRequest) -> Option<RouteMatch> {
        self.rules
            .iter()
            .find_map(|rule| rule.matches(&request.path))
            .or_else(|| RouteMatch::from_first_segment(&request.path))
    }

    async fn invoke(
        &self,
        route_id: &str,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, FailureCause> {
        let target = self
            .targets
            .get(route_id)
            .ok_or_else(|| FailureCause::NoInstance {
                route: route_id.to_string(),
            })?;

        let mut url = format!("{}{}", target.trim_end_matches('/'), request.path);
        if let Some(query) = &request.query {
            url.push('?');
            url.push_str(query);
        }

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);

        debug_fmt!("Router", "{} {} -> {}", request.method, route_id, url);

        let send = self
            .client
            .request(request.method.into(), &url)
            .headers(headers)
            .body(request.body)
            .send();

        let resp = timeout(self.timeout, send)
            .await
            .map_err(|_| FailureCause::Timeout(self.timeout))?
            .map_err(|e| self.classify(e))?;

        let status = resp.status().as_u16();
        if status >= self.failure_status {
            return Err(FailureCause::BackendError { status });
        }

        let mut headers = resp.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = resp.bytes().await.map_err(|e| self.classify(e))?;

        trace_fmt!("Router", "'{}' answered {} ({} bytes)", route_id, status, body.len());

        Ok(GatewayResponse {
            status,
            headers,
            body,
        })
    }
}
