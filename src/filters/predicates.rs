// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Applicability predicates.
//!
//! A filter descriptor may carry a `when` list; the filter only runs for
//! requests on which every predicate holds.
//!
//! | type       | configuration                                  |
//! |------------|------------------------------------------------|
//! | `path`     | `{ "pattern": "/api/:version/*" }`             |
//! | `method`   | `{ "methods": ["GET", "HEAD"] }`               |
//! | `header`   | `{ "headers": { "X-Tenant": "acme" } }`        |
//! | `query`    | `{ "params": { "debug": "1" } }`               |
//! | `route`    | `{ "routes": ["user-service"] }`               |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{GatewayError, HttpMethod, RequestContext};
use crate::error_fmt;

/// Configuration for a predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateConfig {
    /// The type of predicate
    #[serde(rename = "type")]
    pub type_: String,
    /// The configuration for the predicate
    pub config: serde_json::Value,
}

/// A pure function of the request context.
pub trait Predicate: Send + Sync + fmt::Debug {
    /// Check if the context matches this predicate.
    fn matches(&self, ctx: &RequestContext) -> bool;

    /// Get the predicate type.
    fn predicate_type(&self) -> &str;
}

/// Convert a path pattern (`:param` segments, `*` wildcards) into an
/// anchored regex.
pub(crate) fn pattern_to_regex(pattern: &str) -> String {
    let mut regex_pattern = "^".to_string();

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ':' => {
                while chars
                    .peek()
                    .is_some_and(|next| next.is_alphanumeric() || *next == '_')
                {
                    chars.next();
                }
                regex_pattern.push_str("([^/]+)");
            }
            '*' => regex_pattern.push_str("(.*)"),
            '.' | '^' | '$' | '|' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '\\' => {
                regex_pattern.push('\\');
                regex_pattern.push(c);
            }
            _ => regex_pattern.push(c),
        }
    }

    regex_pattern.push('$');
    regex_pattern
}

/// Configuration for a path predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathPredicateConfig {
    /// The path pattern to match
    pub pattern: String,
}

/// A predicate that matches on request path.
#[derive(Debug)]
pub struct PathPredicate {
    regex: Regex,
}

impl PathPredicate {
    /// Create a new path predicate with the given configuration.
    pub fn new(config: PathPredicateConfig) -> Result<Self, GatewayError> {
        let regex = Regex::new(&pattern_to_regex(&config.pattern)).map_err(|e| {
            GatewayError::ConfigError(format!(
                "Invalid path predicate pattern '{}': {}",
                config.pattern, e
            ))
        })?;

        Ok(Self { regex })
    }
}

impl Predicate for PathPredicate {
    fn matches(&self, ctx: &RequestContext) -> bool {
        self.regex.is_match(&ctx.request.path)
    }

    fn predicate_type(&self) -> &str {
        "path"
    }
}

/// Configuration for a method predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodPredicateConfig {
    /// The HTTP methods to match
    pub methods: Vec<HttpMethod>,
}

/// A predicate that matches on HTTP method.
#[derive(Debug)]
pub struct MethodPredicate {
    config: MethodPredicateConfig,
}

impl MethodPredicate {
    pub fn new(config: MethodPredicateConfig) -> Self {
        Self { config }
    }
}

impl Predicate for MethodPredicate {
    fn matches(&self, ctx: &RequestContext) -> bool {
        self.config.methods.contains(&ctx.request.method)
    }

    fn predicate_type(&self) -> &str {
        "method"
    }
}

/// Configuration for a header predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderPredicateConfig {
    /// The headers to match (name and value)
    pub headers: HashMap<String, String>,
    /// Whether to require exact match for header values
    #[serde(default)]
    pub exact_match: bool,
}

/// A predicate that matches on request headers.
#[derive(Debug)]
pub struct HeaderPredicate {
    config: HeaderPredicateConfig,
}

impl HeaderPredicate {
    pub fn new(config: HeaderPredicateConfig) -> Self {
        Self { config }
    }
}

impl Predicate for HeaderPredicate {
    fn matches(&self, ctx: &RequestContext) -> bool {
        self.config.headers.iter().all(|(name, expected)| {
            match ctx.request.header(name) {
                Some(actual) if self.config.exact_match => actual == expected,
                Some(actual) => actual.contains(expected.as_str()),
                None => false,
            }
        })
    }

    fn predicate_type(&self) -> &str {
        "header"
    }
}

/// Configuration for a query parameter predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPredicateConfig {
    /// The query parameters to match (name and value)
    pub params: HashMap<String, String>,
    /// Whether to require exact match for parameter values
    #[serde(default)]
    pub exact_match: bool,
}

/// A predicate that matches on query parameters.
#[derive(Debug)]
pub struct QueryPredicate {
    config: QueryPredicateConfig,
}

impl QueryPredicate {
    pub fn new(config: QueryPredicateConfig) -> Self {
        Self { config }
    }
}

impl Predicate for QueryPredicate {
    fn matches(&self, ctx: &RequestContext) -> bool {
        self.config.params.iter().all(|(name, expected)| {
            match ctx.request.query_param(name) {
                Some(actual) if self.config.exact_match => actual == *expected,
                Some(actual) => actual.contains(expected.as_str()),
                None => false,
            }
        })
    }

    fn predicate_type(&self) -> &str {
        "query"
    }
}

/// Configuration for a route-identifier predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteIdPredicateConfig {
    /// Route identifiers the filter applies to
    pub routes: Vec<String>,
}

/// Matches once a route identifier has been chosen. Useful for post and
/// error filters that only concern one backend.
#[derive(Debug)]
pub struct RouteIdPredicate {
    config: RouteIdPredicateConfig,
}

impl RouteIdPredicate {
    pub fn new(config: RouteIdPredicateConfig) -> Self {
        Self { config }
    }
}

impl Predicate for RouteIdPredicate {
    fn matches(&self, ctx: &RequestContext) -> bool {
        ctx.route_id
            .as_ref()
            .is_some_and(|id| self.config.routes.contains(id))
    }

    fn predicate_type(&self) -> &str {
        "route"
    }
}

/// Factory for creating predicates based on configuration.
#[derive(Debug)]
pub struct PredicateFactory;

impl PredicateFactory {
    /// Create a predicate based on the predicate type and configuration.
    pub fn create_predicate(
        predicate_type: &str,
        config: serde_json::Value,
    ) -> Result<Arc<dyn Predicate>, GatewayError> {
        log::debug!(
            "Creating predicate of type '{}' with config: {}",
            predicate_type,
            config
        );

        fn parse<T: serde::de::DeserializeOwned>(
            predicate_type: &str,
            config: serde_json::Value,
        ) -> Result<T, GatewayError> {
            serde_json::from_value(config).map_err(|e| {
                let err = GatewayError::ConfigError(format!(
                    "Invalid {predicate_type} predicate config: {e}"
                ));
                error_fmt!("Predicate", "{}", err);
                err
            })
        }

        match predicate_type {
            "path" => Ok(Arc::new(PathPredicate::new(parse(predicate_type, config)?)?)),
            "method" => Ok(Arc::new(MethodPredicate::new(parse(predicate_type, config)?))),
            "header" => Ok(Arc::new(HeaderPredicate::new(parse(predicate_type, config)?))),
            "query" => Ok(Arc::new(QueryPredicate::new(parse(predicate_type, config)?))),
            "route" => Ok(Arc::new(RouteIdPredicate::new(parse(predicate_type, config)?))),
            _ => {
                let err =
                    GatewayError::ConfigError(format!("Unknown predicate type: {predicate_type}"));
                error_fmt!("Predicate", "{}", err);
                Err(err)
            }
        }
    }
}
