// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access logging around each inbound request, keyed by trace id.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use hyper::Request;

use crate::logging::config::LoggingConfig;
use crate::logging::structured::{RequestInfo, generate_trace_id};

/// Logs request arrival and completion, and stamps the trace id on responses.
#[derive(Debug, Clone)]
pub struct LoggingMiddleware {
    config: Arc<LoggingConfig>,
}

impl LoggingMiddleware {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Record the arrival of `req` and pick its trace id.
    pub fn begin<B>(&self, req: &Request<B>, remote_addr: Option<SocketAddr>) -> RequestInfo {
        let remote_addr = remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        let trace_id = self
            .inbound_trace_id(req.headers())
            .unwrap_or_else(generate_trace_id);

        let mut info = RequestInfo::new(
            req.method().to_string(),
            req.uri().path().to_string(),
            remote_addr,
            user_agent,
        );
        info.trace_id = trace_id;

        if self.config.structured {
            slog::info!(slog_scope::logger(), "Request received";
                "trace_id" => &info.trace_id,
                "method" => &info.method,
                "path" => &info.path,
                "remote_addr" => &info.remote_addr,
                "user_agent" => &info.user_agent
            );
        } else {
            log::info!(
                "Request received: {} {} from {} (trace_id: {})",
                info.method,
                info.path,
                info.remote_addr,
                info.trace_id
            );
        }

        info
    }

    /// Record completion; `state` is the request's terminal gateway state.
    pub fn finish(&self, status: u16, info: &RequestInfo, state: &str) {
        let elapsed_ms = info.elapsed_ms();

        if self.config.structured {
            slog::info!(slog_scope::logger(), "Response completed";
                "trace_id" => &info.trace_id,
                "method" => &info.method,
                "path" => &info.path,
                "status" => status,
                "state" => state,
                "elapsed_ms" => elapsed_ms
            );
        } else {
            log::info!(
                "{} {} -> {} [{}] in {}ms (trace_id: {})",
                info.method,
                info.path,
                status,
                state,
                elapsed_ms,
                info.trace_id
            );
        }
    }

    /// Echo the trace id on an outgoing response, if enabled.
    pub fn stamp(&self, headers: &mut HeaderMap, trace_id: &str) {
        if !self.config.include_trace_id {
            return;
        }
        let name = HeaderName::from_bytes(self.config.trace_id_header.as_bytes())
            .unwrap_or_else(|_| HeaderName::from_static("x-trace-id"));
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            headers.insert(name, value);
        }
    }

    fn inbound_trace_id(&self, headers: &HeaderMap) -> Option<String> {
        if !self.config.propagate_trace_id {
            return None;
        }
        headers
            .get(self.config.trace_id_header.as_str())
            .and_then(|h| h.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}
