// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-request state shared by the filters of one request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;

use super::{FailureCause, FilterPhase, GatewayRequest, GatewayResponse};
use crate::logging::structured::generate_trace_id;

/// Mutable state owned by exactly one in-flight request.
///
/// The decision fields (`should_forward`, `status_override`,
/// `body_override`) are typed; anything else a filter wants to hand to a
/// later filter goes into `annotations`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The inbound request; pre and route filters may rewrite it.
    pub request: GatewayRequest,
    /// Phase currently executing.
    pub phase: FilterPhase,
    /// Cleared by a pre/route filter to answer without calling the backend.
    pub should_forward: bool,
    /// Status used when the request is short-circuited.
    pub status_override: Option<u16>,
    /// Body used when the request is short-circuited.
    pub body_override: Option<Bytes>,
    /// Free-form data filters pass to each other.
    pub annotations: HashMap<String, Value>,
    /// Route identifier chosen by a route filter or by the router.
    pub route_id: Option<String>,
    /// Path sent to the backend.
    pub forward_path: Option<String>,
    /// Backend response, present while post filters run. A pre/route filter
    /// that rejects the request may seed it with response headers.
    pub response: Option<GatewayResponse>,
    /// Failure being handled, present while error filters run.
    pub failure: Option<FailureCause>,
    /// The original client's IP address
    pub client_ip: Option<String>,
    /// When the request entered the gateway
    pub start_time: Instant,
    /// Correlates log lines of one request
    pub trace_id: String,
}

impl RequestContext {
    /// Fresh context for an inbound request.
    pub fn new(request: GatewayRequest) -> Self {
        Self {
            request,
            phase: FilterPhase::Pre,
            should_forward: true,
            status_override: None,
            body_override: None,
            annotations: HashMap::new(),
            route_id: None,
            forward_path: None,
            response: None,
            failure: None,
            client_ip: None,
            start_time: Instant::now(),
            trace_id: generate_trace_id(),
        }
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Stop forwarding and answer with `status` and `body` instead.
    pub fn reject(&mut self, status: u16, body: impl Into<Bytes>) {
        self.should_forward = false;
        self.status_override = Some(status);
        self.body_override = Some(body.into());
    }

    /// Set an annotation, replacing any previous value.
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Read an annotation.
    pub fn annotation(&self, key: &str) -> Option<&Value> {
        self.annotations.get(key)
    }

    /// Time since the request entered the gateway.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}
