// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP front end for the gateway.
//!
//! A thin wrapper around **hyper-util**: it owns the listening socket,
//! buffers each inbound body (bounded by `server.body_limit`), hands the
//! request to the [`GatewayCore`] and writes back whatever the core decided.
//!
//! Each request is processed on its own task.  If the client goes away
//! while the backend call is outstanding, hyper drops the handler; the
//! handler's drop guard then signals the task, the core abandons the call
//! and no fallback is attempted.
//!
//! `hyper_util::server::conn::auto::Builder` serves HTTP/1.1 and HTTP/2 on
//! the same connection.

mod health;

pub use health::HealthServer;

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{RwLock, oneshot};
use tokio::task::{Id, JoinSet};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use crate::config::{Config, ConfigError};
use crate::core::{
    GatewayCore, GatewayError, GatewayRequest, GatewayResponse, HttpMethod, RequestContext,
    STATE_ANNOTATION,
};
use crate::logging::config::LoggingConfig;
use crate::logging::middleware::LoggingMiddleware;
use crate::{debug_fmt, error_fmt, info_fmt, warn_fmt};

/// Status logged for a request whose client disconnected. Never sent.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Configuration for the HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Port serving `/health` and `/ready`
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Maximum inbound body size in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_health_port() -> u16 {
    8081
}

fn default_body_limit() -> usize {
    5 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            health_port: default_health_port(),
            body_limit: default_body_limit(),
        }
    }
}

impl ServerConfig {
    /// Read `server.*` key by key, so a single overridden key (say
    /// `FALLGATE_SERVER__PORT`) does not hide the rest of the file's table.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            host: config.get_or_default("server.host", default_host())?,
            port: config.get_or_default("server.port", default_port())?,
            health_port: config.get_or_default("server.health_port", default_health_port())?,
            body_limit: config.get_or_default("server.body_limit", default_body_limit())?,
        })
    }
}

/// HTTP server driving a [`GatewayCore`].
#[derive(Debug, Clone)]
pub struct GatewayServer {
    config: ServerConfig,
    core: Arc<GatewayCore>,
    access_log: LoggingMiddleware,
    shutdown_senders: Arc<RwLock<HashMap<Id, oneshot::Sender<()>>>>,
}

impl GatewayServer {
    pub fn new(config: ServerConfig, core: Arc<GatewayCore>, logging: LoggingConfig) -> Self {
        Self {
            config,
            core,
            access_log: LoggingMiddleware::new(logging),
            shutdown_senders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured ports and serve until Ctrl-C or SIGTERM.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let addr = format!("{}:{}", self.config.host, self.config.port)
            .parse::<SocketAddr>()
            .map_err(|e| GatewayError::ConfigError(format!("Invalid server address: {e}")))?;

        let listener = TcpListener::bind(addr).await?;
        info_fmt!("Server", "Gateway listening on http://{}", addr);

        let health = HealthServer::bind(&self.config.host, self.config.health_port).await?;

        #[cfg(unix)]
        let mut term_stream = signal(SignalKind::terminate())
            .map_err(|e| GatewayError::Other(format!("Cannot install SIGTERM handler: {e}")))?;

        let shutdown = async move {
            #[cfg(unix)]
            let sigterm = term_stream.recv();
            #[cfg(not(unix))]
            let sigterm = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = signal::ctrl_c() => info_fmt!("Server", "Received Ctrl-C; initiating graceful shutdown"),
                _ = sigterm => info_fmt!("Server", "Received SIGTERM; initiating graceful shutdown"),
            }
        };

        health.set_ready();
        let result = self.serve(listener, shutdown).await;
        health.set_not_ready();
        result
    }

    /// Accept connections on `listener` until `shutdown` completes, then
    /// drain open connections.
    pub async fn serve<S>(&self, listener: TcpListener, shutdown: S) -> Result<(), GatewayError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut join_set = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accept = listener.accept() => {
                    let (stream, remote_addr) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error_fmt!("Server", "Accept error: {}", e);
                            continue;
                        }
                    };

                    let (tx, rx) = oneshot::channel();
                    let handle = join_set.spawn(serve_connection(
                        stream,
                        remote_addr,
                        self.core.clone(),
                        self.access_log.clone(),
                        self.config.body_limit,
                        rx,
                        self.shutdown_senders.clone(),
                    ));
                    self.shutdown_senders.write().await.insert(handle.id(), tx);
                }
            }
        }

        {
            let mut senders = self.shutdown_senders.write().await;
            info_fmt!("Server", "Signaling {} connection(s) to shut down", senders.len());
            for (_, sender) in senders.drain() {
                let _ = sender.send(());
            }
        }

        let drain = async {
            while let Some(res) = join_set.join_next().await {
                if let Err(e) = res {
                    if !e.is_cancelled() {
                        error_fmt!("Server", "Connection task failed: {}", e);
                    }
                }
            }
        };

        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn_fmt!(
                "Server",
                "Shutdown timed out after {}s; closing remaining connections",
                SHUTDOWN_GRACE.as_secs()
            );
            join_set.shutdown().await;
        }

        info_fmt!("Server", "Shutdown complete");
        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    remote_addr: SocketAddr,
    core: Arc<GatewayCore>,
    access_log: LoggingMiddleware,
    body_limit: usize,
    shutdown: oneshot::Receiver<()>,
    senders: Arc<RwLock<HashMap<Id, oneshot::Sender<()>>>>,
) {
    let task_id = tokio::task::id();

    let service = service_fn(move |req: Request<Incoming>| {
        handle_request(req, core.clone(), access_log.clone(), remote_addr, body_limit)
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), service);
    let mut conn = std::pin::pin!(conn);

    let result = tokio::select! {
        res = &mut conn => res,
        _ = shutdown => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        let msg = e.to_string();
        if !msg.contains("connection closed") && !msg.contains("connection reset") {
            error_fmt!("Server", "Connection error from {}: {}", remote_addr, e);
        }
    }

    senders.write().await.remove(&task_id);
}

/// Signals the processing task when the handler is dropped before it
/// finishes, i.e. when the client disconnected.
struct CancelOnDrop(Option<oneshot::Sender<()>>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0.take();
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    core: Arc<GatewayCore>,
    access_log: LoggingMiddleware,
    remote_addr: SocketAddr,
    body_limit: usize,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let info = access_log.begin(&req, Some(remote_addr));

    let request = match convert_hyper_request(req, body_limit).await {
        Ok(request) => request,
        Err(status) => {
            let mut response = plain_response(status, status_text(status));
            access_log.stamp(response.headers_mut(), &info.trace_id);
            access_log.finish(status, &info, "rejected");
            return Ok(response);
        }
    };

    let mut ctx = RequestContext::new(request)
        .with_client_ip(remote_addr.ip().to_string())
        .with_trace_id(info.trace_id.clone());

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let guard = CancelOnDrop(Some(cancel_tx));

    let task = tokio::spawn(async move {
        // A dropped sender means the handler finished normally.
        let cancel = async move {
            if cancel_rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        let result = core.process(&mut ctx, cancel).await;
        let state = ctx
            .annotation(STATE_ANNOTATION)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        (result, state)
    });

    let joined = task.await;
    guard.disarm();

    let (mut response, state) = match joined {
        Ok((Ok(resp), state)) => (to_hyper_response(resp), state),
        Ok((Err(e), state)) => {
            let status = error_status(&e);
            debug_fmt!("Server", "[{}] mapped error to {}: {}", info.trace_id, status, e);
            (plain_response(status, status_text(status)), state)
        }
        Err(e) => {
            error_fmt!("Server", "[{}] request task failed: {}", info.trace_id, e);
            (plain_response(500, status_text(500)), "error-propagated".to_string())
        }
    };

    access_log.stamp(response.headers_mut(), &info.trace_id);
    access_log.finish(response.status().as_u16(), &info, &state);

    Ok(response)
}

/// Buffer the inbound request. Fails with the status to answer.
async fn convert_hyper_request(
    req: Request<Incoming>,
    body_limit: usize,
) -> Result<GatewayRequest, u16> {
    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, body_limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let too_large = e.downcast_ref::<http_body_util::LengthLimitError>().is_some();
            warn_fmt!("Server", "Failed to read request body: {}", e);
            return Err(if too_large { 413 } else { 400 });
        }
    };

    Ok(GatewayRequest {
        method: HttpMethod::from(&parts.method),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    })
}

/// Status for a failure no fallback absorbed. Bodies stay generic.
pub fn error_status(err: &GatewayError) -> u16 {
    match err {
        GatewayError::RoutingError(_) => 404,
        GatewayError::Upstream(crate::core::FailureCause::Timeout(_)) => 504,
        GatewayError::Upstream(_) | GatewayError::ClientError(_) => 502,
        GatewayError::Cancelled => CLIENT_CLOSED_REQUEST,
        _ => 500,
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        404 => "Route not found",
        413 => "Payload Too Large",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        CLIENT_CLOSED_REQUEST => "Client Closed Request",
        _ => "Internal Server Error",
    }
}

fn plain_response(status: u16, body: &'static str) -> Response<Full<Bytes>> {
    let mut headers = HeaderMap::new();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    build_response(status, headers, Bytes::from_static(body.as_bytes()))
}

fn to_hyper_response(resp: GatewayResponse) -> Response<Full<Bytes>> {
    build_response(resp.status, resp.headers, resp.body)
}

fn build_response(status: u16, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    *response.headers_mut() = headers;
    response
}
