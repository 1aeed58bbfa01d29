// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liveness and readiness probes on a separate port.
//!
//! `/health` answers `OK` while the process runs; `/ready` answers `READY`
//! only between startup and the beginning of shutdown.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming as IncomingBody;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::{debug_fmt, info_fmt, warn_fmt};

#[derive(Debug)]
pub struct HealthServer {
    is_ready: Arc<AtomicBool>,
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl HealthServer {
    /// Bind `host:port` and start answering probes. Not ready until
    /// [`HealthServer::set_ready`] is called.
    pub async fn bind(host: &str, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info_fmt!("Health", "Health probes on http://{}", local_addr);

        let is_ready = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(accept_loop(listener, is_ready.clone()));

        Ok(Self {
            is_ready,
            local_addr,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_ready(&self) {
        self.is_ready.store(true, Ordering::Relaxed);
    }

    pub fn set_not_ready(&self) {
        self.is_ready.store(false, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Relaxed)
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, is_ready: Arc<AtomicBool>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn_fmt!("Health", "Accept failed: {}", e);
                continue;
            }
        };

        let ready = is_ready.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<IncomingBody>| {
                let ready = ready.load(Ordering::Relaxed);
                async move { Ok::<_, Infallible>(probe(req.uri().path(), ready)) }
            });

            let builder = AutoBuilder::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(stream), service);
            if let Err(err) = conn.await {
                debug_fmt!("Health", "Connection error: {}", err);
            }
        });
    }
}

fn probe(path: &str, ready: bool) -> Response<Full<Bytes>> {
    let (status, body) = match path {
        "/health" => (StatusCode::OK, "OK"),
        "/ready" if ready => (StatusCode::OK, "READY"),
        "/ready" => (StatusCode::SERVICE_UNAVAILABLE, "NOT READY"),
        _ => (StatusCode::NOT_FOUND, "Not Found"),
    };

    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
        let url = format!("http://{addr}{path}");
        let response = timeout(Duration::from_secs(5), reqwest::get(&url))
            .await
            .unwrap()
            .unwrap();
        let status = response.status().as_u16();
        (status, response.text().await.unwrap())
    }

    #[test]
    fn test_probe_responses() {
        assert_eq!(probe("/health", false).status(), StatusCode::OK);
        assert_eq!(probe("/ready", false).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(probe("/ready", true).status(), StatusCode::OK);
        assert_eq!(probe("/metrics", true).status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_readiness_over_http() {
        let health = HealthServer::bind("127.0.0.1", 0).await.unwrap();
        let addr = health.local_addr();

        assert_eq!(get(addr, "/health").await, (200, "OK".to_string()));
        assert_eq!(get(addr, "/ready").await, (503, "NOT READY".to_string()));

        health.set_ready();
        assert!(health.is_ready());
        assert_eq!(get(addr, "/ready").await, (200, "READY".to_string()));

        health.set_not_ready();
        assert_eq!(get(addr, "/ready").await, (503, "NOT READY".to_string()));
        assert_eq!(get(addr, "/nope").await, (404, "Not Found".to_string()));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let first = HealthServer::bind("127.0.0.1", 0).await.unwrap();
        let port = first.local_addr().port();

        assert!(HealthServer::bind("127.0.0.1", port).await.is_err());
    }
}
