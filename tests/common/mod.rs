// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for the integration tests.

use fallgate::Gateway;
use fallgate::config::{ConfigError, ConfigProvider};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Configuration backed by one JSON document; keys are dot paths into it.
#[derive(Debug, Clone)]
pub struct TestConfigProvider {
    document: Value,
}

#[allow(dead_code)]
impl TestConfigProvider {
    pub fn from_json(document: Value) -> Self {
        Self { document }
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.document, |value, part| match value {
                Value::Array(items) => items.get(part.parse::<usize>().ok()?),
                other => other.get(part),
            })
    }
}

impl ConfigProvider for TestConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    fn provider_name(&self) -> &str {
        "test"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.lookup(key).cloned())
    }
}

/// A running gateway; dropping it stops the accept loop.
#[allow(dead_code)]
pub struct RunningGateway {
    pub addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

#[allow(dead_code)]
impl RunningGateway {
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }
}

/// Serve `gateway` on an ephemeral port.
#[allow(dead_code)]
pub async fn spawn(gateway: Gateway) -> RunningGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        gateway
            .server()
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
    });

    RunningGateway {
        addr,
        _shutdown: tx,
    }
}

#[allow(dead_code)]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
