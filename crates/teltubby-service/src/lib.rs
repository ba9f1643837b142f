// Copyright 2026 The teltubby Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The ambient health/metrics HTTP surface both binaries run alongside
//! their real work: `GET /healthz` for the orchestrator's liveness probe,
//! `GET /metrics` for Prometheus text-format scraping of whatever
//! [`prometheus_client::registry::Registry`] the caller built up out of
//! its own component metrics.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus_client::registry::Registry;
use teltubby_error::{make_err, Code, Error};
use teltubby_util::task::JoinHandleDropGuard;

/// Flipped by the caller once startup (config load, store connectivity
/// probe, queue connection) has succeeded; `/healthz` answers 503 until
/// then instead of claiming liveness the process doesn't have yet.
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self { ready: AtomicBool::new(false) }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// A bound-and-spawned health/metrics listener. Dropping it aborts the
/// server task, same as every other long-lived task in this workspace.
pub struct MetricsServer {
    _task: JoinHandleDropGuard<()>,
}

impl MetricsServer {
    /// Binds `addr` and starts serving in the background. Binding happens
    /// synchronously so a misconfigured `metrics_addr` fails startup
    /// immediately rather than surfacing as a silently-dead task.
    pub fn spawn(addr: SocketAddr, registry: Arc<Registry>, health: Arc<HealthState>) -> Result<Self, Error> {
        let make_svc = make_service_fn(move |_conn| {
            let registry = registry.clone();
            let health = health.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let registry = registry.clone();
                    let health = health.clone();
                    async move { Ok::<_, Infallible>(handle(req, &registry, &health)) }
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .map_err(|err| make_err!(Code::Unavailable, "binding health/metrics listener on {addr}: {err}"))?
            .serve(make_svc);

        let task = teltubby_util::spawn!("health-metrics-server", async move {
            if let Err(err) = server.await {
                tracing::error!(%err, "health/metrics server exited");
            }
        });

        Ok(Self { _task: task })
    }
}

fn handle(req: Request<Body>, registry: &Registry, health: &HealthState) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => {
            if health.is_ready() {
                Response::new(Body::from("ok"))
            } else {
                let mut resp = Response::new(Body::from("not ready"));
                *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                resp
            }
        }
        (&Method::GET, "/metrics") => {
            let body = teltubby_util::metrics::render(registry);
            let mut resp = Response::new(Body::from(body));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/openmetrics-text; version=1.0.0; charset=utf-8"),
            );
            resp
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_reports_not_ready_until_flipped() {
        let registry = Arc::new(Registry::default());
        let health = Arc::new(HealthState::new());
        assert!(!health.is_ready());

        let req = Request::builder().method(Method::GET).uri("/healthz").body(Body::empty()).unwrap();
        let resp = handle(req, &registry, &health);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        health.set_ready(true);
        let req = Request::builder().method(Method::GET).uri("/healthz").body(Body::empty()).unwrap();
        let resp = handle(req, &registry, &health);
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_registered_counters() {
        use prometheus_client::metrics::counter::Counter;

        let mut registry = Registry::default();
        let counter: Counter = Counter::default();
        counter.inc();
        registry.register("teltubby_test_total", "a test counter", counter);
        let registry = Arc::new(registry);
        let health = Arc::new(HealthState::new());

        let req = Request::builder().method(Method::GET).uri("/metrics").body(Body::empty()).unwrap();
        let resp = handle(req, &registry, &health);
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("teltubby_test_total"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let registry = Arc::new(Registry::default());
        let health = Arc::new(HealthState::new());
        let req = Request::builder().method(Method::GET).uri("/nope").body(Body::empty()).unwrap();
        let resp = handle(req, &registry, &health);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
