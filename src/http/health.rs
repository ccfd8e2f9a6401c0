use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::State as AxumState,
    response::{IntoResponse, Response},
    routing::get,
};
use http::StatusCode;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Result, http::shutdown};

/// Liveness goes stale when no reconcile has completed for this long.
const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Shared progress marker between the reconcile loop and the liveness probe.
pub struct HealthState {
    started: Instant,
    last_reconcile: RwLock<Option<Instant>>,
}

impl HealthState {
    pub fn mark_reconciled(&self) {
        *self.last_reconcile.write().unwrap() = Some(Instant::now());
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn stale(&self) -> bool {
        match *self.last_reconcile.read().unwrap() {
            Some(at) => at.elapsed() > STALE_AFTER,
            None => self.uptime() > STALE_AFTER,
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            last_reconcile: RwLock::new(None),
        }
    }
}

#[derive(Clone)]
pub(crate) struct State {
    ready: CancellationToken,
    health: Arc<HealthState>,
}

impl State {
    pub fn new(ready: CancellationToken, health: Arc<HealthState>) -> Self {
        Self { ready, health }
    }

    pub fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    pub fn liveness(&self) -> Liveness {
        if self.health.stale() {
            Liveness::Stale {
                uptime: self.health.uptime(),
            }
        } else {
            Liveness::Ok {
                uptime: self.health.uptime(),
            }
        }
    }

    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        let registry = &*crate::metrics::REGISTRY.read().unwrap();
        match prometheus_client::encoding::text::encode(&mut buffer, registry) {
            Ok(_) => buffer,
            Err(_) => "".into(),
        }
    }
}

pub(crate) async fn serve(
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("health and metrics listening on {}", addr);

    let app = router(state)?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub fn router(state: Arc<State>) -> Result<Router> {
    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state))
}

async fn healthz(AxumState(handler): AxumState<Arc<State>>) -> Liveness {
    handler.liveness()
}

async fn readyz(AxumState(handler): AxumState<Arc<State>>) -> Readiness {
    handler.ready()
}

async fn metrics(AxumState(handler): AxumState<Arc<State>>) -> String {
    handler.metrics()
}

pub(crate) enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        match self {
            Readiness::Ready => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(axum::body::Body::from("Ok"))
                .unwrap(),
            Readiness::NotReady => Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header("Content-Type", "text/plain")
                .body(axum::body::Body::from("NotReady"))
                .unwrap(),
        }
    }
}

pub(crate) enum Liveness {
    Ok { uptime: Duration },
    Stale { uptime: Duration },
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime: String,
}

impl IntoResponse for Liveness {
    fn into_response(self) -> Response {
        let (status, code, uptime) = match self {
            Liveness::Ok { uptime } => ("ok", StatusCode::OK, uptime),
            Liveness::Stale { uptime } => ("stale", StatusCode::SERVICE_UNAVAILABLE, uptime),
        };
        let body = serde_json::to_string(&HealthResponse {
            status,
            uptime: format!("{uptime:?}"),
        })
        .unwrap_or_default();
        Response::builder()
            .status(code)
            .header("Content-Type", "application/json")
            .body(axum::body::Body::from(body))
            .unwrap()
    }
}
