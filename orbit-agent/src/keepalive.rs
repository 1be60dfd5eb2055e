use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::time::Instant;
use tracing::info;

/// `/check` reports unhealthy once the dispatcher has been silent this long
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

const SERVICE_HEADER: (&str, &str) = ("X-Service", "orbit");

/// Last time the dispatcher loop proved it was alive
#[derive(Clone, Debug, Default)]
pub struct Keepalive {
    last: Arc<Mutex<Option<Instant>>>,
}

impl Keepalive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ping(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    pub fn is_alive(&self) -> bool {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() < KEEPALIVE_TIMEOUT)
    }
}

async fn check(State(keepalive): State<Keepalive>) -> Response {
    if keepalive.is_alive() {
        ([SERVICE_HEADER], "OK\n").into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [SERVICE_HEADER],
            "keepalive expired\n",
        )
            .into_response()
    }
}

pub fn router(keepalive: Keepalive) -> Router {
    Router::new()
        .route("/check", get(check))
        .with_state(keepalive)
}

/// Serves `GET /check` until the listener fails
pub async fn serve(keepalive: Keepalive, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "keepalive endpoint listening");
    axum::serve(listener, router(keepalive)).await?;
    Ok(())
}
