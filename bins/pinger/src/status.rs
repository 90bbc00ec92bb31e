#![cfg(feature = "web-api")]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use ping_core::job::JobStatus;
use ping_core::scheduler::Scheduler;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::info;

use crate::module::{Module, ModuleCtx};

#[derive(Clone)]
struct AppState {
    scheduler: Arc<Scheduler>,
    job: String,
    started: Instant,
}

#[derive(Serialize)]
struct Status {
    job: JobStatus,
    uptime_ms: u64,
}

pub struct StatusServer {
    addr: SocketAddr,
}

impl StatusServer {
    pub fn new(addr: SocketAddr) -> Self { Self { addr } }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(state)
}

impl Module for StatusServer {
    fn name(&self) -> &'static str { "status" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let state = AppState {
                scheduler: ctx.scheduler.clone(),
                job: ctx.job.clone(),
                started: Instant::now(),
            };

            let listener = tokio::net::TcpListener::bind(self.addr).await?;
            info!("status server listening on http://{}", self.addr);

            let mut shutdown = ctx.shutdown.clone();
            axum::serve(listener, router(state))
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await?;

            Ok(())
        })
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let job = state.scheduler.query(&state.job).await;
    let uptime_ms = state.started.elapsed().as_millis() as u64;
    Json(Status { job, uptime_ms })
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}
