use crate::budget::BufferBudget;
use crate::scheduler::Scheduler;
use crate::Result;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::net::TcpListener;
use tracing::info;

/// Shared adaptation counters
#[derive(Debug, Default)]
pub struct Metrics {
    pub xactions_created: AtomicU64,
    pub xactions_aborted: AtomicU64,
    pub virgin_chunks: AtomicU64,
    pub virgin_bytes: AtomicU64,
    pub adapted_chunks: AtomicU64,
    // Background unit accounting
    pub workers_launched: AtomicU64,
    pub workers_cancelled: AtomicU64,
    pub workers_degraded: AtomicU64,
    // Degrade paths
    pub hook_failures: AtomicU64,
    pub budget_rejections: AtomicU64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            xactions_created: self.xactions_created.load(Ordering::Relaxed),
            xactions_aborted: self.xactions_aborted.load(Ordering::Relaxed),
            virgin_chunks: self.virgin_chunks.load(Ordering::Relaxed),
            virgin_bytes: self.virgin_bytes.load(Ordering::Relaxed),
            adapted_chunks: self.adapted_chunks.load(Ordering::Relaxed),
            workers_launched: self.workers_launched.load(Ordering::Relaxed),
            workers_cancelled: self.workers_cancelled.load(Ordering::Relaxed),
            workers_degraded: self.workers_degraded.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            budget_rejections: self.budget_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub xactions_created: u64,
    pub xactions_aborted: u64,
    pub virgin_chunks: u64,
    pub virgin_bytes: u64,
    pub adapted_chunks: u64,
    pub workers_launched: u64,
    pub workers_cancelled: u64,
    pub workers_degraded: u64,
    pub hook_failures: u64,
    pub budget_rejections: u64,
}

/// Everything the admin API reports on
#[derive(Debug, Clone)]
pub struct AdminState {
    pub metrics: Arc<Metrics>,
    pub scheduler: Arc<Scheduler>,
    pub budget: BufferBudget,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct MetricsResponse {
    counters: MetricsSnapshot,
    scheduler: SchedulerGauges,
    buffered_bytes: usize,
    buffer_memory_limit: usize,
}

#[derive(Serialize)]
struct SchedulerGauges {
    working: usize,
    waiting: usize,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(move || metrics_handler(state.clone())))
}

pub async fn start_admin_server(port: u16, state: AdminState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        crate::error::AdapterError::Configuration(format!(
            "Failed to bind admin port {}: {}",
            port, e
        ))
    })?;

    serve_admin(listener, state).await
}

/// Serve the admin API on an already bound listener
pub async fn serve_admin(listener: TcpListener, state: AdminState) -> Result<()> {
    info!("Starting Admin API on {}", listener.local_addr()?);

    axum::serve(listener, admin_router(state)).await?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(state: AdminState) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        counters: state.metrics.snapshot(),
        scheduler: SchedulerGauges {
            working: state.scheduler.working_count(),
            waiting: state.scheduler.waiting_count(),
        },
        buffered_bytes: state.budget.current_usage(),
        buffer_memory_limit: state.budget.memory_limit(),
    })
}
