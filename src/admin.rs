//! Admin HTTP API — health checks, Prometheus metrics, pool status.
//!
//! Spawned as a background task when `admin_port` is configured.
//! Endpoints:
//!   GET  /health  — 200 OK, for load balancer health checks
//!   GET  /metrics — Prometheus exposition format
//!   GET  /status  — JSON snapshot of pool state
//!   POST /gc     — force a full idle sweep, returns the count swept

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::backend::ContainerBackend;
use crate::metrics::Metrics;
use crate::pool::Pool;

/// Shared state for admin endpoints.
pub struct AdminState<B: ContainerBackend> {
    pub metrics: Arc<Metrics>,
    pub pool: Arc<Pool<B>>,
}

impl<B: ContainerBackend> Clone for AdminState<B> {
    fn clone(&self) -> Self {
        Self {
            metrics: Arc::clone(&self.metrics),
            pool: Arc::clone(&self.pool),
        }
    }
}

/// Start the admin HTTP server on the given port.
pub async fn serve<B: ContainerBackend>(state: AdminState<B>, port: u16) {
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics::<B>))
        .route("/status", get(status::<B>))
        .route("/gc", post(gc::<B>))
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    match TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!(addr = %addr, "admin API");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "admin server error");
            }
        }
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind admin port");
        }
    }
}

// ─── GET /health ─────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/json")], r#"{"status":"ok"}"#)
}

// ─── GET /metrics ────────────────────────────────────────────────────────────

async fn metrics<B: ContainerBackend>(State(state): State<AdminState<B>>) -> Response {
    let m = &state.metrics;
    let mut out = String::with_capacity(2048);

    // Acquirer counters
    out.push_str("# HELP invokerd_pool_gets_total Container checkout requests.\n");
    out.push_str("# TYPE invokerd_pool_gets_total counter\n");
    push_metric(&mut out, "invokerd_pool_gets_total", "", m.pool_gets.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_pool_hits_total Checkouts served from the warm reserve.\n");
    out.push_str("# TYPE invokerd_pool_hits_total counter\n");
    push_metric(&mut out, "invokerd_pool_hits_total", "", m.pool_hits.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_pool_misses_total Checkouts that created a container.\n");
    out.push_str("# TYPE invokerd_pool_misses_total counter\n");
    push_metric(&mut out, "invokerd_pool_misses_total", "", m.pool_misses.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_pool_busy_waits_total Back-offs while at capacity.\n");
    out.push_str("# TYPE invokerd_pool_busy_waits_total counter\n");
    push_metric(&mut out, "invokerd_pool_busy_waits_total", "", m.pool_busy_waits.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_containers_created_total Containers created.\n");
    out.push_str("# TYPE invokerd_containers_created_total counter\n");
    push_metric(&mut out, "invokerd_containers_created_total", "", m.containers_created.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_create_failures_total Container creations that failed.\n");
    out.push_str("# TYPE invokerd_create_failures_total counter\n");
    push_metric(&mut out, "invokerd_create_failures_total", "", m.create_failures.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_init_failures_total Container inits that failed.\n");
    out.push_str("# TYPE invokerd_init_failures_total counter\n");
    push_metric(&mut out, "invokerd_init_failures_total", "", m.init_failures.load(Ordering::Relaxed));

    // Releaser counters
    out.push_str("# HELP invokerd_pool_put_backs_total Containers returned to the pool.\n");
    out.push_str("# TYPE invokerd_pool_put_backs_total counter\n");
    push_metric(&mut out, "invokerd_pool_put_backs_total", "", m.pool_put_backs.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_pool_deletes_total Containers discarded on return.\n");
    out.push_str("# TYPE invokerd_pool_deletes_total counter\n");
    push_metric(&mut out, "invokerd_pool_deletes_total", "", m.pool_deletes.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_invariant_violations_total Rejected releaser calls.\n");
    out.push_str("# TYPE invokerd_invariant_violations_total counter\n");
    push_metric(&mut out, "invokerd_invariant_violations_total", "", m.invariant_violations.load(Ordering::Relaxed));

    // Reclamation counters
    out.push_str("# HELP invokerd_evictions_capacity_total Idle containers evicted on return.\n");
    out.push_str("# TYPE invokerd_evictions_capacity_total counter\n");
    push_metric(&mut out, "invokerd_evictions_capacity_total", "", m.evictions_capacity.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_evictions_age_total Idle containers swept by age.\n");
    out.push_str("# TYPE invokerd_evictions_age_total counter\n");
    push_metric(&mut out, "invokerd_evictions_age_total", "", m.evictions_age.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_teardowns_total Containers torn down.\n");
    out.push_str("# TYPE invokerd_teardowns_total counter\n");
    push_metric(&mut out, "invokerd_teardowns_total", "", m.teardowns.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_teardown_failures_total Teardown steps that failed.\n");
    out.push_str("# TYPE invokerd_teardown_failures_total counter\n");
    push_metric(&mut out, "invokerd_teardown_failures_total", "", m.teardown_failures.load(Ordering::Relaxed));
    out.push_str("# HELP invokerd_stragglers_killed_total Leftover containers removed at startup.\n");
    out.push_str("# TYPE invokerd_stragglers_killed_total counter\n");
    push_metric(&mut out, "invokerd_stragglers_killed_total", "", m.stragglers_killed.load(Ordering::Relaxed));

    // Pool gauges (per bucket from snapshot)
    let snap = state.pool.snapshot().await;
    out.push_str("# HELP invokerd_pool_active Containers checked out.\n");
    out.push_str("# TYPE invokerd_pool_active gauge\n");
    push_metric(&mut out, "invokerd_pool_active", "", snap.active as u64);
    out.push_str("# HELP invokerd_pool_idle Containers in the warm reserve.\n");
    out.push_str("# TYPE invokerd_pool_idle gauge\n");
    push_metric(&mut out, "invokerd_pool_idle", "", snap.idle as u64);
    out.push_str("# HELP invokerd_pool_starting Creations in flight.\n");
    out.push_str("# TYPE invokerd_pool_starting gauge\n");
    push_metric(&mut out, "invokerd_pool_starting", "", snap.starting as u64);
    out.push_str("# HELP invokerd_bucket_containers_total Containers in pool bucket.\n");
    out.push_str("# TYPE invokerd_bucket_containers_total gauge\n");
    out.push_str("# HELP invokerd_bucket_containers_idle Idle containers in pool bucket.\n");
    out.push_str("# TYPE invokerd_bucket_containers_idle gauge\n");
    for b in &snap.buckets {
        let labels = format!(r#"key="{}""#, escape_key(&b.key));
        push_metric(&mut out, "invokerd_bucket_containers_total", &labels, b.total as u64);
        push_metric(&mut out, "invokerd_bucket_containers_idle", &labels, b.idle as u64);
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        out,
    ).into_response()
}

fn push_metric(out: &mut String, name: &str, labels: &str, value: u64) {
    if labels.is_empty() {
        out.push_str(&format!("{name} {value}\n"));
    } else {
        out.push_str(&format!("{name}{{{labels}}} {value}\n"));
    }
}

/// Pool keys embed externally-supplied names; escape them before they go
/// inside quoted label or JSON text.
fn escape_key(key: &str) -> String {
    key.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

// ─── GET /status ─────────────────────────────────────────────────────────────

async fn status<B: ContainerBackend>(State(state): State<AdminState<B>>) -> Response {
    let m = &state.metrics;
    let snap = state.pool.snapshot().await;

    let mut json = String::with_capacity(1024);
    json.push_str("{\n");

    json.push_str(&format!(
        "  \"active\": {},\n  \"idle\": {},\n  \"starting\": {},\n",
        snap.active, snap.idle, snap.starting,
    ));

    json.push_str("  \"counters\": {\n");
    json.push_str(&format!("    \"gets\": {},\n", m.pool_gets.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"hits\": {},\n", m.pool_hits.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"misses\": {},\n", m.pool_misses.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"busy_waits\": {},\n", m.pool_busy_waits.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"created\": {},\n", m.containers_created.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"create_failures\": {},\n", m.create_failures.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"init_failures\": {},\n", m.init_failures.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"put_backs\": {},\n", m.pool_put_backs.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"deletes\": {},\n", m.pool_deletes.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"evictions_capacity\": {},\n", m.evictions_capacity.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"evictions_age\": {},\n", m.evictions_age.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"teardowns\": {},\n", m.teardowns.load(Ordering::Relaxed)));
    json.push_str(&format!("    \"teardown_failures\": {}\n", m.teardown_failures.load(Ordering::Relaxed)));
    json.push_str("  },\n");

    json.push_str("  \"buckets\": [");
    for (i, b) in snap.buckets.iter().enumerate() {
        if i > 0 { json.push(','); }
        json.push_str(&format!(
            "\n    {{\"key\": \"{}\", \"total\": {}, \"idle\": {}}}",
            escape_key(&b.key),
            b.total,
            b.idle
        ));
    }
    if !snap.buckets.is_empty() {
        json.push('\n');
        json.push_str("  ");
    }
    json.push_str("]\n");

    json.push_str("}\n");

    (
        StatusCode::OK,
        [("content-type", "application/json")],
        json,
    ).into_response()
}

// ─── POST /gc ────────────────────────────────────────────────────────────────

async fn gc<B: ContainerBackend>(State(state): State<AdminState<B>>) -> Response {
    let swept = state.pool.force_gc().await;
    info!(swept, "admin: forced gc sweep");
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        format!("{{\"swept\": {swept}}}\n"),
    ).into_response()
}
