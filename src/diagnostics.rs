//! Read-only diagnostics HTTP surface: the thin `axum`
//! server exposing `GET /diagnostics` and `GET /balances`. Public routes
//! bind to state, then `CorsLayer::permissive()` and the request-logging
//! middleware from `middleware::logging` layer on top.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::lock_registry::{ActiveOrderRecord, LockRegistry};
use crate::model::VenueId;
use crate::reconcile::{DriftEvent, Expectation, HedgePairRecord, ReconciliationEngine};
use crate::scheduler::{Scheduler, VenueBalance};

#[derive(Clone)]
pub struct DiagnosticsState {
    pub registry: Arc<LockRegistry>,
    pub reconciler: Arc<ReconciliationEngine>,
    pub scheduler: Arc<Scheduler>,
}

/// The diagnostics snapshot: active orders, expectations,
/// hedge-pair status, and recent reconciliation results.
#[derive(Debug, Serialize)]
struct DiagnosticsSnapshot {
    active_orders: Vec<ActiveOrderRecord>,
    expectations: Vec<Expectation>,
    hedge_pairs: Vec<HedgePairRecord>,
    recent_drift_events: Vec<DriftEvent>,
}

async fn get_diagnostics(State(state): State<DiagnosticsState>) -> Json<DiagnosticsSnapshot> {
    Json(DiagnosticsSnapshot {
        active_orders: state.registry.get_all_active_orders(),
        expectations: state.reconciler.expectations_snapshot(),
        hedge_pairs: state.reconciler.hedge_pairs_snapshot(),
        recent_drift_events: state.reconciler.recent_events_snapshot(),
    })
}

async fn get_balances(State(state): State<DiagnosticsState>) -> Json<HashMap<VenueId, VenueBalance>> {
    Json(state.scheduler.get_all_balances().await)
}

async fn health() -> &'static str {
    "ok"
}

/// Builds the diagnostics router. The caller binds it to a `TcpListener`
/// and serves it the way `main.rs` serves its own API router.
pub fn router(state: DiagnosticsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/diagnostics", get(get_diagnostics))
        .route("/balances", get(get_balances))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(crate::middleware::logging::request_logging_simple))
}
