//! Read-only JSON status API for dashboards and the status bot.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::{format_runtime, Db};
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    /// Machine id -> display name, from the static channel config.
    pub names: Arc<HashMap<i64, String>>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/machines", get(api_machines))
        .route("/api/stats", get(api_stats))
        .route("/api/debug", get(api_debug))
        .with_state(state)
}

async fn api_machines(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.machines_snapshot())
}

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    7
}

#[derive(Serialize)]
struct StatsRow {
    day: String,
    machine: i64,
    name: String,
    starts: i64,
    runtime_ms: i64,
    runtime_human: String,
}

async fn api_stats(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<Vec<StatsRow>>, StatusCode> {
    let days = q.days.clamp(1, 365);
    let buckets = state
        .db
        .usage_since(&Db::window_start(days))
        .await
        .map_err(|e| {
            error!("stats query failed: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let rows = buckets
        .into_iter()
        .map(|b| StatsRow {
            name: state
                .names
                .get(&b.machine)
                .cloned()
                .unwrap_or_else(|| format!("machine {}", b.machine)),
            runtime_human: format_runtime(b.runtime_ms),
            day: b.day,
            machine: b.machine,
            starts: b.starts,
            runtime_ms: b.runtime_ms,
        })
        .collect();

    Ok(Json(rows))
}

async fn api_debug(State(state): State<AppState>) -> impl IntoResponse {
    let mem = process_memory_bytes();
    let st = state.shared.read().await;
    Json(st.to_debug(mem))
}

/// Resident memory of this process. Debug endpoint only, so the full
/// sysinfo refresh cost per request is acceptable.
fn process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let sys = sysinfo::System::new_all();
    sys.process(pid).map(|p| p.memory())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!("status api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================
