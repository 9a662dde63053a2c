// =============================================================================
// REST Control Surface — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`.  Health is public; everything else
// requires the admin bearer token.  These handlers are thin: they validate
// input, call one subsystem, and return its result.  Exit codes for the
// CLI wrapper map from HTTP status (0 on 2xx, non-zero otherwise).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::ensemble::{VoteCategory, VoteRequest};
use crate::lifecycle::{check_graduation, MetricsInput};
use crate::types::ExitReason;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/runners/start", post(start_runner))
        .route("/api/v1/runners/stop", post(stop_runner))
        .route("/api/v1/control/kill", post(kill_switch))
        .route("/api/v1/cache/refresh", post(refresh_cache))
        .route("/api/v1/cache/summary", get(cache_summary))
        .route("/api/v1/cache/trim", post(trim_cache))
        .route("/api/v1/accounts/reset", post(reset_account))
        .route("/api/v1/graduation/check", post(graduation_check))
        .route("/api/v1/vote", post(fetch_vote))
        .route("/api/v1/queue/stats", get(queue_stats))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "data_source": state.router.source_state(),
    }))
}

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

#[derive(Deserialize)]
struct BotRequest {
    bot_id: String,
}

async fn start_runner(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<BotRequest>,
) -> impl IntoResponse {
    match state.runner_service.start_bot(&req.bot_id).await {
        Ok(()) => {
            state.increment_version();
            (StatusCode::OK, Json(json!({ "started": req.bot_id }))).into_response()
        }
        Err(e) => {
            warn!(bot_id = %req.bot_id, error = %e, "runner start failed");
            (
                StatusCode::CONFLICT,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn stop_runner(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<BotRequest>,
) -> impl IntoResponse {
    let stopped = state.runner_service.stop_bot(&req.bot_id, ExitReason::Manual);
    state.increment_version();
    if stopped {
        (StatusCode::OK, Json(json!({ "stopped": req.bot_id }))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no active runner for {}", req.bot_id) })),
        )
            .into_response()
    }
}

async fn kill_switch(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.runner_service.kill_switch() {
        Ok(affected) => {
            state.increment_version();
            Json(json!({ "affected": affected })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct RefreshRequest {
    symbol: String,
    #[serde(default = "default_refresh_days")]
    days: i64,
}

fn default_refresh_days() -> i64 {
    1
}

async fn refresh_cache(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> impl IntoResponse {
    match state.bar_cache.warm().refresh(&req.symbol, req.days).await {
        Ok(()) => Json(json!({
            "refreshed": req.symbol,
            "bars": state.bar_cache.warm().peek(&req.symbol, usize::MAX).len(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Emergency memory-pressure trim: every symbol drops to the configured
/// floor, newest bars preserved. Idempotent.
async fn trim_cache(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let evicted = state.bar_cache.warm().trim_for_memory_pressure();
    state.increment_version();
    Json(json!({
        "evicted": evicted,
        "remaining_bars": state.bar_cache.warm().total_bars(),
    }))
}

async fn cache_summary(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.bar_cache.summary() {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct ResetRequest {
    account_id: String,
    new_balance: f64,
}

/// Fund a blown account's next attempt and clear its recovery flags.
async fn reset_account(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetRequest>,
) -> impl IntoResponse {
    match state
        .recovery
        .reset_for_new_attempt(&req.account_id, req.new_balance)
    {
        Ok(()) => {
            state.increment_version();
            Json(json!({ "reset": req.account_id })).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Run the graduation gates for a bot against freshly recomputed metrics,
/// promoting the stage when everything passes (and autonomy is not halted).
async fn graduation_check(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<BotRequest>,
) -> impl IntoResponse {
    let result = run_graduation(&state, &req.bot_id);
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn run_graduation(state: &Arc<AppState>, bot_id: &str) -> anyhow::Result<serde_json::Value> {
    use anyhow::Context;

    let bot = state
        .ledger
        .get_bot(bot_id)?
        .with_context(|| format!("unknown bot {bot_id}"))?;
    let account_id = bot.account_id.clone().context("bot has no account")?;
    let attempt = state
        .ledger
        .active_attempt(&account_id)?
        .context("account has no active attempt")?;

    let metrics = state.metrics.recompute_and_cache(&bot.id, &attempt.id)?;
    let now_ms = state.clock.now_ms();
    let days_active = (now_ms - bot.created_at).max(0) / 86_400_000;

    // Evolution artifacts ride on the bot's strategy config.
    let cfg = &bot.strategy_config;
    let input = MetricsInput {
        stage: bot.stage,
        closed_trades: metrics.closed_trades,
        win_rate: metrics.win_rate_pct / 100.0,
        max_drawdown_pct: metrics.max_drawdown_pct,
        profit_factor: metrics.profit_factor,
        expectancy_usd: if metrics.closed_trades > 0 {
            metrics.realized_pnl / metrics.closed_trades as f64
        } else {
            0.0
        },
        sharpe: metrics.sharpe,
        total_pnl: metrics.realized_pnl,
        has_losers: metrics.closed_trades > 0 && metrics.win_rate_pct < 100.0,
        data_proof: metrics.closed_trades > 0,
        days_active,
        walk_forward_passed: cfg["walk_forward_passed"].as_bool().unwrap_or(false),
        overfit_ratio: cfg["overfit_ratio"].as_f64().unwrap_or(0.0),
        stress_test_passed: cfg["stress_test_passed"].as_bool().unwrap_or(false),
        human_approval: cfg["human_approval"].as_bool().unwrap_or(false),
    };

    let check = check_graduation(&input);

    let mut promoted_to = None;
    if check.all_passed {
        if state.authority.should_halt_autonomy() {
            warn!(bot_id, "graduation passed but autonomy is halted -- not promoting");
        } else if let Some(next) = bot.stage.next() {
            state.ledger.set_bot_stage(&bot.id, next, None, now_ms)?;
            state.ledger.audit(
                "STAGE_PROMOTED",
                Some(&bot.id),
                Some(&bot.symbol),
                Some(&json!({ "from": bot.stage, "to": next })),
                now_ms,
            )?;
            info!(bot_id, from = %bot.stage, to = %next, "bot promoted");
            promoted_to = Some(next);
        }
    }

    Ok(json!({
        "check": check,
        "metrics": metrics,
        "promoted_to": promoted_to,
    }))
}

#[derive(Deserialize)]
struct VoteApiRequest {
    symbol: String,
    #[serde(default)]
    category: Option<String>,
}

async fn fetch_vote(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<VoteApiRequest>,
) -> impl IntoResponse {
    let category = match req.category.as_deref() {
        Some("ENTRY") | None => VoteCategory::Entry,
        Some("EXIT") => VoteCategory::Exit,
        Some("ADVISORY") => VoteCategory::Advisory,
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown category {other}") })),
            )
                .into_response();
        }
    };

    let mark = state.authority.get_mark(&req.symbol, "1m");
    let request = VoteRequest {
        symbol: req.symbol,
        category,
        context: json!({ "mark": mark }),
    };
    let result = state.ensemble.vote(&request).await;
    Json(result).into_response()
}

async fn queue_stats(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.queue.stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
