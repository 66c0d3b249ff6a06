// Patron Gate - Admin API Server
// Read-only REST view over the registry: fees, bindings, audit events, and an
// on-demand plan check for one subscriber. The configured sweep and cleanup
// activities run alongside the API; a fatal error from either stops the server.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use patron_gate::db;
use patron_gate::{
    init_logging, Config, Database, FanboxClient, MemberId, MemoryGuild, RateLimiter,
    ReconciliationScheduler, SubscriberId, SyncError, SyncService,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<SyncService<MemoryGuild, FanboxClient>>,
}

impl AppState {
    fn db(&self) -> &Database {
        self.service.database()
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(ApiResponse {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn failure(context: &str, e: SyncError) -> Response {
    error!(error = %e, "{}", context);
    let status = if e.is_fatal() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(e.to_string()),
        }),
    )
        .into_response()
}

#[derive(Serialize)]
struct FeeResponse {
    fee: i64,
    plan_id: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> Response {
    ApiResponse::ok(patron_gate::VERSION)
}

/// GET /api/fees - Persisted fee lookup
async fn get_fees(State(state): State<AppState>) -> Response {
    match state.db().with_conn(db::load_fee_lookup) {
        Ok(fees) => {
            let response: Vec<FeeResponse> = fees
                .iter()
                .map(|(fee, plan)| FeeResponse {
                    fee,
                    plan_id: plan.to_string(),
                })
                .collect();
            ApiResponse::ok(response)
        }
        Err(e) => failure("loading fees", e),
    }
}

/// GET /api/bindings - Every member ↔ subscriber binding
async fn get_bindings(State(state): State<AppState>) -> Response {
    match state.db().with_conn(db::all_bindings) {
        Ok(bindings) => ApiResponse::ok(bindings),
        Err(e) => failure("loading bindings", e),
    }
}

/// GET /api/bindings/member/:id
async fn get_member_binding(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.db().with_conn(|conn| db::get_binding(conn, MemberId(id))) {
        Ok(subscriber) => ApiResponse::ok(subscriber),
        Err(e) => failure("loading member binding", e),
    }
}

/// GET /api/bindings/subscriber/:id
async fn get_subscriber_bindings(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let subscriber = SubscriberId::new(id);
    match state
        .db()
        .with_conn(|conn| db::members_for_subscriber(conn, &subscriber))
    {
        Ok(members) => ApiResponse::ok(members),
        Err(e) => failure("loading subscriber bindings", e),
    }
}

/// GET /api/events/:member_id - Audit trail, newest first
async fn get_member_events(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state
        .db()
        .with_conn(|conn| db::get_events_for_entity(conn, "member", &id.to_string()))
    {
        Ok(events) => ApiResponse::ok(events),
        Err(e) => failure("loading events", e),
    }
}

/// GET /api/plan/:subscriber_id - Forced fetch + verdict (changes no roles)
async fn get_plan(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.test_subscriber(&SubscriberId::new(id)).await {
        Ok(verdict) => ApiResponse::ok(verdict),
        Err(e) => failure("checking subscriber", e),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_default()?;
    init_logging(config.log.format, config.log.file.as_deref())?;

    let db = Arc::new(Database::open(&config.database_path)?);
    info!(path = ?config.database_path, "database opened");

    let limiter = Arc::new(RateLimiter::from_secs(config.billing.rate_limit_seconds));
    let billing = Arc::new(FanboxClient::new(&config.billing, limiter)?);
    let service = Arc::new(SyncService::new(
        &config,
        Arc::new(MemoryGuild::new()),
        billing,
        db,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler =
        tokio::spawn(ReconciliationScheduler::new(Arc::clone(&service), &config).run(shutdown_rx));

    let state = AppState { service };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/fees", get(get_fees))
        .route("/bindings", get(get_bindings))
        .route("/bindings/member/:id", get(get_member_binding))
        .route("/bindings/subscriber/:id", get(get_subscriber_bindings))
        .route("/events/:member_id", get(get_member_events))
        .route("/plan/:subscriber_id", get(get_plan))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = std::env::var("PATRON_GATE_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(addr = %addr, "🚀 admin API listening");
    tokio::select! {
        served = axum::serve(listener, app).into_future() => served?,
        Ok(Err(e)) = &mut scheduler => {
            error!(error = %e, "scheduler stopped");
            return Err(e.into());
        }
        _ = tokio::signal::ctrl_c() => info!("🛑 shutdown requested"),
    }

    // In-flight activities finish; no new iteration starts
    let _ = shutdown_tx.send(true);

    Ok(())
}
