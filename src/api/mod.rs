use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, watch};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::cache::HotCache;
use crate::config::Config;
use crate::db::{create_pool, init_database_with_pool, ping};
use crate::models::{
    AuthContext, HealthResponse, HealthServices, Opportunity, OpportunitiesResponse,
    RefreshAccepted, Tier,
};
use crate::services::{tier_cap, OddsClient, PersistenceWriter, RefreshScheduler};
use crate::utils::session_id;

pub struct AppState {
    pub cache: Arc<HotCache>,
    pub scheduler: Arc<RefreshScheduler>,
    pub pool: SqlitePool,
}

pub async fn serve(config: Config, port: u16) -> anyhow::Result<()> {
    let pool = create_pool(&config.database_url).await?;
    init_database_with_pool(&pool).await?;

    let cache = Arc::new(HotCache::new(config.session_ttl));
    let writer = Arc::new(PersistenceWriter::new(pool.clone()));
    let client = OddsClient::new(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(RefreshScheduler::new(
        config,
        client,
        cache.clone(),
        writer,
        shutdown_rx,
    ));

    // ── HTTP server starts immediately ───────────────────────────────────────
    let state = Arc::new(AppState {
        cache,
        scheduler: scheduler.clone(),
        pool,
    });
    let app = create_router().with_state(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Fairline API server listening on port {}", port);

    // ── Warm the cache, then hand off to the recurring scheduler ─────────────
    let initial = scheduler.trigger();
    tracing::info!("Initial fetch running as task {}", initial);
    tokio::spawn(scheduler.run());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
        })
        .await?;
    Ok(())
}

fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/opportunities", get(get_opportunities_handler))
        .route("/opportunities/stream", get(stream_handler))
        .route("/opportunities/refresh", post(manual_refresh_handler))
        .route("/opportunities/refresh/{task_id}", get(refresh_status_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

// ── Error envelope ───────────────────────────────────────────────────────────

/// The wire error shape: `{ error: <slug>, message, code }`.
pub struct ApiError {
    status: StatusCode,
    slug: &'static str,
    message: String,
}

impl ApiError {
    pub fn forbidden(message: &str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            slug: "forbidden",
            message: message.to_string(),
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            slug: "not_found",
            message: message.to_string(),
        }
    }

    pub fn warming_up() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            slug: "warming_up",
            message: "first refresh cycle has not completed yet".to_string(),
        }
    }

    pub fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            slug: "internal",
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.slug,
            "message": self.message,
            "code": self.status.as_u16(),
        }));
        let mut response = (self.status, body).into_response();
        if self.slug == "warming_up" {
            response
                .headers_mut()
                .insert("Retry-After", axum::http::HeaderValue::from_static("5"));
        }
        response
    }
}

// ── Identity headers ─────────────────────────────────────────────────────────

/// Build the caller identity from gateway-verified headers. This service
/// never validates tokens; missing headers mean an anonymous caller.
fn auth_from_headers(headers: &HeaderMap) -> AuthContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let user_id = header("x-user-id");
    if user_id.is_none() {
        return AuthContext::anonymous();
    }

    let role = header("x-user-role")
        .and_then(|r| Tier::from_str(&r))
        .unwrap_or(Tier::Free);
    let subscription_active = header("x-subscription-active")
        .map(|v| v == "true")
        .unwrap_or(false);

    AuthContext {
        user_id,
        email: header("x-user-email"),
        role,
        subscription_active,
    }
}

fn client_fingerprint(headers: &HeaderMap) -> (String, String) {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_string();
    let agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    (ip, agent)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let persistence = if ping(&state.pool).await { "ok" } else { "down" };
    let cache = if state.cache.current().is_some() {
        "ok"
    } else {
        "warming"
    };
    let upstream = if state.cache.last_refresh_unix().is_some() {
        "ok"
    } else {
        "unknown"
    };

    Json(HealthResponse {
        status: if persistence == "ok" { "ok" } else { "degraded" },
        timestamp: Utc::now(),
        services: HealthServices {
            cache,
            persistence,
            upstream,
        },
    })
}

#[derive(Debug, Default, Deserialize)]
struct OpportunitiesQuery {
    search: Option<String>,
    sport: Option<String>,
    limit: Option<usize>,
}

// GET /opportunities - the tier-filtered ranked list
async fn get_opportunities_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<OpportunitiesQuery>,
) -> Result<Json<OpportunitiesResponse>, ApiError> {
    let auth = auth_from_headers(&headers);
    let tier = auth.effective_tier();

    // Authenticated reads are viewer heartbeats for the smart scheduler
    if let Some(user_id) = &auth.user_id {
        let (ip, agent) = client_fingerprint(&headers);
        state
            .cache
            .record_access(session_id(user_id, &ip, &agent), Instant::now());
    }

    // Stale reads kick off a background refresh; this response still serves
    // the cycle we already have.
    state.scheduler.maybe_trigger_on_read();

    let snapshot = state.cache.current().ok_or_else(ApiError::warming_up)?;
    let entitled = snapshot.for_tier(tier);
    let total_before_filter = snapshot.total_before_filter;

    let opportunities = apply_query_filters(&entitled, &query, tier_cap(tier));
    let total_after_filter = opportunities.len();

    Ok(Json(OpportunitiesResponse {
        filtered: total_after_filter < total_before_filter,
        opportunities,
        total_before_filter,
        total_after_filter,
        user_role: tier,
        last_refresh_ts: state.cache.last_refresh_unix(),
    }))
}

/// Query-string narrowing on top of the entitlement filter. The limit can
/// shrink a response but never exceed the tier's size cap.
fn apply_query_filters(
    entitled: &[Opportunity],
    query: &OpportunitiesQuery,
    cap: Option<usize>,
) -> Vec<Opportunity> {
    let search = query.search.as_ref().map(|s| s.to_lowercase());
    let mut result: Vec<Opportunity> = entitled
        .iter()
        .filter(|o| match &search {
            Some(needle) => o.event.to_lowercase().contains(needle),
            None => true,
        })
        .filter(|o| match &query.sport {
            Some(sport) => &o.sport == sport,
            None => true,
        })
        .cloned()
        .collect();

    let limit = match (query.limit, cap) {
        (Some(l), Some(c)) => l.min(c),
        (Some(l), None) => l,
        (None, Some(c)) => c,
        (None, None) => usize::MAX,
    };
    result.truncate(limit);
    result
}

// GET /opportunities/stream - refresh notifications over SSE
async fn stream_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.cache.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(refresh) => {
                    let event = match Event::default().event("refresh").json_data(&refresh) {
                        Ok(event) => event,
                        Err(_) => continue,
                    };
                    return Some((Ok(event), rx));
                }
                // A slow subscriber just misses events; the next one catches
                // it up on the latest cycle.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// POST /opportunities/refresh - admin-only forced cycle
async fn manual_refresh_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<RefreshAccepted>), ApiError> {
    let auth = auth_from_headers(&headers);
    if auth.effective_tier() != Tier::Admin {
        return Err(ApiError::forbidden("manual refresh requires the admin role"));
    }

    let task_id = state.scheduler.trigger();
    tracing::info!("Manual refresh accepted as task {}", task_id);
    Ok((StatusCode::ACCEPTED, Json(RefreshAccepted { task_id })))
}

// GET /opportunities/refresh/{task_id} - task handle status
async fn refresh_status_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<crate::services::TaskState>, ApiError> {
    state
        .scheduler
        .task_state(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("unknown refresh task"))
}
