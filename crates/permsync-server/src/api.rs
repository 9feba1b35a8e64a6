use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequest, Path, Query, Request, State},
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, Method, StatusCode,
    },
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use permsync_engine::{CycleState, RemovalReport, Scheduler, SharedDb};
use permsync_shared::crypto::CredentialCipher;
use permsync_shared::{
    normalize_domain, ContentType, FetchStatus, ParsedEntry, PermissionState, PermissionType,
    SubscriptionId,
};
use permsync_store::{Database, DomainPermission, StoreError, Subscription};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::validate::{CreatePermissionRequest, CreateSubscriptionRequest, UpdateSubscriptionRequest};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDb,
    pub scheduler: Arc<Scheduler>,
    pub cipher: Arc<CredentialCipher>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Run `f` against the store. The lock is released before returning.
    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T, StoreError>) -> Result<T, ServerError> {
        let db = self
            .db
            .lock()
            .map_err(|_| ServerError::Internal("store lock poisoned".into()))?;
        Ok(f(&db)?)
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let admin = Router::new()
        .route(
            "/subscriptions",
            post(create_subscription).get(list_subscriptions),
        )
        .route(
            "/subscriptions/{id}",
            get(get_subscription)
                .patch(update_subscription)
                .delete(delete_subscription),
        )
        .route("/subscriptions/{id}/refresh", post(refresh_subscription))
        .route("/subscriptions/{id}/test", post(preview_subscription))
        .route(
            "/domain_permissions",
            get(list_permissions).post(create_permission),
        )
        .route(
            "/domain_permissions/{permission_type}/{domain}",
            axum::routing::delete(remove_permission),
        )
        .route(
            "/domain_permissions/{permission_type}/{domain}/approve",
            post(approve_permission),
        )
        .layer(middleware::from_fn_with_state(state.clone(), admin_guard));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", admin)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request plumbing ───

/// Request body given either as JSON or as a urlencoded form, chosen by
/// `Content-Type`.
pub struct Payload<T>(pub T);

impl<T, S> FromRequest<S> for Payload<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ServerError::BadRequest(e.body_text()))?;

        let parsed = if is_form {
            serde_urlencoded::from_bytes(&body).map_err(|e| ServerError::BadRequest(e.to_string()))?
        } else {
            serde_json::from_slice(&body).map_err(|e| ServerError::BadRequest(e.to_string()))?
        };
        Ok(Payload(parsed))
    }
}

/// Checks the admin token and that the client accepts JSON.
async fn admin_guard(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ServerError> {
    verify_admin_token(req.headers(), &state.config)?;
    if !accepts_json(req.headers()) {
        return Err(ServerError::NotAcceptable);
    }
    Ok(next.run(req).await)
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ServerError::Unauthorized)?;

    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Unauthorized);
    }

    Ok(())
}

/// `true` when there is no `Accept` header or one of its ranges covers
/// `application/json`.
fn accepts_json(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(ACCEPT).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    accept.split(',').any(|range| {
        let media = range.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        matches!(media.as_str(), "*/*" | "application/*" | "application/json")
    })
}

fn parse_id(raw: &str) -> Result<SubscriptionId, ServerError> {
    SubscriptionId::parse(raw)
        .map_err(|_| ServerError::NotFound(format!("subscription {raw}")))
}

/// Path domains are matched in stored (normalized) form.
fn path_domain(raw: String) -> String {
    normalize_domain(&raw).unwrap_or(raw)
}

fn parse_permission_type(raw: &str) -> Result<PermissionType, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::BadRequest(format!("unknown permission type {raw:?}")))
}

// ─── Responses ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// A subscription as returned by the API. Credentials are never included.
#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub id: SubscriptionId,
    pub priority: u8,
    pub title: Option<String>,
    pub permission_type: PermissionType,
    pub uri: String,
    pub content_type: ContentType,
    pub as_draft: bool,
    pub adopt_orphans: bool,
    pub has_credentials: bool,
    pub created_at: DateTime<Utc>,
    pub last_fetch_status: FetchStatus,
    pub last_fetch_error: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub entry_count: i64,
    pub sync_state: Option<CycleState>,
}

impl SubscriptionView {
    fn new(sub: Subscription, sync_state: Option<CycleState>) -> Self {
        Self {
            has_credentials: sub.has_credentials(),
            id: sub.id,
            priority: sub.priority,
            title: sub.title,
            permission_type: sub.permission_type,
            uri: sub.uri,
            content_type: sub.content_type,
            as_draft: sub.as_draft,
            adopt_orphans: sub.adopt_orphans,
            created_at: sub.created_at,
            last_fetch_status: sub.last_fetch_status,
            last_fetch_error: sub.last_fetch_error,
            last_fetched_at: sub.last_fetched_at,
            last_success_at: sub.last_success_at,
            entry_count: sub.entry_count,
            sync_state,
        }
    }
}

fn view(state: &AppState, sub: Subscription) -> SubscriptionView {
    let sync_state = state.scheduler.state(sub.id);
    SubscriptionView::new(sub, sync_state)
}

#[derive(Serialize)]
struct PreviewResponse {
    count: usize,
    entries: Vec<ParsedEntry>,
}

#[derive(Deserialize)]
struct SubscriptionFilter {
    permission_type: Option<String>,
}

#[derive(Deserialize)]
struct PermissionFilter {
    permission_type: Option<String>,
    state: Option<PermissionState>,
}

#[derive(Deserialize)]
struct DeleteParams {
    #[serde(default = "default_remove_children")]
    remove_children: bool,
}

fn default_remove_children() -> bool {
    true
}

// ─── Handlers ───

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn create_subscription(
    State(state): State<AppState>,
    Payload(req): Payload<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<SubscriptionView>), ServerError> {
    let sub = req
        .validate()?
        .into_subscription(&state.cipher)
        .map_err(|e| ServerError::Internal(format!("sealing credentials: {e}")))?;

    state.with_db(|db| db.create_subscription(&sub))?;
    state.scheduler.start(sub.id, true);

    info!(
        id = %sub.id,
        uri = %sub.uri,
        permission_type = %sub.permission_type,
        priority = sub.priority,
        "Subscription created"
    );

    Ok((StatusCode::CREATED, Json(view(&state, sub))))
}

async fn list_subscriptions(
    State(state): State<AppState>,
    Query(filter): Query<SubscriptionFilter>,
) -> Result<Json<Vec<SubscriptionView>>, ServerError> {
    let permission_type = filter
        .permission_type
        .as_deref()
        .map(parse_permission_type)
        .transpose()?;

    let subs = state.with_db(|db| db.list_subscriptions(permission_type))?;
    Ok(Json(subs.into_iter().map(|s| view(&state, s)).collect()))
}

async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionView>, ServerError> {
    let id = parse_id(&id)?;
    let sub = state.with_db(|db| db.get_subscription(id))?;
    Ok(Json(view(&state, sub)))
}

async fn update_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Payload(req): Payload<UpdateSubscriptionRequest>,
) -> Result<Json<SubscriptionView>, ServerError> {
    let id = parse_id(&id)?;
    let mut sub = state.with_db(|db| db.get_subscription(id))?;

    req.validate(&sub)?
        .apply(&mut sub, &state.cipher)
        .map_err(|e| ServerError::Internal(format!("sealing credentials: {e}")))?;
    state.with_db(|db| db.update_subscription(&sub))?;
    state.scheduler.start(id, true);

    info!(id = %id, priority = sub.priority, "Subscription updated");
    Ok(Json(view(&state, sub)))
}

async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<RemovalReport>, ServerError> {
    let id = parse_id(&id)?;
    let report = state.scheduler.remove(id, params.remove_children).await?;
    Ok(Json(report))
}

async fn refresh_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    let id = parse_id(&id)?;
    // Existence check; the worker may not be running yet after a restart.
    state.with_db(|db| db.get_subscription(id))?;
    state.scheduler.start(id, true);

    info!(id = %id, "Refresh requested");
    Ok(StatusCode::ACCEPTED)
}

async fn preview_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PreviewResponse>, ServerError> {
    let id = parse_id(&id)?;
    let entries = state.scheduler.engine().preview(id).await?;
    Ok(Json(PreviewResponse {
        count: entries.len(),
        entries,
    }))
}

async fn list_permissions(
    State(state): State<AppState>,
    Query(filter): Query<PermissionFilter>,
) -> Result<Json<Vec<DomainPermission>>, ServerError> {
    let permission_type = filter
        .permission_type
        .as_deref()
        .map(parse_permission_type)
        .transpose()?;

    let perms = state.with_db(|db| db.list_permissions(permission_type, filter.state))?;
    Ok(Json(perms))
}

async fn create_permission(
    State(state): State<AppState>,
    Payload(req): Payload<CreatePermissionRequest>,
) -> Result<(StatusCode, Json<DomainPermission>), ServerError> {
    let (entry, permission_type) = req.validate()?;
    let perm =
        state.with_db(|db| db.create_orphan_permission(&entry, permission_type, Utc::now()))?;

    info!(domain = %perm.domain, permission_type = %permission_type, "Permission created");
    Ok((StatusCode::CREATED, Json(perm)))
}

async fn approve_permission(
    State(state): State<AppState>,
    Path((permission_type, domain)): Path<(String, String)>,
) -> Result<Json<DomainPermission>, ServerError> {
    let permission_type = parse_permission_type(&permission_type)?;
    let domain = path_domain(domain);
    let perm = state
        .with_db(|db| db.approve_draft(&domain, permission_type, Utc::now()))
        .map_err(|e| match e {
            ServerError::NotFound(_) => ServerError::NotFound(format!("draft {permission_type} for {domain}")),
            other => other,
        })?;

    info!(domain = %domain, permission_type = %permission_type, "Draft approved");
    Ok(Json(perm))
}

async fn remove_permission(
    State(state): State<AppState>,
    Path((permission_type, domain)): Path<(String, String)>,
) -> Result<StatusCode, ServerError> {
    let permission_type = parse_permission_type(&permission_type)?;
    let domain = path_domain(domain);
    if !state.with_db(|db| db.remove_permission(&domain, permission_type))? {
        return Err(ServerError::NotFound(format!("{permission_type} for {domain}")));
    }

    info!(domain = %domain, permission_type = %permission_type, "Permission removed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
