use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use palaver_shared::constants::HISTORY_LIMIT;
use palaver_shared::gate::can_exchange;
use palaver_shared::models::{DirectoryEntry, FriendRequest, Message, User};
use palaver_shared::protocol::SocialNotice;
use palaver_shared::validation::{validate_image_ref, validate_status, validate_username};
use palaver_shared::{RequestId, UserId};
use palaver_store::{BlockOutcome, NewUser, ProfileUpdate, StoreError};

use crate::auth::{bearer_token, TokenAuthority};
use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::db::Db;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::router::EventRouter;
use crate::session::{authenticate, ws_handler};

const REQUEST_BLOCKED: &str = "Cannot send request to/from a blocked user";

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub router: EventRouter,
    pub tokens: Arc<TokenAuthority>,
    pub blob_store: Arc<BlobStore>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
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

    // Multipart framing overhead on top of the largest accepted image.
    let body_limit = state.config.max_blob_size + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_handler))
        .route("/users/me", get(get_me).patch(update_me))
        .route("/users", get(list_users))
        .route("/friends/requests", post(send_friend_request))
        .route("/friends/requests/:id/accept", post(accept_friend_request))
        .route("/friends/requests/:id/cancel", post(cancel_friend_request))
        .route("/friends/requests/:id/decline", post(decline_friend_request))
        .route("/friends/unfriend", post(unfriend))
        .route("/blocks", post(block_user))
        .route("/blocks/:user_id", delete(unblock_user))
        .route(
            "/messages/:user_id",
            get(conversation_history).delete(clear_conversation),
        )
        .route("/uploads", post(upload_image))
        .route("/uploads/:id", get(download_image))
        .route("/admin/users", post(admin_create_user))
        .route("/admin/users/:id", delete(admin_purge_user))
        .route("/admin/stats", get(admin_stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request / response bodies ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    online: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProfileRequest {
    username: Option<String>,
    status: Option<String>,
    avatar: Option<String>,
}

#[derive(Serialize)]
struct DirectoryResponse {
    users: Vec<DirectoryEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FriendRequestBody {
    receiver_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetUserBody {
    user_id: String,
}

#[derive(Serialize)]
struct HistoryResponse {
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct UploadResponse {
    id: Uuid,
    url: String,
}

#[derive(Deserialize)]
struct AdminCreateUserRequest {
    username: String,
    avatar: Option<String>,
}

#[derive(Serialize)]
struct AdminCreateUserResponse {
    user: User,
    token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminStatsResponse {
    users: u64,
    messages: u64,
    pending_requests: u64,
    online: usize,
    connections: usize,
}

// ─── Helpers ───

/// The authenticated caller.
fn current_user(headers: &HeaderMap, state: &AppState) -> Result<UserId, ServerError> {
    let token = bearer_token(headers).ok_or(ServerError::Unauthorized)?;
    Ok(authenticate(&state.tokens, &state.db, token)?)
}

fn parse_user_id(raw: &str) -> Result<UserId, ServerError> {
    UserId::parse(raw).map_err(|_| ServerError::BadRequest("Invalid user id".into()))
}

fn parse_request_id(raw: &str) -> Result<RequestId, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::BadRequest("Invalid request id".into()))
}

/// Load a user named in a request, reporting a missing one as 404.
fn load_target(state: &AppState, id: &UserId) -> Result<User, ServerError> {
    state.db.with(|db| db.get_user(id)).map_err(|e| match e {
        StoreError::NotFound => ServerError::NotFound("User not found".into()),
        other => other.into(),
    })
}

fn request_not_found(e: StoreError) -> ServerError {
    match e {
        StoreError::NotFound => ServerError::NotFound("Friend request not found".into()),
        other => other.into(),
    }
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let token = bearer_token(headers).unwrap_or("");

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

// ─── Service ───

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online: state.router.presence().online_count(),
    })
}

// ─── Profile & directory ───

async fn get_me(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<User>, ServerError> {
    let me = current_user(&headers, &state)?;
    Ok(Json(state.db.with(|db| db.get_user(&me))?))
}

async fn update_me(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<User>, ServerError> {
    let me = current_user(&headers, &state)?;

    let update = ProfileUpdate {
        username: req.username.as_deref().map(validate_username).transpose()?,
        status: req.status.as_deref().map(validate_status).transpose()?,
        // An empty avatar clears it.
        avatar: match req.avatar.as_deref().map(str::trim) {
            Some("") => Some(String::new()),
            Some(url) => Some(validate_image_ref(url)?),
            None => None,
        },
    };

    let user = state.db.with(|db| db.update_profile(&me, &update))?;
    info!(user = %me, "profile updated");
    Ok(Json(user))
}

async fn list_users(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<DirectoryResponse>, ServerError> {
    let me = current_user(&headers, &state)?;
    let users = state.db.with(|db| db.directory_for(&me))?;
    Ok(Json(DirectoryResponse { users }))
}

// ─── Friend requests ───

async fn send_friend_request(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<FriendRequestBody>,
) -> Result<impl IntoResponse, ServerError> {
    let me = current_user(&headers, &state)?;
    let receiver = parse_user_id(&req.receiver_id)?;
    if receiver == me {
        return Err(ServerError::BadRequest(
            "Cannot send a friend request to yourself".into(),
        ));
    }

    // Gate, friendship check and insert run under one lock hold so a block
    // cannot commit between them.
    let request = state.db.with(|db| {
        let sender = db.get_user(&me)?;
        let target = match db.get_user(&receiver) {
            Err(StoreError::NotFound) => {
                return Ok(Err(ServerError::NotFound("User not found".into())));
            }
            found => found?,
        };
        if let Err(denied) = can_exchange(&sender, &target).require(REQUEST_BLOCKED) {
            return Ok(Err(ServerError::from(denied)));
        }
        if sender.is_friend(&receiver) {
            return Ok(Err(ServerError::Conflict("Already friends".into())));
        }
        db.create_friend_request(&me, &receiver).map(Ok)
    })??;
    state
        .router
        .notify(&receiver, SocialNotice::FriendRequest, me);

    info!(request = %request.id, from = %me, to = %receiver, "friend request sent");
    Ok((StatusCode::CREATED, Json(request)))
}

async fn accept_friend_request(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FriendRequest>, ServerError> {
    let me = current_user(&headers, &state)?;
    let id = parse_request_id(&id)?;

    let request = state
        .db
        .with(|db| db.accept_friend_request(&id, &me))
        .map_err(request_not_found)?;
    state
        .router
        .notify(&request.sender_id, SocialNotice::FriendAccept, me);

    info!(request = %id, "friend request accepted");
    Ok(Json(request))
}

async fn cancel_friend_request(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FriendRequest>, ServerError> {
    let me = current_user(&headers, &state)?;
    let id = parse_request_id(&id)?;

    let request = state
        .db
        .with(|db| db.cancel_friend_request(&id, &me))
        .map_err(request_not_found)?;
    state
        .router
        .notify(&request.receiver_id, SocialNotice::FriendCancel, me);

    Ok(Json(request))
}

async fn decline_friend_request(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FriendRequest>, ServerError> {
    let me = current_user(&headers, &state)?;
    let id = parse_request_id(&id)?;

    let request = state
        .db
        .with(|db| db.decline_friend_request(&id, &me))
        .map_err(request_not_found)?;
    state
        .router
        .notify(&request.sender_id, SocialNotice::FriendDecline, me);

    Ok(Json(request))
}

async fn unfriend(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<TargetUserBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let me = current_user(&headers, &state)?;
    let other = parse_user_id(&req.user_id)?;

    let removed = state.db.with(|db| db.unfriend(&me, &other))?;
    Ok(Json(json!({ "removed": removed })))
}

// ─── Blocks ───

async fn block_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<TargetUserBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let me = current_user(&headers, &state)?;
    let other = parse_user_id(&req.user_id)?;
    if other == me {
        return Err(ServerError::BadRequest("Cannot block yourself".into()));
    }
    load_target(&state, &other)?;

    let outcome = state.db.with(|db| db.block(&me, &other))?;
    if outcome == BlockOutcome::Blocked {
        info!(blocker = %me, blocked = %other, "user blocked");
    }
    Ok(Json(json!({
        "blocked": true,
        "alreadyBlocked": outcome == BlockOutcome::AlreadyBlocked,
    })))
}

async fn unblock_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let me = current_user(&headers, &state)?;
    let other = parse_user_id(&user_id)?;

    let removed = state.db.with(|db| db.unblock(&me, &other))?;
    Ok(Json(json!({ "unblocked": removed })))
}

// ─── Conversations ───

async fn conversation_history(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<HistoryResponse>, ServerError> {
    let me = current_user(&headers, &state)?;
    let other = parse_user_id(&user_id)?;

    let messages = state
        .db
        .with(|db| db.conversation(&me, &other, HISTORY_LIMIT))?;
    Ok(Json(HistoryResponse { messages }))
}

async fn clear_conversation(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let me = current_user(&headers, &state)?;
    let other = parse_user_id(&user_id)?;

    let deleted = state.db.with(|db| db.clear_conversation(&me, &other))?;
    state.router.notify(&other, SocialNotice::ChatCleared, me);

    info!(user = %me, other = %other, deleted, "conversation cleared");
    Ok(Json(json!({ "deleted": deleted })))
}

// ─── Uploads ───

async fn upload_image(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    let me = current_user(&headers, &state)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

        let (id, kind) = state.blob_store.store_image(&data).await?;
        info!(
            id = %id,
            user = %me,
            size = data.len(),
            kind = kind.content_type(),
            "image uploaded"
        );

        return Ok(Json(UploadResponse {
            id,
            url: BlobStore::url_for(&state.config.public_base_url, &id),
        }));
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn download_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServerError> {
    let (data, kind) = state.blob_store.get_image(id).await?;
    Ok(([(header::CONTENT_TYPE, kind.content_type())], data))
}

// ─── Admin ───

async fn admin_create_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminCreateUserRequest>,
) -> Result<impl IntoResponse, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let new = NewUser {
        username: validate_username(&req.username)?,
        avatar: req
            .avatar
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .map(validate_image_ref)
            .transpose()?,
        status: None,
    };
    let user = state.db.with(|db| db.create_user(&new))?;
    let token = state.tokens.issue(&user.id);

    info!(user = %user.id, username = %user.username, "Admin provisioned user");
    Ok((
        StatusCode::CREATED,
        Json(AdminCreateUserResponse { user, token }),
    ))
}

async fn admin_purge_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let id = parse_user_id(&id)?;

    state.db.with(|db| db.purge_user(&id))?;
    info!(user = %id, "Admin purged user");
    Ok(Json(json!({ "deleted": true })))
}

async fn admin_stats(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatsResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let stats = state.db.with(|db| db.stats())?;
    Ok(Json(AdminStatsResponse {
        users: stats.users,
        messages: stats.messages,
        pending_requests: stats.pending_requests,
        online: state.router.presence().online_count(),
        connections: state.router.hub().connection_count(),
    }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
