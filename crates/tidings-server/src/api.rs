use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{HeaderMap, Method, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use tidings_shared::constants::DEFAULT_PAGE_LIMIT;
use tidings_shared::protocol::SendReceipt;
use tidings_shared::{GroupId, Role, UserId};
use tidings_store::{Group, User};

use crate::bus::BroadcastBus;
use crate::cache::{RecentWindows, RollingCache};
use crate::config::ServerConfig;
use crate::directory::StoreDirectory;
use crate::error::ServerError;
use crate::inbox::InboxPage;
use crate::message_log::MessageLog;
use crate::service::{
    BroadcastRequest, CreateGroupRequest, MessagePage, Messenger, PageRequest, SendRequest,
    Thread,
};
use crate::signer::HmacSigner;
use crate::transport::Hub;
use crate::ws::ws_handler;

/// Frames buffered per live connection before delivery starts dropping.
const OUTBOX_CAPACITY: usize = 256;

/// Room for JSON framing on top of the payload cap.
const BODY_HEADROOM: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub messenger: Messenger,
    pub hub: Hub,
    pub directory: StoreDirectory,
    pub signer: Arc<HmacSigner>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire the service over an opened log and the chosen cache and bus.
    pub fn assemble(
        config: Arc<ServerConfig>,
        log: MessageLog,
        cache: Arc<dyn RollingCache>,
        bus: Arc<dyn BroadcastBus>,
    ) -> Self {
        let windows = RecentWindows::new(cache, config.cache_ttl, config.cache_timeout);
        let signer = Arc::new(HmacSigner::new(
            config.signing_secret.clone(),
            config.attachment_base_url.clone(),
            config.attachment_url_ttl,
        ));
        let directory = StoreDirectory::new(log.clone());
        let messenger = Messenger::new(
            log,
            windows,
            bus,
            Arc::new(directory.clone()),
            signer.clone(),
            config.instance_id.clone(),
            config.max_payload_bytes,
        );

        Self {
            messenger,
            hub: Hub::new(OUTBOX_CAPACITY),
            directory,
            signer,
            config,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);
    let body_limit = state.config.max_payload_bytes + BODY_HEADROOM;

    Router::new()
        .route("/health", get(health_check))
        .route("/messages", post(send_message))
        .route("/conversations/:partner/messages", get(direct_page))
        .route("/conversations/:partner/read", post(mark_read))
        .route("/groups", post(create_group))
        .route("/groups/:group/messages", get(group_page))
        .route("/groups/:group/join", post(join_group))
        .route("/groups/:group/leave", post(leave_group))
        .route("/inbox", get(inbox))
        .route("/broadcasts", post(broadcast))
        .route("/users/:user", put(upsert_user))
        .route("/files/*reference", get(check_attachment))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    instance: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageQuery {
    viewer_id: UserId,
    cursor: Option<Uuid>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboxQuery {
    viewer_id: UserId,
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadRequest {
    viewer_id: UserId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadResponse {
    updated_count: usize,
}

#[derive(Serialize)]
struct BroadcastResponse {
    accepted: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipRequest {
    user_id: UserId,
}

#[derive(Serialize)]
struct MembershipResponse {
    changed: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    role: Role,
    display_name: String,
    phone: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Deserialize)]
struct SignedQuery {
    expires: i64,
    signature: String,
}

// ---------------------------------------------------------------------------
// Extraction helpers
// ---------------------------------------------------------------------------

fn json_body<T>(state: &AppState, body: Result<Json<T>, JsonRejection>) -> Result<T, ServerError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(ServerError::BodyTooLarge {
                max: state.config.max_payload_bytes,
            })
        }
        Err(rejection) => Err(ServerError::Validation(rejection.body_text())),
    }
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ServerError> {
    params
        .map(|Query(value)| value)
        .map_err(|rejection| ServerError::Validation(rejection.body_text()))
}

fn verify_directory_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.directory_token else {
        return Err(ServerError::Forbidden(
            "directory sync is disabled (no DIRECTORY_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    let (token, expected) = (token.as_bytes(), expected.as_bytes());
    if token.len() != expected.len() || token.ct_eq(expected).unwrap_u8() != 1 {
        return Err(ServerError::Forbidden("invalid directory token".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        instance: state.config.instance_id.clone(),
    })
}

async fn send_message(
    State(state): State<AppState>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SendReceipt>), ServerError> {
    let req = json_body(&state, body)?;
    let receipt = state.messenger.send(req).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn direct_page(
    State(state): State<AppState>,
    Path(partner): Path<String>,
    params: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<MessagePage>, ServerError> {
    let params = query(params)?;
    let partner = UserId::parse(partner)?;
    let page = state
        .messenger
        .fetch_page(PageRequest {
            viewer_id: params.viewer_id,
            thread: Thread::Partner(partner),
            cursor: params.cursor,
            limit: params.limit,
        })
        .await?;
    Ok(Json(page))
}

async fn group_page(
    State(state): State<AppState>,
    Path(group): Path<String>,
    params: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<MessagePage>, ServerError> {
    let params = query(params)?;
    let group = GroupId::parse(group)?;
    let page = state
        .messenger
        .fetch_page(PageRequest {
            viewer_id: params.viewer_id,
            thread: Thread::Group(group),
            cursor: params.cursor,
            limit: params.limit,
        })
        .await?;
    Ok(Json(page))
}

async fn mark_read(
    State(state): State<AppState>,
    Path(partner): Path<String>,
    body: Result<Json<ReadRequest>, JsonRejection>,
) -> Result<Json<ReadResponse>, ServerError> {
    let req = json_body(&state, body)?;
    let partner = UserId::parse(partner)?;
    let updated_count = state.messenger.mark_read(&req.viewer_id, &partner).await?;
    Ok(Json(ReadResponse { updated_count }))
}

async fn inbox(
    State(state): State<AppState>,
    params: Result<Query<InboxQuery>, QueryRejection>,
) -> Result<Json<InboxPage>, ServerError> {
    let params = query(params)?;
    let page = state
        .messenger
        .inbox(
            &params.viewer_id,
            params.page.unwrap_or(1),
            params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        )
        .await?;
    Ok(Json(page))
}

async fn broadcast(
    State(state): State<AppState>,
    body: Result<Json<BroadcastRequest>, JsonRejection>,
) -> Result<Json<BroadcastResponse>, ServerError> {
    let req = json_body(&state, body)?;
    let accepted = state.messenger.broadcast(req).await?;
    Ok(Json(BroadcastResponse { accepted }))
}

async fn create_group(
    State(state): State<AppState>,
    body: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Group>), ServerError> {
    let req = json_body(&state, body)?;
    let group = state.messenger.create_group(req).await?;
    info!(group = %group.id, "group created via API");
    Ok((StatusCode::CREATED, Json(group)))
}

async fn join_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
    body: Result<Json<MembershipRequest>, JsonRejection>,
) -> Result<Json<MembershipResponse>, ServerError> {
    let req = json_body(&state, body)?;
    let group = GroupId::parse(group)?;
    let changed = state.messenger.join_group(&group, &req.user_id).await?;
    Ok(Json(MembershipResponse { changed }))
}

async fn leave_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
    body: Result<Json<MembershipRequest>, JsonRejection>,
) -> Result<Json<MembershipResponse>, ServerError> {
    let req = json_body(&state, body)?;
    let group = GroupId::parse(group)?;
    let changed = state.messenger.leave_group(&group, &req.user_id).await?;
    Ok(Json(MembershipResponse { changed }))
}

/// Directory sync from the platform's identity store.
async fn upsert_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<UserRecord>, JsonRejection>,
) -> Result<Json<User>, ServerError> {
    verify_directory_token(&headers, &state.config)?;
    let record = json_body(&state, body)?;
    let id = UserId::parse(id)?;
    if record.display_name.trim().is_empty() {
        return Err(ServerError::Validation("displayName must not be empty".into()));
    }

    let stored = state
        .directory
        .upsert(User {
            id,
            role: record.role,
            display_name: record.display_name,
            phone: record.phone,
            avatar_url: record.avatar_url,
            created_at: Utc::now(),
        })
        .await?;
    info!(user = %stored.id, role = %stored.role.as_str(), "directory entry synced");
    Ok(Json(stored))
}

/// Gate for whatever serves attachment bytes: 204 for a live signed link,
/// 403 otherwise.
async fn check_attachment(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    params: Result<Query<SignedQuery>, QueryRejection>,
) -> Result<StatusCode, ServerError> {
    let params = query(params)?;
    if state
        .signer
        .verify(&reference, params.expires, &params.signature, Utc::now())
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServerError::Forbidden(
            "attachment link is invalid or expired".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Server startup
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tidings_shared::Role;
    use tower::ServiceExt;

    use super::*;
    use crate::testkit::Fixture;

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn put_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut req = Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health() {
        let fx = Fixture::new().await;
        let (status, body) = call(build_router(fx.state.clone()), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["instance"], fx.config.instance_id.as_str());
    }

    #[tokio::test]
    async fn send_then_fetch_over_http() {
        let fx = Fixture::new().await;
        fx.add_user("alice", Role::Student).await;
        fx.add_user("bob", Role::Student).await;
        let app = build_router(fx.state.clone());

        let (status, receipt) = call(
            app.clone(),
            post_json(
                "/messages",
                json!({"senderId": "alice", "receiverId": "bob", "body": "hi"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(receipt["messageId"].is_string());
        assert!(receipt["createdAt"].is_string());

        let (status, page) = call(
            app.clone(),
            get("/conversations/alice/messages?viewerId=bob"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["messages"].as_array().unwrap().len(), 1);
        assert_eq!(page["messages"][0]["content"], "hi");
        assert_eq!(page["messages"][0]["senderId"], "alice");
        assert_eq!(page["nextCursor"], Value::Null);

        let (status, read) = call(
            app.clone(),
            post_json("/conversations/alice/read", json!({"viewerId": "bob"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["updatedCount"], 1);
    }

    #[tokio::test]
    async fn error_statuses() {
        let fx = Fixture::new().await;
        fx.add_user("alice", Role::Student).await;
        let app = build_router(fx.state.clone());

        let (status, body) = call(
            app.clone(),
            post_json("/messages", json!({"senderId": "alice", "receiverId": "nobody", "body": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, _) = call(
            app.clone(),
            post_json(
                "/messages",
                json!({"senderId": "alice", "receiverId": "alice", "groupId": "g", "body": "x"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            app.clone(),
            post_json("/messages", json!({"senderId": "bad id", "receiverId": "alice"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(app.clone(), get("/conversations/alice/messages")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            app.clone(),
            get("/groups/unknown/messages?viewerId=alice"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let oversized = "x".repeat(fx.config.max_payload_bytes + BODY_HEADROOM + 1);
        let (status, _) = call(
            app,
            post_json(
                "/messages",
                json!({"senderId": "alice", "receiverId": "alice", "body": oversized}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn broadcast_raises_inbox_unread() {
        let fx = Fixture::new().await;
        fx.add_user("a1", Role::Admin).await;
        fx.add_user("x", Role::Student).await;
        fx.add_user("y", Role::Student).await;
        let app = build_router(fx.state.clone());

        let (status, body) = call(
            app.clone(),
            post_json(
                "/broadcasts",
                json!({"senderId": "a1", "recipientIds": ["x", "y"], "body": "update"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 2);

        for who in ["x", "y"] {
            let (status, inbox) = call(app.clone(), get(&format!("/inbox?viewerId={who}"))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(inbox["totalUnread"], 1);
            assert_eq!(inbox["totalCount"], 1);
            let entry = &inbox["entries"][0];
            assert_eq!(entry["partner"]["kind"], "support");
            assert_eq!(entry["partner"]["name"], "Platform Support");
            assert_eq!(entry["isBroadcast"], true);
            assert_eq!(entry["lastMessage"], "update");
        }

        let (status, _) = call(
            app,
            post_json(
                "/broadcasts",
                json!({"senderId": "x", "recipientIds": ["y"], "body": "spoof"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn group_lifecycle_over_http() {
        let fx = Fixture::new().await;
        fx.add_user("t1", Role::Teacher).await;
        fx.add_user("s1", Role::Student).await;
        let app = build_router(fx.state.clone());

        let (status, group) = call(
            app.clone(),
            post_json("/groups", json!({"adminId": "t1", "name": "Physics"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let gid = group["id"].as_str().unwrap().to_string();

        let (status, joined) = call(
            app.clone(),
            post_json(&format!("/groups/{gid}/join"), json!({"userId": "s1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(joined["changed"], true);

        let (status, _) = call(
            app.clone(),
            post_json(
                "/messages",
                json!({"senderId": "s1", "groupId": gid, "body": "question"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, page) = call(
            app.clone(),
            get(&format!("/groups/{gid}/messages?viewerId=t1&limit=5")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["messages"][0]["groupId"], gid.as_str());

        let (status, _) = call(
            app,
            post_json(&format!("/groups/{gid}/leave"), json!({"userId": "t1"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn directory_sync_over_http() {
        let fx = Fixture::new().await;
        fx.add_user("alice", Role::Student).await;
        let app = build_router(fx.state.clone());
        let record = json!({"role": "teacher", "displayName": "Carol", "phone": "+15550100"});

        let (status, _) = call(app.clone(), put_json("/users/carol", None, record.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(
            app.clone(),
            put_json("/users/carol", Some("wrong-token"), record.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, created) = call(
            app.clone(),
            put_json("/users/carol", Some("sync-token"), record),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["role"], "teacher");
        assert_eq!(created["displayName"], "Carol");

        // The synced user is now a valid receiver.
        let (status, _) = call(
            app.clone(),
            post_json(
                "/messages",
                json!({"senderId": "alice", "receiverId": "carol", "body": "hello"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, updated) = call(
            app.clone(),
            put_json(
                "/users/carol",
                Some("sync-token"),
                json!({"role": "admin", "displayName": "Carol B."}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["role"], "admin");
        assert_eq!(updated["createdAt"], created["createdAt"]);

        let (status, _) = call(
            app.clone(),
            put_json(
                "/users/platform-support",
                Some("sync-token"),
                json!({"role": "admin", "displayName": "Support"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            app,
            put_json(
                "/users/dave",
                Some("sync-token"),
                json!({"role": "student", "displayName": "  "}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn directory_sync_is_off_without_a_token() {
        let fx = Fixture::with_config(ServerConfig::default()).await;
        let (status, body) = call(
            build_router(fx.state.clone()),
            put_json(
                "/users/carol",
                Some("anything"),
                json!({"role": "student", "displayName": "Carol"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn signed_attachment_links_are_checked() {
        let fx = Fixture::new().await;
        let app = build_router(fx.state.clone());

        let url = fx.state.signer.sign_at("uploads/cat.png", Utc::now()).unwrap();
        assert!(url.starts_with("/files/uploads/cat.png?"));
        let (status, _) = call(app.clone(), get(&url)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(app.clone(), get(&url.replace("cat.png", "dog.png"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let stale = fx
            .state
            .signer
            .sign_at("uploads/cat.png", Utc::now() - chrono::Duration::hours(2))
            .unwrap();
        let (status, _) = call(app.clone(), get(&stale)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(app, get("/files/uploads/cat.png")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
