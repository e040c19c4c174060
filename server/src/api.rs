use crate::{
    auth::{self, AuthUser},
    chats,
    config::Config,
    conversations, db,
    db::DbPool,
    enrich,
    error::ApiError,
    subscribe::{LogNotifier, SubscriptionNotifier},
    sweep,
    users::{self, UserRecord},
};
use ai_relay::AiRelay;
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Extension, Path, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use chat_api::{
    AttachResponseRequest, AuthResponse, ChatTurn, ConversationDetail, ConversationList,
    ConversationSummary, CreateConversationRequest, LoginRequest, NewChatRequest,
    RenameConversationRequest, SignupRequest, SubscribeRequest, SubscribeResponse, UserProfile,
};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub relay: Arc<dyn AiRelay>,
    pub notifier: Arc<dyn SubscriptionNotifier>,
    pub config: Config,
    pub jwt_secret: Arc<Vec<u8>>,
    pub login_limiter: auth::LoginRateLimiter,
}

impl AppState {
    /// Open the database under `config.data_dir` and resolve the signing secret.
    pub async fn new(config: Config, relay: Arc<dyn AiRelay>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
        let pool = db::open_pool(config.db_path()).context("open database")?;
        let jwt_secret =
            auth::load_or_create_secret(&config.data_dir, config.auth.jwt_secret.as_deref())?;
        let login_limiter = auth::LoginRateLimiter::new(
            config.auth.login_attempts_per_minute,
            std::time::Duration::from_secs(60),
        );
        Ok(Self {
            pool,
            relay,
            notifier: Arc::new(LogNotifier),
            config,
            jwt_secret: Arc::new(jwt_secret),
            login_limiter,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn SubscriptionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    fn session(&self, user: &UserRecord) -> Result<AuthResponse, ApiError> {
        let token = auth::issue_jwt(
            &self.jwt_secret,
            &user.id,
            &user.email,
            Duration::hours(self.config.auth.token_ttl_hours),
        )
        .map_err(|e| ApiError::Store(format!("token: {e}")))?;
        Ok(AuthResponse {
            token,
            user: user.profile(),
        })
    }
}

/// Build the HTTP application router. Everything lives under `/api`.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/auth/me", get(me))
        .route("/api/auth/refresh", post(refresh_token))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/conversations/:id",
            get(get_conversation)
                .put(rename_conversation)
                .delete(delete_conversation),
        )
        .route("/api/conversations/:id/chats", post(append_chat))
        .route("/api/conversations/:id/chats/:chat_id", put(attach_response))
        .route(
            "/api/conversations/:id/chats/:chat_id/retry",
            post(retry_chat),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/signup", post(signup))
        .route("/api/auth/login", post(login))
        .route("/api/subscribe", post(subscribe))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    let claims = auth::verify_jwt(&state.jwt_secret, token).map_err(|_| ApiError::Unauthorized)?;
    req.extensions_mut().insert(AuthUser::from(claims));
    Ok(next.run(req).await)
}

/// Unwrap a JSON body, turning extractor rejections into the usual error shape.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::validation(e.body_text()))
}

async fn signup(
    State(state): State<AppState>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    let req = body(payload)?;
    let user = {
        let conn = state.pool.get()?;
        users::create_user(
            &conn,
            req.name.as_deref().unwrap_or_default(),
            req.email.as_deref().unwrap_or_default(),
            req.password.as_deref().unwrap_or_default(),
        )?
    };
    info!(user_id = %user.id, "account created");
    Ok((StatusCode::CREATED, Json(state.session(&user)?)))
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    let req = body(payload)?;
    let email = req.email.as_deref().map(str::trim).unwrap_or_default();
    let password = req.password.as_deref().unwrap_or_default();
    if email.is_empty() || password.is_empty() {
        return Err(ApiError::validation("Email and password are required"));
    }
    auth::validate_email(email)?;
    if !state.login_limiter.check(email) {
        warn!("login rate limited");
        return Err(ApiError::RateLimited);
    }
    let user = {
        let conn = state.pool.get()?;
        users::authenticate(&conn, email, password)?
    };
    info!(user_id = %user.id, "login");
    Ok(Json(state.session(&user)?))
}

async fn me(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<UserProfile>, ApiError> {
    let conn = state.pool.get()?;
    let user = users::get_user(&conn, &auth.id)?.ok_or(ApiError::NotFound("User"))?;
    Ok(Json(user.profile()))
}

async fn refresh_token(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<AuthResponse>, ApiError> {
    let user = {
        let conn = state.pool.get()?;
        users::get_user(&conn, &auth.id)?.ok_or(ApiError::NotFound("User"))?
    };
    Ok(Json(state.session(&user)?))
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<ConversationList>, ApiError> {
    let conn = state.pool.get()?;
    let conversations = conversations::list_conversations(&conn, &auth.id)?;
    Ok(Json(ConversationList { conversations }))
}

async fn create_conversation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    payload: Option<Json<CreateConversationRequest>>,
) -> Result<(StatusCode, Json<ConversationSummary>), ApiError> {
    let title = payload.and_then(|Json(req)| req.title);
    let conn = state.pool.get()?;
    let created = conversations::create_conversation(&conn, &auth.id, title.as_deref())?;
    info!(user_id = %auth.id, conversation_id = %created.id, "conversation created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_conversation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetail>, ApiError> {
    let conn = state.pool.get()?;
    Ok(Json(conversations::get_conversation(&conn, &auth.id, &id)?))
}

async fn rename_conversation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    payload: Result<Json<RenameConversationRequest>, JsonRejection>,
) -> Result<Json<ConversationSummary>, ApiError> {
    let req = body(payload)?;
    let conn = state.pool.get()?;
    Ok(Json(conversations::rename_conversation(
        &conn, &auth.id, &id, &req.title,
    )?))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.pool.get()?;
    conversations::soft_delete_conversation(&conn, &auth.id, &id)?;
    info!(user_id = %auth.id, conversation_id = %id, "conversation deleted");
    Ok(Json(json!({ "message": "Conversation deleted" })))
}

async fn append_chat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    payload: Result<Json<NewChatRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ChatTurn>), ApiError> {
    let req = body(payload)?;
    let conn = state.pool.get()?;
    let turn = chats::append_turn(&conn, &auth.id, &id, &req)?;
    info!(conversation_id = %id, chat_id = %turn.id, kind = turn.message_type.as_str(), "turn recorded");
    Ok((StatusCode::CREATED, Json(turn)))
}

async fn attach_response(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path((id, chat_id)): Path<(String, String)>,
    payload: Result<Json<AttachResponseRequest>, JsonRejection>,
) -> Result<Json<ChatTurn>, ApiError> {
    let req = body(payload)?;
    let conn = state.pool.get()?;
    Ok(Json(chats::attach_response(
        &conn, &auth.id, &id, &chat_id, &req,
    )?))
}

async fn retry_chat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path((id, chat_id)): Path<(String, String)>,
) -> Result<Json<ChatTurn>, ApiError> {
    let turn = enrich::enrich_turn(&state.pool, state.relay.as_ref(), &auth.id, &id, &chat_id)
        .await?;
    Ok(Json(turn))
}

async fn subscribe(
    State(state): State<AppState>,
    payload: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Result<Json<SubscribeResponse>, ApiError> {
    let req = body(payload)?;
    let email = req.email.as_deref().map(str::trim).unwrap_or_default();
    auth::validate_email(email)
        .map_err(|_| ApiError::validation("Please provide a valid email address."))?;
    let email = email.to_string();
    let notifier = state.notifier.clone();
    tokio::spawn(async move {
        if let Err(e) = notifier.subscribed(&email).await {
            warn!(error = %e, "subscription notice failed");
        }
    });
    Ok(Json(SubscribeResponse {
        message: "Subscription successful! Confirmation email has been sent.".into(),
    }))
}

/// Run the HTTP server until ctrl-c, with the pending-turn sweep if enabled.
pub async fn run_http_server(state: AppState) -> Result<()> {
    let addr: SocketAddr = state
        .config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", state.config.bind))?;
    let sweeper = sweep::spawn_sweep(state.clone());
    info!(%addr, relay = %state.config.relay.url, "listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("server stopped");
    Ok(())
}
