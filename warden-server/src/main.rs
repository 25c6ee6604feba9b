use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use warden_server::actuator::handle_click;
use warden_server::chat::{RestChatGateway, RoleSetOracle};
use warden_server::config::{Config, SettingsMap};
use warden_server::state_machine::decision::ActionKind;
use warden_server::state_machine::repository::SqliteRepository;
use warden_server::state_machine::state::{Actor, ChannelId, CommunityId, MessageId, UserId};
use warden_server::submit::{bootstrap_member, submit_application};
use warden_server::sweep::{sweep_community, sweep_loop};
use warden_server::{AppState, WardenError};

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "warden",
        "version": warden_server::get_service_version(),
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    community_id: CommunityId,
    user_id: UserId,
    username: String,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let settings = state.settings.get(request.community_id);
    let result = submit_application(
        state.repository.as_ref(),
        state.gateway.as_ref(),
        &settings,
        request.community_id,
        request.user_id,
        &request.username,
        request.fields,
    )
    .await;

    match result {
        Ok(status) => Json(json!({ "status": status })).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    community_id: CommunityId,
    user_id: UserId,
    username: String,
}

/// Platform callback: a member joined a community.
async fn join_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JoinRequest>,
) -> Response {
    match bootstrap_member(
        state.repository.as_ref(),
        request.community_id,
        request.user_id,
        &request.username,
    )
    .await
    {
        Ok(status) => Json(json!({ "status": status })).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    community_id: CommunityId,
    channel_id: ChannelId,
    message_id: MessageId,
    actor_id: UserId,
    actor_name: String,
    action: ActionKind,
}

/// Interaction callback: an approver clicked approve or deny.
async fn action_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ActionRequest>,
) -> Response {
    let message = match state
        .gateway
        .fetch_message(request.channel_id, request.message_id)
        .await
    {
        Ok(Some(message)) => message,
        Ok(None) => {
            return error_response(WardenError::NotFound(format!(
                "message {} not found in channel {}",
                request.message_id, request.channel_id
            )))
        }
        Err(err) => return error_response(err.into()),
    };

    let settings = state.settings.get(request.community_id);
    let result = handle_click(
        state.repository.as_ref(),
        state.gateway.as_ref(),
        state.oracle.as_ref(),
        &settings,
        request.community_id,
        &message,
        Actor::user(request.actor_id, request.actor_name),
        request.action,
    )
    .await;

    match result {
        Ok(visual) => Json(json!({ "status": visual.displayed_status() })).into_response(),
        Err(err) => error_response(err),
    }
}

/// Manual sweep trigger for one community.
async fn sweep_handler(
    State(state): State<Arc<AppState>>,
    Path(community_id): Path<u64>,
) -> Response {
    let community_id = CommunityId(community_id);
    let settings = state.settings.get(community_id);

    match sweep_community(
        state.repository.as_ref(),
        state.gateway.as_ref(),
        &settings,
        community_id,
    )
    .await
    {
        Ok(report) => Json(json!({
            "checked": report.checked,
            "updated": report.updated,
            "errors": report.errors,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: WardenError) -> Response {
    let status = match &err {
        WardenError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WardenError::Permission { .. } => StatusCode::FORBIDDEN,
        WardenError::NotFound(_) => StatusCode::NOT_FOUND,
        WardenError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting onboarding approval service");

    let config = Config::from_env().context("failed to load configuration")?;

    let settings = SettingsMap::load(&config.settings_path)
        .with_context(|| format!("failed to load {}", config.settings_path.display()))?;

    let db_path = config.state_dir.join("warden-state.db");
    info!("Using state database: {}", db_path.display());
    let repository =
        SqliteRepository::new(&db_path).context("failed to initialize SQLite database")?;

    let gateway = Arc::new(RestChatGateway::new(
        config.chat_api_base_url.clone(),
        config.chat_api_token.clone(),
    ));
    let settings = Arc::new(settings);
    let oracle = RoleSetOracle::new(gateway.clone(), settings.clone());

    let app_state = Arc::new(AppState {
        gateway,
        repository: Arc::new(repository),
        oracle: Arc::new(oracle),
        settings,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_state = app_state.clone();
    let sweep_tick = config.sweep_tick;
    let sweep_handle = tokio::spawn(async move {
        sweep_loop(sweep_state, sweep_tick, shutdown_rx).await;
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/members/joins", post(join_handler))
        .route("/applications", post(submit_handler))
        .route("/actions", post(action_handler))
        .route("/communities/:community_id/sweep", post(sweep_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await;

    // Stop the sweep and let any in-flight pass finish before exiting.
    let _ = shutdown_tx.send(true);
    let _ = sweep_handle.await;

    serve_result?;
    Ok(())
}
