use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use coordination::{CoordinationStore, MemoryStore, PubSubTransport, RedisStore};
use futures::{SinkExt, StreamExt};
use realtime::{error::RealtimeError, JwtAuthenticator, Realtime, Session};
use serde::Deserialize;
use shared::{
    domain::InstanceId,
    error::{ApiError, ErrorCode},
    protocol::{OutboundFrame, ServerEvent},
};
use storage::Storage;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url, Settings, DEV_JWT_SECRET};

#[derive(Clone)]
struct AppState {
    realtime: Realtime,
}

#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let realtime = build_realtime(&settings).await?;
    let _bus = realtime
        .start()
        .await
        .context("failed to subscribe to the fan-out bus")?;

    let app = build_router(Arc::new(AppState { realtime }));
    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn build_realtime(settings: &Settings) -> anyhow::Result<Realtime> {
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let (store, transport): (Arc<dyn CoordinationStore>, Arc<dyn PubSubTransport>) =
        match &settings.redis_url {
            Some(redis_url) => {
                let redis = Arc::new(
                    RedisStore::connect(redis_url)
                        .await
                        .with_context(|| format!("failed to connect to redis at {redis_url}"))?,
                );
                info!(%redis_url, "using redis coordination store");
                (redis.clone(), redis)
            }
            None => {
                warn!("REDIS_URL not set, running in single-node mode with in-process coordination");
                let memory = Arc::new(MemoryStore::new());
                (memory.clone(), memory)
            }
        };

    if settings.jwt_secret == DEV_JWT_SECRET {
        warn!("JWT_SECRET not set, using the development secret");
    }
    let instance_id = settings
        .instance_id
        .as_deref()
        .map(InstanceId::from)
        .unwrap_or_else(InstanceId::generate);
    info!(%instance_id, "instance starting");

    Ok(Realtime::new(
        settings.realtime_config(),
        instance_id,
        Arc::new(storage),
        store,
        transport,
        JwtAuthenticator::new(&settings.jwt_secret),
    ))
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.realtime.health().await {
        Ok(()) => "ok".into_response(),
        Err(error) => {
            warn!(%error, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiError::from(error)),
            )
                .into_response()
        }
    }
}

/// `Authorization: Bearer <jwt>` first, `?token=` for browsers that cannot
/// set headers on a WebSocket handshake.
fn bearer_token<'a>(headers: &'a HeaderMap, query: &'a WsQuery) -> Option<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .or(query.token.as_deref())
}

fn rejection(error: RealtimeError) -> Response {
    let status = match &error {
        RealtimeError::Authentication(_) => StatusCode::UNAUTHORIZED,
        RealtimeError::Authorization(_) => StatusCode::FORBIDDEN,
        RealtimeError::Validation(_) => StatusCode::BAD_REQUEST,
        RealtimeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        RealtimeError::NotFound(_) => StatusCode::NOT_FOUND,
        RealtimeError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = ApiError::from(error);
    let retry_after = body.retry_after_ms.map(|ms| ms.div_ceil(1000).max(1));
    let mut response = (status, Json(body)).into_response();
    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    let token = bearer_token(&headers, &query);
    let session = match state
        .realtime
        .gatekeeper()
        .admit(token, Some(peer.ip()))
        .await
    {
        Ok(session) => session,
        Err(error) => {
            warn!(%peer, %error, "connection refused");
            return rejection(error);
        }
    };
    ws.on_upgrade(move |socket| ws_connection(state, socket, session))
}

/// One reader loop per connection, handling frames in arrival order, and one
/// writer task draining the connection's outbound queue.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket, session: Session) {
    let realtime = &state.realtime;
    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut queue) = mpsc::channel::<OutboundFrame>(realtime.config().outbound_queue);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%error, "failed to encode outbound frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let attachment = match realtime.gatekeeper().attach(&session, outbound.clone()).await {
        Ok(attachment) => attachment,
        Err(error) => {
            warn!(user_id = %session.user_id, %error, "failed to attach connection");
            let _ = outbound
                .send(OutboundFrame::Event(ServerEvent::Error(error.into())))
                .await;
            drop(outbound);
            let _ = send_task.await;
            return;
        }
    };

    while let Some(message) = receiver.next().await {
        let reply = match message {
            Ok(Message::Text(text)) => realtime.handle_text(&session, &text).await,
            Ok(Message::Binary(_)) => Some(OutboundFrame::Event(ServerEvent::Error(
                ApiError::new(ErrorCode::Validation, "binary frames are not supported"),
            ))),
            Ok(Message::Close(_)) => break,
            Ok(_) => None,
            Err(error) => {
                debug!(user_id = %session.user_id, %error, "websocket read failed");
                break;
            }
        };
        if let Some(reply) = reply {
            if outbound.send(reply).await.is_err() {
                break;
            }
        }
    }

    attachment.replay.abort();
    realtime.gatekeeper().disconnect(&session).await;
    drop(outbound);
    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
