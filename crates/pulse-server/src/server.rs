//! `PulseServer`: Axum HTTP + `WebSocket` server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use pulse_protocol::MessageRegistry;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::config::ServerConfig;
use crate::handlers;
use crate::health::{self, HealthResponse};
use crate::session::{Session, SessionManager};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::context::SocketContext;
use crate::websocket::session::{Heartbeat, SessionDeps, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
struct AppState {
    deps: SessionDeps,
    permits: Arc<Semaphore>,
    max_connections: usize,
    max_message_size: usize,
    start_time: Instant,
}

impl AppState {
    fn connections(&self) -> usize {
        self.max_connections
            .saturating_sub(self.permits.available_permits())
    }
}

/// Accepts device sockets and routes their messages to a [`Bridge`].
pub struct PulseServer {
    config: ServerConfig,
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
}

impl PulseServer {
    /// Server with only the built-in handlers.
    pub fn new(config: ServerConfig, bridge: Arc<dyn Bridge>) -> Self {
        Self::with_registry(config, bridge, MessageRegistry::new())
    }

    /// Server with extra handlers. Built-in handlers replace any registered
    /// for the same types.
    pub fn with_registry(
        config: ServerConfig,
        bridge: Arc<dyn Bridge>,
        mut registry: MessageRegistry<SocketContext>,
    ) -> Self {
        handlers::register_all(&mut registry);
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let max_connections = config.max_connections.clamp(1, Semaphore::MAX_PERMITS);
        let state = AppState {
            deps: SessionDeps {
                registry: Arc::new(registry),
                sessions: Arc::new(SessionManager::new()),
                bridge,
                heartbeat: Heartbeat {
                    interval: config.heartbeat_interval(),
                    timeout: config.heartbeat_timeout(),
                },
                shutdown: shutdown.token(),
            },
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            max_message_size: config.max_message_size,
            start_time: Instant::now(),
        };
        Self {
            config,
            state,
            shutdown,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/sessions", get(sessions_handler))
            .with_state(self.state.clone())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve in a background task until shutdown.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "server exited with error");
            }
        });
        info!(%addr, "pulse server listening");
        Ok((addr, handle))
    }

    /// Session table.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.state.deps.sessions
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Dispatch table.
    pub fn registry(&self) -> &Arc<MessageRegistry<SocketContext>> {
        &self.state.deps.registry
    }

    /// Sockets currently open.
    pub fn connection_count(&self) -> usize {
        self.state.connections()
    }
}

/// GET / and /ws
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.deps.shutdown.is_cancelled() {
        counter!("ws_connections_refused_total", "reason" => "shutdown").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Ok(permit) = state.permits.clone().try_acquire_owned() else {
        warn!(max = state.max_connections, "connection limit reached, refusing socket");
        counter!("ws_connections_refused_total", "reason" => "capacity").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let deps = state.deps.clone();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            run_ws_session(socket, deps).await;
            drop(permit);
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let sessions = &state.deps.sessions;
    Json(health::health_check(
        state.start_time,
        state.deps.shutdown.is_cancelled(),
        state.connections(),
        sessions.len(),
        sessions.connected_count(),
    ))
}

/// GET /sessions
async fn sessions_handler(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.deps.sessions.get_all_sessions())
}
