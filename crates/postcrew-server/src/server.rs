use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use postcrew_core::ids::{Channel, ConnectionId};
use postcrew_engine::{AgentInvoker, Workflow, WorkflowConfig};
use postcrew_store::Database;
use postcrew_telemetry::SqliteLogSink;

use crate::agents;
use crate::bridge::FanoutBridge;
use crate::broker::{Broker, LocalBroker};
use crate::client::{self, ClientRegistry};
use crate::emitter::EventEmitter;
use crate::handlers::{self, AppState};
use crate::orchestrator::RunOrchestrator;
use crate::protocol::{parse_client_message, ClientMessage, ServerMessage};
use crate::subscriptions::SubscriptionRegistry;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9191,
            max_send_queue: 256,
        }
    }
}

/// What the server is built from.
pub struct ServerDeps {
    pub db: Database,
    pub invoker: Arc<dyn AgentInvoker>,
    pub workflow: WorkflowConfig,
    pub log_sink: Option<Arc<SqliteLogSink>>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(handlers::health))
        .route("/api/templates", post(handlers::create_template).get(handlers::list_templates))
        .route("/api/projects", post(handlers::create_project).get(handlers::list_projects))
        .route("/api/projects/{id}", get(handlers::get_project))
        .route("/api/projects/{id}/runs", get(handlers::list_project_runs))
        .route("/api/projects/{id}/favorite", post(handlers::toggle_favorite))
        .route("/api/projects/{id}/publish", post(handlers::publish))
        .route("/api/projects/{id}/post", put(handlers::update_post))
        .route("/api/projects/{id}/generate", post(handlers::generate))
        .route("/api/projects/{id}/regenerate", post(handlers::regenerate))
        .route("/api/runs/{id}", get(handlers::get_run))
        .route("/api/runs/{id}/evaluate", post(handlers::evaluate))
        .route("/api/runs/{id}/cancel", post(handlers::cancel))
        .route("/api/agents", get(agents::list_agents))
        .route("/api/agents/{name}", get(agents::agent_card))
        .route("/api/agents/{name}/invoke", post(agents::invoke_agent))
        .route("/api/logs", get(handlers::logs))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, deps: ServerDeps) -> Result<ServerHandle, std::io::Error> {
    let broker: Arc<dyn Broker> = Arc::new(LocalBroker::default());
    let clients = Arc::new(ClientRegistry::new(config.max_send_queue));
    let bridge = Arc::new(FanoutBridge::new(Arc::clone(&broker), Arc::clone(&clients)));
    let subscriptions = Arc::new(SubscriptionRegistry::new(Arc::clone(&bridge)));

    let emitter = Arc::new(EventEmitter::new(broker));
    let invoke_timeout = deps.workflow.invoke_timeout;
    let workflow = Arc::new(Workflow::new(
        Arc::clone(&deps.invoker),
        deps.db.clone(),
        emitter,
        deps.workflow,
    ));
    let orchestrator = Arc::new(RunOrchestrator::new(workflow, deps.db.clone()));

    let cleanup = spawn_cleanup(Arc::clone(&clients), Arc::clone(&subscriptions), CLEANUP_INTERVAL);

    let state = AppState {
        db: deps.db,
        orchestrator: Arc::clone(&orchestrator),
        clients,
        subscriptions,
        bridge,
        logs: deps.log_sink,
        invoker: deps.invoker,
        invoke_timeout,
    };

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "postcrew server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        orchestrator,
        _server: server,
        _cleanup: cleanup,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub orchestrator: Arc<RunOrchestrator>,
    _server: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

fn spawn_cleanup(
    clients: Arc<ClientRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for id in clients.cleanup_dead_clients() {
                subscriptions.drop_connection(&id);
            }
        }
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.clients.register();
    tracing::info!(connection_id = %connection_id, "subscriber connected");

    let clients = Arc::clone(&state.clients);
    let subscriptions = Arc::clone(&state.subscriptions);
    client::handle_ws_connection(
        socket,
        connection_id.clone(),
        rx,
        Arc::clone(&state.clients),
        move |id, raw| handle_client_frame(&clients, &subscriptions, id, raw),
    )
    .await;

    let dropped = state.subscriptions.drop_connection(&connection_id);
    tracing::info!(connection_id = %connection_id, dropped, "subscriber disconnected");
}

fn handle_client_frame(
    clients: &ClientRegistry,
    subscriptions: &SubscriptionRegistry,
    connection_id: &ConnectionId,
    raw: &str,
) {
    let reply = match parse_client_message(raw) {
        Ok(ClientMessage::Subscribe { run_id }) => {
            subscriptions.subscribe(connection_id, &Channel::for_run(&run_id));
            ServerMessage::Subscribed { run_id }
        }
        Ok(ClientMessage::Unsubscribe { run_id }) => {
            subscriptions.unsubscribe(connection_id, &Channel::for_run(&run_id));
            ServerMessage::Unsubscribed { run_id }
        }
        Ok(ClientMessage::Ping) => ServerMessage::pong(),
        Err(error_frame) => {
            tracing::debug!(connection_id = %connection_id, "rejected client frame");
            error_frame
        }
    };
    clients.send_to(connection_id, reply.to_json());
}
