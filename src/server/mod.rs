//! HTTP and WebSocket server.

mod extract;
mod handlers;

pub use extract::{AuthUser, JsonBody, parse_id};

use crate::auth::JwtIdentity;
use crate::config::{Config, CorsConfig};
use crate::db::Database;
use crate::realtime::EventBus;
use crate::service::{AccountService, TaskService};
use axum::Router;
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub tasks: TaskService<Database>,
    pub accounts: AccountService<Database>,
    pub bus: EventBus,
    pub identity: Arc<JwtIdentity>,
}

impl AppState {
    pub fn new(db: Arc<Database>, config: &Config) -> Self {
        let bus = EventBus::new(config.realtime.mailbox_capacity);
        let identity = Arc::new(JwtIdentity::new(
            &config.auth.jwt_secret,
            config.auth.token_ttl_hours,
        ));
        Self {
            tasks: TaskService::new(Arc::clone(&db), bus.clone()),
            accounts: AccountService::new(Arc::clone(&db), Arc::clone(&identity)),
            db,
            bus,
            identity,
        }
    }
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origin = if config.allows_any_origin() {
        // A literal `*` is not allowed together with credentials.
        if config.allow_credentials {
            AllowOrigin::mirror_request()
        } else {
            AllowOrigin::any()
        }
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %o, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            ACCEPT,
            ORIGIN,
            HeaderName::from_static("x-requested-with"),
        ])
        .allow_credentials(config.allow_credentials)
}

/// Build the application router.
pub fn build_router(state: AppState, cors: &CorsConfig) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/register", post(handlers::register))
        .route("/auth/login", post(handlers::login))
        .route("/profile", get(handlers::profile))
        .route(
            "/users",
            get(handlers::list_users).post(handlers::create_user),
        )
        .route(
            "/users/{id}",
            get(handlers::get_user)
                .put(handlers::update_user)
                .delete(handlers::delete_user),
        )
        .route(
            "/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route(
            "/tasks/{id}",
            get(handlers::get_task)
                .put(handlers::update_task)
                .delete(handlers::delete_task),
        )
        .route("/tasks/{id}/subtasks", get(handlers::list_subtasks))
        .route("/stats", get(handlers::stats))
        .route("/ws", get(handlers::websocket));

    Router::new()
        .nest("/api/v1", api)
        .fallback(handlers::not_found)
        .layer(cors_layer(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handle for a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    bus: EventBus,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close every realtime session, stop accepting requests and wait for
    /// in-flight requests to finish.
    pub async fn shutdown(mut self) {
        self.bus.shutdown();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.join.await {
            warn!("server task ended abnormally: {}", e);
        }
    }

    /// Wait for the server to stop on its own.
    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

/// Bind and start serving in the background.
pub async fn start_server(state: AppState, config: &Config) -> anyhow::Result<ServerHandle> {
    let bus = state.bus.clone();
    let app = build_router(state, &config.cors);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let bound_addr = listener.local_addr()?;

    info!("Listening on http://{}", bound_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let join = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("Server shutting down");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok(ServerHandle {
        addr: bound_addr,
        bus,
        shutdown_tx: Some(shutdown_tx),
        join,
    })
}
