//! Adieu server library logic.

pub mod api_federation;
pub mod background;
pub mod config;
pub mod keys;
pub mod middleware;
pub mod services;

use adieu_db::DbPool;
use adieu_federation::{
    AuthorizationEvaluator, EventIngestion, LeaveContext, MembershipRules, RoomStateSource,
    RoomVersionResolver, SignatureVerifier,
};
use adieu_types::{OwnedServerName, ServerSigningKey};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, put},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// This server's federation name.
    pub server_name: OwnedServerName,
    /// The local server signing key and the id it is published under.
    pub signing_key: Arc<ServerSigningKey>,
    pub resolver: Arc<dyn RoomVersionResolver>,
    pub room_state: Arc<dyn RoomStateSource>,
    pub authorizer: Arc<dyn AuthorizationEvaluator>,
    /// Key ring used for events and request signatures.
    pub verifier: Arc<dyn SignatureVerifier>,
    pub ingestion: Arc<dyn EventIngestion>,
}

impl AppState {
    /// Wires the SQLite-backed collaborators around `pool`. Remote keys the
    /// key ring lacks are requested through `key_fetcher`.
    pub fn new(
        pool: DbPool,
        server_name: OwnedServerName,
        signing_key: Arc<ServerSigningKey>,
        key_fetcher: Arc<dyn keys::KeyFetcher>,
    ) -> Self {
        let authorizer: Arc<dyn AuthorizationEvaluator> = Arc::new(MembershipRules);
        Self {
            resolver: Arc::new(services::DbRoomVersions { pool: pool.clone() }),
            room_state: Arc::new(services::DbRoomState { pool: pool.clone() }),
            verifier: Arc::new(services::DbKeyRing {
                pool: pool.clone(),
                fetcher: key_fetcher,
            }),
            ingestion: Arc::new(services::DbIngestion {
                pool: pool.clone(),
                server_name: server_name.clone(),
                authorizer: authorizer.clone(),
            }),
            authorizer,
            pool,
            server_name,
            signing_key,
        }
    }

    /// Borrows the collaborators for one handshake operation.
    pub fn leave_context(&self) -> LeaveContext<'_> {
        LeaveContext {
            server_name: &self.server_name,
            resolver: self.resolver.as_ref(),
            state: self.room_state.as_ref(),
            authorizer: self.authorizer.as_ref(),
            verifier: self.verifier.as_ref(),
            ingestion: self.ingestion.as_ref(),
        }
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let federation_routes = Router::new()
        .route(
            "/_matrix/federation/v1/make_leave/{roomId}/{userId}",
            get(api_federation::make_leave_handler),
        )
        .route(
            "/_matrix/federation/v1/send_leave/{roomId}/{eventId}",
            put(api_federation::send_leave_v1_handler),
        )
        .route(
            "/_matrix/federation/v2/send_leave/{roomId}/{eventId}",
            put(api_federation::send_leave_v2_handler),
        )
        .layer(axum::middleware::from_fn(middleware::federation_auth));

    Router::new()
        .route("/health", get(health))
        .route(keys::SERVER_KEYS_PATH, get(keys::get_server_keys_handler))
        .merge(federation_routes)
        .layer(DefaultBodyLimit::max(middleware::MAX_FEDERATION_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
