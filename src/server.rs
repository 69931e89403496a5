//! HTTP surface of the hub
//!
//! Routes:
//! - `GET /ws`     upgrade to a WebSocket, one `Connection` per client
//! - `GET /stats`  `{ total_connections, authenticated_users, total_channels }`
//! - `GET /health` liveness of the process itself
//!
//! Every upgraded socket is registered with the hub for exactly as long as
//! its handler runs: a `Registration` guard unregisters on every exit path.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::auth::AuthVerifier;
use crate::connection::Connection;
use crate::error::AppError;
use crate::handler::MessageHandler;
use crate::hub::{Hub, HubStats};
use crate::types::ConnectionId;

/// Accepts clients and wires them into the hub
pub struct Server {
    handler: Arc<MessageHandler>,
}

impl Server {
    pub fn new(hub: Arc<Hub>, verifier: impl AuthVerifier) -> Self {
        Self {
            handler: Arc::new(MessageHandler::new(hub, verifier)),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        self.handler.hub()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/stats", get(stats_handler))
            .route("/health", get(health_handler))
            .with_state(Arc::clone(&self.handler))
    }

    /// Serve until `shutdown` resolves
    ///
    /// Starts the reaper, and on shutdown closes every connection before
    /// waiting for in-flight requests to finish.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let hub = Arc::clone(self.hub());
        let reaper = hub.spawn_reaper();
        let app = self.router();

        info!(addr = ?listener.local_addr().ok(), "Hub server listening");

        let signal_hub = Arc::clone(&hub);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("Shutdown signal received");
                signal_hub.shutdown();
            })
            .await?;

        let _ = reaper.await;
        info!("Hub server stopped");
        Ok(())
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn stats_handler(State(handler): State<Arc<MessageHandler>>) -> Json<HubStats> {
    Json(handler.hub().stats())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(handler): State<Arc<MessageHandler>>,
) -> impl IntoResponse {
    let max_size = handler.hub().config().max_message_size;
    ws.max_message_size(max_size)
        .on_upgrade(move |socket| handle_socket(socket, handler))
}

/// Run one upgraded client to completion
pub async fn handle_socket(socket: WebSocket, handler: Arc<MessageHandler>) {
    let hub = Arc::clone(handler.hub());
    let (conn, queue) = Connection::new(ConnectionId::new(), hub.config().send_queue_capacity);
    let _registration = Registration::new(hub, Arc::clone(&conn));

    conn.serve(socket, queue, handler).await;
}

/// Keeps a connection registered while alive; unregisters and closes on drop
struct Registration {
    hub: Arc<Hub>,
    id: ConnectionId,
}

impl Registration {
    fn new(hub: Arc<Hub>, conn: Arc<Connection>) -> Self {
        let id = conn.id();
        if hub.register(conn) {
            info!(conn_id = %id, "Client connected");
        }
        Self { hub, id }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(conn) = self.hub.unregister(self.id) {
            conn.close();
        }
        info!(conn_id = %self.id, "Client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::config::HubConfig;
    use crate::types::Identity;

    #[tokio::test]
    async fn test_registration_guard_unregisters_on_drop() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let (conn, _queue) = Connection::new(ConnectionId::new(), 4);
        hub.subscribe_channel(conn.id(), "doc").unwrap_err();

        let guard = Registration::new(Arc::clone(&hub), Arc::clone(&conn));
        hub.subscribe_channel(conn.id(), "doc").unwrap();
        assert_eq!(hub.stats().total_connections, 1);

        drop(guard);
        assert_eq!(hub.stats().total_connections, 0);
        assert_eq!(hub.stats().total_channels, 0);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_guard_tolerates_prior_reap() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let (conn, _queue) = Connection::new(ConnectionId::new(), 4);
        let guard = Registration::new(Arc::clone(&hub), Arc::clone(&conn));

        conn.close();
        assert_eq!(hub.reap(), 1);
        drop(guard);
        assert_eq!(hub.stats().total_connections, 0);
    }

    #[tokio::test]
    async fn test_upgrade_during_shutdown_is_closed() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        hub.shutdown();

        let (conn, _queue) = Connection::new(ConnectionId::new(), 4);
        let guard = Registration::new(Arc::clone(&hub), Arc::clone(&conn));
        assert!(conn.is_closed());
        assert_eq!(hub.stats().total_connections, 0);
        drop(guard);
    }

    #[tokio::test]
    async fn test_stats_route() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let server = Server::new(Arc::clone(&hub), StaticTokenVerifier::new());

        let (conn, _queue) = Connection::new(ConnectionId::new(), 4);
        hub.register(Arc::clone(&conn));
        hub.set_user_id(conn.id(), Identity::new("bob", "s1")).unwrap();
        hub.subscribe_channel(conn.id(), "doc-42").unwrap();

        let response = server
            .router()
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let stats: HubStats = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            stats,
            HubStats {
                total_connections: 1,
                authenticated_users: 1,
                total_channels: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_health_route() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let server = Server::new(hub, StaticTokenVerifier::new());

        let response = server
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }
}
