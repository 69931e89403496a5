//! Real-time Collaboration Hub Library
//!
//! The in-process pub/sub broker behind a collaborative-application
//! gateway. It owns every live WebSocket connection, its authentication
//! state and its channel subscriptions, and applies delivery, backpressure
//! and liveness policy to each.
//!
//! # Features
//! - WebSocket upgrade and stats routes (axum)
//! - Token authentication through a pluggable verifier
//! - Ephemeral named channels with subscribe/unsubscribe/publish
//! - Broadcast, per-channel and per-user delivery
//! - Bounded, drop-on-full outbound queues
//! - Liveness probes and a periodic reaper for dead peers
//!
//! # Architecture
//! - `Hub` holds the connection, user and channel indices behind one
//!   reader/writer lock and is passed by `Arc` to every collaborator
//! - Each `Connection` guards its own state with its own lock and runs a
//!   read pump and a write pump joined to its lifetime
//! - `MessageHandler` is the stateless dispatch policy for inbound messages
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use collab_hub::{Hub, HubConfig, Server, StaticTokenVerifier};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let hub = Arc::new(Hub::new(HubConfig::default()));
//!     let verifier = StaticTokenVerifier::parse("secret=alice").unwrap();
//!
//!     // push server-side events through the same hub handle
//!     let events = Arc::clone(&hub);
//!     tokio::spawn(async move {
//!         let _ = events.stats();
//!     });
//!
//!     Server::new(hub, verifier)
//!         .run(listener, async { let _ = tokio::signal::ctrl_c().await; })
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use auth::{AuthVerifier, StaticTokenVerifier};
pub use config::{HubConfig, ServerConfig};
pub use connection::{Connection, OutboundQueue};
pub use error::{AppError, AuthError, HubError};
pub use handler::MessageHandler;
pub use hub::{Hub, HubStats};
pub use message::{ErrorCode, Message, MessageType, Payload};
pub use server::Server;
pub use types::{ConnectionId, Identity, MessageId};
