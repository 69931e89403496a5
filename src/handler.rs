//! Inbound message dispatch
//!
//! Interprets messages read from a connection: drives authentication,
//! subscribe/unsubscribe and publish, and builds the reply. Holds no
//! per-connection state of its own; the authenticated flag lives on the
//! `Connection`.
//!
//! Unauthenticated connections may only send `ping` and `auth`. Failed
//! authentication never closes the connection; the client may retry.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::auth::AuthVerifier;
use crate::connection::Connection;
use crate::error::HubError;
use crate::hub::{validate_channel, Hub};
use crate::message::{
    AuthPayload, AuthResultPayload, ChannelPayload, ErrorPayload, Message, Payload,
    PongPayload, PublishAckPayload, PublishPayload, PUBLISH_EVENT,
};

/// Dispatch policy shared by every connection
pub struct MessageHandler {
    hub: Arc<Hub>,
    verifier: Arc<dyn AuthVerifier>,
}

impl MessageHandler {
    pub fn new(hub: Arc<Hub>, verifier: impl AuthVerifier) -> Self {
        Self {
            hub,
            verifier: Arc::new(verifier),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Decode one raw frame, dispatch it and enqueue the reply
    ///
    /// A frame that fails to decode is answered with an error message;
    /// the connection stays open.
    pub fn handle_frame(&self, conn: &Connection, frame: &[u8]) {
        let reply = match Message::decode(frame) {
            Ok(msg) => {
                debug!(conn_id = %conn.id(), kind = ?msg.kind(), "Inbound message");
                self.handle(conn, &msg)
            }
            Err(e) => {
                warn!(conn_id = %conn.id(), error = %e, "Invalid message from client");
                let err = HubError::Malformed(e);
                Message::new(Payload::Error(ErrorPayload::from(&err)))
            }
        };

        if let Err(e) = conn.send(reply) {
            debug!(conn_id = %conn.id(), error = %e, "Reply not delivered");
        }
    }

    /// Dispatch a decoded message and build the correlated reply
    pub fn handle(&self, conn: &Connection, msg: &Message) -> Message {
        let payload = match self.dispatch(conn, msg) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(conn_id = %conn.id(), error = %e, "Request rejected");
                Payload::Error(ErrorPayload::from(&e))
            }
        };
        Message::reply_to(msg, payload)
    }

    /// Apply the dispatch table to one message
    pub fn dispatch(&self, conn: &Connection, msg: &Message) -> Result<Payload, HubError> {
        match &msg.payload {
            Payload::Ping => {
                conn.update_liveness();
                Ok(Payload::Pong(PongPayload {
                    timestamp: msg.timestamp,
                }))
            }
            Payload::Auth(AuthPayload { token }) => self.authenticate(conn, token),
            Payload::Subscribe(ChannelPayload { channel }) => {
                require_auth(conn)?;
                self.hub.subscribe_channel(conn.id(), channel)?;
                Ok(Payload::SubscribeAck(ChannelPayload {
                    channel: channel.clone(),
                }))
            }
            Payload::Unsubscribe(ChannelPayload { channel }) => {
                require_auth(conn)?;
                self.hub.unsubscribe_channel(conn.id(), channel)?;
                Ok(Payload::UnsubscribeAck(ChannelPayload {
                    channel: channel.clone(),
                }))
            }
            Payload::Publish(PublishPayload { channel, data }) => {
                require_auth(conn)?;
                validate_channel(channel)?;
                let notify = Message::notify(channel.clone(), PUBLISH_EVENT, data.clone());
                let subscriber_count = self.hub.broadcast_to_channel(channel, &notify);
                Ok(Payload::PublishAck(PublishAckPayload {
                    channel: channel.clone(),
                    subscriber_count,
                }))
            }
            other => Err(HubError::UnsupportedType(other.kind())),
        }
    }

    fn authenticate(&self, conn: &Connection, token: &str) -> Result<Payload, HubError> {
        if conn.is_authenticated() {
            return Err(HubError::AlreadyAuthenticated);
        }

        match self.verifier.verify(token) {
            Ok(identity) => {
                let result = AuthResultPayload {
                    success: true,
                    user_id: Some(identity.user_id.clone()),
                    session_id: Some(identity.session_id.clone()),
                    message: None,
                };
                self.hub.set_user_id(conn.id(), identity)?;
                Ok(Payload::AuthResult(result))
            }
            Err(e) => {
                info!(conn_id = %conn.id(), reason = %e, "Authentication failed");
                Ok(Payload::AuthResult(AuthResultPayload {
                    success: false,
                    user_id: None,
                    session_id: None,
                    message: Some(e.to_string()),
                }))
            }
        }
    }
}

fn require_auth(conn: &Connection) -> Result<(), HubError> {
    if conn.is_authenticated() {
        Ok(())
    } else {
        Err(HubError::NotAuthenticated)
    }
}
