//! Per-client connection
//!
//! A `Connection` owns one peer's session state and its bounded outbound
//! queue. Its fields are mutated only through its own methods, under its
//! own lock; the hub never reaches inside.
//!
//! Once upgraded, a connection runs two pumps over the split socket:
//! - read pump: frames → `MessageHandler`, refreshed read deadline on pong
//! - write pump: outbound queue → frames, periodic liveness probes
//!
//! Either pump ending calls `close()`, which cancels the other.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::HubError;
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::types::{ConnectionId, Identity};

/// Mutable per-connection state, guarded by the connection's lock
#[derive(Debug)]
struct ConnectionState {
    /// Set once on successful authentication, never cleared
    identity: Option<Identity>,
    /// Last liveness signal from the peer
    last_seen: Instant,
    closed: bool,
    subscriptions: HashSet<String>,
}

/// A live client connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    /// Hub → client queue (bounded, FIFO)
    sender: mpsc::Sender<Message>,
    /// Flipped to true on close; both pumps watch it
    cancel: watch::Sender<bool>,
    state: Mutex<ConnectionState>,
}

/// Receiving half of a connection's outbound queue, drained by the write pump
#[derive(Debug)]
pub struct OutboundQueue {
    receiver: mpsc::Receiver<Message>,
}

impl OutboundQueue {
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Dequeue without waiting
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue
    pub fn new(id: ConnectionId, capacity: usize) -> (Arc<Self>, OutboundQueue) {
        let (sender, receiver) = mpsc::channel(capacity);
        let (cancel, _) = watch::channel(false);
        let conn = Self {
            id,
            sender,
            cancel,
            state: Mutex::new(ConnectionState {
                identity: None,
                last_seen: Instant::now(),
                closed: false,
                subscriptions: HashSet::new(),
            }),
        };
        (Arc::new(conn), OutboundQueue { receiver })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue a message for delivery
    ///
    /// Never waits: a full queue drops the message and reports
    /// `SendChannelFull`, so one slow peer cannot stall the sender.
    pub fn send(&self, msg: Message) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed);
        }
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    conn_id = %self.id,
                    kind = ?dropped.kind(),
                    "Outbound queue full, dropping message"
                );
                Err(HubError::SendChannelFull)
            }
            Err(TrySendError::Closed(_)) => Err(HubError::ConnectionClosed),
        }
    }

    /// Tear the connection down
    ///
    /// Idempotent. Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
        }
        self.cancel.send_replace(true);
        debug!(conn_id = %self.id, "Connection closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Bind the connection to an identity (at most once)
    pub fn mark_authenticated(&self, identity: Identity) -> Result<(), HubError> {
        let mut state = self.state.lock();
        if state.identity.is_some() {
            return Err(HubError::AlreadyAuthenticated);
        }
        state.identity = Some(identity);
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().identity.is_some()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.lock().identity.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.state
            .lock()
            .identity
            .as_ref()
            .map(|identity| identity.user_id.clone())
    }

    /// Add a channel to the local subscription set; false if already present
    pub fn subscribe(&self, channel: &str) -> bool {
        self.state.lock().subscriptions.insert(channel.to_string())
    }

    /// Remove a channel from the local subscription set; false if absent
    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.state.lock().subscriptions.remove(channel)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.state.lock().subscriptions.contains(channel)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.iter().cloned().collect()
    }

    /// Stamp the current time as the last liveness signal
    pub fn update_liveness(&self) {
        self.state.lock().last_seen = Instant::now();
    }

    /// Instant of the last liveness signal
    pub fn last_seen(&self) -> Instant {
        self.state.lock().last_seen
    }

    /// Time since the last liveness signal
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_seen.elapsed()
    }

    /// Messages currently waiting in the outbound queue
    pub fn queue_len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// Run both pumps over an upgraded socket until the connection ends
    ///
    /// The caller owns registration; this only returns once both pumps
    /// have stopped and the connection is closed.
    pub async fn serve(
        self: Arc<Self>,
        socket: WebSocket,
        queue: OutboundQueue,
        handler: Arc<MessageHandler>,
    ) {
        let config = handler.hub().config().clone();
        let (sink, stream) = socket.split();

        let read_task = tokio::spawn(read_pump(
            Arc::clone(&self),
            stream,
            handler,
            config.clone(),
        ));
        let write_task = tokio::spawn(write_pump(Arc::clone(&self), sink, queue, config));

        let (read_result, write_result) = tokio::join!(read_task, write_task);
        if let Err(e) = read_result {
            warn!(conn_id = %self.id, error = %e, "Read pump aborted");
        }
        if let Err(e) = write_result {
            warn!(conn_id = %self.id, error = %e, "Write pump aborted");
        }

        self.close();
    }
}

/// Resolves once the watched flag turns true (or its sender is gone)
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|closed| *closed).await;
}

/// Socket → handler
///
/// A malformed frame is answered with an error message and the loop
/// continues; socket errors, EOF, close frames and an expired read
/// deadline end it.
async fn read_pump(
    conn: Arc<Connection>,
    mut stream: SplitStream<WebSocket>,
    handler: Arc<MessageHandler>,
    config: HubConfig,
) {
    let mut cancel = conn.cancel.subscribe();
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let next = tokio::select! {
            _ = cancelled(&mut cancel) => break,
            next = time::timeout_at(deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                info!(conn_id = %conn.id, "Read deadline exceeded, dropping peer");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(conn_id = %conn.id, error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => handler.handle_frame(&conn, text.as_str().as_bytes()),
            WsMessage::Binary(bytes) => handler.handle_frame(&conn, &bytes),
            WsMessage::Pong(_) => conn.update_liveness(),
            WsMessage::Ping(_) => {
                // Pong is handled automatically by axum
            }
            WsMessage::Close(_) => {
                debug!(conn_id = %conn.id, "Client sent close frame");
                break;
            }
        }

        // probe pongs and application pings both count as liveness
        deadline = conn.last_seen() + config.pong_wait;
    }

    debug!(conn_id = %conn.id, "Read pump ended");
    conn.close();
}

/// Outbound queue → socket, plus periodic liveness probes
async fn write_pump(
    conn: Arc<Connection>,
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut queue: OutboundQueue,
    config: HubConfig,
) {
    let mut cancel = conn.cancel.subscribe();
    let mut ticker = time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            _ = ticker.tick() => WsMessage::Ping(Default::default()),
            msg = queue.recv() => match msg {
                Some(msg) => match msg.encode() {
                    Ok(text) => WsMessage::Text(text.into()),
                    Err(e) => {
                        warn!(conn_id = %conn.id, error = %e, "Failed to serialize message");
                        continue;
                    }
                },
                None => break,
            },
        };

        match time::timeout(config.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = %conn.id, error = %e, "WebSocket send failed");
                conn.close();
                return;
            }
            Err(_) => {
                warn!(conn_id = %conn.id, "WebSocket write timed out");
                conn.close();
                return;
            }
        }
    }

    debug!(conn_id = %conn.id, "Write pump ended");

    // Send close frame when done
    let _ = time::timeout(config.write_wait, sink.send(WsMessage::Close(None))).await;
    let _ = time::timeout(config.write_wait, sink.close()).await;
    conn.close();
}
