//! Connection hub
//!
//! The single source of truth for who is connected, who is authenticated
//! and who is subscribed where. Holds three indices behind one
//! reader/writer lock:
//! - connection id → connection (owning)
//! - user id → connection ids (derived)
//! - channel name → connection ids (derived)
//!
//! Delivery into a connection is a non-blocking enqueue, so routing runs
//! under the read lock. Lock order is always hub → connection; connections
//! never call back into the hub.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::connection::{cancelled, Connection};
use crate::error::HubError;
use crate::message::Message;
use crate::types::{ConnectionId, Identity};

/// Longest accepted channel name, in bytes
pub const MAX_CHANNEL_LEN: usize = 128;

/// Point-in-time hub counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub total_connections: usize,
    pub authenticated_users: usize,
    pub total_channels: usize,
}

#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// Only authenticated, registered connections appear here
    users: HashMap<String, Vec<ConnectionId>>,
    /// A channel entry exists iff its set is non-empty
    channels: HashMap<String, HashSet<ConnectionId>>,
}

impl Registry {
    /// Drop a connection from every index
    fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        let conn = self.connections.remove(&id)?;

        if let Some(user_id) = conn.user_id() {
            if let Some(ids) = self.users.get_mut(&user_id) {
                ids.retain(|c| *c != id);
                if ids.is_empty() {
                    self.users.remove(&user_id);
                }
            }
        }

        for channel in conn.subscriptions() {
            self.leave_channel(&channel, id);
        }

        Some(conn)
    }

    fn leave_channel(&mut self, channel: &str, id: ConnectionId) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(&id);
            if members.is_empty() {
                self.channels.remove(channel);
                debug!(channel, "Channel removed (empty)");
            }
        }
    }

    fn get(&self, id: ConnectionId) -> Result<&Arc<Connection>, HubError> {
        self.connections
            .get(&id)
            .ok_or(HubError::ConnectionNotFound(id))
    }
}

/// Process-local registry and router for all live connections
#[derive(Debug)]
pub struct Hub {
    config: HubConfig,
    registry: RwLock<Registry>,
    /// Flipped on shutdown; stops the reaper and refuses registrations
    shutdown: watch::Sender<bool>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry: RwLock::new(Registry::default()),
            shutdown,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Add a connection to the registry
    ///
    /// Once shutdown has started the connection is closed instead and
    /// `false` is returned.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        let id = conn.id();
        let total = {
            let mut registry = self.registry.write();
            // read under the write lock so a concurrent drain cannot miss it
            if *self.shutdown.borrow() {
                None
            } else {
                registry.connections.insert(id, Arc::clone(&conn));
                Some(registry.connections.len())
            }
        };
        match total {
            Some(total) => {
                info!(conn_id = %id, total, "Connection registered");
                true
            }
            None => {
                conn.close();
                info!(conn_id = %id, "Connection refused, hub is shutting down");
                false
            }
        }
    }

    /// Remove a connection from every index
    ///
    /// Idempotent: unknown ids are ignored.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.registry.write().remove(id);
        if removed.is_some() {
            info!(conn_id = %id, "Connection unregistered");
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.registry.read().connections.get(&id).cloned()
    }

    /// Mark a connection authenticated and index it under its user
    pub fn set_user_id(&self, id: ConnectionId, identity: Identity) -> Result<(), HubError> {
        let mut registry = self.registry.write();
        let conn = Arc::clone(registry.get(id)?);
        let user_id = identity.user_id.clone();
        conn.mark_authenticated(identity)?;
        registry.users.entry(user_id.clone()).or_default().push(id);
        info!(conn_id = %id, user_id = %user_id, "Connection authenticated");
        Ok(())
    }

    /// Subscribe a connection to a channel, materializing the channel if new
    pub fn subscribe_channel(&self, id: ConnectionId, channel: &str) -> Result<(), HubError> {
        validate_channel(channel)?;
        let mut registry = self.registry.write();
        let conn = Arc::clone(registry.get(id)?);
        conn.subscribe(channel);
        registry
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        debug!(conn_id = %id, channel, "Subscribed");
        Ok(())
    }

    /// Unsubscribe a connection from a channel, dropping the channel if empty
    pub fn unsubscribe_channel(&self, id: ConnectionId, channel: &str) -> Result<(), HubError> {
        validate_channel(channel)?;
        let mut registry = self.registry.write();
        let conn = Arc::clone(registry.get(id)?);
        conn.unsubscribe(channel);
        registry.leave_channel(channel, id);
        debug!(conn_id = %id, channel, "Unsubscribed");
        Ok(())
    }

    /// Deliver to every authenticated connection
    ///
    /// Returns the number of successful enqueues; drops on individual
    /// connections do not abort the fan-out.
    pub fn broadcast(&self, msg: &Message) -> usize {
        let registry = self.registry.read();
        let delivered = registry
            .connections
            .values()
            .filter(|conn| conn.is_authenticated())
            .filter(|conn| deliver(conn, msg))
            .count();
        debug!(kind = ?msg.kind(), delivered, "Broadcast");
        delivered
    }

    /// Deliver to every subscriber of `channel`
    pub fn broadcast_to_channel(&self, channel: &str, msg: &Message) -> usize {
        let registry = self.registry.read();
        let Some(members) = registry.channels.get(channel) else {
            return 0;
        };
        let delivered = members
            .iter()
            .filter_map(|id| registry.connections.get(id))
            .filter(|conn| deliver(conn, msg))
            .count();
        debug!(channel, kind = ?msg.kind(), delivered, "Channel broadcast");
        delivered
    }

    /// Deliver to every connection of `user_id`
    pub fn send_to_user(&self, user_id: &str, msg: &Message) -> usize {
        let registry = self.registry.read();
        let Some(ids) = registry.users.get(user_id) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| registry.connections.get(id))
            .filter(|conn| deliver(conn, msg))
            .count()
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.registry.read();
        HubStats {
            total_connections: registry.connections.len(),
            authenticated_users: registry.users.len(),
            total_channels: registry.channels.len(),
        }
    }

    pub fn channel_subscriber_count(&self, channel: &str) -> usize {
        self.registry
            .read()
            .channels
            .get(channel)
            .map_or(0, HashSet::len)
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.registry.read().users.get(user_id).map_or(0, Vec::len)
    }

    /// One reaper sweep
    ///
    /// Removes connections that are already closed or whose last liveness
    /// signal is older than `stale_after`, and closes them. Returns the
    /// number reaped.
    pub fn reap(&self) -> usize {
        let mut registry = self.registry.write();
        let stale: Vec<ConnectionId> = registry
            .connections
            .values()
            .filter(|conn| conn.is_closed() || conn.idle_for() > self.config.stale_after)
            .map(|conn| conn.id())
            .collect();

        for id in &stale {
            if let Some(conn) = registry.remove(*id) {
                conn.close();
                info!(conn_id = %id, "Reaped idle connection");
            }
        }
        stale.len()
    }

    /// Start the periodic reaper
    ///
    /// The task holds only a weak handle, and stops on `shutdown` or once
    /// the hub is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let hub: Weak<Hub> = Arc::downgrade(self);
        let period = self.config.reaper_interval;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancelled(&mut shutdown) => break,
                    _ = ticker.tick() => {
                        let Some(live) = hub.upgrade() else { break };
                        let reaped = live.reap();
                        if reaped > 0 {
                            info!(reaped, remaining = live.stats().total_connections, "Reaper sweep");
                        }
                    }
                }
            }
            debug!("Reaper stopped");
        })
    }

    /// Cancel every connection and drain all indices
    ///
    /// Returns the number of connections closed.
    pub fn shutdown(&self) -> usize {
        self.shutdown.send_replace(true);
        let drained: Vec<Arc<Connection>> = {
            let mut registry = self.registry.write();
            registry.users.clear();
            registry.channels.clear();
            registry.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            conn.close();
        }
        info!(closed = drained.len(), "Hub shut down");
        drained.len()
    }
}

fn deliver(conn: &Connection, msg: &Message) -> bool {
    match conn.send(msg.clone()) {
        Ok(()) => true,
        Err(e) => {
            debug!(conn_id = %conn.id(), error = %e, "Delivery skipped");
            false
        }
    }
}

pub(crate) fn validate_channel(channel: &str) -> Result<(), HubError> {
    if channel.is_empty() || channel.len() > MAX_CHANNEL_LEN {
        return Err(HubError::InvalidChannel(channel.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connection::OutboundQueue;
    use crate::message::{Payload, PUBLISH_EVENT};

    fn new_hub() -> Hub {
        Hub::new(HubConfig::default())
    }

    fn connect(hub: &Hub) -> (Arc<Connection>, OutboundQueue) {
        let (conn, queue) =
            Connection::new(ConnectionId::new(), hub.config().send_queue_capacity);
        hub.register(Arc::clone(&conn));
        (conn, queue)
    }

    fn event() -> Message {
        Message::notify("doc-42", PUBLISH_EVENT, serde_json::json!({"v": 1}))
    }

    #[tokio::test]
    async fn test_register_then_unregister_all() {
        let hub = new_hub();
        let conns: Vec<_> = (0..5).map(|_| connect(&hub)).collect();
        assert_eq!(hub.stats().total_connections, 5);

        for (conn, _) in &conns {
            assert!(hub.unregister(conn.id()).is_some());
        }
        assert_eq!(hub.stats().total_connections, 0);

        // second unregister is a no-op
        assert!(hub.unregister(conns[0].0.id()).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_authenticated() {
        let hub = new_hub();
        let (a, mut qa) = connect(&hub);
        let (b, _qb) = connect(&hub);
        let (_c, mut qc) = connect(&hub);

        hub.set_user_id(a.id(), Identity::new("u1", "s1")).unwrap();
        hub.set_user_id(b.id(), Identity::new("u2", "s2")).unwrap();

        assert_eq!(hub.broadcast(&event()), 2);
        assert!(qa.try_recv().is_some());
        assert!(qc.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_channel_isolation() {
        let hub = new_hub();
        let (a, mut qa) = connect(&hub);
        let (b, mut qb) = connect(&hub);

        hub.subscribe_channel(a.id(), "x").unwrap();
        hub.subscribe_channel(b.id(), "y").unwrap();

        assert_eq!(hub.broadcast_to_channel("x", &event()), 1);
        assert!(qa.try_recv().is_some());
        assert!(qb.try_recv().is_none());
        assert_eq!(hub.broadcast_to_channel("nowhere", &event()), 0);
    }

    #[tokio::test]
    async fn test_send_to_user_and_channel_scenario() {
        let hub = new_hub();
        let (conn1, _q1) = connect(&hub);
        let (conn2, _q2) = connect(&hub);

        hub.set_user_id(conn1.id(), Identity::new("u1", "s1")).unwrap();
        hub.set_user_id(conn2.id(), Identity::new("u1", "s2")).unwrap();
        assert_eq!(hub.send_to_user("u1", &event()), 2);
        assert_eq!(hub.send_to_user("u2", &event()), 0);

        hub.subscribe_channel(conn1.id(), "doc-42").unwrap();
        assert_eq!(hub.broadcast_to_channel("doc-42", &event()), 1);

        let stats = hub.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.authenticated_users, 1);
        assert_eq!(stats.total_channels, 1);
    }

    #[tokio::test]
    async fn test_channel_lifecycle() {
        let hub = new_hub();
        let (a, _qa) = connect(&hub);
        let (b, _qb) = connect(&hub);

        hub.subscribe_channel(a.id(), "doc").unwrap();
        hub.subscribe_channel(b.id(), "doc").unwrap();
        hub.subscribe_channel(b.id(), "doc").unwrap();
        assert_eq!(hub.channel_subscriber_count("doc"), 2);
        assert!(b.is_subscribed("doc"));

        hub.unsubscribe_channel(a.id(), "doc").unwrap();
        assert_eq!(hub.stats().total_channels, 1);
        assert!(!a.is_subscribed("doc"));

        hub.unregister(b.id());
        assert_eq!(hub.stats().total_channels, 0);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_not_found() {
        let hub = new_hub();
        let ghost = ConnectionId::new();

        assert!(matches!(
            hub.set_user_id(ghost, Identity::new("u1", "s1")),
            Err(HubError::ConnectionNotFound(id)) if id == ghost
        ));
        assert!(matches!(
            hub.subscribe_channel(ghost, "doc"),
            Err(HubError::ConnectionNotFound(_))
        ));
        assert!(matches!(
            hub.unsubscribe_channel(ghost, "doc"),
            Err(HubError::ConnectionNotFound(_))
        ));
        assert_eq!(hub.stats().total_channels, 0);
    }

    #[tokio::test]
    async fn test_invalid_channel_names() {
        let hub = new_hub();
        let (a, _qa) = connect(&hub);

        assert!(matches!(
            hub.subscribe_channel(a.id(), ""),
            Err(HubError::InvalidChannel(_))
        ));
        let long = "c".repeat(MAX_CHANNEL_LEN + 1);
        assert!(matches!(
            hub.subscribe_channel(a.id(), &long),
            Err(HubError::InvalidChannel(_))
        ));
        assert!(a.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_user_index_follows_unregister() {
        let hub = new_hub();
        let (a, _qa) = connect(&hub);
        let (b, _qb) = connect(&hub);
        hub.set_user_id(a.id(), Identity::new("u1", "s1")).unwrap();
        hub.set_user_id(b.id(), Identity::new("u1", "s2")).unwrap();

        hub.unregister(a.id());
        assert_eq!(hub.user_connection_count("u1"), 1);
        hub.unregister(b.id());
        assert_eq!(hub.stats().authenticated_users, 0);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_abort_broadcast() {
        let hub = Hub::new(HubConfig {
            send_queue_capacity: 1,
            ..HubConfig::default()
        });
        let (a, _qa) = connect(&hub);
        let (b, _qb) = connect(&hub);
        hub.subscribe_channel(a.id(), "doc").unwrap();
        hub.subscribe_channel(b.id(), "doc").unwrap();

        // fill a's queue only
        a.send(Message::new(Payload::Ping)).unwrap();

        assert_eq!(hub.broadcast_to_channel("doc", &event()), 1);
        assert_eq!(a.queue_len(), 1);
        assert_eq!(b.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_reaper_removes_stale_connections() {
        let hub = Hub::new(HubConfig {
            stale_after: Duration::from_millis(30),
            ..HubConfig::default()
        });
        let (stale, _qs) = connect(&hub);
        hub.set_user_id(stale.id(), Identity::new("u1", "s1")).unwrap();
        hub.subscribe_channel(stale.id(), "doc").unwrap();

        time::sleep(Duration::from_millis(60)).await;
        let (fresh, _qf) = connect(&hub);

        assert_eq!(hub.reap(), 1);
        assert!(stale.is_closed());
        assert!(!fresh.is_closed());

        let stats = hub.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.authenticated_users, 0);
        assert_eq!(stats.total_channels, 0);
    }

    #[tokio::test]
    async fn test_reaper_collects_closed_connections() {
        let hub = new_hub();
        let (a, _qa) = connect(&hub);
        a.close();

        assert_eq!(hub.reap(), 1);
        assert!(hub.get(a.id()).is_none());
    }

    #[tokio::test]
    async fn test_spawned_reaper_sweeps_and_stops() {
        let hub = Arc::new(Hub::new(HubConfig {
            stale_after: Duration::from_millis(20),
            reaper_interval: Duration::from_millis(25),
            ..HubConfig::default()
        }));
        let (conn, _q) = connect(&hub);
        let reaper = hub.spawn_reaper();

        time::sleep(Duration::from_millis(150)).await;
        assert!(conn.is_closed());
        assert_eq!(hub.stats().total_connections, 0);

        hub.shutdown();
        let stopped = time::timeout(Duration::from_secs(1), reaper).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let hub = new_hub();
        let (a, _qa) = connect(&hub);
        let (b, _qb) = connect(&hub);
        hub.set_user_id(a.id(), Identity::new("u1", "s1")).unwrap();
        hub.subscribe_channel(b.id(), "doc").unwrap();

        assert_eq!(hub.shutdown(), 2);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(
            hub.stats(),
            HubStats {
                total_connections: 0,
                authenticated_users: 0,
                total_channels: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_register_after_shutdown_is_refused() {
        let hub = new_hub();
        hub.shutdown();

        let (conn, _queue) = Connection::new(ConnectionId::new(), 4);
        assert!(!hub.register(Arc::clone(&conn)));
        assert!(conn.is_closed());
        assert!(hub.get(conn.id()).is_none());
        assert_eq!(hub.stats().total_connections, 0);
    }

    #[tokio::test]
    async fn test_concurrent_register_unregister() {
        let hub = Arc::new(new_hub());
        let mut handles = vec![];

        for i in 0..100 {
            let hub = Arc::clone(&hub);
            handles.push(tokio::spawn(async move {
                let (conn, _queue) = Connection::new(ConnectionId::new(), 8);
                let id = conn.id();
                hub.register(conn);
                hub.set_user_id(id, Identity::new(format!("u{}", i % 10), "s"))
                    .unwrap();
                hub.subscribe_channel(id, &format!("doc-{}", i % 7)).unwrap();

                tokio::time::sleep(Duration::from_micros(100)).await;

                hub.unregister(id);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            hub.stats(),
            HubStats {
                total_connections: 0,
                authenticated_users: 0,
                total_channels: 0,
            }
        );
    }
}
