//! Connection hub: outbound senders and channel membership.
//!
//! Every live socket owns an unbounded sender registered here. Channels are
//! plain names (pairing rooms and personal channels) mapped to the set of
//! connections that joined them.

use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use palaver_shared::protocol::ServerEvent;
use palaver_shared::UserId;

/// Identifier of one socket. A user may hold several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct Outbound {
    user: UserId,
    tx: EventSender,
}

#[derive(Default)]
pub struct Hub {
    connections: DashMap<ConnectionId, Outbound>,
    channels: DashMap<String, HashSet<ConnectionId>>,
    memberships: DashMap<ConnectionId, HashSet<String>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, conn: ConnectionId, user: UserId, tx: EventSender) {
        self.connections.insert(conn, Outbound { user, tx });
    }

    /// Drop the sender and leave every channel. Safe to call twice.
    pub fn detach(&self, conn: ConnectionId) {
        if let Some((_, out)) = self.connections.remove(&conn) {
            trace!(conn = %conn, user = %out.user, "detached");
        }
        let Some((_, joined)) = self.memberships.remove(&conn) else {
            return;
        };
        for channel in joined {
            self.channels.remove_if_mut(&channel, |_, members| {
                members.remove(&conn);
                members.is_empty()
            });
        }
    }

    /// Join a channel. Returns `false` if the connection is not attached.
    pub fn join(&self, conn: ConnectionId, channel: &str) -> bool {
        if !self.connections.contains_key(&conn) {
            return false;
        }
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn);
        self.memberships
            .entry(conn)
            .or_default()
            .insert(channel.to_string());
        true
    }

    #[cfg(test)]
    fn is_member(&self, conn: ConnectionId, channel: &str) -> bool {
        self.channels
            .get(channel)
            .map(|members| members.contains(&conn))
            .unwrap_or(false)
    }

    pub fn emit_to_connection(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        match self.connections.get(&conn) {
            Some(out) => out.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver to every member of `channel` except `except`. Returns the
    /// number of connections reached.
    pub fn emit_to_channel(
        &self,
        channel: &str,
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        // Copy the member list so the channel shard is not held while sending.
        let members: Vec<ConnectionId> = match self.channels.get(channel) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };
        members
            .into_iter()
            .filter(|conn| Some(*conn) != except)
            .filter(|conn| self.emit_to_connection(*conn, event.clone()))
            .count()
    }

    /// Deliver to every attached connection.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let mut reached = 0;
        for out in self.connections.iter() {
            if out.tx.send(event.clone()).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached(hub: &Hub) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.attach(conn, UserId::new(), tx);
        (conn, rx)
    }

    fn ping() -> ServerEvent {
        ServerEvent::error("ping")
    }

    #[test]
    fn test_channel_fanout_with_exclusion() {
        let hub = Hub::new();
        let (c1, mut rx1) = attached(&hub);
        let (c2, mut rx2) = attached(&hub);
        let (_c3, mut rx3) = attached(&hub);
        hub.join(c1, "room");
        hub.join(c2, "room");

        assert_eq!(hub.emit_to_channel("room", &ping(), Some(c1)), 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), ping());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn test_detach_leaves_all_channels() {
        let hub = Hub::new();
        let (c1, _rx1) = attached(&hub);
        hub.join(c1, "a");
        hub.join(c1, "b");

        hub.detach(c1);
        assert!(!hub.is_member(c1, "a"));
        assert!(!hub.is_member(c1, "b"));
        assert_eq!(hub.emit_to_channel("a", &ping(), None), 0);
        assert!(!hub.join(c1, "a"));
        hub.detach(c1);
    }

    #[test]
    fn test_broadcast_skips_closed_receivers() {
        let hub = Hub::new();
        let (_c1, mut rx1) = attached(&hub);
        let (_c2, rx2) = attached(&hub);
        drop(rx2);

        assert_eq!(hub.broadcast(&ping()), 1);
        assert_eq!(rx1.try_recv().unwrap(), ping());
        assert_eq!(hub.connection_count(), 2);
    }
}
