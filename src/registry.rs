//! Channel-based publish/subscribe across live connections.
//!
//! The [`Registry`] maps channel names to the connections subscribed to
//! them. Subscribers are held weakly: a connection that has been dropped can
//! never be delivered to, and its entries are reaped the next time they are
//! touched. A publish failure to one subscriber is logged and swallowed; the
//! other subscribers still get the message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::connection::{ConnectionId, WebSocket};
use crate::message::Message;

type ChannelMap = HashMap<String, HashMap<ConnectionId, Weak<WebSocket>>>;

/// Thread-safe subscription registry.
///
/// All methods take `&self`; the registry is meant to live in an `Arc`
/// shared by every connection task. The interior lock is never held across
/// an await point: `publish` snapshots the subscriber sets under the lock
/// and performs the sends outside it.
#[derive(Default)]
pub struct Registry {
    channels: Mutex<ChannelMap>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to one or more channels.
    ///
    /// Returns a scoped [`Subscription`] handle; the subscription lasts
    /// until the handle is released or dropped. Subscribing to a channel
    /// the connection is already in is a no-op for that channel.
    pub fn subscribe<I, S>(self: &Arc<Self>, ws: &Arc<WebSocket>, channels: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = ws.id();
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();

        {
            let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            for channel in &channels {
                map.entry(channel.clone())
                    .or_default()
                    .insert(id, Arc::downgrade(ws));
            }
        }
        debug!(id = %id, channels = ?channels, "subscribed");

        Subscription {
            registry: Arc::clone(self),
            id,
            channels,
            released: false,
        }
    }

    /// Remove a connection from the named channels.
    ///
    /// Channels the connection is not in are skipped; emptied channels are
    /// pruned from the registry.
    pub fn unsubscribe<I, S>(&self, id: ConnectionId, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        for channel in channels {
            let channel = channel.as_ref();
            if let Some(subscribers) = map.get_mut(channel) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    map.remove(channel);
                }
            }
        }
    }

    /// Remove a connection from every channel.
    ///
    /// Called during connection teardown so a closed connection is never
    /// left in a subscription set.
    pub fn remove_connection(&self, id: ConnectionId) {
        let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
    }

    /// Deliver a message to every connection subscribed to the named
    /// channels.
    ///
    /// Sends run concurrently, one task per subscriber, so one slow
    /// subscriber does not delay the others. A failed send is logged and
    /// the subscriber is dropped from the channel; the failure never
    /// reaches the caller. A connection subscribed to several of the named
    /// channels receives the message once per channel.
    ///
    /// Returns the number of successful deliveries.
    pub async fn publish<I, S>(&self, channels: I, message: Message) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        // Snapshot the live subscribers under the lock; collect already-dead
        // entries for reaping.
        let mut targets: Vec<(String, ConnectionId, Arc<WebSocket>)> = Vec::new();
        let mut dead: Vec<(String, ConnectionId)> = Vec::new();
        {
            let map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            for channel in channels {
                let channel = channel.as_ref();
                if let Some(subscribers) = map.get(channel) {
                    for (&id, weak) in subscribers {
                        match weak.upgrade() {
                            Some(ws) => targets.push((channel.to_string(), id, ws)),
                            None => dead.push((channel.to_string(), id)),
                        }
                    }
                }
            }
        }

        let mut delivered = 0;
        let mut set = JoinSet::new();
        for (channel, id, ws) in targets {
            let message = message.clone();
            set.spawn(async move {
                let result = ws.send(message).await;
                (channel, id, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => delivered += 1,
                Ok((channel, id, Err(e))) => {
                    warn!(id = %id, channel = %channel, error = %e, "publish delivery failed");
                    dead.push((channel, id));
                }
                Err(e) => {
                    warn!(error = %e, "publish delivery task failed");
                }
            }
        }

        if !dead.is_empty() {
            let mut map = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            for (channel, id) in dead {
                if let Some(subscribers) = map.get_mut(&channel) {
                    subscribers.remove(&id);
                    if subscribers.is_empty() {
                        map.remove(&channel);
                    }
                }
            }
        }

        delivered
    }

    /// Number of channels with at least one subscriber.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Number of subscribers currently recorded for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .map_or(0, HashMap::len)
    }
}

/// Scoped handle to a connection's membership in a set of channels.
///
/// The subscription ends when this handle is dropped or explicitly
/// [`release`](Self::release)d. Handles are independent: one connection can
/// hold several, and releasing one leaves the others in place.
#[must_use = "dropping the handle ends the subscription"]
pub struct Subscription {
    registry: Arc<Registry>,
    id: ConnectionId,
    channels: Vec<String>,
    released: bool,
}

impl Subscription {
    /// The channels this handle covers.
    #[must_use]
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// End the subscription now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.unsubscribe(self.id, &self.channels);
            debug!(id = %self.id, channels = ?self.channels, "unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_inner();
    }
}
