//! In-process presence hub.
//!
//! Keeps one membership table per topic. Every change fans out as a
//! join/leave followed by a full sync, so subscribers converge even if they
//! miss the incremental message. Also backs the HTTP hub in the CLI.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use nearby_core::{PresenceEvent, PresenceRecord};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{Channel, ChannelEvent, Outbound, Transport};

#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<Mutex<HubState>>,
}

struct HubState {
    topics: HashMap<String, Topic>,
    available: bool,
    next_conn_id: u64,
}

#[derive(Default)]
struct Topic {
    members: BTreeMap<String, Member>,
}

struct Member {
    conn_id: u64,
    events: mpsc::UnboundedSender<ChannelEvent>,
    record: Option<PresenceRecord>,
}

impl Topic {
    fn records(&self) -> Vec<PresenceRecord> {
        self.members.values().filter_map(|m| m.record.clone()).collect()
    }

    fn broadcast(&self, event: &PresenceEvent) {
        for member in self.members.values() {
            // a closed receiver means the subscriber is mid-teardown
            let _ = member.events.send(ChannelEvent::Presence(event.clone()));
        }
    }

    /// Incremental event, then the authoritative snapshot.
    fn announce(&self, event: PresenceEvent) {
        self.broadcast(&event);
        self.broadcast(&PresenceEvent::Sync {
            members: self.records(),
        });
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubState {
                topics: HashMap::new(),
                available: true,
                next_conn_id: 1,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse (or accept again) new subscriptions.
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Join `client_id` to `topic`. The new member immediately receives a
    /// sync of the current roster. A second attach under the same client id
    /// replaces the first connection.
    pub fn attach(
        &self,
        topic: &str,
        client_id: &str,
    ) -> Result<(u64, mpsc::UnboundedReceiver<ChannelEvent>), TransportError> {
        let mut state = self.state();
        if !state.available {
            return Err(TransportError::Connect("hub unavailable".into()));
        }
        let conn_id = state.next_conn_id;
        state.next_conn_id += 1;

        let topic_state = state.topics.entry(topic.to_string()).or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = topic_state.members.insert(
            client_id.to_string(),
            Member {
                conn_id,
                events: tx.clone(),
                record: None,
            },
        );
        if let Some(old) = replaced {
            let _ = old.events.send(ChannelEvent::Closed {
                reason: "replaced by a newer connection".into(),
            });
            if let Some(record) = old.record {
                topic_state.announce(PresenceEvent::Leave {
                    user_ids: vec![record.user_id],
                });
            }
        }
        let _ = tx.send(ChannelEvent::Presence(PresenceEvent::Sync {
            members: topic_state.records(),
        }));
        tracing::debug!(topic, client_id, conn_id, "member attached");
        Ok((conn_id, rx))
    }

    /// Publish a member's record. Returns false if the client is not attached.
    pub fn track(&self, topic: &str, client_id: &str, record: PresenceRecord) -> bool {
        let mut state = self.state();
        let Some(topic_state) = state.topics.get_mut(topic) else {
            return false;
        };
        let Some(member) = topic_state.members.get_mut(client_id) else {
            return false;
        };
        member.record = Some(record.clone());
        topic_state.announce(PresenceEvent::Join {
            members: vec![record],
        });
        true
    }

    /// Withdraw a member's record but keep it subscribed.
    pub fn untrack(&self, topic: &str, client_id: &str) -> bool {
        let mut state = self.state();
        let Some(topic_state) = state.topics.get_mut(topic) else {
            return false;
        };
        let Some(member) = topic_state.members.get_mut(client_id) else {
            return false;
        };
        let Some(record) = member.record.take() else {
            return true;
        };
        topic_state.announce(PresenceEvent::Leave {
            user_ids: vec![record.user_id],
        });
        true
    }

    /// Remove a connection. Stale `conn_id`s (already replaced or severed)
    /// are ignored.
    pub fn detach(&self, topic: &str, client_id: &str, conn_id: u64) {
        let mut state = self.state();
        let Some(topic_state) = state.topics.get_mut(topic) else {
            return;
        };
        if topic_state.members.get(client_id).map(|m| m.conn_id) != Some(conn_id) {
            return;
        }
        if let Some(member) = topic_state.members.remove(client_id)
            && let Some(record) = member.record
        {
            topic_state.announce(PresenceEvent::Leave {
                user_ids: vec![record.user_id],
            });
        }
        if topic_state.members.is_empty() {
            state.topics.remove(topic);
        }
        tracing::debug!(topic, client_id, conn_id, "member detached");
    }

    /// Simulate a transport failure for one client: it gets `Closed` and is
    /// dropped from the topic.
    pub fn sever(&self, topic: &str, client_id: &str) -> bool {
        let conn_id = {
            let state = self.state();
            let Some(member) = state.topics.get(topic).and_then(|t| t.members.get(client_id)) else {
                return false;
            };
            let _ = member.events.send(ChannelEvent::Closed {
                reason: "connection severed".into(),
            });
            member.conn_id
        };
        self.detach(topic, client_id, conn_id);
        true
    }

    pub fn roster(&self, topic: &str) -> Vec<PresenceRecord> {
        self.state()
            .topics
            .get(topic)
            .map(Topic::records)
            .unwrap_or_default()
    }

    pub fn member_count(&self, topic: &str) -> usize {
        self.state()
            .topics
            .get(topic)
            .map_or(0, |t| t.members.len())
    }
}

impl Transport for LocalHub {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<Channel, TransportError>> {
        async move {
            let (conn_id, events) = self.attach(topic, client_id)?;
            let (outbound, mut outbound_rx) = mpsc::unbounded_channel();

            let hub = self.clone();
            let topic = topic.to_string();
            let client_id = client_id.to_string();
            tokio::spawn(async move {
                while let Some(msg) = outbound_rx.recv().await {
                    if hub.current_conn(&topic, &client_id) != Some(conn_id) {
                        break;
                    }
                    match msg {
                        Outbound::Track(record) => {
                            hub.track(&topic, &client_id, record);
                        }
                        Outbound::Untrack => {
                            hub.untrack(&topic, &client_id);
                        }
                    }
                }
                hub.detach(&topic, &client_id, conn_id);
            });

            Ok(Channel { events, outbound })
        }
        .boxed()
    }
}

impl LocalHub {
    fn current_conn(&self, topic: &str, client_id: &str) -> Option<u64> {
        self.state()
            .topics
            .get(topic)
            .and_then(|t| t.members.get(client_id))
            .map(|m| m.conn_id)
    }
}
