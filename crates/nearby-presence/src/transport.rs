use futures_util::future::BoxFuture;
use nearby_core::{PresenceEvent, PresenceRecord};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// What arrives on a subscribed channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Presence(PresenceEvent),
    /// The transport dropped the subscription; no more events follow.
    Closed { reason: String },
}

/// What a subscriber sends back up the channel.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Publish or refresh our record. Always the full record.
    Track(PresenceRecord),
    /// Withdraw our record but keep the subscription.
    Untrack,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Channel {
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

impl Channel {
    /// Queue a message for the hub. Never blocks; returns false when the
    /// far side is already gone.
    pub fn send(&self, msg: Outbound) -> bool {
        self.outbound.send(msg).is_ok()
    }
}

/// A real-time membership channel provider.
///
/// Delivery is at-least-once with no ordering across publishers; full
/// syncs are authoritative.
pub trait Transport: Send + Sync + 'static {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<Channel, TransportError>>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<Channel, TransportError>> {
        (**self).subscribe(topic, client_id)
    }
}
