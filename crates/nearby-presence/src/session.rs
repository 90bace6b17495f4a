//! One client's membership in a presence topic.
//!
//! A spawned actor owns the channel, the local record and the roster mirror.
//! Callers talk to it through [`SessionHandle`] and observe it through a
//! `watch` channel of [`SessionSnapshot`]s. Transport drops keep the last
//! roster and retry with doubling backoff.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use nearby_core::{
    EngineConfig, GhostPolicy, PresenceRecord, PresenceUpdate, Roster, next_stamp, now_unix_millis,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{EngineError, TransportError};
use crate::transport::{Channel, ChannelEvent, Outbound, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// What observers see after every change.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    /// Everyone on the topic as last heard. Survives disconnects.
    pub roster: Arc<Roster>,
    /// Our own record, including changes not yet published.
    pub own: PresenceRecord,
    pub ghost: bool,
    /// Why the channel last failed. Cleared on subscribe.
    pub last_error: Option<TransportError>,
    /// Bumped on every emitted change.
    pub revision: u64,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Subscribed
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub topic: String,
    pub user_id: String,
    /// Identifies this connection to the hub. Fresh per session.
    pub client_id: String,
    pub ghost_policy: GhostPolicy,
    /// Start in ghost mode.
    pub ghost: bool,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl SessionConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self::from_engine(user_id, &EngineConfig::default(), false)
    }

    pub fn from_engine(user_id: impl Into<String>, engine: &EngineConfig, ghost: bool) -> Self {
        Self {
            topic: engine.topic.clone(),
            user_id: user_id.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
            ghost_policy: engine.ghost_policy,
            ghost,
            reconnect_initial: engine.reconnect_initial(),
            reconnect_max: engine.reconnect_max(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_ghost_policy(mut self, policy: GhostPolicy) -> Self {
        self.ghost_policy = policy;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial = initial;
        self.reconnect_max = max.max(initial);
        self
    }
}

/// Doubling retry delay, capped, reset on a successful subscribe.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum Command {
    Update(PresenceUpdate),
    SetGhost(bool),
    Leave(oneshot::Sender<()>),
}

/// Cheap, cloneable access to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Merge a change into the local record and publish it if we can.
    /// While disconnected the change is kept and goes out on resubscribe.
    pub fn update_presence(&self, update: PresenceUpdate) -> Result<(), EngineError> {
        self.commands
            .send(Command::Update(update))
            .map_err(|_| EngineError::Stopped)
    }

    pub fn set_ghost(&self, ghost: bool) -> Result<(), EngineError> {
        self.commands
            .send(Command::SetGhost(ghost))
            .map_err(|_| EngineError::Stopped)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn roster(&self) -> Arc<Roster> {
        Arc::clone(&self.snapshots.borrow().roster)
    }

    pub fn is_connected(&self) -> bool {
        self.snapshots.borrow().is_connected()
    }
}

/// Owns the actor task. Dropping it aborts the session without a goodbye;
/// call [`PresenceSession::leave`] to withdraw cleanly.
pub struct PresenceSession {
    handle: SessionHandle,
    task: Option<JoinHandle<()>>,
}

impl PresenceSession {
    /// Spawn the session and begin subscribing. Must be called inside a
    /// tokio runtime.
    pub fn start<T: Transport>(transport: T, config: SessionConfig) -> Self {
        let own = PresenceRecord::new(config.user_id.clone());
        let (snapshot_tx, snapshots) = watch::channel(SessionSnapshot {
            state: ConnectionState::Disconnected,
            roster: Arc::new(Roster::new()),
            own: own.clone(),
            ghost: config.ghost,
            last_error: None,
            revision: 0,
        });
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            transport: Arc::new(transport),
            connecting: None,
            backoff: Backoff::new(config.reconnect_initial, config.reconnect_max),
            ghost: config.ghost,
            config,
            channel: None,
            state: ConnectionState::Disconnected,
            roster: Arc::new(Roster::new()),
            own,
            published: false,
            retry_at: None,
            last_error: None,
            snapshot_tx,
            revision: 0,
        };
        let task = tokio::spawn(actor.run(commands_rx));

        Self {
            handle: SessionHandle { commands, snapshots },
            task: Some(task),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Withdraw our record, drop the channel and wait for the actor to exit.
    pub async fn leave(mut self) {
        let (ack, done) = oneshot::channel();
        if self.handle.commands.send(Command::Leave(ack)).is_ok() {
            let _ = done.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Deref for PresenceSession {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

type Subscribing = BoxFuture<'static, Result<Channel, TransportError>>;

struct Actor<T> {
    transport: Arc<T>,
    /// In-flight subscribe. Polled from the main loop so commands are never
    /// stuck behind a slow hub.
    connecting: Option<Subscribing>,
    config: SessionConfig,
    channel: Option<Channel>,
    state: ConnectionState,
    roster: Arc<Roster>,
    own: PresenceRecord,
    /// Whether the hub currently holds a record from us on this channel.
    published: bool,
    ghost: bool,
    backoff: Backoff,
    retry_at: Option<Instant>,
    last_error: Option<TransportError>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    revision: u64,
}

impl<T: Transport> Actor<T> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if self.wants_channel() {
            self.connect();
        }
        self.emit();

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Leave(ack)) => {
                        self.withdraw();
                        let _ = ack.send(());
                        break;
                    }
                    Some(Command::Update(update)) => self.on_update(update),
                    Some(Command::SetGhost(ghost)) => self.on_ghost(ghost),
                    None => {
                        self.withdraw();
                        break;
                    }
                },
                result = next_subscribe(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_subscribed(result);
                }
                event = next_event(&mut self.channel) => self.on_event(event),
                _ = sleep_until(retry_at) => {
                    self.retry_at = None;
                    if self.wants_channel() && self.channel.is_none() {
                        self.connect();
                        self.emit();
                    }
                }
            }
        }
        tracing::debug!(
            topic = %self.config.topic,
            user = %self.config.user_id,
            "session stopped"
        );
    }

    fn wants_channel(&self) -> bool {
        !(self.ghost && self.config.ghost_policy == GhostPolicy::Disconnect)
    }

    /// Start subscribing unless a subscribe is already underway.
    fn connect(&mut self) {
        if self.connecting.is_some() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let topic = self.config.topic.clone();
        let client_id = self.config.client_id.clone();
        let subscribing = async move { transport.subscribe(&topic, &client_id).await };
        self.connecting = Some(subscribing.boxed());
        self.state = ConnectionState::Connecting;
    }

    fn on_subscribed(&mut self, result: Result<Channel, TransportError>) {
        match result {
            Ok(channel) => {
                tracing::info!(
                    topic = %self.config.topic,
                    user = %self.config.user_id,
                    "subscribed"
                );
                self.channel = Some(channel);
                self.state = ConnectionState::Subscribed;
                self.published = false;
                self.last_error = None;
                self.backoff.reset();
                self.retry_at = None;
                self.publish();
            }
            Err(e) => {
                tracing::warn!(topic = %self.config.topic, "subscribe failed: {e}");
                self.state = ConnectionState::Disconnected;
                self.last_error = Some(e);
                self.schedule_retry();
            }
        }
        self.emit();
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.next_delay();
        tracing::debug!(?delay, "scheduling reconnect");
        self.retry_at = Some(Instant::now() + delay);
    }

    fn on_event(&mut self, event: Option<ChannelEvent>) {
        match event {
            Some(ChannelEvent::Presence(event)) => {
                if Arc::make_mut(&mut self.roster).apply(event) {
                    self.emit();
                }
            }
            Some(ChannelEvent::Closed { reason }) => self.on_closed(&reason),
            None => self.on_closed("channel ended"),
        }
    }

    /// The last roster stays visible; only the connection state changes.
    fn on_closed(&mut self, reason: &str) {
        tracing::warn!(topic = %self.config.topic, "presence channel closed: {reason}");
        self.channel = None;
        self.published = false;
        self.state = ConnectionState::Disconnected;
        self.last_error = Some(TransportError::Disconnected(reason.to_string()));
        if self.wants_channel() {
            self.schedule_retry();
        }
        self.emit();
    }

    fn on_update(&mut self, update: PresenceUpdate) {
        self.own.merge(update);
        if self.own.has_position() {
            self.publish();
        } else {
            self.untrack();
        }
        self.emit();
    }

    fn on_ghost(&mut self, ghost: bool) {
        if ghost == self.ghost {
            return;
        }
        self.ghost = ghost;
        tracing::info!(ghost, user = %self.config.user_id, "ghost mode changed");

        if ghost {
            match self.config.ghost_policy {
                GhostPolicy::Untrack => self.untrack(),
                GhostPolicy::Disconnect => {
                    self.withdraw();
                    self.retry_at = None;
                }
            }
            self.emit();
        } else if self.channel.is_some() {
            self.publish();
            self.emit();
        } else {
            self.retry_at = None;
            self.backoff.reset();
            self.connect();
            self.emit();
        }
    }

    /// Send the full local record with a fresh stamp. Republishing unchanged
    /// content only moves the timestamp forward.
    fn publish(&mut self) {
        if self.ghost || !self.own.has_position() {
            return;
        }
        let Some(channel) = &self.channel else {
            tracing::debug!("not subscribed; publish deferred");
            return;
        };
        self.own.published_at = next_stamp(self.own.published_at, now_unix_millis());
        if channel.send(Outbound::Track(self.own.clone())) {
            self.published = true;
        }
    }

    fn untrack(&mut self) {
        if !self.published {
            return;
        }
        if let Some(channel) = &self.channel {
            channel.send(Outbound::Untrack);
        }
        self.published = false;
    }

    /// Untrack and drop the channel. The hub sees the record go first, then
    /// the member.
    fn withdraw(&mut self) {
        self.untrack();
        if self.connecting.take().is_some() {
            tracing::debug!(topic = %self.config.topic, "abandoned pending subscribe");
        }
        if self.channel.take().is_some() {
            tracing::debug!(topic = %self.config.topic, "left presence channel");
        }
        self.state = ConnectionState::Disconnected;
        self.emit();
    }

    fn emit(&mut self) {
        self.revision += 1;
        self.snapshot_tx.send_replace(SessionSnapshot {
            state: self.state,
            roster: Arc::clone(&self.roster),
            own: self.own.clone(),
            ghost: self.ghost,
            last_error: self.last_error.clone(),
            revision: self.revision,
        });
    }
}

async fn next_subscribe(connecting: &mut Option<Subscribing>) -> Result<Channel, TransportError> {
    match connecting {
        Some(subscribing) => subscribing.await,
        None => std::future::pending().await,
    }
}

async fn next_event(channel: &mut Option<Channel>) -> Option<ChannelEvent> {
    match channel {
        Some(channel) => channel.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
