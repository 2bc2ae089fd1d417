//! Topic-based fan-out to live stream connections.
//!
//! [`EventHub`] is a cloneable handle to a single actor task that owns the
//! registry of connections and their topics. Each connection gets its own
//! bounded [`Delivery`] queue, drained by a connection-owned task, so a slow
//! client only ever loses its own oldest events.
//!
//! ```text
//! producer ──broadcast──▶ hub actor ──push──▶ queue(conn 1) ──▶ ws task 1
//!                                    └─push──▶ queue(conn 2) ──▶ ws task 2
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use analytix_core::{AnalyticsEvent, StreamEnvelope};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

mod actor;
mod connection;
mod queue;

use self::actor::{Command, HubActor};
use self::queue::OutboundQueue;
pub use self::connection::serve_connection;
pub use self::queue::Delivery;
use crate::config::StreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of one stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, no topics yet.
    Connecting,
    /// Subscribed and receiving.
    Active,
    /// Draining the queue before the close frame.
    Closing,
    /// Removed from the registry.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("event hub is shutting down")]
    ShuttingDown,

    #[error("event hub has stopped")]
    Closed,

    #[error("a connection may subscribe to at most {max} topics")]
    TooManyTopics { max: usize },

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub max_topics: usize,
    pub command_buffer: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl From<&StreamConfig> for HubConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            max_topics: config.max_topics_per_connection,
            command_buffer: config.command_buffer,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    /// Topics with at least one subscriber
    pub topics: usize,
    /// Sum of every connection's topic count
    pub subscriptions: usize,
}

/// Handle to the hub actor.
#[derive(Clone)]
pub struct EventHub {
    commands: mpsc::Sender<Command>,
    config: Arc<HubConfig>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl EventHub {
    /// Spawns the actor on the current runtime.
    pub fn spawn(config: HubConfig) -> Self {
        let (commands, receiver) = mpsc::channel(config.command_buffer.max(1));
        tokio::spawn(HubActor::new(config.clone(), receiver).run());
        Self {
            commands,
            config: Arc::new(config),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Tracks connection tasks so shutdown can wait for them.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Fires when connections must stop without draining.
    pub fn force_close_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Adds a connection in the `Connecting` state.
    pub async fn register(&self, subject: impl Into<String>) -> Result<Subscription, HubError> {
        if self.tracker.is_closed() {
            return Err(HubError::ShuttingDown);
        }
        let subject = subject.into();
        let (id, queue) = self
            .request(|reply| Command::Register { subject, reply })
            .await??;
        Ok(Subscription {
            id,
            queue,
            hub: self.clone(),
            state: ConnectionState::Connecting,
            topics: Vec::new(),
        })
    }

    /// Queues `event` for every connection subscribed to its topic and
    /// returns how many connections it was queued for.
    pub async fn broadcast(&self, event: &AnalyticsEvent) -> Result<usize, HubError> {
        let envelope = Arc::new(StreamEnvelope::from(event));
        self.request(|reply| Command::Broadcast { envelope, reply })
            .await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stops registration and closes every queue; connection tasks drain and
    /// send their close frames.
    pub async fn shutdown(&self) {
        self.tracker.close();
        if self.commands.send(Command::Shutdown).await.is_err() {
            tracing::debug!("event hub already stopped");
        }
    }

    /// Resolves when every tracked connection task has ended. Only returns
    /// after [`shutdown`](Self::shutdown).
    pub async fn wait_closed(&self) {
        self.tracker.wait().await;
    }

    /// Cancels connection tasks that are still draining.
    pub fn force_close(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }
}

/// One registered connection. Dropping it removes the connection from the
/// registry.
pub struct Subscription {
    id: ConnectionId,
    queue: Arc<OutboundQueue>,
    hub: EventHub,
    state: ConnectionState,
    topics: Vec<String>,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current topic set, sorted.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub(crate) fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Adds topics and returns the full resulting set.
    pub async fn subscribe(&mut self, topics: Vec<String>) -> Result<&[String], HubError> {
        let id = self.id;
        self.topics = self
            .hub
            .request(|reply| Command::Subscribe { id, topics, reply })
            .await??;
        self.state = ConnectionState::Active;
        Ok(&self.topics)
    }

    /// Removes topics and returns what remains.
    pub async fn unsubscribe(&mut self, topics: Vec<String>) -> Result<&[String], HubError> {
        let id = self.id;
        self.topics = self
            .hub
            .request(|reply| Command::Unsubscribe { id, topics, reply })
            .await??;
        Ok(&self.topics)
    }

    /// Next outbound item. Cancel safe.
    pub async fn recv(&mut self) -> Delivery {
        let delivery = self.queue.pop().await;
        if delivery == Delivery::Close {
            self.state = ConnectionState::Closing;
        }
        delivery
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state = ConnectionState::Closed;
        // A full command queue leaves the entry to be reaped on the next
        // broadcast that finds its queue abandoned.
        let _ = self.hub.commands.try_send(Command::Remove { id: self.id });
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("topics", &self.topics)
            .finish()
    }
}
