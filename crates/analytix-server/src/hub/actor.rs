//! The task that owns the connection registry.
//!
//! Every registry mutation arrives as a [`Command`] on one bounded queue and
//! is applied in order, so broadcasts observe a consistent topic map and
//! per-connection delivery order matches broadcast order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use analytix_core::StreamEnvelope;
use tokio::sync::{mpsc, oneshot};

use super::queue::OutboundQueue;
use super::{ConnectionId, HubConfig, HubError, HubStats};
use crate::metrics;

pub(crate) type Registered = (ConnectionId, Arc<OutboundQueue>);

pub(crate) enum Command {
    Register {
        subject: String,
        reply: oneshot::Sender<Result<Registered, HubError>>,
    },
    Subscribe {
        id: ConnectionId,
        topics: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, HubError>>,
    },
    Unsubscribe {
        id: ConnectionId,
        topics: Vec<String>,
        reply: oneshot::Sender<Result<Vec<String>, HubError>>,
    },
    Remove {
        id: ConnectionId,
    },
    Broadcast {
        envelope: Arc<StreamEnvelope>,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    Shutdown,
}

struct Entry {
    subject: String,
    topics: BTreeSet<String>,
    queue: Arc<OutboundQueue>,
}

impl Entry {
    /// The connection task dropped its end of the queue.
    fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.queue) == 1
    }
}

pub(crate) struct HubActor {
    config: HubConfig,
    commands: mpsc::Receiver<Command>,
    connections: HashMap<ConnectionId, Entry>,
    topics: HashMap<String, HashSet<ConnectionId>>,
    next_id: u64,
    accepting: bool,
}

impl HubActor {
    pub(crate) fn new(config: HubConfig, commands: mpsc::Receiver<Command>) -> Self {
        Self {
            config,
            commands,
            connections: HashMap::new(),
            topics: HashMap::new(),
            next_id: 1,
            accepting: true,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!("event hub started");
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        // Every handle is gone.
        self.close_all();
        tracing::debug!("event hub stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { subject, reply } => {
                let result = self.register(subject);
                let registered = result.as_ref().ok().map(|(id, _)| *id);
                if reply.send(result).is_err()
                    && let Some(id) = registered
                {
                    self.remove(id);
                }
            }
            Command::Subscribe { id, topics, reply } => {
                let _ = reply.send(self.subscribe(id, topics));
            }
            Command::Unsubscribe { id, topics, reply } => {
                let _ = reply.send(self.unsubscribe(id, &topics));
            }
            Command::Remove { id } => self.remove(id),
            Command::Broadcast { envelope, reply } => {
                let _ = reply.send(self.broadcast(envelope));
            }
            Command::Stats { reply } => {
                self.sweep_abandoned();
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => {
                self.accepting = false;
                self.close_all();
            }
        }
    }

    fn register(&mut self, subject: String) -> Result<Registered, HubError> {
        if !self.accepting {
            return Err(HubError::ShuttingDown);
        }
        self.sweep_abandoned();

        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        let queue = Arc::new(OutboundQueue::new(self.config.queue_capacity));

        tracing::debug!(connection = %id, subject = %subject, "stream connection registered");
        self.connections.insert(
            id,
            Entry {
                subject,
                topics: BTreeSet::new(),
                queue: Arc::clone(&queue),
            },
        );
        metrics::set_stream_connections(self.connections.len());
        Ok((id, queue))
    }

    fn subscribe(&mut self, id: ConnectionId, topics: Vec<String>) -> Result<Vec<String>, HubError> {
        let entry = self
            .connections
            .get_mut(&id)
            .ok_or(HubError::UnknownConnection(id))?;

        let added: BTreeSet<&String> = topics.iter().filter(|t| !entry.topics.contains(*t)).collect();
        let max = self.config.max_topics;
        if entry.topics.len() + added.len() > max {
            return Err(HubError::TooManyTopics { max });
        }

        for topic in topics {
            if entry.topics.insert(topic.clone()) {
                self.topics.entry(topic).or_default().insert(id);
            }
        }
        tracing::debug!(connection = %id, subject = %entry.subject, topics = ?entry.topics, "subscribed");
        Ok(entry.topics.iter().cloned().collect())
    }

    fn unsubscribe(&mut self, id: ConnectionId, topics: &[String]) -> Result<Vec<String>, HubError> {
        let entry = self
            .connections
            .get_mut(&id)
            .ok_or(HubError::UnknownConnection(id))?;

        for topic in topics {
            if entry.topics.remove(topic) {
                detach(&mut self.topics, topic, id);
            }
        }
        Ok(entry.topics.iter().cloned().collect())
    }

    fn remove(&mut self, id: ConnectionId) {
        let Some(entry) = self.connections.remove(&id) else {
            return;
        };
        for topic in &entry.topics {
            detach(&mut self.topics, topic, id);
        }
        entry.queue.close();
        metrics::set_stream_connections(self.connections.len());
        tracing::debug!(connection = %id, subject = %entry.subject, "stream connection removed");
    }

    /// Enqueues to every subscriber of the envelope's topic. Never waits on a
    /// consumer.
    fn broadcast(&mut self, envelope: Arc<StreamEnvelope>) -> usize {
        let Some(ids) = self.topics.get(&envelope.topic) else {
            metrics::record_stream_broadcast(0);
            return 0;
        };

        let mut delivered = 0;
        let mut abandoned = Vec::new();
        for id in ids {
            let Some(entry) = self.connections.get(id) else {
                continue;
            };
            if entry.is_abandoned() {
                abandoned.push(*id);
                continue;
            }
            match entry.queue.push(Arc::clone(&envelope)) {
                Some(0) => delivered += 1,
                Some(evicted) => {
                    delivered += 1;
                    metrics::record_stream_dropped(evicted);
                    tracing::debug!(connection = %id, evicted, "slow consumer, dropped oldest events");
                }
                None => abandoned.push(*id),
            }
        }

        for id in abandoned {
            self.remove(id);
        }
        metrics::record_stream_broadcast(delivered);
        delivered
    }

    /// Removes entries whose connection task went away without its
    /// `Remove` reaching the command queue.
    fn sweep_abandoned(&mut self) {
        let abandoned: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.is_abandoned())
            .map(|(id, _)| *id)
            .collect();
        for id in abandoned {
            self.remove(id);
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            topics: self.topics.len(),
            subscriptions: self.connections.values().map(|e| e.topics.len()).sum(),
        }
    }

    fn close_all(&mut self) {
        let count = self.connections.len();
        for (_, entry) in self.connections.drain() {
            entry.queue.close();
        }
        self.topics.clear();
        metrics::set_stream_connections(0);
        if count > 0 {
            tracing::info!(connections = count, "closing stream connections");
        }
    }
}

fn detach(topics: &mut HashMap<String, HashSet<ConnectionId>>, topic: &str, id: ConnectionId) {
    if let Some(ids) = topics.get_mut(topic) {
        ids.remove(&id);
        if ids.is_empty() {
            topics.remove(topic);
        }
    }
}
