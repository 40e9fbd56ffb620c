//! Fan-out hub for progress and metadata events.
//!
//! One run loop serializes registration, unregistration and broadcast. The
//! hub is lossy on purpose: a subscriber whose delivery fails is closed and
//! dropped, never retried. The broadcast channel is deliberately tiny so a
//! slow hub applies backpressure to producers instead of buffering stale
//! progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::domain::Event;

/// Delivery capability the hub requires from a subscriber. Implementations
/// wrap WebSocket connections, test collectors, and the like.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn deliver(&self, event: &Event) -> Result<()>;
    /// Called when the hub drops the subscriber after a failed delivery or
    /// an explicit unregister. Default is a no-op.
    async fn close(&self) {}
}

pub type SubscriberId = u64;

enum Command {
    Register(SubscriberId, Arc<dyn Subscriber>),
    Unregister(SubscriberId),
    Broadcast(Event),
}

/// Multiplexer between job workers and connected subscribers.
pub struct EventHub {
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        // Capacity 1: broadcasts rendezvous with the run loop rather than
        // queueing behind a slow consumer set.
        let (commands_tx, commands_rx) = mpsc::channel(1);
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Consumes commands until every sender is gone. Spawn exactly once.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self
            .commands_rx
            .lock()
            .take()
            .expect("EventHub::run called twice");

        while let Some(command) = rx.recv().await {
            match command {
                Command::Register(id, subscriber) => {
                    self.subscribers.write().insert(id, subscriber);
                    tracing::info!(subscriber = id, "subscriber connected");
                }
                Command::Unregister(id) => {
                    let removed = self.subscribers.write().remove(&id);
                    if let Some(subscriber) = removed {
                        subscriber.close().await;
                        tracing::info!(subscriber = id, "subscriber disconnected");
                    }
                }
                Command::Broadcast(event) => {
                    let targets: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self
                        .subscribers
                        .read()
                        .iter()
                        .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
                        .collect();

                    for (id, subscriber) in targets {
                        if let Err(err) = subscriber.deliver(&event).await {
                            tracing::warn!(subscriber = id, error = %err, "delivery failed, dropping subscriber");
                            self.subscribers.write().remove(&id);
                            subscriber.close().await;
                        }
                    }
                }
            }
        }
    }

    /// Adds a subscriber and returns the id to unregister it with later.
    pub async fn register(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .commands_tx
            .send(Command::Register(id, subscriber))
            .await;
        id
    }

    pub async fn unregister(&self, id: SubscriberId) {
        let _ = self.commands_tx.send(Command::Unregister(id)).await;
    }

    /// Hands the event to the run loop, which fans it out to every
    /// subscriber. Blocks while the loop is busy with a previous broadcast.
    pub async fn broadcast(&self, event: Event) {
        let _ = self.commands_tx.send(Command::Broadcast(event)).await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
