//! Topic-keyed fan-out for session notifications.
//!
//! Every event knows its own topic; subscribers pick the topics they care about and
//! receive a clone of each event published under them. Publishing never blocks and
//! never fails: with nobody listening the event is simply dropped.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

pub trait Topical {
    type Topic: Copy + Eq + Hash + Send + Sync + 'static;

    fn topic(&self) -> Self::Topic;
}

pub trait Bus<E: Topical>: Send + Sync {
    fn subscribe(&self, topic: E::Topic) -> broadcast::Receiver<E>;
    /// Returns how many subscribers received the event.
    fn publish(&self, event: E) -> usize;
}

pub struct LocalBus<E: Topical> {
    topics: RwLock<HashMap<E::Topic, broadcast::Sender<E>>>,
    capacity: usize,
}

impl<E: Topical + Clone> Default for LocalBus<E> {
    fn default() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }
}

impl<E: Topical + Clone> LocalBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender_for(&self, topic: E::Topic) -> broadcast::Sender<E> {
        if let Some(sender) = self.topics.read().get(&topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl<E> Bus<E> for LocalBus<E>
where
    E: Topical + Clone + Send + Sync + 'static,
{
    fn subscribe(&self, topic: E::Topic) -> broadcast::Receiver<E> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, event: E) -> usize {
        let sender = match self.topics.read().get(&event.topic()) {
            Some(sender) => sender.clone(),
            None => return 0,
        };
        sender.send(event).unwrap_or(0)
    }
}
