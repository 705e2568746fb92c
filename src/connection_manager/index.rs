//! Topic → subscriber index used for fan-out.

use std::collections::{HashMap, HashSet};

use crate::topic::Topic;

use super::types::ConnectionId;

/// Maps each topic to the connections subscribed to it.
///
/// Not synchronized on its own: the registry owns it behind the same lock as
/// the connection map so the two can never disagree. Topics with no
/// subscribers are pruned.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    topics: HashMap<Topic, HashSet<ConnectionId>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the subscription was newly added
    pub fn subscribe(&mut self, id: ConnectionId, topic: Topic) -> bool {
        self.topics.entry(topic).or_default().insert(id)
    }

    /// Returns true if a subscription was removed
    pub fn unsubscribe(&mut self, id: ConnectionId, topic: Topic) -> bool {
        let Some(subscribers) = self.topics.get_mut(&topic) else {
            return false;
        };
        let removed = subscribers.remove(&id);
        if subscribers.is_empty() {
            self.topics.remove(&topic);
        }
        removed
    }

    /// Drop `id` from each of the given topics
    pub fn remove_connection<I>(&mut self, id: ConnectionId, topics: I)
    where
        I: IntoIterator<Item = Topic>,
    {
        for topic in topics {
            self.unsubscribe(id, topic);
        }
    }

    /// Owned copy of a topic's subscribers
    pub fn subscribers_of(&self, topic: Topic) -> HashSet<ConnectionId> {
        self.topics.get(&topic).cloned().unwrap_or_default()
    }

    /// Subscribers of `topic` plus subscribers of the wildcard, de-duplicated
    pub fn fan_out(&self, topic: Topic) -> HashSet<ConnectionId> {
        let mut ids = self.subscribers_of(topic);
        if !topic.is_wildcard() {
            if let Some(wildcard) = self.topics.get(&Topic::All) {
                ids.extend(wildcard.iter().copied());
            }
        }
        ids
    }

    pub fn is_subscribed(&self, id: ConnectionId, topic: Topic) -> bool {
        self.topics
            .get(&topic)
            .is_some_and(|subscribers| subscribers.contains(&id))
    }

    /// Number of topics with at least one subscriber
    pub fn active_topics(&self) -> usize {
        self.topics.len()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics.get(&topic).map_or(0, HashSet::len)
    }

    pub fn topic_counts(&self) -> HashMap<Topic, usize> {
        self.topics
            .iter()
            .map(|(topic, subscribers)| (*topic, subscribers.len()))
            .collect()
    }

    /// Total subscription entries across all topics
    pub fn total_subscriptions(&self) -> usize {
        self.topics.values().map(HashSet::len).sum()
    }
}
