//! Subscription bookkeeping
//!
//! Two sides of the same topic: [`LocalSubscriptions`] holds the callbacks
//! this endpoint registered for publishes arriving on a connection, and
//! [`SubscriberSet`] records which remote connections asked, through the
//! reserved subscribe call, to receive this endpoint's publishes.

use nmmes_rpc_proto::Args;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;
use uuid::Uuid;

/// Callback invoked with the `data` of every publish on a topic
pub type SubscriptionCallback = Arc<dyn Fn(Args) + Send + Sync>;

/// Identity of one managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random id
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
        write!(f, "{}", self.0)
    }
}

/// Topic callbacks registered on one connection
#[derive(Clone, Default)]
pub struct LocalSubscriptions {
    callbacks: Arc<RwLock<HashMap<String, SubscriptionCallback>>>,
}

impl LocalSubscriptions {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the callback for a topic; returns the one it replaced
    pub fn insert(
        &self,
        namespace: impl Into<String>,
        callback: SubscriptionCallback,
    ) -> Option<SubscriptionCallback> {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.into(), callback)
    }

    /// Drop the callback for a topic
    pub fn remove(&self, namespace: &str) -> bool {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace)
            .is_some()
    }

    /// Whether a callback is registered
    pub fn contains(&self, namespace: &str) -> bool {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(namespace)
    }

    /// Subscribed topics
    pub fn namespaces(&self) -> Vec<String> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Invoke the topic's callback; returns `false` when nobody listens
    pub fn deliver(&self, namespace: &str, data: Args) -> bool {
        let callback = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned();

        match callback {
            Some(callback) => {
                callback(data);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for LocalSubscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSubscriptions")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

/// Remote connections subscribed to each topic
#[derive(Debug, Clone, Default)]
pub struct SubscriberSet {
    topics: Arc<RwLock<HashMap<String, HashSet<ConnectionId>>>>,
}

impl SubscriberSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a topic; returns `false` if it was already there
    pub fn add(&self, namespace: &str, connection: ConnectionId) -> bool {
        trace!("{} subscribed to {}", connection, namespace);
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace.to_string())
            .or_default()
            .insert(connection)
    }

    /// Remove a connection from a topic. Removing an absent subscriber is fine.
    pub fn remove(&self, namespace: &str, connection: ConnectionId) -> bool {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = topics.get_mut(namespace) else {
            return false;
        };
        let removed = subscribers.remove(&connection);
        if subscribers.is_empty() {
            topics.remove(namespace);
        }
        removed
    }

    /// Remove a connection from every topic
    pub fn remove_connection(&self, connection: ConnectionId) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics.retain(|_, subscribers| {
            subscribers.remove(&connection);
            !subscribers.is_empty()
        });
    }

    /// Current subscribers of a topic
    pub fn subscribers(&self, namespace: &str) -> Vec<ConnectionId> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a connection is subscribed to a topic
    pub fn contains(&self, namespace: &str, connection: ConnectionId) -> bool {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .is_some_and(|subscribers| subscribers.contains(&connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_local_delivery() {
        let local = LocalSubscriptions::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        local.insert("news.alert", Arc::new(move |data: Args| sink.lock().unwrap().push(data)));

        assert!(local.deliver("news.alert", vec![json!({"headline": "x"})]));
        assert!(!local.deliver("sports", vec![]));
        assert_eq!(*seen.lock().unwrap(), vec![vec![json!({"headline": "x"})]]);

        assert!(local.remove("news.alert"));
        assert!(!local.deliver("news.alert", vec![]));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_insert_returns_replaced_callback() {
        let local = LocalSubscriptions::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let first = hits.clone();
        let second = hits.clone();

        assert!(local
            .insert("news.alert", Arc::new(move |_: Args| first.lock().unwrap().push("first")))
            .is_none());
        let replaced = local
            .insert("news.alert", Arc::new(move |_: Args| second.lock().unwrap().push("second")))
            .unwrap();

        local.deliver("news.alert", vec![]);
        replaced(vec![]);
        assert_eq!(*hits.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn test_subscriber_set() {
        let set = SubscriberSet::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        assert!(set.add("news.alert", a));
        assert!(!set.add("news.alert", a));
        assert!(set.add("news.alert", b));
        assert!(set.add("weather", a));

        let mut subscribers = set.subscribers("news.alert");
        subscribers.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(subscribers, expected);

        set.remove_connection(a);
        assert_eq!(set.subscribers("news.alert"), vec![b]);
        assert!(set.subscribers("weather").is_empty());
    }

    #[test]
    fn test_unsubscribe_without_subscription() {
        let set = SubscriberSet::new();
        let a = ConnectionId::new();

        assert!(!set.remove("nothing", a));
        set.add("topic", a);
        assert!(set.remove("topic", a));
        assert!(!set.remove("topic", a));
        assert!(!set.contains("topic", a));
    }
}
