//! Topic subscriptions for the signaling relay.
//!
//! Peers exchange opaque signaling payloads by publishing to a named topic;
//! every connection subscribed to that topic receives the frame. Membership
//! is per connection, so a replaced connection's subscriptions never leak to
//! its successor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use locus_core::ConnectionId;

use crate::websocket::connection::ClientConnection;

struct Member {
    connection: Arc<ClientConnection>,
    topics: HashSet<String>,
}

/// Topic name to subscribed connections.
#[derive(Default)]
pub struct TopicRegistry {
    topics: HashMap<String, HashSet<ConnectionId>>,
    members: HashMap<ConnectionId, Member>,
}

impl TopicRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `connection` to every topic in `names`. Returns how many
    /// subscriptions were new.
    pub fn subscribe<I>(&mut self, connection: &Arc<ClientConnection>, names: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let member = self
            .members
            .entry(connection.id.clone())
            .or_insert_with(|| Member {
                connection: Arc::clone(connection),
                topics: HashSet::new(),
            });
        let mut added = 0;
        for name in names {
            if member.topics.insert(name.clone()) {
                let _ = self
                    .topics
                    .entry(name)
                    .or_default()
                    .insert(connection.id.clone());
                added += 1;
            }
        }
        if member.topics.is_empty() {
            let _ = self.members.remove(&connection.id);
        }
        added
    }

    /// Drop the given subscriptions of `connection_id`. Unknown topics are
    /// ignored. Returns how many were removed.
    pub fn unsubscribe<'a, I>(&mut self, connection_id: &ConnectionId, names: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let Some(member) = self.members.get_mut(connection_id) else {
            return 0;
        };
        let mut removed = 0;
        for name in names {
            if member.topics.remove(name) {
                detach(&mut self.topics, name, connection_id);
                removed += 1;
            }
        }
        if member.topics.is_empty() {
            let _ = self.members.remove(connection_id);
        }
        removed
    }

    /// Drop every subscription of `connection_id`.
    pub fn remove_connection(&mut self, connection_id: &ConnectionId) -> usize {
        let Some(member) = self.members.remove(connection_id) else {
            return 0;
        };
        for name in &member.topics {
            detach(&mut self.topics, name, connection_id);
        }
        member.topics.len()
    }

    /// Connections subscribed to `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<Arc<ClientConnection>> {
        self.topics
            .get(topic)
            .into_iter()
            .flatten()
            .filter_map(|id| self.members.get(id))
            .map(|m| Arc::clone(&m.connection))
            .collect()
    }

    /// Number of topics with at least one subscriber.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether no topic has subscribers.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.topics.clear();
        self.members.clear();
    }
}

/// Remove one subscriber, dropping the topic once it is empty.
fn detach(topics: &mut HashMap<String, HashSet<ConnectionId>>, name: &str, connection_id: &ConnectionId) {
    if let Some(subscribers) = topics.get_mut(name) {
        let _ = subscribers.remove(connection_id);
        if subscribers.is_empty() {
            let _ = topics.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::test_support::connection;
    use locus_auth::Role;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn subscribe_and_list_subscribers() {
        let mut topics = TopicRegistry::new();
        let (a, _ra) = connection("a", Role::Member, 4);
        let (b, _rb) = connection("b", Role::Member, 4);
        assert_eq!(topics.subscribe(&a, names(&["room"])), 1);
        assert_eq!(topics.subscribe(&b, names(&["room", "other"])), 2);

        let mut users: Vec<String> = topics.subscribers("room").iter().map(|c| c.user_id.to_string()).collect();
        users.sort();
        assert_eq!(users, vec!["a", "b"]);
        assert_eq!(topics.len(), 2);
        assert!(topics.subscribers("missing").is_empty());
    }

    #[test]
    fn duplicate_subscription_counts_once() {
        let mut topics = TopicRegistry::new();
        let (a, _ra) = connection("a", Role::Member, 4);
        assert_eq!(topics.subscribe(&a, names(&["room", "room"])), 1);
        assert_eq!(topics.subscribe(&a, names(&["room"])), 0);
        assert_eq!(topics.subscribers("room").len(), 1);
    }

    #[test]
    fn unsubscribe_removes_empty_topics() {
        let mut topics = TopicRegistry::new();
        let (a, _ra) = connection("a", Role::Member, 4);
        let _ = topics.subscribe(&a, names(&["room", "other"]));
        assert_eq!(topics.unsubscribe(&a.id, ["room", "never"]), 1);
        assert!(topics.subscribers("room").is_empty());
        assert_eq!(topics.subscribers("other").len(), 1);
        assert_eq!(topics.len(), 1);
    }

    #[test]
    fn remove_connection_leaves_other_members() {
        let mut topics = TopicRegistry::new();
        let (a, _ra) = connection("a", Role::Member, 4);
        let (b, _rb) = connection("b", Role::Member, 4);
        let _ = topics.subscribe(&a, names(&["room", "solo"]));
        let _ = topics.subscribe(&b, names(&["room"]));

        assert_eq!(topics.remove_connection(&a.id), 2);
        assert_eq!(topics.remove_connection(&a.id), 0);
        let left = topics.subscribers("room");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].user_id.as_str(), "b");
        assert_eq!(topics.len(), 1);
    }

    #[test]
    fn membership_is_per_connection() {
        let mut topics = TopicRegistry::new();
        let (old, _ro) = connection("a", Role::Member, 4);
        let (new, _rn) = connection("a", Role::Member, 4);
        let _ = topics.subscribe(&old, names(&["room"]));
        let _ = topics.subscribe(&new, names(&["room"]));
        let _ = topics.remove_connection(&old.id);
        let left = topics.subscribers("room");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, new.id);
    }

    #[test]
    fn empty_subscribe_leaves_no_member() {
        let mut topics = TopicRegistry::new();
        let (a, _ra) = connection("a", Role::Member, 4);
        assert_eq!(topics.subscribe(&a, Vec::new()), 0);
        assert_eq!(topics.remove_connection(&a.id), 0);
    }

    #[test]
    fn clear_forgets_everything() {
        let mut topics = TopicRegistry::new();
        let (a, _ra) = connection("a", Role::Member, 4);
        let _ = topics.subscribe(&a, names(&["room"]));
        topics.clear();
        assert!(topics.is_empty());
        assert_eq!(topics.remove_connection(&a.id), 0);
    }
}
