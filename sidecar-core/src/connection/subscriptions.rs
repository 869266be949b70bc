//! Subscription table
//!
//! One entry per channel key. Each entry holds the upstream id of the
//! current session (None until established) and the local subscribers.
//! Invariants:
//! - at most one upstream subscription per key
//! - an entry exists only while it has at least one subscriber
//! - `routes` holds exactly the upstream ids present in entries

use super::manager::NotificationHandler;
use crate::core::types::{ChannelKey, SubscriberHandle, UpstreamId};
use std::collections::{BTreeMap, HashMap};

pub(crate) struct Subscription {
    pub upstream: Option<UpstreamId>,
    pub subscribers: BTreeMap<SubscriberHandle, NotificationHandler>,
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    by_key: HashMap<ChannelKey, Subscription>,
    handles: HashMap<SubscriberHandle, ChannelKey>,
    routes: HashMap<UpstreamId, ChannelKey>,
}

/// What `remove_subscriber` left behind
pub(crate) enum Removal {
    UnknownHandle,
    /// Other subscribers remain on the key
    Kept,
    /// Last subscriber gone; upstream id to cancel, if one was established
    Emptied(ChannelKey, Option<UpstreamId>),
}

impl SubscriptionTable {
    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Add a subscriber to an existing key; false if the key is not on file
    pub fn add_subscriber(
        &mut self,
        key: &ChannelKey,
        handle: SubscriberHandle,
        handler: NotificationHandler,
    ) -> bool {
        match self.by_key.get_mut(key) {
            Some(sub) => {
                sub.subscribers.insert(handle, handler);
                self.handles.insert(handle, key.clone());
                true
            }
            None => false,
        }
    }

    /// Create the entry for a new key with its first subscriber
    pub fn insert(
        &mut self,
        key: ChannelKey,
        upstream: Option<UpstreamId>,
        handle: SubscriberHandle,
        handler: NotificationHandler,
    ) {
        if let Some(id) = &upstream {
            self.routes.insert(id.clone(), key.clone());
        }
        let mut subscribers = BTreeMap::new();
        subscribers.insert(handle, handler);
        self.handles.insert(handle, key.clone());
        self.by_key.insert(
            key,
            Subscription {
                upstream,
                subscribers,
            },
        );
    }

    pub fn remove_subscriber(&mut self, handle: SubscriberHandle) -> Removal {
        let Some(key) = self.handles.remove(&handle) else {
            return Removal::UnknownHandle;
        };
        let emptied = match self.by_key.get_mut(&key) {
            Some(sub) => {
                sub.subscribers.remove(&handle);
                sub.subscribers.is_empty()
            }
            None => return Removal::UnknownHandle,
        };
        if !emptied {
            return Removal::Kept;
        }
        let upstream = self.by_key.remove(&key).and_then(|sub| sub.upstream);
        if let Some(id) = &upstream {
            self.routes.remove(id);
        }
        Removal::Emptied(key, upstream)
    }

    /// Handlers for the key an upstream id routes to
    pub fn handlers_for(&self, id: &UpstreamId) -> Option<(ChannelKey, Vec<NotificationHandler>)> {
        let key = self.routes.get(id)?;
        let sub = self.by_key.get(key)?;
        Some((key.clone(), sub.subscribers.values().cloned().collect()))
    }

    /// Forget every upstream id (the session that issued them is gone);
    /// returns the keys that need replay
    pub fn invalidate_upstream(&mut self) -> Vec<ChannelKey> {
        self.routes.clear();
        let mut keys: Vec<ChannelKey> = self
            .by_key
            .iter_mut()
            .map(|(key, sub)| {
                sub.upstream = None;
                key.clone()
            })
            .collect();
        keys.sort();
        keys
    }

    /// Record the upstream id for a key still on file; false if the key
    /// was removed meanwhile
    pub fn set_upstream(&mut self, key: &ChannelKey, id: UpstreamId) -> bool {
        match self.by_key.get_mut(key) {
            Some(sub) => {
                if let Some(old) = sub.upstream.replace(id.clone()) {
                    self.routes.remove(&old);
                }
                self.routes.insert(id, key.clone());
                true
            }
            None => false,
        }
    }

    pub fn upstream_id(&self, key: &ChannelKey) -> Option<UpstreamId> {
        self.by_key.get(key).and_then(|s| s.upstream.clone())
    }

    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.by_key.get(key).map(|s| s.subscribers.len()).unwrap_or(0)
    }

    pub fn key_count(&self) -> usize {
        self.by_key.len()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<_> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Empty the table; returns established (key, upstream id) pairs
    pub fn drain(&mut self) -> Vec<(ChannelKey, UpstreamId)> {
        self.handles.clear();
        self.routes.clear();
        self.by_key
            .drain()
            .filter_map(|(key, sub)| sub.upstream.map(|id| (key, id)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account_key, logs_key};
    use std::sync::Arc;

    fn noop() -> NotificationHandler {
        Arc::new(|_| {})
    }

    #[test]
    fn test_last_subscriber_empties_entry() {
        let mut table = SubscriptionTable::default();
        let key = logs_key();
        table.insert(key.clone(), Some(UpstreamId("1".into())), SubscriberHandle(1), noop());
        assert!(table.add_subscriber(&key, SubscriberHandle(2), noop()));

        assert!(matches!(table.remove_subscriber(SubscriberHandle(1)), Removal::Kept));
        match table.remove_subscriber(SubscriberHandle(2)) {
            Removal::Emptied(k, Some(id)) => {
                assert_eq!(k, key);
                assert_eq!(id, UpstreamId("1".into()));
            }
            _ => panic!("expected emptied entry"),
        }
        assert!(!table.contains(&key));
        assert!(table.handlers_for(&UpstreamId("1".into())).is_none());
        assert!(matches!(
            table.remove_subscriber(SubscriberHandle(2)),
            Removal::UnknownHandle
        ));
    }

    #[test]
    fn test_invalidate_then_set_upstream() {
        let mut table = SubscriptionTable::default();
        table.insert(logs_key(), Some(UpstreamId("1".into())), SubscriberHandle(1), noop());
        table.insert(account_key(), None, SubscriberHandle(2), noop());

        let keys = table.invalidate_upstream();
        assert_eq!(keys.len(), 2);
        assert!(table.handlers_for(&UpstreamId("1".into())).is_none());

        assert!(table.set_upstream(&logs_key(), UpstreamId("7".into())));
        let (key, handlers) = table.handlers_for(&UpstreamId("7".into())).unwrap();
        assert_eq!(key, logs_key());
        assert_eq!(handlers.len(), 1);
        // Subscribers survive the replay unchanged
        assert_eq!(table.subscriber_count(&account_key()), 1);
    }
}
