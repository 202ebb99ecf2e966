//! Online/offline notifications for users who watch each other.
//!
//! ```text
//! Hub ──on_connect(U)────► PresenceNotifier ──online_status{U, online}──► online watchers of U
//!                                           └─online_status{onlineUsers}► U
//! Hub ──on_disconnect(U)─► PresenceNotifier ──online_status{U, offline, lastSeen}──► online watchers
//!       (debounced)
//! ```
//!
//! Who watches whom (chat partners, contacts) is owned by the surrounding
//! system and supplied through [`WatcherDirectory`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::connection::UserId;
use crate::hub::{Hub, HubObserver};
use crate::protocol::{Envelope, MessageType};

/// Source of "who should hear about this user's presence".
pub trait WatcherDirectory: Send + Sync {
    fn watchers_of(&self, user_id: UserId) -> Vec<UserId>;
}

/// In-memory watcher lists.
#[derive(Default)]
pub struct StaticWatchers {
    watchers: RwLock<HashMap<UserId, HashSet<UserId>>>,
}

impl StaticWatchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// `watcher` hears about `user`.
    pub fn add(&self, user_id: UserId, watcher: UserId) {
        self.watchers.write().entry(user_id).or_default().insert(watcher);
    }

    /// Each hears about the other.
    pub fn link(&self, a: UserId, b: UserId) {
        self.add(a, b);
        self.add(b, a);
    }

    pub fn remove(&self, user_id: UserId, watcher: UserId) {
        let mut watchers = self.watchers.write();
        if let Some(set) = watchers.get_mut(&user_id) {
            set.remove(&watcher);
            if set.is_empty() {
                watchers.remove(&user_id);
            }
        }
    }
}

impl WatcherDirectory for StaticWatchers {
    fn watchers_of(&self, user_id: UserId) -> Vec<UserId> {
        self.watchers
            .read()
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// `online_status` payload for one user's transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineStatus {
    pub user_id: UserId,
    pub online: bool,
    /// Milliseconds since the Unix epoch; only set when going offline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

/// `online_status` payload sent to a user when they connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineSnapshot {
    pub online_users: Vec<UserId>,
}

/// Hub observer that fans presence changes out to watchers.
pub struct PresenceNotifier {
    directory: Arc<dyn WatcherDirectory>,
    last_seen: RwLock<HashMap<UserId, i64>>,
}

impl PresenceNotifier {
    pub fn new(directory: Arc<dyn WatcherDirectory>) -> Self {
        Self {
            directory,
            last_seen: RwLock::new(HashMap::new()),
        }
    }

    /// When the user last went offline, if they have since this process
    /// started.
    pub fn last_seen(&self, user_id: UserId) -> Option<i64> {
        self.last_seen.read().get(&user_id).copied()
    }

    fn notify<T: Serialize>(hub: &Hub, recipients: &[UserId], payload: &T) {
        let encoded = Envelope::with_payload(MessageType::OnlineStatus, payload)
            .and_then(|env| env.to_payload());
        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode presence update: {e}");
                return;
            }
        };
        for user_id in recipients {
            hub.send_to_user(*user_id, payload.clone());
        }
    }
}

impl HubObserver for PresenceNotifier {
    fn on_connect(&self, hub: &Hub, user_id: UserId) {
        let watchers = hub.online_users(&self.directory.watchers_of(user_id));
        Self::notify(
            hub,
            &watchers,
            &OnlineStatus {
                user_id,
                online: true,
                last_seen: None,
            },
        );
        Self::notify(
            hub,
            &[user_id],
            &OnlineSnapshot {
                online_users: watchers,
            },
        );
    }

    fn on_disconnect(&self, hub: &Hub, user_id: UserId) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.last_seen.write().insert(user_id, now);

        let watchers = hub.online_users(&self.directory.watchers_of(user_id));
        log::debug!("Notifying {} watchers that {user_id} went offline", watchers.len());
        Self::notify(
            hub,
            &watchers,
            &OnlineStatus {
                user_id,
                online: false,
                last_seen: Some(now),
            },
        );
    }
}
