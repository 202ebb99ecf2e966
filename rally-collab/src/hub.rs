//! Registry of live connections and room membership.
//!
//! ```text
//!    register ──┐
//!  unregister ──┤ lifecycle (FIFO)
//! debounce due ─┘─────────► hub loop ──► clients / rooms ◄── join_room / leave_room
//!    broadcast ───────────► (serial)     (one RwLock)        queries (direct calls)
//!                              │
//!                              ├─► per-connection outbound queues (try_send, drop on full)
//!                              └─► observer task: on_connect / on_disconnect, in order
//! ```
//!
//! Admission, eviction and broadcast delivery go through one loop so that a
//! broadcast always sees the membership left by earlier connects and
//! disconnects. Register and unregister share one queue, so a session's
//! unregister is never handled before its register. Room changes and
//! queries are direct calls for lower latency. Both paths share the same
//! lock.
//!
//! Disconnects are debounced: `on_disconnect` fires only if the user is
//! still offline `disconnect_debounce` after the last session closed.
//! Expired debounce timers report back through the lifecycle queue, and
//! observer callbacks are delivered in the order the loop decided them.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::connection::{Connection, UserId};
use crate::protocol::Payload;

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Pending broadcasts the loop will buffer before dropping new ones
    pub broadcast_queue: usize,
    /// Delay before an offline transition is reported
    pub disconnect_debounce: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_queue: 1024,
            disconnect_debounce: Duration::from_secs(5),
        }
    }
}

/// Connection lifecycle listener, fixed at hub construction.
///
/// Callbacks run on a dedicated task, never on the hub loop, one at a time
/// and in the order the transitions happened.
pub trait HubObserver: Send + Sync + 'static {
    fn on_connect(&self, hub: &Hub, user_id: UserId) {
        let _ = (hub, user_id);
    }

    /// Debounced: not called if the user came back within the window.
    fn on_disconnect(&self, hub: &Hub, user_id: UserId) {
        let _ = (hub, user_id);
    }
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
    pub broadcasts_processed: u64,
    pub broadcasts_dropped: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
}

/// Lock-free counters updated on the delivery path.
#[derive(Default)]
struct AtomicHubStats {
    broadcasts_processed: AtomicU64,
    broadcasts_dropped: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
}

enum Lifecycle {
    Register(Arc<Connection>),
    Unregister(Arc<Connection>),
    DisconnectDue { user_id: UserId, generation: u64 },
}

#[derive(Clone, Copy)]
enum Transition {
    Online(UserId),
    Offline(UserId),
}

struct Broadcast {
    room_id: String,
    payload: Payload,
    exclude: Option<UserId>,
}

#[derive(Default)]
struct Membership {
    clients: HashMap<UserId, Arc<Connection>>,
    rooms: HashMap<String, HashMap<UserId, Arc<Connection>>>,
}

impl Membership {
    fn is_current(&self, conn: &Connection) -> bool {
        matches!(self.clients.get(&conn.user_id()), Some(c) if c.conn_id() == conn.conn_id())
    }

    /// Drop `conn` from every room, deleting rooms left empty.
    fn remove_from_rooms(&mut self, conn: &Connection) {
        let user_id = conn.user_id();
        self.rooms.retain(|room_id, members| {
            if matches!(members.get(&user_id), Some(m) if m.conn_id() == conn.conn_id()) {
                members.remove(&user_id);
                if members.is_empty() {
                    log::debug!("Room {room_id} deleted");
                }
            }
            !members.is_empty()
        });
    }
}

struct PendingDisconnect {
    generation: u64,
    timer: AbortHandle,
}

struct HubShared {
    config: HubConfig,
    membership: RwLock<Membership>,
    pending: Mutex<HashMap<UserId, PendingDisconnect>>,
    next_generation: AtomicU64,
    observers: Vec<Arc<dyn HubObserver>>,
    stats: AtomicHubStats,
    lifecycle_tx: mpsc::UnboundedSender<Lifecycle>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    shutdown_tx: watch::Sender<bool>,
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

impl Hub {
    /// Build a hub and spawn its loop on the current tokio runtime.
    ///
    /// The loop runs until [`shutdown`](Self::shutdown).
    pub fn start(config: HubConfig, observers: Vec<Arc<dyn HubObserver>>) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (transition_tx, transition_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_queue.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let hub = Self {
            shared: Arc::new(HubShared {
                config,
                membership: RwLock::new(Membership::default()),
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                observers,
                stats: AtomicHubStats::default(),
                lifecycle_tx,
                broadcast_tx,
                shutdown_tx,
            }),
        };

        tokio::spawn(hub.clone().notify_observers(transition_rx));
        tokio::spawn(hub.clone().run(lifecycle_rx, broadcast_rx, transition_tx, shutdown_rx));
        hub
    }

    async fn run(
        self,
        mut lifecycle_rx: mpsc::UnboundedReceiver<Lifecycle>,
        mut broadcast_rx: mpsc::Receiver<Broadcast>,
        transition_tx: mpsc::UnboundedSender<Transition>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        log::info!("Hub loop started");
        loop {
            let transition = tokio::select! {
                _ = shutdown_rx.changed() => break,
                Some(event) = lifecycle_rx.recv() => match event {
                    Lifecycle::Register(conn) => {
                        let user_id = conn.user_id();
                        self.admit(conn).then_some(Transition::Online(user_id))
                    }
                    Lifecycle::Unregister(conn) => {
                        self.evict(conn);
                        None
                    }
                    Lifecycle::DisconnectDue { user_id, generation } => self
                        .disconnect_due(user_id, generation)
                        .then_some(Transition::Offline(user_id)),
                },
                Some(broadcast) = broadcast_rx.recv() => {
                    self.deliver(broadcast);
                    None
                }
                else => break,
            };
            if let Some(transition) = transition {
                // Receiver only goes away with the runtime.
                let _ = transition_tx.send(transition);
            }
        }
        self.cancel_pending_disconnects();
        log::info!("Hub loop stopped");
    }

    /// Runs observer callbacks in the order the loop produced them.
    async fn notify_observers(self, mut transition_rx: mpsc::UnboundedReceiver<Transition>) {
        while let Some(transition) = transition_rx.recv().await {
            for observer in &self.shared.observers {
                match transition {
                    Transition::Online(user_id) => observer.on_connect(&self, user_id),
                    Transition::Offline(user_id) => observer.on_disconnect(&self, user_id),
                }
            }
        }
    }

    /// Admit a connection. Processed by the hub loop, in order with
    /// [`unregister_client`](Self::unregister_client).
    pub fn register_client(&self, conn: Arc<Connection>) {
        if self.shared.lifecycle_tx.send(Lifecycle::Register(conn)).is_err() {
            log::debug!("Hub stopped, registration ignored");
        }
    }

    /// Evict a connection. Processed by the hub loop.
    pub fn unregister_client(&self, conn: Arc<Connection>) {
        if self.shared.lifecycle_tx.send(Lifecycle::Unregister(conn)).is_err() {
            log::debug!("Hub stopped, unregistration ignored");
        }
    }

    /// Returns `false` if the connection was already closed.
    fn admit(&self, conn: Arc<Connection>) -> bool {
        let user_id = conn.user_id();

        {
            let mut membership = self.shared.membership.write();
            if conn.is_closed() {
                log::debug!("Closed connection {} for user {user_id} not admitted", conn.conn_id());
                return false;
            }
            if let Some(previous) = membership.clients.insert(user_id, conn.clone()) {
                if previous.conn_id() != conn.conn_id() {
                    // Closed under the lock so it cannot rejoin a room.
                    previous.close();
                    membership.remove_from_rooms(&previous);
                    log::info!(
                        "User {user_id} reconnected, closing previous connection {}",
                        previous.conn_id()
                    );
                }
            }
        }

        self.cancel_pending_disconnect(user_id);
        log::info!("Client registered: user {user_id} (conn {})", conn.conn_id());
        true
    }

    fn evict(&self, conn: Arc<Connection>) {
        let user_id = conn.user_id();
        let was_current = {
            let mut membership = self.shared.membership.write();
            conn.close();
            let was_current = membership.is_current(&conn);
            if was_current {
                membership.clients.remove(&user_id);
            }
            membership.remove_from_rooms(&conn);
            was_current
        };

        if was_current {
            log::info!("Client unregistered: user {user_id} (conn {})", conn.conn_id());
            self.schedule_disconnect(user_id);
        } else {
            log::debug!("Stale connection {} for user {user_id} evicted", conn.conn_id());
        }
    }

    fn deliver(&self, broadcast: Broadcast) {
        let (mut delivered, mut dropped) = (0u64, 0u64);
        {
            let membership = self.shared.membership.read();
            if let Some(members) = membership.rooms.get(&broadcast.room_id) {
                for (user_id, conn) in members {
                    if broadcast.exclude == Some(*user_id) {
                        continue;
                    }
                    if conn.send(broadcast.payload.clone()) {
                        delivered += 1;
                    } else {
                        dropped += 1;
                    }
                }
            }
        }

        let stats = &self.shared.stats;
        stats.broadcasts_processed.fetch_add(1, Ordering::Relaxed);
        stats.messages_delivered.fetch_add(delivered, Ordering::Relaxed);
        stats.messages_dropped.fetch_add(dropped, Ordering::Relaxed);
        log::trace!(
            "Broadcast to {}: {delivered} delivered, {dropped} dropped",
            broadcast.room_id
        );
    }

    fn schedule_disconnect(&self, user_id: UserId) {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let delay = self.shared.config.disconnect_debounce;
        let lifecycle_tx = self.shared.lifecycle_tx.clone();

        // The loop handles DisconnectDue only after this returns.
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = lifecycle_tx.send(Lifecycle::DisconnectDue { user_id, generation });
        });
        let previous = self.shared.pending.lock().insert(
            user_id,
            PendingDisconnect {
                generation,
                timer: timer.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }
    }

    /// Whether an expired debounce timer still stands for an offline user.
    fn disconnect_due(&self, user_id: UserId, generation: u64) -> bool {
        {
            let mut pending = self.shared.pending.lock();
            match pending.get(&user_id) {
                Some(entry) if entry.generation == generation => {
                    pending.remove(&user_id);
                }
                _ => return false,
            }
        }
        if self.is_online(user_id) {
            return false;
        }
        log::info!("User {user_id} offline");
        true
    }

    fn cancel_pending_disconnect(&self, user_id: UserId) {
        if let Some(entry) = self.shared.pending.lock().remove(&user_id) {
            entry.timer.abort();
            log::debug!("User {user_id} reconnected within debounce window");
        }
    }

    fn cancel_pending_disconnects(&self) {
        for (_, entry) in self.shared.pending.lock().drain() {
            entry.timer.abort();
        }
    }

    /// Add a connection to a room, creating the room on first join.
    ///
    /// Returns `false` if the connection has already been closed.
    pub fn join_room(&self, conn: &Arc<Connection>, room_id: &str) -> bool {
        let mut membership = self.shared.membership.write();
        if conn.is_closed() {
            return false;
        }
        let members = membership.rooms.entry(room_id.to_string()).or_insert_with(|| {
            log::debug!("Room {room_id} created");
            HashMap::new()
        });
        members.insert(conn.user_id(), conn.clone());
        true
    }

    /// Remove a connection from a room, deleting the room if it empties.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave_room(&self, conn: &Connection, room_id: &str) -> bool {
        let mut membership = self.shared.membership.write();
        let Some(members) = membership.rooms.get_mut(room_id) else {
            return false;
        };
        let is_member = matches!(
            members.get(&conn.user_id()),
            Some(m) if m.conn_id() == conn.conn_id()
        );
        if is_member {
            members.remove(&conn.user_id());
            if members.is_empty() {
                membership.rooms.remove(room_id);
                log::debug!("Room {room_id} deleted");
            }
        }
        is_member
    }

    /// Queue a multicast to every member of `room_id` except `exclude`.
    ///
    /// Never waits. Returns `false` if the broadcast queue is full and the
    /// broadcast was dropped.
    pub fn send_to_room(&self, room_id: &str, payload: Payload, exclude: Option<UserId>) -> bool {
        let broadcast = Broadcast {
            room_id: room_id.to_string(),
            payload,
            exclude,
        };
        match self.shared.broadcast_tx.try_send(broadcast) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.stats.broadcasts_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Broadcast queue full, dropping broadcast to {room_id}");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver to one user if online. Returns whether it was queued.
    pub fn send_to_user(&self, user_id: UserId, payload: Payload) -> bool {
        let conn = self.shared.membership.read().clients.get(&user_id).cloned();
        match conn {
            Some(conn) => conn.send(payload),
            None => false,
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.shared.membership.read().clients.contains_key(&user_id)
    }

    /// The subset of `user_ids` that is online, in input order.
    pub fn online_users(&self, user_ids: &[UserId]) -> Vec<UserId> {
        let membership = self.shared.membership.read();
        user_ids
            .iter()
            .filter(|id| membership.clients.contains_key(id))
            .copied()
            .collect()
    }

    pub fn room_members(&self, room_id: &str) -> Vec<UserId> {
        self.shared
            .membership
            .read()
            .rooms
            .get(room_id)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Rooms the user's current connection belongs to. Empty if the user
    /// is offline.
    pub fn rooms_of(&self, user_id: UserId) -> Vec<String> {
        let membership = self.shared.membership.read();
        let Some(current) = membership.clients.get(&user_id) else {
            return Vec::new();
        };
        membership
            .rooms
            .iter()
            .filter(|(_, members)| {
                matches!(members.get(&user_id), Some(m) if m.conn_id() == current.conn_id())
            })
            .map(|(room_id, _)| room_id.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.membership.read().clients.len()
    }

    pub fn room_count(&self) -> usize {
        self.shared.membership.read().rooms.len()
    }

    pub fn stats(&self) -> HubStats {
        let (connections, rooms) = {
            let membership = self.shared.membership.read();
            (membership.clients.len(), membership.rooms.len())
        };
        let stats = &self.shared.stats;
        HubStats {
            connections,
            rooms,
            broadcasts_processed: stats.broadcasts_processed.load(Ordering::Relaxed),
            broadcasts_dropped: stats.broadcasts_dropped.load(Ordering::Relaxed),
            messages_delivered: stats.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: stats.messages_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the loop and cancel pending disconnect timers. Queued work is
    /// discarded.
    pub fn shutdown(&self) {
        self.shared.shutdown_tx.send_replace(true);
        self.cancel_pending_disconnects();
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder {
        connects: Mutex<Vec<UserId>>,
        disconnects: Mutex<Vec<UserId>>,
        /// `true` for online, in callback order
        transitions: Mutex<Vec<bool>>,
    }

    impl HubObserver for Recorder {
        fn on_connect(&self, _hub: &Hub, user_id: UserId) {
            self.connects.lock().push(user_id);
            self.transitions.lock().push(true);
        }

        fn on_disconnect(&self, _hub: &Hub, user_id: UserId) {
            self.disconnects.lock().push(user_id);
            self.transitions.lock().push(false);
        }
    }

    fn start_with_recorder(config: HubConfig) -> (Hub, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let hub = Hub::start(config, vec![recorder.clone() as Arc<dyn HubObserver>]);
        (hub, recorder)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    fn payload(s: &str) -> Payload {
        Arc::new(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let (hub, recorder) = start_with_recorder(HubConfig::default());
        let user = Uuid::new_v4();
        let (conn, _rx) = Connection::new(user, 8);

        hub.register_client(conn.clone());
        wait_until(|| hub.is_online(user)).await;
        wait_until(|| recorder.connects.lock().len() == 1).await;
        assert_eq!(hub.connection_count(), 1);

        hub.unregister_client(conn.clone());
        wait_until(|| !hub.is_online(user)).await;
        assert!(conn.is_closed());
        hub.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_immediate_unregister_never_leaves_user_online() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let user = Uuid::new_v4();

        for _ in 0..200 {
            let (conn, _rx) = Connection::new(user, 8);
            hub.register_client(conn.clone());
            hub.unregister_client(conn);
            sleep(Duration::from_millis(2)).await;
            wait_until(|| !hub.is_online(user)).await;
        }
        assert_eq!(hub.connection_count(), 0);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_admitted() {
        let (hub, recorder) = start_with_recorder(HubConfig::default());
        let user = Uuid::new_v4();
        let (conn, _rx) = Connection::new(user, 8);
        conn.close();

        hub.register_client(conn);
        // A later registration proves the first one was processed.
        let (other, _rx2) = Connection::new(Uuid::new_v4(), 8);
        hub.register_client(other.clone());
        wait_until(|| hub.is_online(other.user_id())).await;

        assert!(!hub.is_online(user));
        assert_eq!(hub.connection_count(), 1);
        wait_until(|| recorder.connects.lock().len() == 1).await;
        assert_eq!(*recorder.connects.lock(), vec![other.user_id()]);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_room_exclusion() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let (c1, mut rx1) = Connection::new(u1, 8);
        let (c2, mut rx2) = Connection::new(u2, 8);

        hub.register_client(c1.clone());
        hub.register_client(c2.clone());
        wait_until(|| hub.connection_count() == 2).await;
        assert!(hub.join_room(&c1, "chat:abc"));
        assert!(hub.join_room(&c2, "chat:abc"));

        assert!(hub.send_to_room("chat:abc", payload("hi"), Some(u1)));
        let received = timeout(Duration::from_secs(1), rx2.recv()).await.unwrap().unwrap();
        assert_eq!(*received, b"hi".to_vec());
        assert!(rx1.try_recv().is_err());
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_rooms_created_and_deleted() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let user = Uuid::new_v4();
        let (conn, _rx) = Connection::new(user, 8);
        hub.register_client(conn.clone());
        wait_until(|| hub.is_online(user)).await;

        hub.join_room(&conn, "chat:a");
        hub.join_room(&conn, "chat:b");
        assert_eq!(hub.room_count(), 2);
        assert_eq!(hub.room_members("chat:a"), vec![user]);
        let mut rooms = hub.rooms_of(user);
        rooms.sort();
        assert_eq!(rooms, vec!["chat:a", "chat:b"]);

        assert!(hub.leave_room(&conn, "chat:a"));
        assert!(!hub.leave_room(&conn, "chat:a"));

        // A connection that never registered is not the user's current one.
        let (stray, _stray_rx) = Connection::new(user, 8);
        assert!(hub.join_room(&stray, "chat:c"));
        assert_eq!(hub.rooms_of(user), vec!["chat:b"]);
        hub.leave_room(&stray, "chat:c");
        assert!(hub.rooms_of(Uuid::new_v4()).is_empty());
        assert_eq!(hub.room_count(), 1);

        // Unregistering clears the remaining room.
        hub.unregister_client(conn.clone());
        wait_until(|| hub.room_count() == 0).await;
        assert!(hub.room_members("chat:b").is_empty());
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_closed_connection_cannot_join() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let (conn, _rx) = Connection::new(Uuid::new_v4(), 8);
        conn.close();
        assert!(!hub.join_room(&conn, "chat:x"));
        assert_eq!(hub.room_count(), 0);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_send_to_user() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let user = Uuid::new_v4();
        let (conn, mut rx) = Connection::new(user, 8);

        assert!(!hub.send_to_user(user, payload("early")));
        hub.register_client(conn);
        wait_until(|| hub.is_online(user)).await;

        assert!(hub.send_to_user(user, payload("direct")));
        assert_eq!(*rx.recv().await.unwrap(), b"direct".to_vec());
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_online_users_preserves_order() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let (ca, _ra) = Connection::new(a, 8);
        let (cc, _rc) = Connection::new(c, 8);
        hub.register_client(ca);
        hub.register_client(cc);
        wait_until(|| hub.connection_count() == 2).await;

        assert_eq!(hub.online_users(&[c, b, a]), vec![c, a]);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_slow_member_does_not_block_others() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let (slow_user, fast_user) = (Uuid::new_v4(), Uuid::new_v4());
        let (slow, _slow_rx) = Connection::new(slow_user, 1);
        let (fast, mut fast_rx) = Connection::new(fast_user, 16);
        hub.register_client(slow.clone());
        hub.register_client(fast.clone());
        wait_until(|| hub.connection_count() == 2).await;
        hub.join_room(&slow, "room");
        hub.join_room(&fast, "room");

        for i in 0..5 {
            hub.send_to_room("room", payload(&i.to_string()), None);
        }
        for i in 0..5 {
            let got = timeout(Duration::from_secs(1), fast_rx.recv()).await.unwrap().unwrap();
            assert_eq!(*got, i.to_string().into_bytes());
        }

        let stats = hub.stats();
        assert_eq!(stats.broadcasts_processed, 5);
        assert_eq!(stats.messages_delivered, 6);
        assert_eq!(stats.messages_dropped, 4);
        assert_eq!(slow.dropped_count(), 4);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_second_connection_replaces_first() {
        let hub = Hub::start(HubConfig::default(), Vec::new());
        let user = Uuid::new_v4();
        let (first, _rx1) = Connection::new(user, 8);
        let (second, mut rx2) = Connection::new(user, 8);

        hub.register_client(first.clone());
        wait_until(|| hub.is_online(user)).await;
        hub.join_room(&first, "chat:dup");

        hub.register_client(second.clone());
        wait_until(|| first.is_closed()).await;
        assert!(hub.room_members("chat:dup").is_empty());
        assert!(!hub.join_room(&first, "chat:dup"));

        // The stale session ending must not take the new one offline.
        hub.unregister_client(first);
        hub.join_room(&second, "chat:dup");
        hub.send_to_room("chat:dup", payload("still here"), None);
        let got = timeout(Duration::from_secs(1), rx2.recv()).await.unwrap().unwrap();
        assert_eq!(*got, b"still here".to_vec());
        assert!(hub.is_online(user));
        assert_eq!(hub.connection_count(), 1);
        hub.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_reconnect_suppresses_offline() {
        let (hub, recorder) = start_with_recorder(HubConfig::default());
        let user = Uuid::new_v4();

        let (first, _rx1) = Connection::new(user, 8);
        hub.register_client(first.clone());
        wait_until(|| hub.is_online(user)).await;
        hub.unregister_client(first);
        wait_until(|| !hub.is_online(user)).await;

        sleep(Duration::from_millis(100)).await;
        let (second, _rx2) = Connection::new(user, 8);
        hub.register_client(second);
        wait_until(|| hub.is_online(user)).await;

        sleep(Duration::from_secs(10)).await;
        assert!(recorder.disconnects.lock().is_empty());
        hub.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_fires_once_after_debounce() {
        let (hub, recorder) = start_with_recorder(HubConfig::default());
        let user = Uuid::new_v4();

        let (conn, _rx) = Connection::new(user, 8);
        hub.register_client(conn.clone());
        wait_until(|| hub.is_online(user)).await;
        hub.unregister_client(conn);
        wait_until(|| !hub.is_online(user)).await;

        sleep(Duration::from_secs(4)).await;
        assert!(recorder.disconnects.lock().is_empty());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(*recorder.disconnects.lock(), vec![user]);
        hub.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_offline_reports_online_last() {
        let (hub, recorder) = start_with_recorder(HubConfig::default());
        let user = Uuid::new_v4();

        let (first, _rx1) = Connection::new(user, 8);
        hub.register_client(first.clone());
        wait_until(|| hub.is_online(user)).await;
        hub.unregister_client(first);
        sleep(Duration::from_secs(6)).await;

        let (second, _rx2) = Connection::new(user, 8);
        hub.register_client(second);
        wait_until(|| recorder.transitions.lock().len() == 3).await;
        assert_eq!(*recorder.transitions.lock(), vec![true, false, true]);
        hub.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flapping_user_ends_online_for_observers() {
        let config = HubConfig {
            disconnect_debounce: Duration::ZERO,
            ..HubConfig::default()
        };
        let (hub, recorder) = start_with_recorder(config);
        let user = Uuid::new_v4();

        for _ in 0..50 {
            let (conn, _rx) = Connection::new(user, 8);
            hub.register_client(conn.clone());
            hub.unregister_client(conn);
            tokio::task::yield_now().await;
        }
        let (last, _rx) = Connection::new(user, 8);
        hub.register_client(last);
        wait_until(|| hub.is_online(user)).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(recorder.transitions.lock().last(), Some(&true));
        hub.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_disconnects() {
        let (hub, recorder) = start_with_recorder(HubConfig::default());
        let user = Uuid::new_v4();

        let (conn, _rx) = Connection::new(user, 8);
        hub.register_client(conn.clone());
        wait_until(|| hub.is_online(user)).await;
        hub.unregister_client(conn);
        wait_until(|| !hub.is_online(user)).await;

        hub.shutdown();
        sleep(Duration::from_secs(10)).await;
        assert!(recorder.disconnects.lock().is_empty());
    }
}
