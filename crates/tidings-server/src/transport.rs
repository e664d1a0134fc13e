//! Live connections and room routing.
//!
//! Each socket gets a [`ConnectionId`] and a bounded outbox. A connection
//! joins exactly one personal room (its user id) and any number of group
//! rooms. Delivery never blocks: a full outbox drops the frame for that
//! connection only, and the durable log remains the source of truth.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tidings_shared::protocol::{BusEnvelope, BusEvent, ServerFrame};
use tidings_shared::{GroupId, MessageView, UserId};

use crate::error::TransportError;

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Personal(UserId),
    Group(GroupId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected but not yet bound to a user.
    Anonymous,
    Joined(UserId),
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Same user joined again; nothing changed.
    AlreadyJoined,
    /// The connection is bound to a different user.
    Rejected { bound_to: UserId },
}

struct Connection {
    user: Option<UserId>,
    rooms: HashSet<Room>,
    outbox: mpsc::Sender<ServerFrame>,
}

#[derive(Default)]
struct HubState {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<Room, HashSet<ConnectionId>>,
}

impl HubState {
    fn enter(&mut self, id: ConnectionId, room: Room) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.rooms.insert(room.clone());
            self.rooms.entry(room).or_default().insert(id);
        }
    }
}

#[derive(Clone)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
    outbox_capacity: usize,
}

impl Hub {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(HubState::default())),
            outbox_capacity,
        }
    }

    /// Register a new connection. The receiver yields frames for its socket.
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let mut state = self.state.write().await;
        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(
            id,
            Connection {
                user: None,
                rooms: HashSet::new(),
                outbox: tx,
            },
        );
        debug!(conn = id, total = state.connections.len(), "connection opened");
        (id, rx)
    }

    /// Bind the connection to `user` and enter their personal room.
    pub async fn join(
        &self,
        id: ConnectionId,
        user: UserId,
    ) -> Result<JoinOutcome, TransportError> {
        let mut state = self.state.write().await;
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or(TransportError::Closed(id))?;

        if let Some(bound) = conn.user.clone() {
            return Ok(if bound == user {
                JoinOutcome::AlreadyJoined
            } else {
                JoinOutcome::Rejected { bound_to: bound }
            });
        }
        conn.user = Some(user.clone());

        info!(conn = id, user = %user, "connection joined");
        state.enter(id, Room::Personal(user));
        Ok(JoinOutcome::Joined)
    }

    /// Enter a group room. Only joined connections may do so; returns the
    /// bound user on success.
    pub async fn join_group(
        &self,
        id: ConnectionId,
        group: GroupId,
    ) -> Result<Option<UserId>, TransportError> {
        let mut state = self.state.write().await;
        let user = state
            .connections
            .get(&id)
            .ok_or(TransportError::Closed(id))?
            .user
            .clone();
        if user.is_some() {
            debug!(conn = id, group = %group, "connection entered group room");
            state.enter(id, Room::Group(group));
        }
        Ok(user)
    }

    /// Remove the connection from every room. Safe to call more than once.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut state = self.state.write().await;
        let Some(conn) = state.connections.remove(&id) else {
            return;
        };
        for room in conn.rooms {
            if let Some(members) = state.rooms.get_mut(&room) {
                members.remove(&id);
                if members.is_empty() {
                    state.rooms.remove(&room);
                }
            }
        }
        debug!(conn = id, total = state.connections.len(), "connection closed");
    }

    pub async fn state_of(&self, id: ConnectionId) -> ConnectionState {
        match self.state.read().await.connections.get(&id) {
            None => ConnectionState::Disconnected,
            Some(Connection { user: None, .. }) => ConnectionState::Anonymous,
            Some(Connection {
                user: Some(user), ..
            }) => ConnectionState::Joined(user.clone()),
        }
    }

    /// Push a frame to every connection in `room`. Returns how many
    /// connections accepted it.
    pub async fn emit(&self, room: &Room, frame: &ServerFrame) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for id in members {
            let Some(conn) = state.connections.get(id) else {
                continue;
            };
            match conn.outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(error = %TransportError::OutboxFull(*id), "dropping frame for slow connection");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(error = %TransportError::Closed(*id), "dropping frame for closing connection");
                }
            }
        }
        delivered
    }

    #[cfg(test)]
    pub async fn room_size(&self, room: &Room) -> usize {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .map_or(0, HashSet::len)
    }
}

// ---------------------------------------------------------------------------
// Bus dispatch
// ---------------------------------------------------------------------------

/// Recently delivered message ids, bounded.
pub struct RecentIds {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` if `id` was already recorded.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

const DEDUP_WINDOW: usize = 4096;

/// Emit every bus event into local rooms until the subscription ends.
pub fn spawn_dispatcher(mut events: mpsc::Receiver<BusEnvelope>, hub: Hub) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut recent = RecentIds::new(DEDUP_WINDOW);
        while let Some(envelope) = events.recv().await {
            let delivered = dispatch(&hub, &mut recent, envelope.event).await;
            debug!(origin = %envelope.origin, delivered, "bus event dispatched");
        }
        info!("delivery bus closed, dispatcher stopping");
    })
}

async fn dispatch(hub: &Hub, recent: &mut RecentIds, event: BusEvent) -> usize {
    match event {
        BusEvent::Direct { message } => deliver_direct(hub, recent, message).await,
        BusEvent::Group { message } => {
            let Some(group) = message.group_id.clone() else {
                return 0;
            };
            if !recent.insert(message.id) {
                return 0;
            }
            hub.emit(&Room::Group(group), &ServerFrame::GroupMessage(message))
                .await
        }
        BusEvent::Broadcast { messages } => {
            let mut delivered = 0;
            for message in messages {
                delivered += deliver_direct(hub, recent, message).await;
            }
            delivered
        }
    }
}

async fn deliver_direct(hub: &Hub, recent: &mut RecentIds, message: MessageView) -> usize {
    let Some(receiver) = message.receiver_id.clone() else {
        return 0;
    };
    if !recent.insert(message.id) {
        return 0;
    }
    hub.emit(&Room::Personal(receiver), &ServerFrame::Message(message))
        .await
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::bus::{BroadcastBus, LocalBus};

    fn user(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn direct(to: &str) -> MessageView {
        MessageView {
            id: Uuid::now_v7(),
            sender_id: user("sender"),
            receiver_id: Some(user(to)),
            group_id: None,
            content: "hello".into(),
            attachments: Vec::new(),
            is_broadcast: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn join_is_idempotent_and_exclusive() {
        let hub = Hub::new(8);
        let (id, _rx) = hub.connect().await;
        assert_eq!(hub.state_of(id).await, ConnectionState::Anonymous);

        assert_eq!(hub.join(id, user("alice")).await.unwrap(), JoinOutcome::Joined);
        assert_eq!(
            hub.join(id, user("alice")).await.unwrap(),
            JoinOutcome::AlreadyJoined
        );
        assert_eq!(
            hub.join(id, user("bob")).await.unwrap(),
            JoinOutcome::Rejected {
                bound_to: user("alice")
            }
        );
        assert_eq!(hub.state_of(id).await, ConnectionState::Joined(user("alice")));
        assert_eq!(hub.room_size(&Room::Personal(user("alice"))).await, 1);
        assert_eq!(hub.room_size(&Room::Personal(user("bob"))).await, 0);
    }

    #[tokio::test]
    async fn group_rooms_need_a_joined_connection() {
        let hub = Hub::new(8);
        let (id, _rx) = hub.connect().await;
        let group = GroupId::parse("g1").unwrap();

        assert_eq!(hub.join_group(id, group.clone()).await.unwrap(), None);
        assert_eq!(hub.room_size(&Room::Group(group.clone())).await, 0);

        hub.join(id, user("alice")).await.unwrap();
        assert_eq!(
            hub.join_group(id, group.clone()).await.unwrap(),
            Some(user("alice"))
        );
        assert_eq!(hub.room_size(&Room::Group(group)).await, 1);
    }

    #[tokio::test]
    async fn disconnect_leaves_every_room() {
        let hub = Hub::new(8);
        let (id, _rx) = hub.connect().await;
        let group = GroupId::parse("g1").unwrap();
        hub.join(id, user("alice")).await.unwrap();
        hub.join_group(id, group.clone()).await.unwrap();

        hub.disconnect(id).await;
        hub.disconnect(id).await;

        assert_eq!(hub.state_of(id).await, ConnectionState::Disconnected);
        assert_eq!(hub.room_size(&Room::Group(group)).await, 0);
        assert_eq!(hub.room_size(&Room::Personal(user("alice"))).await, 0);
        assert!(matches!(
            hub.join(id, user("alice")).await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn emit_reaches_every_connection_of_a_user() {
        let hub = Hub::new(8);
        let (phone, mut phone_rx) = hub.connect().await;
        let (laptop, mut laptop_rx) = hub.connect().await;
        hub.join(phone, user("bob")).await.unwrap();
        hub.join(laptop, user("bob")).await.unwrap();

        let frame = ServerFrame::Message(direct("bob"));
        assert_eq!(hub.emit(&Room::Personal(user("bob")), &frame).await, 2);
        assert_eq!(phone_rx.recv().await.unwrap(), frame);
        assert_eq!(laptop_rx.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn slow_connection_does_not_block_others() {
        let hub = Hub::new(1);
        let (slow, _slow_rx) = hub.connect().await;
        let (fast, mut fast_rx) = hub.connect().await;
        hub.join(slow, user("bob")).await.unwrap();
        hub.join(fast, user("bob")).await.unwrap();

        let room = Room::Personal(user("bob"));
        assert_eq!(hub.emit(&room, &ServerFrame::Message(direct("bob"))).await, 2);
        fast_rx.recv().await.unwrap();
        // The slow outbox is still full, so only the drained one accepts.
        assert_eq!(hub.emit(&room, &ServerFrame::Message(direct("bob"))).await, 1);
    }

    #[test]
    fn recent_ids_evicts_oldest() {
        let mut recent = RecentIds::new(2);
        let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        assert!(recent.insert(a));
        assert!(!recent.insert(a));
        assert!(recent.insert(b));
        assert!(recent.insert(c));
        assert!(recent.insert(a));
    }

    #[tokio::test]
    async fn dispatcher_delivers_once_per_message() {
        let hub = Hub::new(8);
        let (conn, mut rx) = hub.connect().await;
        hub.join(conn, user("bob")).await.unwrap();

        let bus = LocalBus::new();
        let events = bus.subscribe("t").await.unwrap();
        let _dispatcher = spawn_dispatcher(events, hub.clone());

        let message = direct("bob");
        let envelope = BusEnvelope {
            origin: "node-a".into(),
            event: BusEvent::Direct {
                message: message.clone(),
            },
        };
        bus.publish("t", &envelope).await.unwrap();
        bus.publish("t", &envelope).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first, ServerFrame::Message(message));
        let second = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(second.is_err());
    }
}
