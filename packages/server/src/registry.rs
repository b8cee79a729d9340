//! Room & presence registry.
//!
//! Rooms are keyed by job id and created implicitly on the first join. Every
//! mutation takes the room's own lock and broadcasts while still holding it,
//! so the membership snapshot a broadcast is built from can never be stale
//! relative to a concurrent join or leave on the same room. Operations on
//! different rooms only share the brief map lookup.
//!
//! Lock order is always map → room; never the reverse.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use renraku_shared::envelope::{Envelope, PresenceStatus};
use renraku_shared::ids::{RoomId, UserId};

use crate::state::{ClientRegistry, encode_or_log};

/// Presence of one user, derived from connection lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub last_seen: i64,
}

#[derive(Default)]
struct RoomState {
    members: HashSet<UserId>,
    /// Typing generation per user; a stale TTL timer whose generation no
    /// longer matches does nothing
    typing: HashMap<UserId, u64>,
    typing_generation: u64,
    /// Set when the room was dropped from the map; joiners that raced the
    /// last leave retry against a fresh room
    retired: bool,
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, Arc<Mutex<RoomState>>>>,
    presence: Mutex<HashMap<UserId, PresenceRecord>>,
    typing_ttl: Duration,
}

impl RoomRegistry {
    pub fn new(typing_ttl: Duration) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            presence: Mutex::new(HashMap::new()),
            typing_ttl,
        }
    }

    async fn live_room(&self, room_id: &RoomId) -> Arc<Mutex<RoomState>> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RoomState::default())))
            .clone()
    }

    async fn get_room(&self, room_id: &RoomId) -> Option<Arc<Mutex<RoomState>>> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    /// Add a user to a room (idempotent), announce the join to the members
    /// already there, and return the membership at join time for the joiner.
    pub async fn join_room(
        &self,
        clients: &ClientRegistry,
        user_id: &UserId,
        room_id: &RoomId,
        now: i64,
    ) -> Vec<UserId> {
        loop {
            let room = self.live_room(room_id).await;
            let mut state = room.lock().await;
            if state.retired {
                continue;
            }
            let newly_joined = state.members.insert(user_id.clone());
            if newly_joined {
                let others: Vec<UserId> = state
                    .members
                    .iter()
                    .filter(|member| *member != user_id)
                    .cloned()
                    .collect();
                let event = Envelope::UserJoinedRoom {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                    timestamp: now,
                };
                if let Some(json) = encode_or_log(&event) {
                    clients.send_to_users(&others, &json).await;
                }
                tracing::info!("'{}' joined room '{}'", user_id, room_id);
            }
            let mut members: Vec<UserId> = state.members.iter().cloned().collect();
            members.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            return members;
        }
    }

    /// Remove a user from a room (idempotent) and announce the leave to the
    /// remaining members. Empty rooms are dropped from the map.
    pub async fn leave_room(
        &self,
        clients: &ClientRegistry,
        user_id: &UserId,
        room_id: &RoomId,
        now: i64,
    ) -> bool {
        let Some(room) = self.get_room(room_id).await else {
            return false;
        };
        let (removed, empty) = {
            let mut state = room.lock().await;
            let removed = state.members.remove(user_id);
            if removed {
                state.typing.remove(user_id);
                let remaining: Vec<UserId> = state.members.iter().cloned().collect();
                let event = Envelope::UserLeftRoom {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                    timestamp: now,
                };
                if let Some(json) = encode_or_log(&event) {
                    clients.send_to_users(&remaining, &json).await;
                }
                tracing::info!("'{}' left room '{}'", user_id, room_id);
            }
            (removed, state.members.is_empty())
        };
        if empty {
            self.retire_if_empty(room_id, &room).await;
        }
        removed
    }

    async fn retire_if_empty(&self, room_id: &RoomId, room: &Arc<Mutex<RoomState>>) {
        let mut rooms = self.rooms.lock().await;
        let Some(entry) = rooms.get(room_id).cloned() else {
            return;
        };
        if !Arc::ptr_eq(&entry, room) {
            return;
        }
        let mut state = entry.lock().await;
        if state.members.is_empty() {
            state.retired = true;
            rooms.remove(room_id);
            tracing::debug!("room '{}' is empty; dropped", room_id);
        }
    }

    /// Membership snapshot for fan-out, or an empty list for an unknown room.
    pub async fn members_of(&self, room_id: &RoomId) -> Vec<UserId> {
        match self.get_room(room_id).await {
            Some(room) => room.lock().await.members.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Rooms the user is currently a member of.
    pub async fn rooms_of(&self, user_id: &UserId) -> Vec<RoomId> {
        let rooms = self.rooms.lock().await;
        let mut out = Vec::new();
        for (room_id, room) in rooms.iter() {
            if room.lock().await.members.contains(user_id) {
                out.push(room_id.clone());
            }
        }
        out
    }

    /// Snapshot of all rooms and their members, for the operational API.
    pub async fn room_snapshot(&self) -> Vec<(RoomId, Vec<UserId>)> {
        let rooms: Vec<(RoomId, Arc<Mutex<RoomState>>)> = {
            let rooms = self.rooms.lock().await;
            rooms
                .iter()
                .map(|(id, room)| (id.clone(), room.clone()))
                .collect()
        };
        let mut out = Vec::with_capacity(rooms.len());
        for (room_id, room) in rooms {
            let mut members: Vec<UserId> = room.lock().await.members.iter().cloned().collect();
            members.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            out.push((room_id, members));
        }
        out.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        out
    }

    /// Start (or refresh) a typing indicator and arm its TTL timer. The timer
    /// clears the indicator and announces the stop unless an explicit
    /// `stop_typing` or a refresh got there first.
    pub async fn typing(
        self: &Arc<Self>,
        clients: &Arc<ClientRegistry>,
        user_id: &UserId,
        room_id: &RoomId,
    ) {
        let Some(room) = self.get_room(room_id).await else {
            return;
        };
        let generation = {
            let mut state = room.lock().await;
            if state.retired || !state.members.contains(user_id) {
                tracing::debug!(
                    "ignoring typing from non-member '{}' in '{}'",
                    user_id,
                    room_id
                );
                return;
            }
            state.typing_generation += 1;
            let generation = state.typing_generation;
            state.typing.insert(user_id.clone(), generation);
            let others: Vec<UserId> = state
                .members
                .iter()
                .filter(|member| *member != user_id)
                .cloned()
                .collect();
            let event = Envelope::UserTyping {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
            };
            if let Some(json) = encode_or_log(&event) {
                clients.send_to_users(&others, &json).await;
            }
            generation
        };

        let registry = Arc::clone(self);
        let clients = Arc::clone(clients);
        let user_id = user_id.clone();
        let room_id = room_id.clone();
        let ttl = self.typing_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            registry
                .expire_typing(&clients, &user_id, &room_id, generation)
                .await;
        });
    }

    async fn expire_typing(
        &self,
        clients: &ClientRegistry,
        user_id: &UserId,
        room_id: &RoomId,
        generation: u64,
    ) {
        let Some(room) = self.get_room(room_id).await else {
            return;
        };
        let mut state = room.lock().await;
        if state.typing.get(user_id) != Some(&generation) {
            return;
        }
        state.typing.remove(user_id);
        self.announce_stopped_typing(clients, &state, user_id, room_id)
            .await;
    }

    /// Explicit stop from the client; clears the indicator ahead of the TTL.
    pub async fn stop_typing(
        &self,
        clients: &ClientRegistry,
        user_id: &UserId,
        room_id: &RoomId,
    ) {
        let Some(room) = self.get_room(room_id).await else {
            return;
        };
        let mut state = room.lock().await;
        if state.typing.remove(user_id).is_none() {
            return;
        }
        self.announce_stopped_typing(clients, &state, user_id, room_id)
            .await;
    }

    async fn announce_stopped_typing(
        &self,
        clients: &ClientRegistry,
        state: &RoomState,
        user_id: &UserId,
        room_id: &RoomId,
    ) {
        let others: Vec<UserId> = state
            .members
            .iter()
            .filter(|member| *member != user_id)
            .cloned()
            .collect();
        let event = Envelope::UserStoppedTyping {
            room_id: room_id.clone(),
            user_id: user_id.clone(),
        };
        if let Some(json) = encode_or_log(&event) {
            clients.send_to_users(&others, &json).await;
        }
    }

    /// Flip a user online on authentication and announce the change.
    pub async fn mark_online(&self, clients: &ClientRegistry, user_id: &UserId, now: i64) {
        {
            let mut presence = self.presence.lock().await;
            presence.insert(
                user_id.clone(),
                PresenceRecord {
                    status: PresenceStatus::Online,
                    last_seen: now,
                },
            );
        }
        let event = Envelope::UserStatusChange {
            user_id: user_id.clone(),
            status: PresenceStatus::Online,
            last_seen: now,
        };
        if let Some(json) = encode_or_log(&event) {
            clients.broadcast_except_user(user_id, &json).await;
        }
    }

    pub async fn presence_of(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.presence.lock().await.get(user_id).copied()
    }

    /// Cleanup for a closed connection: when it was the user's last one,
    /// leave every room they were in and announce them offline.
    pub async fn handle_disconnect(
        &self,
        clients: &ClientRegistry,
        user_id: &UserId,
        now: i64,
    ) {
        if clients.user_connection_count(user_id).await > 0 {
            // another device is still connected
            return;
        }
        for room_id in self.rooms_of(user_id).await {
            self.leave_room(clients, user_id, &room_id, now).await;
        }
        {
            let mut presence = self.presence.lock().await;
            presence.insert(
                user_id.clone(),
                PresenceRecord {
                    status: PresenceStatus::Offline,
                    last_seen: now,
                },
            );
        }
        let event = Envelope::UserStatusChange {
            user_id: user_id.clone(),
            status: PresenceStatus::Offline,
            last_seen: now,
        };
        if let Some(json) = encode_or_log(&event) {
            clients.broadcast_except_user(user_id, &json).await;
        }
        tracing::info!("'{}' is offline", user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ClientHandle;
    use tokio::sync::mpsc;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn room(id: &str) -> RoomId {
        RoomId::new(id).unwrap()
    }

    async fn connect(
        clients: &ClientRegistry,
        id: &str,
    ) -> mpsc::UnboundedReceiver<String> {
        let (sender, receiver) = mpsc::unbounded_channel();
        clients
            .register(
                renraku_shared::ids::ConnectionId::generate(),
                ClientHandle {
                    user_id: user(id),
                    sender,
                    connected_at: 1000,
                },
            )
            .await;
        receiver
    }

    fn decode_all(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(Envelope::decode(&json).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_join_then_leave_restores_membership() {
        // テスト項目: join_room 後に leave_room すると参加前の状態に戻る
        // given (前提条件):
        let registry = RoomRegistry::new(Duration::from_secs(5));
        let clients = ClientRegistry::new();
        let _alice_rx = connect(&clients, "alice").await;
        let job = room("job-1");

        // when (操作):
        let members = registry
            .join_room(&clients, &user("alice"), &job, 1000)
            .await;
        assert_eq!(members, vec![user("alice")]);
        let removed = registry
            .leave_room(&clients, &user("alice"), &job, 2000)
            .await;

        // then (期待する結果):
        assert!(removed);
        assert!(registry.members_of(&job).await.is_empty());
        // 空になった部屋はスナップショットから消える
        assert!(registry.room_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent_and_silent() {
        // テスト項目: 再 join は no-op で、既存メンバーに通知されない
        // given (前提条件):
        let registry = RoomRegistry::new(Duration::from_secs(5));
        let clients = ClientRegistry::new();
        let _alice_rx = connect(&clients, "alice").await;
        let mut bob_rx = connect(&clients, "bob").await;
        let job = room("job-1");
        registry.join_room(&clients, &user("alice"), &job, 1000).await;
        registry.join_room(&clients, &user("bob"), &job, 1000).await;
        decode_all(&mut bob_rx);

        // when (操作): alice がもう一度 join する
        let members = registry
            .join_room(&clients, &user("alice"), &job, 2000)
            .await;

        // then (期待する結果): メンバーは変わらず、bob への通知もない
        assert_eq!(members, vec![user("alice"), user("bob")]);
        assert!(decode_all(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_join_announces_to_existing_members_only() {
        // テスト項目: join の通知は既存メンバーのみに届く
        // given (前提条件):
        let registry = RoomRegistry::new(Duration::from_secs(5));
        let clients = ClientRegistry::new();
        let mut alice_rx = connect(&clients, "alice").await;
        let mut bob_rx = connect(&clients, "bob").await;
        let job = room("job-1");
        registry.join_room(&clients, &user("alice"), &job, 1000).await;
        decode_all(&mut alice_rx);

        // when (操作):
        registry.join_room(&clients, &user("bob"), &job, 2000).await;

        // then (期待する結果):
        let to_alice = decode_all(&mut alice_rx);
        assert_eq!(
            to_alice,
            vec![Envelope::UserJoinedRoom {
                room_id: job.clone(),
                user_id: user("bob"),
                timestamp: 2000,
            }]
        );
        // 参加者自身には user_joined_room は届かない
        assert!(decode_all(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_typing_expires_after_ttl_with_one_stop_event() {
        // テスト項目: stop_typing なしの typing は TTL 後に 1 回だけ停止通知される
        // given (前提条件): 50ms TTL
        let registry = Arc::new(RoomRegistry::new(Duration::from_millis(50)));
        let clients = Arc::new(ClientRegistry::new());
        let _alice_rx = connect(&clients, "alice").await;
        let mut bob_rx = connect(&clients, "bob").await;
        let job = room("job-1");
        registry.join_room(&clients, &user("alice"), &job, 1000).await;
        registry.join_room(&clients, &user("bob"), &job, 1000).await;
        decode_all(&mut bob_rx);

        // when (操作): alice がタイピングし、TTL の倍以上待つ
        registry.typing(&clients, &user("alice"), &job).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // then (期待する結果): user_typing 1 回、user_stopped_typing ちょうど 1 回
        let to_bob = decode_all(&mut bob_rx);
        assert_eq!(
            to_bob,
            vec![
                Envelope::UserTyping {
                    room_id: job.clone(),
                    user_id: user("alice"),
                },
                Envelope::UserStoppedTyping {
                    room_id: job.clone(),
                    user_id: user("alice"),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_explicit_stop_prevents_ttl_announcement() {
        // テスト項目: 明示的な stop_typing 後は TTL タイマーが何もしない
        // given (前提条件):
        let registry = Arc::new(RoomRegistry::new(Duration::from_millis(50)));
        let clients = Arc::new(ClientRegistry::new());
        let _alice_rx = connect(&clients, "alice").await;
        let mut bob_rx = connect(&clients, "bob").await;
        let job = room("job-1");
        registry.join_room(&clients, &user("alice"), &job, 1000).await;
        registry.join_room(&clients, &user("bob"), &job, 1000).await;
        decode_all(&mut bob_rx);

        // when (操作): typing → 即 stop_typing → TTL 経過
        registry.typing(&clients, &user("alice"), &job).await;
        registry.stop_typing(&clients, &user("alice"), &job).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // then (期待する結果): 停止通知は明示分の 1 回だけ
        let stops = decode_all(&mut bob_rx)
            .into_iter()
            .filter(|e| matches!(e, Envelope::UserStoppedTyping { .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_typing_refresh_outlives_the_first_timer() {
        // テスト項目: TTL 内の再 typing で停止通知が 1 回に集約される
        // given (前提条件):
        let registry = Arc::new(RoomRegistry::new(Duration::from_millis(80)));
        let clients = Arc::new(ClientRegistry::new());
        let _alice_rx = connect(&clients, "alice").await;
        let mut bob_rx = connect(&clients, "bob").await;
        let job = room("job-1");
        registry.join_room(&clients, &user("alice"), &job, 1000).await;
        registry.join_room(&clients, &user("bob"), &job, 1000).await;
        decode_all(&mut bob_rx);

        // when (操作): 40ms おきに 2 回 typing、その後 TTL 経過
        registry.typing(&clients, &user("alice"), &job).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        registry.typing(&clients, &user("alice"), &job).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // then (期待する結果): 停止通知はちょうど 1 回
        let stops = decode_all(&mut bob_rx)
            .into_iter()
            .filter(|e| matches!(e, Envelope::UserStoppedTyping { .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_all_rooms_and_goes_offline() {
        // テスト項目: 切断でプレゼンスが offline になり全部屋から退出する
        // given (前提条件): alice は接続を閉じ済み (登録なし)
        let registry = Arc::new(RoomRegistry::new(Duration::from_secs(5)));
        let clients = Arc::new(ClientRegistry::new());
        let mut bob_rx = connect(&clients, "bob").await;
        let job1 = room("job-1");
        let job2 = room("job-2");
        registry.join_room(&clients, &user("alice"), &job1, 1000).await;
        registry.join_room(&clients, &user("alice"), &job2, 1000).await;
        registry.join_room(&clients, &user("bob"), &job1, 1000).await;
        registry.mark_online(&clients, &user("alice"), 1000).await;
        decode_all(&mut bob_rx);

        // when (操作):
        registry
            .handle_disconnect(&clients, &user("alice"), 5000)
            .await;

        // then (期待する結果):
        assert_eq!(registry.members_of(&job1).await, vec![user("bob")]);
        assert!(registry.members_of(&job2).await.is_empty());
        assert_eq!(
            registry.presence_of(&user("alice")).await,
            Some(PresenceRecord {
                status: PresenceStatus::Offline,
                last_seen: 5000,
            })
        );
        let to_bob = decode_all(&mut bob_rx);
        assert!(to_bob.contains(&Envelope::UserLeftRoom {
            room_id: job1.clone(),
            user_id: user("alice"),
            timestamp: 5000,
        }));
        assert!(to_bob.contains(&Envelope::UserStatusChange {
            user_id: user("alice"),
            status: PresenceStatus::Offline,
            last_seen: 5000,
        }));
    }

    #[tokio::test]
    async fn test_disconnect_with_remaining_device_keeps_membership() {
        // テスト項目: 他デバイスが残っている切断では退出もオフラインもしない
        // given (前提条件): alice の接続が 1 本残っている
        let registry = Arc::new(RoomRegistry::new(Duration::from_secs(5)));
        let clients = Arc::new(ClientRegistry::new());
        let _alice_rx = connect(&clients, "alice").await;
        let job = room("job-1");
        registry.join_room(&clients, &user("alice"), &job, 1000).await;
        registry.mark_online(&clients, &user("alice"), 1000).await;

        // when (操作):
        registry
            .handle_disconnect(&clients, &user("alice"), 5000)
            .await;

        // then (期待する結果):
        assert_eq!(registry.members_of(&job).await, vec![user("alice")]);
        assert_eq!(
            registry.presence_of(&user("alice")).await,
            Some(PresenceRecord {
                status: PresenceStatus::Online,
                last_seen: 1000,
            })
        );
    }
}
