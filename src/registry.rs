//! Process-wide index of live rooms.
//!
//! The map itself only holds [`RoomHandle`]s; every room's state lives in its own
//! task (see [`crate::room`]). Storage sits behind [`RoomStore`] so the in-memory
//! map can be replaced without touching the connection layer.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::archive::Archive;
use crate::error::GameError;
use crate::room::{GameSettings, Room, RoomCommand, RoomEvent, RoomSummary};
use crate::validation::RoomCode;

pub const DEFAULT_CODE_ATTEMPTS: usize = 100;

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Why a request to a room task did not produce a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// The room task has stopped, usually because it was evicted.
    Closed,
    TimedOut,
}

/// Cloneable address of a running room task.
#[derive(Clone)]
pub struct RoomHandle {
    pub code: RoomCode,
    pub id: String,
    cmd_tx: mpsc::Sender<RoomCommand>,
    event_tx: broadcast::Sender<RoomEvent>,
    summary: watch::Receiver<RoomSummary>,
}

impl RoomHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.event_tx.subscribe()
    }

    /// Latest snapshot published by the room task.
    pub fn summary(&self) -> RoomSummary {
        self.summary.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Fire-and-forget; returns false if the room is gone.
    pub async fn notify(&self, command: RoomCommand) -> bool {
        self.cmd_tx.send(command).await.is_ok()
    }

    /// Send a command and wait for its reply.
    pub async fn request<T>(
        &self,
        timeout: Duration,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RequestError> {
        let (reply, rx) = oneshot::channel();
        let exchange = async {
            self.cmd_tx
                .send(make(reply))
                .await
                .map_err(|_| RequestError::Closed)?;
            rx.await.map_err(|_| RequestError::Closed)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| RequestError::TimedOut)?
    }
}

/// Storage for the code → room index.
pub trait RoomStore: Send + Sync {
    fn get(&self, code: &RoomCode) -> Option<RoomHandle>;
    fn set(&self, code: RoomCode, handle: RoomHandle);
    fn has(&self, code: &RoomCode) -> bool;
    fn remove(&self, code: &RoomCode) -> Option<RoomHandle>;
    /// Remove only if `pred` holds for the stored handle.
    fn remove_if(&self, code: &RoomCode, pred: &dyn Fn(&RoomHandle) -> bool) -> bool;
    fn list(&self) -> Vec<RoomHandle>;
    fn entries(&self) -> Vec<(RoomCode, RoomHandle)>;
    fn size(&self) -> usize;
    /// Atomic lookup-or-insert; `make` runs at most once, only when the code is vacant.
    fn get_or_insert_with(
        &self,
        code: RoomCode,
        make: &mut dyn FnMut(&RoomCode) -> RoomHandle,
    ) -> RoomHandle;
    /// Insert only when vacant; `None` if the code is taken.
    fn insert_if_absent(
        &self,
        code: RoomCode,
        make: &mut dyn FnMut(&RoomCode) -> RoomHandle,
    ) -> Option<RoomHandle>;
}

#[derive(Default)]
pub struct MemoryRoomStore {
    rooms: DashMap<RoomCode, RoomHandle>,
}

impl RoomStore for MemoryRoomStore {
    fn get(&self, code: &RoomCode) -> Option<RoomHandle> {
        self.rooms.get(code).map(|entry| entry.value().clone())
    }

    fn set(&self, code: RoomCode, handle: RoomHandle) {
        self.rooms.insert(code, handle);
    }

    fn has(&self, code: &RoomCode) -> bool {
        self.rooms.contains_key(code)
    }

    fn remove(&self, code: &RoomCode) -> Option<RoomHandle> {
        self.rooms.remove(code).map(|(_, handle)| handle)
    }

    fn remove_if(&self, code: &RoomCode, pred: &dyn Fn(&RoomHandle) -> bool) -> bool {
        self.rooms.remove_if(code, |_, handle| pred(handle)).is_some()
    }

    fn list(&self) -> Vec<RoomHandle> {
        self.rooms.iter().map(|entry| entry.value().clone()).collect()
    }

    fn entries(&self) -> Vec<(RoomCode, RoomHandle)> {
        self.rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn size(&self) -> usize {
        self.rooms.len()
    }

    fn get_or_insert_with(
        &self,
        code: RoomCode,
        make: &mut dyn FnMut(&RoomCode) -> RoomHandle,
    ) -> RoomHandle {
        match self.rooms.entry(code) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let handle = make(entry.key());
                entry.insert(handle.clone());
                handle
            }
        }
    }

    fn insert_if_absent(
        &self,
        code: RoomCode,
        make: &mut dyn FnMut(&RoomCode) -> RoomHandle,
    ) -> Option<RoomHandle> {
        match self.rooms.entry(code) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let handle = make(entry.key());
                entry.insert(handle.clone());
                Some(handle)
            }
        }
    }
}

/// Registry holds all live rooms and spawns their tasks.
pub struct Registry {
    store: Box<dyn RoomStore>,
    settings: Arc<GameSettings>,
    archive: Archive,
}

impl Registry {
    pub fn new(settings: GameSettings, archive: Archive) -> Arc<Self> {
        Self::with_store(Box::new(MemoryRoomStore::default()), settings, archive)
    }

    pub fn with_store(store: Box<dyn RoomStore>, settings: GameSettings, archive: Archive) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings: Arc::new(settings),
            archive,
        })
    }

    pub fn get(&self, code: &RoomCode) -> Option<RoomHandle> {
        self.store.get(code)
    }

    pub fn contains(&self, code: &RoomCode) -> bool {
        self.store.has(code)
    }

    pub fn entries(&self) -> Vec<(RoomCode, RoomHandle)> {
        self.store.entries()
    }

    pub fn len(&self) -> usize {
        self.store.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Existing room for `code`, or a freshly spawned one.
    pub fn get_or_create(self: &Arc<Self>, code: &RoomCode) -> RoomHandle {
        let handle = self
            .store
            .get_or_insert_with(code.clone(), &mut |code: &RoomCode| self.spawn_room(code));
        if !handle.is_closed() {
            return handle;
        }

        warn!(room = %code, id = %handle.id, "replacing room whose task has stopped");
        let stale = handle.id;
        self.store.remove_if(code, &|h: &RoomHandle| h.id == stale);
        self.store
            .get_or_insert_with(code.clone(), &mut |code: &RoomCode| self.spawn_room(code))
    }

    /// New room under a random code not currently in use.
    pub fn create_unique(self: &Arc<Self>, max_attempts: usize) -> Result<RoomHandle, GameError> {
        self.create_unique_with(max_attempts, || RoomCode::generate(&mut rand::rng()))
    }

    pub fn create_unique_with(
        self: &Arc<Self>,
        max_attempts: usize,
        mut next_code: impl FnMut() -> RoomCode,
    ) -> Result<RoomHandle, GameError> {
        for _ in 0..max_attempts {
            let code = next_code();
            if let Some(handle) = self
                .store
                .insert_if_absent(code, &mut |code: &RoomCode| self.spawn_room(code))
            {
                info!(room = %handle.code, id = %handle.id, "room created");
                return Ok(handle);
            }
        }
        warn!(attempts = max_attempts, "room code space exhausted");
        Err(GameError::CodeGenerationExhausted {
            attempts: max_attempts,
        })
    }

    /// Drop `code` from the index if it still points at room `id`.
    pub fn evict(&self, code: &RoomCode, id: &str) -> bool {
        self.store.remove_if(code, &|handle: &RoomHandle| handle.id == id)
    }

    fn spawn_room(self: &Arc<Self>, code: &RoomCode) -> RoomHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

        let room = Room::new(
            code.clone(),
            self.settings.clone(),
            event_tx.clone(),
            self.archive.clone(),
        );
        let (summary_tx, summary_rx) = watch::channel(room.summary());

        let handle = RoomHandle {
            code: code.clone(),
            id: room.id.clone(),
            cmd_tx,
            event_tx,
            summary: summary_rx,
        };

        tokio::spawn(crate::room::run(room, cmd_rx, summary_tx, Arc::clone(self)));
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{RoomStatus, SweepPolicy};
    use crate::session::SessionManager;
    use crate::types::GameType;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(1);

    fn registry() -> Arc<Registry> {
        Registry::new(GameSettings::default(), Archive::disabled())
    }

    fn code(raw: &str) -> RoomCode {
        RoomCode::parse(raw).unwrap()
    }

    /// A handle to a room that never answers; keep the receiver alive to hold the channel open.
    fn stalled(code: RoomCode) -> (RoomHandle, mpsc::Receiver<RoomCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let room = Room::new(
            code.clone(),
            Arc::new(GameSettings::default()),
            event_tx.clone(),
            Archive::disabled(),
        );
        let (_, summary) = watch::channel(room.summary());
        let handle = RoomHandle {
            code,
            id: room.id,
            cmd_tx,
            event_tx,
            summary,
        };
        (handle, cmd_rx)
    }

    async fn sweep_now(handle: &RoomHandle) -> Result<bool, RequestError> {
        handle
            .request(WAIT, |reply| RoomCommand::Sweep {
                now: Instant::now() + Duration::from_secs(3 * 60 * 60),
                policy: SweepPolicy::default(),
                reply,
            })
            .await
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = registry();
        let a = registry.get_or_create(&code("ABCD"));
        let b = registry.get_or_create(&code("ABCD"));
        let c = registry.get_or_create(&code("WXYZ"));

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&code("ABCD")));
    }

    #[tokio::test]
    async fn create_unique_skips_taken_codes() {
        let registry = registry();
        registry.get_or_create(&code("AAAA"));

        let mut candidates = vec![code("BBBB"), code("AAAA"), code("AAAA")];
        let handle = registry
            .create_unique_with(5, || candidates.pop().unwrap())
            .unwrap();
        assert_eq!(handle.code, code("BBBB"));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn create_unique_gives_up() {
        let registry = registry();
        registry.get_or_create(&code("AAAA"));

        let err = registry
            .create_unique_with(3, || code("AAAA"))
            .err()
            .unwrap();
        assert_eq!(err, GameError::CodeGenerationExhausted { attempts: 3 });
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn generated_codes_are_live_and_distinct() {
        let registry = registry();
        let a = registry.create_unique(DEFAULT_CODE_ATTEMPTS).unwrap();
        let b = registry.create_unique(DEFAULT_CODE_ATTEMPTS).unwrap();
        assert_ne!(a.code, b.code);
        assert_eq!(a.summary().status, RoomStatus::Waiting);
    }

    #[tokio::test]
    async fn summary_follows_commands() {
        let registry = registry();
        let handle = registry.get_or_create(&code("ABCD"));

        let player = handle
            .request(WAIT, |reply| RoomCommand::JoinPlayer {
                connection_id: "c1".into(),
                name: "Alice".into(),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(player.name, "Alice");

        let summary = handle.summary();
        assert_eq!(summary.player_count, 1);
        assert_eq!(summary.connected_players, 1);
    }

    #[tokio::test]
    async fn evicted_room_stops_and_is_replaced() {
        let registry = registry();
        let handle = registry.get_or_create(&code("ABCD"));

        assert_eq!(sweep_now(&handle).await, Ok(true));
        assert!(!registry.contains(&code("ABCD")));
        assert_eq!(sweep_now(&handle).await, Err(RequestError::Closed));

        let fresh = registry.get_or_create(&code("ABCD"));
        assert_ne!(fresh.id, handle.id);
    }

    #[tokio::test]
    async fn occupied_room_refuses_eviction() {
        let registry = registry();
        let handle = registry.get_or_create(&code("ABCD"));
        handle
            .request(WAIT, |reply| RoomCommand::JoinDisplay {
                connection_id: "tv".into(),
                reply,
            })
            .await
            .unwrap();

        assert_eq!(sweep_now(&handle).await, Ok(false));
        assert!(registry.contains(&code("ABCD")));
    }

    #[tokio::test]
    async fn evict_ignores_a_replaced_room() {
        let registry = registry();
        let handle = registry.get_or_create(&code("ABCD"));
        assert!(!registry.evict(&code("ABCD"), "some-other-id"));
        assert!(registry.evict(&code("ABCD"), &handle.id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (handle, _commands) = stalled(code("ABCD"));
        let result = handle
            .request(Duration::from_millis(20), |reply| RoomCommand::NextRound { reply })
            .await;
        assert_eq!(result, Err(RequestError::TimedOut));
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn session_manager_maps_timeouts() {
        let (handle, _commands) = stalled(code("ABCD"));
        let store = MemoryRoomStore::default();
        store.set(code("ABCD"), handle);
        let registry = Registry::with_store(Box::new(store), GameSettings::default(), Archive::disabled());
        let sessions = SessionManager::new(registry, Duration::from_millis(20));

        let err = sessions.join_as_player("c1", "ABCD", "Alice").await.err();
        assert_eq!(err, Some(GameError::JoinTimeout));
        assert!(sessions.session("c1").is_none());

        let err = sessions.join_as_display("tv", "ABCD").await.err();
        assert_eq!(err, Some(GameError::JoinTimeout));

        assert_eq!(sessions.next_round("ABCD").await, Err(GameError::CommandTimeout));
        assert_eq!(
            sessions.start_game("ABCD", GameType::Quiplash).await,
            Err(GameError::CommandTimeout)
        );
    }

    #[tokio::test]
    async fn memory_store_operations() {
        let registry = registry();
        let handle = registry.get_or_create(&code("ABCD"));

        let store = MemoryRoomStore::default();
        assert!(!store.has(&code("ABCD")));
        store.set(code("ABCD"), handle.clone());
        assert!(store.has(&code("ABCD")));
        assert_eq!(store.size(), 1);
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.entries()[0].0, code("ABCD"));
        assert_eq!(store.get(&code("ABCD")).map(|h| h.id), Some(handle.id.clone()));

        let mut made = 0;
        let existing = store.get_or_insert_with(code("ABCD"), &mut |_: &RoomCode| {
            made += 1;
            handle.clone()
        });
        assert_eq!(existing.id, handle.id);
        assert_eq!(made, 0);
        assert!(store.insert_if_absent(code("ABCD"), &mut |_: &RoomCode| handle.clone()).is_none());

        assert!(store.remove(&code("ABCD")).is_some());
        assert!(store.remove(&code("ABCD")).is_none());
        assert_eq!(store.size(), 0);
    }
}
