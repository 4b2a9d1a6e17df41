//! Who is connected where, and the per-socket event dispatcher.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GameError;
use crate::registry::{Registry, RequestError, RoomHandle};
use crate::room::{RoomCommand, RoomEvent};
use crate::types::{ClientEvent, GameType, Player, ServerEvent};
use crate::validation::{Payload, RoomCode, sanitize_payload, sanitize_player_name};

/// A closed room is replaced on the next lookup, so one retry is enough.
const JOIN_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Display,
    Player { player_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub room_code: RoomCode,
    pub role: Role,
}

impl Session {
    fn same_place(&self, room_code: &RoomCode, display: bool) -> bool {
        &self.room_code == room_code && matches!(self.role, Role::Display) == display
    }
}

/// A successful join: the room, a subscription opened before the join was sent, and the outcome.
pub struct Joined<T> {
    pub handle: RoomHandle,
    pub events: broadcast::Receiver<RoomEvent>,
    pub outcome: T,
}

pub struct SessionManager {
    registry: Arc<Registry>,
    sessions: DashMap<String, Session>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(registry: Arc<Registry>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sessions: DashMap::new(),
            timeout,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn session(&self, connection_id: &str) -> Option<Session> {
        self.sessions.get(connection_id).map(|s| s.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn join_as_display(&self, connection_id: &str, raw_code: &str) -> Result<Joined<()>, GameError> {
        let code = RoomCode::parse(raw_code)?;
        self.leave_previous(connection_id, &code, true).await;

        let joined = self
            .join(&code, |reply| RoomCommand::JoinDisplay {
                connection_id: connection_id.to_string(),
                reply,
            })
            .await?;

        self.sessions.insert(
            connection_id.to_string(),
            Session {
                room_code: code,
                role: Role::Display,
            },
        );
        Ok(joined)
    }

    /// Validates both inputs before any room is created or touched. Lowercase codes are accepted here.
    pub async fn join_as_player(
        &self,
        connection_id: &str,
        raw_code: &str,
        raw_name: &str,
    ) -> Result<Joined<Player>, GameError> {
        let code = RoomCode::parse_lenient(raw_code)?;
        let name = sanitize_player_name(raw_name)?;
        self.leave_previous(connection_id, &code, false).await;

        let joined = self
            .join(&code, |reply| RoomCommand::JoinPlayer {
                connection_id: connection_id.to_string(),
                name: name.clone(),
                reply,
            })
            .await?;

        self.sessions.insert(
            connection_id.to_string(),
            Session {
                room_code: code,
                role: Role::Player {
                    player_id: joined.outcome.id.clone(),
                },
            },
        );
        Ok(joined)
    }

    async fn join<T>(
        &self,
        code: &RoomCode,
        make: impl Fn(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<Joined<T>, GameError> {
        for _ in 0..JOIN_ATTEMPTS {
            let handle = self.registry.get_or_create(code);
            let events = handle.subscribe();
            match handle.request(self.timeout, &make).await {
                Ok(outcome) => {
                    return Ok(Joined {
                        handle,
                        events,
                        outcome,
                    });
                }
                Err(RequestError::Closed) => {
                    debug!(room = %code, "room closed during join; retrying");
                }
                Err(RequestError::TimedOut) => return Err(GameError::JoinTimeout),
            }
        }
        Err(GameError::JoinTimeout)
    }

    /// Release whatever this connection held elsewhere before it takes a new place.
    async fn leave_previous(&self, connection_id: &str, code: &RoomCode, display: bool) {
        let Some(previous) = self.session(connection_id) else {
            return;
        };
        if previous.same_place(code, display) {
            return;
        }
        debug!(connection = %connection_id, room = %previous.room_code, "leaving previous room");
        self.sessions.remove(connection_id);
        self.notify_disconnect(connection_id, &previous.room_code).await;
    }

    pub async fn handle_disconnect(&self, connection_id: &str) {
        if let Some((_, session)) = self.sessions.remove(connection_id) {
            self.notify_disconnect(connection_id, &session.room_code).await;
        }
    }

    async fn notify_disconnect(&self, connection_id: &str, code: &RoomCode) {
        if let Some(handle) = self.registry.get(code) {
            handle
                .notify(RoomCommand::Disconnect {
                    connection_id: connection_id.to_string(),
                })
                .await;
        }
    }

    pub async fn start_game(&self, raw_code: &str, game_type: GameType) -> Result<(), GameError> {
        self.command(raw_code, |reply| RoomCommand::StartGame { game_type, reply })
            .await
    }

    pub async fn submit(&self, connection_id: &str, raw_code: &str, payload: Payload) -> Result<(), GameError> {
        self.command(raw_code, |reply| RoomCommand::Submit {
            connection_id: connection_id.to_string(),
            payload,
            reply,
        })
        .await?
    }

    pub async fn vote(&self, connection_id: &str, raw_code: &str, payload: Payload) -> Result<(), GameError> {
        self.command(raw_code, |reply| RoomCommand::Vote {
            connection_id: connection_id.to_string(),
            payload,
            reply,
        })
        .await?
    }

    pub async fn next_round(&self, raw_code: &str) -> Result<(), GameError> {
        self.command(raw_code, |reply| RoomCommand::NextRound { reply })
            .await
    }

    /// Commands other than joins only reach rooms that already exist.
    async fn command<T>(
        &self,
        raw_code: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, GameError> {
        let code = RoomCode::parse(raw_code)?;
        let handle = self.registry.get(&code).ok_or(GameError::RoomNotFound)?;
        handle.request(self.timeout, make).await.map_err(|err| match err {
            RequestError::Closed => GameError::RoomNotFound,
            RequestError::TimedOut => GameError::CommandTimeout,
        })
    }
}

/// One client socket: decodes frames, drives the session manager and forwards room events.
pub struct Connection {
    id: String,
    sessions: Arc<SessionManager>,
    outbound: mpsc::UnboundedSender<Arc<str>>,
    following: Option<(String, JoinHandle<()>)>,
}

impl Connection {
    pub fn new(sessions: Arc<SessionManager>, outbound: mpsc::UnboundedSender<Arc<str>>) -> Self {
        let id = Uuid::new_v4().to_string();
        info!(connection = %id, "connection opened");
        Self {
            id,
            sessions,
            outbound,
            following: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.handle(event).await,
            Err(err) => {
                debug!(connection = %self.id, error = %err, "unreadable frame");
                self.reply_error(GameError::InvalidPayload("message").to_string());
            }
        }
    }

    pub async fn handle(&mut self, event: ClientEvent) {
        if let Err(err) = self.dispatch(event).await {
            debug!(connection = %self.id, error = %err, "request rejected");
            self.reply_error(err.to_string());
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<(), GameError> {
        let sessions = Arc::clone(&self.sessions);
        match event {
            ClientEvent::DisplayJoin(req) => {
                let joined = sessions.join_as_display(&self.id, &req.room_code).await?;
                self.follow(&joined.handle, joined.events);
            }
            ClientEvent::PlayerJoin(req) => {
                let joined = sessions
                    .join_as_player(&self.id, &req.room_code, &req.name)
                    .await?;
                self.follow(&joined.handle, joined.events);
            }
            ClientEvent::GameStart(req) => {
                sessions.start_game(&req.room_code, req.game_type).await?;
            }
            ClientEvent::PlayerSubmit(req) => {
                let payload = sanitize_payload(&req.data, "submission")?;
                sessions.submit(&self.id, &req.room_code, payload).await?;
            }
            ClientEvent::PlayerVote(req) => {
                let payload = sanitize_payload(&req.data, "vote")?;
                sessions.vote(&self.id, &req.room_code, payload).await?;
            }
            ClientEvent::NextRound(req) => {
                sessions.next_round(&req.room_code).await?;
            }
            ClientEvent::Ping => self.send(ServerEvent::Pong),
        }
        Ok(())
    }

    /// Forward a room's events to this socket. Rejoining the same room keeps the current forwarder.
    fn follow(&mut self, handle: &RoomHandle, mut events: broadcast::Receiver<RoomEvent>) {
        if let Some((room_id, _)) = &self.following {
            if *room_id == handle.id {
                return;
            }
        }
        if let Some((_, task)) = self.following.take() {
            task.abort();
        }

        let id = self.id.clone();
        let outbound = self.outbound.clone();
        let task = tokio::spawn(async move {
            loop {
                let payload = match events.recv().await {
                    Ok(RoomEvent::Broadcast { payload }) => payload,
                    Ok(RoomEvent::SendTo { connection_id, payload }) if connection_id == id => payload,
                    Ok(RoomEvent::SendTo { .. }) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection = %id, skipped, "connection lagged behind room events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if outbound.send(payload).is_err() {
                    break;
                }
            }
        });
        self.following = Some((handle.id.clone(), task));
    }

    fn send(&self, event: ServerEvent<'_>) {
        if let Some(payload) = event.encode() {
            let _ = self.outbound.send(payload);
        }
    }

    fn reply_error(&self, message: String) {
        self.send(ServerEvent::Error { message });
    }

    /// Stop forwarding and release the seat or display slot.
    pub async fn close(mut self) {
        if let Some((_, task)) = self.following.take() {
            task.abort();
        }
        self.sessions.handle_disconnect(&self.id).await;
        info!(connection = %self.id, "connection closed");
    }
}
