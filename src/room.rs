use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::{Archive, ArchiveRecord};
use crate::error::GameError;
use crate::quiplash::{GameState, QuiplashConfig, RoundScored};
use crate::registry::Registry;
use crate::types::{GameType, GameView, Phase, Player, ServerEvent, now_millis};
use crate::validation::{Payload, RoomCode};

/// Tuning shared by every room in the process.
#[derive(Debug, Clone)]
pub struct GameSettings {
    pub quiplash: QuiplashConfig,
    pub prompts: Vec<String>,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            quiplash: QuiplashConfig::default(),
            prompts: crate::quiplash::DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// When an abandoned room may be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    pub idle_timeout: Duration,
    /// Extra grace on top of `idle_timeout` so an in-flight join is never raced.
    pub buffer: Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            buffer: Duration::from_secs(60),
        }
    }
}

/// Commands the connection layer sends to a room task.
#[derive(Debug)]
pub enum RoomCommand {
    JoinDisplay {
        connection_id: String,
        reply: oneshot::Sender<()>,
    },
    JoinPlayer {
        connection_id: String,
        name: String,
        reply: oneshot::Sender<Player>,
    },
    Disconnect {
        connection_id: String,
    },
    StartGame {
        game_type: GameType,
        reply: oneshot::Sender<()>,
    },
    Submit {
        connection_id: String,
        payload: Payload,
        reply: oneshot::Sender<Result<(), GameError>>,
    },
    Vote {
        connection_id: String,
        payload: Payload,
        reply: oneshot::Sender<Result<(), GameError>>,
    },
    NextRound {
        reply: oneshot::Sender<()>,
    },
    Sweep {
        now: Instant,
        policy: SweepPolicy,
        reply: oneshot::Sender<bool>,
    },
}

/// Frames fanned out from a room to its subscribed connections.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Deliver to every connection in the room.
    Broadcast { payload: Arc<str> },
    /// Deliver to one connection only.
    SendTo { connection_id: String, payload: Arc<str> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Finished,
}

/// Read-only snapshot of a room, published after every command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub code: RoomCode,
    pub status: RoomStatus,
    pub created_at: u64,
    pub player_count: usize,
    pub connected_players: usize,
    pub has_display: bool,
    pub phase: Phase,
    pub current_round: u32,
    #[serde(skip)]
    pub last_activity: Instant,
}

/// A live room. The only owner of its roster.
pub struct Room {
    pub code: RoomCode,
    pub id: String,
    pub players: Vec<Player>,
    pub game: GameState,
    pub display_connection_id: Option<String>,
    pub last_activity: Instant,
    pub created_at: u64,
    settings: Arc<GameSettings>,
    events: broadcast::Sender<RoomEvent>,
    archive: Archive,
}

impl Room {
    pub fn new(
        code: RoomCode,
        settings: Arc<GameSettings>,
        events: broadcast::Sender<RoomEvent>,
        archive: Archive,
    ) -> Self {
        Self {
            game: GameState::lobby(code.as_str()),
            code,
            id: Uuid::new_v4().to_string(),
            players: Vec::new(),
            display_connection_id: None,
            last_activity: Instant::now(),
            created_at: now_millis(),
            settings,
            events,
            archive,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// The broadcast view: game fields plus this room's roster, never a copy held elsewhere.
    pub fn view(&self) -> GameView<'_> {
        GameView {
            game: &self.game,
            players: &self.players,
        }
    }

    /// Push the full current state to every subscriber.
    pub fn broadcast_state(&self) {
        if let Some(payload) = ServerEvent::StateUpdate(self.view()).encode() {
            let _ = self.events.send(RoomEvent::Broadcast { payload });
        }
    }

    fn send_to(&self, connection_id: &str, event: ServerEvent<'_>) {
        if let Some(payload) = event.encode() {
            let _ = self.events.send(RoomEvent::SendTo {
                connection_id: connection_id.to_string(),
                payload,
            });
        }
    }

    /// Seat bound to a live connection.
    fn seat(&self, connection_id: &str) -> Option<&Player> {
        self.players
            .iter()
            .find(|p| p.is_connected && p.connection_id.as_deref() == Some(connection_id))
    }

    /// Register the shared screen and give it the current state right away.
    pub fn join_display(&mut self, connection_id: &str) {
        if let Some(previous) = self.display_connection_id.replace(connection_id.to_string()) {
            if previous != connection_id {
                debug!(room = %self.code, %previous, "display replaced");
            }
        }
        self.send_to(connection_id, ServerEvent::StateUpdate(self.view()));
        info!(room = %self.code, connection = %connection_id, "display joined");
    }

    /// Seat a player by sanitized name. A known name takes its old seat back.
    pub fn join_player(&mut self, connection_id: &str, name: &str) -> Player {
        for other in self
            .players
            .iter_mut()
            .filter(|p| p.name != name && p.connection_id.as_deref() == Some(connection_id))
        {
            other.is_connected = false;
            other.connection_id = None;
        }

        let player = match self.players.iter_mut().find(|p| p.name == name) {
            Some(existing) => {
                existing.connection_id = Some(connection_id.to_string());
                existing.is_connected = true;
                info!(room = %self.code, player = %existing.id, "player reconnected");
                existing.clone()
            }
            None => {
                let player = Player {
                    id: Uuid::new_v4().to_string(),
                    name: name.to_string(),
                    room_code: self.code.to_string(),
                    score: 0,
                    is_connected: true,
                    connection_id: Some(connection_id.to_string()),
                };
                self.players.push(player.clone());
                info!(room = %self.code, player = %player.id, "player joined");
                player
            }
        };

        self.broadcast_state();
        self.send_to(connection_id, ServerEvent::PlayerJoined(&player));
        player
    }

    /// Mark whatever this connection held as gone. Seats and scores stay.
    pub fn disconnect(&mut self, connection_id: &str) {
        let seat = self
            .players
            .iter_mut()
            .find(|p| p.connection_id.as_deref() == Some(connection_id));
        if let Some(player) = seat {
            player.is_connected = false;
            player.connection_id = None;
            info!(room = %self.code, player = %player.id, "player disconnected");
            self.broadcast_state();
        }

        if self.display_connection_id.as_deref() == Some(connection_id) {
            self.display_connection_id = None;
            info!(room = %self.code, "display disconnected");
        }
    }

    /// Begin a game with the current roster. Cumulative scores carry over.
    pub fn start_game<R: Rng + ?Sized>(&mut self, game_type: GameType, rng: &mut R) {
        self.game = if game_type.is_open() {
            GameState::open(self.code.as_str(), game_type)
        } else {
            GameState::initialize(
                self.code.as_str(),
                &self.players,
                &self.settings.quiplash,
                &self.settings.prompts,
                rng,
            )
        };
        info!(room = %self.code, %game_type, players = self.players.len(), "game started");
        self.broadcast_state();

        self.archive.record(ArchiveRecord::GameStarted {
            room_code: self.code.to_string(),
            game_type,
            total_rounds: (!game_type.is_open()).then_some(self.settings.quiplash.rounds_per_game),
            state: self.snapshot(),
            at: now_millis(),
        });
    }

    fn playing_open_game(&self) -> bool {
        self.game.game_type.is_some_and(GameType::is_open)
    }

    pub fn submit(&mut self, connection_id: &str, payload: &Payload) -> Result<(), GameError> {
        let (player_id, player_name) = self
            .seat(connection_id)
            .map(|p| (p.id.clone(), p.name.clone()))
            .ok_or(GameError::PlayerNotInRoom)?;

        let before = self.game.submissions.len();
        self.game = if self.playing_open_game() {
            self.game
                .record_submission(&self.players, &player_id, &player_name, payload, now_millis())
        } else {
            let text = payload
                .submission_text()
                .ok_or(GameError::InvalidPayload("submission"))?;
            self.game.apply_submission(
                &self.players,
                &player_id,
                &player_name,
                text,
                &self.settings.quiplash,
                now_millis(),
            )
        };
        self.broadcast_state();

        if self.game.submissions.len() > before {
            self.archive.record(ArchiveRecord::Submission {
                room_code: self.code.to_string(),
                round: self.game.current_round,
                prompt: self.game.prompt_for(&player_id).map(|p| p.text.clone()),
                player_name,
                content: payload.clone(),
                at: now_millis(),
            });
        } else {
            debug!(room = %self.code, player = %player_id, "submission ignored");
        }
        Ok(())
    }

    pub fn vote(&mut self, connection_id: &str, payload: &Payload) -> Result<(), GameError> {
        let (voter_id, voter_name) = self
            .seat(connection_id)
            .map(|p| (p.id.clone(), p.name.clone()))
            .ok_or(GameError::PlayerNotInRoom)?;

        let before = self.game.votes.len();
        if self.playing_open_game() {
            self.game = self
                .game
                .record_vote(&self.players, &voter_id, &voter_name, payload, now_millis());
        } else {
            let voted_for = payload.vote_target().ok_or(GameError::InvalidPayload("vote"))?;
            let previous = self.game.phase;
            let transition = self.game.apply_vote(
                &self.players,
                &voter_id,
                &voter_name,
                voted_for,
                &self.settings.quiplash,
                now_millis(),
            );
            self.game = transition.state;
            if let Some(scored) = &transition.scored {
                self.apply_round_scores(previous, scored);
            }
        }
        self.broadcast_state();

        if self.game.votes.len() > before {
            self.archive.record(ArchiveRecord::Vote {
                room_code: self.code.to_string(),
                round: self.game.current_round,
                voter_name,
                ballot: payload.clone(),
                at: now_millis(),
            });
        } else {
            debug!(room = %self.code, voter = %voter_id, "vote ignored");
        }
        Ok(())
    }

    pub fn next_round<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let before = self.game.current_round;
        self.game = self.game.advance_round(
            &self.players,
            &self.settings.quiplash,
            &self.settings.prompts,
            rng,
        );
        self.broadcast_state();

        if self.game.current_round == before {
            return;
        }
        info!(room = %self.code, round = self.game.current_round, "round advanced");
        self.archive.record(ArchiveRecord::RoundAdvanced {
            room_code: self.code.to_string(),
            current_round: self.game.current_round,
            state: self.snapshot(),
            at: now_millis(),
        });
    }

    /// Add a round's points to the roster; only valid on the vote → results edge.
    fn apply_round_scores(&mut self, previous: Phase, scored: &RoundScored) {
        if previous != Phase::Vote || self.game.phase != Phase::Results {
            warn!(room = %self.code, ?previous, current = ?self.game.phase, "refusing to apply scores off the results edge");
            return;
        }
        for player in &mut self.players {
            if let Some(points) = scored.results.get(&player.id) {
                player.score = player.score.saturating_add(*points);
            }
        }
        info!(room = %self.code, round = scored.round, "round scored");
    }

    /// Idle past timeout plus buffer, no connected players and no display.
    pub fn is_evictable(&self, now: Instant, policy: &SweepPolicy) -> bool {
        let idle = now.saturating_duration_since(self.last_activity);
        idle > policy.idle_timeout + policy.buffer
            && self.players.iter().all(|p| !p.is_connected)
            && self.display_connection_id.is_none()
    }

    pub fn summary(&self) -> RoomSummary {
        let status = if self.game.phase == Phase::Lobby {
            RoomStatus::Waiting
        } else if self.game.is_finished(&self.settings.quiplash) {
            RoomStatus::Finished
        } else {
            RoomStatus::Playing
        };

        RoomSummary {
            id: self.id.clone(),
            code: self.code.clone(),
            status,
            created_at: self.created_at,
            player_count: self.players.len(),
            connected_players: self.players.iter().filter(|p| p.is_connected).count(),
            has_display: self.display_connection_id.is_some(),
            phase: self.game.phase,
            current_round: self.game.current_round,
            last_activity: self.last_activity,
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self.view()).unwrap_or_default()
    }

    /// Apply one command, returning the reply owed to its sender.
    fn handle(&mut self, command: RoomCommand) -> Option<Reply> {
        match command {
            RoomCommand::JoinDisplay { connection_id, reply } => {
                self.join_display(&connection_id);
                Some(Reply::Done(reply))
            }
            RoomCommand::JoinPlayer { connection_id, name, reply } => {
                let player = self.join_player(&connection_id, &name);
                Some(Reply::Joined(reply, player))
            }
            RoomCommand::Disconnect { connection_id } => {
                self.disconnect(&connection_id);
                None
            }
            RoomCommand::StartGame { game_type, reply } => {
                self.start_game(game_type, &mut rand::rng());
                Some(Reply::Done(reply))
            }
            RoomCommand::Submit { connection_id, payload, reply } => {
                let outcome = self.submit(&connection_id, &payload);
                Some(Reply::Outcome(reply, outcome))
            }
            RoomCommand::Vote { connection_id, payload, reply } => {
                let outcome = self.vote(&connection_id, &payload);
                Some(Reply::Outcome(reply, outcome))
            }
            RoomCommand::NextRound { reply } => {
                self.next_round(&mut rand::rng());
                Some(Reply::Done(reply))
            }
            RoomCommand::Sweep { reply, .. } => {
                let _ = reply.send(false);
                None
            }
        }
    }
}

/// A reply held back until the room summary reflects the command.
enum Reply {
    Done(oneshot::Sender<()>),
    Joined(oneshot::Sender<Player>, Player),
    Outcome(oneshot::Sender<Result<(), GameError>>, Result<(), GameError>),
}

impl Reply {
    /// Best effort; a caller that gave up waiting is fine.
    fn send(self) {
        match self {
            Reply::Done(tx) => {
                let _ = tx.send(());
            }
            Reply::Joined(tx, player) => {
                let _ = tx.send(player);
            }
            Reply::Outcome(tx, outcome) => {
                let _ = tx.send(outcome);
            }
        }
    }
}

/// The room task: one command at a time, so no locks are needed around room state.
pub(crate) async fn run(
    mut room: Room,
    mut commands: mpsc::Receiver<RoomCommand>,
    summary: watch::Sender<RoomSummary>,
    registry: Arc<Registry>,
) {
    while let Some(command) = commands.recv().await {
        if let RoomCommand::Sweep { now, policy, reply } = command {
            let evicted = room.is_evictable(now, &policy) && registry.evict(&room.code, &room.id);
            let _ = reply.send(evicted);
            if evicted {
                info!(room = %room.code, "cleaned up idle room");
                break;
            }
            continue;
        }

        room.touch();
        let reply = room.handle(command);
        summary.send_replace(room.summary());
        if let Some(reply) = reply {
            reply.send();
        }
    }

    debug!(room = %room.code, "room task ended");
}
