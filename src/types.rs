use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::quiplash::GameState;
use crate::validation::Payload;

/// A seat in a room. Owned by the room; every other view borrows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub name: String,
    pub room_code: String,
    pub score: u32,
    pub is_connected: bool,
    /// Transport session currently bound to this seat.
    #[serde(skip)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameType {
    #[serde(rename = "quiplash")]
    Quiplash,
    #[serde(rename = "game-1")]
    Game1,
    #[serde(rename = "game-2")]
    Game2,
    #[serde(rename = "game-3")]
    Game3,
    #[serde(rename = "game-4")]
    Game4,
}

impl GameType {
    /// Every type but Quiplash only collects answers and ballots.
    pub fn is_open(self) -> bool {
        self != Self::Quiplash
    }
}

impl std::fmt::Display for GameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Quiplash => "quiplash",
            Self::Game1 => "game-1",
            Self::Game2 => "game-2",
            Self::Game3 => "game-3",
            Self::Game4 => "game-4",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Lobby,
    /// Open games: answers and ballots are collected with no round flow.
    Prompt,
    Submit,
    Vote,
    Results,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub id: String,
    pub text: String,
    pub assigned_player_ids: Vec<String>,
}

/// An answer typed by a player for the current round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub player_id: String,
    pub player_name: String,
    pub data: Payload,
    pub timestamp: u64,
}

/// A ballot. In Quiplash `data` is the id of the player voted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub player_id: String,
    pub player_name: String,
    pub data: Payload,
    pub timestamp: u64,
}

/// The broadcast shape of a room's game: game fields plus the room's own roster.
#[derive(Debug, Serialize)]
pub struct GameView<'a> {
    #[serde(flatten)]
    pub game: &'a GameState,
    pub players: &'a [Player],
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_code: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_code: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub room_code: String,
    pub game_type: GameType,
}

/// Submission or vote; `data` is raw JSON until it has been sanitized.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub room_code: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Events sent from controllers and displays.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "display:join")]
    DisplayJoin(RoomRef),
    #[serde(rename = "player:join")]
    PlayerJoin(JoinRequest),
    #[serde(rename = "game:start")]
    GameStart(StartRequest),
    #[serde(rename = "player:submit")]
    PlayerSubmit(ActionRequest),
    #[serde(rename = "player:vote")]
    PlayerVote(ActionRequest),
    #[serde(rename = "game:next-round")]
    NextRound(RoomRef),
    #[serde(rename = "ping")]
    Ping,
}

/// Events sent to clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent<'a> {
    #[serde(rename = "game:state-update")]
    StateUpdate(GameView<'a>),
    #[serde(rename = "player:joined")]
    PlayerJoined(&'a Player),
    #[serde(rename = "player:error")]
    Error { message: String },
    #[serde(rename = "pong")]
    Pong,
}

impl ServerEvent<'_> {
    /// Serialize once so the same frame can be fanned out to every subscriber.
    pub fn encode(&self) -> Option<Arc<str>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::from(json)),
            Err(err) => {
                tracing::error!(error = %err, "failed to encode server event");
                None
            }
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_use_type_and_payload_envelope() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"player:join","payload":{"roomCode":"ABCD","name":"Alice"}}"#,
        )
        .unwrap();
        match event {
            ClientEvent::PlayerJoin(req) => {
                assert_eq!(req.room_code, "ABCD");
                assert_eq!(req.name, "Alice");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"game:start","payload":{"roomCode":"ABCD","gameType":"quiplash"}}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::GameStart(StartRequest { game_type: GameType::Quiplash, .. })));

        let event: ClientEvent = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Ping));
    }

    #[test]
    fn open_game_types_decode() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"game:start","payload":{"roomCode":"ABCD","gameType":"game-1"}}"#,
        )
        .unwrap();
        let ClientEvent::GameStart(req) = event else {
            panic!("expected a start");
        };
        assert_eq!(req.game_type, GameType::Game1);
        assert!(req.game_type.is_open());
        assert!(!GameType::Quiplash.is_open());
        assert_eq!(GameType::Game4.to_string(), "game-4");
        assert_eq!(serde_json::to_value(Phase::Prompt).unwrap(), "prompt");
    }

    #[test]
    fn unknown_game_type_is_rejected() {
        let parsed = serde_json::from_str::<ClientEvent>(
            r#"{"type":"game:start","payload":{"roomCode":"ABCD","gameType":"chess"}}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn missing_action_data_defaults_to_null() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"player:vote","payload":{"roomCode":"ABCD"}}"#).unwrap();
        let ClientEvent::PlayerVote(req) = event else {
            panic!("expected a vote");
        };
        assert!(req.data.is_null());
    }

    #[test]
    fn player_connection_is_not_serialized() {
        let player = Player {
            id: "p1".into(),
            name: "Alice".into(),
            room_code: "ABCD".into(),
            score: 100,
            is_connected: true,
            connection_id: Some("socket".into()),
        };
        let json = serde_json::to_value(&player).unwrap();
        assert_eq!(json["roomCode"], "ABCD");
        assert_eq!(json["isConnected"], true);
        assert!(json.get("connectionId").is_none());

        let frame = ServerEvent::PlayerJoined(&player).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "player:joined");
        assert_eq!(value["payload"]["id"], "p1");
    }
}
