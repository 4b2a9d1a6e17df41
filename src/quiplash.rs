//! Quip Clash round logic.
//!
//! Every function here is a pure transition: it reads the current [`GameState`]
//! and the owning room's roster and returns the next state. Nothing in this
//! module mutates players. Scores earned in a round come back as a
//! [`RoundScored`] value that the room applies to its roster exactly once.

use std::collections::BTreeMap;

use rand::Rng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

use crate::types::{GameType, Phase, Player, Prompt, Submission, Vote};
use crate::validation::Payload;

/// Built-in prompt pool used when no custom pool is configured.
pub const DEFAULT_PROMPTS: [&str; 20] = [
    "A terrible name for a pet rock",
    "The worst thing to say on a first date",
    "A bad slogan for a funeral home",
    "The last thing you want to hear from your dentist",
    "A terrible superhero name",
    "The worst birthday present ever",
    "A horrible tattoo idea",
    "The last thing you want to find in your soup",
    "A terrible name for a gym",
    "The worst excuse for being late",
    "A bad place to take a nap",
    "The worst thing to yell in a library",
    "A terrible name for a band",
    "The last thing you want your pilot to say",
    "A horrible baby name",
    "The worst thing to bring to a picnic",
    "A terrible wedding vow",
    "The last thing you want to hear at the doctor's office",
    "A bad name for a restaurant",
    "The worst pickup line ever",
];

/// Points earned by each player in a single round, keyed by player id.
pub type RoundResults = BTreeMap<String, u32>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuiplashConfig {
    pub rounds_per_game: u32,
    /// Seconds.
    pub submission_time_limit: u32,
    /// Seconds.
    pub voting_time_limit: u32,
    pub points_per_vote: u32,
}

impl Default for QuiplashConfig {
    fn default() -> Self {
        Self {
            rounds_per_game: 3,
            submission_time_limit: 60,
            voting_time_limit: 30,
            points_per_vote: 100,
        }
    }
}

/// Game progress for one room. The roster is deliberately absent; see [`crate::types::GameView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub room_code: String,
    pub game_type: Option<GameType>,
    pub current_round: u32,
    pub phase: Phase,
    pub prompts: Vec<Prompt>,
    pub submissions: Vec<Submission>,
    pub votes: Vec<Vote>,
    pub round_results: RoundResults,
    pub time_remaining: Option<u32>,
}

/// Scores the owning room must add to its roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundScored {
    pub round: u32,
    pub results: RoundResults,
}

/// Result of [`GameState::apply_vote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: GameState,
    /// Present only on the vote → results edge.
    pub scored: Option<RoundScored>,
}

impl GameState {
    /// The idle state of a room with no game running.
    pub fn lobby(room_code: &str) -> Self {
        Self {
            room_code: room_code.to_string(),
            game_type: None,
            current_round: 0,
            phase: Phase::Lobby,
            prompts: Vec::new(),
            submissions: Vec::new(),
            votes: Vec::new(),
            round_results: RoundResults::new(),
            time_remaining: None,
        }
    }

    /// Round one, straight into the submit phase.
    pub fn initialize<R: Rng + ?Sized>(
        room_code: &str,
        roster: &[Player],
        config: &QuiplashConfig,
        pool: &[String],
        rng: &mut R,
    ) -> Self {
        Self {
            room_code: room_code.to_string(),
            game_type: Some(GameType::Quiplash),
            current_round: 1,
            phase: Phase::Submit,
            prompts: prompts_for_round(roster, 1, pool, rng),
            submissions: Vec::new(),
            votes: Vec::new(),
            round_results: RoundResults::new(),
            time_remaining: Some(config.submission_time_limit),
        }
    }

    /// An open game: round one, collecting answers and ballots with no round flow or scoring.
    pub fn open(room_code: &str, game_type: GameType) -> Self {
        Self {
            game_type: Some(game_type),
            current_round: 1,
            phase: Phase::Prompt,
            ..Self::lobby(room_code)
        }
    }

    /// Keeps the first answer of each seated player in an open game.
    pub fn record_submission(
        &self,
        roster: &[Player],
        player_id: &str,
        player_name: &str,
        data: &Payload,
        timestamp: u64,
    ) -> Self {
        if self.phase != Phase::Prompt
            || !in_roster(roster, player_id)
            || self.submissions.iter().any(|s| s.player_id == player_id)
        {
            return self.clone();
        }

        let mut next = self.clone();
        next.submissions.push(Submission {
            player_id: player_id.to_string(),
            player_name: player_name.to_string(),
            data: data.clone(),
            timestamp,
        });
        next
    }

    /// Keeps the first ballot of each seated player in an open game.
    pub fn record_vote(
        &self,
        roster: &[Player],
        voter_id: &str,
        voter_name: &str,
        data: &Payload,
        timestamp: u64,
    ) -> Self {
        if self.phase != Phase::Prompt
            || !in_roster(roster, voter_id)
            || self.votes.iter().any(|v| v.player_id == voter_id)
        {
            return self.clone();
        }

        let mut next = self.clone();
        next.votes.push(Vote {
            player_id: voter_id.to_string(),
            player_name: voter_name.to_string(),
            data: data.clone(),
            timestamp,
        });
        next
    }

    /// Records an answer. Repeats, unknown players and wrong-phase calls leave the state as is.
    pub fn apply_submission(
        &self,
        roster: &[Player],
        player_id: &str,
        player_name: &str,
        text: &str,
        config: &QuiplashConfig,
        timestamp: u64,
    ) -> Self {
        if self.phase != Phase::Submit
            || !in_roster(roster, player_id)
            || self.submissions.iter().any(|s| s.player_id == player_id)
        {
            return self.clone();
        }

        let mut next = self.clone();
        next.submissions.push(Submission {
            player_id: player_id.to_string(),
            player_name: player_name.to_string(),
            data: Payload::Text(text.to_string()),
            timestamp,
        });

        if next.submissions.len() >= roster.len() {
            next.phase = Phase::Vote;
            next.time_remaining = Some(config.voting_time_limit);
        }
        next
    }

    /// Records a ballot and scores the round once everyone has voted.
    ///
    /// Self-votes, votes for ids outside the roster and second votes are ignored.
    pub fn apply_vote(
        &self,
        roster: &[Player],
        voter_id: &str,
        voter_name: &str,
        voted_for: &str,
        config: &QuiplashConfig,
        timestamp: u64,
    ) -> Transition {
        let unchanged = || Transition {
            state: self.clone(),
            scored: None,
        };

        if self.phase != Phase::Vote
            || voter_id == voted_for
            || !in_roster(roster, voter_id)
            || !in_roster(roster, voted_for)
            || self.votes.iter().any(|v| v.player_id == voter_id)
        {
            return unchanged();
        }

        let mut next = self.clone();
        next.votes.push(Vote {
            player_id: voter_id.to_string(),
            player_name: voter_name.to_string(),
            data: Payload::Text(voted_for.to_string()),
            timestamp,
        });

        if next.votes.len() < roster.len() {
            return Transition {
                state: next,
                scored: None,
            };
        }

        let results = score_round(&next.votes, roster, config.points_per_vote);
        next.phase = Phase::Results;
        next.round_results = results.clone();
        Transition {
            scored: Some(RoundScored {
                round: next.current_round,
                results,
            }),
            state: next,
        }
    }

    /// Moves to the next round, or holds the final results once the last round is done.
    pub fn advance_round<R: Rng + ?Sized>(
        &self,
        roster: &[Player],
        config: &QuiplashConfig,
        pool: &[String],
        rng: &mut R,
    ) -> Self {
        if matches!(self.phase, Phase::Lobby | Phase::Prompt) {
            return self.clone();
        }

        if self.current_round >= config.rounds_per_game {
            let mut last = self.clone();
            last.phase = Phase::Results;
            return last;
        }

        let round = self.current_round + 1;
        Self {
            room_code: self.room_code.clone(),
            game_type: self.game_type,
            current_round: round,
            phase: Phase::Submit,
            prompts: prompts_for_round(roster, round, pool, rng),
            submissions: Vec::new(),
            votes: Vec::new(),
            round_results: RoundResults::new(),
            time_remaining: Some(config.submission_time_limit),
        }
    }

    /// True once the final round has been scored.
    pub fn is_finished(&self, config: &QuiplashConfig) -> bool {
        self.phase == Phase::Results && self.current_round >= config.rounds_per_game
    }

    pub fn prompt_for(&self, player_id: &str) -> Option<&Prompt> {
        self.prompts
            .iter()
            .find(|p| p.assigned_player_ids.iter().any(|id| id == player_id))
    }
}

/// `points_per_vote` for every ballot received; players with no votes get an explicit 0.
pub fn score_round(votes: &[Vote], roster: &[Player], points_per_vote: u32) -> RoundResults {
    let mut scores: RoundResults = roster.iter().map(|p| (p.id.clone(), 0)).collect();
    for vote in votes {
        if let Some(points) = vote.data.vote_target().and_then(|id| scores.get_mut(id)) {
            *points += points_per_vote;
        }
    }
    scores
}

fn in_roster(roster: &[Player], player_id: &str) -> bool {
    roster.iter().any(|p| p.id == player_id)
}

/// One prompt per player, drawn without replacement; starts a new pass if the pool runs dry.
fn prompts_for_round<R: Rng + ?Sized>(
    roster: &[Player],
    round: u32,
    pool: &[String],
    rng: &mut R,
) -> Vec<Prompt> {
    if pool.is_empty() {
        return Vec::new();
    }

    let mut picks = Vec::with_capacity(roster.len());
    while picks.len() < roster.len() {
        let amount = (roster.len() - picks.len()).min(pool.len());
        picks.extend(index::sample(rng, pool.len(), amount).into_iter());
    }

    roster
        .iter()
        .zip(picks)
        .enumerate()
        .map(|(i, (player, pick))| Prompt {
            id: format!("round-{round}-prompt-{i}"),
            text: pool[pick].clone(),
            assigned_player_ids: vec![player.id.clone()],
        })
        .collect()
}
