//! Conversational turns and the per-agent history buffer.
//!
//! Every agent (the master agent and each live scene agent) owns exactly
//! one `HistoryBuffer`. Turns are immutable once appended and must arrive
//! in strictly increasing timestamp order.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from history buffer operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("turn timestamp {attempted} is not after the last turn at {last}")]
    InvalidTurnOrder {
        last: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
}

/// Unique identifier for an interaction segment (a scene).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneId(Uuid);

impl SceneId {
    /// Create a new unique scene ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a scene ID from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SceneId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SceneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who spoke a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Player,
    Narrator,
    Npc,
}

impl TurnRole {
    /// Display name for transcripts and context rendering.
    pub fn name(&self) -> &'static str {
        match self {
            TurnRole::Player => "Player",
            TurnRole::Narrator => "Narrator",
            TurnRole::Npc => "NPC",
        }
    }
}

/// A single conversational turn. Immutable once appended to a buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub scene_id: SceneId,
}

impl Turn {
    /// Create a turn with an explicit timestamp.
    pub fn new(
        role: TurnRole,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        scene_id: SceneId,
    ) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
            scene_id,
        }
    }

    /// Player turn stamped with the current time.
    pub fn player(content: impl Into<String>, scene_id: SceneId) -> Self {
        Self::new(TurnRole::Player, content, Utc::now(), scene_id)
    }

    /// Narrator turn stamped with the current time.
    pub fn narrator(content: impl Into<String>, scene_id: SceneId) -> Self {
        Self::new(TurnRole::Narrator, content, Utc::now(), scene_id)
    }

    /// NPC turn stamped with the current time.
    pub fn npc(content: impl Into<String>, scene_id: SceneId) -> Self {
        Self::new(TurnRole::Npc, content, Utc::now(), scene_id)
    }
}

/// Rough token estimate, ~4 characters per token.
pub fn approx_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Ordered append-only log of turns for one interaction segment.
///
/// The buffer tracks an estimated token cost so the compressor can cheaply
/// decide when the active context view has outgrown its budget. Consumers
/// other than the owning agent only ever see `snapshot()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryBuffer {
    turns: Vec<Turn>,
    cost: usize,
}

impl HistoryBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn, enforcing strictly increasing timestamps.
    ///
    /// On failure the buffer is left unchanged.
    pub fn append(&mut self, turn: Turn) -> Result<(), HistoryError> {
        if let Some(last) = self.turns.last() {
            if turn.timestamp <= last.timestamp {
                return Err(HistoryError::InvalidTurnOrder {
                    last: last.timestamp,
                    attempted: turn.timestamp,
                });
            }
        }
        self.cost += approx_tokens(&turn.content);
        self.turns.push(turn);
        Ok(())
    }

    /// Estimated token cost of everything currently buffered.
    pub fn cost(&self) -> usize {
        self.cost
    }

    /// Read-only ordered view of the buffered turns.
    pub fn snapshot(&self) -> &[Turn] {
        &self.turns
    }

    /// Number of buffered turns.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether the buffer holds no turns.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// A timestamp guaranteed to satisfy `append` ordering: the current
    /// time, nudged forward when the clock has not advanced since the
    /// last turn.
    pub fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.turns.last() {
            Some(last) if now <= last.timestamp => last.timestamp + Duration::microseconds(1),
            _ => now,
        }
    }

    /// Remove and return the first `n` turns.
    ///
    /// Compaction primitive for the owning agent: the compressor replaces
    /// the drained prefix with a summary in the active context view. The
    /// archival transcript is kept elsewhere and is never touched.
    pub fn drain_prefix(&mut self, n: usize) -> Vec<Turn> {
        let n = n.min(self.turns.len());
        let drained: Vec<Turn> = self.turns.drain(..n).collect();
        for turn in &drained {
            self.cost = self.cost.saturating_sub(approx_tokens(&turn.content));
        }
        drained
    }
}
