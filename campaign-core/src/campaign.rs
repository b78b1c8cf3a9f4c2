//! Campaign state: the single unit of persistence, owned exclusively by
//! the master agent.
//!
//! All mutation funnels through [`CampaignState::merge`], which applies a
//! concluded scene's deltas atomically: the delta is validated against a
//! scratch copy and swapped in whole, so a mid-merge failure leaves the
//! state identical to its pre-merge snapshot.

use crate::compressor::Summary;
use crate::history::SceneId;
use crate::plan::{BeatTransition, PlanError, StoryPlan};
use crate::world::{EntityKind, EntityRecord, WorldState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current campaign state version, written into every save.
pub const CAMPAIGN_VERSION: u32 = 1;

/// Errors from merging a scene delta.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("no open thread with index {index}")]
    UnknownThread { index: usize },

    #[error("scene {scene_id} was already merged")]
    DuplicateScene { scene_id: SceneId },

    /// A merge was attempted for a scene that is not the live one:
    /// either a stale agent concluding late or a concurrent merge.
    #[error("conflicting merge attempt for scene {scene_id}")]
    MergeConflict { scene_id: SceneId },
}

/// A dangling narrative question. Append-only; resolution flips the
/// flag, never deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenThread {
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
}

impl OpenThread {
    /// Create an unresolved thread stamped now.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            created_at: Utc::now(),
            resolved: false,
        }
    }
}

/// The archival record of one concluded scene. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub scene_id: SceneId,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub summary: Summary,
    /// Reference to the full turn transcript, which compression never
    /// touches.
    pub transcript_ref: String,
}

/// Everything a concluded scene merges back into the campaign.
#[derive(Debug, Clone)]
pub struct SceneDelta {
    pub record: SceneRecord,
    /// World-state updates, applied by unique name, last-write-wins.
    pub world_upserts: Vec<(EntityKind, EntityRecord)>,
    /// At most one beat status change per scene.
    pub beat_transition: Option<BeatTransition>,
    pub new_threads: Vec<String>,
    /// Indices into the campaign's open-thread list to mark resolved.
    pub resolved_threads: Vec<usize>,
}

/// Free-form lines the save parser recognized a home for but could not
/// interpret. Preserved verbatim so `load → save` round-trips
/// annotations made by other tools or by hand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionExtras {
    pub metadata: Vec<String>,
    pub world: Vec<String>,
    pub plan: Vec<String>,
    pub scenes: Vec<String>,
    pub threads: Vec<String>,
}

impl SectionExtras {
    /// Whether anything was preserved.
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
            && self.world.is_empty()
            && self.plan.is_empty()
            && self.scenes.is_empty()
            && self.threads.is_empty()
    }
}

/// The complete persistent state of one campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignState {
    pub version: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_played_at: DateTime<Utc>,
    pub world: WorldState,
    pub plan: StoryPlan,
    /// Append-only; records are never edited after a scene concludes.
    pub scene_history: Vec<SceneRecord>,
    pub open_threads: Vec<OpenThread>,
    /// Unrecognized save content carried through round-trips.
    pub preserved: SectionExtras,
}

impl CampaignState {
    /// Create a fresh campaign at version 1.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: CAMPAIGN_VERSION,
            name: name.into(),
            created_at: now,
            last_played_at: now,
            world: WorldState::new(),
            plan: StoryPlan::new(),
            scene_history: Vec::new(),
            open_threads: Vec::new(),
            preserved: SectionExtras::default(),
        }
    }

    /// Apply a concluded scene's deltas atomically.
    ///
    /// Either every delta applies, or none do: on any validation failure
    /// the state is left byte-identical to its pre-merge snapshot.
    pub fn merge(&mut self, delta: SceneDelta) -> Result<(), MergeError> {
        if self
            .scene_history
            .iter()
            .any(|r| r.scene_id == delta.record.scene_id)
        {
            return Err(MergeError::DuplicateScene {
                scene_id: delta.record.scene_id,
            });
        }

        // Stage everything on a scratch copy; swap in only on success.
        let mut next = self.clone();

        for (kind, record) in delta.world_upserts {
            next.world.upsert(kind, record);
        }

        if let Some(transition) = delta.beat_transition {
            next.plan.transition(transition.order, transition.status)?;
        }

        for index in delta.resolved_threads {
            next.open_threads
                .get_mut(index)
                .ok_or(MergeError::UnknownThread { index })?
                .resolved = true;
        }

        for text in delta.new_threads {
            next.open_threads.push(OpenThread::new(text));
        }

        next.scene_history.push(delta.record);
        next.last_played_at = Utc::now();

        *self = next;
        Ok(())
    }

    /// Unresolved open threads.
    pub fn unresolved_threads(&self) -> impl Iterator<Item = &OpenThread> {
        self.open_threads.iter().filter(|t| !t.resolved)
    }
}
