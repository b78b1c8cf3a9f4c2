//! The master agent: sole owner of campaign state and orchestrator of
//! scene agents.
//!
//! The master walks `Uninitialized → Planning → Active ⇄ Paused →
//! Archived`. While `Active` it loops: spawn a scene agent, forward
//! play, receive the concluding outcome, merge it atomically, persist.
//! The merge is the sole durability boundary; an aborted scene leaves no
//! trace.

use crate::campaign::{CampaignState, MergeError, SceneDelta, SceneRecord};
use crate::collab::{ContextWindow, Summarizer};
use crate::compressor::{
    CompressError, CompressionPolicy, Compressor, Summary, SummarySpan, Verdict,
};
use crate::history::{HistoryBuffer, HistoryError, SceneId, Turn, TurnRole};
use crate::persist::{PersistError, Resume, SaveDir};
use crate::scene::{SceneAgent, SceneError, SceneKind, SceneOutcome, SceneSeed};
use crate::world::{EntityKind, EntityRecord};
use std::path::PathBuf;
use thiserror::Error;

/// Turns kept verbatim when the campaign-level buffer is compacted.
const COMPACT_KEEP_TAIL: usize = 2;

/// Errors from master agent operations.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error("operation requires the {expected:?} phase, campaign is {actual:?}")]
    WrongPhase {
        expected: CampaignPhase,
        actual: CampaignPhase,
    },

    #[error("scene {0} is already live")]
    SceneInProgress(SceneId),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Compress(#[from] CompressError),

    #[error(transparent)]
    Scene(#[from] SceneError),
}

/// Campaign lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignPhase {
    Uninitialized,
    Planning,
    Active,
    Paused,
    /// Terminal: the campaign is complete and rejects further mutation.
    Archived,
}

/// Configuration for a master agent.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Directory save files and transcripts live in.
    pub save_dir: PathBuf,
    /// Compression thresholds shared with spawned scenes.
    pub policy: CompressionPolicy,
    /// Persist automatically after every concluded scene.
    pub autosave: bool,
}

impl MasterConfig {
    /// Config with default policy and autosave enabled.
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
            policy: CompressionPolicy::default(),
            autosave: true,
        }
    }

    /// Override the compression policy.
    pub fn with_policy(mut self, policy: CompressionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable or disable autosave on scene conclusion.
    pub fn with_autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Errors from the planning session.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("planning is already complete")]
    AlreadyComplete,

    #[error("answer cannot be empty")]
    EmptyAnswer,

    #[error("campaign name is required")]
    MissingName,

    #[error("a premise is required")]
    MissingPremise,

    #[error("an opening location is required")]
    MissingLocation,

    #[error("at least one story beat is required")]
    NoBeats,
}

/// The questions asked during planning, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanningStep {
    CampaignName,
    Premise,
    OpeningLocation,
    KeyNpc,
    StoryBeats,
    Complete,
}

/// Interactive, question-driven campaign setup.
///
/// Answers are consumed in a fixed order; `finish` validates that
/// everything required was provided and produces the initial campaign
/// state with its world seed and story plan.
#[derive(Debug, Clone, Default)]
pub struct PlanningSession {
    step: Option<PlanningStep>,
    name: Option<String>,
    premise: Option<String>,
    location: Option<EntityRecord>,
    npc: Option<EntityRecord>,
    beats: Vec<String>,
}

/// The finished planning output.
#[derive(Debug)]
pub struct PlanningOutcome {
    pub state: CampaignState,
    /// The campaign premise, kept as master-level context rather than
    /// persisted state.
    pub premise: String,
}

impl PlanningSession {
    /// Start a fresh session at the first question.
    pub fn new() -> Self {
        Self {
            step: Some(PlanningStep::CampaignName),
            ..Self::default()
        }
    }

    /// The current step.
    pub fn step(&self) -> PlanningStep {
        self.step.unwrap_or(PlanningStep::Complete)
    }

    /// The question to put to the player for the current step.
    pub fn current_question(&self) -> &'static str {
        match self.step() {
            PlanningStep::CampaignName => "What is the campaign called?",
            PlanningStep::Premise => "In a few sentences, what is the campaign about?",
            PlanningStep::OpeningLocation => {
                "Where does the story open? (name: description)"
            }
            PlanningStep::KeyNpc => {
                "Name one key NPC the players meet early (name: description, or 'none')"
            }
            PlanningStep::StoryBeats => {
                "List the opening story beats, separated by semicolons"
            }
            PlanningStep::Complete => "Planning is complete.",
        }
    }

    /// Whether every question has been answered.
    pub fn is_complete(&self) -> bool {
        self.step() == PlanningStep::Complete
    }

    /// Answer the current question and advance to the next.
    pub fn answer(&mut self, text: &str) -> Result<PlanningStep, PlanningError> {
        let text = text.trim();
        let step = self.step();
        if step == PlanningStep::Complete {
            return Err(PlanningError::AlreadyComplete);
        }
        if text.is_empty() && step != PlanningStep::KeyNpc {
            return Err(PlanningError::EmptyAnswer);
        }

        let next = match step {
            PlanningStep::CampaignName => {
                self.name = Some(text.to_string());
                PlanningStep::Premise
            }
            PlanningStep::Premise => {
                self.premise = Some(text.to_string());
                PlanningStep::OpeningLocation
            }
            PlanningStep::OpeningLocation => {
                self.location = Some(parse_named_answer(text));
                PlanningStep::KeyNpc
            }
            PlanningStep::KeyNpc => {
                if !text.is_empty() && !text.eq_ignore_ascii_case("none") {
                    self.npc = Some(parse_named_answer(text));
                }
                PlanningStep::StoryBeats
            }
            PlanningStep::StoryBeats => {
                self.beats = text
                    .split(|c| c == ';' || c == '\n')
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .map(str::to_string)
                    .collect();
                if self.beats.is_empty() {
                    return Err(PlanningError::NoBeats);
                }
                PlanningStep::Complete
            }
            PlanningStep::Complete => unreachable!("handled above"),
        };

        self.step = Some(next);
        Ok(next)
    }

    /// Validate the answers and build the initial campaign state.
    pub fn finish(self) -> Result<PlanningOutcome, PlanningError> {
        let name = self.name.ok_or(PlanningError::MissingName)?;
        let premise = self.premise.ok_or(PlanningError::MissingPremise)?;
        let location = self.location.ok_or(PlanningError::MissingLocation)?;
        if self.beats.is_empty() {
            return Err(PlanningError::NoBeats);
        }

        let mut state = CampaignState::new(name);
        state.world.upsert(EntityKind::Location, location);
        if let Some(npc) = self.npc {
            state.world.upsert(EntityKind::Npc, npc);
        }
        for beat in &self.beats {
            state.plan.push(beat);
        }
        state
            .plan
            .activate(1)
            .map_err(|_| PlanningError::NoBeats)?;

        Ok(PlanningOutcome { state, premise })
    }
}

/// Parse a `name: description` answer, falling back to a bare name.
fn parse_named_answer(text: &str) -> EntityRecord {
    match text.split_once(':') {
        Some((name, description)) => {
            EntityRecord::new(name.trim(), description.trim())
        }
        None => EntityRecord::new(text, ""),
    }
}

// ============================================================================
// Master agent
// ============================================================================

/// The persistent agent owning one campaign.
#[derive(Debug)]
pub struct MasterAgent {
    config: MasterConfig,
    phase: CampaignPhase,
    state: Option<CampaignState>,
    /// Campaign-level history: planning dialogue, between-scene notes,
    /// and folded scene summaries.
    buffer: HistoryBuffer,
    summaries: Vec<Summary>,
    compacted: usize,
    compressor: Compressor,
    saves: SaveDir,
    /// Stream id stamped onto campaign-level turns.
    stream: SceneId,
    live_scene: Option<SceneId>,
}

impl MasterAgent {
    /// Create an uninitialized master agent.
    pub fn new(config: MasterConfig) -> Self {
        let saves = SaveDir::new(config.save_dir.clone());
        let compressor = Compressor::new(config.policy.clone());
        Self {
            config,
            phase: CampaignPhase::Uninitialized,
            state: None,
            buffer: HistoryBuffer::new(),
            summaries: Vec::new(),
            compacted: 0,
            compressor,
            saves,
            stream: SceneId::new(),
            live_scene: None,
        }
    }

    /// Reconstruct an active master agent from loaded campaign state.
    pub fn restore(config: MasterConfig, state: CampaignState) -> Self {
        let mut master = Self::new(config);
        // Carry the latest scene summary forward as rolling context.
        if let Some(record) = state.scene_history.last() {
            master.summaries.push(record.summary.clone());
        }
        master.state = Some(state);
        master.phase = CampaignPhase::Active;
        master
    }

    /// Resume the most recent save for `campaign`, or return `None` when
    /// there is nothing to resume and the caller should plan afresh.
    pub async fn resume(
        config: MasterConfig,
        campaign: &str,
    ) -> Result<Option<Self>, MasterError> {
        let saves = SaveDir::new(config.save_dir.clone());
        match saves.resume(campaign).await? {
            Resume::Restored(state) => Ok(Some(Self::restore(config, state))),
            Resume::NoSaveFound => Ok(None),
        }
    }

    pub fn phase(&self) -> CampaignPhase {
        self.phase
    }

    /// The campaign state, once planning has produced one.
    pub fn state(&self) -> Option<&CampaignState> {
        self.state.as_ref()
    }

    /// The campaign-level buffer (read-only).
    pub fn buffer(&self) -> &HistoryBuffer {
        &self.buffer
    }

    /// Campaign-level summaries produced so far.
    pub fn summaries(&self) -> &[Summary] {
        &self.summaries
    }

    /// The currently live scene, if any.
    pub fn live_scene(&self) -> Option<SceneId> {
        self.live_scene
    }

    fn require_phase(&self, expected: CampaignPhase) -> Result<(), MasterError> {
        if self.phase != expected {
            return Err(MasterError::WrongPhase {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    fn state_ref(&self) -> Result<&CampaignState, MasterError> {
        self.state.as_ref().ok_or(MasterError::WrongPhase {
            expected: CampaignPhase::Active,
            actual: self.phase,
        })
    }

    /// Enter the planning phase and hand back its question session.
    pub fn begin_planning(&mut self) -> Result<PlanningSession, MasterError> {
        self.require_phase(CampaignPhase::Uninitialized)?;
        self.phase = CampaignPhase::Planning;
        Ok(PlanningSession::new())
    }

    /// Accept the finished planning session, producing the initial
    /// campaign state, and go active.
    pub async fn complete_planning(
        &mut self,
        session: PlanningSession,
    ) -> Result<(), MasterError> {
        self.require_phase(CampaignPhase::Planning)?;
        let outcome = session.finish()?;

        self.record_turn_internal(TurnRole::Narrator, outcome.premise)?;
        self.state = Some(outcome.state);
        self.phase = CampaignPhase::Active;

        if self.config.autosave {
            if let Some(state) = self.state.as_ref() {
                self.saves.save(state).await?;
            }
        }
        Ok(())
    }

    /// Record a campaign-level turn (planning dialogue or between-scene
    /// table talk). Timestamps are synthesized monotonically.
    pub fn record_turn(
        &mut self,
        role: TurnRole,
        content: impl Into<String>,
    ) -> Result<(), MasterError> {
        match self.phase {
            CampaignPhase::Planning | CampaignPhase::Active => {
                self.record_turn_internal(role, content)
            }
            _ => Err(MasterError::WrongPhase {
                expected: CampaignPhase::Active,
                actual: self.phase,
            }),
        }
    }

    fn record_turn_internal(
        &mut self,
        role: TurnRole,
        content: impl Into<String>,
    ) -> Result<(), MasterError> {
        let turn = Turn::new(role, content, self.buffer.next_timestamp(), self.stream);
        self.buffer.append(turn)?;
        Ok(())
    }

    /// Fold the campaign buffer into a summary when the compressor's
    /// trigger policy says so.
    pub async fn compact(
        &mut self,
        summarizer: &dyn Summarizer,
    ) -> Result<Option<&Summary>, MasterError> {
        let known_names = self
            .state
            .as_ref()
            .map(|s| s.world.known_names())
            .unwrap_or_default();

        let verdict = self.compressor.assess(&self.buffer, None, &known_names);
        let forced = match verdict {
            Verdict::Hold => return Ok(None),
            Verdict::Compress(_) => false,
            Verdict::ForceCompress => true,
        };

        if self.buffer.len() <= COMPACT_KEEP_TAIL {
            return Ok(None);
        }
        let n = self.buffer.len() - COMPACT_KEEP_TAIL;
        let span = SummarySpan::Turns {
            start: self.compacted,
            end: self.compacted + n - 1,
        };

        let summary = self
            .compressor
            .compress(&self.buffer.snapshot()[..n], span, forced, summarizer)
            .await?;

        self.buffer.drain_prefix(n);
        self.compacted += n;
        self.summaries.push(summary);
        Ok(self.summaries.last())
    }

    /// The rolling campaign summary handed to new scenes.
    fn rolling_summary(&self) -> String {
        self.summaries
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Build the campaign-level context window.
    pub fn context_window(&self) -> Result<ContextWindow, MasterError> {
        let state = self.state_ref()?;
        Ok(ContextWindow {
            campaign: state.name.clone(),
            summaries: self.summaries.iter().map(|s| s.text.clone()).collect(),
            recent: self.buffer.snapshot().to_vec(),
            world_excerpt: state.world.full_excerpt(),
            plan_excerpt: state.plan.excerpt(),
        })
    }

    /// Spawn a scene agent seeded with a read-only snapshot of the
    /// relevant campaign context. One scene may be live at a time.
    pub fn spawn_scene(
        &mut self,
        title: impl Into<String>,
        kind: SceneKind,
    ) -> Result<SceneAgent, MasterError> {
        self.require_phase(CampaignPhase::Active)?;
        if let Some(live) = self.live_scene {
            return Err(MasterError::SceneInProgress(live));
        }
        let state = self.state_ref()?;

        let seed = SceneSeed {
            campaign: state.name.clone(),
            world_excerpt: state.world.full_excerpt(),
            plan_excerpt: state.plan.excerpt(),
            campaign_summary: self.rolling_summary(),
            known_names: state.world.known_names(),
        };
        let scene = SceneAgent::spawn(title, kind, seed, self.config.policy.clone());
        self.live_scene = Some(scene.id());
        Ok(scene)
    }

    /// Merge a concluded scene's outcome into the campaign and persist.
    ///
    /// The merge is atomic: on any failure the campaign remains in its
    /// last successfully persisted state and the outcome stays with the
    /// caller, who may adjust it and try again or give up with
    /// [`MasterAgent::discard_scene`]. An outcome for a scene other than
    /// the live one is a conflicting merge attempt and is rejected
    /// without touching state.
    pub async fn conclude_scene(&mut self, outcome: &SceneOutcome) -> Result<(), MasterError> {
        self.require_phase(CampaignPhase::Active)?;
        if self.live_scene != Some(outcome.scene_id) {
            return Err(MergeError::MergeConflict {
                scene_id: outcome.scene_id,
            }
            .into());
        }

        let campaign_name = self.state_ref()?.name.clone();
        let transcript_ref = self
            .saves
            .archive_transcript(&campaign_name, outcome.scene_id, &outcome.transcript)
            .await?;

        let record = SceneRecord {
            scene_id: outcome.scene_id,
            title: outcome.title.clone(),
            started_at: outcome.started_at,
            ended_at: outcome.ended_at,
            summary: outcome.summary.clone(),
            transcript_ref,
        };
        let delta = SceneDelta {
            record,
            world_upserts: outcome.world_upserts.clone(),
            beat_transition: outcome.beat_transition,
            new_threads: outcome.new_threads.clone(),
            resolved_threads: outcome.resolved_threads.clone(),
        };

        match self.state.as_mut() {
            Some(state) => state.merge(delta)?,
            None => {
                return Err(MasterError::WrongPhase {
                    expected: CampaignPhase::Active,
                    actual: self.phase,
                })
            }
        }
        self.live_scene = None;

        // Fold the scene into campaign-level context.
        self.record_turn_internal(
            TurnRole::Narrator,
            format!("{}: {}", outcome.title, outcome.summary.text),
        )?;

        if self.config.autosave {
            if let Some(state) = self.state.as_ref() {
                self.saves.save(state).await?;
            }
        }
        Ok(())
    }

    /// Abort a live scene: its buffer and staged deltas are discarded
    /// and nothing is merged or persisted.
    pub fn abort_scene(&mut self, scene: SceneAgent) {
        let id = scene.abort();
        if self.live_scene == Some(id) {
            self.live_scene = None;
        }
    }

    /// Give up on merging a concluded scene whose merge failed, freeing
    /// the live-scene slot without touching campaign state.
    pub fn discard_scene(&mut self, scene_id: SceneId) {
        if self.live_scene == Some(scene_id) {
            self.live_scene = None;
        }
    }

    /// Persist and pause. Re-activation goes through the restore path.
    pub async fn pause(&mut self) -> Result<(), MasterError> {
        self.require_phase(CampaignPhase::Active)?;
        if let Some(state) = self.state.as_ref() {
            self.saves.save(state).await?;
        }
        self.phase = CampaignPhase::Paused;
        Ok(())
    }

    /// Mark the campaign complete. Terminal: every mutating operation
    /// afterwards fails with a phase error.
    pub async fn archive(&mut self) -> Result<(), MasterError> {
        match self.phase {
            CampaignPhase::Active | CampaignPhase::Paused => {}
            _ => {
                return Err(MasterError::WrongPhase {
                    expected: CampaignPhase::Active,
                    actual: self.phase,
                })
            }
        }
        if let Some(state) = self.state.as_ref() {
            self.saves.save(state).await?;
        }
        self.phase = CampaignPhase::Archived;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::ExtractiveSummarizer;
    use tempfile::TempDir;

    fn planned_session() -> PlanningSession {
        let mut session = PlanningSession::new();
        session.answer("Shadows over Eldermoor").unwrap();
        session
            .answer("Smugglers are bleeding a port town dry while something stirs offshore.")
            .unwrap();
        session
            .answer("The Rusty Lantern: a dockside tavern thick with pipe smoke")
            .unwrap();
        session.answer("Mira: a nervous herbalist").unwrap();
        session
            .answer("Arrive in Eldermoor; Investigate the missing ships; Confront the ring")
            .unwrap();
        session
    }

    async fn active_master(dir: &TempDir) -> MasterAgent {
        let mut master = MasterAgent::new(MasterConfig::new(dir.path()));
        let mut session = master.begin_planning().unwrap();
        for answer in [
            "Shadows over Eldermoor",
            "Smugglers are bleeding a port town dry while something stirs offshore.",
            "The Rusty Lantern: a dockside tavern thick with pipe smoke",
            "Mira: a nervous herbalist",
            "Arrive in Eldermoor; Investigate the missing ships; Confront the ring",
        ] {
            session.answer(answer).unwrap();
        }
        master.complete_planning(session).await.unwrap();
        master
    }

    #[test]
    fn test_planning_walks_all_questions() {
        let mut session = PlanningSession::new();
        assert_eq!(session.step(), PlanningStep::CampaignName);
        assert!(session.current_question().contains("called"));

        assert!(session.answer("   ").is_err());
        session.answer("Test Campaign").unwrap();
        assert_eq!(session.step(), PlanningStep::Premise);
    }

    #[test]
    fn test_planning_produces_initial_state() {
        let outcome = planned_session().finish().unwrap();
        let state = outcome.state;

        assert_eq!(state.version, 1);
        assert_eq!(state.name, "Shadows over Eldermoor");
        assert!(state
            .world
            .get(EntityKind::Location, "the rusty lantern")
            .is_some());
        assert!(state.world.get(EntityKind::Npc, "mira").is_some());
        assert_eq!(state.plan.len(), 3);
        assert_eq!(state.plan.active().unwrap().order, 1);
        assert!(state.open_threads.is_empty());
        assert!(outcome.premise.contains("Smugglers"));
    }

    #[test]
    fn test_planning_requires_answers() {
        let session = PlanningSession::new();
        assert!(matches!(session.finish(), Err(PlanningError::MissingName)));
    }

    #[tokio::test]
    async fn test_phase_machine() {
        let dir = TempDir::new().unwrap();
        let mut master = MasterAgent::new(MasterConfig::new(dir.path()));
        assert_eq!(master.phase(), CampaignPhase::Uninitialized);

        // Active-only operations are rejected before planning.
        assert!(matches!(
            master.spawn_scene("Docks", SceneKind::Exploration),
            Err(MasterError::WrongPhase { .. })
        ));

        master.begin_planning().unwrap();
        assert_eq!(master.phase(), CampaignPhase::Planning);
        // Planning cannot be begun twice.
        assert!(master.begin_planning().is_err());

        master.complete_planning(planned_session()).await.unwrap();
        assert_eq!(master.phase(), CampaignPhase::Active);

        master.pause().await.unwrap();
        assert_eq!(master.phase(), CampaignPhase::Paused);
        assert!(master.spawn_scene("Docks", SceneKind::Dialogue).is_err());

        master.archive().await.unwrap();
        assert_eq!(master.phase(), CampaignPhase::Archived);
        assert!(master.record_turn(TurnRole::Player, "hello").is_err());
        assert!(master.archive().await.is_err());
    }

    #[tokio::test]
    async fn test_scene_loop_merges_and_persists() {
        let dir = TempDir::new().unwrap();
        let mut master = active_master(&dir).await;

        let mut scene = master
            .spawn_scene("Arrival at the docks", SceneKind::Exploration)
            .unwrap();
        assert!(master.live_scene().is_some());

        // A second scene cannot start while one is live.
        assert!(matches!(
            master.spawn_scene("Another", SceneKind::Combat),
            Err(MasterError::SceneInProgress(_))
        ));

        scene
            .accept_turn(TurnRole::Player, "I ask around about the missing ships")
            .unwrap();
        scene
            .accept_turn(
                TurnRole::Narrator,
                "Dockhands point you to Captain Aldric of the harbor watch.",
            )
            .unwrap();
        scene.stage_upsert(
            EntityKind::Npc,
            EntityRecord::new("Captain Aldric", "Harbor watch captain"),
        );

        let outcome = scene.conclude(&ExtractiveSummarizer).await.unwrap();
        master.conclude_scene(&outcome).await.unwrap();

        assert!(master.live_scene().is_none());
        let state = master.state().unwrap();
        assert_eq!(state.scene_history.len(), 1);
        assert!(state.world.get(EntityKind::Npc, "captain aldric").is_some());
        assert!(state.scene_history[0]
            .transcript_ref
            .starts_with("transcripts/"));

        // Autosave left a save file and the transcript archive behind.
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with(".dnd-save.md")));
        assert!(names.iter().any(|n| n == "transcripts"));
    }

    #[tokio::test]
    async fn test_conflicting_merge_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut master = active_master(&dir).await;

        let mut scene = master
            .spawn_scene("Docks", SceneKind::Dialogue)
            .unwrap();
        scene
            .accept_turn(TurnRole::Narrator, "Mira whispers a warning about the watch.")
            .unwrap();
        let outcome = scene.conclude(&ExtractiveSummarizer).await.unwrap();

        // A stale agent concluding after its scene was abandoned.
        let mut stale = SceneAgent::spawn(
            "Stale",
            SceneKind::Dialogue,
            Default::default(),
            CompressionPolicy::default(),
        );
        stale
            .accept_turn(TurnRole::Narrator, "Mira repeats her warning to nobody.")
            .unwrap();
        let stale_outcome = stale.conclude(&ExtractiveSummarizer).await.unwrap();

        let before = master.state().unwrap().clone();
        let err = master.conclude_scene(&stale_outcome).await.unwrap_err();
        assert!(matches!(
            err,
            MasterError::Merge(MergeError::MergeConflict { .. })
        ));
        assert_eq!(master.state().unwrap(), &before);

        // The real scene still merges cleanly.
        master.conclude_scene(&outcome).await.unwrap();
        assert_eq!(master.state().unwrap().scene_history.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let mut master = active_master(&dir).await;
        let before = master.state().unwrap().clone();

        let mut scene = master.spawn_scene("Docks", SceneKind::Combat).unwrap();
        scene
            .accept_turn(TurnRole::Player, "I draw my blade on the smugglers")
            .unwrap();
        scene.stage_upsert(EntityKind::Npc, EntityRecord::new("Smuggler", "armed"));

        master.abort_scene(scene);
        assert!(master.live_scene().is_none());
        assert_eq!(master.state().unwrap(), &before);

        // A fresh scene can be spawned immediately.
        assert!(master.spawn_scene("Docks again", SceneKind::Combat).is_ok());
    }

    #[tokio::test]
    async fn test_resume_round_trip() {
        let dir = TempDir::new().unwrap();
        let campaign_name;
        {
            let mut master = active_master(&dir).await;
            campaign_name = master.state().unwrap().name.clone();
            let mut scene = master.spawn_scene("Docks", SceneKind::Dialogue).unwrap();
            scene
                .accept_turn(TurnRole::Narrator, "Mira names the ships that vanished.")
                .unwrap();
            let outcome = scene.conclude(&ExtractiveSummarizer).await.unwrap();
            master.conclude_scene(&outcome).await.unwrap();
        }

        let config = MasterConfig::new(dir.path());
        let restored = MasterAgent::resume(config, &campaign_name)
            .await
            .unwrap()
            .expect("save should exist");

        assert_eq!(restored.phase(), CampaignPhase::Active);
        let state = restored.state().unwrap();
        assert_eq!(state.name, campaign_name);
        assert_eq!(state.scene_history.len(), 1);
        // The latest scene summary is carried forward as context.
        assert!(!restored.summaries().is_empty());
    }

    #[tokio::test]
    async fn test_resume_missing_campaign_plans_afresh() {
        let dir = TempDir::new().unwrap();
        let config = MasterConfig::new(dir.path());
        let resumed = MasterAgent::resume(config, "No Such Campaign").await.unwrap();
        assert!(resumed.is_none());
    }

    #[tokio::test]
    async fn test_campaign_buffer_compacts() {
        let dir = TempDir::new().unwrap();
        let policy = CompressionPolicy::default()
            .with_budget(40)
            .with_hard_ceiling(120)
            .with_idle_turns(3);
        let mut master = MasterAgent::new(MasterConfig::new(dir.path()).with_policy(policy));
        master.begin_planning().unwrap();
        master.complete_planning(planned_session()).await.unwrap();

        for i in 0..12 {
            master
                .record_turn(
                    TurnRole::Player,
                    format!("note {i}: Offstage planning chatter between sessions"),
                )
                .unwrap();
        }

        let summary = master.compact(&ExtractiveSummarizer).await.unwrap();
        assert!(summary.is_some());
        assert_eq!(master.buffer().len(), COMPACT_KEEP_TAIL);
    }
}
