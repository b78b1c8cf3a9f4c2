//! Scene agents: ephemeral handlers for one interaction segment.
//!
//! A scene agent is spawned by the master agent with a read-only snapshot
//! of the relevant campaign context, owns its local history buffer while
//! live, and on conclusion hands a delta back for the master to merge.
//! It never writes to campaign state directly.

use crate::collab::{ContextWindow, Narration, NarrationDelta, Summarizer};
use crate::compressor::{BreakSignal, CompressError, CompressionPolicy, Compressor, Summary, SummarySpan, Verdict};
use crate::history::{HistoryBuffer, HistoryError, SceneId, Turn, TurnRole};
use crate::plan::BeatTransition;
use crate::world::{EntityKind, EntityRecord};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Turns kept verbatim at the end of the buffer when a prefix is folded
/// into a summary, so the model always sees the immediate exchange.
const COMPRESS_KEEP_TAIL: usize = 2;

/// Errors from scene agent operations.
#[derive(Debug, Error)]
pub enum SceneError {
    #[error("scene {scene_id} is already terminated")]
    SceneAlreadyTerminated { scene_id: SceneId },

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Compress(#[from] CompressError),
}

/// The flavor of interaction segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneKind {
    Dialogue,
    Combat,
    Exploration,
}

impl SceneKind {
    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            SceneKind::Dialogue => "Dialogue",
            SceneKind::Combat => "Combat",
            SceneKind::Exploration => "Exploration",
        }
    }
}

/// Scene agent lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenePhase {
    Spawned,
    Active,
    Concluding,
    Terminated,
}

/// Read-only context captured from the master agent at spawn time.
///
/// A seed is a snapshot, never a live reference: the only write path back
/// to the campaign is the concluding merge.
#[derive(Debug, Clone, Default)]
pub struct SceneSeed {
    pub campaign: String,
    pub world_excerpt: String,
    pub plan_excerpt: String,
    /// Rolling summary of the campaign so far.
    pub campaign_summary: String,
    /// Entity names the campaign tracks, for break detection.
    pub known_names: Vec<String>,
}

/// Everything a concluded scene produces for the master to merge and
/// archive.
#[derive(Debug, Clone)]
pub struct SceneOutcome {
    pub scene_id: SceneId,
    pub title: String,
    pub kind: SceneKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub summary: Summary,
    /// The complete ordered turn record, untouched by compression.
    pub transcript: Vec<Turn>,
    pub world_upserts: Vec<(EntityKind, EntityRecord)>,
    pub beat_transition: Option<BeatTransition>,
    pub new_threads: Vec<String>,
    pub resolved_threads: Vec<usize>,
}

/// Ephemeral agent for one scene.
pub struct SceneAgent {
    id: SceneId,
    title: String,
    kind: SceneKind,
    phase: ScenePhase,
    seed: SceneSeed,
    started_at: DateTime<Utc>,
    /// Full archival record of every turn, in order.
    transcript: Vec<Turn>,
    /// Active context window; prefixes get folded into `summaries`.
    buffer: HistoryBuffer,
    summaries: Vec<Summary>,
    /// Transcript turns already folded out of the buffer.
    compacted: usize,
    compressor: Compressor,
    staged_upserts: Vec<(EntityKind, EntityRecord)>,
    staged_beat: Option<BeatTransition>,
    staged_threads: Vec<String>,
    staged_resolutions: Vec<usize>,
}

impl SceneAgent {
    /// Spawn a scene agent seeded from master context.
    pub fn spawn(
        title: impl Into<String>,
        kind: SceneKind,
        seed: SceneSeed,
        policy: CompressionPolicy,
    ) -> Self {
        Self {
            id: SceneId::new(),
            title: title.into(),
            kind,
            phase: ScenePhase::Spawned,
            seed,
            started_at: Utc::now(),
            transcript: Vec::new(),
            buffer: HistoryBuffer::new(),
            summaries: Vec::new(),
            compacted: 0,
            compressor: Compressor::new(policy),
            staged_upserts: Vec::new(),
            staged_beat: None,
            staged_threads: Vec::new(),
            staged_resolutions: Vec::new(),
        }
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn kind(&self) -> SceneKind {
        self.kind
    }

    pub fn phase(&self) -> ScenePhase {
        self.phase
    }

    /// The active context view: summaries plus the uncompressed tail.
    pub fn buffer(&self) -> &HistoryBuffer {
        &self.buffer
    }

    /// Local summaries produced so far.
    pub fn summaries(&self) -> &[Summary] {
        &self.summaries
    }

    /// The full archival transcript.
    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    fn ensure_live(&self) -> Result<(), SceneError> {
        match self.phase {
            ScenePhase::Spawned | ScenePhase::Active => Ok(()),
            ScenePhase::Concluding | ScenePhase::Terminated => {
                Err(SceneError::SceneAlreadyTerminated { scene_id: self.id })
            }
        }
    }

    /// A timestamp strictly after everything already recorded.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.transcript.last() {
            Some(last) if now <= last.timestamp => last.timestamp + Duration::microseconds(1),
            _ => now,
        }
    }

    /// Record a turn with a synthesized monotonic timestamp.
    pub fn accept_turn(
        &mut self,
        role: TurnRole,
        content: impl Into<String>,
    ) -> Result<(), SceneError> {
        let turn = Turn::new(role, content, self.next_timestamp(), self.id);
        self.ingest(turn)
    }

    /// Record an externally constructed turn (e.g. a transcribed
    /// candidate carrying its own timestamp).
    pub fn ingest(&mut self, turn: Turn) -> Result<(), SceneError> {
        self.ensure_live()?;
        self.buffer.append(turn.clone())?;
        self.transcript.push(turn);
        self.phase = ScenePhase::Active;
        Ok(())
    }

    /// Append a narration and stage its structured deltas.
    pub fn apply_narration(&mut self, narration: Narration) -> Result<(), SceneError> {
        self.accept_turn(TurnRole::Narrator, narration.text)?;
        for delta in narration.deltas {
            match delta {
                NarrationDelta::UpsertEntity {
                    kind,
                    name,
                    description,
                    tags,
                } => self.stage_upsert(
                    kind,
                    EntityRecord {
                        name,
                        description,
                        tags,
                    },
                ),
                NarrationDelta::BeatTransition { order, status } => {
                    self.stage_beat_transition(BeatTransition { order, status })
                }
                NarrationDelta::OpenThread { text } => self.stage_thread(text),
            }
        }
        Ok(())
    }

    /// Stage a world-state update for the concluding merge.
    pub fn stage_upsert(&mut self, kind: EntityKind, record: EntityRecord) {
        self.staged_upserts.push((kind, record));
    }

    /// Stage a beat transition. A scene carries at most one; the latest
    /// staged transition wins.
    pub fn stage_beat_transition(&mut self, transition: BeatTransition) {
        self.staged_beat = Some(transition);
    }

    /// Stage a new open thread.
    pub fn stage_thread(&mut self, text: impl Into<String>) {
        self.staged_threads.push(text.into());
    }

    /// Stage the resolution of an existing campaign thread.
    pub fn stage_thread_resolution(&mut self, index: usize) {
        self.staged_resolutions.push(index);
    }

    /// Entity names relevant to this scene: the campaign's plus anything
    /// introduced during play.
    fn tracked_names(&self) -> Vec<String> {
        let mut names = self.seed.known_names.clone();
        names.extend(self.staged_upserts.iter().map(|(_, r)| r.name.clone()));
        names
    }

    /// Build the context window for the language collaborator.
    pub fn context_window(&self) -> ContextWindow {
        let mut summaries = Vec::new();
        if !self.seed.campaign_summary.is_empty() {
            summaries.push(self.seed.campaign_summary.clone());
        }
        summaries.extend(self.summaries.iter().map(|s| s.text.clone()));

        ContextWindow {
            campaign: self.seed.campaign.clone(),
            summaries,
            recent: self.buffer.snapshot().to_vec(),
            world_excerpt: self.seed.world_excerpt.clone(),
            plan_excerpt: self.seed.plan_excerpt.clone(),
        }
    }

    /// Let the compressor look at the buffer and fold a prefix into a
    /// summary when its trigger policy says so.
    ///
    /// Returns the new summary when compression ran. On summarizer
    /// failure the buffer is retained uncompressed and the error is
    /// surfaced for the caller to retry later.
    pub async fn maybe_compress(
        &mut self,
        signal: Option<BreakSignal>,
        summarizer: &dyn Summarizer,
    ) -> Result<Option<&Summary>, SceneError> {
        self.ensure_live()?;

        let verdict = self
            .compressor
            .assess(&self.buffer, signal, &self.tracked_names());
        let forced = match verdict {
            Verdict::Hold => return Ok(None),
            Verdict::Compress(_) => false,
            Verdict::ForceCompress => true,
        };

        if self.buffer.len() <= COMPRESS_KEEP_TAIL {
            return Ok(None);
        }
        let n = self.buffer.len() - COMPRESS_KEEP_TAIL;
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

    /// Conclude the scene: produce its summary and the delta set to
    /// merge.
    ///
    /// On summarizer failure the agent stays in `Concluding` with its
    /// buffer intact and may be concluded again. After success the agent
    /// is terminated and rejects further turns.
    pub async fn conclude(
        &mut self,
        summarizer: &dyn Summarizer,
    ) -> Result<SceneOutcome, SceneError> {
        match self.phase {
            ScenePhase::Terminated => {
                return Err(SceneError::SceneAlreadyTerminated { scene_id: self.id })
            }
            _ => self.phase = ScenePhase::Concluding,
        }

        // The scene summary condenses the whole transcript, not just the
        // uncompressed tail.
        let summary = self
            .compressor
            .compress(&self.transcript, SummarySpan::Scene(self.id), false, summarizer)
            .await?;
        let ended_at = summary.created_at;

        self.phase = ScenePhase::Terminated;
        Ok(SceneOutcome {
            scene_id: self.id,
            title: self.title.clone(),
            kind: self.kind,
            started_at: self.started_at,
            ended_at,
            summary,
            transcript: self.transcript.clone(),
            world_upserts: self.staged_upserts.clone(),
            beat_transition: self.staged_beat,
            new_threads: self.staged_threads.clone(),
            resolved_threads: self.staged_resolutions.clone(),
        })
    }

    /// Abort the scene, discarding its local buffer and staged deltas.
    ///
    /// No merge happens and no campaign state is touched, whether the
    /// agent was active or already concluding.
    pub fn abort(self) -> SceneId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::ExtractiveSummarizer;

    fn seed() -> SceneSeed {
        SceneSeed {
            campaign: "Shadows over Eldermoor".to_string(),
            world_excerpt: "### NPCs\n- **Mira**: herbalist\n".to_string(),
            plan_excerpt: "1. [active] Investigate\n".to_string(),
            campaign_summary: "The party reached Eldermoor.".to_string(),
            known_names: vec!["Mira".to_string(), "Eldermoor".to_string()],
        }
    }

    fn tight_policy() -> CompressionPolicy {
        CompressionPolicy::default()
            .with_budget(40)
            .with_hard_ceiling(120)
            .with_idle_turns(3)
            .with_summary_budget(64)
    }

    #[test]
    fn test_lifecycle_phases() {
        let mut scene = SceneAgent::spawn("Docks", SceneKind::Exploration, seed(), tight_policy());
        assert_eq!(scene.phase(), ScenePhase::Spawned);

        scene.accept_turn(TurnRole::Player, "I walk to the pier").unwrap();
        assert_eq!(scene.phase(), ScenePhase::Active);
        assert_eq!(scene.transcript().len(), 1);
    }

    #[test]
    fn test_ingest_rejects_out_of_order_candidates() {
        let mut scene = SceneAgent::spawn("Docks", SceneKind::Dialogue, seed(), tight_policy());
        let first = Turn::new(TurnRole::Player, "first", Utc::now(), scene.id());
        let stale_ts = first.timestamp - Duration::seconds(5);
        scene.ingest(first).unwrap();

        let stale = Turn::new(TurnRole::Player, "stale", stale_ts, scene.id());
        assert!(matches!(
            scene.ingest(stale),
            Err(SceneError::History(HistoryError::InvalidTurnOrder { .. }))
        ));
        assert_eq!(scene.transcript().len(), 1);
        assert_eq!(scene.buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_terminated_scene_rejects_turns() {
        let mut scene = SceneAgent::spawn("Docks", SceneKind::Dialogue, seed(), tight_policy());
        scene
            .accept_turn(TurnRole::Narrator, "Mira waves you over to her stall.")
            .unwrap();

        scene.conclude(&ExtractiveSummarizer).await.unwrap();
        assert_eq!(scene.phase(), ScenePhase::Terminated);

        let err = scene.accept_turn(TurnRole::Player, "one more thing").unwrap_err();
        assert!(matches!(err, SceneError::SceneAlreadyTerminated { .. }));

        let err = scene.conclude(&ExtractiveSummarizer).await.unwrap_err();
        assert!(matches!(err, SceneError::SceneAlreadyTerminated { .. }));
    }

    #[tokio::test]
    async fn test_compression_preserves_transcript() {
        let mut scene = SceneAgent::spawn("Docks", SceneKind::Exploration, seed(), tight_policy());

        for i in 0..10 {
            scene
                .accept_turn(
                    TurnRole::Player,
                    format!("turn {i}: wandering the Fogmarket streets with no goal"),
                )
                .unwrap();
        }

        // Over budget and nothing mentions a tracked entity: topic shift.
        let summary = scene
            .maybe_compress(None, &ExtractiveSummarizer)
            .await
            .unwrap();
        assert!(summary.is_some());

        // Active view shrank; archival record did not.
        assert_eq!(scene.transcript().len(), 10);
        assert_eq!(scene.buffer().len(), COMPRESS_KEEP_TAIL);
        assert_eq!(scene.summaries().len(), 1);
        match scene.summaries()[0].covers {
            SummarySpan::Turns { start, end } => {
                assert_eq!(start, 0);
                assert_eq!(end, 7);
            }
            _ => panic!("expected a turn span"),
        }
    }

    #[tokio::test]
    async fn test_failed_summarizer_keeps_buffer() {
        struct EmptySummarizer;

        #[async_trait::async_trait]
        impl Summarizer for EmptySummarizer {
            async fn summarize(
                &self,
                _: &[Turn],
                _: usize,
            ) -> Result<String, crate::collab::CollabError> {
                Ok(String::new())
            }
        }

        let mut scene = SceneAgent::spawn("Docks", SceneKind::Exploration, seed(), tight_policy());
        for i in 0..10 {
            scene
                .accept_turn(TurnRole::Player, format!("turn {i}: aimless wandering around"))
                .unwrap();
        }

        let before_len = scene.buffer().len();
        let err = scene.maybe_compress(None, &EmptySummarizer).await.unwrap_err();
        assert!(matches!(
            err,
            SceneError::Compress(CompressError::CompressionFailed)
        ));
        assert_eq!(scene.buffer().len(), before_len);
        assert!(scene.summaries().is_empty());
    }

    #[tokio::test]
    async fn test_conclude_retry_after_failure() {
        struct EmptySummarizer;

        #[async_trait::async_trait]
        impl Summarizer for EmptySummarizer {
            async fn summarize(
                &self,
                _: &[Turn],
                _: usize,
            ) -> Result<String, crate::collab::CollabError> {
                Ok(String::new())
            }
        }

        let mut scene = SceneAgent::spawn("Docks", SceneKind::Dialogue, seed(), tight_policy());
        scene
            .accept_turn(TurnRole::Narrator, "Mira shares what she saw at the harbor.")
            .unwrap();

        assert!(scene.conclude(&EmptySummarizer).await.is_err());
        assert_eq!(scene.phase(), ScenePhase::Concluding);

        // A working summarizer can still conclude the scene.
        let outcome = scene.conclude(&ExtractiveSummarizer).await.unwrap();
        assert_eq!(outcome.transcript.len(), 1);
        assert_eq!(scene.phase(), ScenePhase::Terminated);
    }

    #[tokio::test]
    async fn test_narration_deltas_are_staged() {
        use crate::plan::BeatStatus;

        let mut scene = SceneAgent::spawn("Docks", SceneKind::Dialogue, seed(), tight_policy());
        scene.accept_turn(TurnRole::Player, "I ask about the ships").unwrap();

        let narration = Narration::text("Aldric admits the manifests were forged.")
            .with_delta(NarrationDelta::UpsertEntity {
                kind: EntityKind::Npc,
                name: "Aldric".to_string(),
                description: "Harbor guard captain, compromised".to_string(),
                tags: vec!["harbor".to_string()],
            })
            .with_delta(NarrationDelta::BeatTransition {
                order: 1,
                status: BeatStatus::Done,
            })
            .with_delta(NarrationDelta::OpenThread {
                text: "Who paid Aldric off?".to_string(),
            });

        scene.apply_narration(narration).unwrap();

        let outcome = scene.conclude(&ExtractiveSummarizer).await.unwrap();
        assert_eq!(outcome.world_upserts.len(), 1);
        assert_eq!(outcome.beat_transition.unwrap().order, 1);
        assert_eq!(outcome.new_threads, vec!["Who paid Aldric off?".to_string()]);
    }

    #[test]
    fn test_context_window_includes_seed() {
        let mut scene = SceneAgent::spawn("Docks", SceneKind::Dialogue, seed(), tight_policy());
        scene.accept_turn(TurnRole::Player, "I look around").unwrap();

        let window = scene.context_window();
        assert_eq!(window.campaign, "Shadows over Eldermoor");
        assert_eq!(window.summaries, vec!["The party reached Eldermoor.".to_string()]);
        assert_eq!(window.recent.len(), 1);
        assert!(window.world_excerpt.contains("Mira"));
    }
}
