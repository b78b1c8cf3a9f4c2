//! Collaborator interfaces consumed by the core.
//!
//! Speech transcription, language generation, speech synthesis, and image
//! rendering are external collaborators reached through the narrow traits
//! defined here. The core classifies their failures but never retries on
//! their behalf, and no collaborator error ever touches campaign state:
//! a failed turn is simply offered back to the caller for retry.

use crate::history::Turn;
use crate::plan::BeatStatus;
use crate::world::EntityKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::Future;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

/// Errors surfaced by collaborators.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("collaborator timed out")]
    Timeout,

    #[error("collaborator call failed: {0}")]
    Remote(String),

    #[error("collaborator returned malformed output: {0}")]
    Malformed(String),

    #[error("collaborator is unavailable")]
    Unavailable,
}

impl CollabError {
    /// Whether the caller may reasonably offer the same input again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CollabError::Malformed(_))
    }
}

/// The context handed to the language-generation collaborator: compressed
/// history plus the relevant world-state and plan excerpts.
#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    pub campaign: String,
    pub summaries: Vec<String>,
    pub recent: Vec<Turn>,
    pub world_excerpt: String,
    pub plan_excerpt: String,
}

impl ContextWindow {
    /// Assemble the window into prompt text.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!("## Campaign: {}\n", self.campaign));

        if !self.summaries.is_empty() {
            out.push_str("\n## Story So Far\n");
            for summary in &self.summaries {
                out.push_str(&format!("- {summary}\n"));
            }
        }

        if !self.world_excerpt.is_empty() {
            out.push_str("\n## World State\n");
            out.push_str(&self.world_excerpt);
        }

        if !self.plan_excerpt.is_empty() {
            out.push_str("\n## Story Plan\n");
            out.push_str(&self.plan_excerpt);
        }

        if !self.recent.is_empty() {
            out.push_str("\n## Recent Exchanges\n");
            for turn in &self.recent {
                out.push_str(&format!("{}: {}\n", turn.role.name(), turn.content));
            }
        }

        out
    }
}

/// A structured state change extracted by the language collaborator
/// alongside its narration.
#[derive(Debug, Clone, PartialEq)]
pub enum NarrationDelta {
    /// Create or update a world-state record.
    UpsertEntity {
        kind: EntityKind,
        name: String,
        description: String,
        tags: Vec<String>,
    },
    /// Request a story-beat status change.
    BeatTransition { order: u32, status: BeatStatus },
    /// Raise a new open thread.
    OpenThread { text: String },
}

/// Response from the language-generation collaborator.
#[derive(Debug, Clone, Default)]
pub struct Narration {
    /// Narrative prose to present to the player.
    pub text: String,
    /// Optional structured deltas observed during generation.
    pub deltas: Vec<NarrationDelta>,
}

impl Narration {
    /// A plain narration with no structured deltas.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            deltas: Vec::new(),
        }
    }

    /// Attach a delta.
    pub fn with_delta(mut self, delta: NarrationDelta) -> Self {
        self.deltas.push(delta);
        self
    }
}

/// Language-generation collaborator.
#[async_trait]
pub trait Narrator: Send + Sync {
    /// Generate narration for the given context window.
    async fn narrate(&self, window: &ContextWindow) -> Result<Narration, CollabError>;
}

/// Summarization collaborator used by the compressor.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Condense `turns` into prose of at most `target_tokens` tokens.
    async fn summarize(&self, turns: &[Turn], target_tokens: usize) -> Result<String, CollabError>;
}

/// Opaque audio payload exchanged with speech collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Opaque image payload returned by the image collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// One transcribed utterance from a recording session.
#[derive(Debug, Clone)]
pub struct TurnCandidate {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Speech-to-text collaborator.
///
/// Yields a lazy, finite sequence of turn candidates per recording
/// session; the core treats each candidate as one turn.
pub trait SpeechToText: Send + Sync {
    fn transcribe(
        &self,
        recording: AudioPayload,
    ) -> BoxStream<'static, Result<TurnCandidate, CollabError>>;
}

/// Speech-synthesis collaborator.
#[async_trait]
pub trait SpeechSynthesis: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioPayload, CollabError>;
}

/// Image-generation collaborator.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn render_scene(&self, description: &str) -> Result<ImagePayload, CollabError>;
}

/// A side-effect payload delivered through the effects hub.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    Audio(AudioPayload),
    Image(ImagePayload),
}

/// A completed side-effect task, tagged with the turn it was started for.
#[derive(Debug)]
pub struct EffectReady {
    pub turn_no: u64,
    pub effect: Result<SideEffect, CollabError>,
}

/// Fire-and-forget dispatch surface for synthesis and image tasks.
///
/// The core never blocks turn processing on these tasks. Results arrive on
/// a channel the UI layer polls; a result that lands after the player has
/// already advanced past its turn is discarded at poll time.
pub struct EffectsHub {
    tx: mpsc::UnboundedSender<EffectReady>,
    rx: mpsc::UnboundedReceiver<EffectReady>,
}

impl EffectsHub {
    /// Create a hub with an unbounded result channel.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Spawn a side-effect task for the given turn. Requires a tokio
    /// runtime; the task's result is delivered to this hub's channel.
    pub fn dispatch<F>(&self, turn_no: u64, task: F)
    where
        F: Future<Output = Result<SideEffect, CollabError>> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            // Receiver may be gone during shutdown; nothing to do then.
            let _ = tx.send(EffectReady {
                turn_no,
                effect: task.await,
            });
        });
    }

    /// Return the most recent result still relevant at `current_turn`,
    /// discarding anything staler.
    pub fn poll_ready(&mut self, current_turn: u64) -> Option<EffectReady> {
        let mut latest: Option<EffectReady> = None;
        while let Ok(ready) = self.rx.try_recv() {
            if ready.turn_no >= current_turn {
                latest = Some(ready);
            }
        }
        latest
    }
}

impl Default for EffectsHub {
    fn default() -> Self {
        Self::new()
    }
}
