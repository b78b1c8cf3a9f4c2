//! History compression: when to fold turns into a summary, and the
//! summary itself.
//!
//! The compressor never deletes turns from the archival transcript; it
//! only shortens the *active context view* the downstream model sees.
//! Compression fires when the buffer cost exceeds its budget AND a
//! natural narrative break is detected. A hard ceiling forces compression
//! without a break for pathologically long exchanges; that fallback is
//! flagged on the produced summary, not treated as a failure.

use crate::collab::{CollabError, Summarizer};
use crate::history::{approx_tokens, HistoryBuffer, SceneId, Turn, TurnRole};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from compression.
#[derive(Debug, Error)]
pub enum CompressError {
    /// Summarization produced empty or malformed output. The caller
    /// retains the uncompressed buffer.
    #[error("summarization produced empty or malformed output")]
    CompressionFailed,

    #[error(transparent)]
    Collab(#[from] CollabError),
}

/// Phrases in a player turn that close out an encounter.
///
/// The break-detection heuristic: an explicit scene-conclusion signal
/// from the owning agent, one of these markers in the latest player
/// turn, or an idle stretch with no mention of any tracked entity.
const SCENE_END_MARKERS: &[&str] = &[
    "end scene",
    "end the scene",
    "end of scene",
    "the scene ends",
    "we make camp",
    "we rest for the night",
    "let's call it here",
];

/// Tunable trigger thresholds, in estimated tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionPolicy {
    /// Buffer cost above which compression is wanted.
    pub budget: usize,
    /// Buffer cost above which compression is forced even without a
    /// natural break.
    pub hard_ceiling: usize,
    /// Consecutive turns without an entity mention that count as a
    /// topic shift.
    pub idle_turns: usize,
    /// Target length of produced summaries.
    pub summary_budget: usize,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            budget: 1_500,
            hard_ceiling: 4_000,
            idle_turns: 6,
            summary_budget: 256,
        }
    }
}

impl CompressionPolicy {
    /// Set the trigger budget.
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    /// Set the forcing ceiling.
    pub fn with_hard_ceiling(mut self, ceiling: usize) -> Self {
        self.hard_ceiling = ceiling;
        self
    }

    /// Set the idle-turn threshold for the topic-shift heuristic.
    pub fn with_idle_turns(mut self, turns: usize) -> Self {
        self.idle_turns = turns;
        self
    }

    /// Set the summary length target.
    pub fn with_summary_budget(mut self, budget: usize) -> Self {
        self.summary_budget = budget;
        self
    }
}

/// An explicit break signal from the owning agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakSignal {
    /// The agent is concluding the whole segment.
    SceneConclusion,
    /// A player or DM action ended the current encounter.
    EncounterEnd,
}

/// A detected natural narrative break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaturalBreak {
    SceneConclusion,
    EncounterEnd,
    TopicShift,
}

/// What the compressor wants done with a buffer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep buffering; either under budget or mid-exchange.
    Hold,
    /// Over budget with a natural break available.
    Compress(NaturalBreak),
    /// Over the hard ceiling with no break: policy fallback.
    ForceCompress,
}

/// What turns a summary condenses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SummarySpan {
    /// A range of transcript turn indices, inclusive.
    Turns { start: usize, end: usize },
    /// A whole scene.
    Scene(SceneId),
}

/// Condensed prose replacing a run of turns in the active context view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub covers: SummarySpan,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Set when the hard ceiling forced compression without a break.
    pub forced: bool,
}

/// Decides when to compress and produces bounded summaries.
#[derive(Debug, Clone, Default)]
pub struct Compressor {
    policy: CompressionPolicy,
}

impl Compressor {
    /// Create a compressor with the given policy.
    pub fn new(policy: CompressionPolicy) -> Self {
        Self { policy }
    }

    /// The active policy.
    pub fn policy(&self) -> &CompressionPolicy {
        &self.policy
    }

    /// Decide whether `buffer` should be compressed now.
    ///
    /// Compression is wanted iff the cost exceeds the budget AND a break
    /// is available; past the hard ceiling it is forced regardless.
    pub fn assess(
        &self,
        buffer: &HistoryBuffer,
        signal: Option<BreakSignal>,
        known_names: &[String],
    ) -> Verdict {
        if buffer.cost() <= self.policy.budget {
            return Verdict::Hold;
        }
        match self.detect_break(buffer, signal, known_names) {
            Some(brk) => Verdict::Compress(brk),
            None if buffer.cost() > self.policy.hard_ceiling => Verdict::ForceCompress,
            None => Verdict::Hold,
        }
    }

    /// Find a natural break in the buffered conversation, if any.
    pub fn detect_break(
        &self,
        buffer: &HistoryBuffer,
        signal: Option<BreakSignal>,
        known_names: &[String],
    ) -> Option<NaturalBreak> {
        match signal {
            Some(BreakSignal::SceneConclusion) => return Some(NaturalBreak::SceneConclusion),
            Some(BreakSignal::EncounterEnd) => return Some(NaturalBreak::EncounterEnd),
            None => {}
        }

        let turns = buffer.snapshot();

        // A scene-ending phrase in the latest player turn counts as an
        // explicit break.
        if let Some(last_player) = turns.iter().rev().find(|t| t.role == TurnRole::Player) {
            let lower = last_player.content.to_lowercase();
            if SCENE_END_MARKERS.iter().any(|m| lower.contains(m)) {
                return Some(NaturalBreak::EncounterEnd);
            }
        }

        // Topic shift: a full idle window with no tracked entity named.
        if self.policy.idle_turns > 0 && turns.len() >= self.policy.idle_turns {
            let tail = &turns[turns.len() - self.policy.idle_turns..];
            let lowered: Vec<String> = known_names.iter().map(|n| n.to_lowercase()).collect();
            let mentions_any = tail.iter().any(|t| {
                let content = t.content.to_lowercase();
                lowered.iter().any(|name| content.contains(name))
            });
            if !lowered.is_empty() && !mentions_any {
                return Some(NaturalBreak::TopicShift);
            }
        }

        None
    }

    /// Produce a summary of `turns` through the summarizer collaborator.
    ///
    /// The summary text is whitespace-normalized and hard-bounded to the
    /// policy's summary budget regardless of input size. Empty output
    /// fails with [`CompressError::CompressionFailed`]; the caller keeps
    /// its buffer untouched in that case.
    pub async fn compress(
        &self,
        turns: &[Turn],
        covers: SummarySpan,
        forced: bool,
        summarizer: &dyn Summarizer,
    ) -> Result<Summary, CompressError> {
        if turns.is_empty() {
            return Err(CompressError::CompressionFailed);
        }

        let raw = summarizer
            .summarize(turns, self.policy.summary_budget)
            .await?;
        let text = bound_text(&raw, self.policy.summary_budget);
        if text.is_empty() {
            return Err(CompressError::CompressionFailed);
        }

        Ok(Summary {
            covers,
            text,
            created_at: Utc::now(),
            forced,
        })
    }
}

/// Normalize whitespace and truncate to the token budget at a char
/// boundary.
fn bound_text(raw: &str, target_tokens: usize) -> String {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if approx_tokens(&normalized) <= target_tokens {
        return normalized;
    }
    normalized.chars().take(target_tokens * 4).collect()
}

/// Deterministic fallback summarizer.
///
/// Keeps newly introduced names and the narrator's factual lines while
/// discarding verbatim dialogue. Re-summarizing its own output keeps the
/// same facts, so repeated compression only ever rephrases.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummarizer;

/// Capitalized words that are not names.
const NAME_STOPWORDS: &[&str] = &[
    "The", "A", "An", "I", "You", "We", "It", "He", "She", "They", "My", "Your", "Our", "His",
    "Her", "Their", "This", "That", "These", "Those", "As", "At", "In", "On", "Of", "To", "And",
    "But", "Or", "So", "Then", "When", "While", "After", "Before", "With", "From", "For", "If",
    "No", "Yes", "Not", "There", "Here", "What", "Who", "Where", "Why", "How", "Featuring",
];

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, turns: &[Turn], target_tokens: usize) -> Result<String, CollabError> {
        let mut names: Vec<String> = Vec::new();
        let mut facts: Vec<String> = Vec::new();

        for turn in turns {
            for name in proper_names(&turn.content) {
                if !names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                    names.push(name);
                }
            }
            if turn.role != TurnRole::Player {
                let stripped = strip_dialogue(&turn.content);
                let line = without_cast_header(stripped.trim()).trim().to_string();
                if line.split_whitespace().count() >= 3 {
                    facts.push(line);
                }
            }
        }

        let mut out = String::new();
        if !names.is_empty() {
            out.push_str(&format!("Featuring {}.", names.join(", ")));
        }
        for fact in facts {
            let candidate_len = out.chars().count() + fact.chars().count() + 1;
            if candidate_len / 4 > target_tokens {
                break;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&fact);
            if !out.ends_with('.') {
                out.push('.');
            }
        }

        Ok(out)
    }
}

/// Capitalized tokens that plausibly name people or places.
fn proper_names(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| {
            w.chars().next().is_some_and(|c| c.is_uppercase())
                && w.len() > 2
                && !NAME_STOPWORDS.contains(w)
        })
        .map(|w| w.to_string())
        .collect()
}

/// Remove quoted dialogue spans.
fn strip_dialogue(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_quote = false;
    for c in text.chars() {
        match c {
            '"' | '\u{201c}' | '\u{201d}' => in_quote = !in_quote,
            _ if !in_quote => out.push(c),
            _ => {}
        }
    }
    out
}

/// Drop a leading `Featuring ...` cast list produced by an earlier pass,
/// so re-summarizing a summary does not duplicate it.
fn without_cast_header(text: &str) -> &str {
    if let Some(rest) = text.strip_prefix("Featuring ") {
        if let Some(idx) = rest.find(". ") {
            return &rest[idx + 2..];
        }
        if rest.ends_with('.') {
            return "";
        }
    }
    text
}
