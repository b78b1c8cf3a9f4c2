//! Testing utilities for the campaign engine.
//!
//! This module provides tools for integration testing:
//! - `ScriptedNarrator` for deterministic runs without a language model
//! - `CampaignHarness` for scripted campaign scenarios
//! - Assertion helpers for verifying campaign state

use crate::campaign::CampaignState;
use crate::collab::{CollabError, ContextWindow, Narration, Narrator, Summarizer};
use crate::compressor::ExtractiveSummarizer;
use crate::history::{Turn, TurnRole};
use crate::master::{CampaignPhase, MasterAgent, MasterConfig, MasterError};
use crate::scene::SceneKind;
use crate::world::EntityKind;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A narrator and summarizer that replays scripted responses.
///
/// Narrations are returned in queue order; when the queue runs dry a
/// stock line is returned so scripted scenarios never panic. Summaries
/// fall back to the deterministic extractive summarizer, which keeps
/// compression behavior realistic without any scripting.
#[derive(Default)]
pub struct ScriptedNarrator {
    narrations: Mutex<VecDeque<Narration>>,
    summaries: Mutex<VecDeque<String>>,
    narrate_calls: AtomicUsize,
    summarize_calls: AtomicUsize,
}

impl ScriptedNarrator {
    /// Create a narrator with empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a narration to return.
    pub fn queue_narration(&self, narration: Narration) {
        lock(&self.narrations).push_back(narration);
    }

    /// Queue a summary to return. Queue an empty string to force a
    /// `CompressionFailed` at the next compression.
    pub fn queue_summary(&self, summary: impl Into<String>) {
        lock(&self.summaries).push_back(summary.into());
    }

    /// How many narrations were requested.
    pub fn narrate_calls(&self) -> usize {
        self.narrate_calls.load(Ordering::Relaxed)
    }

    /// How many summaries were requested.
    pub fn summarize_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::Relaxed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Narrator for ScriptedNarrator {
    async fn narrate(&self, _window: &ContextWindow) -> Result<Narration, CollabError> {
        self.narrate_calls.fetch_add(1, Ordering::Relaxed);
        Ok(lock(&self.narrations)
            .pop_front()
            .unwrap_or_else(|| Narration::text("The narrator has no more scripted responses.")))
    }
}

#[async_trait]
impl Summarizer for ScriptedNarrator {
    async fn summarize(&self, turns: &[Turn], target_tokens: usize) -> Result<String, CollabError> {
        self.summarize_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(scripted) = lock(&self.summaries).pop_front() {
            return Ok(scripted);
        }
        ExtractiveSummarizer.summarize(turns, target_tokens).await
    }
}

/// Harness for driving whole-campaign scenarios.
pub struct CampaignHarness {
    /// The master agent under test.
    pub master: MasterAgent,
    /// The scripted collaborator.
    pub narrator: ScriptedNarrator,
}

/// The standard planning answers used by [`CampaignHarness::planned`].
pub const STANDARD_PLANNING_ANSWERS: [&str; 5] = [
    "Shadows over Eldermoor",
    "Smugglers are bleeding a port town dry while something stirs offshore.",
    "The Rusty Lantern: a dockside tavern thick with pipe smoke",
    "Mira: a nervous herbalist",
    "Arrive in Eldermoor; Investigate the missing ships; Confront the ring",
];

impl CampaignHarness {
    /// Create a harness whose master has already completed a standard
    /// planning session and gone active.
    pub async fn planned(config: MasterConfig) -> Result<Self, MasterError> {
        let mut master = MasterAgent::new(config);
        let mut session = master.begin_planning()?;
        for answer in STANDARD_PLANNING_ANSWERS {
            session.answer(answer)?;
        }
        master.complete_planning(session).await?;
        Ok(Self {
            master,
            narrator: ScriptedNarrator::new(),
        })
    }

    /// Run one full scene: spawn, feed the scripted turns, conclude, and
    /// merge back into the master.
    pub async fn run_scene(
        &mut self,
        title: &str,
        kind: SceneKind,
        turns: &[(TurnRole, &str)],
    ) -> Result<(), MasterError> {
        let mut scene = self.master.spawn_scene(title, kind)?;
        for (role, content) in turns {
            scene.accept_turn(*role, *content)?;
        }
        let outcome = scene.conclude(&self.narrator).await?;
        self.master.conclude_scene(&outcome).await
    }

    /// The campaign state (panics if planning has not run).
    pub fn state(&self) -> &CampaignState {
        self.master
            .state()
            .expect("harness master should be planned")
    }
}

/// Truncate to whole seconds, the precision the save format keeps.
pub fn truncate_ts(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.timestamp(), 0).single().unwrap_or(ts)
}

/// Normalize the volatile timestamps the save format does not round-trip
/// exactly: sub-second precision everywhere, open-thread creation times,
/// and summary creation times. Use before comparing a state with its
/// `load(save(..))` image.
pub fn normalize_volatile(state: &mut CampaignState) {
    state.created_at = truncate_ts(state.created_at);
    state.last_played_at = truncate_ts(state.last_played_at);
    for record in &mut state.scene_history {
        record.started_at = truncate_ts(record.started_at);
        record.ended_at = truncate_ts(record.ended_at);
        record.summary.created_at = record.ended_at;
    }
    for thread in &mut state.open_threads {
        thread.created_at = state.created_at;
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the master agent is in the expected phase.
#[track_caller]
pub fn assert_phase(master: &MasterAgent, expected: CampaignPhase) {
    assert_eq!(
        master.phase(),
        expected,
        "expected campaign phase {expected:?}, got {:?}",
        master.phase()
    );
}

/// Assert a world-state entity exists.
#[track_caller]
pub fn assert_has_entity(state: &CampaignState, kind: EntityKind, name: &str) {
    assert!(
        state.world.get(kind, name).is_some(),
        "expected {} '{name}' to exist in world state",
        kind.name()
    );
}

/// Assert which story beat is active.
#[track_caller]
pub fn assert_active_beat(state: &CampaignState, order: u32) {
    let active = state.plan.active().map(|b| b.order);
    assert_eq!(
        active,
        Some(order),
        "expected beat {order} to be active, got {active:?}"
    );
}

/// Assert how many scenes have been recorded.
#[track_caller]
pub fn assert_scene_count(state: &CampaignState, expected: usize) {
    assert_eq!(
        state.scene_history.len(),
        expected,
        "expected {expected} scene records, got {}",
        state.scene_history.len()
    );
}
