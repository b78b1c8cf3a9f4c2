//! Campaign memory and state-persistence engine for an AI game master.
//!
//! This crate provides:
//! - Master/scene agent lifecycle with atomic delta merges
//! - Context compression that never loses the archival transcript
//! - World state, story plan, and open-thread tracking
//! - Durable, diff-friendly markdown persistence with resume
//!
//! # Quick Start
//!
//! ```ignore
//! use campaign_core::{MasterAgent, MasterConfig, SceneKind, TurnRole};
//! use campaign_core::compressor::ExtractiveSummarizer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MasterConfig::new("saves");
//!     let mut master = match MasterAgent::resume(config.clone(), "My Campaign").await? {
//!         Some(master) => master,
//!         None => {
//!             let mut master = MasterAgent::new(config);
//!             let mut session = master.begin_planning()?;
//!             while !session.is_complete() {
//!                 let answer = ask_player(session.current_question());
//!                 session.answer(&answer)?;
//!             }
//!             master.complete_planning(session).await?;
//!             master
//!         }
//!     };
//!
//!     let mut scene = master.spawn_scene("Arrival", SceneKind::Exploration)?;
//!     scene.accept_turn(TurnRole::Player, "I step off the gangplank")?;
//!     let outcome = scene.conclude(&ExtractiveSummarizer).await?;
//!     master.conclude_scene(&outcome).await?;
//!     Ok(())
//! }
//! ```

pub mod campaign;
pub mod collab;
pub mod compressor;
pub mod history;
pub mod master;
pub mod persist;
pub mod plan;
pub mod scene;
pub mod testing;
pub mod world;

// Primary public API
pub use campaign::{CampaignState, MergeError, OpenThread, SceneDelta, SceneRecord};
pub use collab::{
    CollabError, ContextWindow, EffectsHub, ImageGenerator, Narration, NarrationDelta, Narrator,
    SpeechSynthesis, SpeechToText, Summarizer,
};
pub use compressor::{
    BreakSignal, CompressError, CompressionPolicy, Compressor, ExtractiveSummarizer, NaturalBreak,
    Summary, SummarySpan,
};
pub use history::{HistoryBuffer, HistoryError, SceneId, Turn, TurnRole};
pub use master::{
    CampaignPhase, MasterAgent, MasterConfig, MasterError, PlanningError, PlanningSession,
    PlanningStep,
};
pub use persist::{slugify, PersistError, Resume, SaveDir};
pub use plan::{BeatStatus, BeatTransition, PlanError, StoryBeat, StoryPlan};
pub use scene::{SceneAgent, SceneError, SceneKind, SceneOutcome, ScenePhase, SceneSeed};
pub use testing::{CampaignHarness, ScriptedNarrator};
pub use world::{EntityKind, EntityRecord, WorldState};
