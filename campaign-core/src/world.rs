//! Canonical world state: NPCs, locations, and items.
//!
//! World state holds the mutable facts of the campaign independent of any
//! conversation text. Records are free-text, keyed by name, last-write-wins
//! on update. All mutation flows through the master agent's merge
//! operation; scene agents only ever read a snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum entities included in a relevance excerpt.
const MAX_EXCERPT_ENTITIES: usize = 12;

/// The entity collections tracked in world state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Npc,
    Location,
    Item,
}

impl EntityKind {
    /// Display name for this collection.
    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::Npc => "NPCs",
            EntityKind::Location => "Locations",
            EntityKind::Item => "Items",
        }
    }

    /// All collections, in serialization order.
    pub fn all() -> &'static [EntityKind] {
        &[EntityKind::Npc, EntityKind::Location, EntityKind::Item]
    }
}

/// A named world-state record. Free text, mutable, last-write-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl EntityRecord {
    /// Create a record with no tags.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tags: Vec::new(),
        }
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Mapping of entity collections, each keyed by unique name.
///
/// Keys are lowercased so names are unique case-insensitively; `BTreeMap`
/// keeps serialization order stable so saves stay diff-friendly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    npcs: BTreeMap<String, EntityRecord>,
    locations: BTreeMap<String, EntityRecord>,
    items: BTreeMap<String, EntityRecord>,
}

impl WorldState {
    /// Create an empty world state.
    pub fn new() -> Self {
        Self::default()
    }

    fn collection(&self, kind: EntityKind) -> &BTreeMap<String, EntityRecord> {
        match kind {
            EntityKind::Npc => &self.npcs,
            EntityKind::Location => &self.locations,
            EntityKind::Item => &self.items,
        }
    }

    fn collection_mut(&mut self, kind: EntityKind) -> &mut BTreeMap<String, EntityRecord> {
        match kind {
            EntityKind::Npc => &mut self.npcs,
            EntityKind::Location => &mut self.locations,
            EntityKind::Item => &mut self.items,
        }
    }

    /// Insert or replace a record in its collection (last-write-wins).
    pub fn upsert(&mut self, kind: EntityKind, record: EntityRecord) {
        self.collection_mut(kind)
            .insert(record.name.to_lowercase(), record);
    }

    /// Look up a record by name, case-insensitively.
    pub fn get(&self, kind: EntityKind, name: &str) -> Option<&EntityRecord> {
        self.collection(kind).get(&name.to_lowercase())
    }

    /// Remove a record by name. Returns the removed record, if any.
    pub fn remove(&mut self, kind: EntityKind, name: &str) -> Option<EntityRecord> {
        self.collection_mut(kind).remove(&name.to_lowercase())
    }

    /// Iterate one collection in stable (key) order.
    pub fn iter(&self, kind: EntityKind) -> impl Iterator<Item = &EntityRecord> {
        self.collection(kind).values()
    }

    /// Number of records in one collection.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.collection(kind).len()
    }

    /// Total records across all collections.
    pub fn total(&self) -> usize {
        EntityKind::all().iter().map(|k| self.count(*k)).sum()
    }

    /// All entity names across collections, in original casing.
    ///
    /// Used by the compressor's topic-shift heuristic to decide whether
    /// recent turns still mention anything the campaign tracks.
    pub fn known_names(&self) -> Vec<String> {
        EntityKind::all()
            .iter()
            .flat_map(|k| self.iter(*k).map(|r| r.name.clone()))
            .collect()
    }

    /// Render the entities relevant to `query` as a context block.
    ///
    /// Relevance is a case-insensitive name mention in the query text,
    /// capped at a fixed number of entities. Returns an empty string when
    /// nothing matches.
    pub fn excerpt(&self, query: &str) -> String {
        let query_lower = query.to_lowercase();
        let mut out = String::new();
        let mut included = 0;

        for kind in EntityKind::all() {
            let matched: Vec<&EntityRecord> = self
                .iter(*kind)
                .filter(|r| query_lower.contains(&r.name.to_lowercase()))
                .take(MAX_EXCERPT_ENTITIES - included)
                .collect();
            if matched.is_empty() {
                continue;
            }
            out.push_str(&format!("### {}\n", kind.name()));
            for record in &matched {
                out.push_str(&format!("- **{}**: {}\n", record.name, record.description));
            }
            included += matched.len();
            if included >= MAX_EXCERPT_ENTITIES {
                break;
            }
        }

        out
    }

    /// Render every entity as a context block, for scene seeding.
    pub fn full_excerpt(&self) -> String {
        let mut out = String::new();
        for kind in EntityKind::all() {
            if self.count(*kind) == 0 {
                continue;
            }
            out.push_str(&format!("### {}\n", kind.name()));
            for record in self.iter(*kind) {
                out.push_str(&format!("- **{}**: {}\n", record.name, record.description));
            }
        }
        out
    }
}
