//! Campaign persistence: the `.dnd-save.md` document format.
//!
//! Saves are versioned, section-delimited markdown (see
//! `docs/campaign_save_schema.md`): five ordered level-1 sections, each
//! heading followed by a `---` fence and closed by one. The format is a
//! real grammar with a dedicated parser/serializer pair, so a state
//! survives `load(save(state))` and the files stay diff-friendly.
//!
//! Writes go to a temporary path and are atomically renamed into place;
//! a partially written save is never visible under the canonical name.

use crate::campaign::{CampaignState, OpenThread, SceneRecord, SectionExtras, CAMPAIGN_VERSION};
use crate::compressor::{Summary, SummarySpan};
use crate::history::{SceneId, Turn};
use crate::plan::{BeatStatus, StoryBeat, StoryPlan};
use crate::world::{EntityKind, EntityRecord, WorldState};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;

/// Suffix every save file carries.
pub const SAVE_SUFFIX: &str = ".dnd-save.md";

/// The five top-level sections, in required order.
const SECTION_ORDER: [&str; 5] = [
    "Metadata",
    "World State",
    "Story Plan",
    "Scene History",
    "Open Threads",
];

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("save version {found} is newer than supported version {supported}")]
    SchemaVersionMismatch { supported: u32, found: u32 },

    #[error("malformed save: {0}")]
    MalformedSave(String),
}

/// Outcome of the resume path. Having no save to resume from is a
/// signal, not an error: the caller proceeds to a fresh Planning phase.
#[derive(Debug)]
pub enum Resume {
    Restored(CampaignState),
    NoSaveFound,
}

/// Turn a campaign name into its file-name slug.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, PersistError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PersistError::MalformedSave(format!("bad timestamp: {s}")))
}

// ============================================================================
// Rendering
// ============================================================================

/// Render a campaign state as a save document.
pub fn render(state: &CampaignState) -> String {
    let mut out = String::new();

    // Metadata
    out.push_str("# Metadata\n---\n");
    out.push_str(&format!("version: {}\n", state.version));
    out.push_str(&format!("campaign: {}\n", state.name));
    out.push_str(&format!("created: {}\n", fmt_ts(state.created_at)));
    out.push_str(&format!("last_played: {}\n", fmt_ts(state.last_played_at)));
    for line in &state.preserved.metadata {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("---\n\n");

    // World State
    out.push_str("# World State\n---\n");
    for kind in EntityKind::all() {
        out.push_str(&format!("## {}\n", kind.name()));
        for record in state.world.iter(*kind) {
            out.push_str(&render_entity_line(record));
            out.push('\n');
        }
    }
    for line in &state.preserved.world {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("---\n\n");

    // Story Plan
    out.push_str("# Story Plan\n---\n");
    for beat in state.plan.beats() {
        out.push_str(&format!(
            "{}. [{}] {}\n",
            beat.order,
            beat.status.marker(),
            beat.description
        ));
    }
    for line in &state.preserved.plan {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("---\n\n");

    // Scene History
    out.push_str("# Scene History\n---\n");
    for record in &state.scene_history {
        out.push_str("<details>\n");
        out.push_str(&format!(
            "<summary>{} \u{2013} \"{}\"</summary>\n\n",
            record.ended_at.format("%Y-%m-%d"),
            record.title
        ));
        out.push_str(&format!("**Scene**: {}\n", record.scene_id));
        out.push_str(&format!("**Started**: {}\n", fmt_ts(record.started_at)));
        out.push_str(&format!("**Ended**: {}\n", fmt_ts(record.ended_at)));
        if record.summary.forced {
            out.push_str(&format!("**Summary** (forced): {}\n", record.summary.text));
        } else {
            out.push_str(&format!("**Summary**: {}\n", record.summary.text));
        }
        out.push_str(&format!("**Transcript**: [[{}]]\n", record.transcript_ref));
        out.push_str("\n</details>\n");
    }
    for line in &state.preserved.scenes {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("---\n\n");

    // Open Threads
    out.push_str("# Open Threads\n---\n");
    for thread in &state.open_threads {
        let mark = if thread.resolved { "x" } else { " " };
        out.push_str(&format!("- [{mark}] {}\n", thread.text));
    }
    for line in &state.preserved.threads {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("---\n");

    out
}

fn render_entity_line(record: &EntityRecord) -> String {
    // Descriptions are single-line in the save format.
    let description = record.description.replace('\n', " ");
    if record.tags.is_empty() {
        format!("- **{}**: {}", record.name, description)
    } else {
        format!(
            "- **{}**: {} [tags: {}]",
            record.name,
            description,
            record.tags.join(", ")
        )
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse a save document back into a campaign state.
///
/// Fails with [`PersistError::SchemaVersionMismatch`] when the file's
/// version exceeds [`CAMPAIGN_VERSION`], and with
/// [`PersistError::MalformedSave`] on structural errors. Free-form lines
/// the parser does not recognize inside a known section are preserved
/// verbatim and re-emitted on the next save.
pub fn parse(text: &str) -> Result<CampaignState, PersistError> {
    let sections = split_sections(text)?;

    if sections.is_empty() || sections[0].0 != "Metadata" {
        return Err(PersistError::MalformedSave(
            "missing Metadata section".to_string(),
        ));
    }

    // Version gate first: a newer writer may use a layout this reader
    // cannot judge, so the version must win over structural checks.
    let mut extras = SectionExtras::default();
    let meta = parse_metadata(&sections[0].1, &mut extras)?;
    if meta.version > CAMPAIGN_VERSION {
        return Err(PersistError::SchemaVersionMismatch {
            supported: CAMPAIGN_VERSION,
            found: meta.version,
        });
    }

    let names: Vec<&str> = sections.iter().map(|(name, _)| name.as_str()).collect();
    if names != SECTION_ORDER {
        return Err(PersistError::MalformedSave(format!(
            "expected sections {SECTION_ORDER:?}, found {names:?}"
        )));
    }

    let world = parse_world(&sections[1].1, &mut extras)?;
    let plan = parse_plan(&sections[2].1, &mut extras)?;
    let scene_history = parse_scenes(&sections[3].1, &mut extras)?;
    let open_threads = parse_threads(&sections[4].1, meta.created, &mut extras);

    Ok(CampaignState {
        version: meta.version,
        name: meta.campaign,
        created_at: meta.created,
        last_played_at: meta.last_played,
        world,
        plan,
        scene_history,
        open_threads,
        preserved: extras,
    })
}

/// Split the document into `(heading, body-lines)` pairs, enforcing the
/// `# Heading` / `---` fence structure.
fn split_sections(text: &str) -> Result<Vec<(String, Vec<String>)>, PersistError> {
    let mut sections = Vec::new();
    let mut lines = text.lines().peekable();

    loop {
        // Skip blank lines between sections.
        while matches!(lines.peek(), Some(l) if l.trim().is_empty()) {
            lines.next();
        }
        let Some(heading) = lines.next() else { break };

        let name = heading
            .strip_prefix("# ")
            .ok_or_else(|| {
                PersistError::MalformedSave(format!("expected section heading, found: {heading}"))
            })?
            .trim()
            .to_string();

        match lines.next() {
            Some(fence) if fence.trim_end() == "---" => {}
            _ => {
                return Err(PersistError::MalformedSave(format!(
                    "section {name} is missing its opening fence"
                )))
            }
        }

        let mut body = Vec::new();
        let mut closed = false;
        for line in lines.by_ref() {
            if line.trim_end() == "---" {
                closed = true;
                break;
            }
            body.push(line.to_string());
        }
        if !closed {
            return Err(PersistError::MalformedSave(format!(
                "section {name} is missing its closing fence"
            )));
        }

        sections.push((name, body));
    }

    Ok(sections)
}

struct Metadata {
    version: u32,
    campaign: String,
    created: DateTime<Utc>,
    last_played: DateTime<Utc>,
}

fn parse_metadata(
    body: &[String],
    extras: &mut SectionExtras,
) -> Result<Metadata, PersistError> {
    let mut version = None;
    let mut campaign = None;
    let mut created = None;
    let mut last_played = None;

    for line in body {
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(PersistError::MalformedSave(format!(
                "broken metadata line: {line}"
            )));
        };
        let value = value.trim();
        match key.trim() {
            "version" => {
                version = Some(value.parse::<u32>().map_err(|_| {
                    PersistError::MalformedSave(format!("bad version: {value}"))
                })?)
            }
            "campaign" => campaign = Some(value.to_string()),
            "created" => created = Some(parse_ts(value)?),
            "last_played" => last_played = Some(parse_ts(value)?),
            _ => extras.metadata.push(line.clone()),
        }
    }

    let missing = |field: &str| PersistError::MalformedSave(format!("metadata missing {field}"));
    Ok(Metadata {
        version: version.ok_or_else(|| missing("version"))?,
        campaign: campaign.ok_or_else(|| missing("campaign"))?,
        created: created.ok_or_else(|| missing("created"))?,
        last_played: last_played.ok_or_else(|| missing("last_played"))?,
    })
}

fn parse_world(
    body: &[String],
    extras: &mut SectionExtras,
) -> Result<WorldState, PersistError> {
    let mut world = WorldState::new();
    let mut current: Option<EntityKind> = None;

    for line in body {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(heading) = trimmed.strip_prefix("## ") {
            current = EntityKind::all()
                .iter()
                .copied()
                .find(|k| k.name() == heading.trim());
            if current.is_none() {
                extras.world.push(line.clone());
            }
            continue;
        }
        match (current, parse_entity_line(trimmed)) {
            (Some(kind), Some(record)) => world.upsert(kind, record),
            _ => extras.world.push(line.clone()),
        }
    }

    Ok(world)
}

fn parse_entity_line(line: &str) -> Option<EntityRecord> {
    let rest = line.strip_prefix("- **")?;
    let (name, rest) = rest.split_once("**: ")?;
    let (description, tags) = match rest.rfind(" [tags: ") {
        Some(idx) if rest.ends_with(']') => {
            let tag_str = &rest[idx + " [tags: ".len()..rest.len() - 1];
            (
                rest[..idx].to_string(),
                tag_str.split(", ").map(str::to_string).collect(),
            )
        }
        _ => (rest.to_string(), Vec::new()),
    };
    Some(EntityRecord {
        name: name.to_string(),
        description,
        tags,
    })
}

fn parse_plan(body: &[String], extras: &mut SectionExtras) -> Result<StoryPlan, PersistError> {
    let mut beats: Vec<StoryBeat> = Vec::new();

    for line in body {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        match parse_beat_line(trimmed) {
            Some(beat) => beats.push(beat),
            None => extras.plan.push(line.clone()),
        }
    }

    for (i, beat) in beats.iter().enumerate() {
        if beat.order != i as u32 + 1 {
            return Err(PersistError::MalformedSave(format!(
                "story plan orders are not contiguous at beat {}",
                beat.order
            )));
        }
    }
    if beats.iter().filter(|b| b.status == BeatStatus::Active).count() > 1 {
        return Err(PersistError::MalformedSave(
            "story plan has more than one active beat".to_string(),
        ));
    }

    Ok(StoryPlan::from_beats(beats))
}

fn parse_beat_line(line: &str) -> Option<StoryBeat> {
    let (order, rest) = line.split_once(". ")?;
    let order = order.parse::<u32>().ok()?;
    let rest = rest.strip_prefix('[')?;
    let (marker, description) = rest.split_once("] ")?;
    Some(StoryBeat {
        order,
        description: description.to_string(),
        status: BeatStatus::from_marker(marker)?,
    })
}

fn parse_scenes(
    body: &[String],
    extras: &mut SectionExtras,
) -> Result<Vec<SceneRecord>, PersistError> {
    let mut records = Vec::new();
    let mut block: Option<Vec<&str>> = None;

    for line in body {
        let trimmed = line.trim_end();
        match (&mut block, trimmed) {
            (None, "<details>") => block = Some(Vec::new()),
            (None, "") => {}
            (None, _) => extras.scenes.push(line.clone()),
            (Some(inner), "</details>") => {
                records.push(parse_scene_block(inner)?);
                block = None;
            }
            (Some(inner), _) => inner.push(trimmed),
        }
    }
    if block.is_some() {
        return Err(PersistError::MalformedSave(
            "unterminated scene record block".to_string(),
        ));
    }

    Ok(records)
}

fn parse_scene_block(lines: &[&str]) -> Result<SceneRecord, PersistError> {
    let mut title = None;
    let mut scene_id = None;
    let mut started = None;
    let mut ended = None;
    let mut summary_text = None;
    let mut forced = false;
    let mut transcript_ref = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("<summary>") {
            let rest = rest.strip_suffix("</summary>").ok_or_else(|| {
                PersistError::MalformedSave(format!("broken scene summary line: {line}"))
            })?;
            let first = rest.find('"');
            let last = rest.rfind('"');
            match (first, last) {
                (Some(a), Some(b)) if a < b => title = Some(rest[a + 1..b].to_string()),
                _ => {
                    return Err(PersistError::MalformedSave(format!(
                        "scene title not found in: {line}"
                    )))
                }
            }
        } else if let Some(rest) = line.strip_prefix("**Scene**: ") {
            scene_id = Some(SceneId::parse(rest.trim()).ok_or_else(|| {
                PersistError::MalformedSave(format!("bad scene id: {rest}"))
            })?);
        } else if let Some(rest) = line.strip_prefix("**Started**: ") {
            started = Some(parse_ts(rest.trim())?);
        } else if let Some(rest) = line.strip_prefix("**Ended**: ") {
            ended = Some(parse_ts(rest.trim())?);
        } else if let Some(rest) = line.strip_prefix("**Summary** (forced): ") {
            summary_text = Some(rest.to_string());
            forced = true;
        } else if let Some(rest) = line.strip_prefix("**Summary**: ") {
            summary_text = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("**Transcript**: [[") {
            transcript_ref = Some(
                rest.strip_suffix("]]")
                    .ok_or_else(|| {
                        PersistError::MalformedSave(format!("broken transcript ref: {line}"))
                    })?
                    .to_string(),
            );
        } else {
            return Err(PersistError::MalformedSave(format!(
                "unrecognized scene record line: {line}"
            )));
        }
    }

    let missing =
        |field: &str| PersistError::MalformedSave(format!("scene record missing {field}"));
    let scene_id = scene_id.ok_or_else(|| missing("scene id"))?;
    let ended = ended.ok_or_else(|| missing("end time"))?;
    Ok(SceneRecord {
        scene_id,
        title: title.ok_or_else(|| missing("title"))?,
        started_at: started.ok_or_else(|| missing("start time"))?,
        ended_at: ended,
        summary: Summary {
            covers: SummarySpan::Scene(scene_id),
            text: summary_text.ok_or_else(|| missing("summary"))?,
            created_at: ended,
            forced,
        },
        transcript_ref: transcript_ref.ok_or_else(|| missing("transcript ref"))?,
    })
}

fn parse_threads(
    body: &[String],
    created: DateTime<Utc>,
    extras: &mut SectionExtras,
) -> Vec<OpenThread> {
    let mut threads = Vec::new();
    for line in body {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let (resolved, text) = if let Some(rest) = trimmed.strip_prefix("- [ ] ") {
            (false, rest)
        } else if let Some(rest) = trimmed.strip_prefix("- [x] ") {
            (true, rest)
        } else {
            extras.threads.push(line.clone());
            continue;
        };
        threads.push(OpenThread {
            text: text.to_string(),
            created_at: created,
            resolved,
        });
    }
    threads
}

// ============================================================================
// Durable store
// ============================================================================

/// A per-campaign save directory with ordered, atomic writes.
#[derive(Debug)]
pub struct SaveDir {
    root: PathBuf,
    /// Serializes writes: a save must complete before the next one for
    /// the same campaign begins.
    write_gate: Mutex<()>,
}

impl SaveDir {
    /// Create a store rooted at `root`. The directory is created lazily
    /// on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_gate: Mutex::new(()),
        }
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serialize `state` to a new timestamped save file.
    ///
    /// The document is written to a temporary path and renamed into
    /// place, so the canonical name never shows a partial write.
    pub async fn save(&self, state: &CampaignState) -> Result<PathBuf, PersistError> {
        let _gate = self.write_gate.lock().await;
        fs::create_dir_all(&self.root).await?;

        let stamp = state.last_played_at.format("%Y-%m-%dT%H-%M-%SZ");
        let filename = format!("{}_{stamp}{SAVE_SUFFIX}", slugify(&state.name));
        let path = self.root.join(&filename);
        let tmp = self.root.join(format!("{filename}.tmp"));

        fs::write(&tmp, render(state)).await?;
        fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    /// Parse a save file into a campaign state.
    pub async fn load(path: impl AsRef<Path>) -> Result<CampaignState, PersistError> {
        let content = fs::read_to_string(path).await?;
        parse(&content)
    }

    /// Locate and load the most recently modified save for `campaign`.
    ///
    /// Returns [`Resume::NoSaveFound`] when no matching save exists; the
    /// caller proceeds to Planning. A save that exists but cannot be
    /// read aborts the resume with the underlying error so the file is
    /// never silently discarded.
    pub async fn resume(&self, campaign: &str) -> Result<Resume, PersistError> {
        let prefix = format!("{}_", slugify(campaign));

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Resume::NoSaveFound),
            Err(e) => return Err(e.into()),
        };

        let mut best: Option<(std::time::SystemTime, String, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(SAVE_SUFFIX) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            let candidate = (modified, name, entry.path());
            if best.as_ref().map_or(true, |b| (&candidate.0, &candidate.1) > (&b.0, &b.1)) {
                best = Some(candidate);
            }
        }

        match best {
            Some((_, _, path)) => Ok(Resume::Restored(Self::load(path).await?)),
            None => Ok(Resume::NoSaveFound),
        }
    }

    /// Archive a scene's full turn sequence as pretty-printed JSON.
    ///
    /// Returns the transcript reference recorded in the scene's record.
    pub async fn archive_transcript(
        &self,
        campaign: &str,
        scene_id: SceneId,
        turns: &[Turn],
    ) -> Result<String, PersistError> {
        let dir = self.root.join("transcripts");
        fs::create_dir_all(&dir).await?;

        let filename = format!("{}_{scene_id}.json", slugify(campaign));
        let path = dir.join(&filename);
        let tmp = dir.join(format!("{filename}.tmp"));

        fs::write(&tmp, serde_json::to_string_pretty(turns)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(format!("transcripts/{filename}"))
    }

    /// Read back an archived transcript.
    pub async fn load_transcript(&self, transcript_ref: &str) -> Result<Vec<Turn>, PersistError> {
        let content = fs::read_to_string(self.root.join(transcript_ref)).await?;
        Ok(serde_json::from_str(&content)?)
    }
}
