use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persistence::{KvStore, VISUALS_KEY};

/// An archived image/JSON pair. Entries stand alone: no back-reference
/// to the chat message that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualEntry {
    pub id: String,
    pub title: String,
    pub image_data: String,
    pub json: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VisualEntryDraft {
    pub title: String,
    pub image_data: String,
    pub json: String,
    pub notes: Option<String>,
}

/// Partial update for an existing entry; absent fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct VisualEntryPatch {
    pub title: Option<String>,
    pub image_data: Option<String>,
    pub json: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug)]
pub struct VisualStore {
    kv: KvStore,
    entries: Vec<VisualEntry>,
}

impl VisualStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let mut store = Self {
            kv: KvStore::new(path),
            entries: Vec::new(),
        };
        store.reload()?;
        Ok(store)
    }

    pub fn reload(&mut self) -> anyhow::Result<()> {
        self.entries = match self.kv.get(VISUALS_KEY) {
            None => Vec::new(),
            Some(value) => serde_json::from_value(value)?,
        };
        Ok(())
    }

    pub fn entries(&self) -> &[VisualEntry] {
        &self.entries
    }

    /// Adds a fresh entry at the front. Duplicate image or JSON content
    /// is permitted; captures are never deduplicated.
    pub fn add(&mut self, draft: VisualEntryDraft) -> anyhow::Result<VisualEntry> {
        let entry = VisualEntry {
            id: Uuid::new_v4().to_string(),
            title: draft.title,
            image_data: draft.image_data,
            json: draft.json,
            created_at: now_utc_iso(),
            notes: draft.notes,
        };
        self.entries.insert(0, entry.clone());
        self.persist()?;
        Ok(entry)
    }

    pub fn remove(&mut self, id: &str) -> anyhow::Result<()> {
        self.entries.retain(|entry| entry.id != id);
        self.persist()
    }

    /// Merges the provided fields into the entry with the given id. A
    /// missing id is a silent no-op, not an error.
    pub fn update(&mut self, id: &str, patch: VisualEntryPatch) -> anyhow::Result<()> {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) else {
            return Ok(());
        };
        if let Some(title) = patch.title {
            entry.title = title;
        }
        if let Some(image_data) = patch.image_data {
            entry.image_data = image_data;
        }
        if let Some(json) = patch.json {
            entry.json = json;
        }
        if let Some(notes) = patch.notes {
            entry.notes = Some(notes);
        }
        self.persist()
    }

    /// Case-insensitive substring search over title, notes and JSON.
    pub fn search(&self, query: &str) -> Vec<VisualEntry> {
        let normalized = query.to_lowercase();
        self.entries
            .iter()
            .filter(|entry| {
                normalized.is_empty()
                    || entry.title.to_lowercase().contains(&normalized)
                    || entry
                        .notes
                        .as_deref()
                        .map(|notes| notes.to_lowercase().contains(&normalized))
                        .unwrap_or(false)
                    || entry.json.to_lowercase().contains(&normalized)
            })
            .cloned()
            .collect()
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.kv
            .set(VISUALS_KEY, serde_json::to_value(&self.entries)?)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
