use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::persistence::{KvStore, TEMPLATES_KEY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub json: String,
    pub version: u64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateDraft {
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub json: String,
    pub thumbnail: Option<String>,
}

/// Style presets merged into outgoing completion requests. The list is
/// persisted wholesale on every mutation; new entries are prepended.
#[derive(Debug)]
pub struct TemplateStore {
    kv: KvStore,
    templates: Vec<PromptTemplate>,
    active_id: Option<String>,
}

impl TemplateStore {
    /// Loads the persisted templates, seeding the starter presets when
    /// the collection is empty.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let mut store = Self {
            kv: KvStore::new(path),
            templates: Vec::new(),
            active_id: None,
        };
        store.reload()?;
        if store.templates.is_empty() {
            store.templates = starter_templates();
            store.persist()?;
        }
        Ok(store)
    }

    pub fn reload(&mut self) -> anyhow::Result<()> {
        self.templates = match self.kv.get(TEMPLATES_KEY) {
            None => Vec::new(),
            Some(value) => serde_json::from_value(value)?,
        };
        if let Some(active) = &self.active_id {
            if !self.templates.iter().any(|template| &template.id == active) {
                self.active_id = None;
            }
        }
        Ok(())
    }

    pub fn templates(&self) -> &[PromptTemplate] {
        &self.templates
    }

    pub fn active_template(&self) -> Option<&PromptTemplate> {
        let active = self.active_id.as_deref()?;
        self.templates.iter().find(|template| template.id == active)
    }

    /// Sets the active overlay by id; `None` (or an unknown id) clears it.
    pub fn set_active(&mut self, id: Option<&str>) {
        self.active_id = id
            .and_then(|id| self.templates.iter().find(|template| template.id == id))
            .map(|template| template.id.clone());
    }

    pub fn save_template(&mut self, draft: TemplateDraft) -> anyhow::Result<PromptTemplate> {
        let now = now_utc_iso();
        let template = PromptTemplate {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            description: draft.description,
            tags: draft.tags,
            json: draft.json,
            version: 1,
            created_at: now.clone(),
            updated_at: now,
            thumbnail: draft.thumbnail,
        };
        self.templates.insert(0, template.clone());
        self.persist()?;
        Ok(template)
    }

    pub fn remove_template(&mut self, id: &str) -> anyhow::Result<()> {
        self.templates.retain(|template| template.id != id);
        if self.active_id.as_deref() == Some(id) {
            self.active_id = None;
        }
        self.persist()
    }

    /// Copies an existing template under a " copy" name. No-op when the
    /// id is unknown.
    pub fn duplicate_template(&mut self, id: &str) -> anyhow::Result<Option<PromptTemplate>> {
        let Some(source) = self
            .templates
            .iter()
            .find(|template| template.id == id)
            .cloned()
        else {
            return Ok(None);
        };
        let copy = self.save_template(TemplateDraft {
            name: format!("{} copy", source.name),
            description: source.description,
            tags: source.tags,
            json: source.json,
            thumbnail: source.thumbnail,
        })?;
        Ok(Some(copy))
    }

    /// Case-insensitive substring filter over name, description and JSON
    /// body, optionally narrowed to an exact tag.
    pub fn filter(&self, query: &str, tag: Option<&str>) -> Vec<PromptTemplate> {
        let normalized = query.to_lowercase();
        self.templates
            .iter()
            .filter(|template| {
                let matches_query = normalized.is_empty()
                    || template.name.to_lowercase().contains(&normalized)
                    || template
                        .description
                        .as_deref()
                        .map(|description| description.to_lowercase().contains(&normalized))
                        .unwrap_or(false)
                    || template.json.to_lowercase().contains(&normalized);
                let matches_tag = tag
                    .map(|tag| template.tags.iter().any(|existing| existing == tag))
                    .unwrap_or(true);
                matches_query && matches_tag
            })
            .cloned()
            .collect()
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.kv
            .set(TEMPLATES_KEY, serde_json::to_value(&self.templates)?)
    }
}

fn starter_templates() -> Vec<PromptTemplate> {
    let now = now_utc_iso();
    vec![
        PromptTemplate {
            id: "cinema".to_string(),
            name: "Cinematic Portrait".to_string(),
            description: Some("High-drama portrait lighting preset.".to_string()),
            tags: vec!["portrait".to_string(), "cinematic".to_string()],
            json: pretty(json!({
                "style": "cinematic still",
                "subject": {"description": "subject", "expression": "neutral", "hair": "short hair"},
                "background": {"layer": "urban alley with neon"},
                "lighting": "rim lighting",
                "mood": "moody"
            })),
            version: 1,
            created_at: now.clone(),
            updated_at: now.clone(),
            thumbnail: Some("Cinematic still · neon alley".to_string()),
        },
        PromptTemplate {
            id: "studio".to_string(),
            name: "Studio Product".to_string(),
            description: Some("Clean tabletop commercial style.".to_string()),
            tags: vec!["product".to_string(), "studio".to_string()],
            json: pretty(json!({
                "style": "studio product",
                "subject": {"description": "object", "expression": "n/a"},
                "background": {"layer": "seamless white"},
                "lighting": "softbox",
                "mood": "crisp and premium"
            })),
            version: 1,
            created_at: now.clone(),
            updated_at: now,
            thumbnail: Some("Studio white sweep".to_string()),
        },
    ]
}

fn pretty(value: Value) -> String {
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
