use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use indexmap::IndexMap;
use jsoncraft_contracts::events::{EventLog, EventPayload};
use jsoncraft_contracts::messages::{ChatMessage, ChatSession, MessageUsage, Role, SessionRecord};
use jsoncraft_contracts::persistence::{KvStore, SESSIONS_KEY};
use jsoncraft_contracts::prompt::templates::TemplateStore;
use jsoncraft_contracts::prompt::validator::{validate_output, ValidationOutcome};
use jsoncraft_contracts::visual::{VisualEntryDraft, VisualStore};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const SYSTEM_PROMPT: &str = "You are JSONCraft, an assistant that ONLY outputs valid JSON \
following the provided schema and never plain text. If unsure, return an empty JSON object \
with an `error` field.";

const WELCOME_MESSAGE_ID: &str = "welcome";

const WELCOME_MESSAGE_TEXT: &str = "Hello, how can I help you today? I am JSONCraft: \
AI-Assisted Image Creation Engine, specializing in editing JSON for images and helping you \
make amazing photos.";

pub const FALLBACK_IMAGE_PROMPT: &str = "Describe the uploaded image";

const MAX_OUTPUT_TOKENS: u64 = 500;
const ATTACHMENT_MAX_EDGE: u32 = 1024;
const ATTACHMENT_JPEG_QUALITY: u8 = 85;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api";
pub const DEFAULT_MODEL: &str = "nvidia/nemotron-nano-12b-v2-vl:free";
pub const DEFAULT_CLIENT: &str = "openrouter";

/// Transport-layer failure from the completion collaborator: a non-2xx
/// status, or a malformed response envelope (422 semantics).
#[derive(Debug, Clone)]
pub struct ApiFailure {
    pub status: u16,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl ApiFailure {
    fn envelope(message: impl Into<String>) -> Self {
        Self {
            status: 422,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "completion request failed ({})", self.status)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(seconds) = self.retry_after {
            write!(f, " (retry after {seconds}s)")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiFailure {}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub role: String,
    pub text: String,
    pub image_data: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<OutgoingMessage>,
    pub max_output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionChoice {
    pub role: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub choices: Vec<CompletionChoice>,
}

pub trait CompletionClient: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

#[derive(Default)]
pub struct CompletionClientRegistry {
    clients: BTreeMap<String, Box<dyn CompletionClient>>,
}

impl CompletionClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: CompletionClient + 'static>(&mut self, client: C) {
        self.clients
            .insert(client.name().to_string(), Box::new(client));
    }

    pub fn get(&self, name: &str) -> Option<&dyn CompletionClient> {
        self.clients.get(name).map(|client| client.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub client: String,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: non_empty_env("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: non_empty_env("OPENROUTER_API_KEY"),
            model: non_empty_env("JSONCRAFT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            client: non_empty_env("JSONCRAFT_CLIENT")
                .unwrap_or_else(|| DEFAULT_CLIENT.to_string()),
        }
    }
}

pub struct OpenRouterClient {
    base_url: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl OpenRouterClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

impl CompletionClient for OpenRouterClient {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let body = json!({
            "model": request.model,
            "response_format": {"type": "json_object"},
            "messages": request
                .messages
                .iter()
                .map(wire_message)
                .collect::<Vec<Value>>(),
            "stream": false,
            "max_output_tokens": request.max_output_tokens,
        });

        let endpoint = self.endpoint();
        let mut http_request = self
            .http
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/json");
        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key);
        }
        let response = http_request
            .json(&body)
            .send()
            .with_context(|| format!("completion request failed ({endpoint})"))?;

        let payload = completion_json_or_failure(response)?;
        let completion = decode_completion(&payload)?;
        let content = completion
            .choices
            .first()
            .map(|choice| choice.content.trim().to_string())
            .unwrap_or_default();
        if !content.starts_with('{') {
            return Err(ApiFailure::envelope("assistant did not return JSON content").into());
        }
        Ok(completion)
    }
}

/// Offline client for demos and tests: derives a stable structured
/// envelope from a SHA-256 digest of the outgoing user text.
pub struct DryrunClient;

const DRYRUN_STYLES: &[&str] = &[
    "cinematic still",
    "studio product",
    "watercolor illustration",
    "neon noir",
];
const DRYRUN_LIGHTING: &[&str] = &["rim lighting", "softbox", "golden hour", "hard flash"];
const DRYRUN_MOODS: &[&str] = &["moody", "crisp and premium", "serene", "electric"];
const DRYRUN_PALETTES: &[&str] = &["teal and orange", "monochrome", "pastel", "high contrast"];

impl CompletionClient for DryrunClient {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let user_text = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.text.as_str())
            .unwrap_or_default();
        let digest = Sha256::digest(user_text.as_bytes());

        let envelope = json!({
            "prompt": {
                "style": DRYRUN_STYLES[digest[0] as usize % DRYRUN_STYLES.len()],
                "subject": {"description": truncate_text(user_text, 80)},
                "background": {
                    "palette": DRYRUN_PALETTES[digest[1] as usize % DRYRUN_PALETTES.len()]
                },
                "lighting": DRYRUN_LIGHTING[digest[2] as usize % DRYRUN_LIGHTING.len()],
                "mood": DRYRUN_MOODS[digest[3] as usize % DRYRUN_MOODS.len()]
            },
            "reasoning": ["deterministic dryrun rendering"]
        });

        Ok(CompletionResponse {
            id: format!("dryrun-{}", hex::encode(&digest[..4])),
            model: request.model.clone(),
            created: Utc::now().timestamp(),
            choices: vec![CompletionChoice {
                role: "assistant".to_string(),
                content: serde_json::to_string(&envelope)?,
                finish_reason: Some("stop".to_string()),
                total_tokens: Some((user_text.chars().count() as u64 / 4).max(1)),
            }],
        })
    }
}

pub fn build_registry(config: &ClientConfig) -> CompletionClientRegistry {
    let mut registry = CompletionClientRegistry::new();
    registry.register(OpenRouterClient::new(config));
    registry.register(DryrunClient);
    registry
}

/// Loads an image from disk, downscales anything above 1024 px on the
/// long edge and re-encodes as JPEG, returning a base64 data URL.
pub fn load_attachment(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let decoded = image::load_from_memory(&bytes)
        .with_context(|| format!("failed to decode image {}", path.display()))?;
    let rgb = decoded.into_rgb8();
    let (width, height) = rgb.dimensions();
    let long_edge = width.max(height);
    let rgb = if long_edge > ATTACHMENT_MAX_EDGE {
        let scale = ATTACHMENT_MAX_EDGE as f32 / long_edge as f32;
        let scaled_width = ((width as f32 * scale).round() as u32).max(1);
        let scaled_height = ((height as f32 * scale).round() as u32).max(1);
        image::imageops::resize(&rgb, scaled_width, scaled_height, FilterType::Triangle)
    } else {
        rgb
    };
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, ATTACHMENT_JPEG_QUALITY)
        .encode_image(&rgb)
        .context("failed to encode attachment as JPEG")?;
    Ok(format!(
        "data:image/jpeg;base64,{}",
        BASE64.encode(&encoded)
    ))
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Completed { message: ChatMessage },
    /// The completion resolved under a stale generation token (a stop or
    /// a newer send intervened) and was dropped without touching state.
    Discarded,
}

/// Post-validation archive hook: decides whether a send outcome becomes
/// a gallery entry. Only outcomes that carry a payload (accepted, or
/// rejected with a recovered payload) and a user image qualify.
pub fn archive_candidate(
    user_message: &ChatMessage,
    outcome: &ValidationOutcome,
    rendered: &str,
    session_id: &str,
) -> Option<VisualEntryDraft> {
    let image_data = user_message.image_data.as_ref()?;
    if !outcome.is_accepted() && outcome.recovered_payload().is_none() {
        return None;
    }
    Some(VisualEntryDraft {
        title: format!("Capture {}", now_utc_iso()),
        image_data: image_data.clone(),
        json: rendered.to_string(),
        notes: Some(format!("Auto-saved from session {session_id}")),
    })
}

/// Owns chat sessions and drives the send → validate → react state
/// machine. Single-threaded; persistence is written after every
/// mutation of a session's message list.
pub struct ChatEngine {
    kv: KvStore,
    sessions: IndexMap<String, SessionRecord>,
    current_session_id: Option<String>,
    assistant_is_typing: bool,
    validation_errors: Option<String>,
    usage_tokens: u64,
    generation: u64,
    model: String,
    client_name: String,
    registry: CompletionClientRegistry,
    templates: TemplateStore,
    visuals: VisualStore,
    events: EventLog,
}

impl ChatEngine {
    /// Opens the data directory, loading persisted sessions, templates
    /// and gallery entries. Selects the most recently updated session,
    /// or starts a fresh one when none exist.
    pub fn open(data_dir: &Path, config: ClientConfig) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let store_path = data_dir.join("jsoncraft.json");

        let mut engine = Self {
            kv: KvStore::new(&store_path),
            sessions: IndexMap::new(),
            current_session_id: None,
            assistant_is_typing: false,
            validation_errors: None,
            usage_tokens: 0,
            generation: 0,
            model: config.model.clone(),
            client_name: config.client.clone(),
            registry: build_registry(&config),
            templates: TemplateStore::open(&store_path)?,
            visuals: VisualStore::open(&store_path)?,
            events: EventLog::new(data_dir.join("events.jsonl")),
        };

        engine.load_sessions()?;
        engine.current_session_id = latest_session_id(&engine.sessions);
        if engine.current_session_id.is_none() {
            engine.start_session()?;
        }
        Ok(engine)
    }

    pub fn sessions(&self) -> &IndexMap<String, SessionRecord> {
        &self.sessions
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    pub fn current_session(&self) -> Option<&SessionRecord> {
        let id = self.current_session_id.as_deref()?;
        self.sessions.get(id)
    }

    pub fn assistant_is_typing(&self) -> bool {
        self.assistant_is_typing
    }

    pub fn validation_errors(&self) -> Option<&str> {
        self.validation_errors.as_deref()
    }

    pub fn usage_tokens(&self) -> u64 {
        self.usage_tokens
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn set_client(&mut self, name: &str) -> Result<()> {
        if self.registry.get(name).is_none() {
            bail!(
                "unknown completion client '{name}' (available: {})",
                self.registry.names().join(", ")
            );
        }
        self.client_name = name.to_string();
        Ok(())
    }

    pub fn register_client<C: CompletionClient + 'static>(&mut self, client: C) {
        self.registry.register(client);
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn templates_mut(&mut self) -> &mut TemplateStore {
        &mut self.templates
    }

    pub fn visuals(&self) -> &VisualStore {
        &self.visuals
    }

    pub fn visuals_mut(&mut self) -> &mut VisualStore {
        &mut self.visuals
    }

    pub fn start_session(&mut self) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_utc_iso();
        let record = SessionRecord {
            meta: ChatSession {
                id: id.clone(),
                title: "New session".to_string(),
                created_at: now.clone(),
                updated_at: now,
            },
            messages: vec![welcome_message()],
        };
        self.sessions.insert(id.clone(), record);
        self.current_session_id = Some(id.clone());
        self.persist_sessions()?;
        self.log_event("session_started", session_payload(&id));
        Ok(id)
    }

    pub fn switch_session(&mut self, id: &str) -> Result<()> {
        if !self.sessions.contains_key(id) {
            bail!("unknown session '{id}'");
        }
        self.current_session_id = Some(id.to_string());
        Ok(())
    }

    /// Total removal, in memory and persisted. The current session falls
    /// back to any remaining one.
    pub fn delete_session(&mut self, id: &str) -> Result<()> {
        self.sessions.shift_remove(id);
        if self.current_session_id.as_deref() == Some(id) {
            self.current_session_id = self.sessions.keys().next().cloned();
        }
        self.persist_sessions()?;
        self.log_event("session_deleted", session_payload(id));
        Ok(())
    }

    /// Resets a session's transcript to just the welcome message.
    pub fn clear_chat(&mut self, id: &str) -> Result<()> {
        let Some(record) = self.sessions.get_mut(id) else {
            return Ok(());
        };
        record.messages = vec![welcome_message()];
        record.meta.updated_at = now_utc_iso();
        self.persist_sessions()?;
        self.log_event("chat_cleared", session_payload(id));
        Ok(())
    }

    /// Runs the full send procedure against the current session: append
    /// the user message, call the completion client, classify the result
    /// and react to it.
    pub fn send_message(
        &mut self,
        content: &str,
        image_data: Option<String>,
    ) -> Result<SendOutcome> {
        let Some(session_id) = self.current_session_id.clone() else {
            bail!("no active session");
        };
        let trimmed = content.trim();
        let normalized = if trimmed.is_empty() {
            FALLBACK_IMAGE_PROMPT.to_string()
        } else {
            trimmed.to_string()
        };

        let user_message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: normalized.clone(),
            created_at: now_utc_iso(),
            usage: None,
            error: None,
            image_data,
        };
        {
            let Some(record) = self.sessions.get_mut(&session_id) else {
                bail!("unknown session '{session_id}'");
            };
            record.messages.push(user_message.clone());
            record.meta.updated_at = now_utc_iso();
        }
        self.assistant_is_typing = true;
        self.validation_errors = None;
        let token = self.begin_request();
        self.persist_sessions()?;

        let mut payload = session_payload(&session_id);
        payload.insert(
            "has_image".to_string(),
            Value::Bool(user_message.image_data.is_some()),
        );
        self.log_event("message_sent", payload);

        let request = self.compose_request(&normalized, user_message.image_data.clone());
        let result = match self.registry.get(&self.client_name) {
            Some(client) => client.complete(&request),
            None => Err(anyhow::anyhow!(
                "unknown completion client '{}'",
                self.client_name
            )),
        };
        self.apply_completion(&session_id, token, &user_message, result)
    }

    /// Re-runs the send procedure with an existing message's content and
    /// attachment. Always appends; the transcript is never rewritten.
    pub fn retry_message(&mut self, message_id: &str) -> Result<SendOutcome> {
        let Some(session_id) = self.current_session_id.clone() else {
            bail!("no active session");
        };
        let source = self
            .sessions
            .get(&session_id)
            .and_then(|record| {
                record
                    .messages
                    .iter()
                    .find(|message| message.id == message_id)
            })
            .cloned();
        let Some(source) = source else {
            bail!("message '{message_id}' not found in the current session");
        };
        self.send_message(&source.content, source.image_data)
    }

    /// Clears the busy flag and invalidates the in-flight generation
    /// token. The underlying transport call is not aborted; its eventual
    /// result is discarded by the token check.
    pub fn stop_assistant(&mut self) {
        self.assistant_is_typing = false;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Captures a fresh generation token for an outgoing request. A
    /// completion applied under an older token is discarded.
    pub fn begin_request(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    /// Reacts to a resolved completion: classifies it through the
    /// validator, appends the assistant message, raises the banner on
    /// rejection and forwards archive candidates to the gallery.
    pub fn apply_completion(
        &mut self,
        session_id: &str,
        token: u64,
        user_message: &ChatMessage,
        result: Result<CompletionResponse>,
    ) -> Result<SendOutcome> {
        if token != self.generation {
            self.log_event("completion_discarded", session_payload(session_id));
            return Ok(SendOutcome::Discarded);
        }
        self.assistant_is_typing = false;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                let message =
                    self.append_failure(session_id, error_chain_text(&err, 512))?;
                return Ok(SendOutcome::Completed { message });
            }
        };
        let Some(choice) = response.choices.first().cloned() else {
            let message = self.append_failure(
                session_id,
                "completion response carried no choices".to_string(),
            )?;
            return Ok(SendOutcome::Completed { message });
        };

        let outcome = validate_output(&choice.content);
        let rendered = match &outcome {
            ValidationOutcome::Accepted { data } => serde_json::to_string_pretty(data)?,
            ValidationOutcome::Rejected {
                parsed: Some(value),
                ..
            } => serde_json::to_string_pretty(value)?,
            ValidationOutcome::Rejected { parsed: None, .. } => choice.content.clone(),
        };
        let tokens = choice.total_tokens.unwrap_or(0);
        self.usage_tokens += tokens;

        let assistant_message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: rendered.clone(),
            created_at: now_utc_iso(),
            usage: Some(MessageUsage { tokens }),
            error: if outcome.is_accepted() {
                None
            } else {
                Some("Validation failed".to_string())
            },
            image_data: None,
        };
        if let Some(record) = self.sessions.get_mut(session_id) {
            record.messages.push(assistant_message.clone());
        }

        match &outcome {
            ValidationOutcome::Accepted { .. } => {
                self.validation_errors = None;
                self.log_event("completion_received", session_payload(session_id));
            }
            ValidationOutcome::Rejected { detail, .. } => {
                let banner = detail.render();
                let mut payload = session_payload(session_id);
                payload.insert("detail".to_string(), Value::String(banner.clone()));
                self.validation_errors = Some(banner);
                self.log_event("validation_failed", payload);
            }
        }

        if let Some(draft) = archive_candidate(user_message, &outcome, &rendered, session_id) {
            let entry = self.visuals.add(draft)?;
            let mut payload = session_payload(session_id);
            payload.insert("entry_id".to_string(), Value::String(entry.id));
            self.log_event("entry_archived", payload);
        }

        self.persist_sessions()?;
        Ok(SendOutcome::Completed {
            message: assistant_message,
        })
    }

    /// Full-dataset snapshot of every persisted collection.
    pub fn export_data(&self) -> Value {
        self.log_event("data_exported", EventPayload::new());
        self.kv.export_all()
    }

    /// Wholesale import of a snapshot; reloads every store and re-selects
    /// the most recently updated session.
    pub fn import_data(&mut self, payload: &Value) -> Result<()> {
        self.kv.import_all(payload)?;
        self.load_sessions()?;
        self.templates.reload()?;
        self.visuals.reload()?;
        self.current_session_id = latest_session_id(&self.sessions);
        if self.current_session_id.is_none() {
            self.start_session()?;
        }
        self.log_event("data_imported", EventPayload::new());
        Ok(())
    }

    fn compose_request(&self, user_text: &str, image_data: Option<String>) -> CompletionRequest {
        let mut messages = vec![OutgoingMessage {
            role: "system".to_string(),
            text: SYSTEM_PROMPT.to_string(),
            image_data: None,
        }];
        if let Some(template) = self.templates.active_template() {
            messages.push(OutgoingMessage {
                role: "system".to_string(),
                text: format!(
                    "Active style template (merge these defaults):\n{}",
                    template.json
                ),
                image_data: None,
            });
        }
        messages.push(OutgoingMessage {
            role: "user".to_string(),
            text: user_text.to_string(),
            image_data,
        });
        CompletionRequest {
            model: self.model.clone(),
            messages,
            max_output_tokens: MAX_OUTPUT_TOKENS,
        }
    }

    fn append_failure(&mut self, session_id: &str, detail: String) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: "Request failed".to_string(),
            created_at: now_utc_iso(),
            usage: None,
            error: Some(detail.clone()),
            image_data: None,
        };
        if let Some(record) = self.sessions.get_mut(session_id) {
            record.messages.push(message.clone());
        }
        self.persist_sessions()?;
        let mut payload = session_payload(session_id);
        payload.insert("detail".to_string(), Value::String(detail));
        self.log_event("transport_failed", payload);
        Ok(message)
    }

    fn load_sessions(&mut self) -> Result<()> {
        self.sessions.clear();
        let Some(stored) = self.kv.get(SESSIONS_KEY) else {
            return Ok(());
        };
        let Some(obj) = stored.as_object() else {
            return Ok(());
        };
        for (id, value) in obj {
            if let Ok(record) = serde_json::from_value::<SessionRecord>(value.clone()) {
                self.sessions.insert(id.clone(), record);
            }
        }
        Ok(())
    }

    fn persist_sessions(&self) -> Result<()> {
        let mut payload = serde_json::Map::new();
        for (id, record) in &self.sessions {
            payload.insert(id.clone(), serde_json::to_value(record)?);
        }
        self.kv.set(SESSIONS_KEY, Value::Object(payload))
    }

    fn log_event(&self, event_type: &str, payload: EventPayload) {
        // Journal writes are best effort; they never fail the operation.
        let _ = self.events.emit(event_type, payload);
    }
}

fn welcome_message() -> ChatMessage {
    ChatMessage {
        id: WELCOME_MESSAGE_ID.to_string(),
        role: Role::Assistant,
        content: WELCOME_MESSAGE_TEXT.to_string(),
        created_at: now_utc_iso(),
        usage: None,
        error: None,
        image_data: None,
    }
}

fn latest_session_id(sessions: &IndexMap<String, SessionRecord>) -> Option<String> {
    sessions
        .values()
        .max_by(|a, b| a.meta.updated_at.cmp(&b.meta.updated_at))
        .map(|record| record.meta.id.clone())
}

fn session_payload(session_id: &str) -> EventPayload {
    let mut payload = EventPayload::new();
    payload.insert(
        "session_id".to_string(),
        Value::String(session_id.to_string()),
    );
    payload
}

fn wire_message(message: &OutgoingMessage) -> Value {
    match &message.image_data {
        None => json!({"role": message.role, "content": message.text}),
        Some(image) => json!({
            "role": message.role,
            "content": [
                {"type": "text", "text": message.text},
                {"type": "image_url", "image_url": {"url": image}}
            ]
        }),
    }
}

fn completion_json_or_failure(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let body = response
        .text()
        .context("completion response body read failed")?;
    if !status.is_success() {
        return Err(ApiFailure {
            status: status.as_u16(),
            message: truncate_text(&body, 512),
            retry_after,
        }
        .into());
    }
    serde_json::from_str(&body)
        .map_err(|_| ApiFailure::envelope("completion endpoint returned invalid JSON").into())
}

fn decode_completion(payload: &Value) -> Result<CompletionResponse> {
    let Some(obj) = payload.as_object() else {
        return Err(ApiFailure::envelope("completion payload is not an object").into());
    };
    let Some(id) = obj.get("id").and_then(Value::as_str) else {
        return Err(ApiFailure::envelope("completion payload missing 'id'").into());
    };
    let Some(model) = obj.get("model").and_then(Value::as_str) else {
        return Err(ApiFailure::envelope("completion payload missing 'model'").into());
    };
    let Some(created) = obj.get("created").and_then(Value::as_i64) else {
        return Err(ApiFailure::envelope("completion payload missing 'created'").into());
    };
    let Some(rows) = obj.get("choices").and_then(Value::as_array) else {
        return Err(ApiFailure::envelope("completion payload missing 'choices'").into());
    };
    if rows.is_empty() {
        return Err(ApiFailure::envelope("completion payload carried no choices").into());
    }

    let mut choices = Vec::with_capacity(rows.len());
    for row in rows {
        let message = row.get("message").and_then(Value::as_object);
        let role = message
            .and_then(|message| message.get("role"))
            .and_then(Value::as_str);
        let content = message
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str);
        let (Some(role), Some(content)) = (role, content) else {
            return Err(
                ApiFailure::envelope("completion choice missing message role or content").into(),
            );
        };
        choices.push(CompletionChoice {
            role: role.to_string(),
            content: content.to_string(),
            finish_reason: row
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            total_tokens: row
                .get("usage")
                .and_then(|usage| usage.get("total_tokens"))
                .and_then(Value::as_u64),
        });
    }

    Ok(CompletionResponse {
        id: id.to_string(),
        model: model.to_string(),
        created,
        choices,
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use base64::Engine as _;
    use jsoncraft_contracts::messages::Role;
    use jsoncraft_contracts::prompt::validator::validate_output;
    use serde_json::json;

    use super::{
        archive_candidate, load_attachment, ApiFailure, ChatEngine, ClientConfig,
        CompletionChoice, CompletionClient, CompletionRequest, CompletionResponse, DryrunClient,
        SendOutcome, FALLBACK_IMAGE_PROMPT,
    };

    struct ScriptedClient {
        content: String,
        seen: Arc<Mutex<Vec<CompletionRequest>>>,
    }

    impl ScriptedClient {
        fn new(content: &str) -> Self {
            Self {
                content: content.to_string(),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl CompletionClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        fn complete(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(request.clone());
            }
            Ok(CompletionResponse {
                id: "scripted-1".to_string(),
                model: request.model.clone(),
                created: 0,
                choices: vec![CompletionChoice {
                    role: "assistant".to_string(),
                    content: self.content.clone(),
                    finish_reason: Some("stop".to_string()),
                    total_tokens: Some(11),
                }],
            })
        }
    }

    struct FailingClient;

    impl CompletionClient for FailingClient {
        fn name(&self) -> &str {
            "scripted"
        }

        fn complete(&self, _request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
            Err(ApiFailure {
                status: 429,
                message: "rate limited".to_string(),
                retry_after: Some(7),
            }
            .into())
        }
    }

    fn test_config() -> ClientConfig {
        ClientConfig {
            base_url: "http://localhost".to_string(),
            api_key: None,
            model: "test-model".to_string(),
            client: "scripted".to_string(),
        }
    }

    fn engine_with<C: CompletionClient + 'static>(
        data_dir: &Path,
        client: C,
    ) -> anyhow::Result<ChatEngine> {
        let mut engine = ChatEngine::open(data_dir, test_config())?;
        engine.register_client(client);
        Ok(engine)
    }

    const IMAGE_DATA: &str = "data:image/jpeg;base64,Zm9v";

    #[test]
    fn send_with_image_archives_exactly_one_entry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = engine_with(
            temp.path(),
            ScriptedClient::new("{\"prompt\":\"a cat on a chair\",\"reasoning\":\"simple\"}"),
        )?;

        let outcome = engine.send_message(
            "Describe the uploaded image",
            Some(IMAGE_DATA.to_string()),
        )?;
        let SendOutcome::Completed { message } = outcome else {
            panic!("expected a completed send");
        };

        let session = engine.current_session().expect("session exists");
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[1].role, Role::User);
        assert_eq!(
            session.messages[1].image_data.as_deref(),
            Some(IMAGE_DATA)
        );
        assert_eq!(session.messages[2].role, Role::Assistant);
        assert_eq!(message.error, None);
        assert_eq!(
            message.content,
            serde_json::to_string_pretty(&json!({
                "prompt": "a cat on a chair",
                "reasoning": "simple"
            }))?
        );
        assert_eq!(engine.validation_errors(), None);
        assert_eq!(engine.usage_tokens(), 11);

        let entries = engine.visuals().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].image_data, IMAGE_DATA);
        assert_eq!(entries[0].json, message.content);
        assert!(entries[0]
            .notes
            .as_deref()
            .unwrap_or_default()
            .starts_with("Auto-saved from session "));
        Ok(())
    }

    #[test]
    fn send_without_image_never_archives() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = engine_with(
            temp.path(),
            ScriptedClient::new("{\"prompt\":\"a cat on a chair\"}"),
        )?;
        engine.send_message("Describe a cat", None)?;
        assert!(engine.visuals().entries().is_empty());
        Ok(())
    }

    #[test]
    fn schema_failure_recovers_payload_and_raises_banner() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = engine_with(temp.path(), ScriptedClient::new("{\"unexpected\":true}"))?;

        let outcome =
            engine.send_message("Describe the uploaded image", Some(IMAGE_DATA.to_string()))?;
        let SendOutcome::Completed { message } = outcome else {
            panic!("expected a completed send");
        };

        assert_eq!(message.error.as_deref(), Some("Validation failed"));
        assert_eq!(
            message.content,
            serde_json::to_string_pretty(&json!({"unexpected": true}))?
        );
        assert!(engine
            .validation_errors()
            .unwrap_or_default()
            .contains("prompt"));
        // Recovered payloads still archive when an image was attached.
        assert_eq!(engine.visuals().entries().len(), 1);
        Ok(())
    }

    #[test]
    fn parse_failure_shows_raw_text_and_skips_archive() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = engine_with(temp.path(), ScriptedClient::new("{oops"))?;

        let outcome =
            engine.send_message("Describe the uploaded image", Some(IMAGE_DATA.to_string()))?;
        let SendOutcome::Completed { message } = outcome else {
            panic!("expected a completed send");
        };

        assert_eq!(message.error.as_deref(), Some("Validation failed"));
        assert_eq!(message.content, "{oops");
        assert!(engine.validation_errors().is_some());
        assert!(engine.visuals().entries().is_empty());
        Ok(())
    }

    #[test]
    fn transport_failure_appends_error_flagged_message() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = engine_with(temp.path(), FailingClient)?;

        let outcome = engine.send_message("Describe a cat", None)?;
        let SendOutcome::Completed { message } = outcome else {
            panic!("expected a completed send");
        };

        assert_eq!(message.content, "Request failed");
        let detail = message.error.expect("transport failures carry detail");
        assert!(detail.contains("429"));
        assert!(detail.contains("rate limited"));
        assert!(detail.contains("retry after 7s"));
        assert!(!engine.assistant_is_typing());
        assert_eq!(engine.validation_errors(), None);
        assert_eq!(
            engine.current_session().expect("session").messages.len(),
            3
        );
        Ok(())
    }

    #[test]
    fn retry_appends_an_independent_assistant_message() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = engine_with(
            temp.path(),
            ScriptedClient::new("{\"prompt\":\"a cat on a chair\"}"),
        )?;
        engine.send_message("Describe a cat", None)?;

        let user_id = engine
            .current_session()
            .expect("session")
            .messages
            .iter()
            .find(|message| message.role == Role::User)
            .map(|message| message.id.clone())
            .expect("user message exists");
        engine.retry_message(&user_id)?;

        let session = engine.current_session().expect("session");
        assert_eq!(session.messages.len(), 5);
        let assistants: Vec<_> = session
            .messages
            .iter()
            .filter(|message| message.role == Role::Assistant && message.id != "welcome")
            .collect();
        assert_eq!(assistants.len(), 2);
        assert_ne!(assistants[0].id, assistants[1].id);
        assert_eq!(assistants[0].content, assistants[1].content);
        Ok(())
    }

    #[test]
    fn stale_generation_token_discards_the_completion() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = engine_with(
            temp.path(),
            ScriptedClient::new("{\"prompt\":\"a cat on a chair\"}"),
        )?;
        let session_id = engine
            .current_session_id()
            .expect("session exists")
            .to_string();
        let before = engine.current_session().expect("session").messages.len();

        let token = engine.begin_request();
        engine.stop_assistant();

        let user_message = super::welcome_message();
        let response = CompletionResponse {
            id: "late-1".to_string(),
            model: "test-model".to_string(),
            created: 0,
            choices: vec![CompletionChoice {
                role: "assistant".to_string(),
                content: "{\"prompt\":\"too late\"}".to_string(),
                finish_reason: None,
                total_tokens: None,
            }],
        };
        let outcome =
            engine.apply_completion(&session_id, token, &user_message, Ok(response))?;
        assert!(matches!(outcome, SendOutcome::Discarded));
        assert_eq!(
            engine.current_session().expect("session").messages.len(),
            before
        );
        Ok(())
    }

    #[test]
    fn blank_content_falls_back_to_the_image_prompt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let client = ScriptedClient::new("{\"prompt\":\"a cat on a chair\"}");
        let seen = client.seen.clone();
        let mut engine = engine_with(temp.path(), client)?;

        engine.send_message("   ", Some(IMAGE_DATA.to_string()))?;

        let requests = seen.lock().expect("seen requests");
        assert_eq!(requests.len(), 1);
        let user = requests[0]
            .messages
            .iter()
            .find(|message| message.role == "user")
            .expect("user message present");
        assert_eq!(user.text, FALLBACK_IMAGE_PROMPT);
        assert_eq!(user.image_data.as_deref(), Some(IMAGE_DATA));
        Ok(())
    }

    #[test]
    fn active_template_adds_a_system_overlay() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let client = ScriptedClient::new("{\"prompt\":\"a cat on a chair\"}");
        let seen = client.seen.clone();
        let mut engine = engine_with(temp.path(), client)?;
        engine.templates_mut().set_active(Some("cinema"));

        engine.send_message("Describe a cat", None)?;

        let requests = seen.lock().expect("seen requests");
        assert_eq!(requests[0].messages.len(), 3);
        assert_eq!(requests[0].messages[1].role, "system");
        assert!(requests[0].messages[1].text.contains("cinematic still"));
        Ok(())
    }

    #[test]
    fn sessions_survive_reopen() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        {
            let mut engine = engine_with(
                temp.path(),
                ScriptedClient::new("{\"prompt\":\"a cat on a chair\"}"),
            )?;
            engine.send_message("Describe a cat", None)?;
        }

        let engine = ChatEngine::open(temp.path(), test_config())?;
        let session = engine.current_session().expect("session reloaded");
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[1].content, "Describe a cat");
        Ok(())
    }

    #[test]
    fn export_import_roundtrips_into_a_fresh_data_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source_dir = temp.path().join("source");
        let target_dir = temp.path().join("target");

        let mut source = engine_with(
            &source_dir,
            ScriptedClient::new("{\"prompt\":\"a cat on a chair\"}"),
        )?;
        source.send_message("Describe the uploaded image", Some(IMAGE_DATA.to_string()))?;
        let snapshot = source.export_data();

        let mut target = ChatEngine::open(&target_dir, test_config())?;
        target.import_data(&snapshot)?;

        assert_eq!(target.sessions().len(), source.sessions().len());
        assert_eq!(
            target.current_session().map(|record| &record.messages),
            source.current_session().map(|record| &record.messages)
        );
        assert_eq!(target.visuals().entries(), source.visuals().entries());
        assert_eq!(
            target.templates().templates(),
            source.templates().templates()
        );
        Ok(())
    }

    #[test]
    fn delete_session_falls_back_to_a_remaining_one() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = engine_with(
            temp.path(),
            ScriptedClient::new("{\"prompt\":\"a cat on a chair\"}"),
        )?;
        let first = engine
            .current_session_id()
            .expect("first session")
            .to_string();
        let second = engine.start_session()?;

        engine.delete_session(&second)?;
        assert_eq!(engine.current_session_id(), Some(first.as_str()));

        engine.delete_session(&first)?;
        assert_eq!(engine.current_session_id(), None);
        Ok(())
    }

    #[test]
    fn clear_chat_resets_to_the_welcome_message() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = engine_with(
            temp.path(),
            ScriptedClient::new("{\"prompt\":\"a cat on a chair\"}"),
        )?;
        engine.send_message("Describe a cat", None)?;
        let id = engine
            .current_session_id()
            .expect("session exists")
            .to_string();

        engine.clear_chat(&id)?;
        let session = engine.current_session().expect("session");
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].id, "welcome");
        Ok(())
    }

    #[test]
    fn dryrun_client_is_deterministic_and_schema_valid() -> anyhow::Result<()> {
        let request = CompletionRequest {
            model: "test-model".to_string(),
            messages: vec![super::OutgoingMessage {
                role: "user".to_string(),
                text: "a lighthouse at dusk".to_string(),
                image_data: None,
            }],
            max_output_tokens: 500,
        };
        let first = DryrunClient.complete(&request)?;
        let second = DryrunClient.complete(&request)?;
        assert_eq!(first.choices[0].content, second.choices[0].content);
        assert_eq!(first.id, second.id);
        assert!(validate_output(&first.choices[0].content).is_accepted());
        Ok(())
    }

    #[test]
    fn archive_candidate_requires_image_and_payload() {
        let user_with_image = super::ChatMessage {
            id: "u1".to_string(),
            role: Role::User,
            content: "describe".to_string(),
            created_at: super::now_utc_iso(),
            usage: None,
            error: None,
            image_data: Some(IMAGE_DATA.to_string()),
        };
        let mut user_without_image = user_with_image.clone();
        user_without_image.image_data = None;

        let accepted = validate_output("{\"prompt\":\"a cat\"}");
        let parse_failed = validate_output("not json");

        assert!(archive_candidate(&user_with_image, &accepted, "{}", "s1").is_some());
        assert!(archive_candidate(&user_without_image, &accepted, "{}", "s1").is_none());
        assert!(archive_candidate(&user_with_image, &parse_failed, "{}", "s1").is_none());
    }

    #[test]
    fn attachments_are_downscaled_and_reencoded() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("wide.png");
        image::RgbImage::from_pixel(2048, 512, image::Rgb([180, 40, 90])).save(&path)?;

        let data_url = load_attachment(&path)?;
        let encoded = data_url
            .strip_prefix("data:image/jpeg;base64,")
            .expect("jpeg data url");
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!(decoded.width(), 1024);
        assert_eq!(decoded.height(), 256);
        Ok(())
    }

    #[test]
    fn small_attachments_keep_their_dimensions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("small.png");
        image::RgbImage::from_pixel(64, 48, image::Rgb([10, 200, 120])).save(&path)?;

        let data_url = load_attachment(&path)?;
        let encoded = data_url
            .strip_prefix("data:image/jpeg;base64,")
            .expect("jpeg data url");
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
        Ok(())
    }

    #[test]
    fn decode_completion_rejects_malformed_envelopes() {
        let missing_choices = json!({"id": "x", "model": "m", "created": 1});
        let err = super::decode_completion(&missing_choices)
            .err()
            .expect("missing choices must fail");
        let failure = err
            .downcast_ref::<ApiFailure>()
            .expect("typed transport failure");
        assert_eq!(failure.status, 422);

        let empty_choices = json!({"id": "x", "model": "m", "created": 1, "choices": []});
        assert!(super::decode_completion(&empty_choices).is_err());

        let ok = json!({
            "id": "x",
            "model": "m",
            "created": 1,
            "choices": [{
                "message": {"role": "assistant", "content": "{}"},
                "usage": {"total_tokens": 42}
            }]
        });
        let decoded = super::decode_completion(&ok).expect("valid envelope decodes");
        assert_eq!(decoded.choices[0].total_tokens, Some(42));
    }
}
