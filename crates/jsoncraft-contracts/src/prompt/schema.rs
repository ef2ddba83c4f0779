use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

/// Schema violations keyed by envelope field (`prompt`, `reasoning`, or
/// `envelope` when the root is not an object). Messages name nested
/// paths, e.g. `subject.description: required`.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectSpec {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hair: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outfit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackgroundSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub palette: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredPrompt {
    pub style: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
    pub subject: SubjectSpec,
    pub background: BackgroundSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lighting: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The prompt union: either the structured visual-description object or a
/// bare non-empty string. Exactly one shape validates per instance; the
/// structured shape is attempted first, the string shape is the fallback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PromptPayload {
    Structured(StructuredPrompt),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reasoning {
    Single(String),
    Steps(Vec<String>),
}

/// The envelope every completion response is expected to parse into.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantResponse {
    pub prompt: PromptPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
}

impl AssistantResponse {
    /// Decides membership of an arbitrary parsed value. Unknown extra
    /// keys are ignored; declared keys are checked strictly.
    pub fn from_value(value: &Value) -> Result<Self, FieldErrors> {
        let Some(obj) = value.as_object() else {
            let mut errors = FieldErrors::new();
            push_error(&mut errors, "envelope", "expected a JSON object");
            return Err(errors);
        };

        let mut errors = FieldErrors::new();
        let prompt = match obj.get("prompt") {
            None => {
                push_error(&mut errors, "prompt", "required");
                None
            }
            Some(value) => match PromptPayload::from_value(value) {
                Ok(prompt) => Some(prompt),
                Err(messages) => {
                    errors.insert("prompt".to_string(), messages);
                    None
                }
            },
        };

        let reasoning = match obj.get("reasoning") {
            None => None,
            Some(value) => match Reasoning::from_value(value) {
                Ok(reasoning) => Some(reasoning),
                Err(message) => {
                    push_error(&mut errors, "reasoning", &message);
                    None
                }
            },
        };

        if errors.is_empty() {
            if let Some(prompt) = prompt {
                return Ok(Self { prompt, reasoning });
            }
        }
        Err(errors)
    }
}

impl PromptPayload {
    pub fn from_value(value: &Value) -> Result<Self, Vec<String>> {
        if let Some(obj) = value.as_object() {
            return StructuredPrompt::from_map(obj).map(Self::Structured);
        }
        if let Some(text) = value.as_str() {
            if text.is_empty() {
                return Err(vec!["expected a non-empty string".to_string()]);
            }
            return Ok(Self::Text(text.to_string()));
        }
        Err(vec![
            "expected a structured prompt object or a non-empty string".to_string(),
        ])
    }
}

impl StructuredPrompt {
    fn from_map(obj: &Map<String, Value>) -> Result<Self, Vec<String>> {
        let mut messages = Vec::new();

        let style = required_string(obj, "style", "style", &mut messages);
        let camera = optional_string(obj, "camera", "camera", &mut messages);
        let lighting = optional_string(obj, "lighting", "lighting", &mut messages);
        let mood = optional_string(obj, "mood", "mood", &mut messages);
        let notes = optional_string(obj, "notes", "notes", &mut messages);

        let subject = match obj.get("subject") {
            None => {
                messages.push("subject: required".to_string());
                None
            }
            Some(value) => match value.as_object() {
                None => {
                    messages.push("subject: expected an object".to_string());
                    None
                }
                Some(subject) => {
                    let description = required_string(
                        subject,
                        "description",
                        "subject.description",
                        &mut messages,
                    );
                    let expression =
                        optional_string(subject, "expression", "subject.expression", &mut messages);
                    let hair = optional_string(subject, "hair", "subject.hair", &mut messages);
                    let outfit =
                        optional_string(subject, "outfit", "subject.outfit", &mut messages);
                    description.map(|description| SubjectSpec {
                        description,
                        expression,
                        hair,
                        outfit,
                    })
                }
            },
        };

        let background = match obj.get("background") {
            None => {
                messages.push("background: required".to_string());
                None
            }
            Some(value) => match value.as_object() {
                None => {
                    messages.push("background: expected an object".to_string());
                    None
                }
                Some(background) => Some(BackgroundSpec {
                    layer: optional_string(background, "layer", "background.layer", &mut messages),
                    palette: optional_string(
                        background,
                        "palette",
                        "background.palette",
                        &mut messages,
                    ),
                }),
            },
        };

        if messages.is_empty() {
            if let (Some(style), Some(subject), Some(background)) = (style, subject, background) {
                return Ok(Self {
                    style,
                    camera,
                    subject,
                    background,
                    lighting,
                    mood,
                    notes,
                });
            }
        }
        Err(messages)
    }
}

impl Reasoning {
    fn from_value(value: &Value) -> Result<Self, String> {
        if let Some(text) = value.as_str() {
            return Ok(Self::Single(text.to_string()));
        }
        if let Some(rows) = value.as_array() {
            let mut steps = Vec::with_capacity(rows.len());
            for row in rows {
                let Some(step) = row.as_str() else {
                    return Err("expected every reasoning step to be a string".to_string());
                };
                steps.push(step.to_string());
            }
            return Ok(Self::Steps(steps));
        }
        Err("expected a string or a sequence of strings".to_string())
    }
}

fn required_string(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    messages: &mut Vec<String>,
) -> Option<String> {
    match obj.get(key) {
        None => {
            messages.push(format!("{path}: required"));
            None
        }
        Some(value) => match value.as_str() {
            Some(text) => Some(text.to_string()),
            None => {
                messages.push(format!("{path}: expected a string"));
                None
            }
        },
    }
}

fn optional_string(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    messages: &mut Vec<String>,
) -> Option<String> {
    match obj.get(key) {
        None => None,
        Some(value) => match value.as_str() {
            Some(text) => Some(text.to_string()),
            None => {
                messages.push(format!("{path}: expected a string"));
                None
            }
        },
    }
}

fn push_error(errors: &mut FieldErrors, field: &str, message: &str) {
    errors
        .entry(field.to_string())
        .or_default()
        .push(message.to_string());
}
