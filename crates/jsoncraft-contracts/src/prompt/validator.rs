use serde_json::Value;

use super::schema::{AssistantResponse, FieldErrors};

/// Classification of a raw completion text against the envelope schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Accepted {
        data: AssistantResponse,
    },
    /// `parsed` carries the parsed-but-invalid value whenever the raw
    /// text was well-formed JSON; it is absent only on syntax errors.
    Rejected {
        detail: RejectionDetail,
        parsed: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectionDetail {
    Parse(String),
    Fields(FieldErrors),
}

impl RejectionDetail {
    /// Banner text for the session-wide validation error display.
    pub fn render(&self) -> String {
        match self {
            Self::Parse(message) => message.clone(),
            Self::Fields(errors) => {
                serde_json::to_string(errors).unwrap_or_else(|_| "schema validation failed".to_string())
            }
        }
    }
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// The value worth keeping for display or archival: the rejected-but-
    /// parsed payload, when there is one.
    pub fn recovered_payload(&self) -> Option<&Value> {
        match self {
            Self::Rejected {
                parsed: Some(value),
                ..
            } => Some(value),
            _ => None,
        }
    }
}

/// Pure classification of a raw completion text. No storage or network
/// access; re-validating the same input always yields the same outcome.
pub fn validate_output(raw: &str) -> ValidationOutcome {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            return ValidationOutcome::Rejected {
                detail: RejectionDetail::Parse(err.to_string()),
                parsed: None,
            }
        }
    };

    match AssistantResponse::from_value(&parsed) {
        Ok(data) => ValidationOutcome::Accepted { data },
        Err(errors) => ValidationOutcome::Rejected {
            detail: RejectionDetail::Fields(errors),
            parsed: Some(parsed),
        },
    }
}
