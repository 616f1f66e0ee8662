//! Classification of remote service responses
//!
//! The service answers with an XML document. Elements are matched by local
//! name so namespace prefixes chosen by the remote side do not matter:
//!
//! | element | meaning |
//! |---|---|
//! | `Status` | `Accepted`, `AcceptedWithErrors` or `Rejected` |
//! | `ConfirmationCode` | proof of receipt |
//! | `ErrorCode` / `ErrorMessage` | machine / human readable failure |

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use super::TransportError;

/// Outcome of one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// Confirmation code present; `warning` set for partial acceptance
    Accepted {
        confirmation_code: String,
        warning: Option<RemoteError>,
    },
    /// No confirmation code; retried with backoff
    Failed(RemoteError),
    /// The service refused the document itself; never retried
    Rejected(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// A classified submission response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub outcome: SubmissionOutcome,
    pub http_status: u16,
    pub raw_response: String,
}

impl SubmissionResponse {
    pub fn success(&self) -> bool {
        matches!(self.outcome, SubmissionOutcome::Accepted { .. })
    }

    pub fn confirmation_code(&self) -> Option<&str> {
        match &self.outcome {
            SubmissionOutcome::Accepted {
                confirmation_code, ..
            } => Some(confirmation_code),
            _ => None,
        }
    }

    fn error(&self) -> Option<&RemoteError> {
        match &self.outcome {
            SubmissionOutcome::Accepted { warning, .. } => warning.as_ref(),
            SubmissionOutcome::Failed(e) | SubmissionOutcome::Rejected(e) => Some(e),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error().map(|e| e.code.as_str())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error().map(|e| e.message.as_str())
    }
}

/// Registration state reported by a status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Registered,
    RegisteredWithErrors,
    Rejected,
    NotFound,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub state: RemoteState,
    pub confirmation_code: Option<String>,
    pub raw_response: String,
}

#[derive(Debug, Default)]
struct ResponseFields {
    status: Option<String>,
    confirmation_code: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
}

fn extract_fields(body: &str) -> Result<ResponseFields, TransportError> {
    let mut reader = Reader::from_str(body);
    let mut fields = ResponseFields::default();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Text(t)) => {
                let Some(name) = current.as_deref() else {
                    continue;
                };
                let text = t
                    .unescape()
                    .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let slot = match name {
                    "Status" | "State" => &mut fields.status,
                    "ConfirmationCode" => &mut fields.confirmation_code,
                    "ErrorCode" => &mut fields.error_code,
                    "ErrorMessage" | "ErrorDescription" => &mut fields.error_message,
                    _ => continue,
                };
                // first occurrence wins
                if slot.is_none() {
                    *slot = Some(text.to_string());
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(TransportError::InvalidResponse(e.to_string())),
        }
    }

    Ok(fields)
}

/// Whether an HTTP status means the service refused the document itself
pub fn is_rejection_status(status: u16) -> bool {
    matches!(status, 400 | 422)
}

/// Classify a non-5xx response body
pub fn classify_submission(http_status: u16, body: &str) -> Result<SubmissionResponse, TransportError> {
    let fields = extract_fields(body)?;

    let error = fields.error_code.clone().map(|code| RemoteError {
        code,
        message: fields.error_message.clone().unwrap_or_default(),
    });
    let explicit_rejection = fields
        .status
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("Rejected"));

    let outcome = match (fields.confirmation_code, error) {
        // A confirmation code always wins: the document is registered.
        (Some(confirmation_code), warning) if !is_rejection_status(http_status) => {
            SubmissionOutcome::Accepted {
                confirmation_code,
                warning,
            }
        }
        (_, error) if is_rejection_status(http_status) || explicit_rejection => {
            SubmissionOutcome::Rejected(error.unwrap_or_else(|| RemoteError {
                code: format!("HTTP_{http_status}"),
                message: fields
                    .error_message
                    .unwrap_or_else(|| "document rejected by remote service".to_string()),
            }))
        }
        (_, Some(error)) => SubmissionOutcome::Failed(error),
        (_, None) => {
            return Err(TransportError::InvalidResponse(
                "response carries neither a confirmation code nor an error code".to_string(),
            ))
        }
    };

    Ok(SubmissionResponse {
        outcome,
        http_status,
        raw_response: body.to_string(),
    })
}

/// Classify a status-query response body
pub fn classify_query(body: &str) -> Result<QueryResponse, TransportError> {
    let fields = extract_fields(body)?;
    let state = match fields.status.as_deref() {
        Some("Registered") | Some("Accepted") => RemoteState::Registered,
        Some("RegisteredWithErrors") | Some("AcceptedWithErrors") => {
            RemoteState::RegisteredWithErrors
        }
        Some("Rejected") => RemoteState::Rejected,
        Some("NotFound") | None => RemoteState::NotFound,
        Some(other) => RemoteState::Other(other.to_string()),
    };

    Ok(QueryResponse {
        state,
        confirmation_code: fields.confirmation_code,
        raw_response: body.to_string(),
    })
}
