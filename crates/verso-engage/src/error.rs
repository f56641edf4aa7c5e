use engage_proto::{ActionKind, ErrorBody};
use thiserror::Error;

/// Failure taxonomy for mutations, reconciling reads, and page fetches.
///
/// Every variant surfaced from a mutation triggers the same rollback; only
/// the message shown to the caller differs. The message comes from the
/// server's `error` field when present, else the generic fallback baked into
/// each variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngageError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("{message}")]
    Validation { message: String },
    #[error("{message}")]
    Auth { message: String },
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    Conflict { message: String },
    #[error("too many requests, slow down")]
    RateLimited,
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("{kind:?} action already in flight for {entity_id}")]
    ActionInFlight {
        entity_id: String,
        kind: ActionKind,
    },
    #[error("push channel closed")]
    ChannelClosed,
    #[error("malformed server payload: {0}")]
    Decode(String),
}

impl EngageError {
    /// Map an HTTP status plus the uniform `{ error, code }` body onto the
    /// taxonomy. The status carries the category; the body carries the
    /// message.
    pub fn from_status(status: u16, body: Option<ErrorBody>) -> Self {
        let message = |fallback: &str| {
            body.as_ref()
                .map(|b| b.error.clone())
                .unwrap_or_else(|| fallback.to_string())
        };
        match status {
            400 => EngageError::Validation {
                message: message("request rejected"),
            },
            401 | 403 => EngageError::Auth {
                message: message("not authorized"),
            },
            404 => EngageError::NotFound {
                message: message("not found"),
            },
            409 => EngageError::Conflict {
                message: message("item changed, reload and try again"),
            },
            429 => EngageError::RateLimited,
            _ => EngageError::Server {
                status,
                message: message("something went wrong"),
            },
        }
    }

    /// Whether offering the user a retry makes sense. Validation and auth
    /// failures will fail the same way again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            EngageError::Transport(_)
                | EngageError::RateLimited
                | EngageError::Server { .. }
                | EngageError::Conflict { .. }
                | EngageError::ChannelClosed
        )
    }
}

impl From<reqwest::Error> for EngageError {
    fn from(err: reqwest::Error) -> Self {
        EngageError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_uses_server_message_when_present() {
        let err = EngageError::from_status(
            400,
            Some(ErrorBody {
                error: "rating out of range".into(),
                code: Some("invalid_rating".into()),
            }),
        );
        assert_eq!(
            err,
            EngageError::Validation {
                message: "rating out of range".into()
            }
        );
        assert!(!err.is_retriable());
    }

    #[test]
    fn status_mapping_falls_back_without_body() {
        match EngageError::from_status(503, None) {
            EngageError::Server { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "something went wrong");
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
