//! Error taxonomy shared by workers, the queue and the batch coordinator.
use thiserror::Error;

/// How much of an upstream response body we keep in `last_error` and logs.
pub const MAX_ERROR_LEN: usize = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid or missing credentials for one of the platforms. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Unparsable snapshot, missing field, no valid price. Never retried and
    /// never written into mapping status.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Mapping or batch does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Non-2xx or network failure from Store or Warehouse. Retryable; the
    /// worker records it into the mapping before surfacing it.
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SyncError::NotFound(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        SyncError::Upstream(truncate_error(&msg.into()).into_owned())
    }

    /// Only upstream (network / non-2xx) and database failures are worth a
    /// re-run; everything else fails the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Upstream(_) | SyncError::Db(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::upstream(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Validation(err.to_string())
    }
}

/// Truncate an upstream message to `MAX_ERROR_LEN`, respecting char
/// boundaries so multi-byte responses do not panic the slice.
pub fn truncate_error(msg: &str) -> std::borrow::Cow<'_, str> {
    if msg.len() <= MAX_ERROR_LEN {
        return std::borrow::Cow::Borrowed(msg);
    }
    let mut end = MAX_ERROR_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(msg[..end].to_string())
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "ü".repeat(120);
        let cut = truncate_error(&long);
        assert!(cut.len() <= MAX_ERROR_LEN);
        assert!(cut.chars().all(|c| c == 'ü'));

        let short = "plain error";
        assert_eq!(truncate_error(short), short);
    }

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(SyncError::upstream("503 from store").is_retryable());
        assert!(!SyncError::validation("no valid price").is_retryable());
        assert!(!SyncError::not_found("mapping 123").is_retryable());
        assert!(!SyncError::Auth("bad token".into()).is_retryable());
    }
}
