//! Error taxonomy shared by the studio core.

use thiserror::Error;

pub type StudioResult<T> = Result<T, StudioError>;

/// Failure classes surfaced by studio operations.
///
/// `Validation` is caller-correctable and reported near the offending
/// control. `RemoteOperation` wraps any backend failure and is reported as
/// a transient notification. `InconsistentState` marks a benign race (a
/// referenced version vanished) and is logged rather than shown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StudioError {
    #[error("{0}")]
    Validation(String),

    #[error("{operation} failed: {message}")]
    RemoteOperation { operation: String, message: String },

    #[error("inconsistent state: {0}")]
    InconsistentState(String),
}

impl StudioError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Flattens an anyhow cause chain into a `RemoteOperation`.
    pub fn from_remote(operation: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::remote(operation, error_chain_text(err, 1024))
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::InconsistentState(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteOperation { .. })
    }
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let text = text.trim();
        if text.is_empty() || parts.iter().any(|existing: &String| existing == text) {
            continue;
        }
        parts.push(text.to_string());
    }
    let joined = parts.join(": ");
    if joined.chars().count() <= max_chars {
        return joined;
    }
    let mut truncated: String = joined.chars().take(max_chars.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_remote_flattens_cause_chain() {
        let err = anyhow::anyhow!("connection reset").context("upscale request failed");
        let classified = StudioError::from_remote("Upscale", &err);
        assert!(classified.is_remote());
        assert_eq!(
            classified.to_string(),
            "Upscale failed: upscale request failed: connection reset"
        );
    }

    #[test]
    fn error_chain_text_truncates_long_messages() {
        let err = anyhow::anyhow!("x".repeat(50));
        let text = error_chain_text(&err, 10);
        assert_eq!(text, "xxxxxxx...");
    }

    #[test]
    fn validation_displays_message_verbatim() {
        let err = StudioError::validation("Select an image first.");
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Select an image first.");
    }
}
