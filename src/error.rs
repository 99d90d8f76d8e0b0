//! Error taxonomy of the chat core.
//!
//! Only [`ChatError::MalformedRequest`] and [`ChatError::ConversationNotFound`]
//! are returned synchronously from [`Orchestrator::prepare`](crate::orchestrator::Orchestrator::prepare).
//! Generation and persistence failures are reported inside the event stream
//! as a terminal `error` frame; retrieval failures never leave the
//! orchestrator.

/// Errors from the chat orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("failed to save conversation: {0}")]
    Persistence(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ChatError {
    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::MalformedRequest(_) => "bad_request",
            ChatError::ConversationNotFound(_) => "not_found",
            ChatError::RetrievalUnavailable(_) => "retrieval_unavailable",
            ChatError::Generation(_) => "generation_failed",
            ChatError::Persistence(_) => "persistence_failed",
            ChatError::Storage(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ChatError::MalformedRequest("message must not be empty".to_string());
        assert_eq!(err.to_string(), "malformed request: message must not be empty");

        let err = ChatError::ConversationNotFound("abc".to_string());
        assert_eq!(err.to_string(), "conversation not found: abc");

        let err = ChatError::Persistence("disk full".to_string());
        assert_eq!(err.to_string(), "failed to save conversation: disk full");
    }

    #[test]
    fn test_codes() {
        assert_eq!(ChatError::MalformedRequest(String::new()).code(), "bad_request");
        assert_eq!(ChatError::ConversationNotFound(String::new()).code(), "not_found");
        assert_eq!(ChatError::Storage(String::new()).code(), "internal");
    }
}
