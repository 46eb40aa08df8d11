use thiserror::Error;

/// Failure taxonomy for a generation request.
///
/// Every variant surfaces to the orchestrator's caller unchanged; no layer
/// substitutes a fabricated success. The one sanctioned degradation is the
/// vision path, which converts `VisionUnavailable` into the safe generic
/// prompt before the error can reach a caller.
///
/// Messages never carry credentials or signed URLs.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("no credential available for {0}")]
    NoCredential(String),

    #[error("vision analysis unavailable: {0}")]
    VisionUnavailable(String),

    #[error("local pipeline unavailable: {0}")]
    LocalPipelineUnavailable(String),

    #[error("remote protocol error: {0}")]
    RemoteProtocol(String),

    #[error("remote transport error: {detail}")]
    RemoteTransport {
        status: Option<u16>,
        detail: String,
    },

    #[error("remote job failed: {0}")]
    RemoteJobFailed(String),

    #[error("remote job timed out after {attempts} polls")]
    RemoteJobTimedOut { attempts: u32 },

    #[error("generation cancelled")]
    Cancelled,
}

impl GenerateError {
    /// True when the request was rejected before any external call was made.
    pub fn rejected_before_dispatch(&self) -> bool {
        matches!(
            self,
            GenerateError::InvalidInput(_)
                | GenerateError::InvalidGeometry(_)
                | GenerateError::NoCredential(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::GenerateError;

    #[test]
    fn display_keeps_service_message() {
        let err = GenerateError::RemoteJobFailed("content_policy".to_string());
        assert!(err.to_string().contains("content_policy"));
    }

    #[test]
    fn pre_dispatch_classification() {
        assert!(GenerateError::InvalidInput("empty prompt".to_string()).rejected_before_dispatch());
        assert!(GenerateError::NoCredential("pro".to_string()).rejected_before_dispatch());
        assert!(!GenerateError::RemoteJobTimedOut { attempts: 60 }.rejected_before_dispatch());
        assert!(!GenerateError::Cancelled.rejected_before_dispatch());
    }
}
