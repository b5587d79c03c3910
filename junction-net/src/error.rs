use thiserror::Error;

/// Errors that can occur in the networking layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The transport stack could not be built or could not bind any listener.
    #[error("startup error: {reason}")]
    Startup { reason: String },

    /// A dial attempt failed.
    #[error("dial to {address} failed: {reason}")]
    Dial { address: String, reason: String },

    /// The broadcast layer rejected a publish.
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// The remote peer does not hold a file with the requested id.
    #[error("file not found: {id}")]
    FileNotFound { id: String },

    /// A file fetch failed before a response arrived.
    #[error("file fetch of {id} failed: {reason}")]
    FileFetch { id: String, reason: String },

    /// Failed to encode or decode a message.
    #[error("codec error: {reason}")]
    Codec { reason: String },

    /// Message exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The lifecycle state does not allow the requested transition.
    #[error("invalid lifecycle state: cannot {action} while {state}")]
    InvalidState { action: String, state: String },

    /// The node event loop is not running.
    #[error("node is not running")]
    NotRunning,

    /// The delegated routing service failed.
    #[error("discovery error: {reason}")]
    Discovery { reason: String },

    /// Channel send/receive error.
    #[error("channel error: {reason}")]
    Channel { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_not_found_display() {
        let err = NetworkError::FileNotFound {
            id: "f1".to_string(),
        };
        assert_eq!(err.to_string(), "file not found: f1");
    }

    #[test]
    fn test_invalid_state_display() {
        let err = NetworkError::InvalidState {
            action: "start".to_string(),
            state: "stopping".to_string(),
        };
        assert!(err.to_string().contains("cannot start while stopping"));
    }
}
