use thiserror::Error;

/// Main error type for the agent fleet
#[derive(Error, Debug)]
pub enum FleetError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Transport errors (bus unreachable, closed, I/O failure)
    #[error("Transport error: {0}")]
    Transport(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Envelope construction errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Registry errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Agent {agent_id} failed to initialize: {reason}")]
    Initialization { agent_id: String, reason: String },

    // Control plane errors
    #[error("Unknown control command: {0}")]
    UnknownCommand(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FleetError {
    /// True when the failure came from the underlying transport rather than
    /// from message content or registry state.
    pub fn is_transport(&self) -> bool {
        matches!(self, FleetError::Transport(_))
    }
}

/// Result type alias for FleetError
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::Initialization {
            agent_id: "a1".into(),
            reason: "no feed".into(),
        };
        assert_eq!(err.to_string(), "Agent a1 failed to initialize: no feed");
        assert!(FleetError::Transport("down".into()).is_transport());
        assert!(!FleetError::Validation("bad".into()).is_transport());
    }
}
