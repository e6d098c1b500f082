use thiserror::Error;

/// Every failure the gateway can report, from config loading down to a single Say call.
#[derive(Debug, Error)]
pub enum SayerError {
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("unexpected status code: {status}")]
    Upstream { status: u16 },

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("local synthesis failed: {0}")]
    LocalSynthesis(String),

    #[error("bad voice template: {0}")]
    Template(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error event received from a sayerd server.
    #[error("{message}")]
    Remote { kind: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SayerError {
    /// Short machine-readable tag sent to RPC clients alongside the message.
    pub fn kind(&self) -> &str {
        match self {
            SayerError::ConfigInvalid(_) => "config_invalid",
            SayerError::UnknownRole(_) => "unknown_role",
            SayerError::Upstream { .. } | SayerError::Transport(_) => "upstream_failure",
            SayerError::LocalSynthesis(_) | SayerError::Io(_) => "local_synthesis_failure",
            SayerError::Template(_) => "template_error",
            SayerError::Protocol(_) => "protocol_error",
            SayerError::Remote { kind, .. } => kind,
        }
    }
}

impl From<config::ConfigError> for SayerError {
    fn from(e: config::ConfigError) -> Self {
        SayerError::ConfigInvalid(e.to_string())
    }
}

impl From<serde_json::Error> for SayerError {
    fn from(e: serde_json::Error) -> Self {
        SayerError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SayerError>;
