use thiserror::Error;

/// Unified error type for Tally.
#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Failed to read request body: {0}")]
    ClientBodyRead(String),

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Flush timed out after {0} ms")]
    FlushTimeout(u64),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TallyError {
    /// Map to the HTTP status sent to the client, when the error surfaces on
    /// the request path at all.
    pub fn status_code(&self) -> u16 {
        match self {
            TallyError::ClientBodyRead(_) => 400,
            TallyError::BodyTooLarge { .. } => 400,
            TallyError::Upstream(_) => 502,
            _ => 500,
        }
    }

    /// True for failures caused by the client side of an exchange.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}
