use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("agent error: {0}")]
    Agent(String),

    /// A domain-service rejection. The message is shown to the model as-is.
    #[error("{0}")]
    Tool(String),

    #[error("{0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("trace error: {0}")]
    Trace(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Message suitable for surfacing to a caller without the variant prefix.
    pub fn user_message(&self) -> String {
        match self {
            Self::Tool(msg) | Self::NotFound(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_and_not_found_errors_display_bare_message() {
        assert_eq!(
            Error::Tool("Can only pause active plans".into()).to_string(),
            "Can only pause active plans"
        );
        assert_eq!(
            Error::NotFound("Payment not found".into()).user_message(),
            "Payment not found"
        );
    }

    #[test]
    fn agent_error_keeps_prefix() {
        let err = Error::Agent("openai API error: status=500".into());
        assert_eq!(err.to_string(), "agent error: openai API error: status=500");
    }
}
