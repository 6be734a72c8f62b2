use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Topic '{topic}' already carries a different message type (requested {requested})")]
    TopicTypeMismatch {
        topic: String,
        requested: &'static str,
    },

    #[error("Service '{0}' is already registered")]
    ServiceAlreadyExists(String),

    #[error("Service '{0}' is not available")]
    ServiceUnavailable(String),

    #[error("Service '{0}' was registered with different request/response types")]
    ServiceTypeMismatch(String),

    #[error("Service '{service}' did not answer within {timeout:?}")]
    ServiceTimeout { service: String, timeout: Duration },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Unknown QoS reliability '{0}'")]
    UnknownReliability(String),
}
