use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigurationError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    #[error("{faulted} of {total} topic loops faulted")]
    Faulted { faulted: usize, total: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invalid or missing registration data. Fatal for the affected topic at
/// registration or loop startup; other topics are unaffected.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("topic name must not be empty")]
    EmptyTopic,

    #[error("no group id configured for topic {topic}")]
    MissingGroupId { topic: String },

    #[error("no bootstrap servers configured for topic {topic}")]
    MissingBootstrapServers { topic: String },

    #[error("no registered codec for {type_name}")]
    MissingCodec { type_name: &'static str },

    #[error("invalid options: {message}")]
    InvalidOptions { message: String },

    #[error("failed to load options from {source}: {error}")]
    LoadFailed {
        source: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Broker unreachable or client construction failed. Retried with bounded
/// exponential backoff before the loop escalates to Faulted.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to create client: {reason}")]
    ClientCreation { reason: String },

    #[error("failed to subscribe to topic {topic}: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("failed to receive message: {reason}")]
    Receive { reason: String },

    #[error("startup retries exhausted for topic {topic} after {attempts} attempts")]
    RetriesExhausted {
        topic: String,
        attempts: u32,
        #[source]
        last: Box<ConnectionError>,
    },
}

/// Per-message failure. Reported and isolated to the one message; never
/// crosses loop boundaries.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to decode message {part}: {reason}")]
    Decode { part: MessagePart, reason: String },

    #[error("handler failed: {reason}")]
    Handler { reason: String },

    #[error("no service of type {type_name} registered")]
    UnresolvedService { type_name: &'static str },

    #[error("failed to produce to topic {topic}: {reason}")]
    Produce { topic: String, reason: String },

    #[error("failed to commit offset {offset} on {topic}[{partition}]: {reason}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePart {
    Key,
    Value,
}

impl std::fmt::Display for MessagePart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessagePart::Key => write!(f, "key"),
            MessagePart::Value => write!(f, "value"),
        }
    }
}

/// Failure during graceful teardown. Logged, never blocks process exit.
#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("failed to unsubscribe: {reason}")]
    Unsubscribe { reason: String },

    #[error("loop task panicked during shutdown: {reason}")]
    Join { reason: String },
}

pub type Result<T> = std::result::Result<T, RouterError>;

impl From<serde_yaml::Error> for ConfigurationError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigurationError::InvalidOptions {
            message: err.to_string(),
        }
    }
}

impl RouterError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::Connection(ConnectionError::RetriesExhausted { .. }) => false,
            RouterError::Connection(_) => true,
            RouterError::Dispatch(DispatchError::Produce { .. }) => true,
            RouterError::Dispatch(DispatchError::Commit { .. }) => true,
            RouterError::Config(_) => false,
            RouterError::Dispatch(_) => false,
            _ => false,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        match self {
            RouterError::Connection(_) => Duration::from_millis(1000),
            RouterError::Dispatch(_) => Duration::from_millis(500),
            _ => Duration::from_millis(5000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retryable_until_exhausted() {
        let err = RouterError::Connection(ConnectionError::ClientCreation {
            reason: "broker down".to_string(),
        });
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay(), Duration::from_millis(1000));

        let exhausted = RouterError::Connection(ConnectionError::RetriesExhausted {
            topic: "orders".to_string(),
            attempts: 8,
            last: Box::new(ConnectionError::ClientCreation {
                reason: "broker down".to_string(),
            }),
        });
        assert!(!exhausted.is_retryable());
    }

    #[test]
    fn configuration_errors_are_fatal() {
        let err = RouterError::Config(ConfigurationError::EmptyTopic);
        assert!(!err.is_retryable());
    }

    #[test]
    fn decode_errors_name_the_part() {
        let err = DispatchError::Decode {
            part: MessagePart::Key,
            reason: "expected string".to_string(),
        };
        assert!(err.to_string().contains("key"));
    }
}
