use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the session API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MyoError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("timed out: {0}")]
    ConnectionTimeout(String),

    /// A command write was not acknowledged by the armband.
    #[error("command not acknowledged: {0}")]
    ProtocolWriteFailure(String),

    #[error("malformed {kind} frame: expected {expected} bytes, got {actual}")]
    MalformedTelemetry {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("{0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, MyoError>;

/// Errors reported by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no device with address {0}")]
    NotFound(String),

    #[error("transport operation timed out")]
    TimedOut,

    #[error("not connected")]
    NotConnected,

    #[error("characteristic {0} not found")]
    MissingCharacteristic(Uuid),

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for MyoError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound(address) => MyoError::DeviceNotFound(address),
            TransportError::TimedOut => MyoError::ConnectionTimeout("transport timed out".into()),
            other => MyoError::Unknown(other.to_string()),
        }
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => TransportError::NotFound("peripheral".into()),
            btleplug::Error::TimedOut(_) => TransportError::TimedOut,
            btleplug::Error::NotConnected => TransportError::NotConnected,
            other => TransportError::Other(other.to_string()),
        }
    }
}
