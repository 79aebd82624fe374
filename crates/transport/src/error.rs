use thiserror::Error;

/// Abstract classification of a broker failure.
///
/// Transport implementations translate their client library's error hierarchy
/// into one of these kinds; retry policy and worker loops only ever look at
/// the kind, never at broker-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Could not establish or re-establish the connection.
    Connect,
    /// The broker rejected our credentials. Retried like `Connect`, logged apart.
    Auth,
    /// The channel (or its underlying connection) died mid-use.
    ChannelClosed,
    /// Fetching deliveries failed for a non-connection reason.
    Consume,
    /// Publishing failed.
    Publish,
    /// Acknowledging or rejecting a delivery failed.
    Ack,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Connect => write!(f, "connect"),
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::ChannelClosed => write!(f, "channel_closed"),
            ErrorKind::Consume => write!(f, "consume"),
            ErrorKind::Publish => write!(f, "publish"),
            ErrorKind::Ack => write!(f, "ack"),
        }
    }
}

/// A classified broker failure.
#[derive(Debug, Clone, Error)]
#[error("broker {kind} failure: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connect, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChannelClosed, message)
    }

    pub fn consume(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Consume, message)
    }

    pub fn publish(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Publish, message)
    }

    pub fn ack(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Ack, message)
    }

    /// Whether the failure means the connection itself is gone, so the worker
    /// should stop consuming and wait for the supervisor to reconnect.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Connect | ErrorKind::Auth | ErrorKind::ChannelClosed
        )
    }
}
