use std::io;

/// Malformed wire data. Fatal to the decode in progress; the link is reset.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Protocol error! unexpected type byte '{}'", *.0 as char)]
    InvalidByte(u8),

    #[error("Protocol error! empty reply line")]
    EmptyLine,

    #[error("Protocol error! invalid integer: {0}")]
    InvalidInteger(String),

    #[error("Protocol error! invalid length: {0}")]
    InvalidLength(i64),

    #[error("Protocol error! line exceeds {0} bytes without CRLF")]
    LineTooLong(usize),

    #[error("Protocol error! reply ended early")]
    UnexpectedEnd,
}

/// Socket-level failures. These trigger the reconnection policy.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed by peer")]
    Closed,

    #[error("connection destroyed")]
    Destroyed,

    #[error("reconnection is not enabled")]
    ReconnectDisabled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Local transaction and reply-shape failures; no socket interaction.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("MULTI calls can not be nested")]
    NestedMulti,

    #[error("cannot convert to object: array has {0} elements")]
    OddObjectArity(usize),

    #[error("MULTI call error: {0}")]
    UnexpectedReply(String),

    #[error("transaction aborted by the server")]
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A `-` reply from the server, delivered to the caller only.
    #[error("{0}")]
    Redis(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl ClientError {
    /// Errors after which the connection stays usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ClientError::Redis(_) | ClientError::Transaction(_))
    }

    /// Errors that tear down the link and hand it to the reconnection policy.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ClientError::Protocol(_) | ClientError::Connection(_))
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Connection(ConnectionError::Io(err))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
