use std::fmt;

/// Errors a caller can observe directly from a channel reference operation.
/// Failures that are consumed internally (`SendPartial`) or dispatched
/// across threads never reach this enum at the call site that triggered
/// them; see `ChannelRef::write` and `Loop::dispatch`.
#[derive(Debug)]
pub enum ReactorError {
    NoMemory,
    RefNonzero,
    ConnectInProgress,
    AcceptInProgress,
    NotConnected,
    ChannelNotConnect,
    SendPartial,
    SendFail,
    RecvFail,
    RecvBufferFull,
    LoggerWrite,
    Fail,
    Io(std::io::Error),
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for ReactorError {
    fn from(e: std::io::Error) -> Self {
        ReactorError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, ReactorError>;
