use thiserror::Error;

pub use color_eyre::eyre::eyre;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Server Error: {0}")]
    ServerError(#[from] ServerMessage),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Bad config error: {0}")]
    BadConfigError(String),

    #[error("Bad usage error: {0}")]
    BadUsageError(String),

    #[error("Invalid packet")]
    InvalidPacket,

    #[error("Unexpected end of message")]
    UnexpectedEof,

    #[error("Unknown token type 0x{0:02X}")]
    UnknownToken(u8),

    #[error("Unsupported data type 0x{0:02X}")]
    UnsupportedType(u8),

    #[error("No current row in the result set")]
    NoCurrentRow,

    #[error("Invalid column index {0}")]
    InvalidColumnIndex(usize),

    #[error("Unknown column name {0}")]
    UnknownColumn(String),

    #[error("Cursor open failed: {0}")]
    CursorOpenFailed(String),

    #[error("The statement did not return a result set")]
    NoResultSet,

    #[error("Update requires a current row")]
    UpdateRequiresRow,

    #[error("Column {index} ({name}) is read-only and cannot be inserted")]
    ReadOnlyColumn { index: usize, name: String },

    #[error("Operation not allowed while on the insert row")]
    OnInsertRow,

    #[error("Not on the insert row")]
    NotOnInsertRow,

    #[error("Result set is forward-only")]
    ForwardOnly,

    #[error("Result set is read-only")]
    ReadOnly,

    #[error("Cannot convert {value} to {target}")]
    Conversion { value: String, target: &'static str },

    #[error("The query has timed out")]
    Timeout,

    #[error("The operation was cancelled")]
    Cancelled,

    #[error("Statement already closed")]
    StatementClosed,

    #[error("Result set already closed")]
    ResultSetClosed,

    #[error("Connection already closed")]
    ConnectionClosed,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Library bug: {0}")]
    LibraryBug(color_eyre::Report),
}

impl Error {
    /// Condition code surfaced to callers
    pub fn sql_state(&self) -> &'static str {
        match self {
            Error::ServerError(msg) => msg.sql_state(),
            Error::IoError(_) | Error::InvalidPacket | Error::UnexpectedEof => "08S01",
            Error::UnknownToken(_) | Error::UnsupportedType(_) => "08S01",
            Error::NoCurrentRow
            | Error::CursorOpenFailed(_)
            | Error::NoResultSet
            | Error::UpdateRequiresRow
            | Error::ReadOnlyColumn { .. }
            | Error::OnInsertRow
            | Error::NotOnInsertRow
            | Error::ForwardOnly
            | Error::ReadOnly => "24000",
            Error::InvalidColumnIndex(_) | Error::UnknownColumn(_) => "07009",
            Error::Conversion { .. } => "22018",
            Error::Timeout => "HYT00",
            Error::Cancelled => "HY008",
            Error::StatementClosed | Error::ResultSetClosed => "HY010",
            Error::ConnectionClosed => "08003",
            Error::ResourceExhausted(_) => "HY014",
            Error::BadConfigError(_) | Error::BadUsageError(_) | Error::LibraryBug(_) => "HY000",
        }
    }

    /// A teardown that lost the race against a concurrent connection close
    ///
    /// I/O failures only count when the connection is known to be closed;
    /// otherwise they are genuine network errors.
    pub fn is_expected_close_race(&self, conn_closed: bool) -> bool {
        match self {
            Error::ConnectionClosed | Error::StatementClosed => true,
            Error::IoError(_) | Error::UnexpectedEof => conn_closed,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An ERROR or INFO token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Msg {number}, Level {class}, State {state}: {message}")]
pub struct ServerMessage {
    pub number: i32,
    pub state: u8,
    pub class: u8,
    pub message: String,
    pub server: String,
    pub procedure: String,
    pub line: i32,
}

impl ServerMessage {
    /// Severity above 10 is an error, 10 and below is informational
    pub fn is_error(&self) -> bool {
        self.class > 10
    }

    pub fn sql_state(&self) -> &'static str {
        match self.number {
            2601 | 2627 | 547 | 515 => "23000",
            208 => "42S02",
            207 => "42S22",
            1205 => "40001",
            8152 => "22001",
            16905 | 16917 | 16929 | 16930 | 16931 | 16945 => "24000",
            _ if self.is_error() => "S1000",
            _ => "01000",
        }
    }
}

/// A non-fatal condition attached to a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub message: String,
    pub sql_state: &'static str,
    pub number: i32,
}

impl Warning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: "01000",
            number: 0,
        }
    }
}

impl From<ServerMessage> for Warning {
    fn from(msg: ServerMessage) -> Self {
        Self {
            sql_state: msg.sql_state(),
            number: msg.number,
            message: msg.message,
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.sql_state, self.message)
    }
}
