use thiserror::Error;

/// A recognized application-level fault raised by the server, carrying the
/// statement number that failed and, when available, the table and column
/// the business rule belongs to. Managed faults are recoverable: callers may
/// retry or abort the command that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ServerFault {
    /// Index of the statement within the batch that raised the fault.
    pub statement: i64,
    pub message: String,
    pub table: Option<String>,
    pub column: Option<String>,
}

impl ServerFault {
    /// A fault not tied to any statement, raised client-side or synthesized
    /// from an expected outcome such as an optimistic-concurrency miss.
    pub fn local(message: impl Into<String>, table: Option<String>, column: Option<String>) -> Self {
        Self {
            statement: 0,
            message: message.into(),
            table,
            column,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Invalid caller input. A contract violation, never recoverable, always
    /// raised before any I/O happens.
    #[error("Invalid argument '{name}': {message}")]
    Argument { name: &'static str, message: String },

    /// Malformed server payload. Indicates a protocol mismatch and is never
    /// silently recovered.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// An object was used outside its legal state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Access after disposal.
    #[error("Object '{0}' has been disposed")]
    ObjectDisposed(String),

    /// No visible columns or no accessible entries.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A managed server fault, delivered as a rejection of the command
    /// future. See [`ServerFault`].
    #[error("Server fault: {0}")]
    Server(#[from] ServerFault),

    /// Network or timeout failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The operation was cancelled before it completed.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    pub(crate) fn argument(name: &'static str, message: impl Into<String>) -> Self {
        SyncError::Argument {
            name,
            message: message.into(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
