// abi/src/error.rs
use core::fmt;

/// Standard result type for exokernel calls.
pub type Result<T> = core::result::Result<T, SysError>;

/// Error codes surfaced by the exokernel call surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The named process does not exist.
    NotFound,

    /// The caller may not operate on the named process or mapping.
    PermissionDenied,

    /// No physical frame could be reserved.
    OutOfMemory,

    /// A syscall argument was rejected.
    InvalidArgument,

    /// The source address has no mapping.
    NotMapped,

    /// The operation is not legal in the process's current state.
    InvalidState,
}

/// Error value carried by every fallible exokernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysError {
    /// Error code
    code: ErrorCode,

    /// Optional static description
    message: Option<&'static str>,

    /// Optional identifier for the context
    context_id: Option<u64>,
}

impl SysError {
    /// Creates a new error from a code.
    pub const fn new(code: ErrorCode) -> Self {
        SysError {
            code,
            message: None,
            context_id: None,
        }
    }

    /// Creates an error with a message.
    pub const fn with_message(code: ErrorCode, message: &'static str) -> Self {
        SysError {
            code,
            message: Some(message),
            context_id: None,
        }
    }

    /// Attaches a context identifier.
    pub const fn with_context(mut self, id: u64) -> Self {
        self.context_id = Some(id);
        self
    }

    /// Returns the error code.
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the static message, if any.
    pub const fn message(&self) -> Option<&'static str> {
        self.message
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            ErrorCode::NotFound => write!(f, "Process not found"),
            ErrorCode::PermissionDenied => write!(f, "Permission denied"),
            ErrorCode::OutOfMemory => write!(f, "Out of memory"),
            ErrorCode::InvalidArgument => write!(f, "Invalid argument"),
            ErrorCode::NotMapped => write!(f, "Not mapped"),
            ErrorCode::InvalidState => write!(f, "Invalid state"),
        }?;

        if let Some(msg) = self.message {
            write!(f, ": {}", msg)?;
        }

        if let Some(id) = self.context_id {
            write!(f, " (context: {})", id)?;
        }

        Ok(())
    }
}

impl From<ErrorCode> for SysError {
    fn from(code: ErrorCode) -> Self {
        SysError::new(code)
    }
}
