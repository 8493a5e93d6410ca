use thiserror::Error;

/// Domain-level errors raised by argument binding, the task runtime, file
/// copying, and context transports.
///
/// Lower-level OS/process plumbing (spawning a child process, waiting on it,
/// canonicalizing a path) keeps using [`stacked_errors::Error`] the way
/// `Command`/`CommandRunner` already do; those get folded into
/// [`CrewError::Transport`] at the point where a [`Context`](crate::Context)
/// turns a failed OS call into a domain-level outcome.
#[derive(Debug, Error)]
pub enum CrewError {
    #[error("missing required argument `{0}`")]
    MissingArgument(String),

    #[error("unexpected argument(s): {0}")]
    UnexpectedArgument(String),

    #[error("argument `{name}` does not match declared type {expected}: {value}")]
    ArgumentTypeMismatch {
        name: String,
        expected: String,
        value: String,
    },

    #[error("`{0}` is a reserved argument name")]
    ReservedArgumentName(String),

    #[error("command failed with code {code:?}: {command}\nstdout: {stdout}\nstderr: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// A recoverable signal raised from inside `verify`. Anywhere else it
    /// becomes an executor `failed` bucket.
    #[error("assertion failed: {0}")]
    AssertionFailure(String),

    #[error("task failed to converge: {0}")]
    TaskFailureError(String),

    #[error("return value does not conform to declared type: {0}")]
    ReturnTypeMismatch(String),

    #[error("no copier registered for {0}")]
    UnsupportedCopy(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("cancelled")]
    Cancelled,

    /// An underlying OS/process-level failure, carried up from
    /// `stacked_errors` plumbing or std I/O.
    #[error("transport error: {0}")]
    Transport(String),
}

impl CrewError {
    /// True for the one error kind the task runtime treats specially: a
    /// failed `verify()` call, which drives the run-then-reverify cycle
    /// rather than propagating immediately.
    pub fn is_assertion(&self) -> bool {
        matches!(self, CrewError::AssertionFailure(_))
    }
}

impl From<stacked_errors::Error> for CrewError {
    fn from(e: stacked_errors::Error) -> Self {
        CrewError::Transport(format!("{e}"))
    }
}

impl From<std::io::Error> for CrewError {
    fn from(e: std::io::Error) -> Self {
        CrewError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CrewError>;
