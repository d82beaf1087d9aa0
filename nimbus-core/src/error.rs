//! Error taxonomy for the emulator.
//!
//! Every emulator operation returns `Result<_, EmulatorError>`. Storage and
//! backend errors are mapped into a taxonomy kind at the emulator boundary;
//! beyond that boundary errors travel as values, never as panics. The wire
//! dispatch layer turns a kind into the dialect's native envelope.

/// A classified emulator error.
pub enum EmulatorError {
    /// Invalid assembly or a resource referencing something that does not
    /// exist. Fatal at startup.
    Configuration(String),
    /// A provider's `start()` failed or timed out. Fatal; triggers rollback.
    ProviderStart(String),
    /// A logical entity (bucket, queue, function, ...) does not exist.
    NotFound(String),
    /// A uniqueness violation such as a duplicate name.
    Conflict(String),
    /// A malformed request.
    Validation(String),
    /// A function invocation returned an error payload.
    Handler(String),
    /// A deadline was exceeded.
    Timeout(String),
    /// An unexpected failure inside emulator code.
    Internal(String),
}

impl EmulatorError {
    /// The wire-level error code for this kind, used as the JSON `__type`
    /// discriminator and the XML `<Code>` element.
    pub fn code(&self) -> &'static str {
        match self {
            EmulatorError::Configuration(_) => "InvalidConfiguration",
            EmulatorError::ProviderStart(_) => "ProviderStartError",
            EmulatorError::NotFound(_) => "ResourceNotFoundException",
            EmulatorError::Conflict(_) => "ResourceConflictException",
            EmulatorError::Validation(_) => "ValidationException",
            EmulatorError::Handler(_) => "HandlerError",
            EmulatorError::Timeout(_) => "TimeoutError",
            EmulatorError::Internal(_) => "InternalError",
        }
    }

    /// The HTTP status the dispatch layer uses when no dialect override
    /// applies.
    pub fn http_status(&self) -> u16 {
        match self {
            EmulatorError::Configuration(_) | EmulatorError::Validation(_) => 400,
            EmulatorError::NotFound(_) => 404,
            EmulatorError::Conflict(_) => 409,
            EmulatorError::Timeout(_) => 504,
            EmulatorError::ProviderStart(_)
            | EmulatorError::Handler(_)
            | EmulatorError::Internal(_) => 500,
        }
    }

    /// The human-readable message carried by the error.
    pub fn message(&self) -> &str {
        match self {
            EmulatorError::Configuration(msg)
            | EmulatorError::ProviderStart(msg)
            | EmulatorError::NotFound(msg)
            | EmulatorError::Conflict(msg)
            | EmulatorError::Validation(msg)
            | EmulatorError::Handler(msg)
            | EmulatorError::Timeout(msg)
            | EmulatorError::Internal(msg) => msg,
        }
    }
}

impl std::fmt::Display for EmulatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::fmt::Debug for EmulatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for EmulatorError {}

impl From<std::io::Error> for EmulatorError {
    fn from(err: std::io::Error) -> Self {
        EmulatorError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for EmulatorError {
    fn from(err: serde_json::Error) -> Self {
        EmulatorError::Validation(format!("invalid JSON: {err}"))
    }
}
