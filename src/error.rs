//! Error types for the FaaS host.

/// Result type alias for FaaS host operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the FaaS host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Invocation Errors
    // =========================================================================
    /// The named guest entry point is missing or not callable.
    #[error("function '{function}' not found or not executable ({language})")]
    FunctionNotFound { language: String, function: String },

    /// The invocation exceeded its time budget.
    #[error("invocation timed out after {millis} ms")]
    InvocationTimeout { millis: i64 },

    /// A guest `require` named a dependency that was not uploaded.
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// Parse or runtime failure inside the guest context.
    #[error("guest evaluation failed: {0}")]
    GuestEvaluation(String),

    /// The manifest named a language this host does not recognize.
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    /// No engine backend is registered for a recognized language.
    #[error("no engine registered for language: {0}")]
    EngineUnavailable(String),

    // =========================================================================
    // Egress Errors
    // =========================================================================
    /// Outbound traffic was refused before any connection attempt.
    #[error("egress denied: {reason}")]
    EgressDenied { reason: String },

    /// Malformed IPv4 address or CIDR notation.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The virtual network request itself failed after passing enforcement.
    #[error("virtual network request failed: {0}")]
    NetworkRequest(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// The upload manifest is missing or conflicting required fields.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Malformed JSON body on a management endpoint.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// A persisted record could not be written.
    #[error("storage write failed: {0}")]
    StorageWriteFailed(String),

    /// The referenced function or resource does not exist.
    #[error("no such record: {0}")]
    RecordNotFound(String),

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// Operation not supported (e.g. the SQL resource placeholder).
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds an egress denial with a plain reason.
    pub fn egress(reason: impl Into<String>) -> Self {
        Error::EgressDenied {
            reason: reason.into(),
        }
    }
}
