//! Error types for the QuickJS host bridge

use thiserror::Error;

/// Errors raised while bringing the engine up.
///
/// Each variant corresponds to one setup step, in the order the steps run,
/// so a failure message always names the step that broke.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Engine runtime allocation failed
    #[error("failed to create runtime: {0}")]
    RuntimeCreate(String),

    /// Execution context allocation failed
    #[error("failed to create execution context: {0}")]
    ContextCreate(String),

    /// The fresh context could not be entered or its global object probed
    #[error("failed to activate execution context: {0}")]
    ContextActivate(String),

    /// Installing the continuation hooks and dispatch glue failed
    #[error("failed to set up promise continuation hook: {0}")]
    ContinuationHook(String),

    /// A host binding could not be projected into the global scope
    #[error("failed to project {name} into the global scope: {detail}")]
    Projection { name: String, detail: String },

    /// A bootstrap script failed to load or run
    #[error("failed to load script reference '{name}': {detail}")]
    ScriptReference { name: String, detail: String },

    /// The debugger collaborator refused the attach
    #[error("failed to start debugging: {0}")]
    DebuggerAttach(String),

    /// Initialize was requested on an engine that already holds a session
    #[error("engine already initialized")]
    AlreadyInitialized,

    /// Unanticipated failure (including panics) during setup
    #[error("internal error during initialization: {0}")]
    Internal(String),
}

/// The stage of the exception extraction pipeline that failed.
///
/// When a script raises, the bridge retrieves the pending exception, reads
/// its message property and converts it to text. Any of those reads can
/// itself fail, and each failure gets its own diagnostic so the caller can
/// tell a broken script apart from a broken error object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExtractionStep {
    /// The pending exception could not be retrieved and cleared
    #[error("failed to get and clear exception")]
    Retrieve,

    /// The exception object's message property could not be read
    #[error("failed to get error message")]
    Message,

    /// The message value could not be converted to a string
    #[error("failed to convert error message")]
    Convert,
}

/// Errors raised while executing a script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Execution was requested before the engine session was opened
    #[error("no active context")]
    NoActiveContext,

    /// The script itself raised; carries the guest exception message verbatim
    #[error("{message}")]
    Evaluation { message: String },

    /// The script raised but the exception could not be described
    #[error("{0}")]
    Extraction(ExtractionStep),

    /// The completed script's result value could not be rendered as text
    #[error("failed to convert value to string: {0}")]
    ResultConversion(String),

    /// A drained continuation (promise job or deferred callback) raised
    #[error("continuation failed: {0}")]
    ContinuationFailed(String),

    /// Unanticipated host-side failure, including panics in the engine worker
    #[error("fatal error: internal error: {0}")]
    Internal(String),
}

impl ScriptError {
    /// Create an evaluation error carrying a guest exception message
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }
}

/// Errors raised while retrieving script text.
#[derive(Debug, Error)]
pub enum LoadError {
    /// A packaged resource was requested but no script root is configured
    #[error("no script root configured for packaged resource '{name}'")]
    NoScriptRoot { name: String },

    /// The resource name resolved outside the configured script root
    #[error("packaged resource '{name}' escapes the script root")]
    OutsideRoot { name: String },

    /// Reading the packaged resource from disk failed
    #[error("failed to read packaged resource '{name}': {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The download URL did not parse
    #[error("invalid script url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The download itself failed (connection, status, or body read)
    #[error("failed to download script from '{url}': {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Errors raised while defining host bindings.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The binding name is not usable as a global identifier
    #[error("binding name '{0}' is not a valid identifier")]
    InvalidName(String),

    /// A host object member cannot be represented in the guest
    #[error("host object member '{name}' cannot be projected: {reason}")]
    Unrepresentable { name: String, reason: String },

    /// Installing the binding into the global scope failed
    #[error("failed to install binding '{name}': {detail}")]
    Install { name: String, detail: String },

    /// A value could not cross the host/guest boundary
    #[error("type conversion failed: {0}")]
    Marshal(String),
}

impl ProjectionError {
    /// Create a marshaling error
    pub fn marshal(detail: impl Into<String>) -> Self {
        Self::Marshal(detail.into())
    }
}

/// Top-level error for host-facing bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Engine setup failed
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// Script execution failed
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Script retrieval failed
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Binding definition failed
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    /// The engine worker thread is gone or did not respond
    #[error("engine worker unavailable: {0}")]
    Worker(String),
}

/// Result type for bridge operations
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
