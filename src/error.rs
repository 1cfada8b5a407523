use std::fmt;
use std::path::PathBuf;

/// Engine-wide error taxonomy. `DeviceLost` is the only fatal kind; every
/// other variant leaves the rest of the engine running.
#[derive(Debug)]
pub enum EngineError {
    /// Invalid path, malformed session, bad routing request. The operation
    /// is aborted with no partial state change.
    Config(String),
    /// Plugin activation failure, allocation failure. The affected unit is
    /// left inactive.
    Resource(String),
    /// A realtime-path violation that was contained (silence substituted).
    Realtime(String),
    /// Render job failure: disk write error, writer rejected the format.
    Render(String),
    /// The audio I/O device disappeared.
    DeviceLost(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            EngineError::Resource(msg) => write!(f, "Resource error: {}", msg),
            EngineError::Realtime(msg) => write!(f, "Realtime error: {}", msg),
            EngineError::Render(msg) => write!(f, "Render error: {}", msg),
            EngineError::DeviceLost(msg) => write!(f, "Audio device lost: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Render(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Resource(err.to_string())
    }
}

/// Why a plugin bundle failed to load or come up.
#[derive(Debug)]
pub enum PluginLoadError {
    /// No bundle at the given path.
    NotFound(PathBuf),
    /// The bundle exists but its manifest is missing, unparsable, or names
    /// an unknown processor kind.
    IncompatibleFormat(String),
    /// Manifest was valid but the processor rejected its configuration.
    InitFailure(String),
    /// `activate` failed for the given sample rate / block size.
    ActivationFailed(String),
}

impl fmt::Display for PluginLoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PluginLoadError::NotFound(path) => {
                write!(f, "Plugin bundle not found: {}", path.display())
            }
            PluginLoadError::IncompatibleFormat(msg) => {
                write!(f, "Incompatible plugin bundle: {}", msg)
            }
            PluginLoadError::InitFailure(msg) => write!(f, "Plugin failed to initialize: {}", msg),
            PluginLoadError::ActivationFailed(msg) => {
                write!(f, "Plugin activation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for PluginLoadError {}

impl From<PluginLoadError> for EngineError {
    fn from(err: PluginLoadError) -> Self {
        match err {
            PluginLoadError::NotFound(_) | PluginLoadError::IncompatibleFormat(_) => {
                EngineError::Config(err.to_string())
            }
            PluginLoadError::InitFailure(_) | PluginLoadError::ActivationFailed(_) => {
                EngineError::Resource(err.to_string())
            }
        }
    }
}
