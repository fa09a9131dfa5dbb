use std::time::Duration;

use thiserror::Error;

/// Structured errors surfaced by the extension manager and its subsystems.
#[derive(Debug, Error)]
pub enum ExtensionError {
    // Registration / lookup
    #[error("extension '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("extensions are already initialized; registration is closed")]
    PostInitialized,
    #[error("'{0}' not found")]
    NotFound(String),

    // Dependency graph
    #[error("extension '{module}' depends on unknown '{depends_on}'")]
    MissingDependency { module: String, depends_on: String },
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    // Phase errors with extension context
    #[error("pre-init failed for extension '{module}'")]
    PreInit {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("init failed for extension '{module}'")]
    Init {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("post-init failed for extension '{module}'")]
    PostInit {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("cleanup failed for extension '{module}'")]
    Cleanup {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    /// Collected failures from a full three-phase init run.
    #[error("initialization failed for {} extension(s): [{}]", errors.len(),
            errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    PhaseFailed { errors: Vec<ExtensionError> },

    #[error("{what} timed out after {timeout:?}")]
    Timeout { what: String, timeout: Duration },

    // Plugin loading
    #[error("plugin '{path}' rejected by security policy: {reason}")]
    SecurityRejected { path: String, reason: String },
    #[error("plugin '{name}' refused by resource limits: {reason}")]
    ResourceLimit { name: String, reason: String },
    #[error("plugin '{path}' does not export an 'Instance' symbol")]
    PluginSymbolMissing {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("plugin '{path}' Instance does not satisfy the extension contract")]
    IncompatibleInstance { path: String },

    // Dispatch
    #[error("service '{0}' is unavailable")]
    UnavailableService(String),
    #[error("message broker unavailable")]
    BrokerUnavailable {
        #[source]
        source: anyhow::Error,
    },
    #[error("circuit breaker for '{0}' is open")]
    CircuitOpen(String),

    // Data layer
    #[error("invalid balancing strategy '{0}'")]
    InvalidStrategy(String),
    #[error("no available replicas")]
    NoAvailableReplicas,

    #[error("serialization failed")]
    SerializationFailed {
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExtensionError {
    /// Name of the lifecycle phase a phase error belongs to, if any.
    pub fn phase(&self) -> Option<&'static str> {
        match self {
            Self::PreInit { .. } => Some("pre_init"),
            Self::Init { .. } => Some("init"),
            Self::PostInit { .. } => Some("post_init"),
            Self::Cleanup { .. } => Some("cleanup"),
            _ => None,
        }
    }
}

pub type Result<T, E = ExtensionError> = std::result::Result<T, E>;
