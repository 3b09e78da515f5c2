use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("not initialized: run 'specflow init'")]
    NotInitialized,

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("flow already exists: {0}")]
    FlowExists(String),

    #[error("invalid feature name '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidSlug(String),

    #[error("invalid transition from {from} on {event}: {reason}")]
    InvalidTransition {
        from: String,
        event: String,
        reason: String,
    },

    #[error("invalid phase: {0}")]
    InvalidPhase(String),

    #[error("invalid workflow mode: {0}")]
    InvalidMode(String),

    #[error("phase '{phase}' vetoed by plugin '{plugin}': {reason}")]
    Vetoed {
        phase: String,
        plugin: String,
        reason: String,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("home directory not found: set HOME environment variable")]
    HomeNotFound,

    #[error(transparent)]
    Plugin(#[from] crate::plugin::PluginError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
