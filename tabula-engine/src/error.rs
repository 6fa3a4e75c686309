use tabula_model::{ConfigVersionId, RunId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Lease expired for run {run_id}")]
    LeaseExpired { run_id: RunId },

    #[error("Environment build failed for {config_version}: {diagnostic}")]
    BuildFailed {
        config_version: ConfigVersionId,
        diagnostic: String,
    },

    #[error("Outbound network denied by policy: {detail}")]
    PolicyViolation { detail: String },

    #[error("Activation of {config_version} failed in hook '{hook_name}': {detail}")]
    ActivationFailed {
        config_version: ConfigVersionId,
        hook_name: String,
        detail: String,
    },

    #[error("Hook '{hook_name}' signaled a fatal condition: {detail}")]
    HookFatal { hook_name: String, detail: String },

    #[error("Configuration version {0} is not activated")]
    NotActivated(ConfigVersionId),

    #[error("Retry rejected for run {run_id}: {reason}")]
    RetryRejected { run_id: RunId, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
