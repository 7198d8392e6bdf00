//! Crate-wide typed errors for control-plane failures.
//!
//! Tool failures, timeouts, and the usage-limit sentinel are *not* modeled
//! here — §4.2/§7 treat those as routine data carried in `ActionResult`,
//! never as `Err`. These variants are for genuine control-plane bugs:
//! storage I/O, malformed automation records, misconfigured verifiers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("automation {0} not found")]
    AutomationNotFound(String),

    #[error("unknown trigger type: {0}")]
    UnknownTriggerType(String),

    #[error("invalid trigger_config for automation {automation_id}: {reason}")]
    InvalidTriggerConfig {
        automation_id: String,
        reason: String,
    },

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("control-flow templates are not supported: {0}")]
    ControlFlowUnsupported(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
