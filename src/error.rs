// src/error.rs - Error taxonomy for trigger management and evaluation

use std::time::Duration;
use thiserror::Error;

use crate::types::ActionKind;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Invalid regex pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid {kind} action: {reason}")]
    InvalidAction { kind: ActionKind, reason: String },

    #[error("Trigger `{name}` already exists")]
    DuplicateName { name: String },

    #[error("Trigger `{name}` does not exist")]
    TriggerNotFound { name: String },

    #[error("Not authorized for trigger `{trigger}`: {reason}")]
    AuthorizationDenied { trigger: String, reason: String },

    #[error("Trigger `{name}` cannot be edited this way: {reason}")]
    NotEditable { name: String, reason: String },

    #[error("{kind} action of trigger `{trigger}` failed: {reason}")]
    ActionFailed {
        trigger: String,
        kind: ActionKind,
        reason: String,
    },

    #[error("Pattern search exceeded {0:?}")]
    MatchTimeout(Duration),

    #[error("Match worker failed: {0}")]
    Matcher(String),

    #[error("Changing {setting} requires confirmation: {warning}")]
    ConfirmationRequired { setting: String, warning: String },

    #[error("{0}")]
    InvalidSetting(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl TriggerError {
    pub fn invalid_action(kind: ActionKind, reason: impl Into<String>) -> Self {
        TriggerError::InvalidAction { kind, reason: reason.into() }
    }

    /// Errors a moderator can fix by changing their input
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            TriggerError::InvalidPattern { .. }
                | TriggerError::InvalidAction { .. }
                | TriggerError::DuplicateName { .. }
                | TriggerError::TriggerNotFound { .. }
                | TriggerError::NotEditable { .. }
                | TriggerError::InvalidSetting(_)
        )
    }
}

impl From<anyhow::Error> for TriggerError {
    fn from(err: anyhow::Error) -> Self {
        TriggerError::PersistenceFailure(format!("{:#}", err))
    }
}
