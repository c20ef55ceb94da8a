use std::time::Duration;

use supply_common::{StageTransitionError, StepName};
use supply_providers::RemoteError;

use crate::algorithm::AlgorithmError;
use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Algorithm(#[from] AlgorithmError),
    #[error(transparent)]
    Stage(#[from] StageTransitionError),
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("device {key} already bound to suborder {suborder_id}")]
    DuplicateDevice { suborder_id: String, key: String },
    #[error("{0} returned no result")]
    EmptyResult(String),
    #[error("outcome of {0} is unknown")]
    UnknownOutcome(String),
    #[error("host {asset_id} is in business {bk_biz_id}, neither staging nor target")]
    DeviceDrifted { asset_id: String, bk_biz_id: i64 },
    #[error("step {step:?} of {suborder_id} cannot run before {blocked_by:?} succeeds")]
    StepOrder {
        suborder_id: String,
        step: StepName,
        blocked_by: StepName,
    },
    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },
    #[error("order {0} is not active")]
    OrderInactive(String),
    #[error("no generate record succeeded for {0}")]
    NoRecordSucceeded(String),
    #[error("nothing schedulable for {suborder_id}: {reason}")]
    Unschedulable { suborder_id: String, reason: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("gave up on {what} after {waited:?}")]
    Timeout { what: String, waited: Duration },
    #[error("remote task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },
    #[error("malformed {command} payload: {source}")]
    BadCommand {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Worth another attempt with the same inputs.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Remote(e) => !e.is_terminal(),
            OrchestratorError::Store(StoreError::Database(_)) => true,
            _ => false,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, OrchestratorError::Store(StoreError::Duplicate { .. }))
    }
}
