use thiserror::Error;

use crate::core_router::RouterError;
use crate::core_store::model::hash::PayloadHash;
use crate::core_store::store::StoreError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("No record with identity {0}")]
    UnknownRecord(PayloadHash),

    #[error("Node already started")]
    AlreadyStarted,

    #[error("Node is not running")]
    NotRunning,
}

pub type NodeResult<T> = Result<T, NodeError>;
