use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("block {0} not found")]
    BlockNotFound(String),

    #[error("account {0} not found")]
    AccountNotFound(String),

    #[error("rollback chain too deep")]
    RollbackTooDeep,
}
