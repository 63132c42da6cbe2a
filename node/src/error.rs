use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("ledger: {0}")]
    Ledger(#[from] lattice_ledger::LedgerError),
}
