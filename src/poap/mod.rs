use thiserror::Error;

pub mod chain_client;
pub mod events;
pub mod reconciler;

/// User-facing failures of the mint action.
///
/// Historical-fetch and read failures are not part of this taxonomy: they are
/// logged and degrade to stale state rather than surfacing to the user.
#[derive(Error, Debug)]
pub enum MintError {
    #[error("connect your wallet first")]
    WalletNotConnected,
    #[error("a mint is already in flight")]
    MintInFlight,
    #[error("transaction was rejected by the signer")]
    UserRejected,
    #[error("transaction simulation reverted: {0}")]
    SimulationReverted(String),
    #[error("chain adapter error: {0}")]
    Adapter(#[from] anyhow::Error),
}

pub type MintResult<T> = Result<T, MintError>;
