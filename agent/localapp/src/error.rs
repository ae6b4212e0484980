use thiserror::Error;

use crate::rpc::RpcError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, LocalAppError>;

#[derive(Debug, Error)]
pub enum LocalAppError {
    /// Cancelled while waiting for or holding a lease, or the lease was lost.
    #[error("lease `{lock}` cancelled")]
    LockCancelled { lock: String },

    /// Cancelled outside a lease (RPC retries, standalone installs).
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid remote host {0}")]
    InvalidHost(String),

    #[error("probing {url} failed: {reason}")]
    ProbeFailed { url: String, reason: String },

    #[error("installing helper failed: {0}")]
    InstallFailed(String),

    #[error("helper failed to start: {0}")]
    SpawnFailed(String),

    /// Process alive but its RPC endpoint is not accepting calls yet. The
    /// broker retries these internally.
    #[error("helper endpoint on port {port} is not ready")]
    EndpointNotReady { port: u16 },

    #[error("helper process {pid} for {host} is gone")]
    InstanceGone { host: String, pid: u32 },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LocalAppError {
    pub fn install(message: impl Into<String>) -> Self {
        Self::InstallFailed(message.into())
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::SpawnFailed(message.into())
    }

    /// True for the cancellation variants.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::LockCancelled { .. } | Self::Cancelled)
    }
}
