use std::time::Duration;
use thiserror::Error;

use crate::dispatch::ActionKind;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("no wallet provider is available")]
    ProviderUnavailable,
    #[error("the wallet declined to share its accounts")]
    ConnectionRejected,
    #[error("network {network_id} is not supported; switch to Kovan (42) or a local node (1337)")]
    UnsupportedNetwork { network_id: u64 },
    #[error("the ledger program has no recorded deployment on network {network_id}")]
    ProgramNotDeployed { network_id: u64 },
    #[error("{call} failed: {reason}")]
    RemoteCallFailed { call: &'static str, reason: String },
    #[error("{action} was rejected: {reason}")]
    ActionRejected { action: ActionKind, reason: String },
    #[error("{in_flight} is still in flight; wait for it to settle")]
    ActionAlreadyInProgress { in_flight: ActionKind },
    #[error("{call} did not settle within {after:?}")]
    Timeout { call: &'static str, after: Duration },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session halted: {0}")]
    SessionHalted(String),
}

impl ClientError {
    pub fn remote(call: &'static str, reason: impl ToString) -> Self {
        ClientError::RemoteCallFailed {
            call,
            reason: reason.to_string(),
        }
    }

    pub fn rejected(action: ActionKind, reason: impl ToString) -> Self {
        ClientError::ActionRejected {
            action,
            reason: reason.to_string(),
        }
    }

    /// Initialization failures end the session, including a wallet handshake
    /// that never answers. Everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::ProviderUnavailable
                | ClientError::ConnectionRejected
                | ClientError::UnsupportedNetwork { .. }
                | ClientError::ProgramNotDeployed { .. }
                | ClientError::Timeout {
                    call: "eth_requestAccounts" | "net_version",
                    ..
                }
        )
    }
}
