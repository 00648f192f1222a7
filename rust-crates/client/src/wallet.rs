use ledger_abi::Account;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{
    info,
    warn,
};

use crate::{
    error::{
        ClientError,
        Result,
    },
    ledger::WalletProvider,
};

pub const REQUEST_ACCOUNTS: &str = "eth_requestAccounts";
pub const NETWORK_ID: &str = "net_version";

fn handshake_timeout(call: &'static str, after: Duration) -> ClientError {
    warn!(call, ?after, "wallet did not answer");
    ClientError::Timeout { call, after }
}

/// Account identity and network as reported by the wallet at connect time.
/// Replaced wholesale whenever the wallet reports a change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletBinding {
    accounts: Vec<Account>,
    network_id: u64,
}

impl WalletBinding {
    /// Both handshake calls are bounded by `call_timeout`; a wallet that
    /// never answers fails with `Timeout` instead of stalling the session.
    pub async fn connect<W: WalletProvider>(
        provider: &W,
        call_timeout: Duration,
    ) -> Result<Self> {
        let accounts = timeout(call_timeout, provider.request_accounts())
            .await
            .map_err(|_| handshake_timeout(REQUEST_ACCOUNTS, call_timeout))??;
        if accounts.is_empty() {
            warn!("wallet returned no accounts");
            return Err(ClientError::ConnectionRejected);
        }
        let network_id = timeout(call_timeout, provider.network_id())
            .await
            .map_err(|_| handshake_timeout(NETWORK_ID, call_timeout))??;
        info!(account = %accounts[0], network_id, "wallet connected");
        Ok(Self {
            accounts,
            network_id,
        })
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    /// The first account is treated as the current user.
    pub fn current_account(&self) -> &Account {
        &self.accounts[0]
    }

    pub fn network_id(&self) -> u64 {
        self.network_id
    }
}
