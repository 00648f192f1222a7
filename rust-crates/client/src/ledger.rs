//! Seams to the two external collaborators: the wallet/provider that owns
//! identity and the ledger program that owns entity state.

use alloy_primitives::U256;
use ledger_abi::{
    Account,
    Entity,
};
use std::future::Future;
use tokio::sync::broadcast;

use crate::{
    dispatch::Action,
    error::Result,
};

/// Change notifications pushed by the wallet at arbitrary times.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Account>),
    NetworkChanged(u64),
}

/// Fired once per new ledger block; carries no state beyond the height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockNotice {
    pub number: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

pub trait WalletProvider: Send + Sync + 'static {
    type Program: LedgerProgram;

    /// Asks the wallet for access to its accounts.
    fn request_accounts(&self) -> impl Future<Output = Result<Vec<Account>>> + Send;

    fn network_id(&self) -> impl Future<Output = Result<u64>> + Send;

    fn wallet_events(&self) -> broadcast::Receiver<WalletEvent>;

    fn new_blocks(&self) -> broadcast::Receiver<BlockNotice>;

    /// Binds a client for the program deployed at `program_address`.
    fn attach(&self, program_address: &str) -> Result<Self::Program>;
}

/// Operations the ledger program exposes. Reads fail with
/// `RemoteCallFailed`; writes fail with `ActionRejected` when the program or
/// wallet refuses them.
pub trait LedgerProgram: Send + Sync + 'static {
    fn owner(&self) -> impl Future<Output = Result<Account>> + Send;

    fn my_entities(&self, caller: &Account)
    -> impl Future<Output = Result<Vec<Entity>>> + Send;

    fn others_entities(
        &self,
        caller: &Account,
    ) -> impl Future<Output = Result<Vec<Entity>>> + Send;

    fn all_entities(&self) -> impl Future<Output = Result<Vec<Entity>>> + Send;

    /// Submits a state-changing call and resolves once it is settled.
    fn submit(
        &self,
        caller: &Account,
        action: &Action,
        value: U256,
    ) -> impl Future<Output = Result<TxReceipt>> + Send;
}
