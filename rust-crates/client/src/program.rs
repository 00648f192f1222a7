use alloy_primitives::U256;
use anyhow::Context;
use deployments::DeploymentEnv;
use ledger_abi::{
    Account,
    Entity,
    GET_ALL_CHARACTERS,
    GET_MY_CHARACTERS,
    GET_OTHERS_CHARACTERS,
    OWNER,
};
use std::{
    collections::BTreeMap,
    future::Future,
    path::Path,
    sync::Arc,
    time::Duration,
};
use tracing::{
    debug,
    warn,
};

use crate::{
    dispatch::Action,
    error::{
        ClientError,
        Result,
    },
    ledger::{
        LedgerProgram,
        TxReceipt,
        WalletProvider,
    },
};

/// Network ids the ledger program is deployed to: a local node and Kovan.
pub const SUPPORTED_NETWORKS: [u64; 2] = [1337, 42];

pub fn is_supported(network_id: u64) -> bool {
    SUPPORTED_NETWORKS.contains(&network_id)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkBinding {
    pub network_id: u64,
    pub program_address: Option<String>,
}

/// Where the ledger program lives on each supported network.
#[derive(Clone, Debug, Default)]
pub struct ProgramDirectory {
    addresses: BTreeMap<u64, String>,
}

impl ProgramDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, network_id: u64, address: impl Into<String>) -> Self {
        self.addresses.insert(network_id, address.into());
        self
    }

    /// Builds the directory from the recorded deployments. When the hash of
    /// the locally built program is known, records that were made for a
    /// different build are reported but still used.
    pub fn from_deployments(
        root: impl AsRef<Path>,
        expected_hash: Option<&str>,
    ) -> anyhow::Result<Self> {
        let records = deployments::load_all(root.as_ref()).with_context(|| {
            format!("Failed to load deployments from {}", root.as_ref().display())
        })?;
        let mut directory = Self::new();
        for (network_id, record) in records {
            if let Some(hash) = expected_hash
                && !record.is_compatible_with_hash(hash)
            {
                warn!(
                    network_id,
                    address = %record.program_address,
                    "recorded deployment was made from a different program build"
                );
            }
            directory = directory.with_address(network_id, record.program_address);
        }
        Ok(directory)
    }

    /// Fails closed: unsupported networks never yield a binding.
    pub fn resolve(&self, network_id: u64) -> Result<NetworkBinding> {
        if !is_supported(network_id) {
            return Err(ClientError::UnsupportedNetwork { network_id });
        }
        let program_address = self.addresses.get(&network_id).cloned();
        if program_address.is_none() {
            let env = DeploymentEnv::from_network_id(network_id);
            warn!(network_id, ?env, "no deployment recorded");
            return Err(ClientError::ProgramNotDeployed { network_id });
        }
        Ok(NetworkBinding {
            network_id,
            program_address,
        })
    }
}

/// Resolves the program for `network_id` and attaches a handle through the provider.
pub fn bind_program<W: WalletProvider>(
    provider: &W,
    directory: &ProgramDirectory,
    network_id: u64,
    call_timeout: Duration,
) -> Result<ProgramHandle<W::Program>> {
    let binding = directory.resolve(network_id)?;
    let address = binding
        .program_address
        .as_deref()
        .ok_or(ClientError::ProgramNotDeployed { network_id })?;
    let program = provider.attach(address)?;
    debug!(network_id, %address, "program attached");
    Ok(ProgramHandle::new(program, binding, call_timeout))
}

/// The ledger program bound to one network. Every call is bounded by
/// `call_timeout`.
#[derive(Debug)]
pub struct ProgramHandle<P> {
    program: Arc<P>,
    binding: NetworkBinding,
    call_timeout: Duration,
}

impl<P> Clone for ProgramHandle<P> {
    fn clone(&self) -> Self {
        Self {
            program: Arc::clone(&self.program),
            binding: self.binding.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<P: LedgerProgram> ProgramHandle<P> {
    pub fn new(program: P, binding: NetworkBinding, call_timeout: Duration) -> Self {
        Self {
            program: Arc::new(program),
            binding,
            call_timeout,
        }
    }

    pub async fn owner(&self) -> Result<Account> {
        self.bounded(OWNER, self.program.owner()).await
    }

    pub async fn my_entities(&self, caller: &Account) -> Result<Vec<Entity>> {
        self.bounded(GET_MY_CHARACTERS, self.program.my_entities(caller))
            .await
    }

    pub async fn others_entities(&self, caller: &Account) -> Result<Vec<Entity>> {
        self.bounded(GET_OTHERS_CHARACTERS, self.program.others_entities(caller))
            .await
    }

    pub async fn all_entities(&self) -> Result<Vec<Entity>> {
        self.bounded(GET_ALL_CHARACTERS, self.program.all_entities())
            .await
    }

    pub async fn submit(
        &self,
        caller: &Account,
        action: &Action,
        value: U256,
    ) -> Result<TxReceipt> {
        let call = action.program_call().signature();
        self.bounded(call, self.program.submit(caller, action, value))
            .await
    }

    async fn bounded<T>(
        &self,
        call: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| {
                warn!(call, network_id = self.binding.network_id, "program call timed out");
                ClientError::Timeout {
                    call,
                    after: self.call_timeout,
                }
            })?
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::devnet::LocalLedger;
    use proptest::prelude::*;

    fn directory() -> ProgramDirectory {
        ProgramDirectory::new()
            .with_address(1337, "0x1111111111111111111111111111111111111111")
            .with_address(42, "0x4242424242424242424242424242424242424242")
    }

    proptest! {
        #[test]
        fn resolve__unsupported_network__fails_closed(network_id in any::<u64>()) {
            prop_assume!(!SUPPORTED_NETWORKS.contains(&network_id));
            prop_assert_eq!(
                directory().resolve(network_id),
                Err(ClientError::UnsupportedNetwork { network_id })
            );
        }
    }

    #[test]
    fn resolve__kovan__returns_recorded_address() {
        let binding = directory().resolve(42).unwrap();
        assert_eq!(
            binding.program_address.as_deref(),
            Some("0x4242424242424242424242424242424242424242")
        );
    }

    #[test]
    fn resolve__supported_without_record__fails_not_deployed() {
        assert_eq!(
            ProgramDirectory::new().resolve(1337),
            Err(ClientError::ProgramNotDeployed { network_id: 1337 })
        );
    }

    #[test]
    fn from_deployments__saved_record__is_resolvable() {
        // given
        let dir = tempdir::TempDir::new("program-directory").unwrap();
        let store =
            deployments::DeploymentStore::open_at(dir.path(), DeploymentEnv::Local).unwrap();
        store
            .save(&deployments::DeploymentRecord::new("0xabc"))
            .unwrap();

        // when
        let directory = ProgramDirectory::from_deployments(dir.path(), None).unwrap();

        // then
        assert_eq!(
            directory.resolve(1337).unwrap().program_address.as_deref(),
            Some("0xabc")
        );
        assert!(directory.resolve(42).is_err());
    }

    #[tokio::test]
    async fn owner__reads_paused_past_timeout__fails_with_timeout() {
        // given
        let ledger = LocalLedger::new();
        let handle = bind_program(
            &ledger,
            &ledger.directory(),
            1337,
            Duration::from_millis(20),
        )
        .unwrap();
        ledger.pause_reads();

        // when
        let result = handle.owner().await;

        // then
        assert_eq!(
            result,
            Err(ClientError::Timeout {
                call: OWNER,
                after: Duration::from_millis(20),
            })
        );
    }
}
