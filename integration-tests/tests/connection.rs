#![allow(non_snake_case)]

use ledger_abi::Account;
use nftg_client::{
    ClientError,
    Result,
    Session,
    SessionSettings,
    SessionStatus,
    devnet::{
        LocalLedger,
        LocalProgram,
    },
    ledger::{
        BlockNotice,
        WalletEvent,
        WalletProvider,
    },
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::sync::broadcast;

/// Wallet that shares its accounts only if `answers_accounts`, and never
/// reports a network.
struct UnresponsiveWallet {
    ledger: LocalLedger,
    answers_accounts: bool,
}

impl WalletProvider for UnresponsiveWallet {
    type Program = LocalProgram;

    async fn request_accounts(&self) -> Result<Vec<Account>> {
        if self.answers_accounts {
            return Ok(self.ledger.accounts());
        }
        std::future::pending().await
    }

    async fn network_id(&self) -> Result<u64> {
        std::future::pending().await
    }

    fn wallet_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.ledger.wallet_events()
    }

    fn new_blocks(&self) -> broadcast::Receiver<BlockNotice> {
        self.ledger.new_blocks()
    }

    fn attach(&self, program_address: &str) -> Result<LocalProgram> {
        self.ledger.attach(program_address)
    }
}

fn quick_settings() -> SessionSettings {
    SessionSettings {
        call_timeout: Duration::from_millis(50),
        ..SessionSettings::default()
    }
}

async fn start_bounded(wallet: UnresponsiveWallet) -> Session<UnresponsiveWallet> {
    let directory = wallet.ledger.directory();
    tokio::time::timeout(
        Duration::from_secs(2),
        Session::start(Arc::new(wallet), directory, quick_settings()),
    )
    .await
    .expect("session start should be bounded by the call timeout")
}

#[tokio::test]
async fn start__wallet_never_shares_accounts__halts_with_timeout_notice() {
    // given
    let wallet = UnresponsiveWallet {
        ledger: LocalLedger::new(),
        answers_accounts: false,
    };

    // when
    let session = start_bounded(wallet).await;

    // then
    let notice = session.halt_notice().cloned().unwrap();
    assert!(matches!(
        notice,
        ClientError::Timeout {
            call: "eth_requestAccounts",
            ..
        }
    ));
    assert!(notice.is_fatal());
    assert!(matches!(
        session.dispatcher().err(),
        Some(ClientError::SessionHalted(_))
    ));
}

#[tokio::test]
async fn start__wallet_never_reports_network__halts_without_remote_calls() {
    // given
    let ledger = LocalLedger::new();
    let wallet = UnresponsiveWallet {
        ledger: ledger.clone(),
        answers_accounts: true,
    };

    // when
    let session = start_bounded(wallet).await;

    // then
    assert!(matches!(
        session.status(),
        SessionStatus::Halted {
            notice: ClientError::Timeout {
                call: "net_version",
                ..
            },
            ..
        }
    ));
    assert_eq!(ledger.read_calls(), 0);
}
