#![allow(dead_code)]

use nftg_client::{
    Session,
    SessionSettings,
    devnet::LocalLedger,
    sync::{
        SyncSnapshot,
        SyncState,
    },
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

pub struct TestContext {
    pub ledger: LocalLedger,
    pub session: Session<LocalLedger>,
    pub snapshots: watch::Receiver<SyncSnapshot>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_ledger(LocalLedger::new(), SessionSettings::default()).await
    }

    pub async fn with_ledger(ledger: LocalLedger, settings: SessionSettings) -> Self {
        let session =
            Session::start(Arc::new(ledger.clone()), ledger.directory(), settings).await;
        let snapshots = session.snapshots();
        Self {
            ledger,
            session,
            snapshots,
        }
    }

    /// Waits until the current generation has finished `refreshes` refreshes.
    pub async fn settled(&mut self, refreshes: u64) -> SyncSnapshot {
        let generation = self.session.generation();
        self.wait_for(|s| {
            s.generation == generation
                && s.completed_refreshes >= refreshes
                && s.state != SyncState::Loading
        })
        .await
    }

    pub async fn wait_for(&mut self, done: impl FnMut(&SyncSnapshot) -> bool) -> SyncSnapshot {
        tokio::time::timeout(WAIT, self.snapshots.wait_for(done))
            .await
            .expect("timed out waiting for the synchronizer")
            .expect("snapshot channel closed")
            .clone()
    }

    /// Delivers the next wallet notification to the session.
    pub async fn deliver_wallet_event(&mut self) {
        let event = tokio::time::timeout(WAIT, self.session.next_wallet_event())
            .await
            .expect("timed out waiting for a wallet event")
            .expect("wallet notifications closed");
        self.session.handle_wallet_event(event).await;
    }
}
