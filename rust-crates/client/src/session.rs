//! The explicit session context. Every wallet change tears the context down
//! and builds a new one under a fresh generation number; anything still
//! running for an older generation can no longer reach the shared views.

use ledger_abi::{
    Account,
    Entity,
    TypeCharacter,
};
use std::{
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::sync::{
    broadcast,
    watch,
};
use tracing::{
    error,
    info,
    warn,
};

use crate::{
    dispatch::{
        ActionDispatcher,
        ActionState,
        FeeSchedule,
    },
    error::{
        ClientError,
        Result,
    },
    ledger::{
        WalletEvent,
        WalletProvider,
    },
    program::{
        ProgramDirectory,
        ProgramHandle,
        bind_program,
    },
    sync::{
        RefreshScope,
        StateSynchronizer,
        SyncSnapshot,
    },
    wallet::WalletBinding,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub call_timeout: Duration,
    pub fees: FeeSchedule,
    /// What a new-block notice re-reads.
    pub block_scope: RefreshScope,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            fees: FeeSchedule::default(),
            block_scope: RefreshScope::Mine,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Active {
        generation: u64,
        account: Account,
        network_id: u64,
    },
    /// Initialization failed; no remote call is made until the wallet changes.
    Halted {
        generation: u64,
        notice: ClientError,
    },
}

struct SessionContext<P> {
    generation: u64,
    wallet: WalletBinding,
    program: ProgramHandle<P>,
    sync: StateSynchronizer,
    dispatcher: ActionDispatcher<P>,
}

pub struct Session<W: WalletProvider> {
    provider: Arc<W>,
    directory: ProgramDirectory,
    settings: SessionSettings,
    epoch: Arc<AtomicU64>,
    snapshots: watch::Sender<SyncSnapshot>,
    action_state: ActionState,
    wallet_events: broadcast::Receiver<WalletEvent>,
    selected_type: TypeCharacter,
    context: std::result::Result<SessionContext<W::Program>, ClientError>,
}

impl<W: WalletProvider> Session<W> {
    pub async fn start(
        provider: Arc<W>,
        directory: ProgramDirectory,
        settings: SessionSettings,
    ) -> Self {
        let wallet_events = provider.wallet_events();
        let (snapshots, _) = watch::channel(SyncSnapshot::default());
        let mut session = Self {
            provider,
            directory,
            settings,
            epoch: Arc::new(AtomicU64::new(0)),
            snapshots,
            action_state: ActionState::new(),
            wallet_events,
            selected_type: TypeCharacter::default(),
            context: Err(ClientError::SessionHalted("not started".to_string())),
        };
        session.rebuild().await;
        session
    }

    /// Drops the current context and builds a new one from the wallet's
    /// current account and network.
    pub async fn rebuild(&mut self) {
        let generation = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(old) = std::mem::replace(
            &mut self.context,
            Err(ClientError::SessionHalted("rebuilding".to_string())),
        ) {
            info!(old = old.generation, generation, "tearing down session");
            old.sync.shutdown();
        }
        self.snapshots.send_replace(SyncSnapshot {
            generation,
            ..SyncSnapshot::default()
        });

        self.context = self.build(generation).await;
        match &self.context {
            Ok(ctx) => info!(
                generation,
                account = %ctx.wallet.current_account(),
                network_id = ctx.wallet.network_id(),
                "session ready"
            ),
            Err(err) => error!(generation, %err, "session halted"),
        }
    }

    async fn build(&self, generation: u64) -> Result<SessionContext<W::Program>> {
        let wallet =
            WalletBinding::connect(self.provider.as_ref(), self.settings.call_timeout).await?;
        let program = bind_program(
            self.provider.as_ref(),
            &self.directory,
            wallet.network_id(),
            self.settings.call_timeout,
        )?;
        let account = wallet.current_account().clone();
        let sync = StateSynchronizer::spawn(
            program.clone(),
            account.clone(),
            generation,
            Arc::clone(&self.epoch),
            self.snapshots.clone(),
            self.provider.new_blocks(),
            self.settings.block_scope,
        );
        let dispatcher = ActionDispatcher::new(
            program.clone(),
            account,
            self.snapshots.subscribe(),
            sync.handle(),
            self.action_state.clone(),
            self.settings.fees,
            Arc::clone(&self.epoch),
        );
        Ok(SessionContext {
            generation,
            wallet,
            program,
            sync,
            dispatcher,
        })
    }

    /// Waits for the next wallet change notification.
    pub async fn next_wallet_event(&mut self) -> Option<WalletEvent> {
        loop {
            match self.wallet_events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "wallet notifications lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub async fn handle_wallet_event(&mut self, event: WalletEvent) {
        match &event {
            WalletEvent::AccountsChanged(accounts) => {
                info!(accounts = accounts.len(), "wallet accounts changed")
            }
            WalletEvent::NetworkChanged(network_id) => {
                info!(network_id, "wallet network changed")
            }
        }
        self.rebuild().await;
    }

    pub fn generation(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        match &self.context {
            Ok(ctx) => SessionStatus::Active {
                generation: ctx.generation,
                account: ctx.wallet.current_account().clone(),
                network_id: ctx.wallet.network_id(),
            },
            Err(notice) => SessionStatus::Halted {
                generation: self.generation(),
                notice: notice.clone(),
            },
        }
    }

    /// The blocking notice to show when initialization failed.
    pub fn halt_notice(&self) -> Option<&ClientError> {
        self.context.as_ref().err()
    }

    pub fn account(&self) -> Option<&Account> {
        self.context
            .as_ref()
            .ok()
            .map(|ctx| ctx.wallet.current_account())
    }

    pub fn snapshots(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn action_state(&self) -> &ActionState {
        &self.action_state
    }

    pub fn selected_type(&self) -> TypeCharacter {
        self.selected_type
    }

    pub fn select_type(&mut self, kind: TypeCharacter) {
        info!(%kind, "character type selected");
        self.selected_type = kind;
    }

    fn active(&self) -> Result<&SessionContext<W::Program>> {
        self.context
            .as_ref()
            .map_err(|notice| match notice {
                ClientError::SessionHalted(_) => notice.clone(),
                fatal => ClientError::SessionHalted(fatal.to_string()),
            })
    }

    pub fn dispatcher(&self) -> Result<ActionDispatcher<W::Program>> {
        Ok(self.active()?.dispatcher.clone())
    }

    pub fn program(&self) -> Result<ProgramHandle<W::Program>> {
        Ok(self.active()?.program.clone())
    }

    /// Reads every character on the ledger. Shown on demand, never cached.
    pub async fn all_entities(&self) -> Result<Vec<Entity>> {
        self.program()?.all_entities().await
    }

    /// Asks the synchronizer for a refresh of the caller's characters, as a
    /// block notice would.
    pub fn refresh_mine(&self) -> Result<()> {
        self.active()?.sync.handle().notify(RefreshScope::Mine);
        Ok(())
    }

    pub fn shutdown(self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Ok(ctx) = self.context {
            ctx.sync.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::devnet::LocalLedger;

    async fn start(ledger: &LocalLedger) -> Session<LocalLedger> {
        Session::start(
            Arc::new(ledger.clone()),
            ledger.directory(),
            SessionSettings::default(),
        )
        .await
    }

    #[tokio::test]
    async fn start__devnet__is_active_for_first_account() {
        // given
        let ledger = LocalLedger::new();

        // when
        let session = start(&ledger).await;

        // then
        assert_eq!(
            session.status(),
            SessionStatus::Active {
                generation: 1,
                account: ledger.accounts()[0].clone(),
                network_id: 1337,
            }
        );
        session.shutdown();
    }

    #[tokio::test]
    async fn start__provider_missing__halts_with_notice() {
        // given
        let ledger = LocalLedger::new();
        ledger.set_provider_available(false);

        // when
        let session = start(&ledger).await;

        // then
        assert_eq!(session.halt_notice(), Some(&ClientError::ProviderUnavailable));
        assert!(matches!(
            session.dispatcher().err(),
            Some(ClientError::SessionHalted(_))
        ));
        assert_eq!(ledger.read_calls(), 0);
    }

    #[tokio::test]
    async fn handle_wallet_event__account_switch__rebuilds_for_new_account() {
        // given
        let ledger = LocalLedger::new();
        let mut session = start(&ledger).await;
        let second = ledger.accounts()[1].clone();

        // when
        ledger.switch_account(1);
        let event = session.next_wallet_event().await.unwrap();
        session.handle_wallet_event(event).await;

        // then
        assert_eq!(session.account(), Some(&second));
        assert_eq!(session.generation(), 2);
        assert_eq!(session.snapshot().generation, 2);
        session.shutdown();
    }

    #[tokio::test]
    async fn select_type__survives_rebuild() {
        // given
        let ledger = LocalLedger::new();
        let mut session = start(&ledger).await;
        assert_eq!(session.selected_type(), TypeCharacter::Berserker);

        // when
        session.select_type(TypeCharacter::Spiritual);
        session.rebuild().await;

        // then
        assert_eq!(session.selected_type(), TypeCharacter::Spiritual);
        session.shutdown();
    }
}
