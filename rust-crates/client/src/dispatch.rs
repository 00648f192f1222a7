use alloy_primitives::U256;
use ledger_abi::{
    Account,
    ProgramCall,
    TypeCharacter,
};
use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
};
use tokio::sync::watch;
use tracing::{
    debug,
    error,
    info,
};

use crate::{
    error::{
        ClientError,
        Result,
    },
    ledger::{
        LedgerProgram,
        TxReceipt,
    },
    program::ProgramHandle,
    sync::{
        RefreshScope,
        SyncHandle,
        SyncSnapshot,
    },
};

/// Characters at or above this much xp are not offered a heal.
pub const HEAL_THRESHOLD_XP: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Create,
    Heal,
    Fight,
    Withdraw,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Create => "create",
            ActionKind::Heal => "heal",
            ActionKind::Fight => "fight",
            ActionKind::Withdraw => "withdraw",
        };
        f.write_str(name)
    }
}

/// A state-changing request against the ledger program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Create(TypeCharacter),
    Heal { entity_id: u64 },
    Fight { mine: u64, rival: u64 },
    Withdraw,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create(_) => ActionKind::Create,
            Action::Heal { .. } => ActionKind::Heal,
            Action::Fight { .. } => ActionKind::Fight,
            Action::Withdraw => ActionKind::Withdraw,
        }
    }

    pub fn program_call(&self) -> ProgramCall {
        match self {
            Action::Create(kind) => ProgramCall::CreateCharacter(*kind),
            Action::Heal { entity_id } => ProgramCall::Heal {
                entity_id: *entity_id,
            },
            Action::Fight { mine, rival } => ProgramCall::Fight {
                mine: *mine,
                rival: *rival,
            },
            Action::Withdraw => ProgramCall::Withdraw,
        }
    }
}

/// Value attached to each payable call, in wei.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeSchedule {
    pub create: U256,
    pub heal: U256,
    pub fight: U256,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            create: U256::from(1_000_000_000_000_000u64),
            heal: U256::from(100_000_000_000_000u64),
            fight: U256::from(100_000_000_000_000u64),
        }
    }
}

impl FeeSchedule {
    pub fn value_for(&self, action: &Action) -> U256 {
        match action {
            Action::Create(_) => self.create,
            Action::Heal { .. } => self.heal,
            Action::Fight { .. } => self.fight,
            Action::Withdraw => U256::ZERO,
        }
    }
}

/// Single-in-flight gate shared by every dispatcher of the process. It
/// outlives session rebuilds, so an action started under an old account
/// still blocks new ones until it settles.
#[derive(Clone, Debug, Default)]
pub struct ActionState {
    in_flight: Arc<Mutex<Option<ActionKind>>>,
}

impl ActionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<ActionKind> {
        *self.lock()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight().is_some()
    }

    fn try_begin(&self, kind: ActionKind) -> Result<InFlightGuard> {
        let mut slot = self.lock();
        if let Some(in_flight) = *slot {
            return Err(ClientError::ActionAlreadyInProgress { in_flight });
        }
        *slot = Some(kind);
        Ok(InFlightGuard {
            state: self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActionKind>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the in-flight flag however the dispatch ends.
struct InFlightGuard {
    state: ActionState,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        *self.state.lock() = None;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionOutcome {
    pub action: Action,
    pub receipt: TxReceipt,
    /// Set when the client would not have offered the action but the
    /// program accepted it anyway.
    pub advisory: Option<String>,
}

pub struct ActionDispatcher<P> {
    program: ProgramHandle<P>,
    account: Account,
    snapshots: watch::Receiver<SyncSnapshot>,
    sync: SyncHandle,
    state: ActionState,
    fees: FeeSchedule,
    epoch: Arc<AtomicU64>,
}

impl<P> Clone for ActionDispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            program: self.program.clone(),
            account: self.account.clone(),
            snapshots: self.snapshots.clone(),
            sync: self.sync.clone(),
            state: self.state.clone(),
            fees: self.fees,
            epoch: Arc::clone(&self.epoch),
        }
    }
}

impl<P: LedgerProgram> ActionDispatcher<P> {
    pub fn new(
        program: ProgramHandle<P>,
        account: Account,
        snapshots: watch::Receiver<SyncSnapshot>,
        sync: SyncHandle,
        state: ActionState,
        fees: FeeSchedule,
        epoch: Arc<AtomicU64>,
    ) -> Self {
        Self {
            program,
            account,
            snapshots,
            sync,
            state,
            fees,
            epoch,
        }
    }

    pub fn action_state(&self) -> &ActionState {
        &self.state
    }

    fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.sync.generation()
    }

    pub async fn create(&self, kind: TypeCharacter) -> Result<ActionOutcome> {
        self.dispatch(Action::Create(kind)).await
    }

    pub async fn heal(&self, entity_id: u64) -> Result<ActionOutcome> {
        self.dispatch(Action::Heal { entity_id }).await
    }

    pub async fn fight(&self, mine: u64, rival: u64) -> Result<ActionOutcome> {
        self.dispatch(Action::Fight { mine, rival }).await
    }

    pub async fn withdraw(&self) -> Result<ActionOutcome> {
        self.dispatch(Action::Withdraw).await
    }

    /// Submits `action` if nothing else is in flight. On settlement the
    /// synchronizer is asked for a full refresh, unless the session was
    /// rebuilt while the call was pending.
    pub async fn dispatch(&self, action: Action) -> Result<ActionOutcome> {
        let kind = action.kind();
        if let Some(in_flight) = self.state.in_flight() {
            return Err(ClientError::ActionAlreadyInProgress { in_flight });
        }
        if !self.is_current() {
            return Err(ClientError::SessionHalted(
                "the wallet changed; the session was rebuilt".to_string(),
            ));
        }
        let advisory = self.check_preconditions(&action)?;
        let guard = self.state.try_begin(kind)?;

        let value = self.fees.value_for(&action);
        info!(%kind, account = %self.account, %value, "submitting action");
        let result = self.program.submit(&self.account, &action, value).await;
        drop(guard);

        match result {
            Ok(receipt) => {
                info!(%kind, tx = %receipt.tx_hash, "action settled");
                if self.is_current() {
                    self.sync.request_refresh(RefreshScope::Full).await;
                } else {
                    debug!(%kind, "session rebuilt while action was pending; skipping refresh");
                }
                Ok(ActionOutcome {
                    action,
                    receipt,
                    advisory,
                })
            }
            Err(err) => {
                error!(%kind, %err, "action failed");
                Err(err)
            }
        }
    }

    fn check_preconditions(&self, action: &Action) -> Result<Option<String>> {
        let snapshot = self.snapshots.borrow();
        let cache = &snapshot.cache;
        match action {
            Action::Create(_) => Ok(None),
            Action::Heal { entity_id } => {
                let entity = cache.owns(*entity_id).ok_or_else(|| {
                    ClientError::InvalidRequest(format!(
                        "character {entity_id} is not one of yours"
                    ))
                })?;
                Ok((entity.xp >= HEAL_THRESHOLD_XP).then(|| {
                    format!(
                        "character {entity_id} has {} xp; healing is normally offered below {HEAL_THRESHOLD_XP}",
                        entity.xp
                    )
                }))
            }
            Action::Fight { mine, rival } => {
                if cache.owns(*mine).is_none() {
                    return Err(ClientError::InvalidRequest(format!(
                        "character {mine} is not one of yours"
                    )));
                }
                if cache.rival(*rival).is_none() {
                    return Err(ClientError::InvalidRequest(format!(
                        "character {rival} is not a known rival"
                    )));
                }
                Ok(None)
            }
            Action::Withdraw => {
                if cache.is_owner {
                    Ok(None)
                } else {
                    Err(ClientError::InvalidRequest(
                        "only the program owner can withdraw".to_string(),
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn try_begin__second_action__reports_the_one_in_flight() {
        // given
        let state = ActionState::new();
        let _guard = state.try_begin(ActionKind::Fight).unwrap();

        // when
        let result = state.try_begin(ActionKind::Heal);

        // then
        assert!(matches!(
            result,
            Err(ClientError::ActionAlreadyInProgress {
                in_flight: ActionKind::Fight
            })
        ));
    }

    #[test]
    fn guard__dropped__clears_in_flight() {
        // given
        let state = ActionState::new();
        let guard = state.try_begin(ActionKind::Create).unwrap();
        assert!(state.is_in_flight());

        // when
        drop(guard);

        // then
        assert!(!state.is_in_flight());
        assert!(state.try_begin(ActionKind::Withdraw).is_ok());
    }

    #[test]
    fn value_for__withdraw__attaches_nothing() {
        let fees = FeeSchedule::default();
        assert_eq!(fees.value_for(&Action::Withdraw), U256::ZERO);
        assert_eq!(
            fees.value_for(&Action::Create(TypeCharacter::Berserker)),
            U256::from(1_000_000_000_000_000u64)
        );
    }

    #[test]
    fn program_call__fight__keeps_argument_order() {
        assert_eq!(
            Action::Fight { mine: 1, rival: 2 }.program_call(),
            ProgramCall::Fight { mine: 1, rival: 2 }
        );
    }
}
