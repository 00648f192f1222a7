//! In-process ledger for `--devnet` runs and tests.
//!
//! `LocalLedger` plays both collaborators: the wallet (accounts, network,
//! change notifications) and the ledger program (characters, fees, owner).
//! Test controls can pause or fail reads, hold or reject writes, and count
//! calls.

use alloy_primitives::U256;
use ledger_abi::{
    Account,
    Entity,
    TypeCharacter,
};
use sha2::{
    Digest,
    Sha256,
};
use std::sync::{
    Arc,
    Mutex,
    MutexGuard,
    PoisonError,
    atomic::{
        AtomicU64,
        Ordering,
    },
};
use tokio::sync::{
    broadcast,
    watch,
};
use tracing::{
    debug,
    info,
};

use crate::{
    dispatch::{
        Action,
        FeeSchedule,
    },
    error::{
        ClientError,
        Result,
    },
    ledger::{
        BlockNotice,
        LedgerProgram,
        TxReceipt,
        WalletEvent,
        WalletProvider,
    },
    program::ProgramDirectory,
};

pub const DEVNET_NETWORK_ID: u64 = 1337;
pub const DEVNET_PROGRAM_ADDRESS: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

const SEEDED_ACCOUNTS: [&str; 4] = [
    "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
    "0x70997970c51812dc3a010c7d01b50e0d17dc79c8",
    "0x3c44cdddb6a900fa2b585dd299e03d12fa4293bc",
    "0x90f79bf6eb2c4f870365e785982e1f101e93b906",
];
const NOTICE_BUFFER: usize = 64;

/// Open/closed switch that callers can wait behind.
#[derive(Debug)]
struct Gate {
    open: watch::Sender<bool>,
    waiting: watch::Sender<usize>,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: watch::Sender::new(true),
            waiting: watch::Sender::new(0),
        }
    }

    fn set_open(&self, open: bool) {
        self.open.send_replace(open);
    }

    async fn pass(&self) {
        let mut open = self.open.subscribe();
        let is_open = *open.borrow_and_update();
        if is_open {
            return;
        }
        let _waiting = Waiting::enter(&self.waiting);
        let _ = open.wait_for(|o| *o).await;
    }

    async fn wait_for_waiting(&self, count: usize) {
        let mut waiting = self.waiting.subscribe();
        let _ = waiting.wait_for(|w| *w >= count).await;
    }
}

struct Waiting<'a>(&'a watch::Sender<usize>);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Debug)]
struct Owned {
    owner: Account,
    entity: Entity,
}

#[derive(Debug)]
struct LedgerState {
    accounts: Vec<Account>,
    network_id: u64,
    program_owner: Account,
    characters: Vec<Owned>,
    next_id: u64,
    block: u64,
    balance: U256,
    fees: FeeSchedule,
    provider_available: bool,
    connection_rejected: bool,
    fail_reads: bool,
    reject_writes: Option<String>,
}

impl LedgerState {
    fn entities(&self, keep: impl Fn(&Account) -> bool) -> Vec<Entity> {
        self.characters
            .iter()
            .filter(|c| keep(&c.owner))
            .map(|c| c.entity.clone())
            .collect()
    }

    fn mint(&mut self, owner: &Account, type_character: u8) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let mut hasher = Sha256::new();
        hasher.update(owner.as_str().as_bytes());
        hasher.update(id.to_be_bytes());
        hasher.update(self.block.to_be_bytes());
        let dna = U256::from_be_slice(&hasher.finalize());
        self.characters.push(Owned {
            owner: owner.clone(),
            entity: Entity {
                id,
                dna,
                xp: 1,
                hp: 100,
                attack: 10,
                armor: 10,
                mana: 10,
                magic_resistance: 10,
                type_character,
            },
        });
        id
    }

    fn owned_by(&mut self, caller: &Account, id: u64) -> Option<&mut Entity> {
        self.characters
            .iter_mut()
            .find(|c| c.entity.id == id && &c.owner == caller)
            .map(|c| &mut c.entity)
    }

    fn charge(&mut self, required: U256, value: U256) -> std::result::Result<(), String> {
        if value < required {
            return Err(format!("attached {value} wei, {required} required"));
        }
        self.balance += value;
        Ok(())
    }

    fn apply(
        &mut self,
        caller: &Account,
        action: &Action,
        value: U256,
    ) -> std::result::Result<(), String> {
        match action {
            Action::Create(kind) => {
                self.charge(self.fees.create, value)?;
                let _ = self.mint(caller, kind.code());
            }
            Action::Heal { entity_id } => {
                if self.owned_by(caller, *entity_id).is_none() {
                    return Err(format!("character {entity_id} is not owned by {caller}"));
                }
                self.charge(self.fees.heal, value)?;
                if let Some(entity) = self.owned_by(caller, *entity_id) {
                    entity.hp = 100;
                }
            }
            Action::Fight { mine, rival } => {
                let Some(attacker) = self.owned_by(caller, *mine).cloned() else {
                    return Err(format!("character {mine} is not owned by {caller}"));
                };
                let Some(defender) = self
                    .characters
                    .iter()
                    .find(|c| c.entity.id == *rival && &c.owner != caller)
                    .map(|c| c.entity.clone())
                else {
                    return Err(format!("character {rival} is not a rival"));
                };
                self.charge(self.fees.fight, value)?;
                let attacker_wins =
                    attacker.attack + attacker.xp >= defender.armor + defender.xp;
                let (winner, loser) = if attacker_wins {
                    (attacker.id, defender.id)
                } else {
                    (defender.id, attacker.id)
                };
                for c in &mut self.characters {
                    if c.entity.id == winner {
                        c.entity.xp += 5;
                    } else if c.entity.id == loser {
                        c.entity.hp = c.entity.hp.saturating_sub(10);
                    }
                }
            }
            Action::Withdraw => {
                if caller != &self.program_owner {
                    return Err(format!("{caller} is not the program owner"));
                }
                self.balance = U256::ZERO;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<LedgerState>,
    blocks: broadcast::Sender<BlockNotice>,
    wallet: broadcast::Sender<WalletEvent>,
    reads: Gate,
    writes: Gate,
    read_calls: AtomicU64,
    write_calls: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct LocalLedger {
    inner: Arc<Inner>,
}

impl Default for LocalLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLedger {
    /// Four seeded accounts; the first one is current and owns the program.
    pub fn new() -> Self {
        let accounts: Vec<Account> = SEEDED_ACCOUNTS.iter().map(Account::new).collect();
        let owner = accounts[0].clone();
        Self::with_accounts(accounts, owner)
    }

    pub fn with_accounts(accounts: Vec<Account>, program_owner: Account) -> Self {
        let (blocks, _) = broadcast::channel(NOTICE_BUFFER);
        let (wallet, _) = broadcast::channel(NOTICE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LedgerState {
                    accounts,
                    network_id: DEVNET_NETWORK_ID,
                    program_owner,
                    characters: Vec::new(),
                    next_id: 0,
                    block: 0,
                    balance: U256::ZERO,
                    fees: FeeSchedule::default(),
                    provider_available: true,
                    connection_rejected: false,
                    fail_reads: false,
                    reject_writes: None,
                }),
                blocks,
                wallet,
                reads: Gate::new(),
                writes: Gate::new(),
                read_calls: AtomicU64::new(0),
                write_calls: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory that places the program on every supported network.
    pub fn directory(&self) -> ProgramDirectory {
        ProgramDirectory::new()
            .with_address(DEVNET_NETWORK_ID, DEVNET_PROGRAM_ADDRESS)
            .with_address(42, DEVNET_PROGRAM_ADDRESS)
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.lock().accounts.clone()
    }

    pub fn owner_account(&self) -> Account {
        self.lock().program_owner.clone()
    }

    pub fn block_height(&self) -> u64 {
        self.lock().block
    }

    pub fn balance(&self) -> U256 {
        self.lock().balance
    }

    pub fn entities_of(&self, account: &Account) -> Vec<Entity> {
        self.lock().entities(|owner| owner == account)
    }

    pub fn subscribe_blocks(&self) -> broadcast::Receiver<BlockNotice> {
        self.inner.blocks.subscribe()
    }

    pub fn mine_block(&self) -> u64 {
        let number = {
            let mut state = self.lock();
            state.block += 1;
            state.block
        };
        let _ = self.inner.blocks.send(BlockNotice { number });
        number
    }

    pub fn seed_entity(&self, owner: &Account, type_character: u8) -> u64 {
        self.lock().mint(owner, type_character)
    }

    pub fn set_xp(&self, entity_id: u64, xp: u64) {
        let mut state = self.lock();
        if let Some(c) = state.characters.iter_mut().find(|c| c.entity.id == entity_id) {
            c.entity.xp = xp;
        }
    }

    /// Moves the account at `index` to the front and notifies listeners.
    pub fn switch_account(&self, index: usize) -> Option<Account> {
        let accounts = {
            let mut state = self.lock();
            if index >= state.accounts.len() {
                return None;
            }
            let chosen = state.accounts.remove(index);
            state.accounts.insert(0, chosen);
            state.accounts.clone()
        };
        info!(account = %accounts[0], "devnet account switched");
        let current = accounts[0].clone();
        let _ = self.inner.wallet.send(WalletEvent::AccountsChanged(accounts));
        Some(current)
    }

    pub fn set_accounts(&self, accounts: Vec<Account>) {
        self.lock().accounts = accounts.clone();
        let _ = self.inner.wallet.send(WalletEvent::AccountsChanged(accounts));
    }

    pub fn switch_network(&self, network_id: u64) {
        self.lock().network_id = network_id;
        info!(network_id, "devnet network switched");
        let _ = self.inner.wallet.send(WalletEvent::NetworkChanged(network_id));
    }

    pub fn set_fees(&self, fees: FeeSchedule) {
        self.lock().fees = fees;
    }

    pub fn set_provider_available(&self, available: bool) {
        self.lock().provider_available = available;
    }

    pub fn set_connection_rejected(&self, rejected: bool) {
        self.lock().connection_rejected = rejected;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn reject_writes(&self, reason: Option<&str>) {
        self.lock().reject_writes = reason.map(str::to_string);
    }

    pub fn pause_reads(&self) {
        self.inner.reads.set_open(false);
    }

    pub fn resume_reads(&self) {
        self.inner.reads.set_open(true);
    }

    pub async fn wait_for_blocked_reads(&self, count: usize) {
        self.inner.reads.wait_for_waiting(count).await;
    }

    pub fn hold_writes(&self) {
        self.inner.writes.set_open(false);
    }

    pub fn release_writes(&self) {
        self.inner.writes.set_open(true);
    }

    pub async fn wait_for_held_writes(&self, count: usize) {
        self.inner.writes.wait_for_waiting(count).await;
    }

    pub fn read_calls(&self) -> u64 {
        self.inner.read_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> u64 {
        self.inner.write_calls.load(Ordering::SeqCst)
    }

    async fn read<T>(
        &self,
        call: &'static str,
        view: impl FnOnce(&LedgerState) -> T + Send,
    ) -> Result<T> {
        self.inner.read_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.reads.pass().await;
        let state = self.lock();
        if state.fail_reads {
            return Err(ClientError::remote(call, "injected read failure"));
        }
        Ok(view(&state))
    }
}

impl WalletProvider for LocalLedger {
    type Program = LocalProgram;

    async fn request_accounts(&self) -> Result<Vec<Account>> {
        let state = self.lock();
        if !state.provider_available {
            return Err(ClientError::ProviderUnavailable);
        }
        if state.connection_rejected {
            return Err(ClientError::ConnectionRejected);
        }
        Ok(state.accounts.clone())
    }

    async fn network_id(&self) -> Result<u64> {
        let state = self.lock();
        if !state.provider_available {
            return Err(ClientError::ProviderUnavailable);
        }
        Ok(state.network_id)
    }

    fn wallet_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.inner.wallet.subscribe()
    }

    fn new_blocks(&self) -> broadcast::Receiver<BlockNotice> {
        self.subscribe_blocks()
    }

    fn attach(&self, program_address: &str) -> Result<LocalProgram> {
        if !program_address.eq_ignore_ascii_case(DEVNET_PROGRAM_ADDRESS) {
            return Err(ClientError::remote(
                "attach",
                format!("no program deployed at {program_address}"),
            ));
        }
        Ok(LocalProgram {
            ledger: self.clone(),
        })
    }
}

/// The program side of [`LocalLedger`].
#[derive(Clone, Debug)]
pub struct LocalProgram {
    ledger: LocalLedger,
}

impl LedgerProgram for LocalProgram {
    async fn owner(&self) -> Result<Account> {
        self.ledger
            .read(ledger_abi::OWNER, |s| s.program_owner.clone())
            .await
    }

    async fn my_entities(&self, caller: &Account) -> Result<Vec<Entity>> {
        self.ledger
            .read(ledger_abi::GET_MY_CHARACTERS, |s| {
                s.entities(|owner| owner == caller)
            })
            .await
    }

    async fn others_entities(&self, caller: &Account) -> Result<Vec<Entity>> {
        self.ledger
            .read(ledger_abi::GET_OTHERS_CHARACTERS, |s| {
                s.entities(|owner| owner != caller)
            })
            .await
    }

    async fn all_entities(&self) -> Result<Vec<Entity>> {
        self.ledger
            .read(ledger_abi::GET_ALL_CHARACTERS, |s| s.entities(|_| true))
            .await
    }

    async fn submit(&self, caller: &Account, action: &Action, value: U256) -> Result<TxReceipt> {
        let inner = &self.ledger.inner;
        inner.write_calls.fetch_add(1, Ordering::SeqCst);
        inner.writes.pass().await;

        let block = {
            let mut state = self.ledger.lock();
            if let Some(reason) = state.reject_writes.clone() {
                return Err(ClientError::rejected(action.kind(), reason));
            }
            state
                .apply(caller, action, value)
                .map_err(|reason| ClientError::rejected(action.kind(), reason))?;
            state.block + 1
        };

        let mut hasher = Sha256::new();
        hasher.update(caller.as_str().as_bytes());
        hasher.update(action.program_call().encode());
        hasher.update(block.to_be_bytes());
        let tx_hash = format!("0x{}", hex::encode(hasher.finalize()));
        let mined = self.ledger.mine_block();
        debug!(%tx_hash, block = mined, kind = %action.kind(), "devnet transaction mined");
        Ok(TxReceipt {
            tx_hash,
            block_number: Some(mined),
        })
    }
}

impl LocalLedger {
    /// Creates a character for `owner` of the given type through the program,
    /// as a player would.
    pub async fn create_as(&self, owner: &Account, kind: TypeCharacter) -> Result<TxReceipt> {
        let fee = self.lock().fees.create;
        LocalProgram {
            ledger: self.clone(),
        }
        .submit(owner, &Action::Create(kind), fee)
        .await
    }
}
