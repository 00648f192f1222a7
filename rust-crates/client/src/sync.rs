//! Cached view of the ledger for one session generation.
//!
//! A worker task owns the cache and is the only writer. Block notices and
//! post-action requests reach it through a bounded command channel; requests
//! that pile up while a refresh is running are merged into one follow-up
//! refresh. Results are published through a `watch` channel shared by every
//! generation, and a result is only published while its generation is still
//! the current session epoch.

use ledger_abi::{
    Account,
    Entity,
};
use std::sync::{
    Arc,
    atomic::{
        AtomicU64,
        Ordering,
    },
};
use tokio::{
    sync::{
        broadcast,
        mpsc,
        watch,
    },
    task::JoinHandle,
};
use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    error::{
        ClientError,
        Result,
    },
    ledger::{
        BlockNotice,
        LedgerProgram,
    },
    program::ProgramHandle,
};

const COMMAND_BUFFER: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    #[default]
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

/// Which lists a refresh re-reads. `Full` covers `Mine`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefreshScope {
    Mine,
    Full,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncCache {
    pub mine: Vec<Entity>,
    pub others: Vec<Entity>,
    pub is_owner: bool,
}

impl SyncCache {
    pub fn owns(&self, entity_id: u64) -> Option<&Entity> {
        self.mine.iter().find(|e| e.id == entity_id)
    }

    pub fn rival(&self, entity_id: u64) -> Option<&Entity> {
        self.others.iter().find(|e| e.id == entity_id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub generation: u64,
    pub account: Option<Account>,
    pub state: SyncState,
    pub cache: SyncCache,
    pub last_error: Option<ClientError>,
    pub completed_refreshes: u64,
}

#[derive(Debug)]
enum SyncCommand {
    Refresh(RefreshScope),
    Shutdown,
}

/// Cloneable way to ask the worker of one generation for a refresh.
#[derive(Clone, Debug)]
pub struct SyncHandle {
    generation: u64,
    cmd_tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queues a refresh, waiting for buffer space if the worker is behind.
    pub async fn request_refresh(&self, scope: RefreshScope) {
        if self.cmd_tx.send(SyncCommand::Refresh(scope)).await.is_err() {
            debug!(generation = self.generation, "refresh requested after worker stopped");
        }
    }

    /// Non-blocking variant for block notices. Every notice of a generation
    /// carries the same scope, so a full buffer already holds a refresh that
    /// covers the dropped one.
    pub fn notify(&self, scope: RefreshScope) {
        match self.cmd_tx.try_send(SyncCommand::Refresh(scope)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(generation = self.generation, "refresh coalesced");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(generation = self.generation, "notice after worker stopped");
            }
        }
    }
}

pub struct StateSynchronizer {
    handle: SyncHandle,
    worker: JoinHandle<()>,
    listener: JoinHandle<()>,
}

impl StateSynchronizer {
    /// Starts the worker for `generation` and immediately requests the
    /// initial full fetch. Each block notice triggers a `block_scope` refresh.
    pub fn spawn<P: LedgerProgram>(
        program: ProgramHandle<P>,
        account: Account,
        generation: u64,
        epoch: Arc<AtomicU64>,
        snapshots: watch::Sender<SyncSnapshot>,
        blocks: broadcast::Receiver<BlockNotice>,
        block_scope: RefreshScope,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = SyncHandle {
            generation,
            cmd_tx,
        };
        let publisher = Publisher {
            generation,
            epoch,
            snapshots,
        };
        publisher.publish(SyncSnapshot {
            generation,
            account: Some(account.clone()),
            ..SyncSnapshot::default()
        });
        handle.notify(RefreshScope::Full);
        let worker = tokio::spawn(sync_worker(program, account, publisher, cmd_rx));
        let listener = tokio::spawn(block_listener(blocks, handle.clone(), block_scope));
        Self {
            handle,
            worker,
            listener,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Stops both tasks. Results of a refresh that is still running are
    /// never published.
    pub fn shutdown(self) {
        let _ = self.handle.cmd_tx.try_send(SyncCommand::Shutdown);
        self.listener.abort();
        self.worker.abort();
    }
}

struct Publisher {
    generation: u64,
    epoch: Arc<AtomicU64>,
    snapshots: watch::Sender<SyncSnapshot>,
}

impl Publisher {
    fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.generation
    }

    /// The epoch is checked under the channel's write lock so a rebuild
    /// cannot interleave between the check and the write.
    fn publish(&self, snapshot: SyncSnapshot) -> bool {
        self.snapshots.send_if_modified(|current| {
            if !self.is_current() {
                debug!(generation = self.generation, "discarding stale sync result");
                return false;
            }
            *current = snapshot;
            true
        })
    }
}

async fn block_listener(
    mut blocks: broadcast::Receiver<BlockNotice>,
    handle: SyncHandle,
    scope: RefreshScope,
) {
    loop {
        match blocks.recv().await {
            Ok(notice) => {
                debug!(block = notice.number, generation = handle.generation, "new block");
                handle.notify(scope);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "block notices lagged");
                handle.notify(scope);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn sync_worker<P: LedgerProgram>(
    program: ProgramHandle<P>,
    account: Account,
    publisher: Publisher,
    mut cmd_rx: mpsc::Receiver<SyncCommand>,
) {
    let mut cache = SyncCache::default();
    let mut completed_refreshes = 0;
    let mut last_error = None;
    let mut others_loaded = false;

    while let Some(cmd) = cmd_rx.recv().await {
        let mut scope = match cmd {
            SyncCommand::Refresh(scope) => scope,
            SyncCommand::Shutdown => break,
        };
        loop {
            if scope == RefreshScope::Mine && !others_loaded {
                debug!(generation = publisher.generation, "rivals never loaded; widening refresh");
                scope = RefreshScope::Full;
            }
            publisher.publish(SyncSnapshot {
                generation: publisher.generation,
                account: Some(account.clone()),
                state: SyncState::Loading,
                cache: cache.clone(),
                last_error: last_error.clone(),
                completed_refreshes,
            });

            let state = match fetch(&program, &account, scope, &cache).await {
                Ok(fresh) => {
                    others_loaded |= scope == RefreshScope::Full;
                    cache = fresh;
                    last_error = None;
                    SyncState::Ready
                }
                Err(err) => {
                    warn!(%err, %account, ?scope, "refresh failed; keeping last known view");
                    last_error = Some(err);
                    SyncState::Failed
                }
            };
            completed_refreshes += 1;
            publisher.publish(SyncSnapshot {
                generation: publisher.generation,
                account: Some(account.clone()),
                state,
                cache: cache.clone(),
                last_error: last_error.clone(),
                completed_refreshes,
            });

            let mut merged = 0;
            let mut next: Option<RefreshScope> = None;
            while let Ok(cmd) = cmd_rx.try_recv() {
                match cmd {
                    SyncCommand::Refresh(requested) => {
                        merged += 1;
                        next = Some(next.map_or(requested, |s| s.max(requested)));
                    }
                    SyncCommand::Shutdown => return,
                }
            }
            match next {
                Some(follow_up) => {
                    if merged > 1 {
                        debug!(merged, ?follow_up, "refresh requests coalesced");
                    }
                    scope = follow_up;
                }
                None => break,
            }
        }
    }
    info!(generation = publisher.generation, "sync worker stopped");
}

async fn fetch<P: LedgerProgram>(
    program: &ProgramHandle<P>,
    account: &Account,
    scope: RefreshScope,
    previous: &SyncCache,
) -> Result<SyncCache> {
    let (mine, others, owner) = match scope {
        RefreshScope::Mine => {
            let (mine, owner) =
                tokio::try_join!(program.my_entities(account), program.owner())?;
            (mine, previous.others.clone(), owner)
        }
        RefreshScope::Full => tokio::try_join!(
            program.my_entities(account),
            program.others_entities(account),
            program.owner()
        )?,
    };
    Ok(SyncCache {
        mine,
        others,
        is_owner: &owner == account,
    })
}
