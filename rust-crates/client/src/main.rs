use clap::Parser;
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use ledger_abi::Entity;
use nftg_client::{
    ActionKind,
    ActionOutcome,
    Session,
    config::{
        AppConfig,
        Args,
        Backend,
        Command,
    },
    console::{
        self,
        UserEvent,
    },
    devnet::LocalLedger,
    dispatch::Action,
    ledger::WalletProvider,
    program::ProgramDirectory,
    rpc::RpcProvider,
    session::SessionSettings,
    sync::SyncState,
};
use std::{
    path::Path,
    sync::{
        Arc,
        OnceLock,
    },
};
use tokio::{
    io::{
        AsyncBufReadExt,
        BufReader,
    },
    sync::mpsc,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Logs go to `logs/nftg-client.log` so they never interleave with the console.
fn init_tracing() {
    let appender = rolling::daily("logs", "nftg-client.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
}

enum TaskReport {
    Action(ActionKind, nftg_client::Result<ActionOutcome>),
    All(nftg_client::Result<Vec<Entity>>),
}

fn anyhow_to_eyre(error: anyhow::Error) -> color_eyre::eyre::Report {
    color_eyre::eyre::eyre!(Box::<dyn std::error::Error + Send + Sync>::from(error))
}

fn import_artifact(root: &Path, artifact: &str) -> Result<()> {
    let path = shellexpand::tilde(artifact).into_owned();
    deployments::ensure_structure(root).map_err(anyhow_to_eyre).wrap_err("preparing deployments directory")?;
    let imported = deployments::import_artifact(root, &path)
        .map_err(anyhow_to_eyre)
        .wrap_err_with(|| format!("importing {path}"))?;
    if imported.is_empty() {
        println!("{path} lists no deployment on a supported network");
    }
    for (env, record) in imported {
        println!("{env}: {}", record.program_address);
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing();
    let config = AppConfig::from(&args);

    if let Some(Command::ImportArtifact { path }) = &args.command {
        return import_artifact(&config.deployments_dir, path);
    }

    match &config.backend {
        Backend::Devnet => {
            let ledger = LocalLedger::new();
            let accounts = ledger.accounts();
            ledger.seed_entity(&accounts[1], 1);
            ledger.seed_entity(&accounts[2], 2);
            let directory = ledger.directory();
            run(
                Arc::new(ledger.clone()),
                directory,
                config.session,
                Some(ledger),
            )
            .await
        }
        Backend::Rpc { url, poll_interval } => {
            let expected_hash = config
                .artifact
                .as_ref()
                .map(deployments::artifact_bytecode_hash)
                .transpose()
                .map_err(anyhow_to_eyre)
                .wrap_err("reading program artifact")?
                .flatten();
            let directory =
                ProgramDirectory::from_deployments(&config.deployments_dir, expected_hash.as_deref())
                    .map_err(anyhow_to_eyre)
                    .wrap_err("loading deployment records")?;
            let provider = RpcProvider::start(url.clone(), *poll_interval, config.session.call_timeout)
                .map_err(anyhow_to_eyre)
                .wrap_err("starting JSON-RPC provider")?;
            run(Arc::new(provider), directory, config.session, None).await
        }
    }
}

fn print_session<W: WalletProvider>(session: &Session<W>) {
    match session.halt_notice() {
        Some(notice) => println!("{}", console::render_notice(notice)),
        None => println!(
            "{}",
            console::render_status(&session.status(), &session.snapshot(), session.selected_type())
        ),
    }
}

async fn run<W: WalletProvider>(
    provider: Arc<W>,
    directory: ProgramDirectory,
    settings: SessionSettings,
    devnet: Option<LocalLedger>,
) -> Result<()> {
    tracing::info!("starting session");
    let mut session = Session::start(provider, directory, settings).await;
    print_session(&session);
    println!("type `help` for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut snapshots = session.snapshots();
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let mut wallet_open = true;
    let mut show_mine_after: Option<u64> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.wrap_err("reading console input")? else {
                    break;
                };
                let event = match console::parse_command(&line) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(msg) => {
                        println!("{msg}");
                        continue;
                    }
                };
                if event.is_devnet_only() && devnet.is_none() {
                    println!("that command is only available with --devnet");
                    continue;
                }
                match event {
                    UserEvent::Quit => break,
                    UserEvent::Help => println!("{}", console::HELP),
                    UserEvent::Status => print_session(&session),
                    UserEvent::SelectType(kind) => {
                        session.select_type(kind);
                        println!("selected {kind}");
                    }
                    UserEvent::Create(kind) => {
                        let kind = kind.unwrap_or(session.selected_type());
                        spawn_action(&session, Action::Create(kind), &report_tx);
                    }
                    UserEvent::Heal(entity_id) => {
                        spawn_action(&session, Action::Heal { entity_id }, &report_tx);
                    }
                    UserEvent::Fight { mine, rival } => {
                        spawn_action(&session, Action::Fight { mine, rival }, &report_tx);
                    }
                    UserEvent::Withdraw => spawn_action(&session, Action::Withdraw, &report_tx),
                    UserEvent::ShowMine => match session.refresh_mine() {
                        Ok(()) => show_mine_after = Some(session.snapshot().completed_refreshes),
                        Err(err) => println!("{err}"),
                    },
                    UserEvent::ShowOthers => {
                        let snapshot = session.snapshot();
                        let busy = session.action_state().is_in_flight();
                        println!("{}", console::render_entities("others", &snapshot.cache.others, busy));
                    }
                    UserEvent::ShowAll => match session.program() {
                        Ok(program) => {
                            let tx = report_tx.clone();
                            tokio::spawn(async move {
                                let _ = tx.send(TaskReport::All(program.all_entities().await));
                            });
                        }
                        Err(err) => println!("{err}"),
                    },
                    UserEvent::MineBlock => {
                        if let Some(ledger) = &devnet {
                            println!("block {}", ledger.mine_block());
                        }
                    }
                    UserEvent::SwitchAccount(index) => {
                        if let Some(ledger) = &devnet
                            && ledger.switch_account(index).is_none()
                        {
                            println!("no account at index {index}");
                        }
                    }
                    UserEvent::SwitchNetwork(network_id) => {
                        if let Some(ledger) = &devnet {
                            ledger.switch_network(network_id);
                        }
                    }
                }
            }
            event = session.next_wallet_event(), if wallet_open => {
                match event {
                    Some(event) => {
                        session.handle_wallet_event(event).await;
                        show_mine_after = None;
                        print_session(&session);
                    }
                    None => {
                        tracing::warn!("wallet notifications closed");
                        wallet_open = false;
                    }
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if let Some(after) = show_mine_after
                    && snapshot.completed_refreshes > after
                    && snapshot.state != SyncState::Loading
                {
                    show_mine_after = None;
                    if let Some(err) = &snapshot.last_error {
                        println!("refresh failed, showing last known characters: {err}");
                    }
                    let busy = session.action_state().is_in_flight();
                    println!("{}", console::render_entities("mine", &snapshot.cache.mine, busy));
                }
            }
            Some(report) = report_rx.recv() => match report {
                TaskReport::Action(_, Ok(outcome)) => println!("{}", console::render_outcome(&outcome)),
                TaskReport::Action(kind, Err(err)) => println!("{kind} failed: {err}"),
                TaskReport::All(Ok(entities)) => {
                    let busy = session.action_state().is_in_flight();
                    println!("{}", console::render_entities("all", &entities, busy));
                }
                TaskReport::All(Err(err)) => println!("reading all characters failed: {err}"),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt, exiting");
                break;
            }
        }
    }

    session.shutdown();
    Ok(())
}

/// Runs the action in its own task so wallet and block events keep flowing
/// while the transaction is pending.
fn spawn_action<W: WalletProvider>(
    session: &Session<W>,
    action: Action,
    report_tx: &mpsc::UnboundedSender<TaskReport>,
) {
    let kind = action.kind();
    let dispatcher = match session.dispatcher() {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            println!("{kind} not sent: {err}");
            return;
        }
    };
    if let Some(in_flight) = session.action_state().in_flight() {
        println!("{kind} not sent: {in_flight} is still in flight");
        return;
    }
    println!("{kind} submitted");
    let tx = report_tx.clone();
    tokio::spawn(async move {
        let result = dispatcher.dispatch(action).await;
        let _ = tx.send(TaskReport::Action(kind, result));
    });
}
