use alloy_primitives::U256;
use clap::{
    Parser,
    Subcommand,
};
use std::{
    path::PathBuf,
    time::Duration,
};

use crate::{
    dispatch::FeeSchedule,
    rpc::DEFAULT_RPC_URL,
    session::SessionSettings,
    sync::RefreshScope,
};

#[derive(Parser, Debug)]
#[command(version, about = "Console client for the NFT game ledger program", long_about = None)]
pub struct Args {
    /// JSON-RPC endpoint of the wallet/node.
    #[arg(long, default_value = DEFAULT_RPC_URL)]
    pub rpc_url: String,

    /// Play against an in-process ledger instead of a node.
    #[arg(long)]
    pub devnet: bool,

    #[arg(long, default_value = deployments::DEPLOYMENTS_ROOT)]
    pub deployments_dir: String,

    /// Compiled program artifact; recorded deployments built from a
    /// different bytecode are reported at start-up.
    #[arg(long)]
    pub artifact: Option<String>,

    /// Value attached to createCharacter, in wei.
    #[arg(long, default_value = "1000000000000000")]
    pub create_fee: U256,

    #[arg(long, default_value = "100000000000000")]
    pub heal_fee: U256,

    #[arg(long, default_value = "100000000000000")]
    pub fight_fee: U256,

    #[arg(long, default_value_t = 30)]
    pub call_timeout_secs: u64,

    /// Re-read opponents' characters on every block, not just your own.
    #[arg(long)]
    pub refresh_others_on_block: bool,

    #[arg(long, default_value_t = 1000)]
    pub wallet_poll_ms: u64,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Record the program addresses listed in a compiled artifact.
    ImportArtifact { path: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    Devnet,
    Rpc { url: String, poll_interval: Duration },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub backend: Backend,
    pub deployments_dir: PathBuf,
    pub artifact: Option<PathBuf>,
    pub session: SessionSettings,
}

fn expand(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

impl From<&Args> for AppConfig {
    fn from(args: &Args) -> Self {
        let backend = if args.devnet {
            Backend::Devnet
        } else {
            Backend::Rpc {
                url: args.rpc_url.clone(),
                poll_interval: Duration::from_millis(args.wallet_poll_ms.max(1)),
            }
        };
        let block_scope = if args.refresh_others_on_block {
            RefreshScope::Full
        } else {
            RefreshScope::Mine
        };
        Self {
            backend,
            deployments_dir: expand(&args.deployments_dir),
            artifact: args.artifact.as_deref().map(expand),
            session: SessionSettings {
                call_timeout: Duration::from_secs(args.call_timeout_secs),
                fees: FeeSchedule {
                    create: args.create_fee,
                    heal: args.heal_fee,
                    fight: args.fight_fee,
                },
                block_scope,
            },
        }
    }
}
