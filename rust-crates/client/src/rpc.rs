//! Ethereum JSON-RPC adapter for the wallet and ledger-program seams.
//!
//! New blocks are observed through a block filter and account/network
//! changes by comparing successive `eth_accounts`/`net_version` answers;
//! both are polled on `poll_interval` by background tasks that live as long
//! as the provider.

use alloy_primitives::{
    Address,
    U256,
};
use anyhow::Context;
use ledger_abi::{
    Account,
    Entity,
    ProgramCall,
    decode_entities,
    decode_owner,
    parse_address,
};
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};
use serde_json::{
    Value,
    json,
};
use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time,
};
use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    dispatch::{
        Action,
        ActionKind,
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
};

pub const DEFAULT_RPC_URL: &str = "http://localhost:8545";

/// EIP-1193 "user rejected the request".
const USER_REJECTED: i64 = 4001;
const METHOD_NOT_FOUND: i64 = -32601;
const NOTICE_BUFFER: usize = 64;

#[derive(Debug)]
enum RpcFailure {
    Transport(String),
    Rpc { code: i64, message: String },
    Decode(String),
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcFailure::Transport(reason) => write!(f, "transport error: {reason}"),
            RpcFailure::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
            RpcFailure::Decode(reason) => write!(f, "invalid response: {reason}"),
        }
    }
}

/// Failures while talking to the wallet itself, before any program call.
fn handshake_error(failure: RpcFailure) -> ClientError {
    match failure {
        RpcFailure::Rpc {
            code: USER_REJECTED,
            ..
        } => ClientError::ConnectionRejected,
        other => {
            warn!(%other, "wallet handshake failed");
            ClientError::ProviderUnavailable
        }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReceiptDto {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "blockNumber")]
    block_number: Option<String>,
}

#[derive(Clone, Debug)]
struct RpcClient {
    url: String,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    fn new(url: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client for JSON-RPC")?;
        Ok(Self {
            url: url.into(),
            http,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<T, RpcFailure> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let res = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            return Err(RpcFailure::Transport(format!(
                "node responded with {status} to {method}"
            )));
        }
        let response: RpcResponse = res
            .json()
            .await
            .map_err(|e| RpcFailure::Decode(e.to_string()))?;
        if let Some(err) = response.error {
            return Err(RpcFailure::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| RpcFailure::Decode(e.to_string()))
    }

    async fn accounts(&self) -> std::result::Result<Vec<Account>, RpcFailure> {
        let raw: Vec<String> = self.request("eth_accounts", json!([])).await?;
        Ok(raw.iter().map(Account::new).collect())
    }

    async fn network_id(&self) -> std::result::Result<u64, RpcFailure> {
        let raw: String = self.request("net_version", json!([])).await?;
        parse_network_id(&raw).map_err(RpcFailure::Decode)
    }

    async fn block_number(&self) -> std::result::Result<u64, RpcFailure> {
        let raw: String = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&raw).map_err(RpcFailure::Decode)
    }
}

fn parse_quantity(raw: &str) -> std::result::Result<u64, String> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16).map_err(|e| format!("{raw:?} is not a hex quantity: {e}"))
}

/// `net_version` answers in decimal; some wallets answer in hex.
fn parse_network_id(raw: &str) -> std::result::Result<u64, String> {
    if raw.starts_with("0x") {
        return parse_quantity(raw);
    }
    raw.parse()
        .map_err(|e| format!("{raw:?} is not a network id: {e}"))
}

/// Records one `eth_getFilterChanges` answer and returns how many new blocks
/// it reported. A failed poll means the node dropped the filter, so it is
/// forgotten and reinstalled on the next tick.
fn observe_filter_changes(
    filter: &mut Option<String>,
    polled: std::result::Result<Vec<String>, RpcFailure>,
) -> usize {
    match polled {
        Ok(hashes) => hashes.len(),
        Err(err) => {
            warn!(%err, "block filter lost; reinstalling");
            *filter = None;
            0
        }
    }
}

/// Last wallet answers seen by the watcher. The first answer only primes it.
#[derive(Debug, Default)]
struct WalletWatch {
    accounts: Option<Vec<Account>>,
    network_id: Option<u64>,
}

impl WalletWatch {
    fn observe_accounts(&mut self, accounts: Vec<Account>) -> Option<WalletEvent> {
        let changed = self.accounts.as_ref().is_some_and(|prev| prev != &accounts);
        self.accounts = Some(accounts.clone());
        changed.then_some(WalletEvent::AccountsChanged(accounts))
    }

    fn observe_network(&mut self, network_id: u64) -> Option<WalletEvent> {
        let changed = self.network_id.is_some_and(|prev| prev != network_id);
        self.network_id = Some(network_id);
        changed.then_some(WalletEvent::NetworkChanged(network_id))
    }
}

fn settle_receipt(kind: ActionKind, tx_hash: String, receipt: ReceiptDto) -> Result<TxReceipt> {
    if receipt.status.as_deref() == Some("0x0") {
        return Err(ClientError::rejected(kind, "transaction reverted"));
    }
    let block_number = receipt
        .block_number
        .as_deref()
        .and_then(|raw| parse_quantity(raw).ok());
    Ok(TxReceipt {
        tx_hash,
        block_number,
    })
}

fn decode_hex_data(raw: &str) -> std::result::Result<Vec<u8>, String> {
    hex::decode(raw.strip_prefix("0x").unwrap_or(raw)).map_err(|e| e.to_string())
}

pub struct RpcProvider {
    client: RpcClient,
    poll_interval: Duration,
    wallet_tx: broadcast::Sender<WalletEvent>,
    blocks_tx: broadcast::Sender<BlockNotice>,
    tasks: Vec<JoinHandle<()>>,
}

impl RpcProvider {
    /// Connects lazily: nothing is sent until the session asks for accounts.
    /// Must be called inside a tokio runtime; the watcher tasks start here.
    /// Every HTTP request, including the watchers' polls, gives up after
    /// `request_timeout`.
    pub fn start(
        url: impl Into<String>,
        poll_interval: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = RpcClient::new(url, request_timeout)?;
        let (wallet_tx, _) = broadcast::channel(NOTICE_BUFFER);
        let (blocks_tx, _) = broadcast::channel(NOTICE_BUFFER);
        let tasks = vec![
            tokio::spawn(block_filter_task(
                client.clone(),
                poll_interval,
                blocks_tx.clone(),
            )),
            tokio::spawn(wallet_watch_task(
                client.clone(),
                poll_interval,
                wallet_tx.clone(),
            )),
        ];
        info!(url = %client.url, ?poll_interval, "json-rpc provider started");
        Ok(Self {
            client,
            poll_interval,
            wallet_tx,
            blocks_tx,
            tasks,
        })
    }
}

impl Drop for RpcProvider {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl WalletProvider for RpcProvider {
    type Program = RpcProgram;

    async fn request_accounts(&self) -> Result<Vec<Account>> {
        let requested: std::result::Result<Vec<String>, _> =
            self.client.request("eth_requestAccounts", json!([])).await;
        match requested {
            Ok(raw) => Ok(raw.iter().map(Account::new).collect()),
            Err(RpcFailure::Rpc {
                code: METHOD_NOT_FOUND,
                ..
            }) => {
                debug!("eth_requestAccounts unsupported; falling back to eth_accounts");
                self.client.accounts().await.map_err(handshake_error)
            }
            Err(failure) => Err(handshake_error(failure)),
        }
    }

    async fn network_id(&self) -> Result<u64> {
        self.client.network_id().await.map_err(handshake_error)
    }

    fn wallet_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.wallet_tx.subscribe()
    }

    fn new_blocks(&self) -> broadcast::Receiver<BlockNotice> {
        self.blocks_tx.subscribe()
    }

    fn attach(&self, program_address: &str) -> Result<RpcProgram> {
        let address = Address::from_str(program_address).map_err(|e| {
            ClientError::remote("attach", format!("{program_address}: {e}"))
        })?;
        Ok(RpcProgram {
            client: self.client.clone(),
            address,
            receipt_poll: self.poll_interval,
        })
    }
}

async fn block_filter_task(
    client: RpcClient,
    poll_interval: Duration,
    blocks_tx: broadcast::Sender<BlockNotice>,
) {
    let mut ticker = time::interval(poll_interval);
    let mut filter: Option<String> = None;
    loop {
        ticker.tick().await;
        let id = match &filter {
            Some(id) => id.clone(),
            None => match client.request::<String>("eth_newBlockFilter", json!([])).await {
                Ok(id) => {
                    debug!(%id, "block filter installed");
                    filter = Some(id.clone());
                    id
                }
                Err(err) => {
                    debug!(%err, "block filter unavailable");
                    continue;
                }
            },
        };
        let polled = client
            .request::<Vec<String>>("eth_getFilterChanges", json!([id]))
            .await;
        let new_blocks = observe_filter_changes(&mut filter, polled);
        if new_blocks == 0 {
            continue;
        }
        let number = match client.block_number().await {
            Ok(number) => number,
            Err(err) => {
                debug!(%err, "block number lookup failed");
                0
            }
        };
        for _ in 0..new_blocks {
            let _ = blocks_tx.send(BlockNotice { number });
        }
    }
}

async fn wallet_watch_task(
    client: RpcClient,
    poll_interval: Duration,
    wallet_tx: broadcast::Sender<WalletEvent>,
) {
    let mut ticker = time::interval(poll_interval);
    let mut watch = WalletWatch::default();
    loop {
        ticker.tick().await;
        match client.accounts().await {
            Ok(accounts) => {
                if let Some(event) = watch.observe_accounts(accounts) {
                    let _ = wallet_tx.send(event);
                }
            }
            Err(err) => debug!(%err, "account poll failed"),
        }
        match client.network_id().await {
            Ok(network_id) => {
                if let Some(event) = watch.observe_network(network_id) {
                    let _ = wallet_tx.send(event);
                }
            }
            Err(err) => debug!(%err, "network poll failed"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RpcProgram {
    client: RpcClient,
    address: Address,
    receipt_poll: Duration,
}

impl RpcProgram {
    async fn call(&self, caller: Option<&Account>, call: ProgramCall) -> Result<Vec<u8>> {
        let signature = call.signature();
        let mut tx = json!({
            "to": format!("{:#x}", self.address),
            "data": format!("0x{}", hex::encode(call.encode())),
        });
        if let Some(caller) = caller {
            tx["from"] = json!(caller.as_str());
        }
        let raw: String = self
            .client
            .request("eth_call", json!([tx, "latest"]))
            .await
            .map_err(|e| ClientError::remote(signature, e))?;
        decode_hex_data(&raw).map_err(|e| ClientError::remote(signature, e))
    }

    async fn entities(&self, caller: Option<&Account>, call: ProgramCall) -> Result<Vec<Entity>> {
        let signature = call.signature();
        let data = self.call(caller, call).await?;
        decode_entities(&data).map_err(|e| ClientError::remote(signature, e))
    }
}

impl LedgerProgram for RpcProgram {
    async fn owner(&self) -> Result<Account> {
        let data = self.call(None, ProgramCall::Owner).await?;
        decode_owner(&data).map_err(|e| ClientError::remote(ledger_abi::OWNER, e))
    }

    async fn my_entities(&self, caller: &Account) -> Result<Vec<Entity>> {
        self.entities(Some(caller), ProgramCall::GetMyCharacters)
            .await
    }

    async fn others_entities(&self, caller: &Account) -> Result<Vec<Entity>> {
        self.entities(Some(caller), ProgramCall::GetOthersCharacters)
            .await
    }

    async fn all_entities(&self) -> Result<Vec<Entity>> {
        self.entities(None, ProgramCall::GetAllCharacters).await
    }

    async fn submit(&self, caller: &Account, action: &Action, value: U256) -> Result<TxReceipt> {
        let kind = action.kind();
        let from = parse_address(caller).map_err(|e| ClientError::rejected(kind, e))?;
        let tx = json!({
            "from": format!("{from:#x}"),
            "to": format!("{:#x}", self.address),
            "data": format!("0x{}", hex::encode(action.program_call().encode())),
            "value": format!("{value:#x}"),
        });
        let tx_hash: String = self
            .client
            .request("eth_sendTransaction", json!([tx]))
            .await
            .map_err(|e| ClientError::rejected(kind, e))?;
        debug!(%tx_hash, %kind, "transaction sent");

        let mut ticker = time::interval(self.receipt_poll);
        loop {
            ticker.tick().await;
            let receipt: Option<ReceiptDto> = match self
                .client
                .request("eth_getTransactionReceipt", json!([tx_hash]))
                .await
            {
                Ok(receipt) => receipt,
                Err(err) => {
                    debug!(%err, %tx_hash, "receipt poll failed");
                    continue;
                }
            };
            if let Some(receipt) = receipt {
                return settle_receipt(kind, tx_hash, receipt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use ledger_abi::{
        TypeCharacter,
        test_helpers::{
            encode_entities,
            entity_with_xp,
            new_entity,
        },
    };

    #[test]
    fn parse_network_id__decimal_and_hex__both_accepted() {
        assert_eq!(parse_network_id("1337"), Ok(1337));
        assert_eq!(parse_network_id("0x2a"), Ok(42));
        assert!(parse_network_id("kovan").is_err());
    }

    #[test]
    fn handshake_error__user_rejection__maps_to_connection_rejected() {
        let failure = RpcFailure::Rpc {
            code: USER_REJECTED,
            message: "User rejected the request.".to_string(),
        };
        assert_eq!(handshake_error(failure), ClientError::ConnectionRejected);
    }

    #[test]
    fn handshake_error__unreachable_node__maps_to_provider_unavailable() {
        let failure = RpcFailure::Transport("connection refused".to_string());
        assert_eq!(handshake_error(failure), ClientError::ProviderUnavailable);
    }

    #[test]
    fn decode_hex_data__prefixed__strips_prefix() {
        assert_eq!(decode_hex_data("0x0a0b"), Ok(vec![0x0a, 0x0b]));
    }

    #[test]
    fn receipt__reverted_status__deserializes() {
        let receipt: Option<ReceiptDto> =
            serde_json::from_value(json!({"status": "0x0", "blockNumber": "0x10"})).unwrap();
        let receipt = receipt.unwrap();
        assert_eq!(receipt.status.as_deref(), Some("0x0"));
        assert_eq!(parse_quantity(receipt.block_number.as_deref().unwrap()), Ok(16));
    }

    #[test]
    fn eth_call_result__encoded_characters__decode_through_hex_envelope() {
        // given
        let expected = vec![
            new_entity(4, TypeCharacter::Elementary),
            entity_with_xp(5, 120),
        ];
        let raw = format!("0x{}", hex::encode(encode_entities(&expected)));

        // when
        let data = decode_hex_data(&raw).unwrap();
        let decoded = decode_entities(&data).unwrap();

        // then
        assert_eq!(decoded, expected);
    }

    #[test]
    fn settle_receipt__reverted__is_action_rejected() {
        // given
        let receipt = ReceiptDto {
            status: Some("0x0".to_string()),
            block_number: Some("0x10".to_string()),
        };

        // when
        let result = settle_receipt(ActionKind::Fight, "0xabc".to_string(), receipt);

        // then
        assert!(matches!(
            result,
            Err(ClientError::ActionRejected {
                action: ActionKind::Fight,
                ..
            })
        ));
    }

    #[test]
    fn settle_receipt__succeeded__carries_block_number() {
        // given
        let receipt = ReceiptDto {
            status: Some("0x1".to_string()),
            block_number: Some("0x10".to_string()),
        };

        // when
        let result = settle_receipt(ActionKind::Create, "0xabc".to_string(), receipt);

        // then
        assert_eq!(
            result,
            Ok(TxReceipt {
                tx_hash: "0xabc".to_string(),
                block_number: Some(16),
            })
        );
    }

    #[test]
    fn observe_filter_changes__new_hashes__counts_one_notice_per_block() {
        // given
        let mut filter = Some("0x1".to_string());
        let polled = Ok(vec!["0xaa".to_string(), "0xbb".to_string()]);

        // when
        let new_blocks = observe_filter_changes(&mut filter, polled);

        // then
        assert_eq!(new_blocks, 2);
        assert_eq!(filter.as_deref(), Some("0x1"));
    }

    #[test]
    fn observe_filter_changes__filter_not_found__forgets_filter_for_reinstall() {
        // given
        let mut filter = Some("0x1".to_string());
        let polled = Err(RpcFailure::Rpc {
            code: -32000,
            message: "filter not found".to_string(),
        });

        // when
        let new_blocks = observe_filter_changes(&mut filter, polled);

        // then
        assert_eq!(new_blocks, 0);
        assert!(filter.is_none());
    }

    #[test]
    fn wallet_watch__first_answer__only_primes() {
        let mut watch = WalletWatch::default();
        assert_eq!(watch.observe_accounts(vec![Account::new("0xaaa")]), None);
        assert_eq!(watch.observe_network(42), None);
    }

    #[test]
    fn wallet_watch__account_switched__emits_accounts_changed() {
        // given
        let mut watch = WalletWatch::default();
        watch.observe_accounts(vec![Account::new("0xaaa")]);

        // when
        let unchanged = watch.observe_accounts(vec![Account::new("0xaaa")]);
        let switched = watch.observe_accounts(vec![Account::new("0xbbb")]);

        // then
        assert_eq!(unchanged, None);
        assert_eq!(
            switched,
            Some(WalletEvent::AccountsChanged(vec![Account::new("0xbbb")]))
        );
    }

    #[test]
    fn wallet_watch__network_switched__emits_network_changed() {
        // given
        let mut watch = WalletWatch::default();
        watch.observe_network(1337);

        // when
        let event = watch.observe_network(42);

        // then
        assert_eq!(event, Some(WalletEvent::NetworkChanged(42)));
        assert_eq!(watch.observe_network(42), None);
    }

    #[test]
    fn receipt__null__is_pending() {
        let receipt: Option<ReceiptDto> = serde_json::from_value(Value::Null).unwrap();
        assert!(receipt.is_none());
    }
}
