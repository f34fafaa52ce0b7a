use anyhow::{anyhow, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use mintwatch_config::StreamConfig;
use mintwatch_core_types::{RawTransaction, TokenBalanceEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Interval};
use tonic::transport::ClientTlsConfig;
use tracing::{debug, info, warn};
use yellowstone_grpc_client::GeyserGrpcClient;
use yellowstone_grpc_proto::prelude::{
    subscribe_update, CommitmentLevel, Message as SolMessage, SubscribeRequest,
    SubscribeRequestFilterTransactions, SubscribeRequestPing, SubscribeUpdateTransactionInfo,
    TransactionStatusMeta,
};

const STREAM_IDLE_TIMEOUT_SECS: u64 = 45;
const SOURCE_QUEUE_CAPACITY: usize = 2_048;

/// Upstream transaction feed for the ingest role. The gRPC variant owns a
/// background stream task with reconnect/backoff; the mock variant emits a
/// synthetic buy per interval for dev and tests.
pub enum TxSource {
    Mock(MockSource),
    Grpc(GrpcSource),
}

impl TxSource {
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        match config.source.to_lowercase().as_str() {
            "mock" => Ok(Self::Mock(MockSource::new(config.mock_interval_ms))),
            "grpc" | "yellowstone" => Ok(Self::Grpc(GrpcSource::new(config)?)),
            other => Err(anyhow!("unknown stream.source: {other}")),
        }
    }

    pub async fn next_transaction(&mut self) -> Result<Option<RawTransaction>> {
        match self {
            Self::Mock(source) => source.next_transaction().await,
            Self::Grpc(source) => source.next_transaction().await,
        }
    }
}

pub struct MockSource {
    interval: Interval,
    sequence: u64,
    session_tag: String,
}

impl MockSource {
    pub fn new(interval_ms: u64) -> Self {
        let session_tag = format!("{}-{}", Utc::now().timestamp_millis(), std::process::id());
        Self {
            interval: time::interval(Duration::from_millis(interval_ms.max(100))),
            sequence: 0,
            session_tag,
        }
    }

    async fn next_transaction(&mut self) -> Result<Option<RawTransaction>> {
        self.interval.tick().await;
        self.sequence = self.sequence.saturating_add(1);
        let n = self.sequence;
        let wallet = format!("MockWallet{}", n % 7);

        Ok(Some(RawTransaction {
            signature: format!("mock-{}-sig-{n}", self.session_tag),
            slot: 1_000_000 + n,
            ingest_time: Utc::now(),
            block_time: None,
            fee: 5_000,
            account_keys: vec![wallet.clone(), "MockPoolAccount".to_string()],
            pre_token_balances: vec![TokenBalanceEntry {
                owner: wallet.clone(),
                mint: format!("MockMint{}", n % 3),
                raw_amount: 0,
                decimals: 6,
            }],
            post_token_balances: vec![TokenBalanceEntry {
                owner: wallet,
                mint: format!("MockMint{}", n % 3),
                raw_amount: 100_000_000,
                decimals: 6,
            }],
            pre_lamports: vec![1_000_000_000, 0],
            post_lamports: vec![499_995_000, 500_000_000],
            program_ids_touched: vec!["6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P".to_string()],
        }))
    }
}

struct GrpcRuntimeConfig {
    endpoint: String,
    token: String,
    connect_timeout_ms: u64,
    subscribe_timeout_ms: u64,
    reconnect_initial_ms: u64,
    reconnect_max_ms: u64,
    program_ids: Vec<String>,
}

pub struct GrpcSource {
    runtime_config: Arc<GrpcRuntimeConfig>,
    rx: Option<mpsc::Receiver<RawTransaction>>,
    stream_task: Option<JoinHandle<()>>,
}

impl GrpcSource {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let endpoint = config.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(anyhow!(
                "stream.endpoint must be an explicit http(s):// gRPC endpoint"
            ));
        }
        if config.token.trim().is_empty() {
            return Err(anyhow!("stream.token is required for the gRPC subscription"));
        }
        if config.program_ids.is_empty() {
            return Err(anyhow!("stream.program_ids must name at least one venue"));
        }

        Ok(Self {
            runtime_config: Arc::new(GrpcRuntimeConfig {
                endpoint: endpoint.to_string(),
                token: config.token.trim().to_string(),
                connect_timeout_ms: config.connect_timeout_ms.max(500),
                subscribe_timeout_ms: config.subscribe_timeout_ms.max(1_000),
                reconnect_initial_ms: config.reconnect_initial_ms.max(200),
                reconnect_max_ms: config
                    .reconnect_max_ms
                    .max(config.reconnect_initial_ms.max(200)),
                program_ids: config.program_ids.clone(),
            }),
            rx: None,
            stream_task: None,
        })
    }

    async fn next_transaction(&mut self) -> Result<Option<RawTransaction>> {
        loop {
            self.ensure_stream_running();
            let rx = self.rx.as_mut().ok_or_else(|| anyhow!("stream queue missing"))?;
            match rx.recv().await {
                Some(tx) => return Ok(Some(tx)),
                None => {
                    warn!("grpc stream queue closed; restarting stream task");
                    self.rx = None;
                    self.stream_task = None;
                }
            }
        }
    }

    fn ensure_stream_running(&mut self) {
        let needs_restart = self
            .stream_task
            .as_ref()
            .map(|task| task.is_finished())
            .unwrap_or(true);
        if !needs_restart {
            return;
        }
        let (tx, rx) = mpsc::channel(SOURCE_QUEUE_CAPACITY);
        let runtime_config = Arc::clone(&self.runtime_config);
        self.rx = Some(rx);
        self.stream_task = Some(tokio::spawn(async move {
            grpc_stream_loop(runtime_config, tx).await;
        }));
    }
}

fn build_subscribe_request(runtime_config: &GrpcRuntimeConfig) -> SubscribeRequest {
    let mut transactions = HashMap::new();
    transactions.insert(
        "mintwatch-tx".to_string(),
        SubscribeRequestFilterTransactions {
            vote: Some(false),
            failed: Some(false),
            signature: None,
            account_include: runtime_config.program_ids.clone(),
            account_exclude: Vec::new(),
            account_required: Vec::new(),
        },
    );

    SubscribeRequest {
        accounts: HashMap::new(),
        slots: HashMap::new(),
        transactions,
        transactions_status: HashMap::new(),
        blocks: HashMap::new(),
        blocks_meta: HashMap::new(),
        entry: HashMap::new(),
        commitment: Some(CommitmentLevel::Confirmed as i32),
        accounts_data_slice: Vec::new(),
        ping: None,
        from_slot: None,
    }
}

async fn grpc_stream_loop(
    runtime_config: Arc<GrpcRuntimeConfig>,
    out_tx: mpsc::Sender<RawTransaction>,
) {
    let mut next_backoff_ms = runtime_config.reconnect_initial_ms;

    loop {
        let subscribe_request = build_subscribe_request(runtime_config.as_ref());
        let builder = match GeyserGrpcClient::build_from_shared(runtime_config.endpoint.clone()) {
            Ok(builder) => builder,
            Err(error) => {
                warn!(error = %error, "invalid stream endpoint");
                sleep_with_backoff(
                    &mut next_backoff_ms,
                    runtime_config.reconnect_initial_ms,
                    runtime_config.reconnect_max_ms,
                )
                .await;
                continue;
            }
        };
        let builder = match builder.x_token(Some(runtime_config.token.as_str())) {
            Ok(builder) => builder,
            Err(error) => {
                warn!(error = %error, "invalid stream auth token metadata");
                sleep_with_backoff(
                    &mut next_backoff_ms,
                    runtime_config.reconnect_initial_ms,
                    runtime_config.reconnect_max_ms,
                )
                .await;
                continue;
            }
        };
        let builder = if runtime_config.endpoint.starts_with("https://") {
            match builder.tls_config(ClientTlsConfig::new().with_native_roots()) {
                Ok(builder) => builder,
                Err(error) => {
                    warn!(error = ?error, "invalid stream TLS config");
                    sleep_with_backoff(
                        &mut next_backoff_ms,
                        runtime_config.reconnect_initial_ms,
                        runtime_config.reconnect_max_ms,
                    )
                    .await;
                    continue;
                }
            }
        } else {
            builder
        };

        let mut client = match builder
            .connect_timeout(Duration::from_millis(runtime_config.connect_timeout_ms))
            .timeout(Duration::from_millis(runtime_config.subscribe_timeout_ms))
            .http2_adaptive_window(true)
            .tcp_nodelay(true)
            .connect()
            .await
        {
            Ok(client) => client,
            Err(error) => {
                warn!(error = ?error, "failed connecting stream endpoint");
                sleep_with_backoff(
                    &mut next_backoff_ms,
                    runtime_config.reconnect_initial_ms,
                    runtime_config.reconnect_max_ms,
                )
                .await;
                continue;
            }
        };

        let (mut subscribe_tx, mut stream) = match client.subscribe().await {
            Ok(parts) => parts,
            Err(error) => {
                warn!(error = %error, "failed opening subscription stream");
                sleep_with_backoff(
                    &mut next_backoff_ms,
                    runtime_config.reconnect_initial_ms,
                    runtime_config.reconnect_max_ms,
                )
                .await;
                continue;
            }
        };
        if let Err(error) = subscribe_tx.send(subscribe_request).await {
            warn!(error = %error, "failed sending subscribe request");
            sleep_with_backoff(
                &mut next_backoff_ms,
                runtime_config.reconnect_initial_ms,
                runtime_config.reconnect_max_ms,
            )
            .await;
            continue;
        }
        next_backoff_ms = runtime_config.reconnect_initial_ms;
        info!(
            endpoint = %runtime_config.endpoint,
            programs = runtime_config.program_ids.len(),
            "transaction subscription established"
        );

        loop {
            let next_message =
                time::timeout(Duration::from_secs(STREAM_IDLE_TIMEOUT_SECS), stream.next()).await;
            match next_message {
                Ok(Some(Ok(update))) => match update.update_oneof {
                    Some(subscribe_update::UpdateOneof::Transaction(tx_update)) => {
                        let Some(tx_info) = tx_update.transaction else {
                            continue;
                        };
                        match raw_transaction_from_proto(tx_update.slot, tx_info) {
                            Some(raw) => {
                                if out_tx.send(raw).await.is_err() {
                                    warn!("source queue receiver dropped; stopping stream loop");
                                    return;
                                }
                            }
                            None => {
                                debug!("skipping vote/failed/unparseable transaction update");
                            }
                        }
                    }
                    Some(subscribe_update::UpdateOneof::Ping(_)) => {
                        let ping = SubscribeRequest {
                            ping: Some(SubscribeRequestPing { id: 1 }),
                            ..Default::default()
                        };
                        if let Err(error) = subscribe_tx.send(ping).await {
                            warn!(error = %error, "failed answering stream ping");
                            break;
                        }
                    }
                    _ => {}
                },
                Ok(Some(Err(error))) => {
                    warn!(error = %error, "stream update error");
                    break;
                }
                Ok(None) => {
                    warn!("transaction stream ended");
                    break;
                }
                Err(_) => {
                    warn!(
                        idle_timeout_seconds = STREAM_IDLE_TIMEOUT_SECS,
                        "stream idle timeout, reconnecting"
                    );
                    break;
                }
            }
        }

        sleep_with_backoff(
            &mut next_backoff_ms,
            runtime_config.reconnect_initial_ms,
            runtime_config.reconnect_max_ms,
        )
        .await;
    }
}

/// Maps a yellowstone transaction update to the internal record. Vote and
/// failed transactions return `None`. Upstream updates carry no block time,
/// so `ingest_time` stamps the record here.
fn raw_transaction_from_proto(
    slot: u64,
    tx_info: SubscribeUpdateTransactionInfo,
) -> Option<RawTransaction> {
    if tx_info.is_vote {
        return None;
    }
    let meta = tx_info.meta.as_ref()?;
    if meta.err.as_ref().is_some_and(|err| !err.err.is_empty()) {
        return None;
    }
    let transaction = tx_info.transaction.as_ref()?;
    let message = transaction.message.as_ref()?;

    let signature = decode_signature(&tx_info)?;
    let account_keys = proto_account_keys(message, meta);
    if account_keys.is_empty() {
        return None;
    }

    Some(RawTransaction {
        signature,
        slot,
        ingest_time: Utc::now(),
        block_time: None,
        fee: meta.fee,
        pre_token_balances: proto_token_balances(&meta.pre_token_balances),
        post_token_balances: proto_token_balances(&meta.post_token_balances),
        pre_lamports: meta.pre_balances.clone(),
        post_lamports: meta.post_balances.clone(),
        program_ids_touched: proto_program_ids(message, meta, &account_keys),
        account_keys,
    })
}

fn decode_signature(tx_info: &SubscribeUpdateTransactionInfo) -> Option<String> {
    if !tx_info.signature.is_empty() {
        return Some(bs58::encode(&tx_info.signature).into_string());
    }
    tx_info
        .transaction
        .as_ref()
        .and_then(|tx| tx.signatures.first())
        .map(|sig| bs58::encode(sig).into_string())
}

fn proto_account_keys(message: &SolMessage, meta: &TransactionStatusMeta) -> Vec<String> {
    let mut out: Vec<String> = message
        .account_keys
        .iter()
        .map(|raw| bs58::encode(raw).into_string())
        .collect();
    out.extend(
        meta.loaded_writable_addresses
            .iter()
            .map(|raw| bs58::encode(raw).into_string()),
    );
    out.extend(
        meta.loaded_readonly_addresses
            .iter()
            .map(|raw| bs58::encode(raw).into_string()),
    );
    out
}

fn proto_token_balances(
    balances: &[yellowstone_grpc_proto::prelude::TokenBalance],
) -> Vec<TokenBalanceEntry> {
    balances
        .iter()
        .filter_map(|balance| {
            let amount = balance.ui_token_amount.as_ref()?;
            if balance.owner.is_empty() || balance.mint.is_empty() {
                return None;
            }
            Some(TokenBalanceEntry {
                owner: balance.owner.clone(),
                mint: balance.mint.clone(),
                raw_amount: amount.amount.parse::<u64>().ok()?,
                decimals: amount.decimals.min(u8::MAX as u32) as u8,
            })
        })
        .collect()
}

fn proto_program_ids(
    message: &SolMessage,
    meta: &TransactionStatusMeta,
    account_keys: &[String],
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |index: u32| {
        if let Some(key) = account_keys.get(index as usize) {
            if !out.contains(key) {
                out.push(key.clone());
            }
        }
    };

    for instruction in &message.instructions {
        push(instruction.program_id_index);
    }
    for inner_group in &meta.inner_instructions {
        for instruction in &inner_group.instructions {
            push(instruction.program_id_index);
        }
    }
    out
}

async fn sleep_with_backoff(next_backoff_ms: &mut u64, initial_ms: u64, max_ms: u64) {
    let delay = (*next_backoff_ms).clamp(initial_ms, max_ms);
    time::sleep(Duration::from_millis(delay)).await;
    *next_backoff_ms = delay.saturating_mul(2).min(max_ms);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mintwatch_core_types::NATIVE_MINT;
    use yellowstone_grpc_proto::prelude::{
        CompiledInstruction, Transaction, TokenBalance, UiTokenAmount,
    };

    fn token_balance(owner: &str, mint: &str, amount: &str, decimals: u32) -> TokenBalance {
        TokenBalance {
            ui_token_amount: Some(UiTokenAmount {
                amount: amount.to_string(),
                decimals,
                ..Default::default()
            }),
            owner: owner.to_string(),
            mint: mint.to_string(),
            ..Default::default()
        }
    }

    fn signer_key() -> Vec<u8> {
        vec![7u8; 32]
    }

    fn tx_info() -> SubscribeUpdateTransactionInfo {
        SubscribeUpdateTransactionInfo {
            signature: vec![1u8; 64],
            is_vote: false,
            transaction: Some(Transaction {
                signatures: vec![vec![1u8; 64]],
                message: Some(SolMessage {
                    account_keys: vec![signer_key(), vec![9u8; 32]],
                    instructions: vec![CompiledInstruction {
                        program_id_index: 1,
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            }),
            meta: Some(TransactionStatusMeta {
                fee: 5_000,
                pre_balances: vec![1_000_000_000, 0],
                post_balances: vec![499_995_000, 0],
                pre_token_balances: vec![token_balance("walletA", "MintM", "0", 6)],
                post_token_balances: vec![token_balance("walletA", "MintM", "100000000", 6)],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn proto_update_maps_to_raw_transaction() {
        let raw = raw_transaction_from_proto(1234, tx_info()).expect("parses");
        assert_eq!(raw.slot, 1234);
        assert_eq!(raw.fee, 5_000);
        assert!(raw.block_time.is_none(), "yellowstone updates carry no block time");
        assert_eq!(raw.pre_lamports, vec![1_000_000_000, 0]);
        assert_eq!(raw.post_token_balances.len(), 1);
        assert_eq!(raw.post_token_balances[0].raw_amount, 100_000_000);
        assert_eq!(raw.account_keys.len(), 2);
        assert_eq!(raw.program_ids_touched, vec![raw.account_keys[1].clone()]);
    }

    #[test]
    fn vote_and_failed_transactions_are_dropped() {
        let mut vote = tx_info();
        vote.is_vote = true;
        assert!(raw_transaction_from_proto(1, vote).is_none());

        let mut failed = tx_info();
        if let Some(meta) = failed.meta.as_mut() {
            meta.err = Some(yellowstone_grpc_proto::prelude::TransactionError {
                err: vec![1, 2, 3],
            });
        }
        assert!(raw_transaction_from_proto(1, failed).is_none());
    }

    #[tokio::test]
    async fn mock_source_emits_decodable_buys() {
        let mut source = MockSource::new(100);
        let tx = source
            .next_transaction()
            .await
            .expect("mock tick")
            .expect("mock emits");
        assert!(tx.signature.starts_with("mock-"));
        assert_eq!(tx.pre_lamports.len(), tx.post_lamports.len());
        assert!(tx.post_token_balances[0].raw_amount > 0);
        assert_ne!(tx.post_token_balances[0].mint, NATIVE_MINT);
    }
}
