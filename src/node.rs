/// Bitcoin node access
///
/// `NodeRpc` is the seam the sync machinery consumes; the JSON-RPC
/// implementation talks to a real node over HTTP, and tests substitute a
/// deterministic in-memory node. The watcher polls the node and turns tip
/// changes and new mempool txids into `NodeEvent`s for the sync driver.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::telemetry::truncate_hex;
use crate::types::{Block, BlockHash, ChainTip, SyncError, Transaction, Txid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// An unconfirmed transaction was announced.
    Tx(Txid),
    /// The node's chain tip may have changed.
    Block,
}

#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn get_latest(&self) -> Result<ChainTip, SyncError>;
    async fn get_block(&self, height: i32) -> Result<Block, SyncError>;
    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, SyncError>;
    async fn get_mempool_txs(&self) -> Result<Vec<Txid>, SyncError>;
}

/// Plain JSON-RPC client against a Bitcoin node.
pub struct JsonRpcNode {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    pass: Option<String>,
}

impl JsonRpcNode {
    pub fn new(url: String, user: Option<String>, pass: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            user,
            pass,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, SyncError> {
        let mut request = self.client.post(&self.url).json(&json!({
            "jsonrpc": "1.0",
            "id": "chainmirror",
            "method": method,
            "params": params,
        }));
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.pass.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Rpc(format!("{}: {}", method, e)))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| SyncError::Rpc(format!("{}: bad response body: {}", method, e)))?;

        if let Some(error) = body.get("error") {
            if !error.is_null() {
                // -5 is bitcoind's "not found" for tx and block lookups
                if error.get("code").and_then(|c| c.as_i64()) == Some(-5) {
                    return Err(SyncError::not_found("rpc object", method));
                }
                return Err(SyncError::Rpc(format!("{}: {}", method, error)));
            }
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| SyncError::Rpc(format!("{}: no result in response", method)))
    }

    async fn block_hash_at(&self, height: i32) -> Result<BlockHash, SyncError> {
        let hash = self.call("getblockhash", json!([height])).await?;
        hash.as_str()
            .ok_or_else(|| SyncError::Rpc("getblockhash: non-string result".to_string()))?
            .parse()
    }
}

#[async_trait]
impl NodeRpc for JsonRpcNode {
    async fn get_latest(&self) -> Result<ChainTip, SyncError> {
        let count = self.call("getblockcount", json!([])).await?;
        let height = count
            .as_i64()
            .ok_or_else(|| SyncError::Rpc("getblockcount: non-numeric result".to_string()))?
            as i32;
        if height < 0 {
            return Ok(ChainTip::empty());
        }
        let hash = self.block_hash_at(height).await?;
        Ok(ChainTip { hash, height })
    }

    async fn get_block(&self, height: i32) -> Result<Block, SyncError> {
        let hash = self.block_hash_at(height).await?;
        let raw = self
            .call("getblock", json!([hash.to_string(), 0]))
            .await?;
        let raw_hex = raw
            .as_str()
            .ok_or_else(|| SyncError::Rpc("getblock: non-string result".to_string()))?;
        let bytes = hex::decode(raw_hex)
            .map_err(|e| SyncError::Rpc(format!("getblock: bad hex: {}", e)))?;
        Block::from_raw(&bytes)
    }

    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, SyncError> {
        let raw = match self
            .call("getrawtransaction", json!([txid.to_string(), 0]))
            .await
        {
            Ok(raw) => raw,
            Err(SyncError::NotFound { .. }) => {
                return Err(SyncError::not_found("transaction", txid));
            }
            Err(e) => return Err(e),
        };
        let raw_hex = raw
            .as_str()
            .ok_or_else(|| SyncError::Rpc("getrawtransaction: non-string result".to_string()))?;
        let bytes = hex::decode(raw_hex)
            .map_err(|e| SyncError::Rpc(format!("getrawtransaction: bad hex: {}", e)))?;
        Transaction::from_raw(&bytes)
    }

    async fn get_mempool_txs(&self) -> Result<Vec<Txid>, SyncError> {
        let result = self.call("getrawmempool", json!([false])).await?;
        let entries = result
            .as_array()
            .ok_or_else(|| SyncError::Rpc("getrawmempool: non-array result".to_string()))?;
        let mut txids = Vec::with_capacity(entries.len());
        for entry in entries {
            let hex_txid = entry
                .as_str()
                .ok_or_else(|| SyncError::Rpc("getrawmempool: non-string txid".to_string()))?;
            txids.push(hex_txid.parse()?);
        }
        Ok(txids)
    }
}

/// Poll the node, translating observed changes into events.
///
/// Runs until the receiving side goes away. RPC failures are logged and the
/// poll retried on the next tick.
pub async fn run_node_watcher(
    node: Arc<dyn NodeRpc>,
    events: mpsc::Sender<NodeEvent>,
    poll_interval: Duration,
) {
    let mut last_tip: Option<ChainTip> = None;
    let mut known_mempool: HashSet<Txid> = HashSet::new();

    loop {
        tokio::time::sleep(poll_interval).await;

        match node.get_latest().await {
            Ok(tip) => {
                if last_tip != Some(tip) {
                    last_tip = Some(tip);
                    if events.send(NodeEvent::Block).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "node tip poll failed");
                continue;
            }
        }

        match node.get_mempool_txs().await {
            Ok(txids) => {
                let current: HashSet<Txid> = txids.into_iter().collect();
                for txid in current.difference(&known_mempool) {
                    debug!(txid = %truncate_hex(&txid.to_string(), 16), "mempool announced");
                    if events.send(NodeEvent::Tx(*txid)).await.is_err() {
                        return;
                    }
                }
                known_mempool = current;
            }
            Err(e) => warn!(error = %e, "node mempool poll failed"),
        }
    }
}
