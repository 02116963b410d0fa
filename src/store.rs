/// Storage interface
///
/// The indexer talks to its relational store through these traits; the SQL
/// backend lives outside this crate and implements them over its connection
/// pool. `begin` opens a serializable transaction: every mutation staged on
/// the `StoreTx` becomes visible atomically at `commit`, and a transaction
/// dropped without commit leaves no trace.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::types::{BlockHash, ChainTip, SyncError, Txid};

/// One confirmed block: header bytes plus the ordered txid list.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRow {
    pub height: i32,
    pub hash: BlockHash,
    pub header: Vec<u8>,
    pub txids: Vec<Txid>,
}

/// One known transaction; `height` is None while unconfirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct TxRow {
    pub txid: Txid,
    pub raw: Vec<u8>,
    pub height: Option<i32>,
}

/// Per-address ledger entry for one output. The row is created when the
/// output appears and mutated in place when the output is spent.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub address: String,
    pub txid: Txid,
    pub vout: u32,
    pub value: i64,
    pub script: Vec<u8>,
    pub height: Option<i32>,
    pub input_txid: Option<Txid>,
    pub input_height: Option<i32>,
}

/// Colored-coin scan frontier: which txs have been rescanned, and under
/// which block. Both block fields set, or both null (unconfirmed).
#[derive(Debug, Clone, PartialEq)]
pub struct ColorScannedRow {
    pub txid: Txid,
    pub blockhash: Option<BlockHash>,
    pub height: Option<i32>,
}

/// An open serializable transaction against the store.
#[async_trait]
pub trait StoreTx: Send {
    // Chain
    async fn latest(&mut self) -> Result<ChainTip, SyncError>;
    async fn block_at(&mut self, height: i32) -> Result<Option<BlockRow>, SyncError>;
    async fn blocks_above(&mut self, height: i32) -> Result<Vec<BlockRow>, SyncError>;
    async fn insert_block(&mut self, row: BlockRow) -> Result<(), SyncError>;
    async fn delete_blocks_above(&mut self, height: i32) -> Result<(), SyncError>;

    // Transactions
    async fn tx(&mut self, txid: &Txid) -> Result<Option<TxRow>, SyncError>;
    async fn txs_present(&mut self, txids: &[Txid]) -> Result<HashSet<Txid>, SyncError>;
    async fn insert_tx(&mut self, row: TxRow) -> Result<(), SyncError>;
    async fn set_tx_height(&mut self, txid: &Txid, height: Option<i32>) -> Result<(), SyncError>;
    async fn clear_tx_heights_above(&mut self, height: i32) -> Result<(), SyncError>;
    async fn unconfirmed_txids(&mut self) -> Result<HashSet<Txid>, SyncError>;
    async fn delete_tx(&mut self, txid: &Txid) -> Result<(), SyncError>;

    // History
    async fn insert_history(&mut self, row: HistoryRow) -> Result<(), SyncError>;
    /// Record a spend of `(prev_txid, vout)`; returns the addresses of every
    /// touched row (multisig outputs index one row per address).
    async fn spend_history(
        &mut self,
        prev_txid: &Txid,
        vout: u32,
        input_txid: &Txid,
        input_height: Option<i32>,
    ) -> Result<Vec<String>, SyncError>;
    /// Confirm all producer rows of `txid`; returns their addresses.
    async fn confirm_history_outputs(
        &mut self,
        txid: &Txid,
        height: i32,
    ) -> Result<Vec<String>, SyncError>;
    async fn clear_history_heights_above(&mut self, height: i32) -> Result<(), SyncError>;
    async fn clear_input_heights_above(&mut self, height: i32) -> Result<(), SyncError>;
    /// Delete every row whose producer is `txid`.
    async fn delete_history_outputs(&mut self, txid: &Txid) -> Result<(), SyncError>;
    /// Null out the spend fields on every row `txid` was spending.
    async fn clear_spends_of(&mut self, txid: &Txid) -> Result<(), SyncError>;

    // Color-scanned
    async fn color_scanned(&mut self, txid: &Txid) -> Result<Option<ColorScannedRow>, SyncError>;
    async fn insert_color_scanned(&mut self, row: ColorScannedRow) -> Result<(), SyncError>;
    async fn confirm_color_scanned(
        &mut self,
        txids: &[Txid],
        hash: BlockHash,
        height: i32,
    ) -> Result<(), SyncError>;
    async fn unconfirm_color_scanned_above(&mut self, height: i32) -> Result<(), SyncError>;
    async fn delete_color_scanned(&mut self, txid: &Txid) -> Result<(), SyncError>;
    async fn color_latest(&mut self) -> Result<Option<(BlockHash, i32)>, SyncError>;
    async fn color_hash_at(&mut self, height: i32) -> Result<Option<BlockHash>, SyncError>;
    async fn color_unconfirmed_txids(&mut self) -> Result<HashSet<Txid>, SyncError>;

    async fn commit(self: Box<Self>) -> Result<(), SyncError>;
}

/// Handle on the store itself. Reads outside a transaction see the latest
/// committed state.
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, SyncError>;

    async fn latest(&self) -> Result<ChainTip, SyncError>;
    async fn block_at(&self, height: i32) -> Result<Option<BlockRow>, SyncError>;
    async fn tx(&self, txid: &Txid) -> Result<Option<TxRow>, SyncError>;
    async fn unconfirmed_txids(&self) -> Result<HashSet<Txid>, SyncError>;

    async fn color_latest(&self) -> Result<Option<(BlockHash, i32)>, SyncError>;
    async fn color_hash_at(&self, height: i32) -> Result<Option<BlockHash>, SyncError>;
    async fn color_scanned(&self, txid: &Txid) -> Result<Option<ColorScannedRow>, SyncError>;
    async fn color_unconfirmed_txids(&self) -> Result<HashSet<Txid>, SyncError>;
}
