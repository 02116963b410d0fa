/// In-memory store
///
/// Reference `IndexStore` implementation backing tests and the dev profile.
/// A transaction clones the whole state, mutates the clone privately, and
/// swaps it back on commit while holding the store mutex for the duration,
/// so transactions are serializable by construction. A transaction dropped
/// without commit is discarded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::{BlockRow, ColorScannedRow, HistoryRow, IndexStore, StoreTx, TxRow};
use crate::types::{BlockHash, ChainTip, SyncError, Txid};

#[derive(Debug, Default, Clone)]
pub struct StoreState {
    pub blocks: BTreeMap<i32, BlockRow>,
    pub txs: HashMap<Txid, TxRow>,
    pub history: Vec<HistoryRow>,
    pub color: HashMap<Txid, ColorScannedRow>,
}

fn latest_of(state: &StoreState) -> ChainTip {
    match state.blocks.iter().next_back() {
        Some((height, row)) => ChainTip {
            hash: row.hash,
            height: *height,
        },
        None => ChainTip::empty(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state, for inspection in tests.
    #[allow(dead_code)]
    pub async fn snapshot(&self) -> StoreState {
        self.state.lock().await.clone()
    }
}

struct MemTx {
    guard: OwnedMutexGuard<StoreState>,
    work: StoreState,
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, SyncError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemTx { guard, work }))
    }

    async fn latest(&self) -> Result<ChainTip, SyncError> {
        Ok(latest_of(&*self.state.lock().await))
    }

    async fn block_at(&self, height: i32) -> Result<Option<BlockRow>, SyncError> {
        Ok(self.state.lock().await.blocks.get(&height).cloned())
    }

    async fn tx(&self, txid: &Txid) -> Result<Option<TxRow>, SyncError> {
        Ok(self.state.lock().await.txs.get(txid).cloned())
    }

    async fn unconfirmed_txids(&self) -> Result<HashSet<Txid>, SyncError> {
        let state = self.state.lock().await;
        Ok(state
            .txs
            .values()
            .filter(|row| row.height.is_none())
            .map(|row| row.txid)
            .collect())
    }

    async fn color_latest(&self) -> Result<Option<(BlockHash, i32)>, SyncError> {
        Ok(color_latest_of(&*self.state.lock().await))
    }

    async fn color_hash_at(&self, height: i32) -> Result<Option<BlockHash>, SyncError> {
        Ok(color_hash_at_of(&*self.state.lock().await, height))
    }

    async fn color_scanned(&self, txid: &Txid) -> Result<Option<ColorScannedRow>, SyncError> {
        Ok(self.state.lock().await.color.get(txid).cloned())
    }

    async fn color_unconfirmed_txids(&self) -> Result<HashSet<Txid>, SyncError> {
        let state = self.state.lock().await;
        Ok(state
            .color
            .values()
            .filter(|row| row.height.is_none())
            .map(|row| row.txid)
            .collect())
    }
}

fn color_latest_of(state: &StoreState) -> Option<(BlockHash, i32)> {
    state
        .color
        .values()
        .filter_map(|row| Some((row.blockhash?, row.height?)))
        .max_by_key(|(_, height)| *height)
}

fn color_hash_at_of(state: &StoreState, height: i32) -> Option<BlockHash> {
    state
        .color
        .values()
        .find(|row| row.height == Some(height))
        .and_then(|row| row.blockhash)
}

#[async_trait]
impl StoreTx for MemTx {
    async fn latest(&mut self) -> Result<ChainTip, SyncError> {
        Ok(latest_of(&self.work))
    }

    async fn block_at(&mut self, height: i32) -> Result<Option<BlockRow>, SyncError> {
        Ok(self.work.blocks.get(&height).cloned())
    }

    async fn blocks_above(&mut self, height: i32) -> Result<Vec<BlockRow>, SyncError> {
        Ok(self
            .work
            .blocks
            .range((height + 1)..)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn insert_block(&mut self, row: BlockRow) -> Result<(), SyncError> {
        if self.work.blocks.contains_key(&row.height) {
            return Err(SyncError::Storage(format!(
                "duplicate block row at height {}",
                row.height
            )));
        }
        self.work.blocks.insert(row.height, row);
        Ok(())
    }

    async fn delete_blocks_above(&mut self, height: i32) -> Result<(), SyncError> {
        self.work.blocks.retain(|h, _| *h <= height);
        Ok(())
    }

    async fn tx(&mut self, txid: &Txid) -> Result<Option<TxRow>, SyncError> {
        Ok(self.work.txs.get(txid).cloned())
    }

    async fn txs_present(&mut self, txids: &[Txid]) -> Result<HashSet<Txid>, SyncError> {
        Ok(txids
            .iter()
            .filter(|txid| self.work.txs.contains_key(txid))
            .copied()
            .collect())
    }

    async fn insert_tx(&mut self, row: TxRow) -> Result<(), SyncError> {
        if self.work.txs.contains_key(&row.txid) {
            return Err(SyncError::Storage(format!("duplicate tx row {}", row.txid)));
        }
        self.work.txs.insert(row.txid, row);
        Ok(())
    }

    async fn set_tx_height(&mut self, txid: &Txid, height: Option<i32>) -> Result<(), SyncError> {
        match self.work.txs.get_mut(txid) {
            Some(row) => {
                row.height = height;
                Ok(())
            }
            None => Err(SyncError::not_found("tx row", txid)),
        }
    }

    async fn clear_tx_heights_above(&mut self, height: i32) -> Result<(), SyncError> {
        for row in self.work.txs.values_mut() {
            if row.height.map_or(false, |h| h > height) {
                row.height = None;
            }
        }
        Ok(())
    }

    async fn unconfirmed_txids(&mut self) -> Result<HashSet<Txid>, SyncError> {
        Ok(self
            .work
            .txs
            .values()
            .filter(|row| row.height.is_none())
            .map(|row| row.txid)
            .collect())
    }

    async fn delete_tx(&mut self, txid: &Txid) -> Result<(), SyncError> {
        self.work.txs.remove(txid);
        Ok(())
    }

    async fn insert_history(&mut self, row: HistoryRow) -> Result<(), SyncError> {
        self.work.history.push(row);
        Ok(())
    }

    async fn spend_history(
        &mut self,
        prev_txid: &Txid,
        vout: u32,
        input_txid: &Txid,
        input_height: Option<i32>,
    ) -> Result<Vec<String>, SyncError> {
        let mut addresses = Vec::new();
        for row in self.work.history.iter_mut() {
            if row.txid == *prev_txid && row.vout == vout {
                row.input_txid = Some(*input_txid);
                row.input_height = input_height;
                addresses.push(row.address.clone());
            }
        }
        Ok(addresses)
    }

    async fn confirm_history_outputs(
        &mut self,
        txid: &Txid,
        height: i32,
    ) -> Result<Vec<String>, SyncError> {
        let mut addresses = Vec::new();
        for row in self.work.history.iter_mut() {
            if row.txid == *txid {
                row.height = Some(height);
                addresses.push(row.address.clone());
            }
        }
        Ok(addresses)
    }

    async fn clear_history_heights_above(&mut self, height: i32) -> Result<(), SyncError> {
        for row in self.work.history.iter_mut() {
            if row.height.map_or(false, |h| h > height) {
                row.height = None;
            }
        }
        Ok(())
    }

    async fn clear_input_heights_above(&mut self, height: i32) -> Result<(), SyncError> {
        for row in self.work.history.iter_mut() {
            if row.input_height.map_or(false, |h| h > height) {
                row.input_height = None;
            }
        }
        Ok(())
    }

    async fn delete_history_outputs(&mut self, txid: &Txid) -> Result<(), SyncError> {
        self.work.history.retain(|row| row.txid != *txid);
        Ok(())
    }

    async fn clear_spends_of(&mut self, txid: &Txid) -> Result<(), SyncError> {
        for row in self.work.history.iter_mut() {
            if row.input_txid == Some(*txid) {
                row.input_txid = None;
                row.input_height = None;
            }
        }
        Ok(())
    }

    async fn color_scanned(&mut self, txid: &Txid) -> Result<Option<ColorScannedRow>, SyncError> {
        Ok(self.work.color.get(txid).cloned())
    }

    async fn insert_color_scanned(&mut self, row: ColorScannedRow) -> Result<(), SyncError> {
        self.work.color.insert(row.txid, row);
        Ok(())
    }

    async fn confirm_color_scanned(
        &mut self,
        txids: &[Txid],
        hash: BlockHash,
        height: i32,
    ) -> Result<(), SyncError> {
        for txid in txids {
            if let Some(row) = self.work.color.get_mut(txid) {
                row.blockhash = Some(hash);
                row.height = Some(height);
            }
        }
        Ok(())
    }

    async fn unconfirm_color_scanned_above(&mut self, height: i32) -> Result<(), SyncError> {
        for row in self.work.color.values_mut() {
            if row.height.map_or(false, |h| h > height) {
                row.blockhash = None;
                row.height = None;
            }
        }
        Ok(())
    }

    async fn delete_color_scanned(&mut self, txid: &Txid) -> Result<(), SyncError> {
        self.work.color.remove(txid);
        Ok(())
    }

    async fn color_latest(&mut self) -> Result<Option<(BlockHash, i32)>, SyncError> {
        Ok(color_latest_of(&self.work))
    }

    async fn color_hash_at(&mut self, height: i32) -> Result<Option<BlockHash>, SyncError> {
        Ok(color_hash_at_of(&self.work, height))
    }

    async fn color_unconfirmed_txids(&mut self) -> Result<HashSet<Txid>, SyncError> {
        Ok(self
            .work
            .color
            .values()
            .filter(|row| row.height.is_none())
            .map(|row| row.txid)
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<(), SyncError> {
        let MemTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}
