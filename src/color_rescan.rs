/// Colored-coin rescanner
///
/// Keeps the color-scanned table converged on the core index by consuming
/// the indexer's own bus events. One mutex serializes the three operations
/// (add, remove, block advance) so a per-tx rescan can never interleave with
/// the frontier walking backwards through a reorg. Per-tx failures are
/// logged and do not abort sibling work.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::bus::EventBus;
use crate::color::{ColorDefinition, ColorStore, TxSource};
use crate::events::BusEvent;
use crate::store::{ColorScannedRow, IndexStore};
use crate::types::{BlockHash, SyncError, Transaction, Txid};

/// Raw transactions come from the core transaction table, not the node.
struct StoreTxSource {
    store: Arc<dyn IndexStore>,
}

#[async_trait]
impl TxSource for StoreTxSource {
    async fn raw_tx(&self, txid: &Txid) -> Result<Vec<u8>, SyncError> {
        self.store
            .tx(txid)
            .await?
            .map(|row| row.raw)
            .ok_or_else(|| SyncError::not_found("transaction", txid))
    }
}

pub struct ColorRescanner {
    store: Arc<dyn IndexStore>,
    colors: Arc<dyn ColorStore>,
    definitions: Vec<Arc<dyn ColorDefinition>>,
    gate: Mutex<()>,
}

impl ColorRescanner {
    pub fn new(
        store: Arc<dyn IndexStore>,
        colors: Arc<dyn ColorStore>,
        definitions: Vec<Arc<dyn ColorDefinition>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            colors,
            definitions,
            gate: Mutex::new(()),
        })
    }

    /// Consume indexer events until the bus closes.
    pub async fn run(self: Arc<Self>, bus: Arc<EventBus>) {
        let mut events = bus.subscribe();
        loop {
            match events.recv().await {
                Ok(BusEvent::AddTx { txid, .. }) => self.add_txs(&[txid]).await,
                Ok(BusEvent::RemoveTx { txid, .. }) => self.remove_txs(&[txid]).await,
                Ok(BusEvent::AddBlock { .. }) | Ok(BusEvent::RemoveBlock { .. }) => {
                    if let Err(e) = self.update_blocks().await {
                        error!(error = %e, "color block update failed");
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed events; a full update pass re-derives the state
                    debug!(skipped, "color rescanner lagged behind the bus");
                    if let Err(e) = self.update_blocks().await {
                        error!(error = %e, "color block update failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Rescan a batch of transactions as unconfirmed.
    pub async fn add_txs(&self, txids: &[Txid]) {
        let _gate = self.gate.lock().await;
        for txid in txids {
            if let Err(e) = self.add_one(txid, None).await {
                error!(txid = %txid, error = %e, "color rescan failed");
            }
        }
    }

    /// Forget a batch of transactions: drop the scheme's definition when one
    /// matches, otherwise its color values, then the scanned row.
    pub async fn remove_txs(&self, txids: &[Txid]) {
        let _gate = self.gate.lock().await;
        for txid in txids {
            if let Err(e) = self.remove_one(txid).await {
                error!(txid = %txid, error = %e, "color removal failed");
            }
        }
    }

    /// Converge the scan frontier on the core chain, walking back through
    /// reorged blocks first, then reconcile the unconfirmed sets.
    pub async fn update_blocks(&self) -> Result<(), SyncError> {
        let _gate = self.gate.lock().await;

        loop {
            let core = self.store.latest().await?;
            if core.height < 0 {
                break;
            }
            let scanned = self.store.color_latest().await?;
            if scanned == Some((core.hash, core.height)) {
                break;
            }

            let rollback = self.find_rollback_point(scanned, core.height).await?;
            if let Some((_, scanned_height)) = scanned {
                if rollback < scanned_height {
                    info!(rollback, scanned_height, "unwinding color scan frontier");
                    let mut store_tx = self.store.begin().await?;
                    store_tx.unconfirm_color_scanned_above(rollback).await?;
                    store_tx.commit().await?;
                }
            }

            if rollback >= core.height {
                continue;
            }

            let block = self
                .store
                .block_at(rollback + 1)
                .await?
                .ok_or_else(|| {
                    SyncError::Consistency(format!("missing core block at height {}", rollback + 1))
                })?;

            let mut already_scanned = Vec::new();
            for txid in &block.txids {
                match self.add_one(txid, Some((block.hash, block.height))).await {
                    Ok(true) => already_scanned.push(*txid),
                    Ok(false) => {}
                    Err(e) => error!(txid = %txid, error = %e, "color rescan failed"),
                }
            }
            if !already_scanned.is_empty() {
                let mut store_tx = self.store.begin().await?;
                store_tx
                    .confirm_color_scanned(&already_scanned, block.hash, block.height)
                    .await?;
                store_tx.commit().await?;
            }
            debug!(height = block.height, txs = block.txids.len(), "color frontier advanced");
        }

        self.reconcile_unconfirmed().await
    }

    /// Walk the scanned block mapping down until it agrees with the core
    /// chain; returns the height to restart scanning above.
    async fn find_rollback_point(
        &self,
        scanned: Option<(BlockHash, i32)>,
        core_height: i32,
    ) -> Result<i32, SyncError> {
        let mut frontier = scanned;
        loop {
            let (hash, height) = match frontier {
                None => return Ok(-1),
                Some(pair) => pair,
            };
            if height <= core_height {
                if let Some(row) = self.store.block_at(height).await? {
                    if row.hash == hash {
                        return Ok(height);
                    }
                }
            }
            let mut below = height - 1;
            frontier = loop {
                if below < 0 {
                    break None;
                }
                match self.store.color_hash_at(below).await? {
                    Some(hash_below) => break Some((hash_below, below)),
                    None => below -= 1,
                }
            };
        }
    }

    /// Scan one transaction if it has not been scanned yet; returns whether
    /// it was already present.
    async fn add_one(
        &self,
        txid: &Txid,
        block: Option<(BlockHash, i32)>,
    ) -> Result<bool, SyncError> {
        if self.store.color_scanned(txid).await?.is_some() {
            return Ok(true);
        }

        let row = self
            .store
            .tx(txid)
            .await?
            .ok_or_else(|| SyncError::not_found("transaction", txid))?;
        let tx = Transaction::from_raw(&row.raw)?;
        let source = StoreTxSource {
            store: Arc::clone(&self.store),
        };
        for definition in &self.definitions {
            definition.scan_tx(&tx, &source).await.map_err(|e| {
                SyncError::Color(format!("{} scan of {} failed: {}", definition.kind(), txid, e))
            })?;
        }

        let mut store_tx = self.store.begin().await?;
        store_tx
            .insert_color_scanned(ColorScannedRow {
                txid: *txid,
                blockhash: block.map(|(hash, _)| hash),
                height: block.map(|(_, height)| height),
            })
            .await?;
        store_tx.commit().await?;
        Ok(false)
    }

    async fn remove_one(&self, txid: &Txid) -> Result<(), SyncError> {
        if self.store.color_scanned(txid).await?.is_none() {
            return Ok(());
        }

        for definition in &self.definitions {
            let stored = self.colors.definitions().await?;
            match stored
                .iter()
                .find(|(_, descriptor)| definition.matches_definition(descriptor, txid))
            {
                Some((id, _)) => self.colors.drop_definition(*id).await?,
                None => {
                    self.colors
                        .remove_color_values(txid, definition.kind())
                        .await?
                }
            }
        }

        let mut store_tx = self.store.begin().await?;
        store_tx.delete_color_scanned(txid).await?;
        store_tx.commit().await?;
        Ok(())
    }

    /// Symmetric difference between the unconfirmed scanned set and the core
    /// unconfirmed set: stale rows go, new mempool txs get scanned.
    async fn reconcile_unconfirmed(&self) -> Result<(), SyncError> {
        let color_unconfirmed = self.store.color_unconfirmed_txids().await?;
        let core_unconfirmed = self.store.unconfirmed_txids().await?;

        for txid in color_unconfirmed.difference(&core_unconfirmed) {
            if let Err(e) = self.remove_one(txid).await {
                error!(txid = %txid, error = %e, "color removal failed");
            }
        }
        for txid in core_unconfirmed.difference(&color_unconfirmed) {
            if let Err(e) = self.add_one(txid, None).await {
                error!(txid = %txid, error = %e, "color rescan failed");
            }
        }
        Ok(())
    }
}
