/// Chain synchronization driver
///
/// One long-running task that keeps the stored chain converged on the node's
/// chain. A pass advances the tip block by block, walking back through
/// stored blocks to find the fork point when the node switched chains and
/// rolling everything above it back in a single store transaction under the
/// global-exclusive lock. After the tip converges, the stored mempool is
/// reconciled against the node's. Announced transactions import through the
/// orphan registry so a child is never recorded before its parents.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bitcoin::network::constants::Network;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::block_import::import_block;
use crate::events::{EventPublisher, Outbox};
use crate::keyed_lock::KeyedLock;
use crate::node::{NodeEvent, NodeRpc};
use crate::orphans::OrphanRegistry;
use crate::store::IndexStore;
use crate::tx_import::{TxImportOutcome, TxImporter};
use crate::types::{Block, ChainTip, SyncError, Txid};

pub struct ChainSync {
    node: Arc<dyn NodeRpc>,
    store: Arc<dyn IndexStore>,
    lock: KeyedLock,
    publisher: EventPublisher,
    importer: TxImporter,
    orphans: StdMutex<OrphanRegistry>,
    latest: Mutex<ChainTip>,
    network: Network,
    poll_interval: Duration,
}

impl ChainSync {
    pub async fn new(
        node: Arc<dyn NodeRpc>,
        store: Arc<dyn IndexStore>,
        publisher: EventPublisher,
        lock: KeyedLock,
        network: Network,
        poll_interval: Duration,
    ) -> Result<Arc<Self>, SyncError> {
        let latest = store.latest().await?;
        info!(height = latest.height, hash = %latest.hash, "chain cursor loaded");
        let importer = TxImporter::new(
            Arc::clone(&store),
            lock.clone(),
            publisher.clone(),
            network,
        );
        Ok(Arc::new(Self {
            node,
            store,
            lock,
            publisher,
            importer,
            orphans: StdMutex::new(OrphanRegistry::new()),
            latest: Mutex::new(latest),
            network,
            poll_interval,
        }))
    }

    /// React to node events until the sender side closes. Redundant block
    /// triggers arriving while a pass runs queue up and collapse into cheap
    /// no-op passes; tip passes never overlap.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<NodeEvent>) {
        loop {
            let event = tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => event,
                    None => return,
                },
                _ = tokio::time::sleep(self.poll_interval) => NodeEvent::Block,
            };

            match event {
                NodeEvent::Tx(txid) => {
                    let sync = Arc::clone(&self);
                    tokio::spawn(async move { sync.import_announced_tx(txid).await });
                }
                NodeEvent::Block => {
                    if let Err(e) = self.catch_up().await {
                        error!(error = %e, "block import loop failed");
                        self.refresh_latest().await;
                        continue;
                    }
                    loop {
                        match self.reconcile_mempool().await {
                            Ok(()) => break,
                            Err(e) => {
                                error!(error = %e, "mempool reconciliation failed");
                                tokio::time::sleep(Duration::from_secs(5)).await;
                            }
                        }
                    }
                    debug!(orphans = self.orphan_count(), "sync pass complete");
                }
            }
        }
    }

    /// One full pass: converge the tip, then reconcile the mempool.
    pub async fn sync_once(self: &Arc<Self>) -> Result<(), SyncError> {
        self.catch_up().await?;
        self.reconcile_mempool().await
    }

    /// Advance the stored tip until it matches the node's.
    pub async fn catch_up(&self) -> Result<(), SyncError> {
        let mut stored = *self.latest.lock().await;
        let mut node_latest = self.node.get_latest().await?;

        while stored.hash != node_latest.hash {
            // Walk back through stored blocks until the node's candidate for
            // the next height extends the block we are standing on.
            let mut local = stored;
            let candidate = loop {
                match self.node.get_block(local.height + 1).await {
                    Ok(candidate) if candidate.prev_hash == local.hash => break candidate,
                    Ok(_) => {}
                    // The node's chain ends below this height; keep walking
                    Err(SyncError::NotFound { .. })
                        if local.height + 1 > node_latest.height => {}
                    Err(e) => return Err(e),
                }
                local = match self.store.block_at(local.height - 1).await? {
                    Some(row) => ChainTip {
                        hash: row.hash,
                        height: row.height,
                    },
                    None if local.height == 0 => ChainTip::empty(),
                    None => {
                        return Err(SyncError::Consistency(format!(
                            "no common ancestor walking back from height {}",
                            local.height
                        )))
                    }
                };
            };

            if local.hash != stored.hash {
                warn!(
                    fork_height = local.height,
                    stored_height = stored.height,
                    "reorg detected, rolling back"
                );
                self.rollback_above(local.height).await?;
                stored = self.store.latest().await?;
                *self.latest.lock().await = stored;
            }

            let height = local.height + 1;
            self.import_one_block(&candidate, height).await?;
            stored = ChainTip {
                hash: candidate.hash,
                height,
            };
            *self.latest.lock().await = stored;
            info!(height, hash = %candidate.hash, txs = candidate.txs.len(), "block imported");

            self.resolve_orphans_of(&candidate.txids()).await;

            if node_latest.height == stored.height {
                node_latest = self.node.get_latest().await?;
            }
        }
        Ok(())
    }

    async fn import_one_block(&self, block: &Block, height: i32) -> Result<(), SyncError> {
        let mut keys: HashSet<Txid> = block.txids().into_iter().collect();
        for tx in &block.txs {
            keys.extend(tx.parent_txids());
        }
        let _guard = self.lock.acquire(keys).await;

        let mut store_tx = self.store.begin().await?;
        let mut outbox = Outbox::new();
        import_block(
            store_tx.as_mut(),
            &self.publisher,
            &mut outbox,
            self.network,
            block,
            height,
        )
        .await?;
        store_tx.commit().await?;
        self.publisher.flush(outbox);
        Ok(())
    }

    /// Roll the store back so `fork_height` is the new tip, in one
    /// transaction under the global-exclusive lock.
    async fn rollback_above(&self, fork_height: i32) -> Result<(), SyncError> {
        let _guard = self.lock.acquire_reorg().await;

        let mut store_tx = self.store.begin().await?;
        let mut outbox = Outbox::new();

        let orphaned = store_tx.blocks_above(fork_height).await?;
        for block in &orphaned {
            self.publisher.remove_block(&mut outbox, block.hash);
        }
        store_tx.delete_blocks_above(fork_height).await?;
        store_tx.clear_tx_heights_above(fork_height).await?;
        store_tx.clear_history_heights_above(fork_height).await?;
        store_tx.clear_input_heights_above(fork_height).await?;

        store_tx.commit().await?;
        self.publisher.flush(outbox);
        info!(fork_height, orphaned = orphaned.len(), "rollback complete");
        Ok(())
    }

    /// Reconcile the stored unconfirmed set against the node's mempool:
    /// vanished transactions are deleted in one transaction, new ones are
    /// scheduled for import without blocking the pass.
    pub async fn reconcile_mempool(self: &Arc<Self>) -> Result<(), SyncError> {
        let node_mempool: HashSet<Txid> =
            self.node.get_mempool_txs().await?.into_iter().collect();
        let stored_unconfirmed = self.store.unconfirmed_txids().await?;

        let to_remove: Vec<Txid> = stored_unconfirmed
            .difference(&node_mempool)
            .copied()
            .collect();
        if !to_remove.is_empty() {
            debug!(count = to_remove.len(), "dropping vanished mempool transactions");
            let _guard = self.lock.acquire(to_remove.iter().copied()).await;
            let mut store_tx = self.store.begin().await?;
            let mut outbox = Outbox::new();
            for txid in &to_remove {
                store_tx.delete_history_outputs(txid).await?;
                store_tx.clear_spends_of(txid).await?;
                store_tx.delete_tx(txid).await?;
                self.publisher.remove_tx(&mut outbox, *txid, true);
            }
            store_tx.commit().await?;
            self.publisher.flush(outbox);
        }

        for txid in node_mempool.difference(&stored_unconfirmed) {
            let sync = Arc::clone(self);
            let txid = *txid;
            tokio::spawn(async move { sync.import_announced_tx(txid).await });
        }
        Ok(())
    }

    /// Import a node-announced unconfirmed transaction, parking it in the
    /// orphan registry when parents are missing and draining every child the
    /// import frees.
    pub async fn import_announced_tx(&self, txid: Txid) {
        if let Err(e) = self.import_tx_chain(txid).await {
            error!(txid = %txid, error = %e, "tx import failed");
        }
    }

    async fn import_tx_chain(&self, txid: Txid) -> Result<(), SyncError> {
        let tx = self.node.get_tx(&txid).await?;
        let mut queue = VecDeque::from([tx]);

        while let Some(tx) = queue.pop_front() {
            match self.importer.import(&tx).await? {
                TxImportOutcome::Deferred(missing) => {
                    debug!(txid = %tx.txid, missing = missing.len(), "parked orphan transaction");
                    self.orphans
                        .lock()
                        .unwrap()
                        .mark(tx.txid, missing.iter().copied());
                }
                TxImportOutcome::Imported | TxImportOutcome::AlreadyPresent => {
                    let freed = self.orphans.lock().unwrap().resolve(&tx.txid);
                    for child in freed {
                        match self.node.get_tx(&child).await {
                            Ok(child_tx) => queue.push_back(child_tx),
                            Err(e) => {
                                error!(txid = %child, error = %e, "freed orphan fetch failed")
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Confirmed txids resolve their orphaned children; freed children are
    /// re-imported concurrently (the keyed lock serializes any overlap).
    async fn resolve_orphans_of(&self, txids: &[Txid]) {
        let freed: Vec<Txid> = {
            let mut orphans = self.orphans.lock().unwrap();
            txids.iter().flat_map(|txid| orphans.resolve(txid)).collect()
        };
        if freed.is_empty() {
            return;
        }
        join_all(
            freed
                .into_iter()
                .map(|child| self.import_announced_tx(child)),
        )
        .await;
    }

    /// Re-read the chain cursor from storage, retrying until it succeeds.
    async fn refresh_latest(&self) {
        loop {
            match self.store.latest().await {
                Ok(tip) => {
                    *self.latest.lock().await = tip;
                    return;
                }
                Err(e) => {
                    error!(error = %e, "failed to re-read chain cursor");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().unwrap().len()
    }
}
