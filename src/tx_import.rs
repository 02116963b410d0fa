/// Unconfirmed transaction import
///
/// Records one mempool transaction: the transaction row, a spend mark on
/// every history row its inputs consume, and a history row per recognized
/// output address. Runs under the keyed lock covering the transaction and
/// all of its parents, inside a single store transaction; events ride the
/// outbox and surface only on commit.

use std::sync::Arc;

use bitcoin::network::constants::Network;

use crate::events::{EventPublisher, Outbox};
use crate::keyed_lock::KeyedLock;
use crate::script::extract_addresses;
use crate::store::{HistoryRow, IndexStore, TxRow};
use crate::types::{SyncError, Transaction, Txid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxImportOutcome {
    Imported,
    AlreadyPresent,
    /// Parents missing from the store; the caller should park the
    /// transaction until they arrive.
    Deferred(Vec<Txid>),
}

#[derive(Clone)]
pub struct TxImporter {
    store: Arc<dyn IndexStore>,
    lock: KeyedLock,
    publisher: EventPublisher,
    network: Network,
}

impl TxImporter {
    pub fn new(
        store: Arc<dyn IndexStore>,
        lock: KeyedLock,
        publisher: EventPublisher,
        network: Network,
    ) -> Self {
        Self {
            store,
            lock,
            publisher,
            network,
        }
    }

    pub async fn import(&self, tx: &Transaction) -> Result<TxImportOutcome, SyncError> {
        let parents = tx.parent_txids();
        let mut keys: Vec<Txid> = parents.iter().copied().collect();
        keys.push(tx.txid);
        let _guard = self.lock.acquire(keys).await;

        let mut store_tx = self.store.begin().await?;
        let mut outbox = Outbox::new();

        if store_tx.tx(&tx.txid).await?.is_some() {
            return Ok(TxImportOutcome::AlreadyPresent);
        }

        let parent_list: Vec<Txid> = parents.iter().copied().collect();
        let present = store_tx.txs_present(&parent_list).await?;
        let missing: Vec<Txid> = parents
            .iter()
            .filter(|p| !present.contains(p))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Ok(TxImportOutcome::Deferred(missing));
        }

        store_tx
            .insert_tx(TxRow {
                txid: tx.txid,
                raw: tx.raw.clone(),
                height: None,
            })
            .await?;

        for input in &tx.inputs {
            if input.is_coinbase() {
                continue;
            }
            let addresses = store_tx
                .spend_history(&input.prev_txid, input.prev_vout, &tx.txid, None)
                .await?;
            for address in addresses {
                self.publisher
                    .broadcast_address(&mut outbox, &address, tx.txid, None);
            }
        }

        for (vout, output) in tx.outputs.iter().enumerate() {
            for address in extract_addresses(&output.script, self.network) {
                store_tx
                    .insert_history(HistoryRow {
                        address: address.clone(),
                        txid: tx.txid,
                        vout: vout as u32,
                        value: output.value,
                        script: output.script.clone(),
                        height: None,
                        input_txid: None,
                        input_height: None,
                    })
                    .await?;
                self.publisher
                    .broadcast_address(&mut outbox, &address, tx.txid, None);
            }
        }

        self.publisher.broadcast_tx(&mut outbox, tx.txid, None);
        self.publisher.add_tx(&mut outbox, tx.txid, true);

        store_tx.commit().await?;
        self.publisher.flush(outbox);
        Ok(TxImportOutcome::Imported)
    }
}
