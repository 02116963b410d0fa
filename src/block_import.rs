/// Confirmed block import
///
/// Applies one block to an open store transaction: the block row, a
/// confirm-or-insert per transaction, spend marks for every non-coinbase
/// input, and the full event fan-out through the outbox. The caller owns the
/// keyed lock over the block's txids and parents, the transaction, and the
/// commit; a failure anywhere aborts the whole block.

use bitcoin::network::constants::Network;

use crate::events::{EventPublisher, Outbox};
use crate::script::extract_addresses;
use crate::store::{BlockRow, HistoryRow, StoreTx, TxRow};
use crate::types::{Block, SyncError};

pub async fn import_block(
    store_tx: &mut dyn StoreTx,
    publisher: &EventPublisher,
    outbox: &mut Outbox,
    network: Network,
    block: &Block,
    height: i32,
) -> Result<(), SyncError> {
    let tip = store_tx.latest().await?;
    if tip.hash != block.prev_hash || tip.height + 1 != height {
        return Err(SyncError::Consistency(format!(
            "block {} at height {} does not extend stored tip {} at {}",
            block.hash, height, tip.hash, tip.height
        )));
    }

    store_tx
        .insert_block(BlockRow {
            height,
            hash: block.hash,
            header: block.header.clone(),
            txids: block.txids(),
        })
        .await?;

    let confirmed = Some((block.hash, height));

    for tx in &block.txs {
        if store_tx.tx(&tx.txid).await?.is_some() {
            // Previously unconfirmed: upgrade in place
            store_tx.set_tx_height(&tx.txid, Some(height)).await?;
            let addresses = store_tx.confirm_history_outputs(&tx.txid, height).await?;
            for address in addresses {
                publisher.broadcast_address(outbox, &address, tx.txid, confirmed);
            }
        } else {
            store_tx
                .insert_tx(TxRow {
                    txid: tx.txid,
                    raw: tx.raw.clone(),
                    height: Some(height),
                })
                .await?;
            for (vout, output) in tx.outputs.iter().enumerate() {
                for address in extract_addresses(&output.script, network) {
                    store_tx
                        .insert_history(HistoryRow {
                            address: address.clone(),
                            txid: tx.txid,
                            vout: vout as u32,
                            value: output.value,
                            script: output.script.clone(),
                            height: Some(height),
                            input_txid: None,
                            input_height: None,
                        })
                        .await?;
                    publisher.broadcast_address(outbox, &address, tx.txid, confirmed);
                }
            }
        }
        publisher.broadcast_tx(outbox, tx.txid, confirmed);
        publisher.add_tx(outbox, tx.txid, false);
    }

    for tx in &block.txs {
        for input in &tx.inputs {
            if input.is_coinbase() {
                continue;
            }
            let addresses = store_tx
                .spend_history(&input.prev_txid, input.prev_vout, &tx.txid, Some(height))
                .await?;
            for address in addresses {
                publisher.broadcast_address(outbox, &address, tx.txid, confirmed);
            }
        }
    }

    publisher.broadcast_block(outbox, block.hash, height);
    publisher.add_block(outbox, block.hash);
    Ok(())
}
