//! End-to-end sync scenarios against a deterministic test node.
//!
//! Blocks and transactions are built with real consensus encoding so txids
//! and raw bytes behave exactly as they do against a live node; only the
//! node itself is simulated.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bitcoin::consensus::encode::{deserialize, serialize};
    use bitcoin::hashes::Hash as BitcoinHash;
    use bitcoin::network::constants::Network;

    use crate::bus::EventBus;
    use crate::chain_sync::ChainSync;
    use crate::events::{BusEvent, EventPublisher};
    use crate::keyed_lock::KeyedLock;
    use crate::memstore::{MemoryStore, StoreState};
    use crate::node::NodeRpc;
    use crate::store::{HistoryRow, IndexStore};
    use crate::types::{Block, ChainTip, SyncError, Transaction, Txid};

    // ---------------------------------------------------------------------
    // Deterministic test node
    // ---------------------------------------------------------------------

    #[derive(Default)]
    struct TestNode {
        inner: StdMutex<TestNodeState>,
    }

    #[derive(Default)]
    struct TestNodeState {
        chain: Vec<Block>,
        mempool: HashMap<Txid, Transaction>,
    }

    impl TestNode {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn set_chain(&self, chain: Vec<Block>) {
            self.inner.lock().unwrap().chain = chain;
        }

        fn add_mempool_tx(&self, tx: Transaction) {
            self.inner.lock().unwrap().mempool.insert(tx.txid, tx);
        }

        fn set_mempool(&self, txs: Vec<Transaction>) {
            let mut inner = self.inner.lock().unwrap();
            inner.mempool = txs.into_iter().map(|tx| (tx.txid, tx)).collect();
        }
    }

    #[async_trait]
    impl NodeRpc for TestNode {
        async fn get_latest(&self) -> Result<ChainTip, SyncError> {
            let inner = self.inner.lock().unwrap();
            Ok(match inner.chain.last() {
                Some(block) => ChainTip {
                    hash: block.hash,
                    height: inner.chain.len() as i32 - 1,
                },
                None => ChainTip::empty(),
            })
        }

        async fn get_block(&self, height: i32) -> Result<Block, SyncError> {
            let inner = self.inner.lock().unwrap();
            if height < 0 {
                return Err(SyncError::not_found("block", height));
            }
            inner
                .chain
                .get(height as usize)
                .cloned()
                .ok_or_else(|| SyncError::not_found("block", height))
        }

        async fn get_tx(&self, txid: &Txid) -> Result<Transaction, SyncError> {
            let inner = self.inner.lock().unwrap();
            if let Some(tx) = inner.mempool.get(txid) {
                return Ok(tx.clone());
            }
            for block in &inner.chain {
                if let Some(tx) = block.txs.iter().find(|tx| tx.txid == *txid) {
                    return Ok(tx.clone());
                }
            }
            Err(SyncError::not_found("transaction", txid))
        }

        async fn get_mempool_txs(&self) -> Result<Vec<Txid>, SyncError> {
            Ok(self.inner.lock().unwrap().mempool.keys().copied().collect())
        }
    }

    // ---------------------------------------------------------------------
    // Consensus-encoded fixtures
    // ---------------------------------------------------------------------

    fn p2pkh_script(seed: u8) -> bitcoin::Script {
        let mut bytes = vec![0x76, 0xa9, 0x14];
        bytes.extend_from_slice(&[seed; 20]);
        bytes.extend_from_slice(&[0x88, 0xac]);
        bitcoin::Script::from(bytes)
    }

    fn finish(tx: bitcoin::Transaction) -> Transaction {
        Transaction::from_raw(&serialize(&tx)).unwrap()
    }

    /// Coinbase paying `values` to per-index addresses; `tag` makes the
    /// txid unique the way the height in the real script sig does.
    fn coinbase(tag: u32, values: &[u64]) -> Transaction {
        finish(bitcoin::Transaction {
            version: 1,
            lock_time: 0,
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint::null(),
                script_sig: bitcoin::Script::from(tag.to_le_bytes().to_vec()),
                sequence: 0xFFFF_FFFF,
                witness: vec![],
            }],
            output: values
                .iter()
                .enumerate()
                .map(|(i, value)| bitcoin::TxOut {
                    value: *value,
                    script_pubkey: p2pkh_script((tag as u8) * 16 + i as u8),
                })
                .collect(),
        })
    }

    /// Spend one outpoint into one output.
    fn spend(parent: &Transaction, vout: u32, value: u64, dest_seed: u8) -> Transaction {
        finish(bitcoin::Transaction {
            version: 1,
            lock_time: 0,
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint {
                    txid: bitcoin::Txid::from_inner(parent.txid.0),
                    vout,
                },
                script_sig: bitcoin::Script::new(),
                sequence: 0xFFFF_FFFF,
                witness: vec![],
            }],
            output: vec![bitcoin::TxOut {
                value,
                script_pubkey: p2pkh_script(dest_seed),
            }],
        })
    }

    fn make_block(prev: &[u8; 32], nonce: u32, txs: &[&Transaction]) -> Block {
        let txdata = txs
            .iter()
            .map(|tx| deserialize(&tx.raw).unwrap())
            .collect::<Vec<bitcoin::Transaction>>();
        let header = bitcoin::BlockHeader {
            version: 2,
            prev_blockhash: bitcoin::BlockHash::from_inner(*prev),
            merkle_root: bitcoin::hash_types::TxMerkleNode::from_inner([0u8; 32]),
            time: 1_600_000_000 + nonce,
            bits: 0x207f_ffff,
            nonce,
        };
        Block::from_raw(&serialize(&bitcoin::Block { header, txdata })).unwrap()
    }

    // ---------------------------------------------------------------------
    // Harness
    // ---------------------------------------------------------------------

    struct Harness {
        node: Arc<TestNode>,
        store: Arc<MemoryStore>,
        bus: Arc<EventBus>,
        sync: Arc<ChainSync>,
    }

    async fn harness() -> Harness {
        let node = TestNode::new();
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(4096));
        let sync = ChainSync::new(
            Arc::clone(&node) as Arc<dyn NodeRpc>,
            Arc::clone(&store) as Arc<dyn IndexStore>,
            EventPublisher::new(Arc::clone(&bus)),
            KeyedLock::new(),
            Network::Regtest,
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        Harness {
            node,
            store,
            bus,
            sync,
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<BusEvent>) -> Vec<BusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_for_tx(store: &MemoryStore, txid: &Txid) {
        for _ in 0..100 {
            if store.tx(txid).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transaction {} never appeared", txid);
    }

    /// Structural invariants every reachable committed state must satisfy.
    fn check_invariants(state: &StoreState) {
        // Heights are contiguous from zero
        for (i, height) in state.blocks.keys().enumerate() {
            assert_eq!(*height, i as i32, "block heights must be contiguous");
        }
        // Every confirmed tx is listed by its block
        for tx in state.txs.values() {
            if let Some(height) = tx.height {
                let block = state
                    .blocks
                    .get(&height)
                    .unwrap_or_else(|| panic!("tx {} confirmed at missing height {}", tx.txid, height));
                assert!(
                    block.txids.contains(&tx.txid),
                    "block {} must list tx {}",
                    height,
                    tx.txid
                );
            }
        }
        for row in &state.history {
            let producer = state
                .txs
                .get(&row.txid)
                .unwrap_or_else(|| panic!("history row for unknown tx {}", row.txid));
            assert_eq!(
                row.height, producer.height,
                "history height must track producer confirmation"
            );
            match row.input_txid {
                None => assert_eq!(row.input_height, None),
                Some(spender) => {
                    let spender_height = state.txs.get(&spender).and_then(|tx| tx.height);
                    assert_eq!(
                        row.input_height, spender_height,
                        "input height must track spender confirmation"
                    );
                }
            }
        }
    }

    fn sorted_history(state: &StoreState) -> Vec<HistoryRow> {
        let mut rows = state.history.clone();
        rows.sort_by(|a, b| {
            (&a.address, a.txid, a.vout).cmp(&(&b.address, b.txid, b.vout))
        });
        rows
    }

    // ---------------------------------------------------------------------
    // Scenarios
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_advance_from_empty_store() {
        let h = harness().await;
        let mut rx = h.bus.subscribe();

        let cb0 = coinbase(0, &[5_000_000_000]);
        let cb1 = coinbase(1, &[5_000_000_000]);
        let cb2 = coinbase(2, &[5_000_000_000]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        let b1 = make_block(&b0.hash.0, 101, &[&cb1]);
        let b2 = make_block(&b1.hash.0, 102, &[&cb2]);
        h.node.set_chain(vec![b0.clone(), b1.clone(), b2.clone()]);

        h.sync.sync_once().await.unwrap();

        let tip = h.store.latest().await.unwrap();
        assert_eq!(tip, ChainTip { hash: b2.hash, height: 2 });

        let events = drain(&mut rx);
        let block_events: Vec<(crate::types::BlockHash, i32)> = events
            .iter()
            .filter_map(|e| match e {
                BusEvent::BroadcastBlock { hash, height } => Some((*hash, *height)),
                _ => None,
            })
            .collect();
        assert_eq!(
            block_events,
            vec![(b0.hash, 0), (b1.hash, 1), (b2.hash, 2)],
            "broadcastblock must arrive once per block, in height order"
        );
        let addblocks = events
            .iter()
            .filter(|e| matches!(e, BusEvent::AddBlock { .. }))
            .count();
        assert_eq!(addblocks, 3);

        // Coinbase inputs never touch history or the orphan pool
        assert_eq!(h.sync.orphan_count(), 0);
        let state = h.store.snapshot().await;
        assert!(state.history.iter().all(|row| row.input_txid.is_none()));
        check_invariants(&state);
    }

    #[tokio::test]
    async fn test_reorg_depth_one() {
        let h = harness().await;

        let cb0 = coinbase(0, &[5_000_000_000]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        let cb1a = coinbase(1, &[5_000_000_000]);
        let t1a = spend(&cb0, 0, 4_900_000_000, 0x77);
        let b1a = make_block(&b0.hash.0, 111, &[&cb1a, &t1a]);
        h.node.set_chain(vec![b0.clone(), b1a.clone()]);
        h.sync.sync_once().await.unwrap();

        // cb0's output is now spent by t1a at height 1
        let state = h.store.snapshot().await;
        let cb0_row = state.history.iter().find(|r| r.txid == cb0.txid).unwrap();
        assert_eq!(cb0_row.input_txid, Some(t1a.txid));
        assert_eq!(cb0_row.input_height, Some(1));

        // The node switches branches
        let mut rx = h.bus.subscribe();
        let cb1b = coinbase(3, &[5_000_000_000]);
        let cb2b = coinbase(4, &[5_000_000_000]);
        let b1b = make_block(&b0.hash.0, 211, &[&cb1b]);
        let b2b = make_block(&b1b.hash.0, 212, &[&cb2b]);
        h.node.set_chain(vec![b0.clone(), b1b.clone(), b2b.clone()]);
        h.sync.sync_once().await.unwrap();

        let tip = h.store.latest().await.unwrap();
        assert_eq!(tip, ChainTip { hash: b2b.hash, height: 2 });

        let events = drain(&mut rx);
        let removed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BusEvent::RemoveBlock { hash } => Some(*hash),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec![b1a.hash], "exactly the orphaned block is removed");
        let block_events: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BusEvent::BroadcastBlock { hash, height } => Some((*hash, *height)),
                _ => None,
            })
            .collect();
        assert_eq!(block_events, vec![(b1b.hash, 1), (b2b.hash, 2)]);

        // b1a's transactions fell out of the chain and the node's mempool,
        // so their rows are gone and cb0's output is unspent again
        let state = h.store.snapshot().await;
        assert!(state.txs.get(&t1a.txid).is_none());
        assert!(state.txs.get(&cb1a.txid).is_none());
        assert!(state.history.iter().all(|r| r.txid != t1a.txid && r.txid != cb1a.txid));
        let cb0_row = state.history.iter().find(|r| r.txid == cb0.txid).unwrap();
        assert_eq!(cb0_row.input_txid, None);
        assert_eq!(cb0_row.input_height, None);
        check_invariants(&state);
    }

    #[tokio::test]
    async fn test_orphan_child_waits_for_parent() {
        let h = harness().await;

        let cb0 = coinbase(0, &[5_000_000_000]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        h.node.set_chain(vec![b0]);
        h.sync.sync_once().await.unwrap();

        let parent = spend(&cb0, 0, 4_900_000_000, 0x50);
        let child = spend(&parent, 0, 4_800_000_000, 0x51);
        h.node.add_mempool_tx(parent.clone());
        h.node.add_mempool_tx(child.clone());

        let mut rx = h.bus.subscribe();

        // Child announced first: parked, no row written
        h.sync.import_announced_tx(child.txid).await;
        assert_eq!(h.sync.orphan_count(), 1);
        assert!(h.store.tx(&child.txid).await.unwrap().is_none());

        // Parent arrives: both import, parent first
        h.sync.import_announced_tx(parent.txid).await;
        assert_eq!(h.sync.orphan_count(), 0);
        assert!(h.store.tx(&parent.txid).await.unwrap().is_some());
        assert!(h.store.tx(&child.txid).await.unwrap().is_some());

        let added: Vec<Txid> = drain(&mut rx)
            .iter()
            .filter_map(|e| match e {
                BusEvent::AddTx { txid, unconfirmed: true } => Some(*txid),
                _ => None,
            })
            .collect();
        assert_eq!(added, vec![parent.txid, child.txid], "parent addtx precedes child");

        check_invariants(&h.store.snapshot().await);
    }

    #[tokio::test]
    async fn test_mempool_reconciliation() {
        let h = harness().await;

        let cb0 = coinbase(0, &[5_000_000_000, 100, 100, 100]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        h.node.set_chain(vec![b0]);

        let tx_a = spend(&cb0, 0, 90, 0x41);
        let tx_b = spend(&cb0, 1, 90, 0x42);
        let tx_c = spend(&cb0, 2, 90, 0x43);
        let tx_d = spend(&cb0, 3, 90, 0x44);

        h.node
            .set_mempool(vec![tx_a.clone(), tx_b.clone(), tx_c.clone()]);
        h.sync.sync_once().await.unwrap();
        for tx in [&tx_a, &tx_b, &tx_c] {
            wait_for_tx(&h.store, &tx.txid).await;
        }

        // Node mempool rotates: A vanished, D appeared
        let mut rx = h.bus.subscribe();
        h.node
            .set_mempool(vec![tx_b.clone(), tx_c.clone(), tx_d.clone()]);
        h.sync.reconcile_mempool().await.unwrap();
        wait_for_tx(&h.store, &tx_d.txid).await;

        let unconfirmed = h.store.unconfirmed_txids().await.unwrap();
        let expected: std::collections::HashSet<Txid> =
            [tx_b.txid, tx_c.txid, tx_d.txid].into_iter().collect();
        assert_eq!(unconfirmed, expected);

        let events = drain(&mut rx);
        let removes: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, BusEvent::RemoveTx { .. }))
            .collect();
        assert_eq!(removes.len(), 1);
        assert!(matches!(
            removes[0],
            BusEvent::RemoveTx { txid, unconfirmed: true } if *txid == tx_a.txid
        ));
        let adds: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, BusEvent::AddTx { .. }))
            .collect();
        assert_eq!(adds.len(), 1);
        assert!(matches!(
            adds[0],
            BusEvent::AddTx { txid, unconfirmed: true } if *txid == tx_d.txid
        ));

        check_invariants(&h.store.snapshot().await);
    }

    #[tokio::test]
    async fn test_unconfirmed_transaction_upgrades_in_place() {
        let h = harness().await;

        let cb0 = coinbase(0, &[5_000_000_000]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        h.node.set_chain(vec![b0.clone()]);
        h.sync.sync_once().await.unwrap();

        let t = spend(&cb0, 0, 4_900_000_000, 0x60);
        h.node.add_mempool_tx(t.clone());
        h.sync.import_announced_tx(t.txid).await;
        assert_eq!(
            h.store.tx(&t.txid).await.unwrap().unwrap().height,
            None,
            "starts unconfirmed"
        );

        let mut rx = h.bus.subscribe();
        let cb1 = coinbase(1, &[5_000_000_000]);
        let b1 = make_block(&b0.hash.0, 101, &[&cb1, &t]);
        h.node.set_chain(vec![b0, b1.clone()]);
        h.node.set_mempool(vec![]);
        h.sync.sync_once().await.unwrap();

        assert_eq!(h.store.tx(&t.txid).await.unwrap().unwrap().height, Some(1));
        let state = h.store.snapshot().await;
        for row in state.history.iter().filter(|r| r.txid == t.txid) {
            assert_eq!(row.height, Some(1));
        }

        let tx_events: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| {
                matches!(e, BusEvent::BroadcastTx { txid, .. } if *txid == t.txid)
            })
            .collect();
        assert_eq!(
            tx_events,
            vec![BusEvent::BroadcastTx {
                txid: t.txid,
                blockhash: Some(b1.hash),
                blockheight: Some(1),
            }],
            "exactly one confirm broadcast for the upgraded tx"
        );
        check_invariants(&state);
    }

    // ---------------------------------------------------------------------
    // Laws
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_double_block_import_leaves_store_unchanged() {
        let h = harness().await;

        let cb0 = coinbase(0, &[5_000_000_000]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        h.node.set_chain(vec![b0.clone()]);
        h.sync.sync_once().await.unwrap();

        let before = h.store.snapshot().await;

        // A second application of the same block aborts without a trace
        let mut store_tx = h.store.begin().await.unwrap();
        let mut outbox = crate::events::Outbox::new();
        let publisher = EventPublisher::new(Arc::clone(&h.bus));
        let result = crate::block_import::import_block(
            store_tx.as_mut(),
            &publisher,
            &mut outbox,
            Network::Regtest,
            &b0,
            0,
        )
        .await;
        assert!(result.is_err());
        drop(store_tx);
        drop(outbox);

        let after = h.store.snapshot().await;
        assert_eq!(before.blocks, after.blocks);
        assert_eq!(before.txs, after.txs);
        assert_eq!(before.history, after.history);
    }

    #[tokio::test]
    async fn test_reorg_round_trip_restores_original_state() {
        let h = harness().await;

        let cb0 = coinbase(0, &[5_000_000_000]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        let cb1 = coinbase(1, &[5_000_000_000]);
        let t1 = spend(&cb0, 0, 4_900_000_000, 0x70);
        let b1 = make_block(&b0.hash.0, 101, &[&cb1, &t1]);
        let cb2 = coinbase(2, &[5_000_000_000]);
        let b2 = make_block(&b1.hash.0, 102, &[&cb2]);
        let original = vec![b0.clone(), b1.clone(), b2.clone()];

        h.node.set_chain(original.clone());
        h.sync.sync_once().await.unwrap();
        let before = h.store.snapshot().await;

        // Fork at height 1, then the original branch wins again
        let cb1b = coinbase(9, &[5_000_000_000]);
        let b1b = make_block(&b0.hash.0, 201, &[&cb1b]);
        h.node.set_chain(vec![b0.clone(), b1b]);
        h.sync.sync_once().await.unwrap();

        h.node.set_chain(original);
        h.sync.sync_once().await.unwrap();

        let after = h.store.snapshot().await;
        assert_eq!(before.blocks, after.blocks);
        assert_eq!(before.txs, after.txs);
        assert_eq!(sorted_history(&before), sorted_history(&after));
        check_invariants(&after);
    }

    // ---------------------------------------------------------------------
    // Colored-coin rescanner
    // ---------------------------------------------------------------------

    fn rescanner(
        store: &Arc<MemoryStore>,
    ) -> (Arc<crate::color_rescan::ColorRescanner>, Arc<crate::color::MemoryColorStore>) {
        use crate::color::{ColorDefinition, ColorStore, EpobcDefinition, MemoryColorStore};

        let colors = Arc::new(MemoryColorStore::new());
        let definitions: Vec<Arc<dyn ColorDefinition>> =
            vec![Arc::new(EpobcDefinition::new(
                Arc::clone(&colors) as Arc<dyn ColorStore>
            ))];
        let rescanner = crate::color_rescan::ColorRescanner::new(
            Arc::clone(store) as Arc<dyn IndexStore>,
            Arc::clone(&colors) as Arc<dyn ColorStore>,
            definitions,
        );
        (rescanner, colors)
    }

    #[tokio::test]
    async fn test_color_frontier_follows_chain() {
        let h = harness().await;
        let (rescanner, colors) = rescanner(&h.store);

        let cb0 = coinbase(0, &[5_000_000_000]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        let cb1 = coinbase(1, &[5_000_000_000]);
        let b1 = make_block(&b0.hash.0, 101, &[&cb1]);
        h.node.set_chain(vec![b0, b1.clone()]);
        h.sync.sync_once().await.unwrap();

        rescanner.update_blocks().await.unwrap();

        assert_eq!(
            h.store.color_latest().await.unwrap(),
            Some((b1.hash, 1)),
            "scan frontier must reach the core tip"
        );
        for txid in [cb0.txid, cb1.txid] {
            let row = h.store.color_scanned(&txid).await.unwrap().unwrap();
            assert!(row.height.is_some());
            assert!(colors.was_scanned(&txid, "epobc"));
        }
    }

    #[tokio::test]
    async fn test_color_rescan_unwinds_after_reorg() {
        let h = harness().await;
        let (rescanner, _colors) = rescanner(&h.store);

        // Five blocks of coinbases, scanner fully caught up
        let mut blocks = Vec::new();
        let mut coinbases = Vec::new();
        let mut prev = [0u8; 32];
        for i in 0..6u32 {
            let cb = coinbase(i, &[5_000_000_000]);
            let block = make_block(&prev, 100 + i, &[&cb]);
            prev = block.hash.0;
            coinbases.push(cb);
            blocks.push(block);
        }
        h.node.set_chain(blocks.clone());
        h.sync.sync_once().await.unwrap();
        rescanner.update_blocks().await.unwrap();
        assert_eq!(
            h.store.color_latest().await.unwrap(),
            Some((blocks[5].hash, 5))
        );

        // Core reorgs back to height 3 and adopts a different block 4
        let cb4b = coinbase(14, &[5_000_000_000]);
        let b4b = make_block(&blocks[3].hash.0, 214, &[&cb4b]);
        h.node
            .set_chain(vec![
                blocks[0].clone(),
                blocks[1].clone(),
                blocks[2].clone(),
                blocks[3].clone(),
                b4b.clone(),
            ]);
        h.sync.catch_up().await.unwrap();

        rescanner.update_blocks().await.unwrap();

        // Everything above the fork was downgraded, the new branch scanned
        for txid in [coinbases[4].txid, coinbases[5].txid] {
            let row = h.store.color_scanned(&txid).await.unwrap().unwrap();
            assert_eq!(row.blockhash, None);
            assert_eq!(row.height, None);
        }
        for (i, cb) in coinbases.iter().take(4).enumerate() {
            let row = h.store.color_scanned(&cb.txid).await.unwrap().unwrap();
            assert_eq!(row.height, Some(i as i32));
        }
        let row = h.store.color_scanned(&cb4b.txid).await.unwrap().unwrap();
        assert_eq!(row.blockhash, Some(b4b.hash));
        assert_eq!(row.height, Some(4));
        assert_eq!(h.store.color_latest().await.unwrap(), Some((b4b.hash, 4)));
    }

    #[tokio::test]
    async fn test_color_remove_prefers_matching_definition() {
        let h = harness().await;
        let (rescanner, colors) = rescanner(&h.store);

        let cb0 = coinbase(0, &[5_000_000_000]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        h.node.set_chain(vec![b0]);
        h.sync.sync_once().await.unwrap();
        rescanner.add_txs(&[cb0.txid]).await;

        let id = colors.add_definition(&format!("epobc:{}:2:0", cb0.txid));
        rescanner.remove_txs(&[cb0.txid]).await;

        assert!(!colors.has_definition(id), "matching definition is dropped");
        assert!(
            colors.was_scanned(&cb0.txid, "epobc"),
            "definition drop path leaves color values alone"
        );
        assert!(h.store.color_scanned(&cb0.txid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_color_remove_without_definition_drops_values() {
        let h = harness().await;
        let (rescanner, colors) = rescanner(&h.store);

        let cb0 = coinbase(0, &[5_000_000_000]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        h.node.set_chain(vec![b0]);
        h.sync.sync_once().await.unwrap();
        rescanner.add_txs(&[cb0.txid]).await;
        assert!(colors.was_scanned(&cb0.txid, "epobc"));

        rescanner.remove_txs(&[cb0.txid]).await;

        assert!(!colors.was_scanned(&cb0.txid, "epobc"));
        assert!(h.store.color_scanned(&cb0.txid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mempool_then_block_equals_block_only() {
        // Store 1 sees the tx in the mempool first; store 2 only via block
        let h1 = harness().await;
        let h2 = harness().await;

        let cb0 = coinbase(0, &[5_000_000_000]);
        let b0 = make_block(&[0u8; 32], 100, &[&cb0]);
        let t = spend(&cb0, 0, 4_900_000_000, 0x80);
        let cb1 = coinbase(1, &[5_000_000_000]);
        let b1 = make_block(&b0.hash.0, 101, &[&cb1, &t]);

        h1.node.set_chain(vec![b0.clone()]);
        h1.sync.sync_once().await.unwrap();
        h1.node.add_mempool_tx(t.clone());
        h1.sync.import_announced_tx(t.txid).await;
        h1.node.set_chain(vec![b0.clone(), b1.clone()]);
        h1.node.set_mempool(vec![]);
        h1.sync.sync_once().await.unwrap();

        h2.node.set_chain(vec![b0, b1]);
        h2.sync.sync_once().await.unwrap();

        let s1 = h1.store.snapshot().await;
        let s2 = h2.store.snapshot().await;
        assert_eq!(s1.blocks, s2.blocks);
        assert_eq!(s1.txs, s2.txs);
        assert_eq!(sorted_history(&s1), sorted_history(&s2));
        check_invariants(&s1);
    }
}
