/// Typed indexer events and their publication discipline
///
/// Every event knows its bus channel. Publications tied to a store
/// transaction are staged in an `Outbox` and flushed only after the commit
/// succeeds, so subscribers can never observe rows that were rolled back.
/// Flush preserves append order, which keeps block events in height order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::types::{BlockHash, Txid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Success,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusEvent {
    SendTxResponse {
        id: String,
        status: TxStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    BroadcastBlock {
        hash: BlockHash,
        height: i32,
    },
    BroadcastTx {
        txid: Txid,
        #[serde(skip_serializing_if = "Option::is_none")]
        blockhash: Option<BlockHash>,
        #[serde(skip_serializing_if = "Option::is_none")]
        blockheight: Option<i32>,
    },
    BroadcastAddress {
        address: String,
        txid: Txid,
        #[serde(skip_serializing_if = "Option::is_none")]
        blockhash: Option<BlockHash>,
        #[serde(skip_serializing_if = "Option::is_none")]
        blockheight: Option<i32>,
    },
    BroadcastStatus {
        status: serde_json::Value,
    },
    AddTx {
        txid: Txid,
        unconfirmed: bool,
    },
    RemoveTx {
        txid: Txid,
        unconfirmed: bool,
    },
    AddBlock {
        hash: BlockHash,
    },
    RemoveBlock {
        hash: BlockHash,
    },
}

impl BusEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            BusEvent::SendTxResponse { .. } => "sendtxresponse",
            BusEvent::BroadcastBlock { .. } => "broadcastblock",
            BusEvent::BroadcastTx { .. } => "broadcasttx",
            BusEvent::BroadcastAddress { .. } => "broadcastaddress",
            BusEvent::BroadcastStatus { .. } => "broadcaststatus",
            BusEvent::AddTx { .. } => "addtx",
            BusEvent::RemoveTx { .. } => "removetx",
            BusEvent::AddBlock { .. } => "addblock",
            BusEvent::RemoveBlock { .. } => "removeblock",
        }
    }
}

/// Events staged during a store transaction, delivered on commit.
#[derive(Debug, Default)]
pub struct Outbox {
    events: Vec<BusEvent>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: BusEvent) {
        self.events.push(event);
    }
}

/// Normalization hook for outbound free-text messages: strips control
/// characters so downstream wire formats never see raw newlines or escapes.
pub fn normalize_message(message: &str) -> String {
    message.chars().filter(|c| !c.is_control()).collect()
}

/// Typed publication facade over the bus.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<EventBus>,
}

impl EventPublisher {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Deliver everything staged for a transaction that just committed.
    pub fn flush(&self, outbox: Outbox) {
        for event in outbox.events {
            self.bus.notify(event);
        }
    }

    /// Immediate response to a transaction submission; `id` correlates the
    /// response to the request.
    pub fn send_tx_response(&self, id: &str, result: Result<(), (i32, String)>) {
        let event = match result {
            Ok(()) => BusEvent::SendTxResponse {
                id: id.to_string(),
                status: TxStatus::Success,
                code: None,
                message: None,
            },
            Err((code, message)) => BusEvent::SendTxResponse {
                id: id.to_string(),
                status: TxStatus::Fail,
                code: Some(code),
                message: Some(normalize_message(&message)),
            },
        };
        self.bus.notify(event);
    }

    pub fn broadcast_status(&self, status: serde_json::Value) {
        self.bus.notify(BusEvent::BroadcastStatus { status });
    }

    pub fn broadcast_block(&self, outbox: &mut Outbox, hash: BlockHash, height: i32) {
        outbox.push(BusEvent::BroadcastBlock { hash, height });
    }

    pub fn broadcast_tx(&self, outbox: &mut Outbox, txid: Txid, block: Option<(BlockHash, i32)>) {
        outbox.push(BusEvent::BroadcastTx {
            txid,
            blockhash: block.map(|(hash, _)| hash),
            blockheight: block.map(|(_, height)| height),
        });
    }

    pub fn broadcast_address(
        &self,
        outbox: &mut Outbox,
        address: &str,
        txid: Txid,
        block: Option<(BlockHash, i32)>,
    ) {
        outbox.push(BusEvent::BroadcastAddress {
            address: address.to_string(),
            txid,
            blockhash: block.map(|(hash, _)| hash),
            blockheight: block.map(|(_, height)| height),
        });
    }

    pub fn add_tx(&self, outbox: &mut Outbox, txid: Txid, unconfirmed: bool) {
        outbox.push(BusEvent::AddTx { txid, unconfirmed });
    }

    pub fn remove_tx(&self, outbox: &mut Outbox, txid: Txid, unconfirmed: bool) {
        outbox.push(BusEvent::RemoveTx { txid, unconfirmed });
    }

    pub fn add_block(&self, outbox: &mut Outbox, hash: BlockHash) {
        outbox.push(BusEvent::AddBlock { hash });
    }

    pub fn remove_block(&self, outbox: &mut Outbox, hash: BlockHash) {
        outbox.push(BusEvent::RemoveBlock { hash });
    }
}
