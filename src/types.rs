/// Core types shared across the indexer
///
/// Identifiers are fixed-width byte newtypes kept in internal (little-endian)
/// order; `Display` renders them in the reversed hex order RPC interfaces use.
/// Decoded transactions and blocks are thin views over the consensus bytes,
/// produced once at the RPC boundary so the importers never re-parse.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash as BitcoinHash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const ZERO_HASH: [u8; 32] = [0u8; 32];

/// 32-byte transaction identifier, internal byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Txid(pub [u8; 32]);

/// 32-byte block identifier, internal byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash(pub [u8; 32]);

fn fmt_reversed(bytes: &[u8; 32], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in bytes.iter().rev() {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

fn parse_reversed(s: &str) -> Result<[u8; 32], SyncError> {
    let raw = hex::decode(s).map_err(|e| SyncError::Decode(format!("bad hash hex: {}", e)))?;
    if raw.len() != 32 {
        return Err(SyncError::Decode(format!("expected 32 bytes, got {}", raw.len())));
    }
    let mut out = [0u8; 32];
    for (i, b) in raw.iter().rev().enumerate() {
        out[i] = *b;
    }
    Ok(out)
}

impl Txid {
    pub fn is_zero(&self) -> bool {
        self.0 == ZERO_HASH
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_reversed(&self.0, f)
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_reversed(&self.0, f)
    }
}

impl FromStr for Txid {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Txid(parse_reversed(s)?))
    }
}

impl Serialize for Txid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Txid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl BlockHash {
    pub fn zero() -> Self {
        BlockHash(ZERO_HASH)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == ZERO_HASH
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_reversed(&self.0, f)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_reversed(&self.0, f)
    }
}

impl FromStr for BlockHash {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(BlockHash(parse_reversed(s)?))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Chain cursor: hash and height of a chain tip.
///
/// An empty chain is `{ zero hash, -1 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: i32,
}

impl ChainTip {
    pub fn empty() -> Self {
        ChainTip {
            hash: BlockHash::zero(),
            height: -1,
        }
    }
}

/// One transaction input, reduced to the outpoint the indexer needs.
#[derive(Debug, Clone)]
pub struct TxInput {
    pub prev_txid: Txid,
    pub prev_vout: u32,
}

impl TxInput {
    /// Coinbase inputs have an all-zero prev hash and index 0xFFFFFFFF.
    pub fn is_coinbase(&self) -> bool {
        self.prev_txid.is_zero() && self.prev_vout == u32::MAX
    }
}

/// One transaction output: value plus locking script.
#[derive(Debug, Clone)]
pub struct TxOutput {
    pub value: i64,
    pub script: Vec<u8>,
}

/// A decoded transaction together with its consensus bytes.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub txid: Txid,
    pub raw: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn from_raw(raw: &[u8]) -> Result<Self, SyncError> {
        let tx: bitcoin::Transaction = deserialize(raw)
            .map_err(|e| SyncError::Decode(format!("transaction decode failed: {}", e)))?;
        Ok(Self::from_decoded(&tx, raw.to_vec()))
    }

    fn from_decoded(tx: &bitcoin::Transaction, raw: Vec<u8>) -> Self {
        let inputs = tx
            .input
            .iter()
            .map(|txin| TxInput {
                prev_txid: Txid(txin.previous_output.txid.into_inner()),
                prev_vout: txin.previous_output.vout,
            })
            .collect();
        let outputs = tx
            .output
            .iter()
            .map(|txout| TxOutput {
                value: txout.value as i64,
                script: txout.script_pubkey.to_bytes(),
            })
            .collect();
        Transaction {
            txid: Txid(tx.txid().into_inner()),
            raw,
            inputs,
            outputs,
        }
    }

    /// Distinct parent txids, excluding coinbase inputs.
    pub fn parent_txids(&self) -> HashSet<Txid> {
        self.inputs
            .iter()
            .filter(|i| !i.is_coinbase())
            .map(|i| i.prev_txid)
            .collect()
    }
}

/// A decoded block: identity, linkage, 80-byte header, transactions.
#[derive(Debug, Clone)]
pub struct Block {
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub header: Vec<u8>,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn from_raw(raw: &[u8]) -> Result<Self, SyncError> {
        let block: bitcoin::Block = deserialize(raw)
            .map_err(|e| SyncError::Decode(format!("block decode failed: {}", e)))?;
        let txs = block
            .txdata
            .iter()
            .map(|tx| Transaction::from_decoded(tx, serialize(tx)))
            .collect();
        Ok(Block {
            hash: BlockHash(block.header.block_hash().into_inner()),
            prev_hash: BlockHash(block.header.prev_blockhash.into_inner()),
            header: serialize(&block.header),
            txs,
        })
    }

    pub fn txids(&self) -> Vec<Txid> {
        self.txs.iter().map(|tx| tx.txid).collect()
    }
}

/// Crate-wide error type.
///
/// `NotFound` and `Consistency` are separate variants so callers can decide
/// between per-item skip, transaction abort, and loop restart.
#[derive(Debug)]
pub enum SyncError {
    /// Node RPC failure (transport, timeout, error response).
    Rpc(String),
    /// Storage failure.
    Storage(String),
    /// A referenced object the node or store should have had.
    NotFound { kind: &'static str, id: String },
    /// The node's answers stopped making sense against stored state.
    Consistency(String),
    /// Colored-coin definition or data failure.
    Color(String),
    /// Bad or missing configuration.
    Config(String),
    /// Malformed consensus bytes or identifiers.
    Decode(String),
}

impl SyncError {
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        SyncError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Rpc(msg) => write!(f, "rpc error: {}", msg),
            SyncError::Storage(msg) => write!(f, "storage error: {}", msg),
            SyncError::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            SyncError::Consistency(msg) => write!(f, "consistency error: {}", msg),
            SyncError::Color(msg) => write!(f, "color error: {}", msg),
            SyncError::Config(msg) => write!(f, "config error: {}", msg),
            SyncError::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {}
