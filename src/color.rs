/// Colored-coin definition plug-ins
///
/// The definition and data libraries live outside this crate; `ColorStore`
/// is the handle to them. Each supported coloring scheme registers a
/// `ColorDefinition`, and everything scheme-specific (including how a stored
/// definition descriptor is recognized) hangs off that trait rather than off
/// branches in the rescanner.

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{SyncError, Transaction, Txid};

/// Raw-transaction lookup handed to scan routines so they can trace input
/// colors through the core transaction table.
#[async_trait]
pub trait TxSource: Send + Sync {
    async fn raw_tx(&self, txid: &Txid) -> Result<Vec<u8>, SyncError>;
}

/// External color definition / color data storage.
#[async_trait]
pub trait ColorStore: Send + Sync {
    /// Registered color definitions as (id, descriptor) pairs.
    async fn definitions(&self) -> Result<Vec<(u64, String)>, SyncError>;
    async fn drop_definition(&self, id: u64) -> Result<(), SyncError>;
    /// Run the library's full scan of one transaction for one scheme.
    async fn scan_tx(
        &self,
        kind: &str,
        tx: &Transaction,
        source: &dyn TxSource,
    ) -> Result<(), SyncError>;
    async fn remove_color_values(&self, txid: &Txid, kind: &str) -> Result<(), SyncError>;
}

#[async_trait]
pub trait ColorDefinition: Send + Sync {
    fn kind(&self) -> &'static str;
    /// Whether a stored definition descriptor is this scheme's definition
    /// for the given transaction.
    fn matches_definition(&self, descriptor: &str, txid: &Txid) -> bool;
    async fn scan_tx(&self, tx: &Transaction, source: &dyn TxSource) -> Result<(), SyncError>;
}

/// EPOBC coloring scheme. Definition descriptors look like
/// `epobc:{txid}:{n}:0`.
pub struct EpobcDefinition {
    colors: Arc<dyn ColorStore>,
}

impl EpobcDefinition {
    pub fn new(colors: Arc<dyn ColorStore>) -> Self {
        Self { colors }
    }
}

#[async_trait]
impl ColorDefinition for EpobcDefinition {
    fn kind(&self) -> &'static str {
        "epobc"
    }

    fn matches_definition(&self, descriptor: &str, txid: &Txid) -> bool {
        let parts: Vec<&str> = descriptor.split(':').collect();
        parts.len() == 4
            && parts[0] == "epobc"
            && parts[1] == txid.to_string()
            && parts[2].parse::<u64>().is_ok()
            && parts[3] == "0"
    }

    async fn scan_tx(&self, tx: &Transaction, source: &dyn TxSource) -> Result<(), SyncError> {
        self.colors.scan_tx("epobc", tx, source).await
    }
}

/// In-memory color store, standing in for the external libraries in tests
/// and the dev profile.
#[derive(Default)]
pub struct MemoryColorStore {
    inner: std::sync::Mutex<ColorData>,
}

#[derive(Default)]
struct ColorData {
    next_id: u64,
    definitions: std::collections::HashMap<u64, String>,
    scanned: std::collections::HashSet<(Txid, String)>,
}

#[allow(dead_code)] // Seeding and inspection surface for tests
impl MemoryColorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_definition(&self, descriptor: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.definitions.insert(id, descriptor.to_string());
        id
    }

    pub fn has_definition(&self, id: u64) -> bool {
        self.inner.lock().unwrap().definitions.contains_key(&id)
    }

    pub fn was_scanned(&self, txid: &Txid, kind: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .scanned
            .contains(&(*txid, kind.to_string()))
    }
}

#[async_trait]
impl ColorStore for MemoryColorStore {
    async fn definitions(&self) -> Result<Vec<(u64, String)>, SyncError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .definitions
            .iter()
            .map(|(id, desc)| (*id, desc.clone()))
            .collect())
    }

    async fn drop_definition(&self, id: u64) -> Result<(), SyncError> {
        self.inner.lock().unwrap().definitions.remove(&id);
        Ok(())
    }

    async fn scan_tx(
        &self,
        kind: &str,
        tx: &Transaction,
        _source: &dyn TxSource,
    ) -> Result<(), SyncError> {
        self.inner
            .lock()
            .unwrap()
            .scanned
            .insert((tx.txid, kind.to_string()));
        Ok(())
    }

    async fn remove_color_values(&self, txid: &Txid, kind: &str) -> Result<(), SyncError> {
        self.inner
            .lock()
            .unwrap()
            .scanned
            .remove(&(*txid, kind.to_string()));
        Ok(())
    }
}
