pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::{
    attributes::{AttrValue, SlotAttributes},
    config::{ConfigErrors, StoreConfig},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("SQLite query failed")]
    SQLite(#[from] rusqlite::Error),
    #[error("Failed to (de)serialize attribute value")]
    Value(#[from] serde_yaml::Error),
    #[error("Stored node index {0} is invalid")]
    InvalidNode(i64),
}

/// Everything needed to reattach to a node after a restart
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub node: usize,
    pub address: String,
    pub claim_id: String,
    pub attributes: SlotAttributes,
}

/// Persistent job-level and per-node attributes, `node == None` addresses the job itself
pub trait JobStore {
    fn record_peer(&mut self, peer: &PeerRecord) -> Result<(), StoreError>;

    /// all recorded peers in rank order, with their latest attributes
    fn load_peers(&self) -> Result<Vec<PeerRecord>, StoreError>;

    fn update_attr(
        &mut self,
        node: Option<usize>,
        name: &str,
        value: &AttrValue,
    ) -> Result<(), StoreError>;

    fn lookup_attr(&self, node: Option<usize>, name: &str)
        -> Result<Option<AttrValue>, StoreError>;
}

#[derive(Debug)]
pub enum StoreAdapters {
    Memory(memory::MemoryStore),
    #[cfg(feature = "sqlite")]
    SQLite(sqlite::SQLiteStore),
}

impl StoreAdapters {
    #[cfg_attr(not(feature = "sqlite"), allow(unused_variables))]
    pub fn load(config: &StoreConfig, cluster: i64, proc: i64) -> Result<Self, ConfigErrors> {
        match config.name.as_str() {
            "memory" => Ok(Self::Memory(memory::MemoryStore::default())),
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let mut store = sqlite::SQLiteStore::load(&config.path, cluster, proc)?;
                store.init()?;

                Ok(Self::SQLite(store))
            }
            _ => Err(ConfigErrors::UnsupportedStore(config.name.clone())),
        }
    }

    pub fn close(self) -> Result<(), StoreError> {
        match self {
            Self::Memory(_) => Ok(()),
            #[cfg(feature = "sqlite")]
            Self::SQLite(store) => store.close(),
        }
    }
}

impl JobStore for StoreAdapters {
    fn record_peer(&mut self, peer: &PeerRecord) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.record_peer(peer),
            #[cfg(feature = "sqlite")]
            Self::SQLite(store) => store.record_peer(peer),
        }
    }

    fn load_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        match self {
            Self::Memory(store) => store.load_peers(),
            #[cfg(feature = "sqlite")]
            Self::SQLite(store) => store.load_peers(),
        }
    }

    fn update_attr(
        &mut self,
        node: Option<usize>,
        name: &str,
        value: &AttrValue,
    ) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.update_attr(node, name, value),
            #[cfg(feature = "sqlite")]
            Self::SQLite(store) => store.update_attr(node, name, value),
        }
    }

    fn lookup_attr(
        &self,
        node: Option<usize>,
        name: &str,
    ) -> Result<Option<AttrValue>, StoreError> {
        match self {
            Self::Memory(store) => store.lookup_attr(node, name),
            #[cfg(feature = "sqlite")]
            Self::SQLite(store) => store.lookup_attr(node, name),
        }
    }
}
