use super::{JobStore, PeerRecord, StoreError};
use crate::attributes::{AttrValue, SlotAttributes};
use std::collections::BTreeMap;

/// Job store that forgets everything with the process
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    peers: BTreeMap<usize, PeerRecord>,
    job: SlotAttributes,
}

impl JobStore for MemoryStore {
    fn record_peer(&mut self, peer: &PeerRecord) -> Result<(), StoreError> {
        self.peers.insert(peer.node, peer.clone());

        Ok(())
    }

    fn load_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        Ok(self.peers.values().cloned().collect())
    }

    fn update_attr(
        &mut self,
        node: Option<usize>,
        name: &str,
        value: &AttrValue,
    ) -> Result<(), StoreError> {
        match node {
            None => self.job.set(name, value.clone()),
            Some(node) => match self.peers.get_mut(&node) {
                Some(peer) => peer.attributes.set(name, value.clone()),
                None => return Err(StoreError::InvalidNode(node as i64)),
            },
        }

        Ok(())
    }

    fn lookup_attr(
        &self,
        node: Option<usize>,
        name: &str,
    ) -> Result<Option<AttrValue>, StoreError> {
        Ok(match node {
            None => self.job.get(name).cloned(),
            Some(node) => self
                .peers
                .get(&node)
                .and_then(|peer| peer.attributes.get(name))
                .cloned(),
        })
    }
}
