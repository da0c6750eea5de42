use crate::attributes::{SlotAttributes, ATTR_MAX_HOSTS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MatchError {
    #[error("No slots were matched to the job")]
    NoMatches,
    #[error("Rank 0 was matched to claim {found}, expected {expected}")]
    ClaimMismatch { expected: String, found: String },
    #[error("Proc group {group} has no {ATTR_MAX_HOSTS} attribute")]
    MissingMaxHosts { group: usize },
    #[error("Wrong number of slots in proc group {group}: expected {expected}, got {got}")]
    WrongSlotCount {
        group: usize,
        expected: i64,
        got: usize,
    },
    #[error("Match source is unavailable: {0}")]
    Unavailable(String),
}

/// One slot the scheduler paired with a node
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SlotMatch {
    pub address: String,
    pub claim_id: String,
    #[serde(default)]
    pub attributes: SlotAttributes,
}

/// All slots matched for one proc of the job
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct ProcGroup {
    pub slots: Vec<SlotMatch>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct MatchReply {
    pub groups: Vec<ProcGroup>,
}

impl MatchReply {
    /// slots for ranks 1..N in rank order, rank 0's own slot is dropped
    pub fn into_peer_slots(self) -> Result<Vec<SlotMatch>, MatchError> {
        if self.groups.first().map_or(true, |group| group.slots.is_empty()) {
            return Err(MatchError::NoMatches);
        }

        let mut slots = Vec::new();

        for (group_index, group) in self.groups.into_iter().enumerate() {
            let count = group.slots.len();

            for (slot_index, slot) in group.slots.into_iter().enumerate() {
                if group_index == 0 && slot_index == 0 {
                    debug!("Skipping rank 0's own slot {}", slot.claim_id);
                    continue;
                }

                let expected = slot
                    .attributes
                    .get_int(ATTR_MAX_HOSTS)
                    .ok_or(MatchError::MissingMaxHosts { group: group_index })?;

                if expected != count as i64 {
                    error!(
                        "Wrong number of slots in proc group {group_index}: {ATTR_MAX_HOSTS} is {expected} but {count} were matched"
                    );
                    return Err(MatchError::WrongSlotCount {
                        group: group_index,
                        expected,
                        got: count,
                    });
                }

                slots.push(slot);
            }
        }

        Ok(slots)
    }
}

/// Where the coordinator learns which slots the job was matched to
pub trait MatchSource {
    fn give_matches(&mut self, cluster: i64, claim_id: &str) -> Result<MatchReply, MatchError>;
}

/// Match source answering from a fixed list, every slot record is derived from the job's record
#[derive(Debug, Clone)]
pub struct StaticMatches {
    groups: Vec<ProcGroup>,
    base: SlotAttributes,
}

impl StaticMatches {
    pub fn new(groups: Vec<ProcGroup>, base: SlotAttributes) -> Self {
        Self { groups, base }
    }
}

impl MatchSource for StaticMatches {
    fn give_matches(&mut self, cluster: i64, claim_id: &str) -> Result<MatchReply, MatchError> {
        let first = self
            .groups
            .first()
            .and_then(|group| group.slots.first())
            .ok_or(MatchError::NoMatches)?;

        if first.claim_id != claim_id {
            return Err(MatchError::ClaimMismatch {
                expected: first.claim_id.clone(),
                found: claim_id.to_owned(),
            });
        }

        debug!(cluster = cluster, "Answering match query for {claim_id}");

        let groups = self
            .groups
            .iter()
            .map(|group| ProcGroup {
                slots: group
                    .slots
                    .iter()
                    .map(|slot| {
                        let mut attributes = self.base.clone();
                        attributes.overlay(&slot.attributes);
                        if !attributes.contains(ATTR_MAX_HOSTS) {
                            attributes.set(ATTR_MAX_HOSTS, group.slots.len());
                        }

                        SlotMatch {
                            attributes,
                            ..slot.clone()
                        }
                    })
                    .collect(),
            })
            .collect();

        Ok(MatchReply { groups })
    }
}
