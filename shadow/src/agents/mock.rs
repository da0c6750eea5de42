use super::{AgentError, ClaimRef, ExecutionAgent};
use crate::attributes::SlotAttributes;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Activate(usize),
    Reconnect(usize),
    Deactivate { node: usize, graceful: bool },
    Suspend(usize),
    Continue(usize),
}

/// Scripted reply to a reconnect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReply {
    Accept,
    Transient,
    Gone,
}

/// Agent recording every request, with scripted failures
#[derive(Debug)]
pub struct RecordingAgent {
    pub calls: Vec<Call>,
    pub activated: Vec<(usize, SlotAttributes)>,
    pub refuse_activation: BTreeSet<usize>,
    pub try_again: BTreeMap<usize, usize>,
    pub reconnect_replies: BTreeMap<usize, VecDeque<ReconnectReply>>,
    pub fail_deactivate: bool,
    pub fail_suspend: BTreeSet<usize>,
    pub reconnect_supported: bool,
    pub cleaned_up: bool,
}

impl Default for RecordingAgent {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            activated: Vec::new(),
            refuse_activation: BTreeSet::new(),
            try_again: BTreeMap::new(),
            reconnect_replies: BTreeMap::new(),
            fail_deactivate: false,
            fail_suspend: BTreeSet::new(),
            reconnect_supported: true,
            cleaned_up: false,
        }
    }
}

impl RecordingAgent {
    pub fn activations(&self) -> Vec<usize> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Activate(node) => Some(*node),
                _ => None,
            })
            .collect()
    }

    pub fn kills(&self) -> Vec<usize> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Deactivate { node, .. } => Some(*node),
                _ => None,
            })
            .collect()
    }

    pub fn attributes_of(&self, node: usize) -> Option<&SlotAttributes> {
        self.activated
            .iter()
            .rev()
            .find(|(activated, _)| *activated == node)
            .map(|(_, attributes)| attributes)
    }
}

impl ExecutionAgent for RecordingAgent {
    fn activate_claim(
        &mut self,
        claim: &ClaimRef,
        attributes: &SlotAttributes,
    ) -> Result<(), AgentError> {
        self.calls.push(Call::Activate(claim.node));

        if let Some(remaining) = self.try_again.get_mut(&claim.node) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AgentError::TryAgain);
            }
        }

        if self.refuse_activation.contains(&claim.node) {
            return Err(AgentError::Refused(claim.address.clone()));
        }

        self.activated.push((claim.node, attributes.clone()));

        Ok(())
    }

    fn reconnect(&mut self, claim: &ClaimRef) -> Result<(), AgentError> {
        self.calls.push(Call::Reconnect(claim.node));

        let reply = self
            .reconnect_replies
            .get_mut(&claim.node)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ReconnectReply::Accept);

        match reply {
            ReconnectReply::Accept => Ok(()),
            ReconnectReply::Transient => Err(AgentError::Unreachable {
                address: claim.address.clone(),
                reason: "connection refused".to_owned(),
            }),
            ReconnectReply::Gone => Err(AgentError::StarterNotFound),
        }
    }

    fn deactivate_claim(&mut self, claim: &ClaimRef, graceful: bool) -> Result<(), AgentError> {
        self.calls.push(Call::Deactivate {
            node: claim.node,
            graceful,
        });

        if self.fail_deactivate {
            Err(AgentError::Unreachable {
                address: claim.address.clone(),
                reason: "connection reset".to_owned(),
            })
        } else {
            Ok(())
        }
    }

    fn suspend_claim(&mut self, claim: &ClaimRef) -> Result<(), AgentError> {
        self.calls.push(Call::Suspend(claim.node));

        if self.fail_suspend.contains(&claim.node) {
            Err(AgentError::StarterNotFound)
        } else {
            Ok(())
        }
    }

    fn continue_claim(&mut self, claim: &ClaimRef) -> Result<(), AgentError> {
        self.calls.push(Call::Continue(claim.node));

        Ok(())
    }

    fn supports_reconnect(&self) -> bool {
        self.reconnect_supported
    }

    fn cleanup(&mut self) {
        self.cleaned_up = true;
    }
}
