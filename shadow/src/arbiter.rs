use crate::{
    agents::ExecutionAgent,
    attributes::{SlotAttributes, ATTR_PARALLEL_SHUTDOWN_POLICY},
    peer::{PeerHandle, PeerState},
    reason::{ExitReason, ExitStatus},
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tracing::{debug, info, warn};

/// When the job as a whole is considered finished
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    #[default]
    #[serde(rename = "WAIT_FOR_NODE0")]
    WaitForNode0,
    #[serde(rename = "WAIT_FOR_ALL")]
    WaitForAll,
}

impl FromStr for ShutdownPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "WAIT_FOR_NODE0" => Ok(Self::WaitForNode0),
            "WAIT_FOR_ALL" => Ok(Self::WaitForAll),
            _ => Err(value.to_owned()),
        }
    }
}

impl fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WaitForNode0 => "WAIT_FOR_NODE0",
            Self::WaitForAll => "WAIT_FOR_ALL",
        })
    }
}

impl ShutdownPolicy {
    pub fn from_attributes(attributes: &SlotAttributes) -> Self {
        attributes
            .get_str(ATTR_PARALLEL_SHUTDOWN_POLICY)
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }

    /// peers still in PRE never hold the job back
    pub fn is_done(self, peers: &[PeerHandle]) -> bool {
        match self {
            Self::WaitForAll => peers
                .iter()
                .all(|peer| matches!(peer.state(), PeerState::Finished | PeerState::Pre)),
            Self::WaitForNode0 => peers
                .first()
                .map_or(true, |peer| peer.state() == PeerState::Finished),
        }
    }
}

/// Decides from all peer states whether, and how, the job ends
#[derive(Debug, Default)]
pub struct ShutdownArbiter {
    policy: ShutdownPolicy,
    shutting_down: bool,
    frozen: Option<ExitStatus>,
    reported: bool,
}

impl ShutdownArbiter {
    pub fn new(policy: ShutdownPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> ShutdownPolicy {
        self.policy
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn frozen_exit(&self) -> Option<ExitStatus> {
        self.frozen
    }

    pub fn is_reported(&self) -> bool {
        self.reported
    }

    fn freeze(&mut self, proposed: ExitStatus) {
        if !self.shutting_down {
            self.shutting_down = true;
            self.frozen = Some(proposed);
        }
    }

    fn hard_kill<A: ExecutionAgent>(peers: &mut [PeerHandle], agent: &mut A) {
        for peer in peers.iter_mut().filter(|peer| peer.state().is_running()) {
            if let Err(error) = peer.kill_starter(agent, false) {
                warn!(error = ?error, "Failed to kill node {}: {error}", peer.node());
            }
        }
    }

    /// Weigh a proposed outcome against all peers, returns the job-level status exactly once
    pub fn evaluate<A: ExecutionAgent>(
        &mut self,
        peers: &mut [PeerHandle],
        agent: &mut A,
        proposed: ExitStatus,
    ) -> Option<ExitStatus> {
        if self.reported {
            debug!("Outcome already reported, ignoring {:?}", proposed.reason);
            return None;
        }

        if proposed.reason.is_immediate()
            || peers.iter().all(|peer| peer.state() == PeerState::Pre)
        {
            info!("Job ends right away: {}", proposed.reason);
            self.freeze(proposed);
            Self::hard_kill(peers, agent);

            let status = self.frozen.unwrap_or(proposed);
            for peer in peers.iter_mut() {
                peer.finish_with(status);
            }
            self.reported = true;

            return Some(status);
        }

        if !proposed.is_normal() && !self.shutting_down {
            warn!(
                "Abnormal exit ({}), shutting down all nodes",
                proposed.reason
            );
            self.freeze(proposed);
            Self::hard_kill(peers, agent);
        }

        let done = self.policy.is_done(peers);

        // nothing starts PRE peers once the job winds down
        if done || self.shutting_down {
            for peer in peers
                .iter_mut()
                .filter(|peer| peer.state() == PeerState::Pre)
            {
                peer.finish_with(ExitStatus::with_reason(ExitReason::NotStarted));
            }
        }

        if !done {
            debug!("Job not done yet under {}", self.policy);
            return None;
        }

        self.reported = true;

        Some(match self.frozen {
            Some(frozen) => frozen,
            None => peers
                .first()
                .and_then(PeerHandle::exit)
                .unwrap_or(proposed),
        })
    }
}
