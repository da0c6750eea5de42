use crate::{
    agents::{AgentError, ClaimRef, ExecutionAgent},
    attributes::{
        SlotAttributes, ATTR_JOB_CURRENT_START_DATE, ATTR_JOB_CURRENT_START_EXECUTING_DATE,
    },
    config::ActivationConfig,
    reason::{ExitReason, ExitStatus},
    reconnect::began_execution,
    usage::{RemoteJobState, UsageSample, UsageUpdate},
};
use serde::{Deserialize, Serialize};
use std::{fmt, thread};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Pre,
    Startup,
    Executing,
    PendingDeath,
    Finished,
    Reconnecting,
}

impl PeerState {
    pub fn can_advance_to(self, next: PeerState) -> bool {
        use PeerState::*;

        matches!(
            (self, next),
            (Pre, Startup)
                | (Pre, Finished)
                | (Startup, Executing)
                | (Startup, PendingDeath)
                | (Startup, Finished)
                | (Startup, Reconnecting)
                | (Executing, PendingDeath)
                | (Executing, Finished)
                | (Executing, Reconnecting)
                | (PendingDeath, Finished)
                | (Reconnecting, Startup)
                | (Reconnecting, Executing)
                | (Reconnecting, Finished)
        )
    }

    /// a payload may be running and can be told to stop
    pub fn is_running(self) -> bool {
        matches!(self, Self::Startup | Self::Executing)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pre => "PRE",
            Self::Startup => "STARTUP",
            Self::Executing => "EXECUTING",
            Self::PendingDeath => "PENDING_DEATH",
            Self::Finished => "FINISHED",
            Self::Reconnecting => "RECONNECTING",
        })
    }
}

/// How the ranks of a job find each other
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStyle {
    /// rank 0 publishes an address which is pushed to every other rank
    Rendezvous,
    /// rank 0's launcher is intercepted, one peer per launch attempt
    Intercepted,
    /// no dependency between ranks
    Parallel,
}

impl LaunchStyle {
    pub fn supports_reconnect(self) -> bool {
        self == Self::Parallel
    }
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("node {node}: illegal transition from {from} to {to}")]
    IllegalTransition {
        node: usize,
        from: PeerState,
        to: PeerState,
    },
    #[error("node {node}: {operation} is not valid in state {state}")]
    InvalidState {
        node: usize,
        operation: &'static str,
        state: PeerState,
    },
    #[error("node {node}: execution agent request failed")]
    Agent {
        node: usize,
        #[source]
        source: AgentError,
    },
}

impl PeerError {
    pub fn agent_error(&self) -> Option<&AgentError> {
        match self {
            Self::Agent { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// What became of a kill request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillRequest {
    Requested,
    /// the agent did not confirm, the peer is considered dying anyway
    Unacknowledged,
    /// a kill was already sent before
    AlreadyPending,
}

/// One claim on one execution slot for one rank
#[derive(Debug, Clone)]
pub struct PeerHandle {
    node: usize,
    state: PeerState,
    launch: LaunchStyle,
    claim: ClaimRef,
    attributes: SlotAttributes,
    exit: Option<ExitStatus>,
    kill_requested: bool,
    suspended: bool,
    usage: UsageSample,
}

impl PeerHandle {
    pub fn new(
        node: usize,
        address: String,
        claim_id: String,
        attributes: SlotAttributes,
        launch: LaunchStyle,
    ) -> Self {
        Self {
            node,
            state: PeerState::Pre,
            launch,
            claim: ClaimRef {
                node,
                address,
                claim_id,
            },
            attributes,
            exit: None,
            kill_requested: false,
            suspended: false,
            usage: UsageSample::default(),
        }
    }

    /// a peer restored from the job store after a coordinator restart
    pub fn restored(
        node: usize,
        address: String,
        claim_id: String,
        attributes: SlotAttributes,
        launch: LaunchStyle,
    ) -> Self {
        Self {
            state: PeerState::Reconnecting,
            ..Self::new(node, address, claim_id, attributes, launch)
        }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn launch(&self) -> LaunchStyle {
        self.launch
    }

    pub fn claim(&self) -> &ClaimRef {
        &self.claim
    }

    pub fn attributes(&self) -> &SlotAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut SlotAttributes {
        &mut self.attributes
    }

    pub fn exit(&self) -> Option<ExitStatus> {
        self.exit
    }

    pub fn usage(&self) -> &UsageSample {
        &self.usage
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn advance(&mut self, next: PeerState) -> Result<(), PeerError> {
        if !self.state.can_advance_to(next) {
            return Err(PeerError::IllegalTransition {
                node: self.node,
                from: self.state,
                to: next,
            });
        }

        info!(
            node = self.node,
            "Resource changing state from {} to {}", self.state, next
        );
        self.state = next;

        Ok(())
    }

    fn require(&self, operation: &'static str, valid: bool) -> Result<(), PeerError> {
        if valid {
            Ok(())
        } else {
            Err(PeerError::InvalidState {
                node: self.node,
                operation,
                state: self.state,
            })
        }
    }

    /// ask the agent to run this node's payload, "try again" replies are retried
    pub fn activate_claim<A: ExecutionAgent>(
        &mut self,
        agent: &mut A,
        retry: &ActivationConfig,
    ) -> Result<(), PeerError> {
        self.require("activate_claim", self.state == PeerState::Pre)?;

        let mut attempts = 0;

        loop {
            match agent.activate_claim(&self.claim, &self.attributes) {
                Ok(()) => break,
                Err(AgentError::TryAgain) if attempts < retry.max_retries => {
                    attempts += 1;
                    info!(
                        node = self.node,
                        "Request to run on {} was DELAYED, previous job still being vacated. Trying again ({attempts}/{})",
                        self.claim.address,
                        retry.max_retries
                    );
                    thread::sleep(retry.delay());
                }
                Err(source) => {
                    return Err(PeerError::Agent {
                        node: self.node,
                        source,
                    })
                }
            }
        }

        self.advance(PeerState::Startup)
    }

    /// reattach to a payload started by a previous coordinator, returns the resulting state
    pub fn reconnect<A: ExecutionAgent>(&mut self, agent: &mut A) -> Result<PeerState, PeerError> {
        self.require("reconnect", self.state == PeerState::Reconnecting)?;

        agent
            .reconnect(&self.claim)
            .map_err(|source| PeerError::Agent {
                node: self.node,
                source,
            })?;

        let next = if began_execution(
            self.attributes
                .get_int(ATTR_JOB_CURRENT_START_EXECUTING_DATE),
            self.attributes.get_int(ATTR_JOB_CURRENT_START_DATE),
        ) {
            PeerState::Executing
        } else {
            PeerState::Startup
        };
        self.advance(next)?;

        Ok(next)
    }

    pub fn kill_starter<A: ExecutionAgent>(
        &mut self,
        agent: &mut A,
        graceful: bool,
    ) -> Result<KillRequest, PeerError> {
        if self.state == PeerState::PendingDeath {
            debug!(node = self.node, "Kill already pending");
            return Ok(KillRequest::AlreadyPending);
        }
        self.require("kill_starter", self.state.is_running())?;

        self.kill_requested = true;
        let reply = agent.deactivate_claim(&self.claim, graceful);
        self.advance(PeerState::PendingDeath)?;

        match reply {
            Ok(()) => Ok(KillRequest::Requested),
            Err(error) => {
                warn!(node = self.node, error = ?error, "Failed to kill starter: {error}");
                Ok(KillRequest::Unacknowledged)
            }
        }
    }

    pub fn suspend<A: ExecutionAgent>(&mut self, agent: &mut A) -> Result<(), PeerError> {
        self.require("suspend", self.state == PeerState::Executing)?;

        agent
            .suspend_claim(&self.claim)
            .map_err(|source| PeerError::Agent {
                node: self.node,
                source,
            })?;
        self.suspended = true;

        Ok(())
    }

    pub fn resume<A: ExecutionAgent>(&mut self, agent: &mut A) -> Result<(), PeerError> {
        self.require("resume", self.state == PeerState::Executing)?;

        agent
            .continue_claim(&self.claim)
            .map_err(|source| PeerError::Agent {
                node: self.node,
                source,
            })?;
        self.suspended = false;

        Ok(())
    }

    /// payload confirmed running, returns false if it already was
    pub fn begin_execution(&mut self) -> Result<bool, PeerError> {
        match self.state {
            PeerState::Executing => Ok(false),
            PeerState::Startup => self.advance(PeerState::Executing).map(|_| true),
            state => Err(PeerError::InvalidState {
                node: self.node,
                operation: "begin_execution",
                state,
            }),
        }
    }

    /// merge a usage report, returns true if it moved the peer to EXECUTING
    pub fn update_from_starter(&mut self, update: &UsageUpdate) -> Result<bool, PeerError> {
        self.usage.merge(update);

        match update.job_state {
            Some(RemoteJobState::Running) => {
                self.suspended = false;
                if self.state == PeerState::Startup {
                    return self.begin_execution();
                }
            }
            Some(RemoteJobState::Suspended) if self.state == PeerState::Executing => {
                self.suspended = true;
            }
            _ => {}
        }

        Ok(false)
    }

    /// the payload terminated, the first recorded exit is kept
    pub fn record_exit(&mut self, status: ExitStatus) -> Result<ExitStatus, PeerError> {
        self.require(
            "record_exit",
            !matches!(self.state, PeerState::Pre | PeerState::Finished),
        )?;

        let status = if self.kill_requested && status.reason == ExitReason::Exited {
            status.with_exit_reason(ExitReason::Killed)
        } else {
            status
        };
        self.advance(PeerState::Finished)?;

        Ok(*self.exit.get_or_insert(status))
    }

    /// force the peer to FINISHED, keeping an exit recorded earlier
    pub fn finish_with(&mut self, status: ExitStatus) {
        self.exit.get_or_insert(status);

        if self.state != PeerState::Finished {
            info!(
                node = self.node,
                "Resource changing state from {} to {}",
                self.state,
                PeerState::Finished
            );
            self.state = PeerState::Finished;
        }
    }

    /// the control channel was lost, returns the resulting state
    pub fn disconnect(&mut self, reconnect_allowed: bool) -> Result<PeerState, PeerError> {
        self.require("disconnect", self.state.is_running())?;

        if reconnect_allowed {
            self.advance(PeerState::Reconnecting)?;
        } else {
            self.exit.get_or_insert(ExitStatus::with_reason(ExitReason::Evicted));
            self.advance(PeerState::Finished)?;
        }

        Ok(self.state)
    }

    pub fn reconnect_failed(&mut self) -> Result<(), PeerError> {
        self.require("reconnect_failed", self.state == PeerState::Reconnecting)?;
        self.exit
            .get_or_insert(ExitStatus::with_reason(ExitReason::ReconnectFailed));

        self.advance(PeerState::Finished)
    }
}
