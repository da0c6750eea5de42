pub mod local;
#[cfg(test)]
pub mod mock;

use crate::{
    attributes::SlotAttributes,
    config::{AgentConfig, ConfigErrors},
    event::EventSender,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Request to {0} was refused")]
    Refused(String),
    #[error("Request was delayed, previous job still being vacated")]
    TryAgain,
    #[error("Execution agent at {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("No starter is running for the claim anymore")]
    StarterNotFound,
    #[error("Reconnect is not supported by this agent")]
    ReconnectUnsupported,
    #[error("Slot record has no {0} attribute")]
    MissingAttribute(&'static str),
    #[error("Unknown claim {0}")]
    UnknownClaim(String),
    #[error("Failed to launch payload")]
    Spawn(#[from] std::io::Error),
    #[error("Failed to signal payload")]
    Signal(#[from] nix::Error),
}

impl AgentError {
    /// the request may succeed if simply repeated later on
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TryAgain | Self::Unreachable { .. })
    }
}

/// Identifies the leased slot a request is meant for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRef {
    pub node: usize,
    pub address: String,
    pub claim_id: String,
}

/// Requests the coordinator sends to the agent running a node's payload.
/// Asynchronous outcomes (began execution, usage, exit, disconnect) are pushed as events.
pub trait ExecutionAgent {
    fn activate_claim(
        &mut self,
        claim: &ClaimRef,
        attributes: &SlotAttributes,
    ) -> Result<(), AgentError>;

    /// re-establish the control channel to a starter that may still be running
    fn reconnect(&mut self, claim: &ClaimRef) -> Result<(), AgentError>;

    fn deactivate_claim(&mut self, claim: &ClaimRef, graceful: bool) -> Result<(), AgentError>;

    fn suspend_claim(&mut self, claim: &ClaimRef) -> Result<(), AgentError>;

    fn continue_claim(&mut self, claim: &ClaimRef) -> Result<(), AgentError>;

    fn supports_reconnect(&self) -> bool;

    /// the job is over, release whatever the agent set up for it
    fn cleanup(&mut self) {}
}

#[derive(Debug)]
pub enum Agents {
    Local(local::LocalAgent),
}

impl Agents {
    pub fn load(config: &AgentConfig, events: EventSender) -> Result<Self, ConfigErrors> {
        match config.name.as_str() {
            "local" => Ok(Self::Local(local::LocalAgent::load(config, events)?)),
            _ => Err(ConfigErrors::UnsupportedAgent(config.name.clone())),
        }
    }
}

impl ExecutionAgent for Agents {
    fn activate_claim(
        &mut self,
        claim: &ClaimRef,
        attributes: &SlotAttributes,
    ) -> Result<(), AgentError> {
        match self {
            Self::Local(agent) => agent.activate_claim(claim, attributes),
        }
    }

    fn reconnect(&mut self, claim: &ClaimRef) -> Result<(), AgentError> {
        match self {
            Self::Local(agent) => agent.reconnect(claim),
        }
    }

    fn deactivate_claim(&mut self, claim: &ClaimRef, graceful: bool) -> Result<(), AgentError> {
        match self {
            Self::Local(agent) => agent.deactivate_claim(claim, graceful),
        }
    }

    fn suspend_claim(&mut self, claim: &ClaimRef) -> Result<(), AgentError> {
        match self {
            Self::Local(agent) => agent.suspend_claim(claim),
        }
    }

    fn continue_claim(&mut self, claim: &ClaimRef) -> Result<(), AgentError> {
        match self {
            Self::Local(agent) => agent.continue_claim(claim),
        }
    }

    fn supports_reconnect(&self) -> bool {
        match self {
            Self::Local(agent) => agent.supports_reconnect(),
        }
    }

    fn cleanup(&mut self) {
        match self {
            Self::Local(agent) => agent.cleanup(),
        }
    }
}
