use crate::{
    reason::{ExitStatus, HoldRequest},
    usage::UsageUpdate,
};
use std::sync::mpsc::{Receiver, Sender};

/// Notifications pushed into the coordinator, handled one at a time
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// the payload of a node is confirmed running
    BeganExecution { node: usize },
    /// periodic usage report, `node` is whatever the agent claimed it to be
    Usage {
        node: Option<usize>,
        update: UsageUpdate,
    },
    /// rank 0 published where it listens for its peers
    RendezvousAddress { node: usize, address: String },
    /// rank 0's launcher tried to start a peer with these arguments
    InterceptedLaunch { args: String },
    PeerExited { node: usize, status: ExitStatus },
    Disconnected { node: usize, reason: String },
    ReconnectAttempt { node: usize },
    QueueUpdate,
    Removal { signal: i32 },
    Hold(HoldRequest),
    Suspend,
    Resume,
}

pub type EventSender = Sender<Event>;
pub type EventReceiver = Receiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    std::sync::mpsc::channel()
}
