use crate::usage::JobUsage;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;

/// Why a peer, or the job as a whole, stopped running
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(i32)]
pub enum ExitReason {
    Exception = 4,
    Exited = 100,
    Killed = 102,
    CoreDumped = 103,
    ShadowUsage = 106,
    Evicted = 107,
    NotStarted = 108,
    ShouldRequeue = 112,
    ShouldRemove = 113,
    ShouldHold = 114,
    ReconnectFailed = 118,
}

impl ExitReason {
    /// nothing was (successfully) started, so there is nothing to tear down
    pub fn is_pre_startup(self) -> bool {
        matches!(self, Self::NotStarted | Self::ShadowUsage)
    }

    /// reasons that end the job right away instead of waiting on the peers
    pub fn is_immediate(self) -> bool {
        self.is_pre_startup() || self == Self::ReconnectFailed
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Exception => "exception",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::CoreDumped => "core dumped",
            Self::ShadowUsage => "coordinator usage error",
            Self::Evicted => "evicted",
            Self::NotStarted => "not started",
            Self::ShouldRequeue => "requeue",
            Self::ShouldRemove => "remove",
            Self::ShouldHold => "hold",
            Self::ReconnectFailed => "reconnect failed",
        };

        write!(f, "{name} ({})", *self as i32)
    }
}

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(i32)]
pub enum HoldCode {
    UserRequest = 1,
    JobPolicy = 3,
    ShadowUsage = 6,
    HookFailure = 19,
    FailedToActivateClaim = 43,
}

/// Terminal status of a single peer
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub reason: ExitReason,
    pub signal: Option<i32>,
    pub code: Option<i32>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self {
            reason: ExitReason::Exited,
            signal: None,
            code: Some(code),
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            reason: ExitReason::Exited,
            signal: Some(signal),
            code: None,
        }
    }

    pub fn with_reason(reason: ExitReason) -> Self {
        Self {
            reason,
            signal: None,
            code: None,
        }
    }

    /// same signal and code, different reason
    pub fn with_exit_reason(self, reason: ExitReason) -> Self {
        Self { reason, ..self }
    }

    /// a successful, non-signaled exit of the payload (any exit code)
    pub fn is_normal(&self) -> bool {
        self.reason == ExitReason::Exited && self.signal.is_none()
    }

    pub fn by_signal(&self) -> bool {
        self.signal.is_some()
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => Self::exited(code),
            (None, Some(signal)) if status.core_dumped() => Self {
                reason: ExitReason::CoreDumped,
                signal: Some(signal),
                code: None,
            },
            (None, Some(signal)) => Self::signaled(signal),
            (None, None) => Self::with_reason(ExitReason::Exception),
        }
    }
}

/// A hold request coming from the surrounding process or from a fail-fast path
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HoldRequest {
    pub reason: String,
    pub code: HoldCode,
    pub subcode: i32,
}

/// What the job as a whole ended up as, reported exactly once per job attempt
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum JobOutcome {
    Held {
        reason: String,
        code: HoldCode,
        subcode: i32,
    },
    Requeued {
        reason: ExitReason,
        message: String,
    },
    Removed,
    Exited {
        status: ExitStatus,
        usage: JobUsage,
    },
}

impl JobOutcome {
    /// map a job-level exit status onto the hold/requeue/remove/exit decision
    pub fn decide(
        status: ExitStatus,
        message: &str,
        hold: Option<&HoldRequest>,
        remove_requested: bool,
        usage: JobUsage,
    ) -> Self {
        let held = |code| match hold {
            Some(request) => Self::Held {
                reason: request.reason.clone(),
                code: request.code,
                subcode: request.subcode,
            },
            None => Self::Held {
                reason: message.to_owned(),
                code,
                subcode: 0,
            },
        };

        match status.reason {
            ExitReason::Exited | ExitReason::CoreDumped => Self::Exited { status, usage },
            ExitReason::ShouldHold => held(HoldCode::JobPolicy),
            ExitReason::ShadowUsage | ExitReason::Exception => held(HoldCode::ShadowUsage),
            ExitReason::NotStarted if hold.is_some() => held(HoldCode::FailedToActivateClaim),
            ExitReason::ShouldRemove => Self::Removed,
            _ if remove_requested => Self::Removed,
            reason => Self::Requeued {
                reason,
                message: message.to_owned(),
            },
        }
    }

    pub fn disposition(&self) -> &'static str {
        match self {
            Self::Held { .. } => "held",
            Self::Requeued { .. } => "requeued",
            Self::Removed => "removed",
            Self::Exited { .. } => "exited",
        }
    }
}
