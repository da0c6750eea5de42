use crate::reason::JobOutcome;
use serde::{Deserialize, Serialize};
use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, warn};

/// Events a user can follow the job's progress by
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event")]
pub enum JobEvent {
    Execute { nodes: usize },
    Disconnected { node: usize, reason: String },
    Reconnected { node: usize },
    ReconnectFailed { node: usize, reason: String },
    Suspended { nodes: usize },
    Resumed { nodes: usize },
    Terminated { outcome: JobOutcome },
}

#[derive(Serialize, Debug)]
struct LogEntry<'a> {
    time: u64,
    cluster: i64,
    proc: i64,
    #[serde(flatten)]
    event: &'a JobEvent,
}

#[derive(Debug, Clone, Default)]
pub enum UserLog {
    #[default]
    Disabled,
    /// one YAML document per event, appended
    File(PathBuf),
    Memory(Vec<JobEvent>),
}

impl UserLog {
    pub fn open(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::File(path.to_owned()),
            None => Self::Disabled,
        }
    }

    /// write an event, failures are logged and otherwise ignored
    pub fn log(&mut self, cluster: i64, proc: i64, event: JobEvent) {
        match self {
            Self::Disabled => {}
            Self::Memory(events) => events.push(event),
            Self::File(path) => {
                let entry = LogEntry {
                    time: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|elapsed| elapsed.as_secs())
                        .unwrap_or_default(),
                    cluster,
                    proc,
                    event: &event,
                };

                let written = serde_yaml::to_string(&entry)
                    .map_err(|error| error.to_string())
                    .and_then(|document| {
                        OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(path.as_path())
                            .and_then(|mut file| write!(file, "---\n{document}"))
                            .map_err(|error| error.to_string())
                    });

                match written {
                    Ok(()) => debug!("Logged {event:?} to {path:?}"),
                    Err(error) => warn!("Unable to log {event:?} event: {error}"),
                }
            }
        }
    }

    pub fn events(&self) -> &[JobEvent] {
        match self {
            Self::Memory(events) => events,
            _ => &[],
        }
    }
}
