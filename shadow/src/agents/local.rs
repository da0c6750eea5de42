use super::{AgentError, ClaimRef, ExecutionAgent};
use crate::{
    attributes::{SlotAttributes, ATTR_CMD, ATTR_IWD},
    config::{AgentConfig, ConfigErrors},
    event::{Event, EventSender},
    reason::{ExitReason, ExitStatus},
    usage::{RemoteJobState, UsageUpdate},
};
use nix::{
    sys::signal::{self, Signal},
    unistd::{sysconf, Pid, SysconfVar},
};
use once_cell::sync::Lazy;
use parking_lot::FairMutex;
use std::{
    collections::BTreeMap,
    env, fs, io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
    thread,
    time::Duration,
};
use tracing::{debug, error, info, trace, warn};

/// environment variable pointing a payload to its control directory
pub const CONTROL_DIR_ENV: &str = "PSHADOW_CONTROL_DIR";
pub const NODE_ENV: &str = "PSHADOW_NODE";
/// file rank 0 writes its rendezvous address into
pub const RENDEZVOUS_FILE: &str = "rendezvous";
/// file rank 0 appends one line per peer launch it wants intercepted
pub const LAUNCH_FILE: &str = "launch";

static CLOCK_TICKS: Lazy<f64> = Lazy::new(|| match sysconf(SysconfVar::CLK_TCK) {
    Ok(Some(ticks)) if ticks > 0 => ticks as f64,
    _ => 100.0,
});

/// primitve way to retrieve the tmp dir from the environment with default to /tmp
fn get_tmp_dir() -> PathBuf {
    env::var("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or(PathBuf::from("/tmp"))
}

#[derive(Debug)]
struct LocalChild {
    node: usize,
    child: Child,
    exited: bool,
}

type SharedChild = Arc<FairMutex<LocalChild>>;

/// Agent running every node's payload as a child process of this host
#[derive(Debug)]
pub struct LocalAgent {
    events: EventSender,
    control_dir: PathBuf,
    poll_interval: Duration,
    kill_grace: Duration,
    children: BTreeMap<String, SharedChild>,
}

fn millis_parameter(config: &AgentConfig, name: &str, default: u64) -> Result<u64, ConfigErrors> {
    match config
        .parameter
        .as_ref()
        .and_then(|parameters| parameters.get(name))
    {
        Some(value) => match value.as_u64() {
            Some(value) => Ok(value),
            None => {
                warn!("agent.parameter.{name} must be a natural number (milliseconds)");
                Err(ConfigErrors::FailedLoadAgent)
            }
        },
        None => Ok(default),
    }
}

impl LocalAgent {
    pub fn load(config: &AgentConfig, events: EventSender) -> Result<Self, ConfigErrors> {
        let poll_interval = Duration::from_millis(millis_parameter(config, "poll_interval", 200)?);
        let kill_grace = Duration::from_millis(millis_parameter(config, "kill_grace", 5000)?);

        let control_dir = match config
            .parameter
            .as_ref()
            .and_then(|parameters| parameters.get("control_dir"))
        {
            Some(value) => match value.as_str() {
                Some(path) => PathBuf::from(path),
                None => {
                    warn!("agent.parameter.control_dir must be a path");
                    return Err(ConfigErrors::FailedLoadAgent);
                }
            },
            None => get_tmp_dir().join(format!("pshadow-{}", std::process::id())),
        };

        debug!(
            "Local agent using {:?}, polling every {}ms",
            control_dir,
            poll_interval.as_millis()
        );

        Ok(Self {
            events,
            control_dir,
            poll_interval,
            kill_grace,
            children: BTreeMap::new(),
        })
    }

    fn child(&self, claim: &ClaimRef) -> Result<&SharedChild, AgentError> {
        self.children
            .get(&claim.claim_id)
            .ok_or_else(|| AgentError::UnknownClaim(claim.claim_id.clone()))
    }

    /// the watcher reaps under the same lock, so the pid can't be reused while it is held
    fn signal(&self, claim: &ClaimRef, sig: Signal) -> Result<(), AgentError> {
        let guard = self.child(claim)?.lock();
        if guard.exited {
            return Err(AgentError::StarterNotFound);
        }

        let pid = Pid::from_raw(guard.child.id() as i32);
        debug!(node = claim.node, "Sending {sig} to {pid}");
        match signal::kill(pid, sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn node_dir(&self, node: usize) -> PathBuf {
        self.control_dir.join(format!("node-{node}"))
    }

    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }
}

impl ExecutionAgent for LocalAgent {
    fn activate_claim(
        &mut self,
        claim: &ClaimRef,
        attributes: &SlotAttributes,
    ) -> Result<(), AgentError> {
        if self.children.contains_key(&claim.claim_id) {
            return Err(AgentError::Refused(claim.address.clone()));
        }

        let cmd = attributes
            .get_str(ATTR_CMD)
            .ok_or(AgentError::MissingAttribute(ATTR_CMD))?;
        let node_dir = self.node_dir(claim.node);
        fs::create_dir_all(&node_dir)?;

        let mut command = Command::new(cmd);
        command
            .args(attributes.arguments())
            .envs(attributes.environment())
            .env(CONTROL_DIR_ENV, &node_dir)
            .env(NODE_ENV, claim.node.to_string())
            .stdin(Stdio::null());

        if let Some(iwd) = attributes.get_str(ATTR_IWD) {
            command.current_dir(iwd);
        }

        let child = command.spawn()?;
        info!(
            node = claim.node,
            pid = child.id(),
            "Request to run on {} was ACCEPTED",
            claim.address
        );

        let shared = Arc::new(FairMutex::new(LocalChild {
            node: claim.node,
            child,
            exited: false,
        }));
        self.children.insert(claim.claim_id.clone(), shared.clone());

        let _ = self.events.send(Event::BeganExecution { node: claim.node });

        let events = self.events.clone();
        let node = claim.node;
        let poll_interval = self.poll_interval;
        thread::spawn(move || watch(node, shared, node_dir, events, poll_interval));

        Ok(())
    }

    fn reconnect(&mut self, _claim: &ClaimRef) -> Result<(), AgentError> {
        Err(AgentError::ReconnectUnsupported)
    }

    fn deactivate_claim(&mut self, claim: &ClaimRef, graceful: bool) -> Result<(), AgentError> {
        if graceful {
            self.signal(claim, Signal::SIGTERM)?;
            // a stopped payload never sees the SIGTERM otherwise
            self.signal(claim, Signal::SIGCONT)?;

            let shared = self.child(claim)?.clone();
            let grace = self.kill_grace;
            let node = claim.node;
            thread::spawn(move || {
                thread::sleep(grace);
                let mut guard = shared.lock();

                if !guard.exited && matches!(guard.child.try_wait(), Ok(None)) {
                    warn!(node, "Payload ignored SIGTERM, escalating to SIGKILL");
                    if let Err(error) = guard.child.kill() {
                        error!(node, error = ?error, "Failed to kill payload: {error}");
                    }
                }
            });

            Ok(())
        } else {
            self.signal(claim, Signal::SIGKILL)
        }
    }

    fn suspend_claim(&mut self, claim: &ClaimRef) -> Result<(), AgentError> {
        self.signal(claim, Signal::SIGSTOP)
    }

    fn continue_claim(&mut self, claim: &ClaimRef) -> Result<(), AgentError> {
        self.signal(claim, Signal::SIGCONT)
    }

    fn supports_reconnect(&self) -> bool {
        false
    }

    /// remove every node's control directory, and the parent once it is empty
    fn cleanup(&mut self) {
        let nodes: Vec<usize> = self
            .children
            .values()
            .map(|shared| shared.lock().node)
            .collect();

        for node in nodes {
            let node_dir = self.node_dir(node);
            match fs::remove_dir_all(&node_dir) {
                Ok(()) => debug!("Removed {node_dir:?}"),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => warn!(error = ?error, "Failed to remove {node_dir:?}: {error}"),
            }
        }

        if let Err(error) = fs::remove_dir(&self.control_dir) {
            debug!("Kept {:?}: {error}", self.control_dir);
        }
    }
}

/// Poll a payload until it exits, forwarding usage, rendezvous and launch requests
fn watch(
    node: usize,
    shared: SharedChild,
    node_dir: PathBuf,
    events: EventSender,
    poll_interval: Duration,
) {
    let mut rendezvous_sent = false;
    let mut launches_seen = 0;

    loop {
        thread::sleep(poll_interval);

        let (status, pid) = {
            let mut guard = shared.lock();
            let status = guard.child.try_wait();
            if matches!(status, Ok(Some(_)) | Err(_)) {
                guard.exited = true;
            }

            (status, guard.child.id())
        };

        let exit = match status {
            Ok(Some(status)) => Some(ExitStatus::from(status)),
            Ok(None) => None,
            Err(error) => {
                error!(node, error = ?error, "Failed to wait on payload: {error}");
                Some(ExitStatus::with_reason(ExitReason::Exception))
            }
        };

        if let Some(status) = exit {
            info!(node, "Payload exited with {status:?}");
            let _ = events.send(Event::PeerExited { node, status });
            break;
        }

        let mut outgoing = Vec::new();

        if let Some(update) = sample_proc(pid) {
            trace!(node, "Usage sample {update:?}");
            outgoing.push(Event::Usage {
                node: Some(node),
                update,
            });
        }

        if node == 0 {
            if !rendezvous_sent {
                if let Some(address) = read_rendezvous(&node_dir) {
                    rendezvous_sent = true;
                    outgoing.push(Event::RendezvousAddress { node, address });
                }
            }

            for args in read_launches(&node_dir, &mut launches_seen) {
                outgoing.push(Event::InterceptedLaunch { args });
            }
        }

        if outgoing
            .into_iter()
            .any(|event| events.send(event).is_err())
        {
            debug!(node, "Coordinator is gone, no longer watching");
            break;
        }
    }
}

fn read_rendezvous(node_dir: &Path) -> Option<String> {
    fs::read_to_string(node_dir.join(RENDEZVOUS_FILE))
        .ok()
        .map(|address| address.trim().to_owned())
        .filter(|address| !address.is_empty())
}

/// complete lines appended to the launch file since the last call
fn read_launches(node_dir: &Path, seen: &mut usize) -> Vec<String> {
    let contents = match fs::read_to_string(node_dir.join(LAUNCH_FILE)) {
        Ok(contents) => contents,
        Err(_) => return Vec::new(),
    };

    let complete: Vec<String> = contents
        .split_inclusive('\n')
        .filter(|line| line.ends_with('\n'))
        .skip(*seen)
        .map(|line| line.trim().to_owned())
        .collect();
    *seen += complete.len();

    complete
        .into_iter()
        .filter(|line| !line.is_empty())
        .collect()
}

/// sample a running process from procfs
fn sample_proc(pid: u32) -> Option<UsageUpdate> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;

    let mut update = UsageUpdate::default();

    for line in status.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let value = parts.next().and_then(|value| value.parse::<u64>().ok());

        match (key, value) {
            (Some("VmSize:"), Some(kb)) => update.image_size_kb = Some(kb),
            (Some("VmRSS:"), Some(kb)) => {
                update.resident_set_size_kb = Some(kb);
                update.memory_usage_mb = Some((kb + 1023) / 1024);
            }
            _ => {}
        }
    }

    // fields after the command name, which itself may contain spaces
    let fields: Vec<&str> = stat.rsplit_once(')')?.1.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    update.cpu_user_secs = Some(utime as f64 / *CLOCK_TICKS);
    update.cpu_system_secs = Some(stime as f64 / *CLOCK_TICKS);

    update.job_state = Some(match fields.first() {
        Some(&"T") | Some(&"t") => RemoteJobState::Suspended,
        _ => RemoteJobState::Running,
    });

    Some(update)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_lines_are_consumed_once() {
        let dir = get_tmp_dir().join(format!("pshadow-launch-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(LAUNCH_FILE), "a pshadow_exec x\nb pshadow_exec y\npartial").unwrap();

        let mut seen = 0;
        assert_eq!(
            read_launches(&dir, &mut seen),
            vec!["a pshadow_exec x".to_owned(), "b pshadow_exec y".to_owned()]
        );
        assert!(read_launches(&dir, &mut seen).is_empty());

        fs::write(
            dir.join(LAUNCH_FILE),
            "a pshadow_exec x\nb pshadow_exec y\npartial line\n",
        )
        .unwrap();
        assert_eq!(read_launches(&dir, &mut seen), vec!["partial line".to_owned()]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn cleanup_removes_control_dirs() {
        let control_dir = get_tmp_dir().join(format!("pshadow-cleanup-test-{}", std::process::id()));
        let config = AgentConfig {
            name: "local".to_owned(),
            parameter: Some(BTreeMap::from([
                (
                    "control_dir".to_owned(),
                    serde_yaml::Value::from(control_dir.to_string_lossy().into_owned()),
                ),
                ("poll_interval".to_owned(), serde_yaml::Value::from(10)),
            ])),
        };
        let (sender, receiver) = crate::event::channel();
        let mut agent = LocalAgent::load(&config, sender).unwrap();
        assert_eq!(agent.control_dir(), control_dir.as_path());

        let claim = ClaimRef {
            node: 0,
            address: "<127.0.0.1:9618>".to_owned(),
            claim_id: "claim-0".to_owned(),
        };
        let mut attributes = SlotAttributes::new();
        attributes.set(ATTR_CMD, "/bin/true");
        agent.activate_claim(&claim, &attributes).unwrap();
        assert!(control_dir.join("node-0").is_dir());

        loop {
            match receiver.recv_timeout(Duration::from_secs(10)).unwrap() {
                Event::PeerExited { node, status } => {
                    assert_eq!(node, 0);
                    assert_eq!(status, ExitStatus::exited(0));
                    break;
                }
                _ => continue,
            }
        }

        // a reaped payload is never signaled
        assert!(matches!(
            agent.deactivate_claim(&claim, false),
            Err(AgentError::StarterNotFound)
        ));

        agent.cleanup();
        assert!(!control_dir.exists());
    }

    #[test]
    fn sample_own_process() {
        let update = sample_proc(std::process::id()).unwrap();

        assert!(update.image_size_kb.unwrap() > 0);
        assert_eq!(update.job_state, Some(RemoteJobState::Running));
    }
}
