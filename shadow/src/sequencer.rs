use crate::{
    attributes::{
        ATTR_IWD, ATTR_MPI_IS_MASTER, ATTR_OWNER, ATTR_TRANSFER_FILES, ATTR_TRANSFER_INPUT_FILES,
    },
    peer::{LaunchStyle, PeerHandle},
};
use itertools::Itertools;
use nix::unistd::gethostname;
use once_cell::sync::Lazy;
use std::{
    fs::{self, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// executable named in every procgroup line, intercepted launches are recognized by it
pub const PROCGROUP_EXECUTABLE: &str = "pshadow_exec";

pub const MPICH_JOBID: &str = "MPICH_JOBID";
pub const MPICH_IPROC: &str = "MPICH_IPROC";
pub const MPICH_NPROC: &str = "MPICH_NPROC";
pub const MPICH_ROOT: &str = "MPICH_ROOT";

static HOSTNAME: Lazy<String> = Lazy::new(|| match gethostname() {
    Ok(hostname) => hostname.to_string_lossy().into_owned(),
    Err(error) => {
        warn!(error = ?error, "Failed to retrieve hostname: {error}");
        "localhost".to_owned()
    }
});

#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("Node {node} published a rendezvous address, only rank 0 may")]
    UnexpectedRendezvous { node: usize },
    #[error("Rendezvous address was already published")]
    DuplicateRendezvous,
    #[error("Rank 0 was not started yet")]
    MasterNotStarted,
    #[error("{style:?} launches do not expect {operation}")]
    WrongStyle {
        style: LaunchStyle,
        operation: &'static str,
    },
    #[error("Launch intercepted but every node was already started")]
    NoPeerLeft,
    #[error("Cannot find {PROCGROUP_EXECUTABLE} in intercepted arguments '{0}'")]
    MalformedLaunch(String),
    #[error("Cannot determine the host of address '{0}'")]
    BadAddress(String),
    #[error("Job record has no {0} attribute")]
    MissingAttribute(&'static str),
    #[error("Failed to write procgroup file {path:?}")]
    ProcGroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SequencerError {
    /// notifications that don't fit the current state, rejected without affecting the job
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedRendezvous { .. }
                | Self::DuplicateRendezvous
                | Self::MasterNotStarted
                | Self::WrongStyle { .. }
                | Self::NoPeerLeft
        )
    }

    /// the job record or the local environment can't support the launch
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::MissingAttribute(_) | Self::ProcGroup { .. })
    }
}

/// host part of an address like `<host:port?params>` or `host:port`
pub fn host_of(address: &str) -> Option<&str> {
    address
        .trim_start_matches('<')
        .split([':', '>', '?'])
        .next()
        .filter(|host| !host.is_empty())
}

/// everything following the procgroup executable in an intercepted launch
fn comrade_args(args: &str) -> Result<Vec<String>, SequencerError> {
    let mut words = args.split_whitespace();

    if words.any(|word| word == PROCGROUP_EXECUTABLE) {
        Ok(words.map(str::to_owned).collect())
    } else {
        Err(SequencerError::MalformedLaunch(args.to_owned()))
    }
}

/// Decides in which order, and with which extra arguments, the ranks get started
#[derive(Debug)]
pub struct SpawnSequencer {
    style: LaunchStyle,
    cluster: i64,
    proc: i64,
    next_to_start: usize,
    rendezvous: Option<String>,
    job_id: String,
    procgroup: Option<PathBuf>,
}

impl SpawnSequencer {
    pub fn new(style: LaunchStyle, cluster: i64, proc: i64) -> Self {
        Self {
            style,
            cluster,
            proc,
            next_to_start: 0,
            rendezvous: None,
            job_id: format!("{}.{cluster}.{proc}", *HOSTNAME),
            procgroup: None,
        }
    }

    pub fn style(&self) -> LaunchStyle {
        self.style
    }

    pub fn next_to_start(&self) -> usize {
        self.next_to_start
    }

    pub fn rendezvous(&self) -> Option<&str> {
        self.rendezvous.as_deref()
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn procgroup(&self) -> Option<&Path> {
        self.procgroup.as_deref()
    }

    /// prepare rank 0, returns the nodes to activate right away in order
    pub fn start_master(&mut self, peers: &mut [PeerHandle]) -> Result<Vec<usize>, SequencerError> {
        assert!(!peers.is_empty(), "rank 0 is always present");
        let count = peers.len();

        peers[0].attributes_mut().set(ATTR_MPI_IS_MASTER, true);

        match self.style {
            LaunchStyle::Parallel => Ok((0..count).collect()),
            LaunchStyle::Rendezvous => {
                let address = peers[0].claim().address.clone();
                let host = host_of(&address)
                    .ok_or_else(|| SequencerError::BadAddress(address.clone()))?;
                self.stamp_env(&mut peers[0], host, count);

                Ok(vec![0])
            }
            LaunchStyle::Intercepted => {
                self.write_procgroup(peers)?;

                Ok(vec![0])
            }
        }
    }

    /// a node was activated, nodes must be started in rank order
    pub fn started(&mut self, node: usize) {
        assert_eq!(
            node, self.next_to_start,
            "nodes are started strictly in rank order"
        );
        self.next_to_start += 1;
    }

    /// rank 0 told where it listens, returns the nodes that may start now
    pub fn rendezvous_published(
        &mut self,
        node: usize,
        address: &str,
        peers: &mut [PeerHandle],
    ) -> Result<Vec<usize>, SequencerError> {
        if self.style != LaunchStyle::Rendezvous {
            return Err(SequencerError::WrongStyle {
                style: self.style,
                operation: "a rendezvous address",
            });
        }
        if node != 0 {
            return Err(SequencerError::UnexpectedRendezvous { node });
        }
        if self.rendezvous.is_some() {
            return Err(SequencerError::DuplicateRendezvous);
        }
        if self.next_to_start == 0 {
            return Err(SequencerError::MasterNotStarted);
        }

        info!("Rank 0 published rendezvous address {address}");
        self.rendezvous = Some(address.to_owned());

        let count = peers.len();
        for peer in peers.iter_mut().skip(1) {
            self.stamp_env(peer, address, count);
        }

        Ok((self.next_to_start..count).collect())
    }

    /// rank 0 tried to launch a comrade, returns the node that takes its place
    pub fn intercepted_launch(
        &mut self,
        args: &str,
        peers: &mut [PeerHandle],
    ) -> Result<usize, SequencerError> {
        if self.style != LaunchStyle::Intercepted {
            return Err(SequencerError::WrongStyle {
                style: self.style,
                operation: "intercepted launches",
            });
        }
        if self.next_to_start == 0 {
            return Err(SequencerError::MasterNotStarted);
        }

        let node = self.next_to_start;
        let peer = peers.get_mut(node).ok_or(SequencerError::NoPeerLeft)?;

        let mut arguments = comrade_args(args)?;
        arguments.extend(peer.attributes().arguments());
        debug!(node = node, "Intercepted launch, arguments are now {arguments:?}");
        peer.attributes_mut().set_arguments(arguments);

        Ok(node)
    }

    /// remove files created for the launch
    pub fn cleanup(&mut self) {
        if let Some(path) = self.procgroup.take() {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {path:?}"),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => warn!(error = ?error, "Failed to remove {path:?}: {error}"),
            }
        }
    }

    fn stamp_env(&self, peer: &mut PeerHandle, root: &str, count: usize) {
        let node = peer.node().to_string();
        let attributes = peer.attributes_mut();

        attributes.set_env(MPICH_JOBID, &self.job_id);
        attributes.set_env(MPICH_IPROC, &node);
        attributes.set_env(MPICH_NPROC, &count.to_string());
        attributes.set_env(MPICH_ROOT, root);
    }

    fn write_procgroup(&mut self, peers: &mut [PeerHandle]) -> Result<(), SequencerError> {
        let master = peers[0].attributes();
        let iwd = master
            .get_str(ATTR_IWD)
            .ok_or(SequencerError::MissingAttribute(ATTR_IWD))?;
        let owner = master
            .get_str(ATTR_OWNER)
            .ok_or(SequencerError::MissingAttribute(ATTR_OWNER))?;

        let name = format!("procgroup.{}.{}", self.cluster, self.proc);
        let path = Path::new(iwd).join(&name);

        let lines = peers
            .iter()
            .map(|peer| {
                let address = &peer.claim().address;
                host_of(address)
                    .map(|host| {
                        let flag = if peer.node() == 0 { 0 } else { 1 };
                        format!("{host} {flag} {PROCGROUP_EXECUTABLE} {owner}\n")
                    })
                    .ok_or_else(|| SequencerError::BadAddress(address.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        fs::write(&path, lines.concat())
            .and_then(|_| fs::set_permissions(&path, Permissions::from_mode(0o666)))
            .map_err(|source| SequencerError::ProcGroup {
                path: path.clone(),
                source,
            })?;
        info!("Wrote procgroup file {path:?}");

        let transfer_never = master
            .get_str(ATTR_TRANSFER_FILES)
            .map_or(false, |value| value.starts_with(['n', 'N']));
        let inputs = master
            .get_str(ATTR_TRANSFER_INPUT_FILES)
            .filter(|inputs| !inputs.is_empty())
            .map(str::to_owned);

        let master = peers[0].attributes_mut();
        let arguments = ["-p4pg".to_owned(), name.clone()]
            .into_iter()
            .chain(master.arguments())
            .collect_vec();
        master.set_arguments(arguments);

        if !transfer_never {
            master.set(
                ATTR_TRANSFER_INPUT_FILES,
                match inputs {
                    Some(inputs) => format!("{inputs},{name}"),
                    None => name,
                },
            );
        }

        self.procgroup = Some(path);

        Ok(())
    }
}
