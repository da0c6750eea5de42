use crate::{attributes::SlotAttributes, config::HookConfig};
use std::{
    fmt,
    io::{self, Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// before a node's claim is activated
    Pre,
    /// after a node finished
    Post,
    /// after the job outcome was decided
    Reaper,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pre => "pre",
            Self::Post => "post",
            Self::Reaper => "reaper",
        })
    }
}

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Failed to spawn {kind} hook")]
    Spawn {
        kind: HookKind,
        #[source]
        source: io::Error,
    },
    #[error("{0} hook ran into timeout")]
    Timeout(HookKind),
    #[error("{kind} hook failed with {status}: {stderr}")]
    Failed {
        kind: HookKind,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("Failed to serialize attributes for the hook")]
    Input(#[from] serde_yaml::Error),
    #[error("Failed to communicate with the hook")]
    Pipe(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct CommandHooks {
    pub pre: Option<PathBuf>,
    pub post: Option<PathBuf>,
    pub reaper: Option<PathBuf>,
    pub timeout: Duration,
}

/// Strategy for the file transfer negotiation around a node's lifetime
#[derive(Debug, Clone, Default)]
pub enum TransferHooks {
    #[default]
    Disabled,
    Command(CommandHooks),
}

impl TransferHooks {
    pub fn load(config: Option<&HookConfig>) -> Self {
        match config {
            Some(config) => Self::Command(CommandHooks {
                pre: config.pre.clone(),
                post: config.post.clone(),
                reaper: config.reaper.clone(),
                timeout: Duration::from_millis(config.timeout),
            }),
            None => Self::Disabled,
        }
    }

    pub fn run(
        &self,
        kind: HookKind,
        node: Option<usize>,
        attributes: &SlotAttributes,
    ) -> Result<(), HookError> {
        match self {
            Self::Disabled => Ok(()),
            Self::Command(hooks) => hooks.run(kind, node, attributes),
        }
    }
}

impl CommandHooks {
    fn path(&self, kind: HookKind) -> Option<&PathBuf> {
        match kind {
            HookKind::Pre => self.pre.as_ref(),
            HookKind::Post => self.post.as_ref(),
            HookKind::Reaper => self.reaper.as_ref(),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, attributes))]
    fn run(
        &self,
        kind: HookKind,
        node: Option<usize>,
        attributes: &SlotAttributes,
    ) -> Result<(), HookError> {
        let Some(path) = self.path(kind) else {
            return Ok(());
        };

        let input = serde_yaml::to_string(attributes)?;
        let mut command = Command::new(path);
        command
            .arg(kind.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(node) = node {
            command.arg(node.to_string());
        }

        let mut handle = command
            .spawn()
            .map_err(|source| HookError::Spawn { kind, source })?;

        if let Some(mut stdin) = handle.stdin.take() {
            if let Err(error) = stdin.write_all(input.as_bytes()) {
                // hooks are free to ignore their input
                debug!("Hook did not read its input: {error}");
            }
            // closing stdin gives the hook a clear end of input
        }

        debug!("Hook waiting on {}", handle.id());
        let status = match handle.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                warn!("{kind} hook ran into timeout, killing it");
                handle.kill()?;
                handle.wait()?;

                return Err(HookError::Timeout(kind));
            }
        };

        if status.success() {
            debug!("{kind} hook exit status: {status:?}");

            Ok(())
        } else {
            let mut stderr = String::new();
            if let Some(mut pipe) = handle.stderr.take() {
                pipe.read_to_string(&mut stderr)?;
            }

            Err(HookError::Failed {
                kind,
                status,
                stderr: stderr.trim().to_owned(),
            })
        }
    }
}
