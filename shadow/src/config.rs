use crate::{
    arbiter::ShutdownPolicy,
    attributes::{SlotAttributes, ATTR_CMD, ATTR_IWD, ATTR_PARALLEL_SHUTDOWN_POLICY},
    coordinator::CoordinatorSettings,
    hooks::TransferHooks,
    matches::{ProcGroup, SlotMatch},
    peer::LaunchStyle,
    store::StoreError,
    userlog::UserLog,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Execution agent not supported")]
    UnsupportedAgent(String),
    #[error("Execution agent failed to load")]
    FailedLoadAgent,
    #[error("Job store not supported")]
    UnsupportedStore(String),
    #[error("Job store failed to load")]
    FailedLoadStore(#[from] StoreError),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] io::Error),
    #[error("Failed to read {path:?}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Configuration is malformed")]
    Malformed(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub job: JobSection,
    // stand-in for the scheduler's match reply, the first slot of the first group is rank 0
    pub slots: Vec<ProcGroup>,
    pub agent: AgentConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
    // seconds between persisting aggregated usage
    #[serde(default = "default_queue_update_interval")]
    pub queue_update_interval: u64,
    #[serde(default)]
    pub hooks: Option<HookConfig>,
    #[serde(default)]
    pub user_log: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobSection {
    pub cluster: i64,
    #[serde(default)]
    pub proc: i64,
    pub launch: LaunchStyle,
    // the job's attribute record every node's record is derived from
    #[serde(default)]
    pub attributes: SlotAttributes,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    // Name of the selected agent, see Agents::load for the selection proccess
    pub name: String,
    pub parameter: Option<BTreeMap<String, serde_yaml::Value>>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_store_name")]
    pub name: String,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: default_store_name(),
            path: default_store_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    // seconds
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_factor: default_backoff_factor(),
            backoff_ceiling: default_backoff_ceiling(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActivationConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    // milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

impl ActivationConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HookConfig {
    pub pre: Option<PathBuf>,
    pub post: Option<PathBuf>,
    pub reaper: Option<PathBuf>,
    // milliseconds
    #[serde(default = "default_hook_timeout")]
    pub timeout: u64,
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigErrors::ReadFailed {
            path: path.to_owned(),
            source,
        })?;

        Ok(serde_yaml::from_str(&contents)?)
    }

    /// the slot rank 0 was matched to
    pub fn rank0(&self) -> Option<&SlotMatch> {
        self.slots.first().and_then(|group| group.slots.first())
    }

    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            cluster: self.job.cluster,
            proc: self.job.proc,
            launch: self.job.launch,
            activation: self.activation,
            reconnect: self.reconnect,
            queue_update_interval: Duration::from_secs(self.queue_update_interval),
            hooks: TransferHooks::load(self.hooks.as_ref()),
            user_log: UserLog::open(self.user_log.as_deref()),
        }
    }

    /// normalizes the configuration, returns true if it contains errors
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        self.agent.name = self.agent.name.to_lowercase();
        if self.agent.name != "local" {
            error!(
                "agent.name ({}) is not supported, please use `local` for now",
                self.agent.name
            );
            contains_error = true;
        }

        self.store.name = self.store.name.to_lowercase();
        match self.store.name.as_str() {
            "memory" => {}
            #[cfg(feature = "sqlite")]
            "sqlite" => {}
            store_name => {
                error!("store.name ({store_name}) is not supported by this build");
                contains_error = true;
            }
        }

        if self.slots.is_empty() {
            error!("No slots were defined, unable to claim rank 0");
            contains_error = true;
        }

        for (index, group) in self.slots.iter().enumerate() {
            if group.slots.is_empty() {
                error!("slots[{index}] is an empty proc group");
                contains_error = true;
            }
        }

        for claim_id in self
            .slots
            .iter()
            .flat_map(|group| group.slots.iter())
            .map(|slot| slot.claim_id.as_str())
            .duplicates()
        {
            error!("Claim {claim_id} is matched to more than one slot");
            contains_error = true;
        }

        if let Some(policy) = self.job.attributes.get_str(ATTR_PARALLEL_SHUTDOWN_POLICY) {
            if ShutdownPolicy::from_str(policy).is_err() {
                warn!(
                    "{ATTR_PARALLEL_SHUTDOWN_POLICY} '{policy}' is unknown, falling back to {}",
                    ShutdownPolicy::default()
                );
            }
        }

        match self.job.attributes.get_str(ATTR_CMD).map(PathBuf::from) {
            None => {
                error!("job.attributes.{ATTR_CMD} must name the executable to run on every node");
                contains_error = true;
            }
            // bare names are resolved via PATH at launch
            Some(cmd) if cmd.components().count() > 1 => match check_executable(&cmd) {
                Ok(true) => {}
                Ok(false) => {
                    error!("{} is not executable", cmd.to_string_lossy());
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if job.attributes.{ATTR_CMD} ({}) is an executable: {e}",
                        cmd.to_string_lossy()
                    );
                    contains_error = true;
                }
            },
            Some(_) => {}
        }

        if self.job.launch == LaunchStyle::Intercepted && !self.job.attributes.contains(ATTR_IWD)
        {
            error!("Intercepted launches need job.attributes.{ATTR_IWD} to place the procgroup file");
            contains_error = true;
        }

        if self.reconnect.backoff_factor <= 0.0 {
            warn!(
                "reconnect.backoff_factor must be positive, using {} instead",
                default_backoff_factor()
            );
            self.reconnect.backoff_factor = default_backoff_factor();
        }

        if self.queue_update_interval == 0 {
            error!("queue_update_interval cannot be 0");
            contains_error = true;
        }

        if let Some(hooks) = &self.hooks {
            for (name, path) in [
                ("pre", &hooks.pre),
                ("post", &hooks.post),
                ("reaper", &hooks.reaper),
            ] {
                let Some(path) = path else { continue };

                if !matches!(check_executable(path), Ok(true)) {
                    error!(
                        "hooks.{name} must be a valid path to an executable file, got {}",
                        path.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_store_name() -> String {
    "sqlite".to_owned()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("pshadow.db")
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_ceiling() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    20
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_hook_timeout() -> u64 {
    2000
}

fn default_queue_update_interval() -> u64 {
    900
}
