use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub const ATTR_NODE: &str = "Node";
pub const ATTR_MAX_HOSTS: &str = "MaxHosts";
pub const ATTR_CLAIM_ID: &str = "ClaimId";
pub const ATTR_MPI_IS_MASTER: &str = "MPIIsMaster";
pub const ATTR_CMD: &str = "Cmd";
pub const ATTR_ARGUMENTS: &str = "Arguments";
pub const ATTR_ENVIRONMENT: &str = "Environment";
pub const ATTR_IWD: &str = "Iwd";
pub const ATTR_OWNER: &str = "Owner";
pub const ATTR_TRANSFER_FILES: &str = "TransferFiles";
pub const ATTR_TRANSFER_INPUT_FILES: &str = "TransferInputFiles";
pub const ATTR_GLOBAL_JOB_ID: &str = "GlobalJobId";
pub const ATTR_JOB_LEASE_DURATION: &str = "JobLeaseDuration";
pub const ATTR_LAST_JOB_LEASE_RENEWAL: &str = "LastJobLeaseRenewal";
pub const ATTR_JOB_CURRENT_START_DATE: &str = "JobCurrentStartDate";
pub const ATTR_JOB_CURRENT_START_EXECUTING_DATE: &str = "JobCurrentStartExecutingDate";
pub const ATTR_PARALLEL_SHUTDOWN_POLICY: &str = "ParallelShutdownPolicy";
pub const ATTR_IMAGE_SIZE: &str = "ImageSize";
pub const ATTR_DISK_USAGE: &str = "DiskUsage";
pub const ATTR_REMOTE_USER_CPU: &str = "RemoteUserCpu";
pub const ATTR_REMOTE_SYS_CPU: &str = "RemoteSysCpu";
pub const ATTR_BYTES_SENT: &str = "BytesSent";
pub const ATTR_BYTES_RECVD: &str = "BytesRecvd";
pub const ATTR_EXIT_REASON: &str = "ExitReason";
pub const ATTR_ON_EXIT_SIGNAL: &str = "ExitSignal";
pub const ATTR_ON_EXIT_CODE: &str = "ExitCode";

/// Placeholder users put into attribute values to address individual nodes
pub const NODE_PLACEHOLDER: &str = "$(Node)";

/// A single attribute value of a job/slot record
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Float(value) => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// substitute the node placeholder, returns true if anything changed
    fn replace_node(&mut self, node: &str) -> bool {
        let replace = |value: &mut String| {
            if value.contains(NODE_PLACEHOLDER) {
                *value = value.replace(NODE_PLACEHOLDER, node);
                true
            } else {
                false
            }
        };

        match self {
            Self::Str(value) => replace(value),
            Self::List(values) => values.iter_mut().fold(false, |acc, value| replace(value) | acc),
            Self::Map(values) => values
                .values_mut()
                .fold(false, |acc, value| replace(value) | acc),
            Self::Bool(_) | Self::Int(_) | Self::Float(_) => false,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for AttrValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<u64> for AttrValue {
    fn from(value: u64) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, String>> for AttrValue {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self::Map(value)
    }
}

/// The job's attribute record, or a copy of it specialized for one node
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct SlotAttributes(BTreeMap<String, AttrValue>);

impl SlotAttributes {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(AttrValue::as_int)
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(AttrValue::as_float)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttrValue::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(AttrValue::as_bool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn set<V: Into<AttrValue>>(&mut self, name: &str, value: V) {
        self.0.insert(name.to_owned(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        self.0.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    /// take over every attribute of `other`, replacing existing values
    pub fn overlay(&mut self, other: &SlotAttributes) {
        for (name, value) in other.iter() {
            self.set(name, value.clone());
        }
    }

    /// replace the node placeholder in every value, returns the number of changed attributes
    pub fn replace_node(&mut self, node: usize) -> usize {
        let node_str = node.to_string();
        let mut replaced = 0;

        for (name, value) in self.0.iter_mut() {
            if value.replace_node(&node_str) {
                debug!(node = node, attribute = %name, "Replaced node placeholder, now using {value:?}");
                replaced += 1;
            }
        }

        replaced
    }

    /// copy of this record specialized for `node`
    pub fn for_node(&self, node: usize) -> Self {
        let mut specialized = self.clone();
        specialized.replace_node(node);
        specialized.set(ATTR_NODE, node);

        specialized
    }

    /// arguments either as list or as whitespace separated string
    pub fn arguments(&self) -> Vec<String> {
        match self.get(ATTR_ARGUMENTS) {
            Some(AttrValue::List(args)) => args.clone(),
            Some(AttrValue::Str(args)) => args.split_whitespace().map(str::to_owned).collect(),
            _ => Vec::new(),
        }
    }

    pub fn set_arguments(&mut self, args: Vec<String>) {
        self.set(ATTR_ARGUMENTS, args);
    }

    pub fn environment(&self) -> BTreeMap<String, String> {
        match self.get(ATTR_ENVIRONMENT) {
            Some(AttrValue::Map(env)) => env.clone(),
            _ => BTreeMap::new(),
        }
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        let mut env = self.environment();
        env.insert(key.to_owned(), value.to_owned());
        self.set(ATTR_ENVIRONMENT, env);
    }
}

impl FromIterator<(String, AttrValue)> for SlotAttributes {
    fn from_iter<T: IntoIterator<Item = (String, AttrValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
