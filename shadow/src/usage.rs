use serde::{Deserialize, Serialize};

/// State of the payload as told by the execution agent
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteJobState {
    Running,
    Suspended,
    Exited,
}

/// Last known resource usage of a single peer
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct UsageSample {
    pub cpu_user_secs: f64,
    pub cpu_system_secs: f64,
    pub image_size_kb: u64,
    pub disk_usage_kb: u64,
    pub memory_usage_mb: u64,
    pub resident_set_size_kb: u64,
    pub proportional_set_size_kb: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A (partial) usage report as sent by an execution agent, absent fields are left untouched
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UsageUpdate {
    pub cpu_user_secs: Option<f64>,
    pub cpu_system_secs: Option<f64>,
    pub image_size_kb: Option<u64>,
    pub disk_usage_kb: Option<u64>,
    pub memory_usage_mb: Option<u64>,
    pub resident_set_size_kb: Option<u64>,
    pub proportional_set_size_kb: Option<u64>,
    pub bytes_sent: Option<u64>,
    pub bytes_received: Option<u64>,
    pub job_state: Option<RemoteJobState>,
}

impl UsageSample {
    /// merge an update: cpu, memory and transfer counters are replaced, sizes only grow
    pub fn merge(&mut self, update: &UsageUpdate) {
        if let Some(value) = update.cpu_user_secs {
            self.cpu_user_secs = value;
        }
        if let Some(value) = update.cpu_system_secs {
            self.cpu_system_secs = value;
        }
        if let Some(value) = update.memory_usage_mb {
            self.memory_usage_mb = value;
        }
        if let Some(value) = update.bytes_sent {
            self.bytes_sent = value;
        }
        if let Some(value) = update.bytes_received {
            self.bytes_received = value;
        }

        let grow = |current: &mut u64, value: Option<u64>| {
            if let Some(value) = value {
                *current = (*current).max(value);
            }
        };

        grow(&mut self.image_size_kb, update.image_size_kb);
        grow(&mut self.disk_usage_kb, update.disk_usage_kb);
        grow(&mut self.resident_set_size_kb, update.resident_set_size_kb);
        grow(
            &mut self.proportional_set_size_kb,
            update.proportional_set_size_kb,
        );
    }
}

/// Job-level usage totals
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct JobUsage {
    pub cpu_user_secs: f64,
    pub cpu_system_secs: f64,
    pub image_size_kb: u64,
    pub disk_usage_kb: u64,
    pub memory_usage_mb: u64,
    pub resident_set_size_kb: u64,
    pub proportional_set_size_kb: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Fold all peer samples into job totals: sizes take the maximum, counters are summed
pub fn aggregate<'a, I: IntoIterator<Item = &'a UsageSample>>(samples: I) -> JobUsage {
    samples
        .into_iter()
        .fold(JobUsage::default(), |mut total, sample| {
            total.image_size_kb = total.image_size_kb.max(sample.image_size_kb);
            total.disk_usage_kb = total.disk_usage_kb.max(sample.disk_usage_kb);
            total.memory_usage_mb = total.memory_usage_mb.max(sample.memory_usage_mb);
            total.resident_set_size_kb = total
                .resident_set_size_kb
                .max(sample.resident_set_size_kb);
            total.proportional_set_size_kb = total
                .proportional_set_size_kb
                .max(sample.proportional_set_size_kb);

            total.bytes_sent = total.bytes_sent.saturating_add(sample.bytes_sent);
            total.bytes_received = total.bytes_received.saturating_add(sample.bytes_received);
            total.cpu_user_secs += sample.cpu_user_secs;
            total.cpu_system_secs += sample.cpu_system_secs;

            total
        })
}
