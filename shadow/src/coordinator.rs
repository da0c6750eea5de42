use crate::{
    agents::{AgentError, ExecutionAgent},
    arbiter::{ShutdownArbiter, ShutdownPolicy},
    attributes::{
        AttrValue, SlotAttributes, ATTR_BYTES_RECVD, ATTR_BYTES_SENT, ATTR_CLAIM_ID,
        ATTR_DISK_USAGE, ATTR_EXIT_REASON, ATTR_GLOBAL_JOB_ID, ATTR_IMAGE_SIZE,
        ATTR_JOB_CURRENT_START_DATE, ATTR_JOB_CURRENT_START_EXECUTING_DATE,
        ATTR_JOB_LEASE_DURATION, ATTR_LAST_JOB_LEASE_RENEWAL, ATTR_ON_EXIT_CODE,
        ATTR_ON_EXIT_SIGNAL, ATTR_REMOTE_SYS_CPU, ATTR_REMOTE_USER_CPU,
    },
    config::{ActivationConfig, ReconnectConfig},
    event::{Event, EventReceiver},
    hooks::{HookKind, TransferHooks},
    matches::{MatchSource, SlotMatch},
    peer::{LaunchStyle, PeerHandle, PeerState},
    reason::{ExitReason, ExitStatus, HoldCode, HoldRequest, JobOutcome},
    reconnect::{began_execution, remaining_lease, ReconnectCompletion, ReconnectCoordinator},
    sequencer::{SequencerError, SpawnSequencer},
    store::{JobStore, PeerRecord, StoreError},
    usage::{aggregate, JobUsage, UsageUpdate},
    userlog::{JobEvent, UserLog},
};
use itertools::Itertools;
use std::{
    sync::mpsc::RecvTimeoutError,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Failed to restore the job from the job store")]
    Restore(#[from] StoreError),
    #[error("Job store has no nodes recorded for this job")]
    NothingToRestore,
    #[error("Job store is missing node {0}")]
    MissingNode(usize),
    #[error("Event channel closed before the job finished")]
    ChannelClosed,
}

/// Everything a coordinator needs besides its collaborators
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub cluster: i64,
    pub proc: i64,
    pub launch: LaunchStyle,
    pub activation: ActivationConfig,
    pub reconnect: ReconnectConfig,
    pub queue_update_interval: Duration,
    pub hooks: TransferHooks,
    pub user_log: UserLog,
}

impl CoordinatorSettings {
    pub fn new(cluster: i64, proc: i64, launch: LaunchStyle) -> Self {
        Self {
            cluster,
            proc,
            launch,
            activation: ActivationConfig::default(),
            reconnect: ReconnectConfig::default(),
            queue_update_interval: Duration::from_secs(900),
            hooks: TransferHooks::default(),
            user_log: UserLog::default(),
        }
    }
}

/// Which nodes accepted a job-wide suspend or resume
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControlReport {
    pub succeeded: Vec<usize>,
    pub failed: Vec<usize>,
}

impl ControlReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
struct Timer {
    due: Instant,
    event: Event,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Represents one multi-node job towards the scheduler and every execution agent
pub struct Coordinator<A: ExecutionAgent, M: MatchSource, S: JobStore> {
    cluster: i64,
    proc: i64,
    attributes: SlotAttributes,
    peers: Vec<PeerHandle>,
    sequencer: SpawnSequencer,
    arbiter: ShutdownArbiter,
    reconnector: ReconnectCoordinator,
    agent: A,
    matches: M,
    store: S,
    hooks: TransferHooks,
    user_log: UserLog,
    activation: ActivationConfig,
    queue_update_interval: Duration,
    timers: Vec<Timer>,
    began_execution: bool,
    remove_requested: bool,
    hold: Option<HoldRequest>,
    message: Option<String>,
    job_exit: Option<ExitStatus>,
    outcome: Option<JobOutcome>,
}

impl<A: ExecutionAgent, M: MatchSource, S: JobStore> Coordinator<A, M, S> {
    fn assemble(
        settings: CoordinatorSettings,
        attributes: SlotAttributes,
        peers: Vec<PeerHandle>,
        agent: A,
        matches: M,
        store: S,
    ) -> Self {
        let policy = ShutdownPolicy::from_attributes(&attributes);
        info!(
            cluster = settings.cluster,
            proc = settings.proc,
            "Using shutdown policy {policy} for {:?} launches",
            settings.launch
        );

        Self {
            cluster: settings.cluster,
            proc: settings.proc,
            attributes,
            peers,
            sequencer: SpawnSequencer::new(settings.launch, settings.cluster, settings.proc),
            arbiter: ShutdownArbiter::new(policy),
            reconnector: ReconnectCoordinator::new(settings.reconnect),
            agent,
            matches,
            store,
            hooks: settings.hooks,
            user_log: settings.user_log,
            activation: settings.activation,
            queue_update_interval: settings.queue_update_interval,
            timers: Vec::new(),
            began_execution: false,
            remove_requested: false,
            hold: None,
            message: None,
            job_exit: None,
            outcome: None,
        }
    }

    /// a coordinator for a fresh job attempt, rank 0 is matched to `rank0`
    pub fn new(
        settings: CoordinatorSettings,
        attributes: SlotAttributes,
        rank0: SlotMatch,
        agent: A,
        matches: M,
        store: S,
    ) -> Self {
        let mut specialized = attributes.clone();
        specialized.overlay(&rank0.attributes);
        let mut specialized = specialized.for_node(0);
        specialized.set(ATTR_CLAIM_ID, rank0.claim_id.as_str());

        let peer = PeerHandle::new(
            0,
            rank0.address,
            rank0.claim_id,
            specialized,
            settings.launch,
        );

        Self::assemble(settings, attributes, vec![peer], agent, matches, store)
    }

    /// a coordinator taking over the nodes a previous coordinator recorded, all RECONNECTING
    pub fn restore(
        settings: CoordinatorSettings,
        mut attributes: SlotAttributes,
        agent: A,
        matches: M,
        store: S,
    ) -> Result<Self, CoordinatorError> {
        let records = store.load_peers()?;
        if records.is_empty() {
            return Err(CoordinatorError::NothingToRestore);
        }

        for name in [
            ATTR_JOB_CURRENT_START_DATE,
            ATTR_JOB_CURRENT_START_EXECUTING_DATE,
        ] {
            if let Some(value) = store.lookup_attr(None, name)? {
                attributes.set(name, value);
            }
        }

        let mut peers = Vec::with_capacity(records.len());
        for (node, record) in records.into_iter().enumerate() {
            if record.node != node {
                return Err(CoordinatorError::MissingNode(node));
            }

            peers.push(PeerHandle::restored(
                record.node,
                record.address,
                record.claim_id,
                record.attributes,
                settings.launch,
            ));
        }
        info!("Restored {} node(s) from the job store", peers.len());

        let mut coordinator = Self::assemble(settings, attributes, peers, agent, matches, store);
        for node in 0..coordinator.peers.len() {
            coordinator.sequencer.started(node);
        }

        Ok(coordinator)
    }

    pub fn peers(&self) -> &[PeerHandle] {
        &self.peers
    }

    pub fn peer(&self, node: usize) -> Option<&PeerHandle> {
        self.peers.get(node)
    }

    pub fn attributes(&self) -> &SlotAttributes {
        &self.attributes
    }

    pub fn policy(&self) -> ShutdownPolicy {
        self.arbiter.policy()
    }

    pub fn next_to_start(&self) -> usize {
        self.sequencer.next_to_start()
    }

    pub fn sequencer(&self) -> &SpawnSequencer {
        &self.sequencer
    }

    pub fn is_shutting_down(&self) -> bool {
        self.arbiter.is_shutting_down()
    }

    pub fn frozen_exit(&self) -> Option<ExitStatus> {
        self.arbiter.frozen_exit()
    }

    pub fn began_execution(&self) -> bool {
        self.began_execution
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnector.in_flight()
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut A {
        &mut self.agent
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn user_log(&self) -> &UserLog {
        &self.user_log
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// job totals folded from every node's last sample
    pub fn usage(&self) -> JobUsage {
        aggregate(self.peers.iter().map(PeerHandle::usage))
    }

    /// job-level exit: the reported one, else the frozen one, else rank 0's
    pub fn job_exit(&self) -> Option<ExitStatus> {
        self.job_exit
            .or_else(|| self.arbiter.frozen_exit())
            .or_else(|| self.peers.first().and_then(PeerHandle::exit))
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.job_exit().map(|status| status.reason)
    }

    pub fn exit_signal(&self) -> Option<i32> {
        self.job_exit().and_then(|status| status.signal)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.job_exit().and_then(|status| status.code)
    }

    /// events waiting on a timer, soonest first
    pub fn scheduled(&self) -> Vec<(Event, Duration)> {
        let now = Instant::now();

        self.timers
            .iter()
            .sorted_by_key(|timer| timer.due)
            .map(|timer| (timer.event.clone(), timer.due.saturating_duration_since(now)))
            .collect()
    }

    /// handle every scheduled event once regardless of its due time, returns how many fired
    pub fn fire_timers(&mut self) -> usize {
        let timers = std::mem::take(&mut self.timers);
        let mut fired = 0;

        for timer in timers.into_iter().sorted_by_key(|timer| timer.due) {
            if self.is_finished() {
                break;
            }
            fired += 1;
            self.handle_event(timer.event);
        }

        fired
    }

    /// Claim every slot and start the nodes in the order the launch style requires
    pub fn spawn(&mut self) {
        if self.sequencer.next_to_start() > 0 || self.is_finished() {
            warn!("Job was already spawned, ignoring");
            return;
        }

        info!(
            cluster = self.cluster,
            proc = self.proc,
            "Spawning job with {:?} launch",
            self.sequencer.style()
        );
        self.update_job_attr(ATTR_JOB_CURRENT_START_DATE, now().into());
        self.record_peer(0);

        let claim_id = self.peers[0].claim().claim_id.clone();
        let slots = match self
            .matches
            .give_matches(self.cluster, &claim_id)
            .and_then(|reply| reply.into_peer_slots())
        {
            Ok(slots) => slots,
            Err(error) => {
                error!(error = ?error, "Failed to get matched slots: {error}");
                self.shut_down(ExitReason::NotStarted, &error.to_string());
                return;
            }
        };

        let style = self.sequencer.style();
        for (offset, slot) in slots.into_iter().enumerate() {
            let node = offset + 1;
            let mut attributes = slot.attributes.for_node(node);
            attributes.set(ATTR_CLAIM_ID, slot.claim_id.as_str());

            self.peers.push(PeerHandle::new(
                node,
                slot.address,
                slot.claim_id,
                attributes,
                style,
            ));
            self.record_peer(node);
        }
        info!("Job has {} node(s)", self.peers.len());

        match self.sequencer.start_master(&mut self.peers) {
            Ok(nodes) => self.activate_nodes(nodes),
            Err(error) => self.abort_startup(error),
        }
    }

    /// Reattach to every restored node without activating any claim
    pub fn reconnect(&mut self) {
        let nodes = self
            .peers
            .iter()
            .filter(|peer| peer.state() == PeerState::Reconnecting)
            .map(PeerHandle::node)
            .collect_vec();

        if nodes.is_empty() {
            warn!("No node is waiting to be reconnected");
            return;
        }

        info!("Reconnecting to {} node(s)", nodes.len());
        self.reconnector.begin(nodes.iter().copied(), true);
        for node in nodes {
            self.schedule(Duration::ZERO, Event::ReconnectAttempt { node });
        }
    }

    /// The job was removed, honoured right away unless a reconnect is in flight
    pub fn handle_removal(&mut self, signal: i32) {
        if self.is_finished() {
            debug!("Job already finished, ignoring removal");
            return;
        }

        if self.reconnector.in_flight() {
            self.reconnector.defer_removal(signal);
            return;
        }

        info!(signal = signal, "Job removal requested");
        self.remove_requested = true;
        self.note("Job was removed");
        self.evaluate_shutdown(ExitStatus::with_reason(ExitReason::Killed));
    }

    pub fn suspend_job(&mut self) -> ControlReport {
        let report = self.control_all(true);
        if !report.succeeded.is_empty() {
            self.log_event(JobEvent::Suspended {
                nodes: report.succeeded.len(),
            });
        }

        report
    }

    pub fn resume_job(&mut self) -> ControlReport {
        let report = self.control_all(false);
        if !report.succeeded.is_empty() {
            self.log_event(JobEvent::Resumed {
                nodes: report.succeeded.len(),
            });
        }

        report
    }

    fn control_all(&mut self, suspend: bool) -> ControlReport {
        let mut report = ControlReport::default();

        for peer in self
            .peers
            .iter_mut()
            .filter(|peer| !matches!(peer.state(), PeerState::Finished | PeerState::PendingDeath))
        {
            let result = if suspend {
                peer.suspend(&mut self.agent)
            } else {
                peer.resume(&mut self.agent)
            };

            match result {
                Ok(()) => report.succeeded.push(peer.node()),
                Err(error) => {
                    warn!(error = ?error, "Failed to {} node {}: {error}", if suspend { "suspend" } else { "resume" }, peer.node());
                    report.failed.push(peer.node());
                }
            }
        }

        report
    }

    /// End the job with `reason`, the first message given is the one reported
    pub fn shut_down(&mut self, reason: ExitReason, message: &str) {
        info!("Shutting down job: {message}");
        self.note(message);
        self.evaluate_shutdown(ExitStatus::with_reason(reason));
    }

    pub fn hold_job(&mut self, request: HoldRequest) {
        if self.is_finished() {
            debug!("Job already finished, ignoring hold");
            return;
        }

        info!("Job put on hold: {}", request.reason);
        self.note(&request.reason);
        self.hold = Some(request);
        self.evaluate_shutdown(ExitStatus::with_reason(ExitReason::ShouldHold));
    }

    pub fn handle_event(&mut self, event: Event) {
        trace!("Handling {event:?}");

        match event {
            Event::BeganExecution { node } => self.peer_began_execution(node),
            Event::Usage { node, update } => self.update_from_starter(node, update),
            Event::RendezvousAddress { node, address } => self.rendezvous_published(node, &address),
            Event::InterceptedLaunch { args } => self.intercepted_launch(&args),
            Event::PeerExited { node, status } => self.peer_exited(node, status),
            Event::Disconnected { node, reason } => self.peer_disconnected(node, &reason),
            Event::ReconnectAttempt { node } => self.attempt_reconnect(node),
            Event::QueueUpdate => self.queue_update(),
            Event::Removal { signal } => self.handle_removal(signal),
            Event::Hold(request) => self.hold_job(request),
            Event::Suspend => {
                self.suspend_job();
            }
            Event::Resume => {
                self.resume_job();
            }
        }
    }

    /// Dispatch events and timers one at a time until the job outcome is decided
    pub fn run(&mut self, events: &EventReceiver) -> Result<JobOutcome, CoordinatorError> {
        loop {
            if let Some(outcome) = &self.outcome {
                return Ok(outcome.clone());
            }

            if let Some(event) = self.pop_due_timer(Instant::now()) {
                self.handle_event(event);
                continue;
            }

            let event = match self.timers.iter().map(|timer| timer.due).min() {
                Some(deadline) => {
                    match events.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(CoordinatorError::ChannelClosed)
                        }
                    }
                }
                None => events
                    .recv()
                    .map_err(|_| CoordinatorError::ChannelClosed)?,
            };

            self.handle_event(event);
        }
    }

    fn schedule(&mut self, delay: Duration, event: Event) {
        debug!("Scheduling {event:?} in {}s", delay.as_secs());
        self.timers.push(Timer {
            due: Instant::now() + delay,
            event,
        });
    }

    fn pop_due_timer(&mut self, now: Instant) -> Option<Event> {
        let index = self
            .timers
            .iter()
            .position_min_by_key(|timer| timer.due)?;

        if self.timers[index].due <= now {
            Some(self.timers.swap_remove(index).event)
        } else {
            None
        }
    }

    fn known(&self, node: usize) -> bool {
        if node < self.peers.len() {
            true
        } else {
            warn!("Notification for unknown node {node}, ignoring");
            false
        }
    }

    fn note(&mut self, message: &str) {
        if self.message.is_none() {
            self.message = Some(message.to_owned());
        }
    }

    fn log_event(&mut self, event: JobEvent) {
        self.user_log.log(self.cluster, self.proc, event);
    }

    fn record_peer(&mut self, node: usize) {
        let peer = &self.peers[node];
        let record = PeerRecord {
            node,
            address: peer.claim().address.clone(),
            claim_id: peer.claim().claim_id.clone(),
            attributes: peer.attributes().clone(),
        };

        if let Err(error) = self.store.record_peer(&record) {
            warn!(node = node, error = ?error, "Failed to record node in the job store: {error}");
        }
    }

    fn update_job_attr(&mut self, name: &str, value: AttrValue) {
        if let Err(error) = self.store.update_attr(None, name, &value) {
            warn!(error = ?error, "Failed to update {name} in the job store: {error}");
        }
        self.attributes.set(name, value);
    }

    fn update_peer_attr(&mut self, node: usize, name: &str, value: AttrValue) {
        if let Err(error) = self.store.update_attr(Some(node), name, &value) {
            warn!(node = node, error = ?error, "Failed to update {name} in the job store: {error}");
        }
        self.peers[node].attributes_mut().set(name, value);
    }

    fn had_contact(&mut self, node: usize) {
        self.update_peer_attr(node, ATTR_LAST_JOB_LEASE_RENEWAL, now().into());
    }

    fn persist_exit(&mut self, node: Option<usize>, status: ExitStatus) {
        let mut values = vec![(ATTR_EXIT_REASON, AttrValue::Int(status.reason as i64))];
        if let Some(signal) = status.signal {
            values.push((ATTR_ON_EXIT_SIGNAL, AttrValue::Int(signal as i64)));
        }
        if let Some(code) = status.code {
            values.push((ATTR_ON_EXIT_CODE, AttrValue::Int(code as i64)));
        }

        for (name, value) in values {
            match node {
                Some(node) => self.update_peer_attr(node, name, value),
                None => self.update_job_attr(name, value),
            }
        }
    }

    fn persist_usage(&mut self) {
        let usage = self.usage();

        self.update_job_attr(ATTR_IMAGE_SIZE, usage.image_size_kb.into());
        self.update_job_attr(ATTR_DISK_USAGE, usage.disk_usage_kb.into());
        self.update_job_attr(ATTR_REMOTE_USER_CPU, usage.cpu_user_secs.into());
        self.update_job_attr(ATTR_REMOTE_SYS_CPU, usage.cpu_system_secs.into());
        self.update_job_attr(ATTR_BYTES_SENT, usage.bytes_sent.into());
        self.update_job_attr(ATTR_BYTES_RECVD, usage.bytes_received.into());
    }

    fn activate_nodes(&mut self, nodes: Vec<usize>) {
        for node in nodes {
            if self.is_finished() || self.arbiter.is_shutting_down() {
                debug!(node = node, "Job is shutting down, not starting node");
                return;
            }

            if let Err(error) =
                self.hooks
                    .run(HookKind::Pre, Some(node), self.peers[node].attributes())
            {
                error!(node = node, error = ?error, "Transfer hook failed: {error}");
                self.hold = Some(HoldRequest {
                    reason: format!("Transfer hook failed for node {node}: {error}"),
                    code: HoldCode::HookFailure,
                    subcode: 0,
                });
                self.shut_down(ExitReason::NotStarted, "Transfer hook failed");
                return;
            }

            match self.peers[node].activate_claim(&mut self.agent, &self.activation) {
                Ok(()) => {
                    self.sequencer.started(node);
                    self.update_peer_attr(node, ATTR_JOB_CURRENT_START_DATE, now().into());
                    self.had_contact(node);
                }
                Err(error) => {
                    let reason = match error.agent_error() {
                        Some(source) => format!("{error}: {source}"),
                        None => error.to_string(),
                    };
                    error!(node = node, "Failed to activate claim: {reason}");
                    self.hold = Some(HoldRequest {
                        reason: format!("Failed to activate claim: {reason}"),
                        code: HoldCode::FailedToActivateClaim,
                        subcode: 0,
                    });
                    self.shut_down(ExitReason::NotStarted, "Failed to activate claim");
                    return;
                }
            }
        }
    }

    fn abort_startup(&mut self, error: SequencerError) {
        let reason = if error.is_usage() {
            ExitReason::ShadowUsage
        } else {
            ExitReason::NotStarted
        };

        error!(error = ?error, "Failed to start the job: {error}");
        self.shut_down(reason, &error.to_string());
    }

    fn evaluate_shutdown(&mut self, proposed: ExitStatus) {
        if let Some(status) = self
            .arbiter
            .evaluate(&mut self.peers, &mut self.agent, proposed)
        {
            self.finish(status);
        }
    }

    fn finish(&mut self, status: ExitStatus) {
        for peer in self
            .peers
            .iter_mut()
            .filter(|peer| peer.state().is_running())
        {
            info!(node = peer.node(), "Job is done, cleaning up node");
            if let Err(error) = peer.kill_starter(&mut self.agent, false) {
                warn!(error = ?error, "Failed to clean up node {}: {error}", peer.node());
            }
        }

        self.sequencer.cleanup();
        self.agent.cleanup();
        self.timers.clear();

        let usage = self.usage();
        let message = self
            .message
            .clone()
            .unwrap_or_else(|| status.reason.to_string());
        let outcome = JobOutcome::decide(
            status,
            &message,
            self.hold.as_ref(),
            self.remove_requested,
            usage,
        );
        info!(
            disposition = outcome.disposition(),
            "Job finished: {}", status.reason
        );

        self.persist_exit(None, status);
        self.persist_usage();
        self.log_event(JobEvent::Terminated {
            outcome: outcome.clone(),
        });

        if let Err(error) = self.hooks.run(HookKind::Reaper, None, &self.attributes) {
            warn!(error = ?error, "Reaper hook failed: {error}");
        }

        self.job_exit = Some(status);
        self.outcome = Some(outcome);
    }

    fn peer_began_execution(&mut self, node: usize) {
        if !self.known(node) {
            return;
        }

        match self.peers[node].begin_execution() {
            Ok(true) => {
                self.update_peer_attr(node, ATTR_JOB_CURRENT_START_EXECUTING_DATE, now().into());
                self.had_contact(node);
                self.check_all_executing();
            }
            Ok(false) => debug!(node = node, "Node was already executing"),
            Err(error) => warn!("Ignoring execution notice: {error}"),
        }
    }

    fn check_all_executing(&mut self) {
        if self.began_execution
            || !self
                .peers
                .iter()
                .all(|peer| peer.state() == PeerState::Executing)
        {
            return;
        }

        info!("All {} node(s) are executing", self.peers.len());
        self.began_execution = true;
        self.log_event(JobEvent::Execute {
            nodes: self.peers.len(),
        });
        self.update_job_attr(ATTR_JOB_CURRENT_START_EXECUTING_DATE, now().into());
        self.start_queue_updates();
    }

    fn start_queue_updates(&mut self) {
        self.timers.retain(|timer| timer.event != Event::QueueUpdate);
        self.schedule(self.queue_update_interval, Event::QueueUpdate);
    }

    fn update_from_starter(&mut self, node: Option<usize>, update: UsageUpdate) {
        let Some(node) = node else {
            warn!("Usage update without a node, can't process it");
            return;
        };
        if !self.known(node) {
            return;
        }

        let before = self.usage();
        match self.peers[node].update_from_starter(&update) {
            Ok(true) => {
                self.update_peer_attr(node, ATTR_JOB_CURRENT_START_EXECUTING_DATE, now().into());
                self.check_all_executing();
            }
            Ok(false) => {}
            Err(error) => warn!("Ignoring state in usage update: {error}"),
        }
        self.had_contact(node);

        let after = self.usage();
        if after.disk_usage_kb > before.disk_usage_kb {
            self.update_job_attr(ATTR_DISK_USAGE, after.disk_usage_kb.into());
        }
        if after.cpu_user_secs > before.cpu_user_secs
            || after.cpu_system_secs > before.cpu_system_secs
        {
            self.update_job_attr(ATTR_REMOTE_USER_CPU, after.cpu_user_secs.into());
            self.update_job_attr(ATTR_REMOTE_SYS_CPU, after.cpu_system_secs.into());
        }
    }

    fn rendezvous_published(&mut self, node: usize, address: &str) {
        if self.is_finished() || self.arbiter.is_shutting_down() {
            debug!("Job is shutting down, ignoring rendezvous address");
            return;
        }

        match self
            .sequencer
            .rendezvous_published(node, address, &mut self.peers)
        {
            Ok(nodes) => self.activate_nodes(nodes),
            Err(error) if error.is_protocol() => warn!("Rejected rendezvous address: {error}"),
            Err(error) => self.abort_startup(error),
        }
    }

    fn intercepted_launch(&mut self, args: &str) {
        if self.is_finished() || self.arbiter.is_shutting_down() {
            debug!("Job is shutting down, ignoring intercepted launch");
            return;
        }

        match self.sequencer.intercepted_launch(args, &mut self.peers) {
            Ok(node) => self.activate_nodes(vec![node]),
            Err(error) if error.is_protocol() => warn!("Rejected intercepted launch: {error}"),
            Err(error) => self.abort_startup(error),
        }
    }

    fn peer_exited(&mut self, node: usize, status: ExitStatus) {
        if !self.known(node) {
            return;
        }

        let recorded = match self.peers[node].record_exit(status) {
            Ok(recorded) => recorded,
            Err(error) => {
                warn!("Ignoring exit notice: {error}");
                return;
            }
        };
        info!(node = node, "Node finished: {:?}", recorded);
        self.persist_exit(Some(node), recorded);

        if let Err(error) = self
            .hooks
            .run(HookKind::Post, Some(node), self.peers[node].attributes())
        {
            warn!(node = node, error = ?error, "Transfer hook failed: {error}");
        }

        if !recorded.is_normal() {
            self.note(&format!("Node {node} finished abnormally: {}", recorded.reason));
        }
        self.evaluate_shutdown(recorded);

        if let Some(completion) = self.reconnector.peer_done(node) {
            self.reconnect_completed(completion);
        }
    }

    fn reconnect_unsupported(&self, node: usize) -> Option<String> {
        let attributes = self.peers[node].attributes();

        if !self.agent.supports_reconnect() {
            Some("the execution agent does not support it".to_owned())
        } else if !self.peers[node].launch().supports_reconnect() {
            Some(format!(
                "{:?} launches cannot reconnect",
                self.peers[node].launch()
            ))
        } else if !attributes.contains(ATTR_JOB_LEASE_DURATION)
            && !self.attributes.contains(ATTR_JOB_LEASE_DURATION)
        {
            Some(format!("the job has no {ATTR_JOB_LEASE_DURATION}"))
        } else if !attributes.contains(ATTR_GLOBAL_JOB_ID)
            && !self.attributes.contains(ATTR_GLOBAL_JOB_ID)
        {
            Some(format!("the job has no {ATTR_GLOBAL_JOB_ID}"))
        } else {
            None
        }
    }

    fn peer_disconnected(&mut self, node: usize, reason: &str) {
        if !self.known(node) {
            return;
        }
        if !self.peers[node].state().is_running() {
            debug!(
                node = node,
                "Ignoring disconnect in state {}",
                self.peers[node].state()
            );
            return;
        }

        warn!(node = node, "Lost connection to node: {reason}");
        self.log_event(JobEvent::Disconnected {
            node,
            reason: reason.to_owned(),
        });

        let allowed = match self.reconnect_unsupported(node) {
            Some(why) => {
                info!(node = node, "Not reconnecting: {why}");
                false
            }
            None if self.policy() == ShutdownPolicy::WaitForNode0 && node != 0 => {
                info!(node = node, "Only rank 0 is reconnected under WAIT_FOR_NODE0");
                false
            }
            None => true,
        };

        match self.peers[node].disconnect(allowed) {
            Ok(PeerState::Reconnecting) => {
                self.reconnector.begin([node], false);
                self.schedule(Duration::ZERO, Event::ReconnectAttempt { node });
            }
            Ok(_) => {
                self.note(&format!("Node {node} disconnected: {reason}"));
                if let Some(exit) = self.peers[node].exit() {
                    self.persist_exit(Some(node), exit);
                    self.evaluate_shutdown(exit);
                }
            }
            Err(error) => warn!("Ignoring disconnect: {error}"),
        }
    }

    fn attempt_reconnect(&mut self, node: usize) {
        if !self.known(node) {
            return;
        }
        if self.peers[node].state() != PeerState::Reconnecting {
            debug!(node = node, "Node is no longer reconnecting");
            return;
        }

        if let Some(why) = self.reconnect_unsupported(node) {
            self.reconnect_failed(node, &format!("Reconnect is not possible: {why}"));
            return;
        }

        let attributes = self.peers[node].attributes();
        let lease = attributes
            .get_int(ATTR_JOB_LEASE_DURATION)
            .or_else(|| self.attributes.get_int(ATTR_JOB_LEASE_DURATION))
            .unwrap_or_default();
        let Some(last_renewal) = attributes.get_int(ATTR_LAST_JOB_LEASE_RENEWAL) else {
            self.reconnect_failed(node, "No job lease renewal was ever recorded");
            return;
        };

        let remaining = remaining_lease(lease, last_renewal, now());
        if remaining == 0 {
            self.reconnect_failed(
                node,
                &format!("Job disconnected too long: {ATTR_JOB_LEASE_DURATION} ({lease} seconds) expired"),
            );
            return;
        }

        let attempt = self.reconnector.record_attempt(node);
        info!(
            node = node,
            "Attempting to reconnect (attempt {attempt}), {remaining}s left on the job lease"
        );

        match self.peers[node].reconnect(&mut self.agent) {
            Ok(state) => {
                info!(node = node, "Reconnect SUCCESS, node is {state}");
                self.had_contact(node);
                self.log_event(JobEvent::Reconnected { node });

                if self.arbiter.is_shutting_down() {
                    info!(node = node, "Job is shutting down, killing reconnected node");
                    if let Err(error) = self.peers[node].kill_starter(&mut self.agent, false) {
                        warn!("Failed to kill reconnected node: {error}");
                    }
                }

                if let Some(completion) = self.reconnector.peer_done(node) {
                    self.reconnect_completed(completion);
                }
            }
            Err(error) if error.agent_error().map_or(false, AgentError::is_transient) => {
                let delay = self.reconnector.next_delay(node, remaining);
                info!(
                    node = node,
                    "Reconnect attempt failed: {error}, trying again in {}s",
                    delay.as_secs()
                );
                self.schedule(delay, Event::ReconnectAttempt { node });
            }
            Err(error) => {
                let reason = match error.agent_error() {
                    Some(source) => format!("{error}: {source}"),
                    None => error.to_string(),
                };
                self.reconnect_failed(node, &reason);
            }
        }
    }

    fn reconnect_failed(&mut self, node: usize, reason: &str) {
        error!(node = node, "Reconnect FAILED: {reason}");
        self.log_event(JobEvent::ReconnectFailed {
            node,
            reason: reason.to_owned(),
        });

        if let Err(error) = self.peers[node].reconnect_failed() {
            warn!("{error}");
        }
        if self.reconnector.deferred_removal().is_some() {
            self.remove_requested = true;
        }
        // the job ends below, nothing to resume
        if let Some(completion) = self.reconnector.peer_done(node) {
            debug!(
                at_startup = completion.at_startup,
                "Last pending reconnect failed, deferred removal: {:?}",
                completion.deferred_removal
            );
        }

        self.note(reason);
        self.evaluate_shutdown(ExitStatus::with_reason(ExitReason::ReconnectFailed));
    }

    fn reconnect_completed(&mut self, completion: ReconnectCompletion) {
        info!("Every node is reconnected");

        if completion.at_startup {
            self.began_execution = began_execution(
                self.attributes
                    .get_int(ATTR_JOB_CURRENT_START_EXECUTING_DATE),
                self.attributes.get_int(ATTR_JOB_CURRENT_START_DATE),
            );
            info!(
                "Job {} executing before the restart",
                if self.began_execution { "was" } else { "was not yet" }
            );
        }

        if self.began_execution {
            if !self.is_finished() {
                self.start_queue_updates();
            }
        } else {
            self.check_all_executing();
        }

        if let Some(signal) = completion.deferred_removal {
            info!(signal = signal, "Replaying deferred removal");
            self.handle_removal(signal);
        }
    }

    fn queue_update(&mut self) {
        if self.is_finished() {
            return;
        }

        debug!("Periodic queue update");
        self.persist_usage();
        self.schedule(self.queue_update_interval, Event::QueueUpdate);
    }
}
