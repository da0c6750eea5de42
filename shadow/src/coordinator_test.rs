use crate::{
    agents::mock::{Call, RecordingAgent, ReconnectReply},
    attributes::{
        AttrValue, SlotAttributes, ATTR_CLAIM_ID, ATTR_CMD, ATTR_DISK_USAGE, ATTR_GLOBAL_JOB_ID,
        ATTR_IMAGE_SIZE, ATTR_IWD, ATTR_JOB_LEASE_DURATION, ATTR_MPI_IS_MASTER, ATTR_NODE,
        ATTR_ON_EXIT_SIGNAL, ATTR_OWNER, ATTR_PARALLEL_SHUTDOWN_POLICY,
    },
    arbiter::ShutdownPolicy,
    config::ActivationConfig,
    coordinator::{ControlReport, Coordinator, CoordinatorError, CoordinatorSettings},
    event::{self, Event},
    hooks::{CommandHooks, TransferHooks},
    matches::{ProcGroup, SlotMatch, StaticMatches},
    peer::{LaunchStyle, PeerState},
    reason::{ExitReason, ExitStatus, HoldCode, HoldRequest, JobOutcome},
    sequencer::{MPICH_ROOT, PROCGROUP_EXECUTABLE},
    store::{memory::MemoryStore, JobStore},
    usage::UsageUpdate,
    userlog::{JobEvent, UserLog},
};
use std::{collections::VecDeque, env, fs, path::PathBuf, time::Duration};

type TestCoordinator = Coordinator<RecordingAgent, StaticMatches, MemoryStore>;

fn settings(launch: LaunchStyle) -> CoordinatorSettings {
    CoordinatorSettings {
        activation: ActivationConfig {
            max_retries: 2,
            retry_delay: 0,
        },
        user_log: UserLog::Memory(Vec::new()),
        ..CoordinatorSettings::new(42, 0, launch)
    }
}

fn job_attributes(policy: ShutdownPolicy) -> SlotAttributes {
    let mut attributes = SlotAttributes::new();
    attributes.set(ATTR_CMD, "solver");
    attributes.set(ATTR_JOB_LEASE_DURATION, 1200_i64);
    attributes.set(ATTR_GLOBAL_JOB_ID, "submit.example.org#42.0");
    attributes.set(ATTR_PARALLEL_SHUTDOWN_POLICY, policy.to_string());

    attributes
}

fn slots(count: usize) -> Vec<ProcGroup> {
    vec![ProcGroup {
        slots: (0..count)
            .map(|node| SlotMatch {
                address: format!("<10.0.0.{node}:9618>"),
                claim_id: format!("claim-{node}"),
                attributes: SlotAttributes::new(),
            })
            .collect(),
    }]
}

fn coordinator_with(
    settings: CoordinatorSettings,
    attributes: SlotAttributes,
    count: usize,
    agent: RecordingAgent,
) -> TestCoordinator {
    let groups = slots(count);
    let rank0 = groups[0].slots[0].clone();
    let matches = StaticMatches::new(groups, attributes.clone());

    Coordinator::new(
        settings,
        attributes,
        rank0,
        agent,
        matches,
        MemoryStore::default(),
    )
}

fn coordinator(count: usize, policy: ShutdownPolicy) -> TestCoordinator {
    coordinator_with(
        settings(LaunchStyle::Parallel),
        job_attributes(policy),
        count,
        RecordingAgent::default(),
    )
}

/// spawned job with every node executing
fn executing(count: usize, policy: ShutdownPolicy, agent: RecordingAgent) -> TestCoordinator {
    let mut coordinator = coordinator_with(
        settings(LaunchStyle::Parallel),
        job_attributes(policy),
        count,
        agent,
    );
    coordinator.spawn();
    for node in 0..count {
        coordinator.handle_event(Event::BeganExecution { node });
    }
    assert!(coordinator.began_execution());

    coordinator
}

fn exited(coordinator: &mut TestCoordinator, node: usize, status: ExitStatus) {
    coordinator.handle_event(Event::PeerExited { node, status });
}

fn is_scheduled(coordinator: &TestCoordinator, event: &Event) -> bool {
    coordinator
        .scheduled()
        .iter()
        .any(|(scheduled, _)| scheduled == event)
}

#[test]
pub fn parallel_spawn_activates_every_node() {
    let mut coordinator = coordinator(3, ShutdownPolicy::WaitForNode0);
    coordinator.spawn();

    assert_eq!(coordinator.agent().activations(), vec![0, 1, 2]);
    assert_eq!(coordinator.next_to_start(), 3);
    assert!(coordinator
        .peers()
        .iter()
        .all(|peer| peer.state() == PeerState::Startup));

    let rank1 = coordinator.agent().attributes_of(1).expect("node 1 activated");
    assert_eq!(rank1.get_int(ATTR_NODE), Some(1));
    assert_eq!(rank1.get_str(ATTR_CLAIM_ID), Some("claim-1"));
    assert_eq!(rank1.get_str(ATTR_CMD), Some("solver"));
    assert_eq!(
        coordinator
            .agent()
            .attributes_of(0)
            .and_then(|attributes| attributes.get_bool(ATTR_MPI_IS_MASTER)),
        Some(true)
    );

    let recorded = coordinator.store().load_peers().expect("memory store");
    assert_eq!(recorded.len(), 3);
    assert_eq!(recorded[2].claim_id, "claim-2");
}

#[test]
pub fn spawn_happens_once() {
    let mut coordinator = coordinator(2, ShutdownPolicy::WaitForNode0);
    coordinator.spawn();
    coordinator.spawn();

    assert_eq!(coordinator.agent().activations(), vec![0, 1]);
    assert_eq!(coordinator.peers().len(), 2);
}

#[test]
pub fn all_executing_starts_queue_updates() {
    let coordinator = executing(3, ShutdownPolicy::WaitForNode0, RecordingAgent::default());

    assert!(is_scheduled(&coordinator, &Event::QueueUpdate));
    assert_eq!(
        coordinator.user_log().events(),
        &[JobEvent::Execute { nodes: 3 }]
    );
}

#[test]
pub fn signaled_peer_ends_the_job_under_wait_for_node0() {
    let mut coordinator = executing(3, ShutdownPolicy::WaitForNode0, RecordingAgent::default());

    exited(&mut coordinator, 1, ExitStatus::signaled(11));
    assert!(coordinator.is_shutting_down());
    assert_eq!(coordinator.agent().kills(), vec![0, 2]);
    assert!(!coordinator.is_finished());

    exited(&mut coordinator, 2, ExitStatus::exited(0));
    assert_eq!(
        coordinator.peer(2).and_then(|peer| peer.exit()),
        Some(ExitStatus::exited(0).with_exit_reason(ExitReason::Killed))
    );
    assert!(!coordinator.is_finished());

    exited(&mut coordinator, 0, ExitStatus::exited(0));

    match coordinator.outcome() {
        Some(JobOutcome::Exited { status, .. }) => {
            assert_eq!(*status, ExitStatus::signaled(11));
        }
        outcome => panic!("unexpected outcome {outcome:?}"),
    }
    assert_eq!(coordinator.exit_reason(), Some(ExitReason::Exited));
    assert_eq!(coordinator.exit_signal(), Some(11));
    assert_eq!(coordinator.exit_code(), None);
    assert_eq!(
        coordinator
            .store()
            .lookup_attr(None, ATTR_ON_EXIT_SIGNAL)
            .expect("memory store"),
        Some(AttrValue::Int(11))
    );
    assert!(matches!(
        coordinator.user_log().events().last(),
        Some(JobEvent::Terminated { .. })
    ));
    assert!(coordinator.scheduled().is_empty());
}

#[test]
pub fn rank0_exit_ends_the_job_while_a_kill_is_pending() {
    let mut coordinator = executing(3, ShutdownPolicy::WaitForNode0, RecordingAgent::default());

    exited(&mut coordinator, 1, ExitStatus::signaled(11));
    assert_eq!(
        coordinator.peer(2).map(|peer| peer.state()),
        Some(PeerState::PendingDeath)
    );

    exited(&mut coordinator, 0, ExitStatus::exited(0));

    assert!(coordinator.is_finished());
    assert_eq!(coordinator.job_exit(), Some(ExitStatus::signaled(11)));
    assert_eq!(coordinator.exit_signal(), Some(11));
    assert_eq!(
        coordinator.peer(2).map(|peer| peer.state()),
        Some(PeerState::PendingDeath)
    );
    assert_eq!(coordinator.agent().kills(), vec![0, 2]);
    assert!(coordinator.agent().cleaned_up);
}

#[test]
pub fn wait_for_all_waits_for_every_node() {
    let mut coordinator = executing(3, ShutdownPolicy::WaitForAll, RecordingAgent::default());

    exited(&mut coordinator, 0, ExitStatus::exited(0));
    exited(&mut coordinator, 2, ExitStatus::exited(1));
    assert!(!coordinator.is_finished());
    assert!(coordinator.agent().kills().is_empty());

    exited(&mut coordinator, 1, ExitStatus::exited(2));
    assert!(coordinator.is_finished());
    assert_eq!(coordinator.exit_code(), Some(0));
    assert_eq!(coordinator.outcome().map(JobOutcome::disposition), Some("exited"));
}

#[test]
pub fn rank0_exit_cleans_up_the_rest() {
    let mut coordinator = executing(3, ShutdownPolicy::WaitForNode0, RecordingAgent::default());

    exited(&mut coordinator, 0, ExitStatus::exited(0));

    assert!(coordinator.is_finished());
    assert_eq!(coordinator.agent().kills(), vec![1, 2]);
    assert!(coordinator
        .agent()
        .calls
        .contains(&Call::Deactivate {
            node: 1,
            graceful: false
        }));

    // late exits change nothing
    exited(&mut coordinator, 1, ExitStatus::signaled(9));
    assert_eq!(coordinator.exit_code(), Some(0));
}

#[test]
pub fn usage_is_aggregated_and_persisted() {
    let mut coordinator = executing(3, ShutdownPolicy::WaitForNode0, RecordingAgent::default());

    for (node, image) in [(0, 10), (1, 30), (2, 20)] {
        coordinator.handle_event(Event::Usage {
            node: Some(node),
            update: UsageUpdate {
                image_size_kb: Some(image),
                disk_usage_kb: Some(if node == 0 { 5 } else { 1 }),
                bytes_sent: Some(100),
                bytes_received: Some(20),
                ..Default::default()
            },
        });
    }
    coordinator.handle_event(Event::Usage {
        node: None,
        update: UsageUpdate {
            image_size_kb: Some(999),
            ..Default::default()
        },
    });
    coordinator.handle_event(Event::Usage {
        node: Some(9),
        update: UsageUpdate {
            image_size_kb: Some(999),
            ..Default::default()
        },
    });

    let usage = coordinator.usage();
    assert_eq!(usage.image_size_kb, 30);
    assert_eq!(usage.disk_usage_kb, 5);
    assert_eq!(usage.bytes_sent, 300);
    assert_eq!(usage.bytes_received, 60);

    let stored = |coordinator: &TestCoordinator, name| {
        coordinator
            .store()
            .lookup_attr(None, name)
            .expect("memory store")
    };
    assert_eq!(stored(&coordinator, ATTR_DISK_USAGE), Some(AttrValue::Int(5)));
    assert_eq!(stored(&coordinator, ATTR_IMAGE_SIZE), None);

    coordinator.handle_event(Event::QueueUpdate);
    assert_eq!(stored(&coordinator, ATTR_IMAGE_SIZE), Some(AttrValue::Int(30)));
}

#[test]
pub fn refused_activation_holds_the_job() {
    let mut agent = RecordingAgent::default();
    agent.refuse_activation.insert(1);

    let mut coordinator = coordinator_with(
        settings(LaunchStyle::Parallel),
        job_attributes(ShutdownPolicy::WaitForNode0),
        3,
        agent,
    );
    coordinator.spawn();

    match coordinator.outcome() {
        Some(JobOutcome::Held { code, .. }) => assert_eq!(*code, HoldCode::FailedToActivateClaim),
        outcome => panic!("unexpected outcome {outcome:?}"),
    }
    assert_eq!(coordinator.agent().activations(), vec![0, 1]);
    assert_eq!(coordinator.agent().kills(), vec![0]);
    assert!(coordinator
        .peers()
        .iter()
        .all(|peer| peer.state() == PeerState::Finished));
    assert_eq!(
        coordinator.peer(2).and_then(|peer| peer.exit()),
        Some(ExitStatus::with_reason(ExitReason::NotStarted))
    );
}

#[test]
pub fn delayed_activation_is_retried() {
    let mut agent = RecordingAgent::default();
    agent.try_again.insert(1, 2);

    let mut coordinator = coordinator_with(
        settings(LaunchStyle::Parallel),
        job_attributes(ShutdownPolicy::WaitForNode0),
        2,
        agent,
    );
    coordinator.spawn();

    assert!(!coordinator.is_finished());
    assert_eq!(coordinator.agent().activations(), vec![0, 1, 1, 1]);
}

#[test]
pub fn match_failure_requeues() {
    let attributes = job_attributes(ShutdownPolicy::WaitForNode0);
    let matches = StaticMatches::new(slots(2), attributes.clone());
    let rank0 = SlotMatch {
        address: "<10.0.0.9:9618>".to_owned(),
        claim_id: "claim-other".to_owned(),
        attributes: SlotAttributes::new(),
    };

    let mut coordinator = Coordinator::new(
        settings(LaunchStyle::Parallel),
        attributes,
        rank0,
        RecordingAgent::default(),
        matches,
        MemoryStore::default(),
    );
    coordinator.spawn();

    match coordinator.outcome() {
        Some(JobOutcome::Requeued { reason, message }) => {
            assert_eq!(*reason, ExitReason::NotStarted);
            assert!(message.contains("claim-other"));
        }
        outcome => panic!("unexpected outcome {outcome:?}"),
    }
    assert!(coordinator.agent().calls.is_empty());
}

#[test]
pub fn intercepted_launch_without_iwd_is_a_usage_error() {
    let mut coordinator = coordinator_with(
        settings(LaunchStyle::Intercepted),
        job_attributes(ShutdownPolicy::WaitForNode0),
        2,
        RecordingAgent::default(),
    );
    coordinator.spawn();

    assert_eq!(coordinator.exit_reason(), Some(ExitReason::ShadowUsage));
    match coordinator.outcome() {
        Some(JobOutcome::Held { code, .. }) => assert_eq!(*code, HoldCode::ShadowUsage),
        outcome => panic!("unexpected outcome {outcome:?}"),
    }
}

#[test]
pub fn intercepted_launch_after_a_comrade_finished() {
    let iwd = env::temp_dir().join(format!("pshadow-intercepted-{}", std::process::id()));
    fs::create_dir_all(&iwd).expect("scratch dir is writable");

    let mut attributes = job_attributes(ShutdownPolicy::WaitForAll);
    attributes.set(ATTR_IWD, iwd.to_string_lossy().into_owned());
    attributes.set(ATTR_OWNER, "alice");

    let mut coordinator = coordinator_with(
        settings(LaunchStyle::Intercepted),
        attributes,
        3,
        RecordingAgent::default(),
    );
    coordinator.spawn();
    assert_eq!(coordinator.agent().activations(), vec![0]);

    let launch = format!("ssh host1 -n {PROCGROUP_EXECUTABLE} host0 34000 -p4amslave");
    coordinator.handle_event(Event::InterceptedLaunch {
        args: launch.clone(),
    });
    assert_eq!(coordinator.agent().activations(), vec![0, 1]);

    exited(&mut coordinator, 1, ExitStatus::exited(0));
    assert_eq!(coordinator.peer(2).map(|peer| peer.state()), Some(PeerState::Pre));
    assert!(!coordinator.is_shutting_down());

    coordinator.handle_event(Event::InterceptedLaunch { args: launch });
    assert_eq!(coordinator.agent().activations(), vec![0, 1, 2]);
    assert_eq!(
        coordinator.peer(2).map(|peer| peer.state()),
        Some(PeerState::Startup)
    );
    assert!(!coordinator.is_finished());
    assert!(coordinator.agent().kills().is_empty());

    exited(&mut coordinator, 2, ExitStatus::exited(0));
    exited(&mut coordinator, 0, ExitStatus::exited(0));
    assert!(coordinator.is_finished());
    assert_eq!(coordinator.outcome().map(JobOutcome::disposition), Some("exited"));

    let _ = fs::remove_dir_all(&iwd);
}

#[test]
pub fn exit_notice_for_an_unstarted_peer_is_ignored() {
    let mut coordinator = coordinator_with(
        settings(LaunchStyle::Rendezvous),
        job_attributes(ShutdownPolicy::WaitForNode0),
        3,
        RecordingAgent::default(),
    );
    coordinator.spawn();

    exited(&mut coordinator, 2, ExitStatus::exited(0));
    assert_eq!(coordinator.peer(2).map(|peer| peer.state()), Some(PeerState::Pre));

    coordinator.handle_event(Event::RendezvousAddress {
        node: 0,
        address: "10.0.0.0:5555".to_owned(),
    });
    assert_eq!(coordinator.agent().activations(), vec![0, 1, 2]);
    assert!(!coordinator.is_shutting_down());
}

#[test]
pub fn rendezvous_address_starts_the_peers() {
    let mut coordinator = coordinator_with(
        settings(LaunchStyle::Rendezvous),
        job_attributes(ShutdownPolicy::WaitForNode0),
        3,
        RecordingAgent::default(),
    );
    coordinator.spawn();
    assert_eq!(coordinator.agent().activations(), vec![0]);

    // peers can't execute before they were started
    coordinator.handle_event(Event::BeganExecution { node: 2 });
    assert_eq!(coordinator.peer(2).map(|peer| peer.state()), Some(PeerState::Pre));

    coordinator.handle_event(Event::RendezvousAddress {
        node: 0,
        address: "10.0.0.0:5555".to_owned(),
    });
    assert_eq!(coordinator.agent().activations(), vec![0, 1, 2]);
    assert_eq!(
        coordinator
            .agent()
            .attributes_of(2)
            .map(|attributes| attributes.environment())
            .and_then(|env| env.get(MPICH_ROOT).cloned()),
        Some("10.0.0.0:5555".to_owned())
    );

    coordinator.handle_event(Event::RendezvousAddress {
        node: 0,
        address: "10.0.0.0:6666".to_owned(),
    });
    assert_eq!(coordinator.agent().activations(), vec![0, 1, 2]);
    assert!(!coordinator.is_shutting_down());
}

#[test]
pub fn rank0_exit_before_rendezvous_skips_the_peers() {
    let mut coordinator = coordinator_with(
        settings(LaunchStyle::Rendezvous),
        job_attributes(ShutdownPolicy::WaitForAll),
        3,
        RecordingAgent::default(),
    );
    coordinator.spawn();
    exited(&mut coordinator, 0, ExitStatus::exited(4));

    assert_eq!(coordinator.exit_code(), Some(4));
    assert_eq!(
        coordinator.peer(1).and_then(|peer| peer.exit()),
        Some(ExitStatus::with_reason(ExitReason::NotStarted))
    );

    coordinator.handle_event(Event::RendezvousAddress {
        node: 0,
        address: "10.0.0.0:5555".to_owned(),
    });
    assert_eq!(coordinator.agent().activations(), vec![0]);
}

#[test]
pub fn failing_pre_hook_holds_the_job() {
    let settings = CoordinatorSettings {
        hooks: TransferHooks::Command(CommandHooks {
            pre: Some(PathBuf::from("/bin/false")),
            post: None,
            reaper: None,
            timeout: Duration::from_secs(5),
        }),
        ..settings(LaunchStyle::Parallel)
    };
    let mut coordinator = coordinator_with(
        settings,
        job_attributes(ShutdownPolicy::WaitForNode0),
        2,
        RecordingAgent::default(),
    );
    coordinator.spawn();

    match coordinator.outcome() {
        Some(JobOutcome::Held { code, .. }) => assert_eq!(*code, HoldCode::HookFailure),
        outcome => panic!("unexpected outcome {outcome:?}"),
    }
    assert!(coordinator.agent().calls.is_empty());
}

#[test]
pub fn removal_before_spawn_removes() {
    let mut coordinator = coordinator(2, ShutdownPolicy::WaitForNode0);
    coordinator.handle_removal(15);

    assert_eq!(coordinator.outcome(), Some(&JobOutcome::Removed));
    assert!(coordinator.agent().calls.is_empty());

    coordinator.spawn();
    assert!(coordinator.agent().calls.is_empty());
}

#[test]
pub fn removal_kills_every_node() {
    let mut coordinator = executing(3, ShutdownPolicy::WaitForNode0, RecordingAgent::default());
    coordinator.handle_event(Event::Removal { signal: 15 });

    assert_eq!(coordinator.agent().kills(), vec![0, 1, 2]);
    assert_eq!(coordinator.frozen_exit().map(|status| status.reason), Some(ExitReason::Killed));

    exited(&mut coordinator, 0, ExitStatus::signaled(15));
    assert_eq!(coordinator.outcome(), Some(&JobOutcome::Removed));
}

#[test]
pub fn hold_keeps_the_request() {
    let mut coordinator = executing(2, ShutdownPolicy::WaitForNode0, RecordingAgent::default());
    coordinator.handle_event(Event::Hold(HoldRequest {
        reason: "held by alice".to_owned(),
        code: HoldCode::UserRequest,
        subcode: 7,
    }));

    assert_eq!(coordinator.agent().kills(), vec![0, 1]);
    exited(&mut coordinator, 0, ExitStatus::exited(0));

    assert_eq!(
        coordinator.outcome(),
        Some(&JobOutcome::Held {
            reason: "held by alice".to_owned(),
            code: HoldCode::UserRequest,
            subcode: 7,
        })
    );
    assert_eq!(coordinator.exit_reason(), Some(ExitReason::ShouldHold));
}

#[test]
pub fn suspend_and_resume_report_per_node() {
    let mut agent = RecordingAgent::default();
    agent.fail_suspend.insert(2);
    let mut coordinator = executing(3, ShutdownPolicy::WaitForNode0, agent);

    assert_eq!(
        coordinator.suspend_job(),
        ControlReport {
            succeeded: vec![0, 1],
            failed: vec![2],
        }
    );
    assert!(coordinator.peer(0).map_or(false, |peer| peer.is_suspended()));

    let report = coordinator.resume_job();
    assert!(report.all_succeeded());
    assert_eq!(report.succeeded, vec![0, 1, 2]);

    assert_eq!(
        &coordinator.user_log().events()[1..],
        &[
            JobEvent::Suspended { nodes: 2 },
            JobEvent::Resumed { nodes: 3 }
        ]
    );
}

#[test]
pub fn lost_rank0_is_reconnected() {
    let mut agent = RecordingAgent::default();
    agent.reconnect_replies.insert(
        0,
        VecDeque::from([ReconnectReply::Transient, ReconnectReply::Accept]),
    );
    let mut coordinator = executing(3, ShutdownPolicy::WaitForNode0, agent);

    coordinator.handle_event(Event::Disconnected {
        node: 0,
        reason: "connection reset".to_owned(),
    });
    assert_eq!(
        coordinator.peer(0).map(|peer| peer.state()),
        Some(PeerState::Reconnecting)
    );
    assert!(coordinator.is_reconnecting());
    assert!(is_scheduled(&coordinator, &Event::ReconnectAttempt { node: 0 }));

    coordinator.fire_timers();
    let (_, delay) = coordinator
        .scheduled()
        .into_iter()
        .find(|(event, _)| *event == Event::ReconnectAttempt { node: 0 })
        .expect("next attempt scheduled");
    assert!(delay > Duration::from_secs(6) && delay <= Duration::from_secs(8));

    coordinator.fire_timers();
    assert_eq!(
        coordinator.peer(0).map(|peer| peer.state()),
        Some(PeerState::Executing)
    );
    assert!(!coordinator.is_reconnecting());
    assert!(!coordinator.is_shutting_down());
    assert_eq!(
        coordinator
            .agent()
            .calls
            .iter()
            .filter(|call| **call == Call::Reconnect(0))
            .count(),
        2
    );
    assert!(coordinator
        .user_log()
        .events()
        .contains(&JobEvent::Reconnected { node: 0 }));
}

#[test]
pub fn lost_peer_is_evicted_under_wait_for_node0() {
    let mut coordinator = executing(3, ShutdownPolicy::WaitForNode0, RecordingAgent::default());

    coordinator.handle_event(Event::Disconnected {
        node: 1,
        reason: "connection reset".to_owned(),
    });
    assert_eq!(
        coordinator.peer(1).and_then(|peer| peer.exit()),
        Some(ExitStatus::with_reason(ExitReason::Evicted))
    );
    assert_eq!(coordinator.agent().kills(), vec![0, 2]);

    exited(&mut coordinator, 0, ExitStatus::exited(0));
    match coordinator.outcome() {
        Some(JobOutcome::Requeued { reason, .. }) => assert_eq!(*reason, ExitReason::Evicted),
        outcome => panic!("unexpected outcome {outcome:?}"),
    }
}

#[test]
pub fn reconnect_needs_a_job_lease() {
    let mut attributes = job_attributes(ShutdownPolicy::WaitForAll);
    attributes.remove(ATTR_JOB_LEASE_DURATION);
    let mut coordinator = coordinator_with(
        settings(LaunchStyle::Parallel),
        attributes,
        2,
        RecordingAgent::default(),
    );
    coordinator.spawn();

    coordinator.handle_event(Event::Disconnected {
        node: 1,
        reason: "connection reset".to_owned(),
    });

    assert!(!coordinator.is_reconnecting());
    assert_eq!(
        coordinator.peer(1).and_then(|peer| peer.exit()),
        Some(ExitStatus::with_reason(ExitReason::Evicted))
    );
}

#[test]
pub fn failed_reconnect_requeues() {
    let mut agent = RecordingAgent::default();
    agent
        .reconnect_replies
        .insert(0, VecDeque::from([ReconnectReply::Gone]));
    let mut coordinator = executing(3, ShutdownPolicy::WaitForNode0, agent);

    coordinator.handle_event(Event::Disconnected {
        node: 0,
        reason: "connection reset".to_owned(),
    });
    coordinator.fire_timers();

    match coordinator.outcome() {
        Some(JobOutcome::Requeued { reason, .. }) => {
            assert_eq!(*reason, ExitReason::ReconnectFailed)
        }
        outcome => panic!("unexpected outcome {outcome:?}"),
    }
    assert_eq!(coordinator.agent().kills(), vec![1, 2]);
    assert!(coordinator
        .user_log()
        .events()
        .iter()
        .any(|event| matches!(event, JobEvent::ReconnectFailed { node: 0, .. })));
}

#[test]
pub fn removal_waits_for_every_reconnect() {
    let mut agent = RecordingAgent::default();
    agent.reconnect_replies.insert(
        2,
        VecDeque::from([ReconnectReply::Transient, ReconnectReply::Accept]),
    );
    let mut coordinator = executing(3, ShutdownPolicy::WaitForAll, agent);

    for node in [1, 2] {
        coordinator.handle_event(Event::Disconnected {
            node,
            reason: "network partition".to_owned(),
        });
    }
    coordinator.handle_event(Event::Removal { signal: 15 });
    assert!(coordinator.agent().kills().is_empty());
    assert!(!coordinator.is_shutting_down());

    coordinator.fire_timers();
    assert_eq!(
        coordinator.peer(1).map(|peer| peer.state()),
        Some(PeerState::Executing)
    );
    assert!(coordinator.is_reconnecting());
    assert!(coordinator.agent().kills().is_empty());

    coordinator.fire_timers();
    assert!(!coordinator.is_reconnecting());
    assert_eq!(coordinator.agent().kills(), vec![0, 1, 2]);

    for node in 0..3 {
        exited(&mut coordinator, node, ExitStatus::signaled(15));
    }
    assert_eq!(coordinator.outcome(), Some(&JobOutcome::Removed));
}

#[test]
pub fn deferred_removal_survives_a_failed_reconnect() {
    let mut agent = RecordingAgent::default();
    agent.reconnect_replies.insert(
        0,
        VecDeque::from([ReconnectReply::Transient, ReconnectReply::Gone]),
    );
    let mut coordinator = executing(2, ShutdownPolicy::WaitForNode0, agent);

    coordinator.handle_event(Event::Disconnected {
        node: 0,
        reason: "connection reset".to_owned(),
    });
    coordinator.fire_timers();
    coordinator.handle_event(Event::Removal { signal: 15 });
    assert!(!coordinator.is_finished());

    coordinator.fire_timers();
    assert_eq!(coordinator.outcome(), Some(&JobOutcome::Removed));
}

#[test]
pub fn restart_reconnects_to_recorded_nodes() {
    let first = executing(3, ShutdownPolicy::WaitForNode0, RecordingAgent::default());
    let store = first.into_store();

    let attributes = job_attributes(ShutdownPolicy::WaitForNode0);
    let mut coordinator = Coordinator::restore(
        settings(LaunchStyle::Parallel),
        attributes.clone(),
        RecordingAgent::default(),
        StaticMatches::new(slots(3), attributes),
        store,
    )
    .expect("nodes were recorded");

    assert!(coordinator
        .peers()
        .iter()
        .all(|peer| peer.state() == PeerState::Reconnecting));
    assert_eq!(coordinator.next_to_start(), 3);

    coordinator.reconnect();
    coordinator.handle_removal(15);
    assert!(coordinator.agent().kills().is_empty());

    coordinator.fire_timers();

    assert!(coordinator.began_execution());
    assert!(coordinator.agent().activations().is_empty());
    assert_eq!(
        coordinator
            .agent()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::Reconnect(_)))
            .count(),
        3
    );
    assert_eq!(coordinator.agent().kills(), vec![0, 1, 2]);
}

#[test]
pub fn restore_needs_recorded_nodes() {
    let attributes = job_attributes(ShutdownPolicy::WaitForNode0);
    let restored = Coordinator::restore(
        settings(LaunchStyle::Parallel),
        attributes.clone(),
        RecordingAgent::default(),
        StaticMatches::new(slots(1), attributes),
        MemoryStore::default(),
    );

    assert!(matches!(restored, Err(CoordinatorError::NothingToRestore)));
}

#[test]
pub fn run_loop_drives_the_job() {
    let mut coordinator = coordinator(2, ShutdownPolicy::WaitForAll);
    coordinator.spawn();

    let (sender, receiver) = event::channel();
    for node in 0..2 {
        sender
            .send(Event::BeganExecution { node })
            .expect("receiver alive");
    }
    for node in 0..2 {
        sender
            .send(Event::PeerExited {
                node,
                status: ExitStatus::exited(0),
            })
            .expect("receiver alive");
    }

    let outcome = coordinator.run(&receiver).expect("job finishes");
    assert_eq!(outcome.disposition(), "exited");
}

#[test]
pub fn run_loop_fails_on_closed_channel() {
    let mut coordinator = coordinator(1, ShutdownPolicy::WaitForNode0);
    coordinator.spawn();

    let (sender, receiver) = event::channel();
    drop(sender);

    assert!(matches!(
        coordinator.run(&receiver),
        Err(CoordinatorError::ChannelClosed)
    ));
}
