use super::*;
use crate::events::{EventAction, read_events};
use crate::test_support::{Sink, WAIT, holder, next_notification, pinned_cluster};
use crate::wire::FailureCode;
use std::thread;
use tempfile::TempDir;

const PR: LockMode = LockMode::ProtectedRead;
const CR: LockMode = LockMode::ConcurrentRead;
const EX: LockMode = LockMode::Exclusive;
const NL: LockMode = LockMode::NoLock;

fn granted(mode: LockMode) -> HolderState {
    HolderState {
        granted: mode,
        pending: None,
        blocking: None,
    }
}

/// Node 2 of a two-node cluster whose dispatcher goes nowhere; "R" is
/// mastered by node 1.
fn isolated_node(tweak: impl Fn(&mut Config)) -> (Arc<LockManager>, Receiver<(NodeId, NodeId, Message)>) {
    let (sink, sent) = Sink::new();
    let mut config = Config::for_node(2, &[1, 2]);
    config.masters.insert("R".to_string(), 1);
    tweak(&mut config);
    (LockManager::new(config, sink).unwrap(), sent)
}

fn response(
    holder: HolderId,
    status: ConversionStatus,
    mode: LockMode,
    generation: u32,
) -> Message {
    Message::Response(ConversionResponse {
        resource_name: "R".to_string(),
        holder,
        status,
        mode,
        generation,
    })
}

/// Grant `holder` PR on node 2's shadow by answering its acquire by hand.
fn shadow_at_pr(node: &Arc<LockManager>, sent: &Receiver<(NodeId, NodeId, Message)>, holder: HolderId) {
    let caller = {
        let node = node.clone();
        thread::spawn(move || node.acquire("R", holder, PR, LockFlags::default(), Some(WAIT)))
    };
    let (from, to, message) = sent.recv_timeout(WAIT).unwrap();
    assert_eq!((from, to), (2, 1));
    assert!(matches!(message, Message::Acquire(_)));
    node.handle_message(1, response(holder, ConversionStatus::Granted, PR, 1));
    assert_eq!(caller.join().unwrap(), Ok(ConversionOutcome::Granted(PR)));
}

#[test]
fn local_queued_conversion_is_granted_through_subscription() {
    let cluster = pinned_cluster(&[1], "R", 1);
    let node = cluster.node(1).unwrap();
    let events = node.subscribe();
    let (a, b) = (holder(1, 1), holder(1, 2));

    node.acquire("R", a, PR, LockFlags::default(), None).unwrap();
    node.acquire("R", b, PR, LockFlags::default(), None).unwrap();
    assert_eq!(
        node.request_conversion("R", a, EX, LockFlags::default(), None),
        Ok(ConversionOutcome::Queued)
    );
    assert_eq!(
        next_notification(&events),
        LocalNotification {
            resource: "R".to_string(),
            holder: b,
            kind: NotificationKind::Blocking(EX),
        }
    );

    node.release("R", b, None).unwrap();

    let grant = next_notification(&events);
    assert_eq!(grant.holder, a);
    assert_eq!(grant.kind, NotificationKind::Granted(EX));
    assert_eq!(node.holder_state("R", a), Some(granted(EX)));
}

#[test]
fn remote_conversion_is_queued_then_granted_asynchronously() {
    let cluster = pinned_cluster(&[1, 2], "R", 1);
    let (n1, n2) = (cluster.node(1).unwrap(), cluster.node(2).unwrap());
    let on_n1 = n1.subscribe();
    let on_n2 = n2.subscribe();
    let (a, b) = (holder(1, 1), holder(2, 1));

    assert_eq!(
        n1.acquire("R", a, PR, LockFlags::default(), None),
        Ok(ConversionOutcome::Granted(PR))
    );
    assert_eq!(
        n2.acquire("R", b, PR, LockFlags::default(), None),
        Ok(ConversionOutcome::Granted(PR))
    );
    assert_eq!(n2.holder_state("R", b), Some(granted(PR)));

    assert_eq!(
        n2.request_conversion("R", b, EX, LockFlags::default(), None),
        Ok(ConversionOutcome::Queued)
    );
    let pending = n2.holder_state("R", b).unwrap();
    assert_eq!(pending.granted, PR);
    assert_eq!(pending.pending, Some(EX));
    assert_eq!(next_notification(&on_n1).kind, NotificationKind::Blocking(EX));

    n1.release("R", a, None).unwrap();

    let grant = next_notification(&on_n2);
    assert_eq!(grant.holder, b);
    assert_eq!(grant.kind, NotificationKind::Granted(EX));
    assert_eq!(n2.holder_state("R", b), Some(granted(EX)));

    let snapshot = n1.snapshot(Some("R")).unwrap();
    assert_eq!(snapshot[0].granted.len(), 1);
    assert_eq!(snapshot[0].granted[0].holder, b);
    assert_eq!(snapshot[0].granted[0].granted_mode, EX);
}

#[test]
fn remote_release_drops_shadow_and_unused_resource() {
    let cluster = pinned_cluster(&[1, 2], "R", 1);
    let (n1, n2) = (cluster.node(1).unwrap(), cluster.node(2).unwrap());
    let b = holder(2, 1);

    n2.acquire("R", b, EX, LockFlags::default(), None).unwrap();
    assert_eq!(n1.snapshot(None).unwrap().len(), 1);

    n2.release("R", b, None).unwrap();

    assert_eq!(n2.holder_state("R", b), None);
    assert!(n2.shadows().is_empty());
    assert!(n1.snapshot(None).unwrap().is_empty());
    assert!(matches!(
        n2.release("R", b, None),
        Err(DlmError::NotHolder { .. })
    ));
}

#[test]
fn remote_no_queue_acquire_is_denied_without_shadow() {
    let cluster = pinned_cluster(&[1, 2], "R", 1);
    let (n1, n2) = (cluster.node(1).unwrap(), cluster.node(2).unwrap());

    n1.acquire("R", holder(1, 1), EX, LockFlags::default(), None)
        .unwrap();
    assert_eq!(
        n2.acquire("R", holder(2, 1), PR, LockFlags::no_queue(), None),
        Ok(ConversionOutcome::Denied)
    );
    assert_eq!(n2.holder_state("R", holder(2, 1)), None);
}

#[test]
fn cancelled_remote_conversion_reverts_on_denial() {
    let cluster = pinned_cluster(&[1, 2], "R", 1);
    let (n1, n2) = (cluster.node(1).unwrap(), cluster.node(2).unwrap());
    let on_n2 = n2.subscribe();
    let (a, b) = (holder(1, 1), holder(2, 1));

    n1.acquire("R", a, PR, LockFlags::default(), None).unwrap();
    n2.acquire("R", b, PR, LockFlags::default(), None).unwrap();
    assert_eq!(
        n2.request_conversion("R", b, EX, LockFlags::default(), None),
        Ok(ConversionOutcome::Queued)
    );
    assert!(matches!(
        n2.request_conversion("R", b, CR, LockFlags::default(), None),
        Err(DlmError::ConversionInProgress { .. })
    ));

    n2.cancel_conversion("R", b).unwrap();

    let denial = next_notification(&on_n2);
    assert_eq!(denial.kind, NotificationKind::Denied(PR));
    assert_eq!(n2.holder_state("R", b), Some(granted(PR)));
    // The lock is usable again.
    assert_eq!(
        n2.request_conversion("R", b, CR, LockFlags::default(), None),
        Ok(ConversionOutcome::Granted(CR))
    );
}

#[test]
fn holder_must_belong_to_the_calling_node() {
    let cluster = pinned_cluster(&[1, 2], "R", 1);
    let n1 = cluster.node(1).unwrap();
    assert!(matches!(
        n1.acquire("R", holder(2, 1), PR, LockFlags::default(), None),
        Err(DlmError::UserError(_))
    ));
}

#[test]
fn timed_out_request_keeps_shadow_pending_until_master_answers() {
    let (node, sent) = isolated_node(|_| {});
    let b = holder(2, 1);

    assert_eq!(
        node.acquire("R", b, PR, LockFlags::default(), Some(Duration::from_millis(20))),
        Err(DlmError::Timeout("R".to_string()))
    );
    assert!(matches!(sent.try_recv(), Ok((2, 1, Message::Acquire(_)))));
    assert_eq!(node.holder_state("R", b).unwrap().pending, Some(PR));
    assert!(matches!(
        node.acquire("R", b, PR, LockFlags::default(), None),
        Err(DlmError::AlreadyHolder { .. })
    ));

    // The late answer is applied with nobody waiting for it.
    node.handle_message(1, response(b, ConversionStatus::Granted, PR, 1));

    assert_eq!(node.holder_state("R", b), Some(granted(PR)));
}

#[test]
fn master_refusal_reaches_the_remote_caller() {
    let (node, sent) = isolated_node(|_| {});
    let b = holder(2, 1);
    shadow_at_pr(&node, &sent, b);

    let caller = {
        let node = node.clone();
        thread::spawn(move || node.request_conversion("R", b, EX, LockFlags::default(), Some(WAIT)))
    };
    sent.recv_timeout(WAIT).unwrap();
    node.handle_message(
        1,
        response(b, ConversionStatus::Failed(FailureCode::NotHolder), PR, 1),
    );

    assert!(matches!(
        caller.join().unwrap(),
        Err(DlmError::NotHolder { .. })
    ));
    assert_eq!(node.holder_state("R", b), Some(granted(PR)));
}

#[test]
fn master_death_resumes_waiter_with_retry_master() {
    let (node, sent) = isolated_node(|_| {});
    let b = holder(2, 1);
    shadow_at_pr(&node, &sent, b);

    let caller = {
        let node = node.clone();
        thread::spawn(move || node.request_conversion("R", b, EX, LockFlags::default(), None))
    };
    assert!(matches!(
        sent.recv_timeout(WAIT).unwrap(),
        (2, 1, Message::Convert(_))
    ));

    node.on_recovery_event(RecoveryEvent::NodeDown {
        node: 1,
        generation: 2,
    });

    assert_eq!(
        caller.join().unwrap(),
        Err(DlmError::RetryMaster("R".to_string()))
    );
    // Abandoned, not granted.
    assert_eq!(node.holder_state("R", b), Some(granted(PR)));
    let shadow = &node.shadows()[0];
    assert!(shadow.orphaned);
    assert_eq!(shadow.generation, 2);
}

#[test]
fn stale_notification_from_dead_master_is_dropped() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("events.ndjson");
    let (node, sent) = isolated_node(|config| config.event_log = Some(log.clone()));
    let b = holder(2, 1);
    shadow_at_pr(&node, &sent, b);

    node.on_recovery_event(RecoveryEvent::NodeDown {
        node: 1,
        generation: 2,
    });
    node.handle_message(
        1,
        Message::Notify(Notification {
            resource_name: "R".to_string(),
            holder: b,
            kind: NotificationKind::Granted(EX),
            generation: 1,
        }),
    );

    assert_eq!(node.holder_state("R", b), Some(granted(PR)));
    let actions: Vec<EventAction> = read_events(&log)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&EventAction::StaleDropped));
}

#[test]
fn dead_master_without_replacement_is_unreachable() {
    let (node, sent) = isolated_node(|config| config.master_wait_ms = 20);
    let b = holder(2, 1);
    shadow_at_pr(&node, &sent, b);

    node.on_recovery_event(RecoveryEvent::NodeDown {
        node: 1,
        generation: 2,
    });

    assert_eq!(
        node.request_conversion("R", b, EX, LockFlags::default(), None),
        Err(DlmError::MasterUnreachable {
            resource: "R".to_string(),
            master: 1
        })
    );
}

#[test]
fn node_down_purges_converting_holder_and_promotes_next_waiter() {
    let cluster = pinned_cluster(&[1, 2], "R", 1);
    let (n1, n2) = (cluster.node(1).unwrap(), cluster.node(2).unwrap());
    let on_n1 = n1.subscribe();
    let (x, z, b) = (holder(1, 1), holder(1, 2), holder(2, 1));

    n1.acquire("R", x, PR, LockFlags::default(), None).unwrap();
    n2.acquire("R", b, PR, LockFlags::default(), None).unwrap();
    assert_eq!(
        n2.request_conversion("R", b, EX, LockFlags::default(), None),
        Ok(ConversionOutcome::Queued)
    );
    // CR fits the granted PRs but not the pending EX ahead of it.
    assert_eq!(
        n1.acquire("R", z, CR, LockFlags::default(), None),
        Ok(ConversionOutcome::Queued)
    );
    assert_eq!(next_notification(&on_n1).kind, NotificationKind::Blocking(EX));

    cluster.kill(2);
    cluster.recover(RecoveryEvent::NodeDown {
        node: 2,
        generation: 2,
    });

    let grant = next_notification(&on_n1);
    assert_eq!(grant.holder, z);
    assert_eq!(grant.kind, NotificationKind::Granted(CR));
    let snapshot = &n1.snapshot(Some("R")).unwrap()[0];
    assert_eq!(snapshot.generation, 2);
    assert!(snapshot.converting.is_empty());
    assert!(snapshot.granted.iter().all(|l| l.holder.node == 1));
}

#[test]
fn replacement_master_rebuilds_granted_locks_from_survivors() {
    let cluster = pinned_cluster(&[1, 2, 3], "R", 3);
    let (n1, n2) = (cluster.node(1).unwrap(), cluster.node(2).unwrap());
    let on_n2 = n2.subscribe();
    let (a, b) = (holder(1, 1), holder(2, 1));

    n1.acquire("R", a, PR, LockFlags::default(), None).unwrap();
    n2.acquire("R", b, PR, LockFlags::default(), None).unwrap();

    cluster.kill(3);
    cluster.recover(RecoveryEvent::NodeDown {
        node: 3,
        generation: 2,
    });
    cluster.recover(RecoveryEvent::MasterAssigned {
        resource: "R".to_string(),
        master: 1,
        generation: 2,
    });
    cluster.settle(WAIT).unwrap();

    assert_eq!(n1.master_of("R"), 1);
    assert!(n1.shadows().is_empty());
    let snapshot = &n1.snapshot(Some("R")).unwrap()[0];
    assert_eq!(snapshot.master, 1);
    assert_eq!(snapshot.generation, 2);
    let holders: Vec<HolderId> = snapshot.granted.iter().map(|l| l.holder).collect();
    assert_eq!(holders, vec![a, b]);

    let shadow = &n2.shadows()[0];
    assert_eq!(shadow.master, 1);
    assert!(!shadow.orphaned);

    // Business as usual under the new master.
    assert_eq!(
        n2.request_conversion("R", b, EX, LockFlags::default(), None),
        Ok(ConversionOutcome::Queued)
    );
    n1.release("R", a, None).unwrap();
    let grant = next_notification(&on_n2);
    assert_eq!(grant.kind, NotificationKind::Granted(EX));
    assert_eq!(n2.holder_state("R", b), Some(granted(EX)));
}

#[test]
fn replacement_master_keeps_null_mode_locks() {
    let cluster = pinned_cluster(&[1, 2, 3], "R", 3);
    let (n1, n2) = (cluster.node(1).unwrap(), cluster.node(2).unwrap());
    let (a, b, c) = (holder(1, 1), holder(2, 1), holder(1, 2));

    n1.acquire("R", a, PR, LockFlags::default(), None).unwrap();
    assert_eq!(
        n2.acquire("R", b, NL, LockFlags::default(), None),
        Ok(ConversionOutcome::Granted(NL))
    );
    n1.acquire("R", c, NL, LockFlags::default(), None).unwrap();

    cluster.kill(3);
    cluster.recover(RecoveryEvent::NodeDown {
        node: 3,
        generation: 2,
    });
    cluster.recover(RecoveryEvent::MasterAssigned {
        resource: "R".to_string(),
        master: 1,
        generation: 2,
    });
    cluster.settle(WAIT).unwrap();

    // The new master's own null lock became authoritative, not a shadow.
    assert!(n1.shadows().is_empty());
    assert_eq!(n1.holder_state("R", c), Some(granted(NL)));

    let snapshot = &n1.snapshot(Some("R")).unwrap()[0];
    let mut holders: Vec<HolderId> = snapshot.granted.iter().map(|l| l.holder).collect();
    holders.sort();
    assert_eq!(holders, vec![a, c, b]);

    let shadow = &n2.shadows()[0];
    assert_eq!(shadow.master, 1);
    assert_eq!(shadow.granted, NL);
    assert!(!shadow.orphaned);

    assert_eq!(
        n2.request_conversion("R", b, CR, LockFlags::default(), None),
        Ok(ConversionOutcome::Granted(CR))
    );
}

#[test]
fn master_records_transitions_in_event_log() {
    let dir = TempDir::new().unwrap();
    let log_dir = dir.path().to_path_buf();
    let cluster = crate::cluster::LocalCluster::start_with(&[1, 2], |config| {
        config.masters.insert("R".to_string(), 1);
        config.event_log = Some(log_dir.join(format!("node{}.ndjson", config.node_id)));
    })
    .unwrap();
    let (n1, n2) = (cluster.node(1).unwrap(), cluster.node(2).unwrap());
    let (a, b) = (holder(1, 1), holder(2, 1));

    n1.acquire("R", a, EX, LockFlags::default(), None).unwrap();
    n2.acquire("R", b, PR, LockFlags::default(), None).unwrap();
    n1.release("R", a, None).unwrap();
    cluster.settle(WAIT).unwrap();

    let actions: Vec<EventAction> = read_events(&dir.path().join("node1.ndjson"))
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            EventAction::Grant,
            EventAction::Queue,
            EventAction::Release,
            EventAction::AsyncGrant,
        ]
    );
}
