//! Protocol switching on a running node: rejections, cool-down, epoch and
//! state guarantees

mod common;

use common::Cluster;
use ferrocache_core::{
    Error, PASSIVE_REPLICATION, SwitchStatus, TOTAL_ORDER, TWO_PHASE_COMMIT,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn test_unknown_protocol_leaves_state_untouched() {
    let cluster = Cluster::start(1, |c| c).unwrap();
    let replication = cluster.node(1).replication();

    let err = replication.switch_to("XA", false, false).unwrap_err();
    assert!(matches!(err, Error::NoSuchProtocol(ref id) if id == "XA"));
    assert_eq!(replication.status(), SwitchStatus::Safe);
    assert_eq!(replication.current_epoch(), 0);
    assert_eq!(replication.current_protocol_id(), TWO_PHASE_COMMIT);
    assert!(replication.switch_history().is_empty());
}

#[test]
fn test_second_request_inside_cool_down_is_rejected() {
    let cluster = Cluster::start(1, |c| c.with_switch_cool_down(Duration::from_secs(30))).unwrap();
    let replication = cluster.node(1).replication();

    let first = replication.switch_to(TOTAL_ORDER, false, false).unwrap();
    let err = replication
        .switch_to(PASSIVE_REPLICATION, false, false)
        .unwrap_err();
    match err {
        Error::SwitchCoolDown { remaining } => assert!(remaining > Duration::ZERO),
        other => panic!("expected a cool-down rejection, got {:?}", other),
    }

    let record = first.wait().unwrap();
    assert_eq!(record.to, TOTAL_ORDER);
    assert_eq!(replication.current_protocol_id(), TOTAL_ORDER);
    assert_eq!(replication.status(), SwitchStatus::Safe);

    // Still inside the window after the first switch finished
    assert!(matches!(
        replication.switch_to(TWO_PHASE_COMMIT, false, false),
        Err(Error::SwitchCoolDown { .. })
    ));
}

#[test]
fn test_switch_to_active_protocol_is_rejected() {
    let cluster = Cluster::start(1, |c| c).unwrap();
    let replication = cluster.node(1).replication();
    assert!(matches!(
        replication.switch_to(TWO_PHASE_COMMIT, false, false),
        Err(Error::SameProtocol(_))
    ));
    assert_eq!(replication.current_epoch(), 0);
}

#[test]
fn test_epochs_step_by_one_and_safe_never_keeps_old() {
    let cluster = Cluster::start(1, |c| c).unwrap();
    let node = cluster.node(1).clone();
    let stop = Arc::new(AtomicBool::new(false));

    // Sample the protocol state while switches run
    let sampler = {
        let node = node.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut last_epoch = 0;
            let mut samples = 0u64;
            while !stop.load(Ordering::SeqCst) {
                let view = node.replication().view();
                assert!(view.epoch >= last_epoch, "epoch went back: {} < {}", view.epoch, last_epoch);
                if view.status == SwitchStatus::Safe {
                    assert!(view.old.is_none(), "SAFE with an old protocol at {}", view.epoch);
                }
                last_epoch = view.epoch;
                samples += 1;
                thread::yield_now();
            }
            samples
        })
    };

    let plan = [
        (TOTAL_ORDER, false),
        (TWO_PHASE_COMMIT, false),
        (PASSIVE_REPLICATION, true),
        (TOTAL_ORDER, true),
        (TWO_PHASE_COMMIT, false),
    ];
    for (i, (target, stop_the_world)) in plan.into_iter().enumerate() {
        let before = node.replication().current_epoch();
        let record = node
            .replication()
            .switch_to(target, stop_the_world, false)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(record.epoch, before + 1);
        assert_eq!(node.replication().current_epoch(), i as u64 + 1);
        assert_eq!(node.replication().current_protocol_id(), target);

        // Commits keep working between switches
        cluster.put(1, &format!("k{}", i), "v").unwrap();
    }

    stop.store(true, Ordering::SeqCst);
    assert!(sampler.join().unwrap() > 0);

    let history = node.replication().switch_history();
    assert_eq!(history.len(), plan.len());
    let epochs: Vec<u64> = history.iter().map(|r| r.epoch).collect();
    assert_eq!(epochs, vec![1, 2, 3, 4, 5]);
    assert!(!history[0].stop_the_world);
    assert!(history[0].duration_to_unsafe.is_some());
    assert!(history[2].stop_the_world);
}

#[test]
fn test_report_lists_registered_protocols() {
    let cluster = Cluster::start(1, |c| c).unwrap();
    let report = cluster.node(1).replication().report();
    let ids: Vec<&str> = report
        .available_protocols
        .iter()
        .map(|p| p.id.as_str())
        .collect();
    assert_eq!(ids, vec![TWO_PHASE_COMMIT, PASSIVE_REPLICATION, TOTAL_ORDER]);
    assert!(report
        .available_protocols
        .iter()
        .any(|p| p.id == TOTAL_ORDER && p.uses_total_order));
    assert_eq!(report.status, SwitchStatus::Safe);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "SAFE");
}
