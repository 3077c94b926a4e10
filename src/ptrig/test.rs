use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::*;
use crate::block::{BlockState, Computation};
use crate::testutil::{counter_block, cyclic_block, io_block, node_with_std};
use crate::trigger::Triggee;

fn ptrig_block(node: &Arc<crate::node::Node>, name: &str, period_us: i64) -> Arc<Block> {
    let b = node.block_create(PTRIG_PROTO, name).unwrap();
    b.config_set_scalar(
        "period",
        Period {
            sec: 0,
            usec: period_us,
        },
    )
    .unwrap();
    b
}

#[test]
fn test_sched_config_validation() {
    let node = node_with_std("t-ptrig-sched");

    // period is mandatory.
    let b = node.block_create(PTRIG_PROTO, "p0").unwrap();
    assert!(matches!(b.init(), Err(Error::InvalidConfig(_))));

    // RT policy without priority.
    let b = ptrig_block(&node, "p1", 1000);
    b.config_set_str("sched_policy", "SCHED_FIFO").unwrap();
    assert!(matches!(b.init(), Err(Error::InvalidConfig(_))));

    // Non-RT policy with priority.
    let b = ptrig_block(&node, "p2", 1000);
    b.config_set_scalar::<i32>("sched_priority", 10).unwrap();
    assert!(matches!(b.init(), Err(Error::InvalidConfig(_))));

    // Unknown policy string.
    let b = ptrig_block(&node, "p3", 1000);
    b.config_set_str("sched_policy", "SCHED_BATCH").unwrap();
    assert!(matches!(b.init(), Err(Error::InvalidConfig(_))));

    // Undersized stack.
    let b = ptrig_block(&node, "p4", 1000);
    b.config_set_scalar::<usize>("stacksize", 1024).unwrap();
    assert!(matches!(b.init(), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_ptrig_drives_chain() {
    let node = node_with_std("t-ptrig-drive");
    let (_a, a_steps) = counter_block(&node, "a");

    let trig = ptrig_block(&node, "pt", 2_000);
    trig.init().unwrap();
    trig.config_set_slice("chain0", &[Triggee::new("a", 1, 0).unwrap()])
        .unwrap();
    trig.start().unwrap();
    assert_eq!(trig.state(), BlockState::Active);

    thread::sleep(Duration::from_millis(100));
    trig.stop().unwrap();
    let after_stop = a_steps.load(Ordering::Relaxed);

    // ~50 firings expected at 2 ms; accept wide scheduling slack.
    assert!(after_stop >= 10, "only {after_stop} steps");

    // Once stopped, the worker idles.
    thread::sleep(Duration::from_millis(20));
    let later = a_steps.load(Ordering::Relaxed);
    assert!(later <= after_stop + 1);

    trig.cleanup().unwrap();
    assert_eq!(trig.state(), BlockState::Preinit);
}

struct Stamper {
    stamps: Arc<Mutex<Vec<crate::time::Timespec>>>,
}

impl Computation for Stamper {
    fn step(&mut self, _b: &Block) -> Result<()> {
        self.stamps.lock().unwrap().push(crate::time::gettime()?);
        Ok(())
    }
}

#[test]
fn test_ptrig_firing_times_are_paced() {
    let node = node_with_std("t-ptrig-pace");
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let fstamps = Arc::clone(&stamps);
    node.block_register(crate::block::BlockProto::computation(
        "stamper",
        move || Stamper {
            stamps: Arc::clone(&fstamps),
        },
    ))
    .unwrap();
    let s = node.block_create("stamper", "s1").unwrap();
    s.init().unwrap();
    s.start().unwrap();

    let period_us = 5_000i64;
    let trig = ptrig_block(&node, "pt", period_us);
    trig.init().unwrap();
    trig.config_set_slice("chain0", &[Triggee::new("s1", 1, 0).unwrap()])
        .unwrap();
    trig.start().unwrap();

    thread::sleep(Duration::from_millis(120));
    trig.stop().unwrap();

    let stamps = stamps.lock().unwrap();
    assert!(stamps.len() >= 5, "only {} firings", stamps.len());

    // Firing times are non-decreasing and paced by the absolute
    // deadlines: the average interval cannot undercut the period.
    for pair in stamps.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    let span = (*stamps.last().unwrap() - stamps[0]).to_ns() as i64;
    let expect = (stamps.len() as i64 - 1) * period_us * 1_000;
    assert!(
        span >= expect * 8 / 10,
        "span {span} ns for {} firings",
        stamps.len()
    );
}

#[test]
fn test_chain_switching() {
    let node = node_with_std("t-ptrig-switch");
    let (_a, a_steps) = counter_block(&node, "a");
    let (_b, b_steps) = counter_block(&node, "b");

    // Feed the active_chain port through an int fifo.
    let sel_fifo = cyclic_block(&node, "sel", "int", 1, 4);
    let sel_src = io_block(
        &node,
        "selsrc",
        vec![crate::block::PortSpec::new("out").output("int")],
    );
    let sel_out = sel_src.port("out").unwrap();
    sel_out.connect_out(&sel_fifo).unwrap();

    let trig = ptrig_block(&node, "pt", 2_000);
    trig.config_set_scalar::<i32>("num_chains", 2).unwrap();
    trig.init().unwrap();
    trig.port("active_chain").unwrap().connect_in(&sel_fifo).unwrap();
    trig.config_set_slice("chain0", &[Triggee::new("a", 1, 0).unwrap()])
        .unwrap();
    trig.config_set_slice("chain1", &[Triggee::new("b", 1, 0).unwrap()])
        .unwrap();
    trig.start().unwrap();

    thread::sleep(Duration::from_millis(60));
    assert!(a_steps.load(Ordering::Relaxed) > 0);
    assert_eq!(b_steps.load(Ordering::Relaxed), 0);

    // Switch to chain1: only b advances from here on.
    sel_out.write(&node.new_value::<i32>(&[1]).unwrap()).unwrap();
    thread::sleep(Duration::from_millis(30));
    let a_mark = a_steps.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(60));
    assert!(b_steps.load(Ordering::Relaxed) > 0);
    assert!(a_steps.load(Ordering::Relaxed) <= a_mark + 1);

    // Out-of-range selection is warned about and ignored.
    let b_before = b_steps.load(Ordering::Relaxed);
    sel_out.write(&node.new_value::<i32>(&[2]).unwrap()).unwrap();
    thread::sleep(Duration::from_millis(60));
    assert!(b_steps.load(Ordering::Relaxed) > b_before);
    let a_frozen = a_steps.load(Ordering::Relaxed);

    // And switching back to chain0 resumes a.
    sel_out.write(&node.new_value::<i32>(&[0]).unwrap()).unwrap();
    thread::sleep(Duration::from_millis(60));
    assert!(a_steps.load(Ordering::Relaxed) > a_frozen);

    trig.stop().unwrap();
    trig.cleanup().unwrap();
}

#[test]
fn test_stop_writes_profile() {
    let node = node_with_std("t-ptrig-profile");
    let (_a, _) = counter_block(&node, "a");

    let dir = tempfile::tempdir().unwrap();
    let trig = ptrig_block(&node, "pt", 2_000);
    trig.config_set_scalar::<i32>("tstats_mode", 2).unwrap();
    trig.config_set_str("tstats_profile_path", dir.path().to_str().unwrap())
        .unwrap();
    trig.init().unwrap();
    trig.config_set_slice("chain0", &[Triggee::new("a", 1, 0).unwrap()])
        .unwrap();
    trig.start().unwrap();
    thread::sleep(Duration::from_millis(60));
    trig.stop().unwrap();

    // The worker flushes on its way into the idle wait.
    let path = dir.path().join("pt-chain0.tstats");
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !path.exists() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let contents = std::fs::read_to_string(&path).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next().unwrap(), crate::trigger::CSV_HEADER);
    assert!(lines.next().unwrap().starts_with("a, "));
    assert!(lines.next().unwrap().starts_with("pt/chain0, "));

    trig.cleanup().unwrap();
    node.cleanup();
}

#[test]
fn test_cleanup_without_start() {
    let node = node_with_std("t-ptrig-clean");
    let trig = ptrig_block(&node, "pt", 1_000);
    trig.init().unwrap();
    trig.cleanup().unwrap();
    assert_eq!(trig.state(), BlockState::Preinit);

    // Re-init works after a full cycle.
    trig.init().unwrap();
    trig.cleanup().unwrap();
}
