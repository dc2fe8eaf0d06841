use crate::common::{
    registry_with, test_config, FlakyStore, Harness, OutcomeLog, PanickingUnpacker, SlowUnpacker,
    StaticPlugin, IDLE_TIMEOUT,
};
use fwflow::core::{AnalysisStatus, Uid, UNPACKER_PLUGIN};
use fwflow::plugins::AnalysisPlugin;
use fwflow::unpack::tar::build_archive;
use fwflow::unpack::UnpackerRegistry;
use fwflow::{Outcome, Pipeline, Request};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn slow_unpackers(unpacker: &Arc<SlowUnpacker>) -> UnpackerRegistry {
    let mut unpackers = UnpackerRegistry::with_builtins();
    unpackers.register(Arc::clone(unpacker) as Arc<dyn fwflow::unpack::Unpacker>);
    unpackers
}

#[test]
fn concurrent_duplicate_submissions_extract_once() {
    let unpacker = Arc::new(SlowUnpacker::new(Duration::from_millis(150)));
    let counter = Arc::new(StaticPlugin::new("counter", &[]));
    let harness = Harness::start(
        test_config(),
        registry_with(vec![Arc::clone(&counter) as Arc<dyn AnalysisPlugin>]),
        slow_unpackers(&unpacker),
    );
    let binding = harness.pipeline.binding();

    let first = {
        let binding = Arc::clone(&binding);
        thread::spawn(move || binding.submit(Request::unpack("fw.bin", &b"SLOW image"[..])))
    };
    let second = {
        let binding = Arc::clone(&binding);
        thread::spawn(move || binding.submit(Request::unpack("copy.bin", &b"SLOW image"[..])))
    };
    let uid: Uid = first.join().unwrap().unwrap().target.parse().unwrap();
    second.join().unwrap().unwrap();
    harness.wait();

    assert_eq!(unpacker.calls(), 1);
    assert_eq!(unpacker.max_running(), 1);

    let mut reports = harness.log.unpacked(&uid);
    reports.sort_by_key(|(_, reused)| *reused);
    assert_eq!(reports.len(), 2);
    let (fresh_children, fresh_reused) = &reports[0];
    let (reused_children, reused) = &reports[1];
    assert!(!*fresh_reused);
    assert!(*reused);
    assert_eq!(fresh_children.len(), 2);
    let mut fresh_children = fresh_children.clone();
    fresh_children.sort();
    assert_eq!(reused_children, &fresh_children);

    // the root and both extracted files, each analyzed once
    assert_eq!(counter.calls(), 3);
    let record = harness.store.record(&uid).unwrap();
    assert_eq!(record.children.len(), 2);
    assert!(record.processed_analysis.contains_key(UNPACKER_PLUGIN));

    let locks = harness.pipeline.stats().locks;
    assert_eq!(locks.held, 0);
    assert_eq!(locks.acquired, locks.released);
    assert_eq!(locks.acquired, 4);
}

#[test]
fn repeated_submissions_never_overlap_on_one_object() {
    let unpacker = Arc::new(SlowUnpacker::new(Duration::from_millis(30)));
    let mut config = test_config();
    config.unpacking.workers = 4;
    let harness = Harness::start(config, registry_with(Vec::new()), slow_unpackers(&unpacker));
    let binding = harness.pipeline.binding();

    for n in 0..10 {
        binding
            .submit(Request::unpack(format!("fw-{n}.bin"), &b"SLOW same bytes"[..]))
            .unwrap();
    }
    harness.wait();

    assert_eq!(unpacker.calls(), 1);
    assert_eq!(unpacker.max_running(), 1);
    let uid = Uid::from_content(b"SLOW same bytes");
    let reports = harness.log.unpacked(&uid);
    assert_eq!(reports.len(), 10);
    assert_eq!(reports.iter().filter(|(_, reused)| !reused).count(), 1);

    // ten submissions of the image plus its two extracted files
    let stats = harness.pipeline.stats();
    assert_eq!(stats.unpacking.completed, 12);
    assert_eq!(stats.locks.acquired, stats.locks.released);
    assert_eq!(stats.locks.held, 0);
}

/// A duplicate waiting on the lock must see the children the first
/// extraction stored, even when storing them is slow.
#[test]
fn lock_is_released_only_after_children_are_stored() {
    let unpacker = Arc::new(SlowUnpacker::new(Duration::from_millis(10)));
    let store = Arc::new(FlakyStore::new());
    store.set_write_delay(Duration::from_millis(60));
    let pipeline = Pipeline::start(
        test_config(),
        registry_with(Vec::new()),
        slow_unpackers(&unpacker),
        store.clone(),
        store.clone(),
    )
    .unwrap();
    let log = OutcomeLog::attach(&pipeline);
    let binding = pipeline.binding();

    let ack = binding
        .submit(Request::unpack("fw.bin", &b"SLOW racing"[..]))
        .unwrap();
    // lands while the first extraction is still writing its children
    thread::sleep(Duration::from_millis(40));
    binding
        .submit(Request::unpack("fw-again.bin", &b"SLOW racing"[..]))
        .unwrap();
    assert!(pipeline.wait_until_idle(IDLE_TIMEOUT));

    let uid: Uid = ack.target.parse().unwrap();
    assert_eq!(unpacker.calls(), 1);
    let reports = log.unpacked(&uid);
    assert_eq!(reports.len(), 2);
    for (children, _) in &reports {
        assert_eq!(children.len(), 2, "{reports:?}");
    }
    let locks = pipeline.shutdown().locks;
    assert_eq!(locks.acquired, locks.released);
}

#[test]
fn panicking_unpacker_fails_item_and_releases_lock() {
    let counter = Arc::new(StaticPlugin::new("counter", &[]));
    let mut unpackers = UnpackerRegistry::new();
    unpackers.register(Arc::new(PanickingUnpacker::default()));
    let harness = Harness::start(
        test_config(),
        registry_with(vec![Arc::clone(&counter) as Arc<dyn AnalysisPlugin>]),
        unpackers,
    );

    let ack = harness
        .pipeline
        .binding()
        .submit(Request::unpack("bad.bin", &b"BOOM"[..]))
        .unwrap();
    harness.wait();

    let uid: Uid = ack.target.parse().unwrap();
    assert_eq!(
        harness.log.count(|o| matches!(
            o,
            Outcome::UnpackFailed { error, .. } if error.contains("unpacker bug")
        )),
        1
    );
    let entry = harness.object(&uid).analysis(UNPACKER_PLUGIN).unwrap();
    assert_eq!(entry.status, AnalysisStatus::Failed);
    // the object is still analyzed as a single file
    assert_eq!(counter.calls(), 1);

    let stats = harness.pipeline.stats();
    assert_eq!(stats.unpacking.failed, 1);
    assert_eq!(stats.locks.held, 0);
    assert_eq!(stats.locks.acquired, stats.locks.released);
}

#[test]
fn resubmission_after_failed_extraction_reports_the_failure() {
    let unpacker = Arc::new(PanickingUnpacker::default());
    let counter = Arc::new(StaticPlugin::new("counter", &[]));
    let mut unpackers = UnpackerRegistry::new();
    unpackers.register(Arc::clone(&unpacker) as Arc<dyn fwflow::unpack::Unpacker>);
    let harness = Harness::start(
        test_config(),
        registry_with(vec![Arc::clone(&counter) as Arc<dyn AnalysisPlugin>]),
        unpackers,
    );
    let binding = harness.pipeline.binding();

    let ack = binding.submit(Request::unpack("bad.bin", &b"BOOM"[..])).unwrap();
    harness.wait();
    binding
        .submit(Request::unpack("bad-again.bin", &b"BOOM"[..]))
        .unwrap();
    harness.wait();

    let uid: Uid = ack.target.parse().unwrap();
    assert_eq!(unpacker.calls(), 1);
    let failures: Vec<String> = harness
        .log
        .all()
        .into_iter()
        .filter_map(|o| match o {
            Outcome::UnpackFailed { uid: u, error } if u == uid => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0], failures[1]);
    assert!(failures[0].contains("unpacker bug"));
    assert!(harness.log.unpacked(&uid).is_empty());
    assert_eq!(counter.calls(), 1);

    let stats = harness.pipeline.stats();
    assert_eq!(stats.unpacking.failed, 2);
    assert_eq!(stats.locks.acquired, stats.locks.released);
}

#[test]
fn nested_archives_are_unpacked_recursively() {
    let inner = build_archive(&[("bin/busybox", &b"\x7fELF busybox"[..])]);
    let outer = build_archive(&[("rootfs.tar", &inner[..]), ("version", &b"1.2.3"[..])]);
    let harness = Harness::start(
        test_config(),
        registry_with(Vec::new()),
        UnpackerRegistry::with_builtins(),
    );

    let ack = harness
        .pipeline
        .binding()
        .submit(Request::unpack("firmware.tar", outer))
        .unwrap();
    harness.wait();

    let root: Uid = ack.target.parse().unwrap();
    let busybox = harness.object(&Uid::from_content(b"\x7fELF busybox"));
    assert_eq!(busybox.depth(), 2);
    assert_eq!(busybox.root_uid(), &root);
    assert!(busybox.parents().contains(&Uid::from_content(&inner)));
    assert_eq!(harness.object(&root).children().len(), 2);
    assert_eq!(harness.store.object_count(), 4);
}

#[test]
fn depth_limit_stops_recursion() {
    let inner = build_archive(&[("bin/busybox", &b"\x7fELF busybox"[..])]);
    let outer = build_archive(&[("rootfs.tar", &inner[..])]);
    let mut config = test_config();
    config.unpacking.max_depth = 1;
    let harness = Harness::start(config, registry_with(Vec::new()), UnpackerRegistry::with_builtins());

    harness
        .pipeline
        .binding()
        .submit(Request::unpack("firmware.tar", outer))
        .unwrap();
    harness.wait();

    let limited = harness.object(&Uid::from_content(&inner));
    assert_eq!(
        limited.analysis(UNPACKER_PLUGIN).unwrap().result,
        json!({
            "plugin_used": null,
            "number_of_unpacked_files": 0,
            "file_names": [],
            "depth_limit_reached": true,
        })
    );
    assert!(limited.children().is_empty());
    assert_eq!(harness.store.object_count(), 2);
}
