use crate::common::{
    registry_with, stored_object, test_config, Harness, SlowUnpacker, StaticPlugin, IDLE_TIMEOUT,
};
use fwflow::plugins::AnalysisPlugin;
use fwflow::unpack::tar::build_archive;
use fwflow::unpack::UnpackerRegistry;
use fwflow::{Outcome, PipelineError, Request};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn shutdown_drains_accepted_work_including_extracted_files() {
    let counter = Arc::new(StaticPlugin::new("counter", &[]).with_delay(Duration::from_millis(5)));
    let harness = Harness::start(
        test_config(),
        registry_with(vec![Arc::clone(&counter) as Arc<dyn AnalysisPlugin>]),
        UnpackerRegistry::with_builtins(),
    );
    let binding = harness.pipeline.binding();

    for n in 0..5 {
        let files: Vec<(String, Vec<u8>)> = (0..3)
            .map(|f| (format!("file-{f}"), format!("image {n} file {f}").into_bytes()))
            .collect();
        let entries: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(name, content)| (name.as_str(), content.as_slice()))
            .collect();
        binding
            .submit(Request::unpack(format!("fw-{n}.tar"), build_archive(&entries)))
            .unwrap();
    }
    let stats = harness.pipeline.shutdown();

    // five archives and fifteen extracted files
    assert_eq!(stats.unpacking.completed, 20);
    assert_eq!(stats.unpacking.queued + stats.unpacking.running, 0);
    assert_eq!(stats.unpacking.abandoned, 0);
    assert_eq!(stats.analysis.queued + stats.analysis.running, 0);
    assert_eq!(stats.analysis.completed, 40);
    assert_eq!(counter.calls(), 20);
    assert_eq!(harness.log.count(|o| matches!(o, Outcome::Analyzed { .. })), 20);
    assert_eq!(stats.locks.held, 0);
    assert_eq!(stats.locks.acquired, stats.locks.released);

    assert!(matches!(
        binding.submit(Request::unpack("late.bin", &b"late"[..])),
        Err(PipelineError::ShuttingDown { .. })
    ));
}

#[test]
fn cancel_abandons_queued_work() {
    let slow = Arc::new(StaticPlugin::new("slow", &[]).with_delay(Duration::from_millis(200)));
    let mut config = test_config();
    config.analysis.workers = 1;
    let harness = Harness::start(
        config,
        registry_with(vec![Arc::clone(&slow) as Arc<dyn AnalysisPlugin>]),
        UnpackerRegistry::new(),
    );
    let binding = harness.pipeline.binding();

    for n in 0..10u8 {
        let uid = stored_object(harness.store.as_ref(), &[b'o', n], &[]);
        binding.submit(Request::analyze(uid)).unwrap();
    }
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    let stats = harness.pipeline.cancel();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(stats.analysis.abandoned >= 1, "{stats:?}");
    assert!(slow.calls() < 10);
    assert!(matches!(
        binding.submit(Request::analyze(fwflow::core::Uid::from_content(b"o"))),
        Err(PipelineError::ShuttingDown { .. })
    ));
}

#[test]
fn locks_released_after_cancel_are_still_counted() {
    let unpacker = Arc::new(SlowUnpacker::new(Duration::from_millis(200)));
    let mut unpackers = UnpackerRegistry::with_builtins();
    unpackers.register(Arc::clone(&unpacker) as Arc<dyn fwflow::unpack::Unpacker>);
    let harness = Harness::start(test_config(), registry_with(Vec::new()), unpackers);
    let locks = harness.pipeline.lock_manager();

    harness
        .pipeline
        .binding()
        .submit(Request::unpack("fw.bin", &b"SLOW image"[..]))
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    let stats = harness.pipeline.cancel();
    assert_eq!(stats.locks.held, 1);

    // the running extraction finishes on its detached worker
    let deadline = Instant::now() + IDLE_TIMEOUT;
    while locks.stats().held > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let after = locks.stats();
    assert_eq!(unpacker.calls(), 1);
    assert_eq!(after.held, 0);
    assert_eq!(after.acquired, after.released);
}

#[test]
fn idle_pipeline_shuts_down_cleanly() {
    let harness = Harness::start(test_config(), registry_with(Vec::new()), UnpackerRegistry::new());
    assert!(harness.pipeline.is_idle());
    let stats = harness.pipeline.shutdown();
    assert_eq!(stats.unpacking.accepted(), 0);
    assert_eq!(stats.analysis.accepted(), 0);
    assert_eq!(stats.comparison.accepted(), 0);
}
