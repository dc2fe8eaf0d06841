use crate::common::{registry_with, test_config, Breakage, BrokenPlugin, Harness, StaticPlugin};
use fwflow::core::{AnalysisStatus, Uid};
use fwflow::plugins::AnalysisPlugin;
use fwflow::unpack::UnpackerRegistry;
use fwflow::{Outcome, Request};
use serde_json::json;
use std::sync::Arc;

#[test]
fn failing_plugin_is_recorded_and_siblings_complete() {
    let broken = Arc::new(BrokenPlugin::new("header_parser", Breakage::Error));
    let hashes = Arc::new(StaticPlugin::new("hashes", &[]));
    let harness = Harness::start(
        test_config(),
        registry_with(vec![
            Arc::clone(&broken) as Arc<dyn AnalysisPlugin>,
            Arc::clone(&hashes) as Arc<dyn AnalysisPlugin>,
        ]),
        UnpackerRegistry::new(),
    );

    let ack = harness
        .pipeline
        .binding()
        .submit(Request::unpack("z.bin", &b"truncated image"[..]))
        .unwrap();
    harness.wait();

    let uid: Uid = ack.target.parse().unwrap();
    let object = harness.object(&uid);
    let failed = object.analysis("header_parser").unwrap();
    assert_eq!(failed.status, AnalysisStatus::Failed);
    assert_eq!(failed.plugin, "header_parser");
    assert_eq!(failed.result, json!({"failed": "corrupt header"}));
    assert_eq!(object.analysis("hashes").unwrap().status, AnalysisStatus::Completed);

    assert_eq!(
        harness.log.count(|o| matches!(
            o,
            Outcome::PluginFailed { plugin, error, .. } if plugin == "header_parser" && error == "corrupt header"
        )),
        1
    );
    // the object still finishes
    assert_eq!(
        harness.log.count(|o| matches!(o, Outcome::Analyzed { uid: u, .. } if u == &uid)),
        1
    );
}

#[test]
fn panicking_plugin_does_not_take_down_the_stage() {
    let panicky = Arc::new(BrokenPlugin::new("panicky", Breakage::Panic));
    let mut config = test_config();
    config.analysis.workers = 1;
    let harness = Harness::start(
        config,
        registry_with(vec![Arc::clone(&panicky) as Arc<dyn AnalysisPlugin>]),
        UnpackerRegistry::new(),
    );
    let binding = harness.pipeline.binding();

    for n in 0..3u8 {
        binding
            .submit(Request::unpack(format!("fw-{n}"), vec![b'f', b'w', n]))
            .unwrap();
    }
    harness.wait();

    assert_eq!(panicky.calls(), 3);
    assert_eq!(
        harness.log.count(|o| matches!(
            o,
            Outcome::PluginFailed { error, .. } if error.contains("index out of range")
        )),
        3
    );
    let object = harness.object(&Uid::from_content(b"fw\x02"));
    assert_eq!(object.analysis("panicky").unwrap().status, AnalysisStatus::Failed);
    assert_eq!(harness.pipeline.stats().analysis.failed, 3);
}

#[test]
fn reanalysis_reuses_results_unless_forced() {
    let counter = Arc::new(StaticPlugin::new("counter", &[]));
    let harness = Harness::start(
        test_config(),
        registry_with(vec![Arc::clone(&counter) as Arc<dyn AnalysisPlugin>]),
        UnpackerRegistry::new(),
    );
    let binding = harness.pipeline.binding();

    let ack = binding
        .submit(Request::unpack("fw.bin", &b"firmware"[..]))
        .unwrap();
    harness.wait();
    assert_eq!(counter.calls(), 1);

    let uid: Uid = ack.target.parse().unwrap();
    binding.submit(Request::analyze(uid.clone())).unwrap();
    harness.wait();
    assert_eq!(counter.calls(), 1);

    binding
        .submit(Request::Analyze {
            uid: uid.clone(),
            plugins: Some(vec!["counter".into()]),
            force: true,
            priority: 0,
        })
        .unwrap();
    harness.wait();
    assert_eq!(counter.calls(), 2);
    assert_eq!(
        harness.log.count(|o| matches!(o, Outcome::Analyzed { uid: u, .. } if u == &uid)),
        3
    );
}

#[test]
fn analysis_of_unknown_object_fails() {
    let harness = Harness::start(
        test_config(),
        registry_with(vec![Arc::new(StaticPlugin::new("counter", &[]))]),
        UnpackerRegistry::new(),
    );
    let ghost = Uid::from_content(b"never stored");

    harness
        .pipeline
        .binding()
        .submit(Request::analyze(ghost.clone()))
        .unwrap();
    harness.wait();

    assert_eq!(
        harness.log.count(|o| matches!(o, Outcome::AnalysisFailed { uid, .. } if uid == &ghost)),
        1
    );
}
