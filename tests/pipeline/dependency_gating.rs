use crate::common::{registry_with, stored_object, test_config, CountingCompare, Harness, StaticPlugin};
use fwflow::core::{AnalysisStatus, ComparisonId, COMPARE_SKIPPED};
use fwflow::plugins::{AnalysisPlugin, ComparePlugin, PluginRegistry};
use fwflow::unpack::UnpackerRegistry;
use fwflow::{Outcome, Request};
use fwflow::storage::ObjectStore;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn compare_registry(plugin: Arc<CountingCompare>) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
        .register_compare(plugin as Arc<dyn ComparePlugin>)
        .unwrap();
    registry
}

#[test]
fn compare_with_missing_prerequisite_is_skipped_without_running() {
    let plugin = Arc::new(CountingCompare::new("type_diff", &["file_type"]));
    let harness = Harness::start(
        test_config(),
        compare_registry(Arc::clone(&plugin)),
        UnpackerRegistry::new(),
    );
    let x = stored_object(harness.store.as_ref(), b"firmware-x", &[]);

    harness
        .pipeline
        .binding()
        .submit(Request::compare(vec![x]))
        .unwrap();
    harness.wait();

    assert_eq!(plugin.calls(), 0);
    let comparisons = harness.log.comparisons();
    assert_eq!(comparisons.len(), 1);
    let (result, reused) = &comparisons[0];
    assert!(!reused);
    assert_eq!(
        serde_json::to_value(result.plugin("type_diff").unwrap()).unwrap(),
        json!({"Compare Skipped": {"all": "Required analysis not present: file_type"}})
    );
}

#[test]
fn compare_runs_once_when_every_object_is_ready() {
    let plugin = Arc::new(CountingCompare::new("type_diff", &["file_type"]));
    let harness = Harness::start(
        test_config(),
        compare_registry(Arc::clone(&plugin)),
        UnpackerRegistry::new(),
    );
    let x = stored_object(harness.store.as_ref(), b"firmware-x", &["file_type"]);
    let y = stored_object(harness.store.as_ref(), b"firmware-y", &["file_type"]);

    harness
        .pipeline
        .binding()
        .submit(Request::compare(vec![x, y]))
        .unwrap();
    harness.wait();

    assert_eq!(plugin.calls(), 1);
    let (result, _) = &harness.log.comparisons()[0];
    let entry = result.plugin("type_diff").unwrap();
    assert!(!entry.contains_key(COMPARE_SKIPPED));
    assert_eq!(entry["object_count"].value_for("all"), Some(&json!(2)));
}

#[test]
fn one_unready_member_blocks_the_whole_batch() {
    let plugin = Arc::new(CountingCompare::new("type_diff", &["file_type", "file_hashes"]));
    let harness = Harness::start(
        test_config(),
        compare_registry(Arc::clone(&plugin)),
        UnpackerRegistry::new(),
    );
    let x = stored_object(harness.store.as_ref(), b"x", &["file_type", "file_hashes"]);
    let y = stored_object(harness.store.as_ref(), b"y", &["file_type"]);
    let z = stored_object(harness.store.as_ref(), b"z", &[]);

    harness
        .pipeline
        .binding()
        .submit(Request::compare(vec![x, y, z]))
        .unwrap();
    harness.wait();

    assert_eq!(plugin.calls(), 0);
    let (result, _) = &harness.log.comparisons()[0];
    assert_eq!(
        serde_json::to_value(result.plugin("type_diff").unwrap()).unwrap(),
        json!({"Compare Skipped": {"all": "Required analysis not present: file_hashes, file_type"}})
    );
    // nothing ran, so the item itself counts as skipped
    assert_eq!(harness.pipeline.stats().comparison.skipped, 1);
}

#[test]
fn gated_comparison_reruns_once_its_objects_are_analyzed() {
    let plugin = Arc::new(CountingCompare::new("type_diff", &["file_type"]));
    let mut registry = registry_with(vec![Arc::new(StaticPlugin::new("file_type", &[]))]);
    registry
        .register_compare(Arc::clone(&plugin) as Arc<dyn ComparePlugin>)
        .unwrap();
    let harness = Harness::start(test_config(), registry, UnpackerRegistry::new());
    let x = stored_object(harness.store.as_ref(), b"firmware-x", &["file_type"]);
    let y = stored_object(harness.store.as_ref(), b"firmware-y", &[]);
    let binding = harness.pipeline.binding();

    binding
        .submit(Request::compare(vec![x.clone(), y.clone()]))
        .unwrap();
    harness.wait();
    assert_eq!(plugin.calls(), 0);

    binding.submit(Request::analyze(y)).unwrap();
    harness.wait();

    assert_eq!(plugin.calls(), 1);
    let comparisons = harness.log.comparisons();
    assert_eq!(comparisons.len(), 2);
    assert!(comparisons[0].0.plugin("type_diff").unwrap().contains_key(COMPARE_SKIPPED));
    let (latest, reused) = &comparisons[1];
    assert!(!reused);
    assert_eq!(
        latest.plugin("type_diff").unwrap()["object_count"].value_for("all"),
        Some(&json!(2))
    );
    let stats = harness.pipeline.stats();
    assert_eq!(stats.comparison.skipped, 1);
    assert_eq!(stats.comparison.completed, 1);
}

#[test]
fn analysis_finishing_during_a_comparison_still_refreshes_it() {
    let gated = Arc::new(CountingCompare::new("a_gated", &["file_type"]));
    let slow = Arc::new(CountingCompare::new("z_slow", &[]).with_delay(Duration::from_millis(600)));
    let mut registry = registry_with(vec![Arc::new(
        StaticPlugin::new("file_type", &[]).with_delay(Duration::from_millis(150)),
    )]);
    registry
        .register_compare(Arc::clone(&gated) as Arc<dyn ComparePlugin>)
        .unwrap();
    registry
        .register_compare(Arc::clone(&slow) as Arc<dyn ComparePlugin>)
        .unwrap();
    let harness = Harness::start(test_config(), registry, UnpackerRegistry::new());
    let x = stored_object(harness.store.as_ref(), b"firmware-x", &[]);
    let binding = harness.pipeline.binding();

    binding.submit(Request::compare(vec![x.clone()])).unwrap();
    // lands while z_slow holds the comparison open
    thread::sleep(Duration::from_millis(50));
    binding.submit(Request::analyze(x.clone())).unwrap();
    harness.wait();

    assert!(harness.object(&x).has_completed("file_type"));
    assert_eq!(gated.calls(), 1);
    assert_eq!(harness.log.comparisons().len(), 2);
    let stored = harness
        .store
        .get_comparison(&ComparisonId::from_uids(&[x]))
        .unwrap()
        .unwrap();
    assert!(!stored.plugin("a_gated").unwrap().contains_key(COMPARE_SKIPPED));
}

#[test]
fn analysis_plugins_run_after_their_dependencies() {
    let base = Arc::new(StaticPlugin::new("base", &[]));
    let middle = Arc::new(StaticPlugin::new("middle", &["base"]));
    let top = Arc::new(StaticPlugin::new("top", &["middle", "base", "unpacker"]));
    let harness = Harness::start(
        test_config(),
        registry_with(vec![
            Arc::clone(&top) as Arc<dyn AnalysisPlugin>,
            Arc::clone(&middle) as Arc<dyn AnalysisPlugin>,
            Arc::clone(&base) as Arc<dyn AnalysisPlugin>,
        ]),
        UnpackerRegistry::new(),
    );

    let ack = harness
        .pipeline
        .binding()
        .submit(Request::unpack("fw.bin", &b"plain firmware"[..]))
        .unwrap();
    harness.wait();

    let object = harness.object(&ack.target.parse().unwrap());
    for name in ["base", "middle", "top"] {
        let entry = object.analysis(name).unwrap();
        assert_eq!(entry.status, AnalysisStatus::Completed, "{name}: {:?}", entry.result);
    }
    assert_eq!((base.calls(), middle.calls(), top.calls()), (1, 1, 1));
}

#[test]
fn failed_dependency_still_satisfies_dependents() {
    let report = Arc::new(StaticPlugin::new("report", &["broken"]));
    let registry = {
        let mut registry = registry_with(vec![Arc::clone(&report) as Arc<dyn AnalysisPlugin>]);
        registry
            .register_analysis(Arc::new(crate::common::BrokenPlugin::new(
                "broken",
                crate::common::Breakage::Error,
            )))
            .unwrap();
        registry
    };
    let harness = Harness::start(test_config(), registry, UnpackerRegistry::new());

    let ack = harness
        .pipeline
        .binding()
        .submit(Request::unpack("fw.bin", &b"firmware"[..]))
        .unwrap();
    harness.wait();

    let object = harness.object(&ack.target.parse().unwrap());
    assert_eq!(object.analysis("broken").unwrap().status, AnalysisStatus::Failed);
    // dispatched only after the failure was recorded
    assert_eq!(report.calls(), 1);
    assert_eq!(object.analysis("report").unwrap().status, AnalysisStatus::Completed);
    assert_eq!(
        harness.log.count(|o| matches!(o, Outcome::PluginSkipped { .. })),
        0
    );
}

#[test]
fn compare_runs_over_a_failed_prerequisite() {
    let plugin = Arc::new(CountingCompare::new("type_diff", &["file_type"]));
    let mut registry = PluginRegistry::new();
    registry
        .register_analysis(Arc::new(crate::common::BrokenPlugin::new(
            "file_type",
            crate::common::Breakage::Error,
        )))
        .unwrap();
    registry
        .register_compare(Arc::clone(&plugin) as Arc<dyn ComparePlugin>)
        .unwrap();
    let harness = Harness::start(test_config(), registry, UnpackerRegistry::new());
    let binding = harness.pipeline.binding();

    let x = binding
        .submit(Request::unpack("x.bin", &b"firmware-x"[..]))
        .unwrap();
    harness.wait();
    let x: fwflow::core::Uid = x.target.parse().unwrap();
    assert_eq!(
        harness.object(&x).analysis("file_type").unwrap().status,
        AnalysisStatus::Failed
    );

    binding.submit(Request::compare(vec![x])).unwrap();
    harness.wait();

    assert_eq!(plugin.calls(), 1);
    let comparisons = harness.log.comparisons();
    assert_eq!(comparisons.len(), 1);
    assert!(!comparisons[0].0.plugin("type_diff").unwrap().contains_key(COMPARE_SKIPPED));
}

#[test]
fn unregistered_dependency_is_reported_missing() {
    let lonely = Arc::new(StaticPlugin::new("lonely", &["ghost"]));
    let harness = Harness::start(
        test_config(),
        registry_with(vec![Arc::clone(&lonely) as Arc<dyn AnalysisPlugin>]),
        UnpackerRegistry::new(),
    );

    let ack = harness
        .pipeline
        .binding()
        .submit(Request::unpack("fw.bin", &b"firmware"[..]))
        .unwrap();
    harness.wait();

    assert_eq!(lonely.calls(), 0);
    let object = harness.object(&ack.target.parse().unwrap());
    assert_eq!(
        object.analysis("lonely").unwrap().result,
        json!({"skipped": "Required analysis not present: ghost"})
    );
}
