use crate::common::{registry_with, test_config, Harness, StaticPlugin};
use fwflow::core::Uid;
use fwflow::pipeline::Endpoint;
use fwflow::plugins::AnalysisPlugin;
use fwflow::unpack::UnpackerRegistry;
use fwflow::{Outcome, PipelineError, Request, RequestKind, Stage};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn submit_acknowledges_before_the_work_finishes() {
    let slow = Arc::new(StaticPlugin::new("slow", &[]).with_delay(Duration::from_millis(300)));
    let harness = Harness::start(
        test_config(),
        registry_with(vec![Arc::clone(&slow) as Arc<dyn AnalysisPlugin>]),
        UnpackerRegistry::new(),
    );

    let ack = harness
        .pipeline
        .binding()
        .submit(Request::unpack("fw.bin", &b"firmware"[..]))
        .unwrap();
    assert_eq!(ack.kind, RequestKind::Unpack);
    assert_eq!(harness.log.count(|o| matches!(o, Outcome::Analyzed { .. })), 0);

    harness.wait();
    assert_eq!(slow.calls(), 1);
    assert_eq!(harness.log.count(|o| matches!(o, Outcome::Analyzed { .. })), 1);
}

#[test]
fn json_requests_reach_their_stage() {
    let harness = Harness::start(
        test_config(),
        registry_with(vec![Arc::new(StaticPlugin::new("counter", &[]))]),
        UnpackerRegistry::new(),
    );
    let binding = harness.pipeline.binding();

    let unpack = binding
        .submit_json(r#"{"kind": "unpack", "payload": {"file_name": "fw.bin", "content": [1, 2, 3], "priority": 5}}"#)
        .unwrap();
    harness.wait();
    let uid = Uid::from_content(&[1, 2, 3]);
    assert_eq!(unpack.target, uid.to_string());

    let json = format!(r#"{{"kind": "compare", "payload": {{"uids": ["{uid}"]}}}}"#);
    let compare = binding.submit_json(&json).unwrap();
    assert_eq!(compare.kind, RequestKind::Compare);
    assert_ne!(compare.request_id, unpack.request_id);
    harness.wait();

    assert_eq!(harness.log.comparisons().len(), 1);
    let stats = harness.pipeline.stats();
    assert_eq!(stats.unpacking.completed, 1);
    assert_eq!(stats.comparison.completed, 1);
}

#[test]
fn invalid_requests_are_refused_without_queueing() {
    let harness = Harness::start(
        test_config(),
        registry_with(vec![Arc::new(StaticPlugin::new("counter", &[]))]),
        UnpackerRegistry::new(),
    );
    let binding = harness.pipeline.binding();

    let err = binding
        .submit(Request::Unpack {
            file_name: "fw.bin".into(),
            content: bytes::Bytes::from_static(b"fw"),
            plugins: Some(vec!["no_such_plugin".into()]),
            priority: 0,
        })
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownPlugin(name) if name == "no_such_plugin"));
    assert!(matches!(
        binding.submit(Request::compare(Vec::new())),
        Err(PipelineError::InvalidRequest(_))
    ));
    assert!(binding.submit_json("not json").is_err());

    harness.wait();
    assert_eq!(harness.pipeline.stats().unpacking.accepted(), 0);
    assert!(harness.log.all().is_empty());
}

#[test]
fn selected_plugins_follow_extracted_files() {
    let wanted = Arc::new(StaticPlugin::new("wanted", &[]));
    let other = Arc::new(StaticPlugin::new("other", &[]));
    let harness = Harness::start(
        test_config(),
        registry_with(vec![
            Arc::clone(&wanted) as Arc<dyn AnalysisPlugin>,
            Arc::clone(&other) as Arc<dyn AnalysisPlugin>,
        ]),
        UnpackerRegistry::with_builtins(),
    );
    let archive = fwflow::unpack::tar::build_archive(&[("a", &b"first"[..]), ("b", &b"second"[..])]);

    harness
        .pipeline
        .binding()
        .submit(Request::Unpack {
            file_name: "fw.tar".into(),
            content: archive.into(),
            plugins: Some(vec!["wanted".into()]),
            priority: 0,
        })
        .unwrap();
    harness.wait();

    assert_eq!(wanted.calls(), 3);
    assert_eq!(other.calls(), 0);
    let child = harness.object(&Uid::from_content(b"second"));
    assert!(child.has_completed("wanted"));
    assert!(!child.has_analysis("other"));
}

#[test]
fn topology_describes_the_stage_wiring() {
    let harness = Harness::start(test_config(), registry_with(Vec::new()), UnpackerRegistry::new());
    let topology = harness.pipeline.topology();

    let unpacking = Endpoint::Stage(Stage::Unpacking);
    let analysis = Endpoint::Stage(Stage::Analysis);
    let comparison = Endpoint::Stage(Stage::Comparison);
    assert!(topology.feeds(Endpoint::Binding, unpacking));
    assert!(topology.feeds(Endpoint::Binding, analysis));
    assert!(topology.feeds(Endpoint::Binding, comparison));
    assert!(topology.feeds(unpacking, unpacking));
    assert!(topology.feeds(unpacking, analysis));
    assert!(!topology.feeds(analysis, unpacking));
    assert!(topology.feeds(analysis, comparison));
    assert!(!topology.feeds(comparison, analysis));
    assert!(topology.feeds(Endpoint::Outcomes, Endpoint::Binding));

    let workers: Vec<usize> = topology.stages.iter().map(|s| s.workers).collect();
    assert_eq!(workers, vec![2, 2, 1]);
}
