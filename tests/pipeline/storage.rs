use crate::common::{registry_with, test_config, OutcomeLog, IDLE_TIMEOUT};
use fwflow::core::Uid;
use fwflow::plugins::file_hashes::FileHashesPlugin;
use fwflow::plugins::{AnalysisPlugin, PluginRegistry};
use fwflow::storage::{ContentStore, FsContentStore, MemoryStore, ObjectStore};
use fwflow::unpack::tar::build_archive;
use fwflow::unpack::UnpackerRegistry;
use fwflow::{Outcome, Pipeline, PipelineConfig, Request};
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn extracted_content_lands_in_the_configured_directory() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig::from_json_str(&format!(
        r#"{{"unpacking": {{"workers": 2}}, "storage": {{"content_dir": {:?}}}}}"#,
        dir.path().join("content")
    ))
    .unwrap();
    let contents = Arc::new(FsContentStore::from_config(&config.storage).unwrap().unwrap());
    let objects = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::start(
        config,
        PluginRegistry::with_builtins(),
        UnpackerRegistry::with_builtins(),
        objects.clone(),
        contents.clone(),
    )
    .unwrap();

    let archive = build_archive(&[("etc/passwd", &b"root:x:0:0"[..])]);
    let ack = pipeline
        .binding()
        .submit(Request::unpack("fw.tar", archive.clone()))
        .unwrap();
    assert!(pipeline.wait_until_idle(IDLE_TIMEOUT));

    let root: Uid = ack.target.parse().unwrap();
    let child = Uid::from_content(b"root:x:0:0");
    assert_eq!(&contents.get_content(&root).unwrap()[..], &archive[..]);
    assert!(contents.path_for(&child).is_file());
    assert!(objects.get_object(&child).unwrap().has_completed("file_hashes"));
    pipeline.shutdown();
}

#[test]
fn reanalysis_reads_content_back_from_storage() {
    let dir = TempDir::new().unwrap();
    let contents = Arc::new(FsContentStore::new(dir.path()).unwrap());
    let objects = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::start(
        test_config(),
        registry_with(vec![Arc::new(FileHashesPlugin::new()) as Arc<dyn AnalysisPlugin>]),
        UnpackerRegistry::new(),
        objects.clone(),
        contents.clone(),
    )
    .unwrap();
    let log = OutcomeLog::attach(&pipeline);
    let binding = pipeline.binding();

    // nothing selected on the first pass
    let ack = binding
        .submit(Request::Unpack {
            file_name: "fw.bin".into(),
            content: bytes::Bytes::from_static(b"kernel image"),
            plugins: Some(Vec::new()),
            priority: 0,
        })
        .unwrap();
    assert!(pipeline.wait_until_idle(IDLE_TIMEOUT));
    let uid: Uid = ack.target.parse().unwrap();
    assert!(!objects.get_object(&uid).unwrap().has_analysis("file_hashes"));

    binding
        .submit(Request::Analyze {
            uid: uid.clone(),
            plugins: Some(vec!["file_hashes".into()]),
            force: false,
            priority: 0,
        })
        .unwrap();
    assert!(pipeline.wait_until_idle(IDLE_TIMEOUT));

    let entry = objects.get_object(&uid).unwrap().analysis("file_hashes").unwrap();
    assert!(entry.is_completed(), "{:?}", entry.result);
    assert_eq!(entry.result["sha256"].as_str(), Some(uid.hash()));
    assert_eq!(
        log.count(|o| matches!(o, Outcome::PluginCompleted { plugin, .. } if plugin == "file_hashes")),
        1
    );
    pipeline.shutdown();
}
