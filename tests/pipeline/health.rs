use crate::common::{registry_with, test_config, FlakyStore, OutcomeLog, IDLE_TIMEOUT};
use fwflow::storage::HealthStatus;
use fwflow::unpack::UnpackerRegistry;
use fwflow::{Outcome, Pipeline, Request, Stage};
use std::sync::Arc;

#[test]
fn repeated_storage_failures_degrade_then_recover() {
    let store = Arc::new(FlakyStore::new());
    let mut config = test_config();
    config.health.storage_failure_threshold = 2;
    let pipeline = Pipeline::start(
        config,
        registry_with(Vec::new()),
        UnpackerRegistry::new(),
        store.clone(),
        store.clone(),
    )
    .unwrap();
    let log = OutcomeLog::attach(&pipeline);
    let binding = pipeline.binding();

    store.set_failing(true);
    for n in 0..3u8 {
        binding
            .submit(Request::unpack(format!("fw-{n}"), vec![n; 16]))
            .unwrap();
    }
    assert!(pipeline.wait_until_idle(IDLE_TIMEOUT));

    assert_eq!(log.count(|o| matches!(o, Outcome::UnpackFailed { .. })), 3);
    assert_eq!(
        log.count(|o| matches!(
            o,
            Outcome::HealthDegraded {
                stage: Stage::Unpacking,
                consecutive_failures: 2
            }
        )),
        1
    );
    assert_eq!(
        binding.health(),
        HealthStatus::Degraded {
            consecutive_failures: 3
        }
    );
    // a degraded pipeline keeps accepting work
    store.set_failing(false);
    binding
        .submit(Request::unpack("fw-ok", &b"healthy again"[..]))
        .unwrap();
    assert!(pipeline.wait_until_idle(IDLE_TIMEOUT));

    assert_eq!(log.count(|o| matches!(o, Outcome::HealthRecovered { .. })), 1);
    assert_eq!(binding.health(), HealthStatus::Healthy);
    assert_eq!(log.count(|o| matches!(o, Outcome::Unpacked { .. })), 1);
    pipeline.shutdown();
}

#[test]
fn isolated_failure_only_fails_its_item() {
    let store = Arc::new(FlakyStore::new());
    let pipeline = Pipeline::start(
        test_config(),
        registry_with(Vec::new()),
        UnpackerRegistry::new(),
        store.clone(),
        store.clone(),
    )
    .unwrap();
    let log = OutcomeLog::attach(&pipeline);
    let binding = pipeline.binding();

    store.set_failing(true);
    binding.submit(Request::unpack("bad", &b"first"[..])).unwrap();
    assert!(pipeline.wait_until_idle(IDLE_TIMEOUT));
    store.set_failing(false);
    binding.submit(Request::unpack("good", &b"second"[..])).unwrap();
    assert!(pipeline.wait_until_idle(IDLE_TIMEOUT));

    assert_eq!(log.count(|o| matches!(o, Outcome::UnpackFailed { .. })), 1);
    assert_eq!(log.count(|o| matches!(o, Outcome::Unpacked { .. })), 1);
    assert_eq!(log.count(|o| matches!(o, Outcome::HealthDegraded { .. })), 0);
    assert_eq!(binding.health(), HealthStatus::Healthy);
}
