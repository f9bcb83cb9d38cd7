#![allow(dead_code)]

use std::sync::Arc;

use mmsync_client::{ElementService, SaveOutcome};
use mmsync_core::SyncConfig;
use mmsync_storage::ElementRef;
use mmsync_test_utils::fixtures::test_config;
use mmsync_test_utils::MockTransport;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_service_with(config: SyncConfig) -> (ElementService, Arc<MockTransport>) {
    init_tracing();
    let transport = Arc::new(MockTransport::new());
    let service = ElementService::new(config, transport.clone()).expect("valid test config");
    (service, transport)
}

pub fn test_service() -> (ElementService, Arc<MockTransport>) {
    test_service_with(test_config())
}

pub fn name_of(handle: &ElementRef) -> String {
    handle
        .with(|element| element.name().unwrap_or_default().to_string())
        .expect("readable handle")
}

pub fn committed(outcome: SaveOutcome) -> ElementRef {
    match outcome {
        SaveOutcome::Committed(handle) => handle,
        other => panic!("Expected a committed save, got {other:?}"),
    }
}
