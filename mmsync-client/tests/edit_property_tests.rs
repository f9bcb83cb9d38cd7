//! Property and Integration Tests for Edit Overlays and Open Edits
//!
//! **Property 3: Overlay Isolation**
//!
//! Mutating an overlay never changes the canonical element, until a save
//! succeeds.
//!
//! **Property 8: Registry Consistency**
//!
//! After any sequence of opens, saves, discards and resets, the open-edit
//! count equals the number of distinct open keys, and every change is
//! announced to subscribers.

use mmsync_client::{GetOptions, SaveOptions};
use mmsync_core::{CacheKey, Element, ElementType, ElementsResponse, KeyVariant};
use mmsync_storage::{EditTrackerEvent, TrackerKey};
use mmsync_test_utils::fixtures::{property, request, scope, PROJECT};
use mmsync_test_utils::generators::arb_element_id;
use proptest::prelude::*;
use std::collections::BTreeSet;
use tokio::sync::broadcast::error::TryRecvError;
#[path = "support/service.rs"]
mod test_service_support;
use test_service_support::{committed, name_of, test_service};

// ============================================================================
// OVERLAY ISOLATION
// ============================================================================

#[tokio::test]
async fn test_overlay_edits_do_not_touch_canonical() {
    let (service, transport) = test_service();
    transport.seed(property("e1"));

    let overlay = service
        .get_element_for_edit(&request("e1"), GetOptions::default())
        .await
        .unwrap();
    overlay.update(|e| e.set_name("draft")).unwrap();

    let canonical = service.get_element(&request("e1")).await.unwrap();
    assert!(!canonical.ptr_eq(&overlay));
    assert_eq!(name_of(&canonical), "e1 name");
    assert!(service.has_edits(&request("e1")).unwrap());
    assert_eq!(transport.get_count("e1"), 1);
}

#[tokio::test]
async fn test_repeated_open_returns_same_overlay() {
    let (service, transport) = test_service();
    transport.seed(property("e1"));

    let (req_a, req_b) = (request("e1"), request("e1"));
    let (a, b) = tokio::join!(
        service.get_element_for_edit(&req_a, GetOptions::default()),
        service.get_element_for_edit(&req_b, GetOptions::default()),
    );
    let a = a.unwrap();
    assert!(a.ptr_eq(&b.unwrap()));

    let c = service
        .get_element_for_edit(&request("e1"), GetOptions::default())
        .await
        .unwrap();
    assert!(a.ptr_eq(&c));
    assert_eq!(transport.get_count("e1"), 1);
}

#[tokio::test]
async fn test_refresh_resets_overlay_in_place() {
    let (service, transport) = test_service();
    transport.seed(property("e1"));

    let overlay = service
        .get_element_for_edit(&request("e1"), GetOptions::default())
        .await
        .unwrap();
    overlay.update(|e| e.set_name("draft")).unwrap();
    transport.server_edit(&request("e1"), |e| e.set_name("theirs"));

    let refreshed = service
        .get_element_for_edit(&request("e1"), GetOptions::default().refresh())
        .await
        .unwrap();
    assert!(overlay.ptr_eq(&refreshed));
    assert_eq!(name_of(&overlay), "theirs");
    assert!(!service.has_edits(&request("e1")).unwrap());
}

#[tokio::test]
async fn test_discard_reverts_holders_of_overlay() {
    let (service, transport) = test_service();
    transport.seed(property("e1"));

    let overlay = service
        .get_element_for_edit(&request("e1"), GetOptions::default())
        .await
        .unwrap();
    overlay
        .update(|e| {
            e.set_name("draft");
            e.set_field("defaultValue", serde_json::json!({ "value": 42 }));
        })
        .unwrap();

    let removed = service.discard_edit(&request("e1")).unwrap().unwrap();
    assert!(removed.ptr_eq(&overlay));
    assert_eq!(name_of(&overlay), "e1 name");
    assert_eq!(
        overlay.with(|e| e.field("defaultValue").cloned()).unwrap(),
        Some(serde_json::json!({ "value": 1 }))
    );

    let key = CacheKey::for_request(&request("e1"), KeyVariant::Edit);
    assert!(!service.cache().exists(&key).unwrap());
    assert_eq!(service.tracker().open_edits_count().unwrap(), 0);
}

#[tokio::test]
async fn test_discard_through_mounted_project_closes_open_edit() {
    let (service, transport) = test_service();
    let owned = transport.seed(
        Element::new("e1", "PROJECT-LIB", "master", ElementType::Property).with_name("lib"),
    );
    transport.script_get("e1", Ok(ElementsResponse::of(vec![owned])));

    let overlay = service
        .get_element_for_edit(&request("e1"), GetOptions::default())
        .await
        .unwrap();
    overlay.update(|e| e.set_name("draft")).unwrap();
    let open: Vec<TrackerKey> = service
        .open_edits()
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(open, vec![TrackerKey::new("e1", "PROJECT-LIB", "master")]);

    let removed = service.discard_edit(&request("e1")).unwrap().unwrap();
    assert!(removed.ptr_eq(&overlay));
    assert_eq!(name_of(&overlay), "lib");
    assert_eq!(service.tracker().open_edits_count().unwrap(), 0);
}

#[tokio::test]
async fn test_created_elements_get_overlays() {
    let (service, transport) = test_service();
    let created = service
        .create_elements(&scope("master"), vec![property("n1"), property("n2")])
        .await
        .unwrap();
    assert_eq!(created.len(), 2);

    for id in ["n1", "n2"] {
        let key = CacheKey::for_request(&request(id), KeyVariant::Read);
        assert!(service.context().overlays.existing(&key).unwrap().is_some());
        assert!(!service.has_edits(&request(id)).unwrap());
    }
    assert_eq!(transport.post_count(), 1);
}

#[tokio::test]
async fn test_created_element_is_cached() {
    let (service, transport) = test_service();
    let created = service
        .create_element(&scope("master"), property("n1"))
        .await
        .unwrap();

    let read = service.get_element(&request("n1")).await.unwrap();
    assert!(read.ptr_eq(&created));
    assert_eq!(transport.get_count("n1"), 0);
    assert!(transport.current(&request("n1")).is_some());
}

// ============================================================================
// REGISTRY CONSISTENCY
// ============================================================================

#[tokio::test]
async fn test_open_edit_lifecycle_is_announced() {
    let (service, transport) = test_service();
    for id in ["e1", "e2", "e3"] {
        transport.seed(property(id));
    }
    let mut events = service.subscribe();

    let mut overlays = Vec::new();
    for id in ["e1", "e2", "e3"] {
        overlays.push(
            service
                .get_element_for_edit(&request(id), GetOptions::default())
                .await
                .unwrap(),
        );
    }
    assert_eq!(service.tracker().open_edits_count().unwrap(), 3);

    overlays[0].update(|e| e.set_name("saved")).unwrap();
    let edit = overlays[0].snapshot().unwrap();
    committed(service.update_element(edit, SaveOptions::default()).await.unwrap());
    assert_eq!(service.tracker().open_edits_count().unwrap(), 2);

    service.discard_edit(&request("e2")).unwrap();
    let open: Vec<TrackerKey> = service
        .open_edits()
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(open, vec![TrackerKey::new("e3", PROJECT, "master")]);

    service.reset().unwrap();
    assert_eq!(service.tracker().open_edits_count().unwrap(), 0);

    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(TryRecvError::Empty) => break,
            Err(other) => panic!("Unexpected receive error: {other:?}"),
        }
    }
    let added = seen
        .iter()
        .filter(|e| matches!(e, EditTrackerEvent::Added { .. }))
        .count();
    let removed = seen
        .iter()
        .filter(|e| matches!(e, EditTrackerEvent::Removed { .. }))
        .count();
    assert_eq!(added, 3);
    assert_eq!(removed, 2);
    assert!(matches!(seen.last(), Some(EditTrackerEvent::Cleared)));
}

#[tokio::test]
async fn test_track_edit_registers_once() {
    let (service, transport) = test_service();
    transport.seed(property("e1"));
    let overlay = service
        .get_element_for_edit(&request("e1"), GetOptions::default())
        .await
        .unwrap();

    service.track_edit(&overlay).unwrap();
    service.track_edit(&overlay).unwrap();
    assert_eq!(service.tracker().open_edits_count().unwrap(), 1);
}

#[derive(Debug, Clone)]
enum EditOp {
    Open(String),
    Discard(String),
    Reset,
}

fn edit_id_strategy() -> impl Strategy<Value = String> {
    prop_oneof![Just("a".to_string()), Just("b".to_string()), arb_element_id()]
}

fn edit_op_strategy() -> impl Strategy<Value = EditOp> {
    prop_oneof![
        4 => edit_id_strategy().prop_map(EditOp::Open),
        3 => edit_id_strategy().prop_map(EditOp::Discard),
        1 => Just(EditOp::Reset),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_open_edit_count_matches_distinct_keys(ops in prop::collection::vec(edit_op_strategy(), 1..20)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let (service, transport) = test_service();
            let mut expected = BTreeSet::new();
            for op in ops {
                match op {
                    EditOp::Open(id) => {
                        if transport.current(&request(&id)).is_none() {
                            transport.seed(property(&id));
                        }
                        service
                            .get_element_for_edit(&request(&id), GetOptions::default())
                            .await
                            .expect("open edit");
                        expected.insert(id);
                    }
                    EditOp::Discard(id) => {
                        service.discard_edit(&request(&id)).expect("discard");
                        expected.remove(&id);
                    }
                    EditOp::Reset => {
                        service.reset().expect("reset");
                        expected.clear();
                    }
                }
                prop_assert_eq!(service.tracker().open_edits_count().expect("count"), expected.len());
            }
            Ok(())
        })?;
    }
}
