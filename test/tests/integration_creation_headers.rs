/// Integration tests for the factory seam: creation header round trips,
/// protocol mismatch refusal and receive-side teardown hooks.
use std::sync::{Arc, Mutex};

use mirror_core::{
    BridgeError, DestroyReason, EndReplicationFlags, FactoryRegistry, GlobalDirtyRegistry,
    InstanceId, ReplicationBridge, ReplicationBridgeConfig, RootSpawnParams,
};

use mirror_test::{
    test_protocol_id, MemoryHeaderWriter, SharedFactoryEvents, TestFixture, TestObjectFactory,
    TestSchema, TEST_TYPE_KEY,
};

#[test]
fn factory_registration_after_sealing_is_rejected() {
    let events = SharedFactoryEvents::default();
    let mut factories = FactoryRegistry::new();
    factories
        .register_factory(Box::new(TestObjectFactory::new("first", events.clone())))
        .unwrap();
    factories.seal();

    let result = factories.register_factory(Box::new(TestObjectFactory::new("late", events)));
    assert!(result.is_err(), "sealed registry must refuse new factories");
}

#[test]
fn bridge_requires_a_sealed_registry() {
    let events = SharedFactoryEvents::default();
    let mut factories = FactoryRegistry::new();
    factories
        .register_factory(Box::new(TestObjectFactory::new(TEST_TYPE_KEY, events)))
        .unwrap();
    let unsealed = Arc::new(Mutex::new(factories));

    let result = ReplicationBridge::new(
        ReplicationBridgeConfig::default(),
        unsealed,
        &GlobalDirtyRegistry::new(),
    );
    assert!(matches!(result, Err(BridgeError::FactoryRegistryNotSealed)));
}

#[test]
fn creation_header_round_trip_instantiates_a_mirror() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);

    let mut writer = MemoryHeaderWriter::new();
    fixture.bridge.write_creation_header(handle, &mut writer).unwrap();

    let mut reader = writer.into_reader();
    let instantiation = fixture
        .bridge
        .read_and_instantiate(1, handle, fixture.factory_id, &mut reader, &TestSchema)
        .unwrap();

    let events = fixture.events.lock().unwrap();
    assert_eq!(events.instantiated, vec![(instantiation.instance, handle)]);
    assert_eq!(
        events.post_initialized,
        vec![instantiation.instance],
        "factory asked for post-init"
    );
}

#[test]
fn protocol_mismatch_refuses_creation_and_notifies_the_peer() {
    let mut fixture = TestFixture::new();
    // declared protocol id disagrees with what the schema service computes
    let handle = fixture
        .bridge
        .start_replicating_root(RootSpawnParams {
            instance: InstanceId::from_u64(1),
            protocol_id: 0xbad0_bad0,
            factory_id: fixture.factory_id,
            static_handle: None,
            needs_pre_update: false,
            poll_period: 0,
        })
        .unwrap();

    let notified = Arc::new(Mutex::new(Vec::new()));
    let notified_writer = Arc::clone(&notified);
    fixture.bridge.set_peer_error_callback(Box::new(move |peer, _err| {
        notified_writer.lock().unwrap().push(peer);
    }));

    let mut writer = MemoryHeaderWriter::new();
    fixture.bridge.write_creation_header(handle, &mut writer).unwrap();
    let mut reader = writer.into_reader();
    let result =
        fixture
            .bridge
            .read_and_instantiate(7, handle, fixture.factory_id, &mut reader, &TestSchema);

    assert!(matches!(result, Err(BridgeError::ProtocolMismatch { .. })));
    assert_eq!(*notified.lock().unwrap(), vec![7], "the peer was told");
    assert!(
        fixture.events.lock().unwrap().instantiated.is_empty(),
        "no mirror may be constructed from a mismatched schema"
    );
}

#[test]
fn write_header_for_unknown_handle_fails() {
    let fixture = TestFixture::new();
    let mut writer = MemoryHeaderWriter::new();
    let result = fixture
        .bridge
        .write_creation_header(mirror_core::ObjectHandle::from_u64(4242), &mut writer);
    assert!(matches!(result, Err(BridgeError::NotReplicating { .. })));
}

#[test]
fn remote_teardown_runs_the_factory_hooks() {
    let mut fixture = TestFixture::new();
    let root = fixture.spawn_root(1);
    let sub = fixture.spawn_sub_object(root, 2);

    fixture.bridge.destroy_remote(sub, DestroyReason::Destroy);

    let events = fixture.events.lock().unwrap();
    assert_eq!(
        events.destroyed,
        vec![(InstanceId::from_u64(2), DestroyReason::Destroy)]
    );
    assert_eq!(
        events.sub_objects_destroyed,
        vec![(InstanceId::from_u64(1), InstanceId::from_u64(2))],
        "the owning root's factory hears about its subobject"
    );
    drop(events);
    assert!(!fixture.bridge.is_replicating(sub));
    assert!(fixture.bridge.is_replicating(root));
}

#[test]
fn remote_teardown_with_do_not_destroy_skips_the_factory() {
    let mut fixture = TestFixture::new();
    let root = fixture.spawn_root(1);

    fixture.bridge.destroy_remote(root, DestroyReason::DoNotDestroy);

    assert!(fixture.events.lock().unwrap().destroyed.is_empty());
    assert!(!fixture.bridge.is_replicating(root));
}

#[test]
fn a_recycled_root_slot_is_not_blamed_for_child_teardown() {
    let mut fixture = TestFixture::new();
    let root = fixture.spawn_root(1);
    let sub = fixture.spawn_sub_object(root, 2);
    fixture.connect_peer(1, &[root]);

    fixture
        .bridge
        .stop_replicating(root, EndReplicationFlags::destroy(), &mut fixture.quantizer)
        .unwrap();
    // the peer confirms the root first, so its slot frees up and is handed
    // to an unrelated newcomer while the child still awaits its ack
    fixture.bridge.on_peer_ack(1, root);
    assert!(!fixture.bridge.is_replicating(root));
    let _tenant = fixture.spawn_root(3);

    fixture.bridge.destroy_remote(sub, DestroyReason::Destroy);

    let events = fixture.events.lock().unwrap();
    assert!(
        events
            .sub_objects_destroyed
            .iter()
            .all(|(owner, _)| *owner != InstanceId::from_u64(3)),
        "the slot's new tenant has nothing to do with the old root's child"
    );
    assert_eq!(
        events.destroyed,
        vec![(InstanceId::from_u64(2), DestroyReason::Destroy)]
    );
}

#[test]
fn protocol_ids_are_stable_per_type_key() {
    assert_eq!(test_protocol_id("a"), test_protocol_id("a"));
    assert_ne!(test_protocol_id("a"), test_protocol_id("b"));
}
