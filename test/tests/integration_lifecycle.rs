/// Integration tests for the end-of-replication state machine: destroy,
/// tear-off, flush, peer acknowledgement and the stale-instance sweep.
use mirror_core::{EndReplicationFlags, EndReplicationMode, InstanceId, LifecycleState};

use mirror_test::{TestFixture, TestHost};

#[test]
fn destroy_without_peer_refs_finalizes_immediately() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);

    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::destroy(), &mut fixture.quantizer)
        .unwrap();

    assert!(!fixture.bridge.is_replicating(handle));
}

#[test]
fn stop_replicating_twice_is_a_noop() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);

    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::destroy(), &mut fixture.quantizer)
        .unwrap();
    // second call must not error or resurrect anything
    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::destroy(), &mut fixture.quantizer)
        .unwrap();

    assert!(!fixture.bridge.is_replicating(handle));
}

#[test]
fn destroy_with_peer_refs_waits_for_acknowledgement() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);
    fixture.connect_peer(2, &[handle]);

    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::destroy(), &mut fixture.quantizer)
        .unwrap();
    assert_eq!(
        fixture.bridge.lifecycle_of(handle),
        Some(LifecycleState::PendingPeerAck)
    );
    assert!(
        !fixture.bridge.peer_has_in_scope(1, handle),
        "a detaching object leaves scope immediately"
    );

    fixture.bridge.on_peer_ack(1, handle);
    assert_eq!(
        fixture.bridge.lifecycle_of(handle),
        Some(LifecycleState::PendingPeerAck),
        "one ack outstanding"
    );

    fixture.bridge.on_peer_ack(2, handle);
    assert!(!fixture.bridge.is_replicating(handle));
}

#[test]
fn a_departing_peer_releases_its_references() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);

    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::destroy(), &mut fixture.quantizer)
        .unwrap();
    assert_eq!(
        fixture.bridge.lifecycle_of(handle),
        Some(LifecycleState::PendingPeerAck)
    );

    fixture.bridge.remove_peer(1);
    assert!(!fixture.bridge.is_replicating(handle));
}

#[test]
fn tear_off_takes_the_final_sample_immediately() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);

    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::tear_off(), &mut fixture.quantizer)
        .unwrap();

    assert_eq!(fixture.sample_count(1), 1, "closing sample without a tick");
    assert_eq!(
        fixture.bridge.lifecycle_of(handle),
        Some(LifecycleState::PendingPeerAck)
    );

    fixture.bridge.on_peer_ack(1, handle);
    assert!(!fixture.bridge.is_replicating(handle));
}

#[test]
fn flush_delivers_pending_state_before_detaching() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root_with_period(1, 50);
    fixture.connect_peer(1, &[handle]);
    fixture.bridge.mark_dirty(handle);

    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::flush(), &mut fixture.quantizer)
        .unwrap();
    assert_eq!(
        fixture.bridge.lifecycle_of(handle),
        Some(LifecycleState::FinalSampleQueued)
    );
    assert_eq!(fixture.sample_count(1), 0, "sample waits for the next pass");

    fixture.tick();
    assert_eq!(fixture.sample_count(1), 1, "flushed despite the long poll period");
    assert_eq!(
        fixture.bridge.lifecycle_of(handle),
        Some(LifecycleState::PendingPeerAck),
        "detached right after the closing sample went out"
    );
}

#[test]
fn flush_without_recipients_detaches_immediately() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.bridge.mark_dirty(handle);

    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::flush(), &mut fixture.quantizer)
        .unwrap();

    assert!(
        !fixture.bridge.is_replicating(handle),
        "no peer could ever take the closing sample, so nothing to wait for"
    );
}

#[test]
fn a_queued_flush_completes_when_its_audience_leaves() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root_with_period(1, 50);
    fixture.connect_peer(1, &[handle]);
    fixture.bridge.mark_dirty(handle);

    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::flush(), &mut fixture.quantizer)
        .unwrap();
    assert_eq!(
        fixture.bridge.lifecycle_of(handle),
        Some(LifecycleState::FinalSampleQueued)
    );

    fixture.bridge.set_peer_scope(1, &[]);
    fixture.tick();

    assert!(
        !fixture.bridge.is_replicating(handle),
        "the teardown must not wait on a sample nobody can receive"
    );
    assert_eq!(fixture.sample_count(1), 0);
}

#[test]
fn ending_a_root_ends_its_sub_objects() {
    let mut fixture = TestFixture::new();
    let root = fixture.spawn_root(1);
    let sub = fixture.spawn_sub_object(root, 2);

    fixture
        .bridge
        .stop_replicating(root, EndReplicationFlags::destroy(), &mut fixture.quantizer)
        .unwrap();

    assert!(!fixture.bridge.is_replicating(root));
    assert!(!fixture.bridge.is_replicating(sub));
}

#[test]
fn cascade_policy_for_sub_objects() {
    // destroy-with-owner children inherit the root's mode
    assert_eq!(
        EndReplicationFlags::destroy().for_sub_object(true, true).mode,
        EndReplicationMode::Destroy
    );
    // children that outlive their owner end replication without destruction
    assert_eq!(
        EndReplicationFlags::destroy().for_sub_object(false, false).mode,
        EndReplicationMode::DoNotDestroy
    );
    // but a dynamic child can never be left behind; nothing could ever
    // reconstruct it deterministically
    assert_eq!(
        EndReplicationFlags::do_not_destroy().for_sub_object(true, true).mode,
        EndReplicationMode::Destroy
    );
    assert_eq!(
        EndReplicationFlags::do_not_destroy().for_sub_object(true, false).mode,
        EndReplicationMode::DoNotDestroy
    );
}

#[test]
fn stops_during_a_receive_pass_are_deferred() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);

    fixture.bridge.begin_receive_update();
    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::destroy(), &mut fixture.quantizer)
        .unwrap();
    assert!(
        fixture.bridge.is_replicating(handle),
        "teardown must not land while incoming state is being applied"
    );

    fixture.bridge.end_receive_update(&mut fixture.quantizer);
    assert!(!fixture.bridge.is_replicating(handle));
}

#[test]
fn destroy_override_requires_the_policy_flag() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root_with_period(1, 50);
    fixture.connect_peer(1, &[handle]);
    fixture.bridge.mark_dirty(handle);

    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::flush(), &mut fixture.quantizer)
        .unwrap();
    fixture
        .bridge
        .stop_replicating(handle, EndReplicationFlags::destroy(), &mut fixture.quantizer)
        .unwrap();

    assert_eq!(
        fixture.bridge.lifecycle_of(handle),
        Some(LifecycleState::FinalSampleQueued),
        "without the override policy the flush keeps its course"
    );
}

#[test]
fn prune_stale_objects_ends_silently_destroyed_instances() {
    let mut fixture = TestFixture::new();
    let kept = fixture.spawn_root(1);
    let vanished = fixture.spawn_root(2);

    let mut host = TestHost::new();
    host.spawn(InstanceId::from_u64(1));
    // instance 2 was never spawned into the host (or already destroyed)

    fixture.bridge.prune_stale_objects(&host, &mut fixture.quantizer);

    assert!(fixture.bridge.is_replicating(kept));
    assert!(!fixture.bridge.is_replicating(vanished));
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "bound instance"))]
fn prune_refuses_a_dead_but_still_bound_instance() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);

    let mut host = TestHost::new();
    // dead in the host world, but a replication writer still references
    // its change masks
    host.bind(InstanceId::from_u64(1));

    fixture.bridge.prune_stale_objects(&host, &mut fixture.quantizer);

    // release builds get past the escalation; the record must survive
    assert!(fixture.bridge.is_replicating(handle));
}
