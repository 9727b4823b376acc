/// Bridge-level dirty-tracking scenarios: conservation across scope
/// filtering and cross-thread marks reaching the tick.
use mirror_core::InstanceId;

use mirror_test::TestFixture;

#[test]
fn dirtiness_survives_scope_exit_and_reentry() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);

    fixture.bridge.mark_dirty(handle);
    fixture.bridge.set_peer_scope(1, &[]);
    fixture.tick();
    assert_eq!(fixture.sample_count(1), 0, "out of scope, nothing sampled");

    fixture.bridge.set_peer_scope(1, &[handle]);
    fixture.tick();
    assert_eq!(
        fixture.sample_count(1),
        1,
        "the mark was conserved while the object was filtered out"
    );
}

#[test]
fn cross_thread_marks_reach_the_bridge() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);

    let index = fixture.bridge.registry().lookup(handle).unwrap();
    let global = fixture.bridge.global_dirty().clone();
    std::thread::spawn(move || global.mark_dirty(index))
        .join()
        .unwrap();

    fixture.tick();
    assert_eq!(fixture.sample_count(1), 1);
}

#[test]
fn a_failed_out_of_band_poll_keeps_the_mark() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);
    fixture.bridge.mark_dirty(handle);

    fixture.quantizer.fail_for(InstanceId::from_u64(1));
    fixture
        .bridge
        .pre_send_update_single_handle(handle, &mut fixture.quantizer)
        .unwrap();
    assert_eq!(fixture.sample_count(1), 0);

    fixture.quantizer.fail_instances.clear();
    fixture.tick();
    assert_eq!(
        fixture.sample_count(1),
        1,
        "the mark must survive a sample that never produced state"
    );
}

#[test]
fn cross_thread_force_update_bypasses_the_poll_period() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root_with_period(1, 100);
    fixture.connect_peer(1, &[handle]);

    let index = fixture.bridge.registry().lookup(handle).unwrap();
    fixture.bridge.global_dirty().mark_force_update(index);

    fixture.tick();
    assert_eq!(fixture.sample_count(1), 1);
    assert_eq!(
        fixture.quantizer.sampled_instances(),
        vec![InstanceId::from_u64(1)]
    );
}
