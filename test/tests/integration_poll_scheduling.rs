/// Integration tests for frequency-based poll scheduling: poll periods,
/// force-update bypass, owner-coupled groups and dormancy filtering.
use mirror_test::TestFixture;

#[test]
fn poll_period_throttles_sampling() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root_with_period(1, 5);
    fixture.connect_peer(1, &[handle]);
    fixture.bridge.mark_dirty(handle);

    for tick in 1..=4 {
        fixture.tick();
        assert_eq!(fixture.sample_count(1), 0, "not due yet at tick {tick}");
    }
    fixture.tick();
    assert_eq!(fixture.sample_count(1), 1, "due on the fifth tick");
}

#[test]
fn marks_during_the_wait_coalesce_into_one_sample() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root_with_period(1, 5);
    fixture.connect_peer(1, &[handle]);

    for _ in 0..5 {
        fixture.bridge.mark_dirty(handle);
        fixture.tick();
    }
    assert_eq!(fixture.sample_count(1), 1);
}

#[test]
fn clean_objects_are_not_sampled_even_when_due() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root_with_period(1, 1);
    fixture.connect_peer(1, &[handle]);

    for _ in 0..4 {
        fixture.tick();
    }
    assert_eq!(fixture.sample_count(1), 0);
}

#[test]
fn period_zero_samples_every_dirty_tick() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);

    fixture.bridge.mark_dirty(handle);
    fixture.tick();
    fixture.tick();
    fixture.bridge.mark_dirty(handle);
    fixture.tick();

    assert_eq!(fixture.sample_count(1), 2, "once per dirty mark, no residue");
}

#[test]
fn force_update_bypasses_the_poll_period() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root_with_period(1, 100);
    fixture.connect_peer(1, &[handle]);

    fixture.bridge.force_update(handle);
    fixture.tick();
    assert_eq!(fixture.sample_count(1), 1);

    fixture.tick();
    assert_eq!(fixture.sample_count(1), 1, "force is a one-shot");
}

#[test]
fn sub_objects_poll_with_their_root_as_one_group() {
    let mut fixture = TestFixture::new();
    let root = fixture.spawn_root_with_period(1, 3);
    let sub = fixture.spawn_sub_object(root, 2);
    fixture.connect_peer(1, &[root]);

    // spawning marked the subobject dirty; drain that first delivery
    for _ in 0..3 {
        fixture.tick();
    }
    assert_eq!(fixture.sample_count(2), 1);
    let root_samples = fixture.sample_count(1);

    // only the subobject is dirty, but the whole group samples together on
    // the root's schedule
    fixture.bridge.mark_dirty(sub);
    fixture.tick();
    fixture.tick();
    assert_eq!(fixture.sample_count(2), 1, "group not due yet");
    fixture.tick();
    assert_eq!(fixture.sample_count(2), 2, "due with the root's counter");
    assert_eq!(
        fixture.sample_count(1),
        root_samples + 1,
        "dirty subobject pulls the root into the same pass"
    );
}

#[test]
fn dormant_objects_are_not_polled() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);

    fixture.bridge.set_dormant(handle, true);
    fixture.bridge.mark_dirty(handle);
    fixture.tick();
    fixture.tick();
    assert_eq!(fixture.sample_count(1), 0);
}

#[test]
fn dormancy_flush_delivers_exactly_once() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);

    fixture.bridge.set_dormant(handle, true);
    fixture.bridge.mark_dirty(handle);
    fixture.tick();
    assert_eq!(fixture.sample_count(1), 0);

    fixture.bridge.flush_dormancy(handle);
    fixture.tick();
    assert_eq!(fixture.sample_count(1), 1, "flush overrides dormancy for one tick");
    fixture.tick();
    assert_eq!(fixture.sample_count(1), 1, "back to dormant afterwards");
}

#[test]
fn waking_from_dormancy_delivers_conserved_marks() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);

    fixture.bridge.set_dormant(handle, true);
    fixture.bridge.mark_dirty(handle);
    fixture.tick();
    assert_eq!(fixture.sample_count(1), 0);

    fixture.bridge.set_dormant(handle, false);
    fixture.tick();
    assert_eq!(fixture.sample_count(1), 1);
}

#[test]
fn flush_request_on_awake_object_is_ignored() {
    let mut fixture = TestFixture::new();
    let handle = fixture.spawn_root(1);
    fixture.connect_peer(1, &[handle]);

    fixture.bridge.flush_dormancy(handle);
    fixture.tick();
    assert_eq!(fixture.sample_count(1), 0, "no dormancy, no flush, no dirt");
}
