use foxtrot::lock::{Backoff, VersionLock};

#[test]
fn optimistic_read_round_trip() {
    let lock = VersionLock::new();
    let version = lock.read_lock().expect("fresh lock is readable");
    assert!(lock.check(version).is_ok());
    assert!(lock.read_unlock(version).is_ok());
}

#[test]
fn upgrade_excludes_readers_and_bumps_the_version() {
    let lock = VersionLock::new();
    let version = lock.read_lock().expect("fresh lock is readable");
    lock.upgrade(version).expect("first upgrade wins");

    // locked: new readers and stale upgrades must restart
    assert!(lock.read_lock().is_err());
    assert!(lock.upgrade(version).is_err());

    lock.write_unlock();
    let after = lock.read_lock().expect("unlocked again");
    assert_ne!(version, after, "write unlock must advance the version");
    assert!(lock.read_unlock(version).is_err());
    assert!(lock.read_unlock(after).is_ok());
}

#[test]
fn a_mid_read_write_invalidates_the_capture() {
    let lock = VersionLock::new();
    let reader = lock.read_lock().expect("fresh lock is readable");
    lock.write_lock();
    lock.write_unlock();
    assert!(lock.check(reader).is_err());
    assert!(lock.read_unlock(reader).is_err());
}

#[test]
fn a_retired_lock_rejects_every_later_reader() {
    let lock = VersionLock::new();
    let version = lock.read_lock().expect("fresh lock is readable");
    lock.upgrade(version).expect("upgrade");
    lock.write_unlock_obsolete();

    assert!(lock.read_lock().is_err());
    assert!(lock.upgrade(version).is_err());
    // retirement is terminal
    assert!(lock.read_lock().is_err());
}

#[test]
fn backoff_counts_restarts() {
    let mut backoff = Backoff::new();
    assert_eq!(backoff.restarts(), 0);
    for expected in 1..=10 {
        backoff.pause();
        assert_eq!(backoff.restarts(), expected);
    }
}
