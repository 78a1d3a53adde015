use budp_crypto::{check_pin, namespace_for_seed, FsPinStore, PinStatus, PinStore, PinStoreError};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("budp-pin-{prefix}-{nanos}"));
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn pins_survive_a_new_store_instance() {
    let root = temp_dir("persist");
    let ns = namespace_for_seed("CLIENT_SECRET_SEED");

    {
        let store = FsPinStore::new(&root);
        assert_eq!(
            check_pin(&store, &ns, "127.0.0.1", 1234).unwrap(),
            PinStatus::FirstUse
        );
    }

    // A restarted process sees the same record.
    let store = FsPinStore::new(&root);
    assert_eq!(store.get(&ns, "127.0.0.1").unwrap(), Some(1234));
    assert_eq!(
        check_pin(&store, &ns, "127.0.0.1", 1234).unwrap(),
        PinStatus::Match
    );
    assert_eq!(
        check_pin(&store, &ns, "127.0.0.1", 4321).unwrap(),
        PinStatus::Mismatch {
            pinned: 1234,
            presented: 4321
        }
    );

    fs::remove_dir_all(root).ok();
}

#[test]
fn record_layout_on_disk() {
    let root = temp_dir("layout");
    let store = FsPinStore::new(&root);
    let ns = namespace_for_seed("seed");

    store.put_if_absent(&ns, "10.0.0.7", 0x0102_0304).unwrap();

    let path = root.join(&ns).join("10.0.0.7.bin");
    assert_eq!(store.record_path(&ns, "10.0.0.7").unwrap(), path);
    assert_eq!(fs::read(&path).unwrap(), 0x0102_0304u64.to_le_bytes());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(root.join(&ns)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    fs::remove_dir_all(root).ok();
}

#[test]
fn put_if_absent_never_overwrites() {
    let root = temp_dir("first-wins");
    let store = FsPinStore::new(&root);

    assert_eq!(store.put_if_absent("ns", "host", 1).unwrap(), 1);
    assert_eq!(store.put_if_absent("ns", "host", 2).unwrap(), 1);
    assert_eq!(store.get("ns", "host").unwrap(), Some(1));

    fs::remove_dir_all(root).ok();
}

#[test]
fn namespaces_and_hosts_are_independent() {
    let root = temp_dir("independent");
    let store = FsPinStore::new(&root);
    let a = namespace_for_seed("seed-a");
    let b = namespace_for_seed("seed-b");

    store.put_if_absent(&a, "host", 1).unwrap();
    assert_eq!(store.get(&b, "host").unwrap(), None);
    assert_eq!(store.get(&a, "other-host").unwrap(), None);

    fs::remove_dir_all(root).ok();
}

#[test]
fn truncated_record_is_corrupt() {
    let root = temp_dir("corrupt");
    let store = FsPinStore::new(&root);
    let path = store.record_path("ns", "host").unwrap();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, [1, 2, 3]).unwrap();

    assert!(matches!(
        store.get("ns", "host"),
        Err(PinStoreError::Corrupt(_))
    ));
    assert!(check_pin(&store, "ns", "host", 5).is_err());

    fs::remove_dir_all(root).ok();
}

#[test]
fn empty_record_from_interrupted_write_is_repaired() {
    let root = temp_dir("torn");
    let store = FsPinStore::new(&root);
    let ns = namespace_for_seed("CLIENT_SECRET_SEED");
    let path = store.record_path(&ns, "127.0.0.1").unwrap();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"").unwrap();

    assert_eq!(store.get(&ns, "127.0.0.1").unwrap(), None);
    assert_eq!(
        check_pin(&store, &ns, "127.0.0.1", 99).unwrap(),
        PinStatus::FirstUse
    );
    assert_eq!(
        check_pin(&store, &ns, "127.0.0.1", 99).unwrap(),
        PinStatus::Match
    );
    assert_eq!(fs::read(&path).unwrap(), 99u64.to_le_bytes());

    fs::remove_dir_all(root).ok();
}

#[test]
fn writes_leave_only_complete_records() {
    let root = temp_dir("staged");
    let store = FsPinStore::new(&root);

    store.put_if_absent("ns", "a", 1).unwrap();
    store.put_if_absent("ns", "a", 2).unwrap();
    store.put_if_absent("ns", "b", 3).unwrap();

    let mut names: Vec<String> = fs::read_dir(root.join("ns"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.bin", "b.bin"]);

    fs::remove_dir_all(root).ok();
}

#[test]
fn concurrent_first_use_agrees_on_one_identity() {
    let root = temp_dir("race");
    let store = std::sync::Arc::new(FsPinStore::new(&root));

    let handles: Vec<_> = (1..=8u64)
        .map(|identity| {
            let store = store.clone();
            std::thread::spawn(move || store.put_if_absent("ns", "host", identity).unwrap())
        })
        .collect();
    let results: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let pinned = store.get("ns", "host").unwrap().unwrap();
    assert!(results.iter().all(|&r| r == pinned));

    fs::remove_dir_all(root).ok();
}

#[test]
fn empty_host_is_rejected() {
    let store = FsPinStore::new(temp_dir("invalid"));
    assert!(matches!(
        store.get("ns", ""),
        Err(PinStoreError::InvalidHost(_))
    ));
    fs::remove_dir_all(store.root()).ok();
}
