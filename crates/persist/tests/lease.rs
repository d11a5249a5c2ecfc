use std::sync::{Arc, Barrier};
use std::time::Duration;

use fleet_persist::{LeaseStore, SqliteStore, VersionSequencer};

fn shared_db(n: usize) -> (tempfile::TempDir, Vec<Arc<SqliteStore>>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.db");
    let path = path.to_str().unwrap().to_string();
    let stores = (0..n).map(|_| Arc::new(SqliteStore::open(&path).unwrap())).collect();
    (dir, stores)
}

#[test]
fn concurrent_claims_elect_exactly_one_leader() {
    let n = 8;
    let (_dir, stores) = shared_db(n);
    let barrier = Arc::new(Barrier::new(n));
    let handles: Vec<_> = stores
        .into_iter()
        .enumerate()
        .map(|(i, store)| {
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                store.claim("processor_type", &format!("instance-{i}"), Duration::from_secs(30)).unwrap()
            })
        })
        .collect();
    let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
    assert_eq!(winners, 1);
}

#[test]
fn release_hands_over_between_handles() {
    let (_dir, stores) = shared_db(2);
    let ttl = Duration::from_secs(30);
    assert!(stores[0].claim("connector_type", "a", ttl).unwrap());
    assert!(!stores[1].claim("connector_type", "b", ttl).unwrap());
    assert!(stores[0].release("connector_type", "a").unwrap());
    assert!(stores[1].claim("connector_type", "b", ttl).unwrap());
    assert_eq!(stores[0].current_lease("connector_type").unwrap().unwrap().leader, "b");
}

#[test]
fn expired_lease_is_taken_over() {
    let (_dir, stores) = shared_db(2);
    assert!(stores[0].claim("processor_type", "a", Duration::from_millis(20)).unwrap());
    std::thread::sleep(Duration::from_millis(40));
    assert!(!stores[0].renew("processor_type", "a", Duration::from_secs(30)).unwrap());
    assert!(stores[1].claim("processor_type", "b", Duration::from_secs(30)).unwrap());
}

#[test]
fn sequence_is_shared_across_handles() {
    let (_dir, stores) = shared_db(2);
    let a = stores[0].next_version("resources").unwrap();
    let b = stores[1].next_version("resources").unwrap();
    let c = stores[0].next_version("resources").unwrap();
    assert!(a < b && b < c);
}
