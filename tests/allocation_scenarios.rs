use std::path::PathBuf;
use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use roomledger::engine::{AllocError, Engine};
use roomledger::hostel::HostelManager;
use roomledger::model::*;
use roomledger::store::{MemoryStore, RecordStore};

// ── Test infrastructure ──────────────────────────────────────

fn journal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("roomledger_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

async fn assert_consistent(store: &dyn RecordStore, hostel: &str) {
    for room in store.list_rooms(hostel).await.unwrap() {
        let assigned = store.count_assigned(room.id).await.unwrap();
        assert!(assigned <= room.capacity, "room {} over capacity", room.number);
        assert_eq!(room.occupancy, assigned, "room {} cache drifted", room.number);
        assert_eq!(room.status, RoomStatus::for_occupancy(assigned, room.capacity));
    }
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn two_desks_share_one_hostel() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let front = Engine::new("north", store.clone());
    let back = Engine::new("north", store.clone());

    let room = assert_ok!(front.create_room("101", 2).await);
    let alice = assert_ok!(back.create_student("Alice", "S-1", Some(room.id)).await);
    let bob = assert_ok!(front.create_student("Bob", "S-2", None).await);

    // Each desk sees the other's writes immediately.
    let seated = assert_ok!(back.assign(bob.id, room.id).await);
    assert_eq!(seated.room.status, RoomStatus::Full);
    let view = front.room_occupancy_view().await.unwrap();
    assert_eq!(view[0].occupancy, 2);

    let carol = front.create_student("Carol", "S-3", None).await.unwrap();
    assert!(matches!(assert_err!(back.assign(carol.id, room.id).await), AllocError::RoomFull(_)));

    assert_ok!(front.deallocate(alice.id).await);
    assert_ok!(back.assign(carol.id, room.id).await);
    assert_consistent(&*store, "north").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_desks_never_overfill_rooms() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let setup = Engine::new("north", store.clone());
    let mut rooms = Vec::new();
    for (number, cap) in [("101", 1), ("102", 2), ("103", 3)] {
        rooms.push(setup.create_room(number, cap).await.unwrap().id);
    }
    let rooms = Arc::new(rooms);

    let mut handles = Vec::new();
    for desk in 0..8 {
        let store = store.clone();
        let rooms = rooms.clone();
        handles.push(tokio::spawn(async move {
            let engine = Engine::new("north", store);
            for i in 0..10 {
                let room = rooms[(desk + i) % rooms.len()];
                let _ = engine
                    .create_student(&format!("d{desk}-s{i}"), &format!("D{desk}-{i}"), Some(room))
                    .await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_consistent(&*store, "north").await;
    let summary = setup.summary().await.unwrap();
    assert_eq!(summary.students, 80);
    assert!(summary.total_occupancy <= 6);
    assert_eq!(summary.unassigned_students as u64, 80 - summary.total_occupancy);
}

#[tokio::test]
async fn journal_keeps_allocations_across_restart() {
    let path = journal_path("restart.journal");
    let (room_id, alice_id) = {
        let store = Arc::new(MemoryStore::open(&path, 1000).unwrap());
        let engine = Engine::new("north", store);
        let room = engine.create_room("101", 2).await.unwrap();
        let alice = engine.create_student("Alice", "S-1", Some(room.id)).await.unwrap();
        let bob = engine.create_student("Bob", "S-2", Some(room.id)).await.unwrap();
        engine.delete_student(bob.id).await.unwrap();
        (room.id, alice.id)
    };

    let store = Arc::new(MemoryStore::open(&path, 1000).unwrap());
    let engine = Engine::new("north", store.clone());
    let room = engine.get_room(room_id).await.unwrap();
    assert_eq!((room.occupancy, room.status), (1, RoomStatus::Available));
    assert_eq!(engine.get_student(alice_id).await.unwrap().room_id, Some(room_id));
    assert_eq!(engine.list_students().await.unwrap().len(), 1);
    assert!(engine.reconcile().await.unwrap().is_clean());
}

#[tokio::test]
async fn journal_compaction_preserves_state() {
    let path = journal_path("compact.journal");
    {
        let store = Arc::new(MemoryStore::open(&path, 8).unwrap());
        let engine = Engine::new("north", store);
        let room = engine.create_room("101", 4).await.unwrap();
        let s = engine.create_student("Alice", "S-1", None).await.unwrap();
        for _ in 0..20 {
            engine.assign(s.id, room.id).await.unwrap();
            engine.deallocate(s.id).await.unwrap();
        }
        engine.assign(s.id, room.id).await.unwrap();
    }

    let store = MemoryStore::open(&path, 8).unwrap();
    let rooms = store.list_rooms("north").await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].occupancy, 1);
    assert_consistent(&store, "north").await;
}

#[tokio::test]
async fn reconcile_after_out_of_band_writes() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new("north", store.clone());
    let room = engine.create_room("101", 1).await.unwrap();
    let first = engine.create_student("Alice", "S-1", Some(room.id)).await.unwrap();

    // Another writer bypasses the engine and overfills the room.
    let intruder = store
        .create_student(NewStudent {
            id: Ulid::new(),
            hostel: "north".into(),
            name: "Mallory".into(),
            contact: "S-666".into(),
            room_id: Some(room.id),
        })
        .await
        .unwrap();

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.evicted, vec![intruder.id]);
    assert_eq!(engine.get_student(first.id).await.unwrap().room_id, Some(room.id));
    assert_consistent(&*store, "north").await;
}

#[tokio::test]
async fn hostels_are_isolated_in_one_store() {
    let hm = HostelManager::new(Arc::new(MemoryStore::new()), None);
    let north = hm.get_or_create("north").unwrap();
    let south = hm.get_or_create("south").unwrap();

    let room = north.create_room("101", 1).await.unwrap();
    let sam = south.create_student("Sam", "S-1", None).await.unwrap();
    assert!(matches!(south.assign(sam.id, room.id).await, Err(AllocError::NotFound(_))));
    assert_eq!(north.summary().await.unwrap().students, 0);
    assert_eq!(south.summary().await.unwrap().rooms, 0);
}
