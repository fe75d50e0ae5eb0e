use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use roomledger::engine::Engine;
use roomledger::listener::{ChangeListener, Projection};
use roomledger::model::*;
use roomledger::store::{MemoryStore, RecordStore};

async fn wait_for(
    view: &mut tokio::sync::watch::Receiver<Arc<Projection>>,
    pred: impl Fn(&Projection) -> bool,
) -> Arc<Projection> {
    loop {
        {
            let current = view.borrow_and_update();
            if pred(&current) {
                return current.clone();
            }
        }
        view.changed().await.expect("listener stopped");
    }
}

#[tokio::test(start_paused = true)]
async fn observer_sees_another_desks_writes() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let desk = Engine::new("north", store.clone());
    let observer = Arc::new(Engine::new("north", store.clone()));

    let listener = ChangeListener::start(observer, Duration::from_millis(50)).await.unwrap();
    let mut view = listener.subscribe();

    let room = desk.create_room("101", 2).await.unwrap();
    let alice = desk.create_student("Alice", "S-1", Some(room.id)).await.unwrap();
    let p = wait_for(&mut view, |p| p.rooms.first().is_some_and(|r| r.occupancy == 1)).await;
    assert_eq!(p.students[0].room_number.as_deref(), Some("101"));

    desk.deallocate(alice.id).await.unwrap();
    let p = wait_for(&mut view, |p| p.rooms[0].occupancy == 0).await;
    assert_eq!(p.rooms[0].status, RoomStatus::Available);
    assert_eq!(p.students[0].room_id, None);
}

#[tokio::test(start_paused = true)]
async fn projection_shows_true_occupancy_even_when_cache_drifts() {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(Engine::new("north", store.clone()));
    let room = engine.create_room("101", 3).await.unwrap();

    let listener = ChangeListener::start(engine.clone(), Duration::from_millis(20)).await.unwrap();
    let mut view = listener.subscribe();

    // A student written behind the engine's back; the cache is never touched.
    store
        .create_student(NewStudent {
            id: Ulid::new(),
            hostel: "north".into(),
            name: "Quiet".into(),
            contact: "S-0".into(),
            room_id: Some(room.id),
        })
        .await
        .unwrap();

    let p = wait_for(&mut view, |p| p.generation >= 1).await;
    assert_eq!(p.rooms[0].occupancy, 1);
    assert_eq!(store.read_room(room.id).await.unwrap().occupancy, 0);
}

#[tokio::test(start_paused = true)]
async fn room_deletion_clears_it_from_view() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let engine = Arc::new(Engine::new("north", store));
    let keep = engine.create_room("101", 1).await.unwrap();
    let gone = engine.create_room("102", 1).await.unwrap();

    let listener = ChangeListener::start(engine.clone(), Duration::from_millis(20)).await.unwrap();
    let mut view = listener.subscribe();
    assert_eq!(listener.current().rooms.len(), 2);

    engine.delete_room(gone.id).await.unwrap();
    let p = wait_for(&mut view, |p| p.rooms.len() == 1).await;
    assert_eq!(p.rooms[0].room_id, keep.id);
}
