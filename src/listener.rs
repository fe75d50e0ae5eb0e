//! Change propagation: turns the store's per-hostel change feed into a
//! re-fetched, observable projection of rooms and students.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{AllocError, Engine};
use crate::model::*;
use crate::observability::{COALESCED_EVENTS_TOTAL, VIEW_REFRESH_TOTAL};

/// What observers see. Replaced wholesale on every refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub rooms: Vec<RoomOccupancy>,
    pub students: Vec<StudentView>,
    /// Bumped on every refresh; 0 is the initial fetch.
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Dirty {
    rooms: bool,
    students: bool,
}

impl Dirty {
    const ALL: Dirty = Dirty {
        rooms: true,
        students: true,
    };

    fn mark(&mut self, event: &ChangeEvent) {
        match (event.table, event.kind) {
            // Student rows show their room's number.
            (Table::Room, ChangeKind::Delete) => *self = Dirty::ALL,
            (Table::Room, _) => self.rooms = true,
            (Table::Student, _) => *self = Dirty::ALL,
        }
    }

    fn any(&self) -> bool {
        self.rooms || self.students
    }
}

pub struct ChangeListener {
    view: watch::Receiver<Arc<Projection>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChangeListener {
    /// Fetch the projection once, then keep it fresh in the background.
    /// Changes arriving within `window` of each other cause one re-fetch.
    pub async fn start(engine: Arc<Engine>, window: Duration) -> Result<Self, AllocError> {
        // Subscribe first so nothing between the fetch and the loop is lost.
        let changes = engine.subscribe_changes();
        let initial = Projection {
            rooms: engine.room_occupancy_view().await?,
            students: engine.list_students().await?,
            generation: 0,
        };
        let (tx, view) = watch::channel(Arc::new(initial));
        let cancel = CancellationToken::new();
        info!("change listener started for {}", engine.hostel());
        let task = tokio::spawn(listen(engine, changes, tx, window, cancel.clone()));
        Ok(Self {
            view,
            cancel,
            task: Some(task),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Projection>> {
        self.view.clone()
    }

    pub fn current(&self) -> Arc<Projection> {
        self.view.borrow().clone()
    }

    /// Stop listening and wait for the background task to finish.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Fold one receive result into the dirty set. Returns false once the feed closed.
fn absorb(dirty: &mut Dirty, received: Result<ChangeEvent, RecvError>, hostel: &str) -> bool {
    match received {
        Ok(event) => {
            dirty.mark(&event);
            true
        }
        Err(RecvError::Lagged(missed)) => {
            warn!("listener for {hostel} missed {missed} changes, refreshing everything");
            *dirty = Dirty::ALL;
            true
        }
        Err(RecvError::Closed) => false,
    }
}

async fn listen(
    engine: Arc<Engine>,
    mut changes: broadcast::Receiver<ChangeEvent>,
    tx: watch::Sender<Arc<Projection>>,
    window: Duration,
    cancel: CancellationToken,
) {
    let hostel = engine.hostel().to_string();
    let mut dirty = Dirty::default();
    let mut open = true;

    while open {
        // Idle until something changes. A failed refresh leaves `dirty` set
        // and goes straight to the window, which doubles as a retry delay.
        if !dirty.any() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = changes.recv() => {
                    open = absorb(&mut dirty, received, &hostel);
                }
            }
        }

        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        while open {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut deadline => break,
                received = changes.recv() => {
                    open = absorb(&mut dirty, received, &hostel);
                    metrics::counter!(COALESCED_EVENTS_TOTAL).increment(1);
                }
            }
        }
        if !dirty.any() {
            continue;
        }

        let previous = tx.borrow().clone();
        let rooms = if dirty.rooms {
            engine.room_occupancy_view().await
        } else {
            Ok(previous.rooms.clone())
        };
        let students = if dirty.students {
            engine.list_students().await
        } else {
            Ok(previous.students.clone())
        };
        match (rooms, students) {
            (Ok(rooms), Ok(students)) => {
                let generation = previous.generation + 1;
                tx.send_replace(Arc::new(Projection {
                    rooms,
                    students,
                    generation,
                }));
                metrics::counter!(VIEW_REFRESH_TOTAL).increment(1);
                debug!("projection for {hostel} refreshed (generation {generation})");
                dirty = Dirty::default();
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("projection refresh for {hostel} failed: {e}");
            }
        }
    }
    debug!("change listener for {hostel} stopped");
}
