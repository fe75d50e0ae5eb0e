use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auditor;
use crate::engine::{AllocError, Engine};
use crate::limits::*;
use crate::store::RecordStore;

/// Manages per-hostel engines over one shared store. Each hostel gets its own
/// Engine and, when an audit interval is set, its own auditor task.
pub struct HostelManager {
    engines: DashMap<String, Arc<Engine>>,
    store: Arc<dyn RecordStore>,
    audit_interval: Option<Duration>,
    cancel: CancellationToken,
}

/// Keep alphanumerics, `_` and `-`.
pub fn sanitize_hostel_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl HostelManager {
    pub fn new(store: Arc<dyn RecordStore>, audit_interval: Option<Duration>) -> Self {
        Self {
            engines: DashMap::new(),
            store,
            audit_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Get or lazily create the engine for a hostel.
    pub fn get_or_create(&self, hostel: &str) -> Result<Arc<Engine>, AllocError> {
        if hostel.len() > MAX_HOSTEL_NAME_LEN {
            return Err(AllocError::LimitExceeded("hostel name too long"));
        }
        let name = sanitize_hostel_name(hostel);
        if name.is_empty() {
            return Err(AllocError::Validation("empty hostel name".into()));
        }
        if let Some(engine) = self.engines.get(&name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_HOSTELS {
            return Err(AllocError::LimitExceeded("too many hostels"));
        }

        let engine = self
            .engines
            .entry(name.clone())
            .or_insert_with(|| {
                let engine = Arc::new(Engine::new(name.clone(), self.store.clone()));
                if let Some(period) = self.audit_interval {
                    tokio::spawn(auditor::run_auditor(
                        engine.clone(),
                        period,
                        self.cancel.child_token(),
                    ));
                }
                info!("hostel {name} loaded");
                engine
            })
            .value()
            .clone();
        metrics::gauge!(crate::observability::HOSTELS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    pub fn hostels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stop every auditor. Engines stay usable.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HostelManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> HostelManager {
        HostelManager::new(Arc::new(MemoryStore::new()), None)
    }

    #[tokio::test]
    async fn hostel_isolation() {
        let hm = manager();
        let north = hm.get_or_create("north").unwrap();
        let south = hm.get_or_create("south").unwrap();

        north.create_room("101", 1).await.unwrap();
        south.create_room("101", 2).await.unwrap();

        assert_eq!(north.room_occupancy_view().await.unwrap()[0].capacity, 1);
        assert_eq!(south.room_occupancy_view().await.unwrap()[0].capacity, 2);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let hm = manager();
        let a = hm.get_or_create("north").unwrap();
        let b = hm.get_or_create("north").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(hm.hostels(), vec!["north".to_string()]);
    }

    #[tokio::test]
    async fn hostel_name_sanitized() {
        let hm = manager();
        let a = hm.get_or_create("../north").unwrap();
        assert_eq!(a.hostel(), "north");
        let b = hm.get_or_create("north").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        assert!(matches!(hm.get_or_create("../.."), Err(AllocError::Validation(_))));
    }

    #[tokio::test]
    async fn hostel_name_too_long() {
        let hm = manager();
        let long = "x".repeat(MAX_HOSTEL_NAME_LEN + 1);
        assert!(matches!(hm.get_or_create(&long), Err(AllocError::LimitExceeded(_))));

        let at_limit = "x".repeat(MAX_HOSTEL_NAME_LEN);
        assert_eq!(hm.get_or_create(&at_limit).unwrap().hostel(), at_limit);
    }

    #[tokio::test]
    async fn hostel_count_limit() {
        let hm = manager();
        for i in 0..MAX_HOSTELS {
            hm.get_or_create(&format!("h{i}")).unwrap();
        }
        assert!(matches!(hm.get_or_create("one_more"), Err(AllocError::LimitExceeded(_))));
        // Existing hostels are still served.
        assert!(hm.get_or_create("h0").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn auditors_stop_on_shutdown() {
        let hm = HostelManager::new(Arc::new(MemoryStore::new()), Some(Duration::from_secs(1)));
        let engine = hm.get_or_create("north").unwrap();
        hm.shutdown();
        tokio::time::sleep(Duration::from_secs(3)).await;
        // Auditor released its handle on the engine when it stopped.
        assert_eq!(Arc::strong_count(&engine), 2);
    }
}
